//! I/O module: byte-range fetching, BGZF blocks and indexed BAM access

pub mod bam;
pub mod bgzf;
pub mod fetch;

pub use bam::{AlignmentContainer, AlignmentSink, IndexedBamReader, ReaderOptions};
pub use fetch::{ByteRange, LocalFetcher, MemoryFetcher, RangeFetcher, MMAP_THRESHOLD};

// HTTP range requests
#[cfg(feature = "network")]
pub mod network;
#[cfg(feature = "network")]
pub use network::HttpClient;
