//! bamrange: indexed random-access reads from BAM alignment files
//!
//! # Overview
//!
//! bamrange answers "which alignments overlap `chr:[start, end)`?" against a
//! BGZF-compressed BAM file and its BAI index, fetching only the byte ranges
//! the index points at. Sources are pluggable through [`RangeFetcher`]: local
//! files, in-memory buffers, or HTTP range requests (feature `network`).
//!
//! ## Quick Start
//!
//! ```no_run
//! use bamrange::{IndexedBamReader, LocalFetcher};
//!
//! # fn main() -> bamrange::Result<()> {
//! let reader = IndexedBamReader::new(LocalFetcher::new(), "sample.bam");
//!
//! let alignments = reader.query("chr1", 10_000, 20_000)?;
//! println!("{} alignments", alignments.len());
//! for record in alignments.records() {
//!     println!("{}\t{}\t{}", record.name, record.start, record.cigar_string());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Header and index are loaded once per reader and shared across queries and
//! threads; the chunks of one query are fetched and decoded in parallel.
//!
//! ## Module Organization
//!
//! - [`io::bgzf`]: BGZF block framing and inflation
//! - [`io::bam`]: BAI index, header, record decoding, query engine
//! - [`io::fetch`]: byte-range fetchers
//! - [`error`]: error types

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod io;

// Re-export commonly used types
pub use error::{BamError, Result};
pub use io::bam::{AlignmentContainer, AlignmentSink, IndexedBamReader, ReaderOptions, Record};
pub use io::fetch::{ByteRange, LocalFetcher, MemoryFetcher, RangeFetcher};

#[cfg(feature = "network")]
pub use io::network::HttpClient;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
