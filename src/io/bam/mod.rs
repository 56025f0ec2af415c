//! Indexed BAM (Binary Alignment Map) access.
//!
//! This module decodes the pieces of a BAM file needed to answer region
//! queries without reading the whole file:
//!
//! - [`index`]: BAI parsing, bin math, chunk selection
//! - [`header`]: reference table from the BAM header
//! - [`record`]: alignment record decoding and region filtering
//! - [`cigar`], [`sequence`], [`tags`]: per-record field decoders
//! - [`container`]: destinations for query results
//! - [`reader`]: the query engine tying them together
//!
//! # Example
//!
//! ```no_run
//! use bamrange::io::bam::{IndexedBamReader, ReaderOptions};
//! use bamrange::LocalFetcher;
//!
//! # fn main() -> bamrange::Result<()> {
//! let options = ReaderOptions::default().with_merge_chunks(true);
//! let reader = IndexedBamReader::with_options(LocalFetcher::new(), "alignments.bam", options);
//!
//! println!("{} references", reader.reference_table()?.len());
//!
//! let alignments = reader.query("chr20", 100_000, 200_000)?;
//! for record in alignments.records() {
//!     for block in &record.blocks {
//!         println!("{} {}..{}", record.name, block.start, block.end());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cigar;
pub mod container;
pub mod error;
pub mod header;
pub mod index;
pub mod reader;
pub mod record;
pub mod sequence;
pub mod tags;

// Re-export main types for convenience
pub use cigar::{make_blocks, parse_cigar, AlignedBlock, CigarOp, GapType, Insertion};
pub use container::{AlignmentContainer, AlignmentSink};
pub use error::BamDecodeError;
pub use header::{NameNormalizer, Reference, ReferenceTable};
pub use index::{merge_chunks, BaiIndex, Chunk, VirtualOffset};
pub use reader::{IndexedBamReader, ReaderOptions};
pub use record::{decode_records, parse_record, Mate, Record, RegionFilter};
pub use sequence::decode_sequence;
pub use tags::{ArrayValue, Tag, TagValue, Tags};
