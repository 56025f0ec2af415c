//! BAI (BAM index) parsing and chunk selection.
//!
//! A BAI file maps genomic intervals to byte ranges of the BGZF-compressed BAM
//! stream, so a region query only fetches and inflates the blocks that can hold
//! overlapping records.
//!
//! # Format
//!
//! ```text
//! magic[4]       "BAI\1"
//! n_ref[4]       Number of reference sequences (int32)
//! For each reference:
//!   n_bin[4]     Number of bins (int32)
//!   For each bin:
//!     bin[4]     Bin number (uint32)
//!     n_chunk[4] Number of chunks (int32)
//!     For each chunk:
//!       chunk_beg[8]  Virtual offset (uint64)
//!       chunk_end[8]  Virtual offset (uint64)
//!   n_intv[4]    Number of 16 Kbp linear index intervals (int32)
//!   ioffset[8]   Virtual offset per interval (uint64)
//! n_no_coor[8]   Unplaced unmapped reads (uint64, optional)
//! ```
//!
//! # Binning Scheme
//!
//! 37,449 bins over six levels cover 512 Mbp:
//! - Level 0: bin 0 (entire sequence)
//! - Level 1: bins 1-8 (64 Mbp each)
//! - Level 2: bins 9-72 (8 Mbp each)
//! - Level 3: bins 73-584 (1 Mbp each)
//! - Level 4: bins 585-4680 (128 Kbp each)
//! - Level 5: bins 4681-37448 (16 Kbp each)
//!
//! Bin 37450 is a pseudo-bin holding per-reference metadata rather than chunks.

use crate::error::{BamError, Result};
use flate2::read::MultiGzDecoder;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

const BAI_MAGIC: &[u8; 4] = b"BAI\x01";

/// Bin number of the metadata pseudo-bin.
pub const METADATA_BIN: u32 = 37450;

/// Largest coordinate addressable by the binning scheme (2^29).
pub const MAX_POSITION: u32 = 1 << 29;

/// Width of one linear index window (16 Kbp).
const LINEAR_WINDOW_SHIFT: u32 = 14;

/// A BGZF virtual file offset.
///
/// - Bits 63-16: file offset of the compressed block start
/// - Bits 15-0: offset within the block's inflated bytes
///
/// Ordering is lexicographic by block start, then inner offset.
///
/// # Example
///
/// ```
/// # use bamrange::io::bam::VirtualOffset;
/// let offset = VirtualOffset::new(1024, 512);
/// assert_eq!(offset.compressed_offset(), 1024);
/// assert_eq!(offset.uncompressed_offset(), 512);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    /// Create a virtual offset from a block start and an in-block offset.
    pub fn new(compressed: u64, uncompressed: u16) -> Self {
        VirtualOffset((compressed << 16) | u64::from(uncompressed))
    }

    /// Create from the raw 64-bit value stored in index files.
    pub fn from_raw(value: u64) -> Self {
        VirtualOffset(value)
    }

    /// Raw 64-bit value.
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// File offset of the compressed block (high 48 bits).
    pub fn compressed_offset(self) -> u64 {
        self.0 >> 16
    }

    /// Offset within the inflated block (low 16 bits).
    pub fn uncompressed_offset(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

/// A compressed byte range bounded by two virtual offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    /// First byte that may hold a record of interest
    pub start: VirtualOffset,
    /// End of the last record of interest (exclusive)
    pub end: VirtualOffset,
}

impl Chunk {
    /// Create a new chunk.
    pub fn new(start: VirtualOffset, end: VirtualOffset) -> Self {
        Chunk { start, end }
    }
}

/// Contents of the metadata pseudo-bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceMetadata {
    /// Virtual offset of the first record on this reference
    pub ref_beg: VirtualOffset,
    /// Virtual offset just past the last record on this reference
    pub ref_end: VirtualOffset,
    /// Number of mapped reads
    pub n_mapped: u64,
    /// Number of placed but unmapped reads
    pub n_unmapped: u64,
}

/// Index data for one reference sequence.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    /// Chunks keyed by bin number
    pub bins: HashMap<u32, Vec<Chunk>>,
    /// Linear index: smallest record offset per 16 Kbp window
    pub intervals: Vec<VirtualOffset>,
    /// Metadata pseudo-bin, when present
    pub metadata: Option<ReferenceMetadata>,
}

impl ReferenceIndex {
    /// Linear-index floor for records overlapping position `start`.
    ///
    /// No overlapping record can begin before this offset, so any chunk that
    /// ends before it can be dropped. Positions past the last window use the
    /// last entry.
    pub fn min_offset(&self, start: u32) -> Option<VirtualOffset> {
        let window = (start >> LINEAR_WINDOW_SHIFT) as usize;
        self.intervals
            .get(window)
            .or_else(|| self.intervals.last())
            .copied()
    }

    fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.bins.values().flatten()
    }
}

/// Parsed BAI index.
///
/// # Example
///
/// ```no_run
/// use bamrange::io::bam::BaiIndex;
///
/// # fn main() -> bamrange::Result<()> {
/// let index = BaiIndex::from_path("alignments.bam.bai")?;
/// let chunks = index.blocks_for_range(0, 1_000_000, 2_000_000);
/// println!("{} chunks to fetch", chunks.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct BaiIndex {
    /// Index data for each reference sequence, in header order
    pub references: Vec<ReferenceIndex>,
    /// Number of unplaced unmapped reads, if recorded
    pub n_no_coor: Option<u64>,
}

impl BaiIndex {
    /// Load a BAI index from a file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Parse a BAI index from its bytes.
    ///
    /// Gzip-wrapped indexes are inflated first.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.starts_with(&[0x1f, 0x8b]) {
            let mut inflated = Vec::new();
            MultiGzDecoder::new(data)
                .read_to_end(&mut inflated)
                .map_err(|e| BamError::format("BAI index", format!("failed to inflate: {}", e)))?;
            return Self::read(&mut inflated.as_slice());
        }
        Self::read(&mut &data[..])
    }

    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_exact(reader, &mut magic, "magic")?;
        if &magic != BAI_MAGIC {
            return Err(BamError::format(
                "BAI index",
                format!("invalid magic bytes: expected 'BAI\\x01', got {:?}", magic),
            ));
        }

        let n_ref = read_count(reader, "reference count")?;
        let mut references = Vec::with_capacity(n_ref.min(1 << 16));
        for _ in 0..n_ref {
            references.push(Self::read_reference_index(reader)?);
        }

        // Optional trailer
        let mut buf = [0u8; 8];
        let n_no_coor = match reader.read_exact(&mut buf) {
            Ok(()) => Some(u64::from_le_bytes(buf)),
            Err(_) => None,
        };

        Ok(BaiIndex {
            references,
            n_no_coor,
        })
    }

    fn read_reference_index<R: Read>(reader: &mut R) -> Result<ReferenceIndex> {
        let n_bin = read_count(reader, "bin count")?;
        let mut index = ReferenceIndex::default();

        for _ in 0..n_bin {
            let bin_id = read_u32(reader, "bin number")?;
            let n_chunk = read_count(reader, "chunk count")?;

            let mut chunks = Vec::with_capacity(n_chunk.min(1 << 16));
            for _ in 0..n_chunk {
                let beg = read_u64(reader, "chunk start")?;
                let end = read_u64(reader, "chunk end")?;
                chunks.push((beg, end));
            }

            if bin_id == METADATA_BIN {
                if chunks.len() != 2 {
                    return Err(BamError::format(
                        "BAI index",
                        format!("metadata bin has {} chunks (expected 2)", chunks.len()),
                    ));
                }
                index.metadata = Some(ReferenceMetadata {
                    ref_beg: VirtualOffset::from_raw(chunks[0].0),
                    ref_end: VirtualOffset::from_raw(chunks[0].1),
                    n_mapped: chunks[1].0,
                    n_unmapped: chunks[1].1,
                });
                continue;
            }

            if let Some(&(beg, end)) = chunks.iter().find(|(beg, end)| beg > end) {
                return Err(BamError::format(
                    "BAI index",
                    format!(
                        "bin {} has a chunk ending before it starts ({:#x} > {:#x})",
                        bin_id, beg, end
                    ),
                ));
            }

            index.bins.entry(bin_id).or_default().extend(
                chunks
                    .into_iter()
                    .map(|(b, e)| Chunk::new(VirtualOffset::from_raw(b), VirtualOffset::from_raw(e))),
            );
        }

        let n_intv = read_count(reader, "interval count")?;
        index.intervals.reserve(n_intv.min(1 << 20));
        for _ in 0..n_intv {
            index
                .intervals
                .push(VirtualOffset::from_raw(read_u64(reader, "linear index offset")?));
        }

        Ok(index)
    }

    /// Number of references covered by the index.
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    /// Index data for one reference.
    pub fn reference(&self, reference_id: usize) -> Option<&ReferenceIndex> {
        self.references.get(reference_id)
    }

    /// Chunks that may hold records overlapping `[start, end)` on a reference.
    ///
    /// Unions the chunks of every bin overlapping the interval, then drops the
    /// chunks that end before the linear-index floor for `start`. The result
    /// is not sorted and may contain overlapping chunks; see [`merge_chunks`].
    /// A reference with no data yields an empty list.
    pub fn blocks_for_range(&self, reference_id: usize, start: u32, end: u32) -> Vec<Chunk> {
        let Some(reference) = self.references.get(reference_id) else {
            return Vec::new();
        };

        let mut chunks: Vec<Chunk> = region_to_bins(start, end)
            .into_iter()
            .filter_map(|bin| reference.bins.get(&bin))
            .flatten()
            .copied()
            .collect();

        if let Some(floor) = reference.min_offset(start) {
            chunks.retain(|chunk| chunk.end >= floor);
        }

        chunks
    }

    /// Start of the first compressed block holding alignment records.
    ///
    /// The BAM header ends at or before this block.
    pub fn first_alignment_block(&self) -> Option<u64> {
        self.references
            .iter()
            .flat_map(ReferenceIndex::chunks)
            .map(|chunk| chunk.start.compressed_offset())
            .min()
    }

    /// Start of the last compressed block referenced by any chunk.
    pub fn block_max(&self) -> Option<u64> {
        self.references
            .iter()
            .flat_map(ReferenceIndex::chunks)
            .map(|chunk| chunk.end.compressed_offset())
            .max()
    }
}

/// Bins overlapping the 0-based half-open interval `[start, end)`.
///
/// Coordinates beyond [`MAX_POSITION`] are clamped; an empty interval is
/// treated as the single position `start`.
pub fn region_to_bins(start: u32, end: u32) -> Vec<u32> {
    let start = start.min(MAX_POSITION - 1);
    let end = end.clamp(start + 1, MAX_POSITION) - 1; // inclusive

    let mut bins = vec![0];
    for shift in [26u32, 23, 20, 17, 14] {
        let offset = ((1u32 << (29 - shift)) - 1) / 7;
        bins.extend((offset + (start >> shift))..=(offset + (end >> shift)));
    }
    bins
}

/// Bin of the smallest level fully containing `[start, end)`.
pub fn region_to_bin(start: u32, end: u32) -> u32 {
    let end = end.max(start + 1) - 1;
    for shift in [14u32, 17, 20, 23, 26] {
        if start >> shift == end >> shift {
            return ((1u32 << (29 - shift)) - 1) / 7 + (start >> shift);
        }
    }
    0
}

/// Sort chunks and coalesce the ones that overlap or touch.
///
/// Chunks from different bins frequently overlap; fetching them separately
/// would decode the same records twice.
pub fn merge_chunks(mut chunks: Vec<Chunk>) -> Vec<Chunk> {
    if chunks.is_empty() {
        return chunks;
    }

    chunks.sort_by_key(|c| (c.start, c.end));

    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match merged.last_mut() {
            Some(current) if chunk.start <= current.end => {
                current.end = current.end.max(chunk.end);
            }
            _ => merged.push(chunk),
        }
    }

    merged
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], field: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            BamError::format("BAI index", format!("truncated while reading {}", field))
        }
        _ => BamError::Io(e),
    })
}

fn read_u32<R: Read>(reader: &mut R, field: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, field)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R, field: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf, field)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_count<R: Read>(reader: &mut R, field: &str) -> Result<usize> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, field)?;
    let value = i32::from_le_bytes(buf);
    usize::try_from(value)
        .map_err(|_| BamError::format("BAI index", format!("invalid {}: {}", field, value)))
}
