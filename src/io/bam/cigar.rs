//! CIGAR (Compact Idiosyncratic Gapped Alignment Report) parsing.
//!
//! CIGAR strings describe how a read aligns to the reference, including
//! matches, insertions, deletions, and other operations.
//!
//! # BAM Format
//!
//! In BAM, CIGAR is stored as 32-bit integers:
//! - Low 4 bits: operation type (0-8)
//! - High 28 bits: operation length (0 to 268,435,455)
//!
//! # Operations
//!
//! - M: Match/mismatch (alignment match, can include mismatches)
//! - I: Insertion to reference
//! - D: Deletion from reference
//! - N: Skipped region from reference (intron for RNA-seq)
//! - S: Soft clipping (bases present in read, not in alignment)
//! - H: Hard clipping (bases not present in read)
//! - P: Padding (silent deletion from padded reference)
//! - =: Sequence match (bases match reference)
//! - X: Sequence mismatch (bases don't match reference)
//!
//! # Blocks
//!
//! [`make_blocks`] splits an alignment into the ungapped segments drawn by a
//! viewer. Each [`AlignedBlock`] carries its slice of the read and the kind of
//! gap separating it from whatever precedes it; inserted bases are reported
//! separately as [`Insertion`]s.

use super::error::BamDecodeError;
use std::fmt;

/// CIGAR operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigarOp {
    /// Match or mismatch (M)
    Match(u32),
    /// Insertion to reference (I)
    Insertion(u32),
    /// Deletion from reference (D)
    Deletion(u32),
    /// Skipped region from reference (N)
    RefSkip(u32),
    /// Soft clipping (S)
    SoftClip(u32),
    /// Hard clipping (H)
    HardClip(u32),
    /// Padding (P)
    Padding(u32),
    /// Sequence match (=)
    SeqMatch(u32),
    /// Sequence mismatch (X)
    SeqMismatch(u32),
}

impl CigarOp {
    /// Decode one packed BAM CIGAR word (`length << 4 | op`).
    ///
    /// Op codes 9-15 are unassigned and rejected.
    pub fn from_bam(packed: u32) -> Result<Self, BamDecodeError> {
        let length = packed >> 4;
        Ok(match packed & 0x0F {
            0 => CigarOp::Match(length),
            1 => CigarOp::Insertion(length),
            2 => CigarOp::Deletion(length),
            3 => CigarOp::RefSkip(length),
            4 => CigarOp::SoftClip(length),
            5 => CigarOp::HardClip(length),
            6 => CigarOp::Padding(length),
            7 => CigarOp::SeqMatch(length),
            8 => CigarOp::SeqMismatch(length),
            value => return Err(BamDecodeError::InvalidCigarOp { value }),
        })
    }

    /// Number of bases covered by this operation.
    pub fn length(&self) -> u32 {
        match *self {
            CigarOp::Match(len)
            | CigarOp::Insertion(len)
            | CigarOp::Deletion(len)
            | CigarOp::RefSkip(len)
            | CigarOp::SoftClip(len)
            | CigarOp::HardClip(len)
            | CigarOp::Padding(len)
            | CigarOp::SeqMatch(len)
            | CigarOp::SeqMismatch(len) => len,
        }
    }

    /// SAM operation letter.
    pub fn as_char(&self) -> char {
        match self {
            CigarOp::Match(_) => 'M',
            CigarOp::Insertion(_) => 'I',
            CigarOp::Deletion(_) => 'D',
            CigarOp::RefSkip(_) => 'N',
            CigarOp::SoftClip(_) => 'S',
            CigarOp::HardClip(_) => 'H',
            CigarOp::Padding(_) => 'P',
            CigarOp::SeqMatch(_) => '=',
            CigarOp::SeqMismatch(_) => 'X',
        }
    }

    /// True for M, D, N, = and X.
    pub fn consumes_reference(&self) -> bool {
        matches!(
            self,
            CigarOp::Match(_)
                | CigarOp::Deletion(_)
                | CigarOp::RefSkip(_)
                | CigarOp::SeqMatch(_)
                | CigarOp::SeqMismatch(_)
        )
    }

    /// True for M, I, S, = and X.
    pub fn consumes_read(&self) -> bool {
        matches!(
            self,
            CigarOp::Match(_)
                | CigarOp::Insertion(_)
                | CigarOp::SoftClip(_)
                | CigarOp::SeqMatch(_)
                | CigarOp::SeqMismatch(_)
        )
    }
}

impl fmt::Display for CigarOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.length(), self.as_char())
    }
}

/// Parse `n_ops` packed CIGAR words.
///
/// # Example
///
/// ```
/// use bamrange::io::bam::{parse_cigar, CigarOp};
///
/// // 100M = 100 << 4 | 0 = 1600 = 0x00000640 (little-endian)
/// let data = vec![0x40, 0x06, 0x00, 0x00];
/// let cigar = parse_cigar(&data, 1).unwrap();
/// assert_eq!(cigar, vec![CigarOp::Match(100)]);
/// ```
pub fn parse_cigar(data: &[u8], n_ops: usize) -> Result<Vec<CigarOp>, BamDecodeError> {
    let required = n_ops * 4;
    if data.len() < required {
        return Err(BamDecodeError::UnexpectedEof {
            context: "CIGAR",
            expected: required,
            actual: data.len(),
        });
    }

    data[..required]
        .chunks_exact(4)
        .map(|word| CigarOp::from_bam(u32::from_le_bytes([word[0], word[1], word[2], word[3]])))
        .collect()
}

/// Reference span of an alignment: the sum of M, =, X, D and N lengths.
///
/// Each operation holds up to 28 bits, so a long CIGAR can exceed `u32`;
/// that is reported as [`BamDecodeError::ReferenceLengthOverflow`].
pub fn reference_length(cigar: &[CigarOp]) -> Result<u32, BamDecodeError> {
    let length: u64 = cigar
        .iter()
        .filter(|op| op.consumes_reference())
        .map(|op| u64::from(op.length()))
        .sum();
    u32::try_from(length).map_err(|_| BamDecodeError::ReferenceLengthOverflow { length })
}

/// SAM text form, `"*"` when empty.
pub fn cigar_to_string(cigar: &[CigarOp]) -> String {
    if cigar.is_empty() {
        return "*".to_string();
    }
    cigar.iter().map(ToString::to_string).collect()
}

/// What separates an aligned block from the read or block before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GapType {
    /// Directly adjacent, or separated only by an insertion
    #[default]
    None,
    /// Preceded by soft-clipped bases
    SoftClip,
    /// Preceded by a deletion (D)
    Deletion,
    /// Preceded by a reference skip (N), e.g. an intron
    Skip,
}

/// An ungapped stretch of the read aligned to the reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedBlock {
    /// 0-based reference start
    pub start: i64,
    /// Length in bases (on both read and reference)
    pub len: u32,
    /// Offset of the block's first base within the read
    pub read_offset: usize,
    /// Bases of the read covered by this block (empty when the read has none)
    pub seq: Vec<u8>,
    /// Qualities for `seq`, absent when the record has none
    pub qual: Option<Vec<u8>>,
    /// Gap kind between the previous block and this one
    pub gap: GapType,
}

impl AlignedBlock {
    /// Exclusive reference end.
    pub fn end(&self) -> i64 {
        self.start + i64::from(self.len)
    }
}

/// Read bases absent from the reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    /// Reference position the bases are inserted before
    pub start: i64,
    /// Number of inserted bases
    pub len: u32,
    /// Offset of the first inserted base within the read
    pub read_offset: usize,
    /// Inserted bases (empty when the read has none)
    pub seq: Vec<u8>,
    /// Qualities for `seq`, absent when the record has none
    pub qual: Option<Vec<u8>>,
}

/// Split an alignment into aligned blocks and insertions.
///
/// Walks the CIGAR with a reference cursor starting at `start` and a read
/// cursor starting at 0:
/// - H and P move neither cursor
/// - S moves the read cursor and marks the next block [`GapType::SoftClip`]
/// - D and N move the reference cursor and mark the next block
///   [`GapType::Deletion`] or [`GapType::Skip`]
/// - I emits an [`Insertion`] at the reference cursor and moves the read cursor
/// - M, = and X emit an [`AlignedBlock`] and move both cursors
///
/// The gap marker is consumed by the block that follows it. Sequence and
/// quality slices are clamped to the read, so a record without bases yields
/// blocks with empty `seq`.
///
/// # Example
///
/// ```
/// use bamrange::io::bam::{make_blocks, CigarOp, GapType};
///
/// let cigar = [CigarOp::Match(4), CigarOp::Deletion(2), CigarOp::Match(4)];
/// let (blocks, insertions) = make_blocks(100, &cigar, b"ACGTACGT", None);
///
/// assert_eq!(blocks.len(), 2);
/// assert_eq!(blocks[1].start, 106);
/// assert_eq!(blocks[1].gap, GapType::Deletion);
/// assert!(insertions.is_empty());
/// ```
pub fn make_blocks(
    start: i64,
    cigar: &[CigarOp],
    sequence: &[u8],
    quality: Option<&[u8]>,
) -> (Vec<AlignedBlock>, Vec<Insertion>) {
    let mut blocks = Vec::new();
    let mut insertions = Vec::new();
    let mut ref_pos = start;
    let mut read_pos = 0usize;
    let mut gap = GapType::None;

    for op in cigar {
        let len = op.length();
        match op {
            CigarOp::HardClip(_) | CigarOp::Padding(_) => {}
            CigarOp::SoftClip(_) => {
                read_pos += len as usize;
                gap = GapType::SoftClip;
            }
            CigarOp::RefSkip(_) => {
                ref_pos += i64::from(len);
                gap = GapType::Skip;
            }
            CigarOp::Deletion(_) => {
                ref_pos += i64::from(len);
                gap = GapType::Deletion;
            }
            CigarOp::Insertion(_) => {
                insertions.push(Insertion {
                    start: ref_pos,
                    len,
                    read_offset: read_pos,
                    seq: clamped(sequence, read_pos, len).to_vec(),
                    qual: quality.map(|q| clamped(q, read_pos, len).to_vec()),
                });
                read_pos += len as usize;
            }
            CigarOp::Match(_) | CigarOp::SeqMatch(_) | CigarOp::SeqMismatch(_) => {
                blocks.push(AlignedBlock {
                    start: ref_pos,
                    len,
                    read_offset: read_pos,
                    seq: clamped(sequence, read_pos, len).to_vec(),
                    qual: quality.map(|q| clamped(q, read_pos, len).to_vec()),
                    gap: std::mem::take(&mut gap),
                });
                read_pos += len as usize;
                ref_pos += i64::from(len);
            }
        }
    }

    (blocks, insertions)
}

fn clamped(data: &[u8], offset: usize, len: u32) -> &[u8] {
    let begin = offset.min(data.len());
    let end = offset.saturating_add(len as usize).min(data.len());
    &data[begin..end]
}
