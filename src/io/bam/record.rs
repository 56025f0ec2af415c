//! BAM record structure and decoding.
//!
//! A BAM record represents a single alignment (read mapped to reference).
//! Each record contains alignment information, sequence data, quality scores,
//! and optional tags.
//!
//! # Binary Format
//!
//! ```text
//! BAM Record (binary, little-endian):
//! - block_size (int32): Total record size in bytes (excluding this field)
//! - refID (int32): Reference sequence ID (-1 for unmapped)
//! - pos (int32): 0-based leftmost position (-1 for unmapped)
//! - l_read_name (uint8): Length of read name (includes null terminator)
//! - mapq (uint8): Mapping quality (255 = unavailable)
//! - bin (uint16): BAI index bin (for indexing)
//! - n_cigar_op (uint16): Number of CIGAR operations
//! - flag (uint16): Bitwise FLAGS
//! - l_seq (int32): Sequence length
//! - next_refID (int32): Reference ID of mate/next read
//! - next_pos (int32): Position of mate/next read
//! - tlen (int32): Template length
//! - read_name (char[l_read_name]): Null-terminated read name
//! - cigar (uint32[n_cigar_op]): CIGAR operations
//! - seq (uint8[(l_seq+1)/2]): 4-bit encoded sequence
//! - qual (char[l_seq]): Phred quality scores
//! - tags: Optional tags (variable length)
//! ```
//!
//! # Scanning
//!
//! [`decode_records`] walks a run of records and keeps the ones overlapping a
//! region. It relies on the stream being sorted by (reference id, position):
//! the first record past the region ends the scan. Unsorted input therefore
//! yields an incomplete result, never a wrong one.

use super::cigar::{cigar_to_string, make_blocks, parse_cigar, reference_length, AlignedBlock, CigarOp, Insertion};
use super::error::BamDecodeError;
use super::header::ReferenceTable;
use super::sequence::decode_sequence;
use super::tags::{ArrayValue, TagValue, Tags};

/// Size of the fixed record fields following `block_size`.
const FIXED_FIELDS_SIZE: usize = 32;

const FLAG_PAIRED: u16 = 0x1;
const FLAG_PROPER_PAIR: u16 = 0x2;
const FLAG_UNMAPPED: u16 = 0x4;
const FLAG_REVERSE: u16 = 0x10;
const FLAG_MATE_REVERSE: u16 = 0x20;
const FLAG_FIRST_OF_PAIR: u16 = 0x40;
const FLAG_SECOND_OF_PAIR: u16 = 0x80;
const FLAG_SECONDARY: u16 = 0x100;
const FLAG_QC_FAIL: u16 = 0x200;
const FLAG_DUPLICATE: u16 = 0x400;
const FLAG_SUPPLEMENTARY: u16 = 0x800;

/// Borrow `n` bytes at the cursor and advance it.
pub(crate) fn take<'a>(
    data: &'a [u8],
    cursor: &mut usize,
    n: usize,
    context: &'static str,
) -> Result<&'a [u8], BamDecodeError> {
    let available = data.len().saturating_sub(*cursor);
    if n > available {
        return Err(BamDecodeError::UnexpectedEof {
            context,
            expected: n,
            actual: available,
        });
    }
    let slice = &data[*cursor..*cursor + n];
    *cursor += n;
    Ok(slice)
}

pub(crate) fn read_i32_le(
    data: &[u8],
    cursor: &mut usize,
    context: &'static str,
) -> Result<i32, BamDecodeError> {
    let bytes = take(data, cursor, 4, context)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u16_le(data: &[u8], cursor: &mut usize, context: &'static str) -> Result<u16, BamDecodeError> {
    let bytes = take(data, cursor, 2, context)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u8(data: &[u8], cursor: &mut usize, context: &'static str) -> Result<u8, BamDecodeError> {
    Ok(take(data, cursor, 1, context)?[0])
}

/// Validate a reference ID: -1 means none, anything below is invalid.
fn parse_reference_id(ref_id: i32, field: &'static str) -> Result<Option<usize>, BamDecodeError> {
    match ref_id {
        -1 => Ok(None),
        n if n >= 0 => Ok(Some(n as usize)),
        value => Err(BamDecodeError::InvalidReferenceId { value, field }),
    }
}

/// Mate (next segment) of a paired read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mate {
    /// Mate reference id
    pub reference_id: usize,
    /// Mate reference name, when the reference table knows the id
    pub reference_name: Option<String>,
    /// Mate 0-based position
    pub position: i32,
    /// True when the mate is on the forward strand
    pub strand: bool,
}

/// BAM alignment record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Read name/query name
    pub name: String,

    /// Reference sequence ID, None if unplaced (refID = -1)
    pub reference_id: Option<usize>,

    /// 0-based leftmost mapping position
    pub start: i64,

    /// Bases covered on the reference (M, =, X, D and N operations)
    pub length_on_ref: u32,

    /// Mapping quality, None if unavailable (mapq = 255)
    pub mapq: Option<u8>,

    /// Bitwise FLAGS
    pub flags: u16,

    /// Sequence bases (ASCII: A, C, G, T, N, etc.)
    pub sequence: Vec<u8>,

    /// Phred quality scores, None when the record stores none
    pub quality: Option<Vec<u8>>,

    /// Mate descriptor, present when the mate is placed
    pub mate: Option<Mate>,

    /// Template length (TLEN)
    pub fragment_length: i32,

    /// CIGAR operations
    pub cigar: Vec<CigarOp>,

    /// Optional tags, undecoded
    pub tags: Tags,

    /// Aligned blocks in reference order
    pub blocks: Vec<AlignedBlock>,

    /// Inserted bases
    pub insertions: Vec<Insertion>,
}

impl Record {
    /// Exclusive reference end (`start + length_on_ref`).
    pub fn end(&self) -> i64 {
        self.start + i64::from(self.length_on_ref)
    }

    /// True if the read maps to the forward strand.
    pub fn strand(&self) -> bool {
        self.flags & FLAG_REVERSE == 0
    }

    /// True if the mate maps to the forward strand.
    pub fn mate_strand(&self) -> bool {
        self.flags & FLAG_MATE_REVERSE == 0
    }

    /// Check if the read is paired.
    pub fn is_paired(&self) -> bool {
        self.flags & FLAG_PAIRED != 0
    }

    /// Check if both segments are properly aligned.
    pub fn is_proper_pair(&self) -> bool {
        self.flags & FLAG_PROPER_PAIR != 0
    }

    /// Check if the read is unmapped.
    pub fn is_unmapped(&self) -> bool {
        self.flags & FLAG_UNMAPPED != 0
    }

    /// First segment of the template.
    pub fn is_first_of_pair(&self) -> bool {
        self.flags & FLAG_FIRST_OF_PAIR != 0
    }

    /// Last segment of the template.
    pub fn is_second_of_pair(&self) -> bool {
        self.flags & FLAG_SECOND_OF_PAIR != 0
    }

    /// Secondary alignment.
    pub fn is_secondary(&self) -> bool {
        self.flags & FLAG_SECONDARY != 0
    }

    /// Supplementary alignment.
    pub fn is_supplementary(&self) -> bool {
        self.flags & FLAG_SUPPLEMENTARY != 0
    }

    /// PCR or optical duplicate.
    pub fn is_duplicate(&self) -> bool {
        self.flags & FLAG_DUPLICATE != 0
    }

    /// Not passing quality controls.
    pub fn fails_qc(&self) -> bool {
        self.flags & FLAG_QC_FAIL != 0
    }

    /// CIGAR in SAM text form.
    pub fn cigar_string(&self) -> String {
        cigar_to_string(&self.cigar)
    }
}

/// Replace a long-read placeholder CIGAR with the real one from `CG:B,I`.
///
/// BAM stores at most 65,535 CIGAR operations. Longer alignments store `kSmN`
/// (k = sequence length) and move the real CIGAR to the CG tag.
fn resolve_oversized_cigar(
    cigar: Vec<CigarOp>,
    sequence_length: usize,
    tags: &Tags,
) -> Result<Vec<CigarOp>, BamDecodeError> {
    let is_placeholder = matches!(
        cigar.as_slice(),
        [CigarOp::SoftClip(len), CigarOp::RefSkip(_)] if *len as usize == sequence_length
    );
    if !is_placeholder {
        return Ok(cigar);
    }

    match tags.get(b"CG")? {
        Some(TagValue::Array(ArrayValue::UInt32(packed))) => {
            packed.into_iter().map(CigarOp::from_bam).collect()
        }
        Some(TagValue::Array(ArrayValue::Int32(packed))) => {
            packed.into_iter().map(|p| CigarOp::from_bam(p as u32)).collect()
        }
        _ => Ok(cigar),
    }
}

/// Decode one record.
///
/// `data` holds the complete record including its `block_size` prefix.
/// Mate names are resolved through `references` when given.
pub fn parse_record(
    data: &[u8],
    references: Option<&ReferenceTable>,
) -> Result<Record, BamDecodeError> {
    let mut cursor = 0;

    let block_size = read_i32_le(data, &mut cursor, "block size")?;
    if block_size < FIXED_FIELDS_SIZE as i32 {
        return Err(BamDecodeError::InvalidBlockSize {
            size: block_size,
            offset: 0,
        });
    }

    let ref_id = read_i32_le(data, &mut cursor, "reference id")?;
    let pos = read_i32_le(data, &mut cursor, "position")?;

    let l_read_name = read_u8(data, &mut cursor, "read name length")?;
    // Must hold at least the NUL terminator
    if l_read_name == 0 {
        return Err(BamDecodeError::InvalidReadNameLength {
            length: l_read_name,
            offset: cursor - 1,
        });
    }

    let mapq = read_u8(data, &mut cursor, "mapping quality")?;
    let _bin = read_u16_le(data, &mut cursor, "bin")?;
    let n_cigar_op = read_u16_le(data, &mut cursor, "CIGAR count")? as usize;
    let flags = read_u16_le(data, &mut cursor, "flags")?;

    let l_seq = read_i32_le(data, &mut cursor, "sequence length")?;
    let l_seq = usize::try_from(l_seq).map_err(|_| BamDecodeError::NegativeLength {
        field: "sequence length",
        length: l_seq,
    })?;

    let next_ref_id = read_i32_le(data, &mut cursor, "mate reference id")?;
    let next_pos = read_i32_le(data, &mut cursor, "mate position")?;
    let tlen = read_i32_le(data, &mut cursor, "template length")?;

    let name_offset = cursor;
    let name_bytes = take(data, &mut cursor, l_read_name as usize, "read name")?;
    let Some((&0, name_bytes)) = name_bytes.split_last() else {
        return Err(BamDecodeError::MissingNulTerminator {
            field: "read name",
            offset: name_offset,
        });
    };
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| BamDecodeError::InvalidUtf8 {
            field: "read name",
            offset: name_offset,
        })?
        .to_string();

    let cigar_bytes = take(data, &mut cursor, n_cigar_op * 4, "CIGAR")?;
    let cigar = parse_cigar(cigar_bytes, n_cigar_op)?;

    let seq_bytes = take(data, &mut cursor, l_seq.div_ceil(2), "sequence")?;
    let sequence = decode_sequence(seq_bytes, l_seq)?;

    // 0xFF throughout means no qualities were stored
    let quality_bytes = take(data, &mut cursor, l_seq, "quality scores")?;
    let quality = if quality_bytes.iter().all(|&b| b == 0xFF) {
        None
    } else {
        Some(quality_bytes.to_vec())
    };

    let tags = Tags::from_raw(data[cursor..].to_vec());
    let cigar = resolve_oversized_cigar(cigar, l_seq, &tags)?;

    let reference_id = parse_reference_id(ref_id, "read")?;
    let mate = parse_reference_id(next_ref_id, "mate")?.map(|id| Mate {
        reference_id: id,
        reference_name: references
            .and_then(|r| r.reference_name(id))
            .map(str::to_string),
        position: next_pos,
        strand: flags & FLAG_MATE_REVERSE == 0,
    });

    let length_on_ref = reference_length(&cigar)?;
    let start = i64::from(pos);
    let (blocks, insertions) = make_blocks(start, &cigar, &sequence, quality.as_deref());

    Ok(Record {
        name,
        reference_id,
        start,
        length_on_ref,
        mapq: if mapq == 255 { None } else { Some(mapq) },
        flags,
        sequence,
        quality,
        mate,
        fragment_length: tlen,
        cigar,
        tags,
        blocks,
        insertions,
    })
}

/// Target of a region scan: a reference id and a 0-based interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionFilter {
    /// Reference the records must lie on
    pub reference_id: usize,
    /// Records ending before this position are dropped
    pub start: u32,
    /// Records starting after this position end the scan
    pub end: u32,
}

impl RegionFilter {
    /// Create a filter for `[start, end)` on a reference.
    pub fn new(reference_id: usize, start: u32, end: u32) -> Self {
        Self {
            reference_id,
            start,
            end,
        }
    }
}

/// Decode sorted records from `data[start..end]`, keeping those in `filter`.
///
/// The scan stops, without error, when:
/// - the range (or buffer) is exhausted
/// - a record's declared size runs past the buffer
/// - a record lies on a later reference than the target
/// - a record starts after `filter.end`
///
/// Records on an earlier reference are skipped. Records ending before
/// `filter.start` are decoded but not returned.
pub fn decode_records(
    data: &[u8],
    start: usize,
    end: Option<usize>,
    filter: &RegionFilter,
    references: Option<&ReferenceTable>,
) -> Result<Vec<Record>, BamDecodeError> {
    let limit = end.map_or(data.len(), |e| e.min(data.len()));
    let target = filter.reference_id as i64;
    let mut records = Vec::new();
    let mut offset = start;

    while offset < limit {
        let mut cursor = offset;
        let Ok(block_size) = read_i32_le(data, &mut cursor, "block size") else {
            break;
        };
        if block_size < FIXED_FIELDS_SIZE as i32 {
            return Err(BamDecodeError::InvalidBlockSize {
                size: block_size,
                offset,
            });
        }
        let block_end = cursor + block_size as usize;
        if block_end > data.len() {
            break;
        }

        let ref_id = i64::from(read_i32_le(data, &mut cursor, "reference id")?);
        let pos = i64::from(read_i32_le(data, &mut cursor, "position")?);

        if ref_id > target || pos > i64::from(filter.end) {
            break;
        }
        if ref_id < target {
            offset = block_end;
            continue;
        }

        let record = parse_record(&data[offset..block_end], references)?;
        if record.end() >= i64::from(filter.start) {
            records.push(record);
        }
        offset = block_end;
    }

    Ok(records)
}
