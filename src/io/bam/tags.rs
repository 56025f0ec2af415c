//! BAM optional tags (auxiliary data).
//!
//! Optional tags store additional information about alignments such as:
//! - Edit distance (NM:i)
//! - Alignment score (AS:i)
//! - Supplementary alignments (SA:Z)
//! - Read group (RG:Z)
//!
//! # Format
//!
//! Each tag is encoded as:
//! - 2 bytes: tag name (e.g., "NM")
//! - 1 byte: value type (A, c, C, s, S, i, I, f, Z, H, B)
//! - N bytes: value (format depends on type)
//!
//! Records keep their tags as the raw trailing bytes. Nothing is parsed until
//! [`Tags::get`] or [`Tags::iter`] is called.

use super::error::BamDecodeError;
use super::record::take;

/// Raw tag bytes of one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags {
    data: Vec<u8>,
}

/// A decoded tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Two-character tag name
    pub name: [u8; 2],
    /// Decoded value
    pub value: TagValue,
}

/// Value of a tag, widened to one variant per SAM type letter.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    /// Printable character (A)
    Char(u8),
    /// Any integer type (c, C, s, S, i, I)
    Int(i64),
    /// Single-precision float (f)
    Float(f32),
    /// NUL-terminated string (Z)
    String(String),
    /// Hex-encoded byte string (H)
    Hex(String),
    /// Numeric array (B)
    Array(ArrayValue),
}

/// Elements of a B-type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    /// c
    Int8(Vec<i8>),
    /// C
    UInt8(Vec<u8>),
    /// s
    Int16(Vec<i16>),
    /// S
    UInt16(Vec<u16>),
    /// i
    Int32(Vec<i32>),
    /// I
    UInt32(Vec<u32>),
    /// f
    Float(Vec<f32>),
}

impl Tags {
    /// Create empty tags.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Wrap the raw tag bytes of a record.
    pub fn from_raw(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Raw tag bytes.
    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    /// Check if tags are empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the tag data in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Decode tags one at a time. Iteration stops after the first error.
    pub fn iter(&self) -> TagIter<'_> {
        TagIter {
            data: &self.data,
            cursor: 0,
            failed: false,
        }
    }

    /// Find and decode a tag by name.
    ///
    /// # Example
    ///
    /// ```
    /// use bamrange::io::bam::{Tags, TagValue};
    ///
    /// let tags = Tags::from_raw(vec![b'N', b'M', b'C', 3]);
    /// assert_eq!(tags.get(b"NM").unwrap(), Some(TagValue::Int(3)));
    /// assert_eq!(tags.get(b"AS").unwrap(), None);
    /// ```
    pub fn get(&self, name: &[u8; 2]) -> Result<Option<TagValue>, BamDecodeError> {
        for tag in self.iter() {
            let tag = tag?;
            if &tag.name == name {
                return Ok(Some(tag.value));
            }
        }
        Ok(None)
    }
}

/// Iterator over decoded tags.
pub struct TagIter<'a> {
    data: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl Iterator for TagIter<'_> {
    type Item = Result<Tag, BamDecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.data.len() {
            return None;
        }
        let result = read_tag(self.data, &mut self.cursor);
        self.failed = result.is_err();
        Some(result)
    }
}

fn read_tag(data: &[u8], cursor: &mut usize) -> Result<Tag, BamDecodeError> {
    let header = take(data, cursor, 3, "tag header")?;
    let name = [header[0], header[1]];
    let type_code = header[2];

    let value = match type_code {
        b'A' => TagValue::Char(take(data, cursor, 1, "tag value")?[0]),
        b'c' | b'C' | b's' | b'S' | b'i' | b'I' => {
            TagValue::Int(read_int(data, cursor, type_code)?)
        }
        b'f' => TagValue::Float(f32::from_le_bytes(fixed(data, cursor)?)),
        b'Z' | b'H' => {
            let offset = *cursor;
            let rest = &data[offset..];
            let Some(nul) = rest.iter().position(|&b| b == 0) else {
                return Err(BamDecodeError::MissingNulTerminator {
                    field: "tag string",
                    offset,
                });
            };
            let text = std::str::from_utf8(&rest[..nul])
                .map_err(|_| BamDecodeError::InvalidUtf8 {
                    field: "tag string",
                    offset,
                })?
                .to_string();
            *cursor += nul + 1;
            if type_code == b'Z' {
                TagValue::String(text)
            } else {
                TagValue::Hex(text)
            }
        }
        b'B' => TagValue::Array(read_array(data, cursor, name)?),
        _ => return Err(BamDecodeError::InvalidTagType { tag: name, type_code }),
    };

    Ok(Tag { name, value })
}

fn read_int(data: &[u8], cursor: &mut usize, type_code: u8) -> Result<i64, BamDecodeError> {
    Ok(match type_code {
        b'c' => i64::from(i8::from_le_bytes(fixed(data, cursor)?)),
        b'C' => i64::from(u8::from_le_bytes(fixed(data, cursor)?)),
        b's' => i64::from(i16::from_le_bytes(fixed(data, cursor)?)),
        b'S' => i64::from(u16::from_le_bytes(fixed(data, cursor)?)),
        b'i' => i64::from(i32::from_le_bytes(fixed(data, cursor)?)),
        _ => i64::from(u32::from_le_bytes(fixed(data, cursor)?)),
    })
}

fn read_array(
    data: &[u8],
    cursor: &mut usize,
    tag: [u8; 2],
) -> Result<ArrayValue, BamDecodeError> {
    let subtype = take(data, cursor, 1, "array subtype")?[0];
    let count = i32::from_le_bytes(fixed(data, cursor)?);
    let count = usize::try_from(count).map_err(|_| BamDecodeError::NegativeLength {
        field: "array length",
        length: count,
    })?;

    let width = match subtype {
        b'c' | b'C' => 1,
        b's' | b'S' => 2,
        b'i' | b'I' | b'f' => 4,
        _ => return Err(BamDecodeError::InvalidArraySubtype { tag, subtype }),
    };
    let bytes = take(data, cursor, count.saturating_mul(width), "array elements")?;

    Ok(match subtype {
        b'c' => ArrayValue::Int8(bytes.iter().map(|&b| b as i8).collect()),
        b'C' => ArrayValue::UInt8(bytes.to_vec()),
        b's' => ArrayValue::Int16(bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect()),
        b'S' => ArrayValue::UInt16(bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect()),
        b'i' => ArrayValue::Int32(bytes.chunks_exact(4).map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()),
        b'I' => ArrayValue::UInt32(bytes.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()),
        _ => ArrayValue::Float(bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()),
    })
}

fn fixed<const N: usize>(data: &[u8], cursor: &mut usize) -> Result<[u8; N], BamDecodeError> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(data, cursor, N, "tag value")?);
    Ok(out)
}
