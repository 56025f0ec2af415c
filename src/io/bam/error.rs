//! BAM decoding error types.
//!
//! Structured errors for header and alignment record decoding, so callers can
//! pattern match on the exact field that was malformed.

use std::{error, fmt};

/// Errors that can occur while decoding BAM header and record bytes.
///
/// # Example
///
/// ```
/// use bamrange::io::bam::error::BamDecodeError;
///
/// fn describe(err: &BamDecodeError) -> String {
///     match err {
///         BamDecodeError::InvalidCigarOp { value } => format!("bad CIGAR op {value}"),
///         BamDecodeError::UnexpectedEof { context, .. } => format!("truncated {context}"),
///         other => other.to_string(),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BamDecodeError {
    /// Invalid reference sequence ID (must be -1 or >= 0)
    InvalidReferenceId {
        /// The invalid reference ID value
        value: i32,
        /// Which field had the invalid ID ("read" or "mate")
        field: &'static str,
    },

    /// Record block size smaller than the fixed record header
    InvalidBlockSize {
        /// Declared block size
        size: i32,
        /// Offset of the record in the decompressed buffer
        offset: usize,
    },

    /// Invalid read name length (must be >= 1)
    InvalidReadNameLength {
        /// The invalid length value
        length: u8,
        /// Offset in the data where error occurred
        offset: usize,
    },

    /// Missing NUL terminator in string field
    MissingNulTerminator {
        /// Which field was missing the terminator
        field: &'static str,
        /// Offset in the data where error occurred
        offset: usize,
    },

    /// Invalid UTF-8 in string field
    InvalidUtf8 {
        /// Which field had invalid UTF-8
        field: &'static str,
        /// Offset in the data where error occurred
        offset: usize,
    },

    /// Invalid tag type code
    InvalidTagType {
        /// The tag name
        tag: [u8; 2],
        /// The invalid type code
        type_code: u8,
    },

    /// Invalid array subtype
    InvalidArraySubtype {
        /// The tag name
        tag: [u8; 2],
        /// The invalid subtype code
        subtype: u8,
    },

    /// Invalid CIGAR operation code
    InvalidCigarOp {
        /// The invalid operation value
        value: u32,
    },

    /// CIGAR reference span does not fit in 32 bits
    ReferenceLengthOverflow {
        /// Summed span of the reference-consuming operations
        length: u64,
    },

    /// Negative length field
    NegativeLength {
        /// Which field was negative
        field: &'static str,
        /// The negative length value
        length: i32,
    },

    /// Insufficient data for parsing
    UnexpectedEof {
        /// What was being parsed
        context: &'static str,
        /// Expected number of bytes
        expected: usize,
        /// Actual number of bytes available
        actual: usize,
    },

    /// Invalid BAM magic bytes
    InvalidMagic {
        /// The actual bytes found
        actual: [u8; 4],
    },
}

impl error::Error for BamDecodeError {}

impl fmt::Display for BamDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidReferenceId { value, field } => {
                write!(
                    f,
                    "Invalid {} reference ID: {} (must be -1 or >= 0)",
                    field, value
                )
            }

            Self::InvalidBlockSize { size, offset } => {
                write!(f, "Invalid record block size at offset {}: {}", offset, size)
            }

            Self::InvalidReadNameLength { length, offset } => {
                write!(
                    f,
                    "Invalid read name length at offset {}: {} (must be >= 1)",
                    offset, length
                )
            }

            Self::MissingNulTerminator { field, offset } => {
                write!(f, "Missing NUL terminator in {} at offset {}", field, offset)
            }

            Self::InvalidUtf8 { field, offset } => {
                write!(f, "Invalid UTF-8 in {} at offset {}", field, offset)
            }

            Self::InvalidTagType { tag, type_code } => {
                write!(
                    f,
                    "Invalid tag type for {}{}: {:?}",
                    tag[0] as char, tag[1] as char, *type_code as char
                )
            }

            Self::InvalidArraySubtype { tag, subtype } => {
                write!(
                    f,
                    "Invalid array subtype for {}{}: {:?}",
                    tag[0] as char, tag[1] as char, *subtype as char
                )
            }

            Self::InvalidCigarOp { value } => {
                write!(f, "Invalid CIGAR operation: {}", value)
            }

            Self::ReferenceLengthOverflow { length } => {
                write!(f, "CIGAR reference length {} exceeds {}", length, u32::MAX)
            }

            Self::NegativeLength { field, length } => {
                write!(f, "Invalid negative {}: {}", field, length)
            }

            Self::UnexpectedEof {
                context,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Unexpected end of data while parsing {}: expected {} bytes, got {}",
                    context, expected, actual
                )
            }

            Self::InvalidMagic { actual } => {
                write!(
                    f,
                    "Invalid BAM magic bytes: expected [BAM\\x01], got {:?}",
                    actual
                )
            }
        }
    }
}
