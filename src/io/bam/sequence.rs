//! 4-bit BAM sequence decoding.
//!
//! BAM stores sequences in 4-bit encoding (2 bases per byte).
//! Each nibble encodes one base through a lookup table.
//!
//! # Format
//!
//! - High nibble first, low nibble second within each byte
//! - 16 possible values (4 bases + ambiguity codes)
//! - Example: byte 0x12 -> bases at indices 1 ('A') and 2 ('C')
//! - Odd-length sequences leave the final low nibble as padding

use super::error::BamDecodeError;

/// BAM 4-bit to ASCII base lookup table.
///
/// - 0 = '=' (match to reference, not used in practice)
/// - 1, 2, 4, 8 = A, C, G, T
/// - the rest are IUPAC ambiguity codes
const SEQ_LOOKUP: [u8; 16] = *b"=ACMGRSVTWYHKDBN";

/// Decode `length` bases from packed 4-bit data.
///
/// The padding nibble of an odd-length sequence is discarded, so the result
/// always holds exactly `length` bases.
///
/// # Example
///
/// ```
/// use bamrange::io::bam::decode_sequence;
///
/// // Byte 0x12 encodes bases at indices 1 ('A') and 2 ('C')
/// let sequence = decode_sequence(&[0x12, 0x4F], 3).unwrap();
/// assert_eq!(sequence, b"ACG");
/// ```
pub fn decode_sequence(data: &[u8], length: usize) -> Result<Vec<u8>, BamDecodeError> {
    let required = length.div_ceil(2);
    if data.len() < required {
        return Err(BamDecodeError::UnexpectedEof {
            context: "sequence",
            expected: required,
            actual: data.len(),
        });
    }

    let mut sequence = Vec::with_capacity(length);
    for &byte in &data[..length / 2] {
        sequence.push(SEQ_LOOKUP[(byte >> 4) as usize]);
        sequence.push(SEQ_LOOKUP[(byte & 0x0F) as usize]);
    }
    if length % 2 == 1 {
        sequence.push(SEQ_LOOKUP[(data[length / 2] >> 4) as usize]);
    }

    Ok(sequence)
}
