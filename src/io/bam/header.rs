//! BAM header parsing.
//!
//! The BAM header consists of:
//! 1. Magic bytes ("BAM\1")
//! 2. SAM header text (length-prefixed)
//! 3. Reference sequence dictionary
//!
//! # Format
//!
//! ```text
//! BAM Header:
//! - 4 bytes: Magic ("BAM\1")
//! - 4 bytes: SAM header text length (l_text, int32)
//! - l_text bytes: SAM header text
//! - 4 bytes: Number of reference sequences (n_ref, int32)
//! - For each reference:
//!   - 4 bytes: Reference name length (l_name, int32, includes null terminator)
//!   - l_name bytes: Reference name (null-terminated)
//!   - 4 bytes: Reference length (int32)
//! ```
//!
//! Only the reference dictionary is needed for range queries. The SAM text is
//! kept as-is and never interpreted.

use super::error::BamDecodeError;
use super::record::{read_i32_le, take};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// BAM magic bytes.
pub(crate) const BAM_MAGIC: &[u8; 4] = b"BAM\x01";

/// Hook mapping a raw reference name to its canonical form (e.g. "1" -> "chr1").
pub type NameNormalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Reference sequence information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Reference name after normalization (e.g., "chr1", "chrM")
    pub name: String,
    /// Name exactly as stored in the file
    pub raw_name: String,
    /// Reference sequence length in bases
    pub length: u32,
}

impl Reference {
    /// Create a reference whose stored and canonical names agree.
    pub fn new(name: impl Into<String>, length: u32) -> Self {
        let name = name.into();
        Self {
            raw_name: name.clone(),
            name,
            length,
        }
    }
}

/// Reference sequences of a BAM file, in header order.
///
/// Reference ids are the positions in this table: contiguous, assigned in
/// header order, and stable for the lifetime of the reader.
#[derive(Clone, PartialEq, Eq)]
pub struct ReferenceTable {
    text: String,
    references: Vec<Reference>,
    by_name: HashMap<String, usize>,
}

impl ReferenceTable {
    /// Build a table from references, applying `normalizer` to every name.
    ///
    /// When two references normalize to the same name, the first one keeps it.
    pub fn new(
        text: String,
        references: Vec<Reference>,
        normalizer: Option<&NameNormalizer>,
    ) -> Self {
        let mut references = references;
        if let Some(normalize) = normalizer {
            for reference in &mut references {
                reference.name = normalize(&reference.raw_name);
            }
        }

        let mut by_name = HashMap::with_capacity(references.len());
        for (id, reference) in references.iter().enumerate() {
            by_name.entry(reference.name.clone()).or_insert(id);
        }

        Self {
            text,
            references,
            by_name,
        }
    }

    /// Decode the header at the start of an inflated BAM stream.
    ///
    /// Returns [`BamDecodeError::UnexpectedEof`] when `data` ends before the
    /// reference dictionary does; callers holding a partial stream can fetch
    /// more and retry.
    ///
    /// # Example
    ///
    /// ```
    /// use bamrange::io::bam::ReferenceTable;
    ///
    /// let mut data = b"BAM\x01".to_vec();
    /// data.extend_from_slice(&0i32.to_le_bytes()); // no SAM text
    /// data.extend_from_slice(&1i32.to_le_bytes());
    /// data.extend_from_slice(&5i32.to_le_bytes());
    /// data.extend_from_slice(b"chr1\0");
    /// data.extend_from_slice(&1000i32.to_le_bytes());
    ///
    /// let table = ReferenceTable::from_bytes(&data, None).unwrap();
    /// assert_eq!(table.index_of("chr1"), Some(0));
    /// ```
    pub fn from_bytes(
        data: &[u8],
        normalizer: Option<&NameNormalizer>,
    ) -> Result<Self, BamDecodeError> {
        let mut cursor = 0;

        let magic = take(data, &mut cursor, 4, "BAM magic")?;
        if magic != BAM_MAGIC {
            let mut actual = [0u8; 4];
            actual.copy_from_slice(magic);
            return Err(BamDecodeError::InvalidMagic { actual });
        }

        let l_text = read_length(data, &mut cursor, "header text length")?;
        let text = String::from_utf8_lossy(take(data, &mut cursor, l_text, "header text")?)
            .into_owned();

        let n_ref = read_length(data, &mut cursor, "reference count")?;
        let mut references = Vec::with_capacity(n_ref.min(1 << 16));
        for _ in 0..n_ref {
            references.push(read_reference(data, &mut cursor)?);
        }

        Ok(Self::new(text, references, normalizer))
    }

    /// SAM header text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// All references in header order.
    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// Get reference by ID.
    pub fn reference(&self, id: usize) -> Option<&Reference> {
        self.references.get(id)
    }

    /// Canonical name of a reference id.
    pub fn reference_name(&self, id: usize) -> Option<&str> {
        self.reference(id).map(|r| r.name.as_str())
    }

    /// Reference id of a canonical name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Number of reference sequences.
    pub fn len(&self) -> usize {
        self.references.len()
    }

    /// True if the header declares no references.
    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}

impl fmt::Debug for ReferenceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceTable")
            .field("references", &self.references)
            .finish_non_exhaustive()
    }
}

fn read_length(
    data: &[u8],
    cursor: &mut usize,
    field: &'static str,
) -> Result<usize, BamDecodeError> {
    let value = read_i32_le(data, cursor, field)?;
    usize::try_from(value).map_err(|_| BamDecodeError::NegativeLength {
        field,
        length: value,
    })
}

fn read_reference(data: &[u8], cursor: &mut usize) -> Result<Reference, BamDecodeError> {
    let l_name = read_length(data, cursor, "reference name length")?;
    let offset = *cursor;
    let name_bytes = take(data, cursor, l_name, "reference name")?;

    let Some((&0, name_bytes)) = name_bytes.split_last() else {
        return Err(BamDecodeError::MissingNulTerminator {
            field: "reference name",
            offset,
        });
    };
    let name = std::str::from_utf8(name_bytes).map_err(|_| BamDecodeError::InvalidUtf8 {
        field: "reference name",
        offset,
    })?;

    let length = read_length(data, cursor, "reference length")?;
    Ok(Reference::new(name, length as u32))
}
