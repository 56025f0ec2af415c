//! Indexed, random-access BAM reader.
//!
//! [`IndexedBamReader`] answers region queries against a BAM file and its BAI
//! index through any [`RangeFetcher`]. Only the header, the index, and the
//! compressed chunks that may overlap a query are ever fetched.
//!
//! # Query flow
//!
//! 1. Resolve the reference name through the cached [`ReferenceTable`]
//!    (unknown names give an empty result, without fetching chunks)
//! 2. Ask the cached [`BaiIndex`] for chunks overlapping the region and
//!    coalesce overlapping ones
//! 3. For each chunk, in parallel: fetch `[start block, end block + slack]`,
//!    inflate the blocks up to the end block, decode records between the
//!    chunk's virtual offsets
//! 4. Push every surviving record into the sink, then finish it
//!
//! Any failure in step 3 fails the query; nothing is pushed.
//!
//! # Caching
//!
//! The header and index are loaded on first use and shared by every later
//! query on the same reader. Concurrent first queries wait for a single load.
//! A failed load is not cached, so the next query tries again.
//!
//! # Example
//!
//! ```no_run
//! use bamrange::{IndexedBamReader, LocalFetcher};
//!
//! # fn main() -> bamrange::Result<()> {
//! let reader = IndexedBamReader::new(LocalFetcher::new(), "alignments.bam");
//!
//! let alignments = reader.query("chr1", 1_000_000, 1_010_000)?;
//! for record in alignments.records() {
//!     println!("{} {} {}", record.name, record.start, record.cigar_string());
//! }
//! # Ok(())
//! # }
//! ```

use super::container::{AlignmentContainer, AlignmentSink};
use super::error::BamDecodeError;
use super::header::{NameNormalizer, ReferenceTable};
use super::index::{merge_chunks, BaiIndex, Chunk};
use super::record::{decode_records, Record, RegionFilter};
use crate::error::{BamError, Result};
use crate::io::bgzf::{inflate_through, Blocks, MAX_BLOCK_SIZE};
use crate::io::fetch::{ByteRange, RangeFetcher};
use rayon::prelude::*;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Query configuration.
///
/// # Example
///
/// ```
/// use bamrange::ReaderOptions;
///
/// let options = ReaderOptions::default()
///     .with_index_path("indexes/sample.bai")
///     .with_merge_chunks(false)
///     .with_name_normalizer(|name: &str| {
///         if name.starts_with("chr") { name.to_string() } else { format!("chr{}", name) }
///     });
/// assert!(!options.merge_chunks());
/// ```
#[derive(Clone)]
pub struct ReaderOptions {
    index_path: Option<String>,
    fetch_slack: u64,
    header_padding: u64,
    merge_chunks: bool,
    name_normalizer: Option<NameNormalizer>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            index_path: None,
            fetch_slack: MAX_BLOCK_SIZE,
            header_padding: MAX_BLOCK_SIZE + 100,
            merge_chunks: true,
            name_normalizer: None,
        }
    }
}

impl ReaderOptions {
    /// Read the index from `path` instead of `<bam>.bai`.
    #[must_use]
    pub fn with_index_path(mut self, path: impl Into<String>) -> Self {
        self.index_path = Some(path.into());
        self
    }

    /// Bytes fetched past the block holding a chunk's end offset.
    ///
    /// Must cover one whole BGZF block; the default is [`MAX_BLOCK_SIZE`].
    #[must_use]
    pub fn with_fetch_slack(mut self, bytes: u64) -> Self {
        self.fetch_slack = bytes;
        self
    }

    /// Bytes fetched past the first alignment block when reading the header.
    #[must_use]
    pub fn with_header_padding(mut self, bytes: u64) -> Self {
        self.header_padding = bytes;
        self
    }

    /// Coalesce overlapping chunks before fetching (default `true`).
    ///
    /// With `false` every chunk is fetched and decoded on its own, and a
    /// record covered by two overlapping chunks is reported twice.
    #[must_use]
    pub fn with_merge_chunks(mut self, merge: bool) -> Self {
        self.merge_chunks = merge;
        self
    }

    /// Map reference names from the file to canonical names.
    ///
    /// Applied once per header reference when the header is loaded.
    #[must_use]
    pub fn with_name_normalizer<F>(mut self, normalizer: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.name_normalizer = Some(Arc::new(normalizer));
        self
    }

    /// Index location override, if any.
    pub fn index_path(&self) -> Option<&str> {
        self.index_path.as_deref()
    }

    /// Chunk fetch slack in bytes.
    pub fn fetch_slack(&self) -> u64 {
        self.fetch_slack
    }

    /// Header fetch padding in bytes.
    pub fn header_padding(&self) -> u64 {
        self.header_padding
    }

    /// Whether overlapping chunks are coalesced.
    pub fn merge_chunks(&self) -> bool {
        self.merge_chunks
    }
}

impl fmt::Debug for ReaderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderOptions")
            .field("index_path", &self.index_path)
            .field("fetch_slack", &self.fetch_slack)
            .field("header_padding", &self.header_padding)
            .field("merge_chunks", &self.merge_chunks)
            .field("name_normalizer", &self.name_normalizer.is_some())
            .finish()
    }
}

/// A value built at most once, on first successful use.
///
/// The lock is held while building, so concurrent callers wait for the one
/// build in progress. Errors are returned to the caller and not stored.
struct Memo<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Memo<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    fn get_or_try_init(&self, build: impl FnOnce() -> Result<T>) -> Result<Arc<T>> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = slot.as_ref() {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(build()?);
        *slot = Some(Arc::clone(&value));
        Ok(value)
    }
}

struct IndexState {
    index: Arc<BaiIndex>,
    content_length: Option<u64>,
}

/// Region queries over an indexed BAM file.
///
/// `IndexedBamReader` is `Send + Sync` whenever its fetcher is, so one reader
/// can serve queries from many threads.
pub struct IndexedBamReader<F> {
    fetcher: F,
    path: String,
    options: ReaderOptions,
    index: Memo<IndexState>,
    header: Memo<ReferenceTable>,
}

impl<F: RangeFetcher> IndexedBamReader<F> {
    /// Reader for `path`, with its index at `<path>.bai`.
    pub fn new(fetcher: F, path: impl Into<String>) -> Self {
        Self::with_options(fetcher, path, ReaderOptions::default())
    }

    /// Reader with explicit options.
    pub fn with_options(fetcher: F, path: impl Into<String>, options: ReaderOptions) -> Self {
        Self {
            fetcher,
            path: path.into(),
            options,
            index: Memo::new(),
            header: Memo::new(),
        }
    }

    /// BAM resource path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Index resource path.
    pub fn index_path(&self) -> String {
        self.options
            .index_path
            .clone()
            .unwrap_or_else(|| format!("{}.bai", self.path))
    }

    /// Options in effect.
    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    /// The fetcher queries go through.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Parsed index, loading it on first use.
    pub fn index(&self) -> Result<Arc<BaiIndex>> {
        Ok(Arc::clone(&self.index_state()?.index))
    }

    /// Reference table, loading the header (and index) on first use.
    pub fn reference_table(&self) -> Result<Arc<ReferenceTable>> {
        self.header.get_or_try_init(|| self.load_header())
    }

    /// Alignments overlapping `chr:[start, end)`, sorted by position.
    ///
    /// An unknown reference or a region without index chunks gives an empty
    /// container.
    pub fn query(&self, chr: &str, start: u32, end: u32) -> Result<AlignmentContainer> {
        self.query_into(chr, start, end, AlignmentContainer::new(chr, start, end))
    }

    /// Push the alignments overlapping `chr:[start, end)` into `sink`.
    ///
    /// On success every record has been pushed and `finish` called once. On
    /// failure the sink is dropped untouched.
    pub fn query_into<S: AlignmentSink>(
        &self,
        chr: &str,
        start: u32,
        end: u32,
        mut sink: S,
    ) -> Result<S> {
        if start >= end {
            return Err(BamError::InvalidRange(format!(
                "{}:{}-{} (start must be below end)",
                chr, start, end
            )));
        }

        let references = self.reference_table()?;
        let Some(reference_id) = self.resolve(&references, chr) else {
            log::debug!("Reference {} not in {}; empty result", chr, self.path);
            sink.finish();
            return Ok(sink);
        };

        let state = self.index_state()?;
        let mut chunks = state.index.blocks_for_range(reference_id, start, end);
        let selected = chunks.len();
        if self.options.merge_chunks {
            chunks = merge_chunks(chunks);
        }
        log::debug!(
            "{}:{}-{}: {} chunks ({} after merging)",
            chr,
            start,
            end,
            selected,
            chunks.len()
        );

        let filter = RegionFilter::new(reference_id, start, end);
        let batches = chunks
            .par_iter()
            .map(|chunk| self.read_chunk(chunk, &filter, &references, state.content_length))
            .collect::<Result<Vec<Vec<Record>>>>()?;

        for record in batches.into_iter().flatten() {
            sink.push(record);
        }
        sink.finish();
        Ok(sink)
    }

    fn resolve(&self, references: &ReferenceTable, chr: &str) -> Option<usize> {
        references.index_of(chr).or_else(|| {
            let normalize = self.options.name_normalizer.as_ref()?;
            references.index_of(&normalize(chr))
        })
    }

    fn index_state(&self) -> Result<Arc<IndexState>> {
        self.index.get_or_try_init(|| self.load_index())
    }

    fn load_index(&self) -> Result<IndexState> {
        let index_path = self.index_path();
        let bytes = self.fetcher.fetch(&index_path, ByteRange::to_end(0))?;
        let index = BaiIndex::from_bytes(&bytes)?;

        let content_length = match self.fetcher.content_length(&self.path)? {
            Some(length) => Some(length),
            None => index.block_max().map(|max| max + MAX_BLOCK_SIZE),
        };

        log::debug!(
            "Loaded index {}: {} references, content length {:?}",
            index_path,
            index.reference_count(),
            content_length
        );

        Ok(IndexState {
            index: Arc::new(index),
            content_length,
        })
    }

    fn load_header(&self) -> Result<ReferenceTable> {
        let state = self.index_state()?;
        let mut window = state
            .index
            .first_alignment_block()
            .unwrap_or(MAX_BLOCK_SIZE)
            + self.options.header_padding;
        if let Some(length) = state.content_length {
            window = window.min(length);
        }

        let bytes = self.fetcher.fetch(&self.path, ByteRange::new(0, window))?;
        let normalizer = self.options.name_normalizer.as_ref();

        // Blocks before the first alignment block hold only header bytes, so
        // parsing waits for them. After that, retry only once the bytes the
        // last attempt ran out at have arrived.
        let boundary = state.index.first_alignment_block();
        let mut blocks = Blocks::new(&bytes, 0).peekable();
        let mut inflated = Vec::new();
        let mut needed = 0;
        while let Some(block) = blocks.next() {
            let (_, data) = block?;
            inflated.extend_from_slice(&data);

            let header_continues = matches!(
                (boundary, blocks.peek()),
                (Some(first), Some(Ok((next, _)))) if *next < first
            );
            if header_continues || inflated.len() < needed {
                continue;
            }

            match ReferenceTable::from_bytes(&inflated, normalizer) {
                Ok(table) => {
                    log::debug!("Loaded header of {}: {} references", self.path, table.len());
                    return Ok(table);
                }
                Err(BamDecodeError::UnexpectedEof {
                    expected, actual, ..
                }) => needed = inflated.len() - actual + expected,
                Err(e) => return Err(e.into()),
            }
        }

        Err(BamError::format(
            "BAM header",
            format!("truncated: header extends past the first {} bytes", window),
        ))
    }

    /// Fetch, inflate and decode one chunk.
    fn read_chunk(
        &self,
        chunk: &Chunk,
        filter: &RegionFilter,
        references: &ReferenceTable,
        content_length: Option<u64>,
    ) -> Result<Vec<Record>> {
        let first_block = chunk.start.compressed_offset();
        let last_block = chunk.end.compressed_offset();
        if chunk.start > chunk.end {
            return Err(BamError::format(
                "BAI index",
                format!("chunk ends before it starts ({:#x} > {:#x})", chunk.start.as_raw(), chunk.end.as_raw()),
            ));
        }
        let fetch_max = last_block.saturating_add(self.options.fetch_slack);

        let range = match content_length {
            Some(length) if fetch_max > length => ByteRange::to_end(first_block),
            _ => ByteRange::new(first_block, fetch_max - first_block),
        };
        log::trace!("Fetching {}: {:?}", self.path, range);

        let bytes = self.fetcher.fetch(&self.path, range)?;
        let inflated = inflate_through(&bytes, first_block, last_block)?;
        if inflated.blocks().is_empty() {
            return Err(BamError::format(
                "BAM file",
                format!("{} ends before indexed block {}", self.path, first_block),
            ));
        }

        let begin = inflated.position(chunk.start).ok_or_else(|| {
            BamError::format(
                "BAI index",
                format!(
                    "chunk start {}:{} is not a block boundary in {}",
                    first_block,
                    chunk.start.uncompressed_offset(),
                    self.path
                ),
            )
        })?;
        let end = match inflated.position(chunk.end) {
            Some(end) => end,
            // Offset 0 of the block right after the inflated ones is the end of the data
            None if chunk.end.uncompressed_offset() == 0
                && inflated
                    .blocks()
                    .last()
                    .is_some_and(|b| b.compressed_offset + b.compressed_size as u64 == last_block) =>
            {
                inflated.data().len()
            }
            None => {
                return Err(BamError::format(
                    "BAM file",
                    format!(
                        "{} ends before chunk end {}:{}",
                        self.path,
                        last_block,
                        chunk.end.uncompressed_offset()
                    ),
                ))
            }
        };

        let records = decode_records(inflated.data(), begin, Some(end), filter, Some(references))?;
        log::trace!(
            "Chunk {}..{}: {} records",
            first_block,
            last_block,
            records.len()
        );
        Ok(records)
    }
}

impl<F> fmt::Debug for IndexedBamReader<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedBamReader")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
