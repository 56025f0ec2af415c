//! Byte-range fetch layer.
//!
//! The query engine never opens files itself. It asks a [`RangeFetcher`] for
//! `[start, start + size)` of a named resource, so the same reader works over
//! local files, memory and HTTP.
//!
//! # Local files
//!
//! [`LocalFetcher`] reads small files with seek + read. Files of at least
//! [`MMAP_THRESHOLD`] bytes are memory-mapped once and sliced, which avoids a
//! syscall per chunk on large alignments.

use crate::error::{BamError, Result};
use bytes::Bytes;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Files at or above this size are memory-mapped (50 MB).
pub const MMAP_THRESHOLD: u64 = 50 * 1024 * 1024;

/// A byte range of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte
    pub start: u64,
    /// Number of bytes, or None for "to the end of the resource"
    pub size: Option<u64>,
}

impl ByteRange {
    /// `size` bytes starting at `start`.
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            size: Some(size),
        }
    }

    /// Everything from `start` to the end of the resource.
    pub fn to_end(start: u64) -> Self {
        Self { start, size: None }
    }

    /// Clamp to a resource of `length` bytes, as `(start, end)`.
    pub fn bounds(&self, length: u64) -> (u64, u64) {
        let start = self.start.min(length);
        let end = match self.size {
            Some(size) => self.start.saturating_add(size).min(length),
            None => length,
        };
        (start, end)
    }
}

/// Partial reads of named resources.
///
/// A range that runs past the end of the resource is clamped; one that starts
/// past the end yields an empty buffer. Failures are reported as fetch errors
/// (see [`BamError::is_fetch_error`]); implementations own any retry policy.
pub trait RangeFetcher: Send + Sync {
    /// Read a byte range of `path`.
    fn fetch(&self, path: &str, range: ByteRange) -> Result<Bytes>;

    /// Total size of `path`, when cheaply known.
    fn content_length(&self, path: &str) -> Result<Option<u64>> {
        let _ = path;
        Ok(None)
    }
}

impl<F: RangeFetcher + ?Sized> RangeFetcher for Arc<F> {
    fn fetch(&self, path: &str, range: ByteRange) -> Result<Bytes> {
        (**self).fetch(path, range)
    }

    fn content_length(&self, path: &str) -> Result<Option<u64>> {
        (**self).content_length(path)
    }
}

/// Fetcher over the local filesystem.
#[derive(Debug)]
pub struct LocalFetcher {
    mmap_threshold: u64,
    maps: Mutex<HashMap<PathBuf, Arc<Mmap>>>,
}

impl LocalFetcher {
    /// Create a fetcher using the default [`MMAP_THRESHOLD`].
    pub fn new() -> Self {
        Self::with_mmap_threshold(MMAP_THRESHOLD)
    }

    /// Create a fetcher that maps files of at least `threshold` bytes.
    pub fn with_mmap_threshold(threshold: u64) -> Self {
        Self {
            mmap_threshold: threshold,
            maps: Mutex::new(HashMap::new()),
        }
    }

    fn mapped(&self, path: &Path, file: &File) -> Result<Arc<Mmap>> {
        let mut maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = maps.get(path) {
            return Ok(Arc::clone(map));
        }
        // SAFETY: alignment files are treated as immutable while open.
        let map = Arc::new(unsafe { Mmap::map(file)? });
        log::debug!("Memory-mapped {} ({} bytes)", path.display(), map.len());
        maps.insert(path.to_path_buf(), Arc::clone(&map));
        Ok(map)
    }
}

impl Default for LocalFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeFetcher for LocalFetcher {
    fn fetch(&self, path: &str, range: ByteRange) -> Result<Bytes> {
        let file_path = Path::new(path);
        let mut file = File::open(file_path)
            .map_err(|e| BamError::fetch(path, format!("cannot open: {}", e)))?;
        let length = file.metadata()?.len();
        let (start, end) = range.bounds(length);

        if length >= self.mmap_threshold {
            let map = self.mapped(file_path, &file)?;
            return Ok(Bytes::copy_from_slice(&map[start as usize..end as usize]));
        }

        let mut buffer = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buffer)?;
        Ok(Bytes::from(buffer))
    }

    fn content_length(&self, path: &str) -> Result<Option<u64>> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| BamError::fetch(path, format!("cannot stat: {}", e)))?;
        Ok(Some(metadata.len()))
    }
}

/// Fetcher over named in-memory buffers.
#[derive(Debug, Default, Clone)]
pub struct MemoryFetcher {
    resources: HashMap<String, Bytes>,
}

impl MemoryFetcher {
    /// Create an empty fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `data` under `path`, replacing any previous buffer.
    pub fn insert(&mut self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.resources.insert(path.into(), data.into());
    }

    /// Builder form of [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.insert(path, data);
        self
    }

    fn resource(&self, path: &str) -> Result<&Bytes> {
        self.resources
            .get(path)
            .ok_or_else(|| BamError::fetch(path, "no such resource"))
    }
}

impl RangeFetcher for MemoryFetcher {
    fn fetch(&self, path: &str, range: ByteRange) -> Result<Bytes> {
        let data = self.resource(path)?;
        let (start, end) = range.bounds(data.len() as u64);
        Ok(data.slice(start as usize..end as usize))
    }

    fn content_length(&self, path: &str) -> Result<Option<u64>> {
        Ok(Some(self.resource(path)?.len() as u64))
    }
}
