//! HTTP range-request fetcher.
//!
//! [`HttpClient`] implements [`RangeFetcher`] over HTTP/HTTPS so an indexed BAM
//! on a web server can be queried without downloading it.
//!
//! # Features
//!
//! - Range requests (`Range: bytes=start-end`), 206 Partial Content required
//! - Byte-bounded LRU cache of fetched ranges
//! - Request deduplication: concurrent fetches of the same range share one request
//! - Automatic retry with exponential backoff
//! - Timeout handling
//!
//! Retry lives here, in the fetch layer. The query engine treats any error
//! returned from this module as final.
//!
//! # Thread Safety
//!
//! `HttpClient` is `Clone` (an `Arc` increment) and `Send + Sync`. The cache
//! lock is never held across a network request, so chunk fetches issued from
//! different threads proceed in parallel.
//!
//! # Example
//!
//! ```no_run
//! use bamrange::io::network::HttpClient;
//! use bamrange::IndexedBamReader;
//!
//! # fn main() -> bamrange::Result<()> {
//! let client = HttpClient::new()?;
//! let reader = IndexedBamReader::new(client, "https://example.com/sample.bam");
//! let alignments = reader.query("chr1", 1_000_000, 1_010_000)?;
//! println!("{} alignments", alignments.len());
//! # Ok(())
//! # }
//! ```

use crate::error::{BamError, Result};
use crate::io::fetch::{ByteRange, RangeFetcher};
use bytes::Bytes;
use lru::LruCache;
use reqwest::blocking::Client;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Default cache size (50 MB)
///
/// Holds several hundred BGZF-sized chunk fetches.
pub const DEFAULT_CACHE_SIZE: usize = 50 * 1024 * 1024;

/// Default HTTP timeout (2 minutes)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of attempts per request
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Minimum cache size (1 MB)
pub const MIN_CACHE_SIZE: usize = 1024 * 1024;

/// Maximum cache size (10 GB)
pub const MAX_CACHE_SIZE: usize = 10 * 1024 * 1024 * 1024;

/// Identifies one requested range of a URL.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct CacheKey {
    url: String,
    start: u64,
    size: Option<u64>,
}

/// State of a request other threads may be waiting on.
enum FetchState {
    InProgress,
    Complete(Bytes),
    Failed(String),
}

type InFlight = Arc<(Mutex<FetchState>, Condvar)>;

/// LRU cache bounded by the total size of its values rather than entry count.
struct ByteBoundedCache {
    cache: LruCache<CacheKey, Bytes>,
    current_size: usize,
    max_size: usize,
}

impl ByteBoundedCache {
    fn new(max_size: usize) -> Self {
        Self {
            cache: LruCache::unbounded(),
            current_size: 0,
            max_size,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<&Bytes> {
        self.cache.get(key)
    }

    /// Insert, evicting least recently used entries until the value fits.
    fn put(&mut self, key: CacheKey, value: Bytes) {
        let value_size = value.len();

        // Larger than the whole cache: not cached
        if value_size > self.max_size {
            return;
        }

        if let Some(old) = self.cache.peek(&key) {
            self.current_size = self.current_size.saturating_sub(old.len());
        }

        while self.current_size + value_size > self.max_size && !self.cache.is_empty() {
            if let Some((_, evicted)) = self.cache.pop_lru() {
                self.current_size = self.current_size.saturating_sub(evicted.len());
            }
        }

        self.current_size += value_size;
        self.cache.push(key, value);
    }

    fn clear(&mut self) {
        self.cache.clear();
        self.current_size = 0;
    }
}

struct Shared {
    client: Client,
    timeout: Duration,
    max_retries: u32,
    cache: Mutex<ByteBoundedCache>,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries currently in cache
    pub entries: usize,
    /// Current cache size in bytes
    pub current_bytes: usize,
    /// Maximum cache size in bytes
    pub max_bytes: usize,
}

/// HTTP fetcher with caching, deduplication and retry.
#[derive(Clone)]
pub struct HttpClient {
    shared: Arc<Shared>,
}

impl HttpClient {
    /// Create a client with default settings
    ///
    /// - Cache size: 50 MB
    /// - Timeout: 2 minutes
    /// - Attempts: 3
    pub fn new() -> Result<Self> {
        Self::with_settings(DEFAULT_CACHE_SIZE, DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES)
    }

    /// Create a client with a custom cache size (1 MB - 10 GB).
    ///
    /// # Example
    ///
    /// ```
    /// # use bamrange::io::network::HttpClient;
    /// let client = HttpClient::with_cache_size(100 * 1024 * 1024)?;
    /// # Ok::<(), bamrange::BamError>(())
    /// ```
    pub fn with_cache_size(cache_size_bytes: usize) -> Result<Self> {
        Self::with_settings(cache_size_bytes, DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES)
    }

    /// Create a client with explicit cache size, timeout and attempt count.
    pub fn with_settings(
        cache_size_bytes: usize,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        if !(MIN_CACHE_SIZE..=MAX_CACHE_SIZE).contains(&cache_size_bytes) {
            return Err(BamError::InvalidRange(format!(
                "cache size {} bytes outside {}..={} bytes",
                cache_size_bytes, MIN_CACHE_SIZE, MAX_CACHE_SIZE
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BamError::fetch("<client>", format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                timeout,
                max_retries: max_retries.max(1),
                cache: Mutex::new(ByteBoundedCache::new(cache_size_bytes)),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Drop every cached range.
    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    /// Current cache occupancy.
    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache();
        CacheStats {
            entries: cache.cache.len(),
            current_bytes: cache.current_size,
            max_bytes: cache.max_size,
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, ByteBoundedCache> {
        self.shared.cache.lock().unwrap_or_else(|poisoned| {
            log::warn!("HttpClient cache lock poisoned, clearing cache");
            let mut guard = poisoned.into_inner();
            guard.clear();
            guard
        })
    }

    /// Fetch a range, sharing the request with concurrent callers for the same key.
    fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes> {
        let key = CacheKey {
            url: url.to_string(),
            start: range.start,
            size: range.size,
        };

        if let Some(data) = self.cache().get(&key) {
            return Ok(data.clone());
        }

        let (entry, leader) = {
            let mut in_flight = self
                .shared
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&key) {
                Some(entry) => (Arc::clone(entry), false),
                None => {
                    let entry: InFlight =
                        Arc::new((Mutex::new(FetchState::InProgress), Condvar::new()));
                    in_flight.insert(key.clone(), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };

        let (lock, cvar) = &*entry;
        if !leader {
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            while matches!(*state, FetchState::InProgress) {
                state = cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            return match &*state {
                FetchState::Complete(data) => Ok(data.clone()),
                FetchState::Failed(message) => Err(BamError::fetch(url, message.clone())),
                FetchState::InProgress => Err(BamError::fetch(url, "request abandoned")),
            };
        }

        let result = self.fetch_with_retry(url, range);

        {
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            *state = match &result {
                Ok(data) => {
                    self.cache().put(key.clone(), data.clone());
                    FetchState::Complete(data.clone())
                }
                Err(e) => FetchState::Failed(e.to_string()),
            };
            cvar.notify_all();
        }
        self.shared
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);

        result
    }

    /// Retry transient failures with exponential backoff.
    fn fetch_with_retry(&self, url: &str, range: ByteRange) -> Result<Bytes> {
        let mut attempts = 0;
        let mut backoff = Duration::from_millis(100);

        loop {
            match self.fetch_once(url, range) {
                Ok(data) => return Ok(data),
                Err(BamError::Http { status, url }) if status < 500 => {
                    return Err(BamError::Http { status, url });
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.shared.max_retries {
                        return Err(e);
                    }
                    log::debug!("Retrying {} after error: {}", url, e);
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
            }
        }
    }

    fn fetch_once(&self, url: &str, range: ByteRange) -> Result<Bytes> {
        if range.size == Some(0) {
            return Ok(Bytes::new());
        }

        let response = self
            .shared
            .client
            .get(url)
            .header("Range", range_header(range))
            .send()
            .map_err(|e| self.request_error(url, &e))?;

        let status = response.status().as_u16();
        if status == 416 {
            // Range starts past the end of the resource
            return Ok(Bytes::new());
        }
        if !response.status().is_success() {
            return Err(BamError::Http {
                status,
                url: url.to_string(),
            });
        }

        let body = response
            .bytes()
            .map_err(|e| self.request_error(url, &e))?;
        check_body(url, status, range, body.len())?;
        Ok(body)
    }

    fn request_error(&self, url: &str, e: &reqwest::Error) -> BamError {
        if e.is_timeout() {
            BamError::Timeout {
                seconds: self.shared.timeout.as_secs(),
                url: url.to_string(),
            }
        } else {
            BamError::fetch(url, e.to_string())
        }
    }
}

impl RangeFetcher for HttpClient {
    fn fetch(&self, path: &str, range: ByteRange) -> Result<Bytes> {
        self.fetch_range(path, range)
    }

    /// Content-Length from a HEAD request.
    fn content_length(&self, path: &str) -> Result<Option<u64>> {
        let response = self
            .shared
            .client
            .head(path)
            .send()
            .map_err(|e| self.request_error(path, &e))?;

        if !response.status().is_success() {
            return Err(BamError::Http {
                status: response.status().as_u16(),
                url: path.to_string(),
            });
        }

        Ok(response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok()))
    }
}

fn range_header(range: ByteRange) -> String {
    match range.size {
        Some(size) => format!("bytes={}-{}", range.start, range.start + size - 1),
        None => format!("bytes={}-", range.start),
    }
}

/// Validate a response body against the requested range.
///
/// 206 bodies may be shorter than requested (end of resource) but never
/// longer. A 200 means the server ignored the Range header; it is accepted
/// only when the whole resource is exactly what was asked for.
fn check_body(url: &str, status: u16, range: ByteRange, body_len: usize) -> Result<()> {
    let body_len = body_len as u64;
    match status {
        206 => match range.size {
            Some(size) if body_len > size => Err(BamError::fetch(
                url,
                format!(
                    "server returned more data than requested: expected {} bytes, got {}",
                    size, body_len
                ),
            )),
            _ => Ok(()),
        },
        _ if range.start == 0 && range.size.map_or(true, |size| size >= body_len) => Ok(()),
        _ => Err(BamError::fetch(
            url,
            format!(
                "server does not support range requests (status {} instead of 206)",
                status
            ),
        )),
    }
}
