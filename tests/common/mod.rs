//! Shared fixtures: hand-built BGZF/BAM/BAI bytes and instrumented fetchers.

#![allow(dead_code)]

use bamrange::io::bam::index::{region_to_bin, METADATA_BIN};
use bamrange::io::bam::VirtualOffset;
use bamrange::{BamError, ByteRange, MemoryFetcher, RangeFetcher, Result};
use bytes::Bytes;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

pub const BAM_PATH: &str = "test.bam";
pub const BAI_PATH: &str = "test.bam.bai";

const SEQ_CODES: &[u8; 16] = b"=ACMGRSVTWYHKDBN";
const CIGAR_CODES: &[u8; 9] = b"MIDNSHP=X";

/// Wrap `data` in one BGZF block.
pub fn bgzf_block(data: &[u8]) -> Vec<u8> {
    let mut deflate = DeflateEncoder::new(Vec::new(), Compression::default());
    deflate.write_all(data).unwrap();
    let deflated = deflate.finish().unwrap();

    let mut block = vec![31, 139, 8, 4, 0, 0, 0, 0, 0, 255];
    block.extend_from_slice(&6u16.to_le_bytes());
    block.extend_from_slice(b"BC");
    block.extend_from_slice(&2u16.to_le_bytes());
    let bsize_pos = block.len();
    block.extend_from_slice(&0u16.to_le_bytes());
    block.extend_from_slice(&deflated);
    block.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
    block.extend_from_slice(&(data.len() as u32).to_le_bytes());

    let bsize = (block.len() - 1) as u16;
    block[bsize_pos..bsize_pos + 2].copy_from_slice(&bsize.to_le_bytes());
    block
}

/// File offsets of the BGZF blocks in `bgzf`, read from each block's BSIZE field.
pub fn block_starts(bgzf: &[u8]) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut pos = 0;
    while pos + 18 <= bgzf.len() {
        starts.push(pos);
        pos += u16::from_le_bytes([bgzf[pos + 16], bgzf[pos + 17]]) as usize + 1;
    }
    starts
}

/// Uncompressed BAM header: magic, SAM text, reference dictionary.
pub fn bam_header(text: &str, references: &[(String, u32)]) -> Vec<u8> {
    let mut data = b"BAM\x01".to_vec();
    data.extend_from_slice(&(text.len() as i32).to_le_bytes());
    data.extend_from_slice(text.as_bytes());
    data.extend_from_slice(&(references.len() as i32).to_le_bytes());
    for (name, length) in references {
        data.extend_from_slice(&(name.len() as i32 + 1).to_le_bytes());
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        data.extend_from_slice(&(*length as i32).to_le_bytes());
    }
    data
}

/// `(length, op char)` pairs of a CIGAR string such as `5S10M`.
pub fn parse_cigar_string(cigar: &str) -> Vec<(u32, u8)> {
    let mut ops = Vec::new();
    let mut length = 0u32;
    for byte in cigar.bytes() {
        if byte.is_ascii_digit() {
            length = length * 10 + u32::from(byte - b'0');
        } else {
            ops.push((length, byte));
            length = 0;
        }
    }
    ops
}

/// One alignment to be written into a fixture.
#[derive(Debug, Clone)]
pub struct TestRead {
    pub name: String,
    pub ref_id: i32,
    pub pos: i32,
    pub cigar: String,
    pub flags: u16,
    pub mapq: u8,
    pub with_quality: bool,
    pub mate: Option<(i32, i32)>,
    pub tags: Vec<u8>,
}

impl TestRead {
    pub fn new(name: &str, ref_id: i32, pos: i32, cigar: &str) -> Self {
        Self {
            name: name.to_string(),
            ref_id,
            pos,
            cigar: cigar.to_string(),
            flags: 0,
            mapq: 60,
            with_quality: true,
            mate: None,
            tags: Vec::new(),
        }
    }

    pub fn without_quality(mut self) -> Self {
        self.with_quality = false;
        self
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_mate(mut self, ref_id: i32, pos: i32) -> Self {
        self.mate = Some((ref_id, pos));
        self
    }

    /// Append an integer tag (`c` type when it fits, else `i`).
    pub fn with_int_tag(mut self, tag: &[u8; 2], value: i32) -> Self {
        self.tags.extend_from_slice(tag);
        if let Ok(small) = i8::try_from(value) {
            self.tags.push(b'c');
            self.tags.push(small as u8);
        } else {
            self.tags.push(b'i');
            self.tags.extend_from_slice(&value.to_le_bytes());
        }
        self
    }

    /// Bases covered on the reference.
    pub fn ref_len(&self) -> i64 {
        parse_cigar_string(&self.cigar)
            .iter()
            .filter(|(_, op)| matches!(op, b'M' | b'D' | b'N' | b'=' | b'X'))
            .map(|(len, _)| i64::from(*len))
            .sum()
    }

    /// Bases stored in the record.
    pub fn read_len(&self) -> usize {
        parse_cigar_string(&self.cigar)
            .iter()
            .filter(|(_, op)| matches!(op, b'M' | b'I' | b'S' | b'=' | b'X'))
            .map(|(len, _)| *len as usize)
            .sum()
    }

    /// Exclusive reference end.
    pub fn end(&self) -> i64 {
        i64::from(self.pos) + self.ref_len()
    }

    /// Deterministic bases derived from the position.
    pub fn sequence(&self) -> Vec<u8> {
        (0..self.read_len())
            .map(|i| b"ACGTN"[(self.pos as usize + i * 7) % 5])
            .collect()
    }

    pub fn quality(&self) -> Option<Vec<u8>> {
        self.with_quality
            .then(|| (0..self.read_len()).map(|i| 20 + (i % 20) as u8).collect())
    }

    /// Full record bytes, `block_size` prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let cigar = parse_cigar_string(&self.cigar);
        let sequence = self.sequence();
        let (mate_ref, mate_pos) = self.mate.unwrap_or((-1, -1));
        let bin = region_to_bin(self.pos as u32, self.end() as u32);

        let mut body = Vec::new();
        body.extend_from_slice(&self.ref_id.to_le_bytes());
        body.extend_from_slice(&self.pos.to_le_bytes());
        body.push(self.name.len() as u8 + 1);
        body.push(self.mapq);
        body.extend_from_slice(&(bin as u16).to_le_bytes());
        body.extend_from_slice(&(cigar.len() as u16).to_le_bytes());
        body.extend_from_slice(&self.flags.to_le_bytes());
        body.extend_from_slice(&(sequence.len() as i32).to_le_bytes());
        body.extend_from_slice(&mate_ref.to_le_bytes());
        body.extend_from_slice(&mate_pos.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(self.name.as_bytes());
        body.push(0);

        for (length, op) in &cigar {
            let code = CIGAR_CODES.iter().position(|c| c == op).unwrap() as u32;
            body.extend_from_slice(&((length << 4) | code).to_le_bytes());
        }

        for pair in sequence.chunks(2) {
            let code = |base: u8| SEQ_CODES.iter().position(|&c| c == base).unwrap() as u8;
            let high = code(pair[0]);
            let low = pair.get(1).map_or(0, |&b| code(b));
            body.push((high << 4) | low);
        }

        match self.quality() {
            Some(quality) => body.extend_from_slice(&quality),
            None => body.extend(std::iter::repeat(0xFF).take(sequence.len())),
        }
        body.extend_from_slice(&self.tags);

        let mut record = (body.len() as i32).to_le_bytes().to_vec();
        record.extend_from_slice(&body);
        record
    }
}

/// A BAM file, its BAI index and the reads written into them.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub bam: Vec<u8>,
    pub bai: Vec<u8>,
    pub references: Vec<(String, u32)>,
    pub reads: Vec<TestRead>,
}

impl Fixture {
    /// Fetcher serving the fixture at [`BAM_PATH`] / [`BAI_PATH`].
    pub fn fetcher(&self) -> MemoryFetcher {
        MemoryFetcher::new()
            .with(BAM_PATH, self.bam.clone())
            .with(BAI_PATH, self.bai.clone())
    }

    /// Reads strictly overlapping `[start, end)`, in (start, name) order.
    ///
    /// Reads that only touch a boundary may or may not be reported, depending
    /// on which chunks the index selects.
    pub fn overlapping(&self, ref_id: i32, start: u32, end: u32) -> Vec<String> {
        let mut hits: Vec<&TestRead> = self
            .reads
            .iter()
            .filter(|r| r.ref_id == ref_id)
            .filter(|r| i64::from(r.pos) < i64::from(end) && r.end() > i64::from(start))
            .collect();
        hits.sort_by(|a, b| a.pos.cmp(&b.pos).then_with(|| a.name.cmp(&b.name)));
        hits.into_iter().map(|r| r.name.clone()).collect()
    }

    pub fn read(&self, name: &str) -> &TestRead {
        self.reads.iter().find(|r| r.name == name).unwrap()
    }
}

/// Builds a coordinate-sorted BAM and a matching BAI.
pub struct FixtureBuilder {
    references: Vec<(String, u32)>,
    reads: Vec<TestRead>,
    records_per_block: usize,
    overlapping_chunks: bool,
    next_block_ends: bool,
}

impl FixtureBuilder {
    pub fn new(references: &[(&str, u32)]) -> Self {
        Self {
            references: references
                .iter()
                .map(|(name, length)| ((*name).to_string(), *length))
                .collect(),
            reads: Vec::new(),
            records_per_block: 4,
            overlapping_chunks: false,
            next_block_ends: false,
        }
    }

    pub fn read(mut self, read: TestRead) -> Self {
        self.reads.push(read);
        self
    }

    pub fn reads(mut self, reads: impl IntoIterator<Item = TestRead>) -> Self {
        self.reads.extend(reads);
        self
    }

    pub fn records_per_block(mut self, n: usize) -> Self {
        self.records_per_block = n.max(1);
        self
    }

    /// Also list one chunk covering every record of a reference under bin 0,
    /// so chunk lists overlap the way real multi-bin indexes do.
    pub fn overlapping_chunks(mut self) -> Self {
        self.overlapping_chunks = true;
        self
    }

    /// End the last record of each block at offset 0 of the following block,
    /// as htslib writes it.
    pub fn next_block_ends(mut self) -> Self {
        self.next_block_ends = true;
        self
    }

    pub fn build(mut self) -> Fixture {
        self.reads.sort_by_key(|r| (r.ref_id, r.pos));

        let text = "@HD\tVN:1.6\tSO:coordinate\n";
        let mut bam = bgzf_block(&bam_header(text, &self.references));

        // (start, end) virtual offsets per read, in sorted order
        let mut offsets = Vec::with_capacity(self.reads.len());
        for group in self.reads.chunks(self.records_per_block) {
            let block_start = bam.len() as u64;
            let mut data = Vec::new();
            for read in group {
                let begin = VirtualOffset::new(block_start, data.len() as u16);
                data.extend_from_slice(&read.encode());
                let end = VirtualOffset::new(block_start, data.len() as u16);
                offsets.push((begin, end));
            }
            bam.extend_from_slice(&bgzf_block(&data));
            if self.next_block_ends {
                if let Some(last) = offsets.last_mut() {
                    last.1 = VirtualOffset::new(bam.len() as u64, 0);
                }
            }
        }
        bam.extend_from_slice(&bgzf_block(&[]));

        let bai = self.build_index(&offsets);
        Fixture {
            bam,
            bai,
            references: self.references,
            reads: self.reads,
        }
    }

    fn build_index(&self, offsets: &[(VirtualOffset, VirtualOffset)]) -> Vec<u8> {
        let mut data = b"BAI\x01".to_vec();
        data.extend_from_slice(&(self.references.len() as i32).to_le_bytes());

        for ref_id in 0..self.references.len() as i32 {
            let mut bins: BTreeMap<u32, Vec<(VirtualOffset, VirtualOffset)>> = BTreeMap::new();
            let mut intervals: Vec<Option<VirtualOffset>> = Vec::new();
            let mut last_bin = None;
            let mut span: Option<(VirtualOffset, VirtualOffset)> = None;
            let mut mapped = 0u64;

            for (read, &(begin, end)) in self.reads.iter().zip(offsets) {
                if read.ref_id != ref_id {
                    continue;
                }
                mapped += 1;
                span = Some(span.map_or((begin, end), |(first, _)| (first, end)));

                let bin = region_to_bin(read.pos as u32, read.end() as u32);
                let chunks = bins.entry(bin).or_default();
                match chunks.last_mut() {
                    Some(last) if last_bin == Some(bin) && last.1 == begin => last.1 = end,
                    _ => chunks.push((begin, end)),
                }
                last_bin = Some(bin);

                let first_window = (read.pos >> 14) as usize;
                let last_window = ((read.end() - 1).max(i64::from(read.pos)) >> 14) as usize;
                if intervals.len() <= last_window {
                    intervals.resize(last_window + 1, None);
                }
                for slot in &mut intervals[first_window..=last_window] {
                    if slot.is_none() {
                        *slot = Some(begin);
                    }
                }
            }

            if self.overlapping_chunks {
                if let Some(whole) = span {
                    bins.entry(0).or_default().push(whole);
                }
            }
            if let Some((first, last)) = span {
                bins.insert(
                    METADATA_BIN,
                    vec![
                        (first, last),
                        (VirtualOffset::from_raw(mapped), VirtualOffset::from_raw(0)),
                    ],
                );
            }

            data.extend_from_slice(&(bins.len() as i32).to_le_bytes());
            for (bin, chunks) in &bins {
                data.extend_from_slice(&bin.to_le_bytes());
                data.extend_from_slice(&(chunks.len() as i32).to_le_bytes());
                for (begin, end) in chunks {
                    data.extend_from_slice(&begin.as_raw().to_le_bytes());
                    data.extend_from_slice(&end.as_raw().to_le_bytes());
                }
            }

            // Empty windows inherit the previous floor
            let mut previous = VirtualOffset::from_raw(0);
            data.extend_from_slice(&(intervals.len() as i32).to_le_bytes());
            for slot in &intervals {
                let offset = slot.unwrap_or(previous);
                data.extend_from_slice(&offset.as_raw().to_le_bytes());
                previous = offset;
            }
        }

        data.extend_from_slice(&0u64.to_le_bytes());
        data
    }
}

/// Pseudo-random reads spread over the given references.
pub fn scattered_reads(ref_lengths: &[u32], count: usize, seed: u64) -> Vec<TestRead> {
    let cigars = ["50M", "20M5I25M", "10S40M", "30M100N20M", "25M3D25M", "8M2I8M", "101M"];
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        state >> 33
    };

    (0..count)
        .map(|i| {
            let ref_id = (next() % ref_lengths.len() as u64) as usize;
            let pos = (next() % u64::from(ref_lengths[ref_id] - 200)) as i32;
            let cigar = cigars[(next() % cigars.len() as u64) as usize];
            TestRead::new(&format!("read{:05}", i), ref_id as i32, pos, cigar)
        })
        .collect()
}

/// A recorded call to [`CountingFetcher::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub path: String,
    pub range: ByteRange,
}

/// Fetcher that records calls and can inject failures.
pub struct CountingFetcher {
    inner: MemoryFetcher,
    calls: Mutex<Vec<FetchCall>>,
    failures: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl CountingFetcher {
    pub fn new(inner: MemoryFetcher) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    /// Sleep before every fetch, widening race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `times` fetches of `path`.
    pub fn fail_next(&self, path: &str, times: usize) {
        self.failures.lock().unwrap().insert(path.to_string(), times);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls().iter().filter(|c| c.path == path).count()
    }
}

impl RangeFetcher for CountingFetcher {
    fn fetch(&self, path: &str, range: ByteRange) -> Result<Bytes> {
        self.calls.lock().unwrap().push(FetchCall {
            path: path.to_string(),
            range,
        });
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(path) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BamError::Fetch {
                        path: path.to_string(),
                        message: "injected failure".to_string(),
                    });
                }
            }
        }

        self.inner.fetch(path, range)
    }

    fn content_length(&self, path: &str) -> Result<Option<u64>> {
        self.inner.content_length(path)
    }
}
