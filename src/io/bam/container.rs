//! Destinations for query results.
//!
//! A query pushes every in-range record into an [`AlignmentSink`] exactly once
//! and then calls [`finish`](AlignmentSink::finish) exactly once. Records from
//! different chunks arrive in no particular order, so a sink must not assume
//! sorted input before `finish`.

use super::record::Record;

/// Receiver of the records produced by one query.
pub trait AlignmentSink {
    /// Accept one decoded record.
    fn push(&mut self, record: Record);

    /// Called once, after the last record of the query has been pushed.
    fn finish(&mut self);
}

impl AlignmentSink for Vec<Record> {
    fn push(&mut self, record: Record) {
        Vec::push(self, record);
    }

    fn finish(&mut self) {}
}

/// Default sink: the records of one region, sorted by position once finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentContainer {
    chr: String,
    start: u32,
    end: u32,
    records: Vec<Record>,
    finished: bool,
}

impl AlignmentContainer {
    /// Empty container for `chr:[start, end)`.
    pub fn new(chr: impl Into<String>, start: u32, end: u32) -> Self {
        Self {
            chr: chr.into(),
            start,
            end,
            records: Vec::new(),
            finished: false,
        }
    }

    /// Queried reference name.
    pub fn chr(&self) -> &str {
        &self.chr
    }

    /// Queried start (0-based, inclusive).
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Queried end (exclusive).
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Records held, sorted by (start, name) once finished.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Take the records out of the container.
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no record overlapped the region.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True once [`finish`](AlignmentSink::finish) has run.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl AlignmentSink for AlignmentContainer {
    fn push(&mut self, record: Record) {
        debug_assert!(!self.finished, "record pushed after finish");
        self.records.push(record);
    }

    fn finish(&mut self) {
        self.records
            .sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.name.cmp(&b.name)));
        self.finished = true;
    }
}
