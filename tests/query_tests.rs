//! Integration tests for region queries
//!
//! These tests build small BAM/BAI pairs in memory and check that queries:
//! - return every read overlapping the region, and nothing off-target
//! - decode fields (CIGAR blocks, sequence, quality, mate, tags) correctly
//! - handle unknown references and empty regions without errors

mod common;

use bamrange::io::bam::{GapType, TagValue};
use bamrange::{
    AlignmentSink, BamError, IndexedBamReader, MemoryFetcher, ReaderOptions, Record,
};
use common::{scattered_reads, CountingFetcher, Fixture, FixtureBuilder, TestRead, BAI_PATH, BAM_PATH};
use std::collections::HashSet;

const GENOME: &[(&str, u32)] = &[("chr1", 249_250_621), ("chr2", 243_199_373)];

fn names(records: &[Record]) -> Vec<String> {
    records.iter().map(|r| r.name.clone()).collect()
}

fn reader(fixture: &Fixture) -> IndexedBamReader<MemoryFetcher> {
    IndexedBamReader::new(fixture.fetcher(), BAM_PATH)
}

fn scattered_fixture() -> Fixture {
    FixtureBuilder::new(&[
        ("chr1", 200_000),
        ("chr2", 150_000),
        ("chr3", 100_000),
        ("chrM", 16_569),
    ])
    .reads(scattered_reads(&[200_000, 150_000, 100_000], 300, 42))
    .records_per_block(5)
    .build()
}

#[test]
fn test_record_found_on_its_reference_only() {
    let fixture = FixtureBuilder::new(GENOME)
        .read(TestRead::new("r1", 0, 1500, "10M"))
        .build();
    let reader = reader(&fixture);

    let chr1 = reader.query("chr1", 1000, 2000).unwrap();
    assert_eq!(names(chr1.records()), vec!["r1"]);
    let record = &chr1.records()[0];
    assert_eq!(record.reference_id, Some(0));
    assert_eq!(record.start, 1500);
    assert_eq!(record.length_on_ref, 10);

    let chr2 = reader.query("chr2", 1000, 2000).unwrap();
    assert!(chr2.is_empty());
    assert!(chr2.is_finished());
}

#[test]
fn test_cigar_blocks_and_insertions() {
    let fixture = FixtureBuilder::new(GENOME)
        .read(TestRead::new("spliced", 0, 100, "5S10M2I8M3D5M"))
        .build();
    let reader = reader(&fixture);

    let result = reader.query("chr1", 90, 200).unwrap();
    assert_eq!(result.len(), 1);
    let record = &result.records()[0];
    assert_eq!(record.cigar_string(), "5S10M2I8M3D5M");
    assert_eq!(record.length_on_ref, 26);

    let spans: Vec<(i64, u32)> = record.blocks.iter().map(|b| (b.start, b.len)).collect();
    assert_eq!(spans, vec![(100, 10), (110, 8), (121, 5)]);
    assert_eq!(record.blocks[0].gap, GapType::SoftClip);
    assert_eq!(record.blocks[0].read_offset, 5);
    assert_eq!(record.blocks[2].gap, GapType::Deletion);

    assert_eq!(record.insertions.len(), 1);
    assert_eq!(record.insertions[0].start, 110);
    assert_eq!(record.insertions[0].len, 2);
    assert_eq!(record.insertions[0].read_offset, 15);

    let sequence = fixture.read("spliced").sequence();
    assert_eq!(record.sequence, sequence);
    assert_eq!(record.blocks[1].seq, sequence[17..25].to_vec());
    assert_eq!(record.insertions[0].seq, sequence[15..17].to_vec());
}

#[test]
fn test_sequence_and_quality_decoding() {
    let fixture = FixtureBuilder::new(GENOME)
        .read(TestRead::new("odd", 0, 500, "7M"))
        .read(TestRead::new("noqual", 0, 600, "12M").without_quality())
        .build();
    let reader = reader(&fixture);

    let result = reader.query("chr1", 0, 1000).unwrap();
    assert_eq!(names(result.records()), vec!["odd", "noqual"]);

    let odd = &result.records()[0];
    assert_eq!(odd.sequence.len(), 7);
    assert_eq!(odd.sequence, fixture.read("odd").sequence());
    assert_eq!(odd.quality, fixture.read("odd").quality());

    let noqual = &result.records()[1];
    assert_eq!(noqual.sequence.len(), 12);
    assert_eq!(noqual.quality, None);
    assert!(noqual.blocks.iter().all(|b| b.qual.is_none()));
}

#[test]
fn test_flags_mate_and_tags() {
    let fixture = FixtureBuilder::new(GENOME)
        .read(
            TestRead::new("pair/1", 0, 1000, "50M")
                .with_flags(0x1 | 0x2 | 0x10 | 0x40)
                .with_mate(1, 5000)
                .with_int_tag(b"NM", 3)
                .with_int_tag(b"AS", 1200),
        )
        .build();
    let reader = reader(&fixture);

    let result = reader.query("chr1", 1000, 1050).unwrap();
    let record = &result.records()[0];
    assert!(record.is_paired());
    assert!(record.is_proper_pair());
    assert!(record.is_first_of_pair());
    assert!(!record.is_second_of_pair());
    assert!(!record.strand());
    assert!(record.mate_strand());
    assert!(!record.is_duplicate());
    assert_eq!(record.mapq, Some(60));

    let mate = record.mate.as_ref().unwrap();
    assert_eq!(mate.reference_id, 1);
    assert_eq!(mate.reference_name.as_deref(), Some("chr2"));
    assert_eq!(mate.position, 5000);

    assert_eq!(record.tags.get(b"NM").unwrap(), Some(TagValue::Int(3)));
    assert_eq!(record.tags.get(b"AS").unwrap(), Some(TagValue::Int(1200)));
    assert_eq!(record.tags.get(b"XS").unwrap(), None);
}

#[test]
fn test_scattered_queries_return_overlapping_reads() {
    let fixture = scattered_fixture();
    let reader = reader(&fixture);

    let queries = [
        ("chr1", 0, 200_000),
        ("chr1", 10_000, 12_000),
        ("chr1", 16_000, 16_500),
        ("chr1", 65_530, 65_540),
        ("chr2", 16_000, 50_000),
        ("chr2", 131_000, 131_100),
        ("chr3", 99_000, 100_000),
        ("chr3", 1, 2),
    ];

    for (chr, start, end) in queries {
        let ref_id = fixture.references.iter().position(|(n, _)| n == chr).unwrap();
        let result = reader.query(chr, start, end).unwrap();

        for record in result.records() {
            assert_eq!(record.reference_id, Some(ref_id), "{}:{}-{}", chr, start, end);
            assert!(record.end() >= i64::from(start), "{} ends before {}", record.name, start);
            assert!(record.start <= i64::from(end), "{} starts after {}", record.name, end);
        }

        let returned: HashSet<String> = names(result.records()).into_iter().collect();
        assert_eq!(returned.len(), result.len(), "duplicates in {}:{}-{}", chr, start, end);
        for name in fixture.overlapping(ref_id as i32, start, end) {
            assert!(returned.contains(&name), "{} missing from {}:{}-{}", name, chr, start, end);
        }
    }
}

#[test]
fn test_whole_reference_query_is_exact() {
    let fixture = scattered_fixture();
    let reader = reader(&fixture);

    let result = reader.query("chr2", 0, 150_000).unwrap();
    assert_eq!(names(result.records()), fixture.overlapping(1, 0, 150_000));

    let positions: Vec<i64> = result.records().iter().map(|r| r.start).collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted);
}

#[test]
fn test_region_without_chunks_is_empty() {
    let fixture = scattered_fixture();
    let reader = reader(&fixture);

    let result = reader.query("chrM", 0, 16_569).unwrap();
    assert!(result.is_empty());
    assert!(result.is_finished());
    assert_eq!(result.chr(), "chrM");
}

#[test]
fn test_unknown_reference_issues_no_chunk_fetch() {
    let fixture = scattered_fixture();
    let reader = IndexedBamReader::new(CountingFetcher::new(fixture.fetcher()), BAM_PATH);

    reader.query("chr1", 0, 1000).unwrap();
    let before = reader.fetcher().calls().len();

    let result = reader.query("chrUn_random", 0, 1000).unwrap();
    assert!(result.is_empty());
    assert!(result.is_finished());
    assert_eq!(reader.fetcher().calls().len(), before);
}

#[test]
fn test_unknown_reference_on_fresh_reader_fetches_no_chunks() {
    let fixture = scattered_fixture();
    let reader = IndexedBamReader::new(CountingFetcher::new(fixture.fetcher()), BAM_PATH);

    let result = reader.query("chr99", 0, 1000).unwrap();
    assert!(result.is_empty());
    // Index plus header, nothing else
    assert_eq!(reader.fetcher().count(BAI_PATH), 1);
    assert_eq!(reader.fetcher().count(BAM_PATH), 1);
}

#[test]
fn test_decoding_is_repeatable() {
    let fixture = scattered_fixture();
    let reader = reader(&fixture);

    let first = reader.query("chr1", 50_000, 120_000).unwrap();
    let second = reader.query("chr1", 50_000, 120_000).unwrap();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn test_naive_chunks_duplicate_merged_chunks_do_not() {
    let fixture = FixtureBuilder::new(&[("chr1", 100_000)])
        .reads(scattered_reads(&[100_000], 60, 7))
        .records_per_block(3)
        .overlapping_chunks()
        .build();
    let expected = fixture.overlapping(0, 0, 100_000);

    let merged = reader(&fixture).query("chr1", 0, 100_000).unwrap();
    assert_eq!(names(merged.records()), expected);

    let naive = IndexedBamReader::with_options(
        fixture.fetcher(),
        BAM_PATH,
        ReaderOptions::default().with_merge_chunks(false),
    )
    .query("chr1", 0, 100_000)
    .unwrap();
    assert!(naive.len() > merged.len());

    let unique: HashSet<String> = names(naive.records()).into_iter().collect();
    assert_eq!(unique, expected.into_iter().collect::<HashSet<_>>());
}

#[test]
fn test_name_normalizer() {
    let fixture = FixtureBuilder::new(&[("1", 1_000_000), ("2", 1_000_000)])
        .read(TestRead::new("a", 0, 100, "20M"))
        .read(TestRead::new("b", 1, 100, "20M").with_mate(0, 300))
        .build();

    let options = ReaderOptions::default().with_name_normalizer(|name: &str| {
        if name.starts_with("chr") {
            name.to_string()
        } else {
            format!("chr{}", name)
        }
    });
    let reader = IndexedBamReader::with_options(fixture.fetcher(), BAM_PATH, options);

    assert_eq!(names(reader.query("chr1", 0, 1000).unwrap().records()), vec!["a"]);
    assert_eq!(names(reader.query("2", 0, 1000).unwrap().records()), vec!["b"]);

    let table = reader.reference_table().unwrap();
    assert_eq!(table.reference_name(1), Some("chr2"));
    assert_eq!(table.references()[1].raw_name, "2");

    let b = reader.query("chr2", 0, 1000).unwrap();
    assert_eq!(b.records()[0].mate.as_ref().unwrap().reference_name.as_deref(), Some("chr1"));
}

#[test]
fn test_custom_sink() {
    struct Counting {
        pushed: usize,
        finished: usize,
    }

    impl AlignmentSink for Counting {
        fn push(&mut self, _record: Record) {
            self.pushed += 1;
        }

        fn finish(&mut self) {
            self.finished += 1;
        }
    }

    let fixture = scattered_fixture();
    let reader = reader(&fixture);

    let sink = reader
        .query_into("chr3", 0, 100_000, Counting { pushed: 0, finished: 0 })
        .unwrap();
    assert_eq!(sink.pushed, fixture.overlapping(2, 0, 100_000).len());
    assert_eq!(sink.finished, 1);

    let records = reader.query_into("chr3", 0, 100_000, Vec::new()).unwrap();
    assert_eq!(records.len(), sink.pushed);
}

#[test]
fn test_invalid_range() {
    let fixture = scattered_fixture();
    let reader = reader(&fixture);

    let err = reader.query("chr1", 2000, 1000).unwrap_err();
    assert!(matches!(err, BamError::InvalidRange(_)));
    assert!(!err.is_format_error());
    assert!(!err.is_fetch_error());
}

#[test]
fn test_explicit_index_path() {
    let fixture = scattered_fixture();
    let fetcher = MemoryFetcher::new()
        .with(BAM_PATH, fixture.bam.clone())
        .with("indexes/other.bai", fixture.bai.clone());

    let reader = IndexedBamReader::with_options(
        fetcher,
        BAM_PATH,
        ReaderOptions::default().with_index_path("indexes/other.bai"),
    );
    let result = reader.query("chr2", 0, 150_000).unwrap();
    assert_eq!(result.len(), fixture.overlapping(1, 0, 150_000).len());
}

#[test]
fn test_index_metadata() {
    let fixture = scattered_fixture();
    let reader = reader(&fixture);

    let index = reader.index().unwrap();
    assert_eq!(index.reference_count(), 4);
    assert_eq!(index.n_no_coor, Some(0));

    let chr1_reads = fixture.reads.iter().filter(|r| r.ref_id == 0).count() as u64;
    let metadata = index.reference(0).unwrap().metadata.as_ref().unwrap();
    assert_eq!(metadata.n_mapped, chr1_reads);
    assert!(index.reference(3).unwrap().metadata.is_none());
}

#[test]
fn test_chunk_end_at_start_of_next_block() {
    let fixture = FixtureBuilder::new(&[("chr1", 200_000), ("chr2", 150_000)])
        .reads(scattered_reads(&[200_000, 150_000], 150, 31))
        .records_per_block(7)
        .next_block_ends()
        .build();

    let result = reader(&fixture).query("chr1", 0, 200_000).unwrap();
    assert_eq!(names(result.records()), fixture.overlapping(0, 0, 200_000));

    // Without the EOF marker the last chunk ends exactly at the end of the file
    let mut bam = fixture.bam.clone();
    bam.truncate(bam.len() - common::bgzf_block(&[]).len());
    let fetcher = MemoryFetcher::new()
        .with(BAM_PATH, bam)
        .with(BAI_PATH, fixture.bai.clone());
    let reader = IndexedBamReader::new(CountingFetcher::new(fetcher), BAM_PATH);

    let result = reader.query("chr2", 0, 150_000).unwrap();
    assert_eq!(names(result.records()), fixture.overlapping(1, 0, 150_000));
}
