//! End-to-end pileup: indexed cursor feeding the streaming accumulator.

mod common;

use bampile::bam::BamReader;
use bampile::cursor::{AlignmentCursor, CursorOptions};
use bampile::index::RangeIndex;
use bampile::pileup::{
    PileupAccumulator, PileupOptions, PileupSink, PileupStat, PositionCounts, FLUSH_QUANTUM,
};
use common::{encode_record, write_plain_bam};
use tempfile::TempDir;

#[derive(Default)]
struct CollectSink {
    counts: Vec<PositionCounts>,
}

impl PileupSink for CollectSink {
    fn push_zeros(&mut self, n: usize) {
        self.counts.extend(vec![PositionCounts::ZERO; n]);
    }

    fn push_block(&mut self, counts: &[PositionCounts]) {
        assert_eq!(counts.len(), FLUSH_QUANTUM);
        self.counts.extend_from_slice(counts);
    }

    fn push_tail(&mut self, counts: &[PositionCounts]) {
        assert!(!counts.is_empty() && counts.len() < FLUSH_QUANTUM);
        self.counts.extend_from_slice(counts);
    }
}

/// Run the full pipeline: index, cursor over `[start, end)`, accumulate,
/// flushing at each record start, and return the per-position counts.
fn pileup_over(
    bam: &std::path::Path,
    start: i32,
    end: i32,
    options: &PileupOptions,
) -> (Vec<PositionCounts>, PileupAccumulator) {
    let mut reader = BamReader::open(bam).unwrap();
    let index = RangeIndex::build_from_scan(&mut reader).unwrap();

    let mut cursor = AlignmentCursor::new(
        BamReader::open(bam).unwrap(),
        &index,
        0,
        start,
        end,
        CursorOptions::default(),
    );

    let mut accumulator = PileupAccumulator::new(start, end);
    let mut sink = CollectSink::default();
    while let Some(record) = cursor.advance().unwrap() {
        accumulator.advance_window(record.pos, &mut sink);
        accumulator.accumulate_record(&record, options);
    }
    accumulator.finish(&mut sink);
    assert_eq!(sink.counts.len(), (end - start) as usize);
    (sink.counts, accumulator)
}

#[test]
fn test_match_deletion_match_pipeline() {
    // 5M2D3M at position 0: reference span 10, read consumption 8, and the
    // deleted positions 5 and 6 show up as gaps, not matches
    let dir = TempDir::new().unwrap();
    let bam = dir.path().join("deletion.bam");
    write_plain_bam(
        &bam,
        &[("chr1", 100_000)],
        &[encode_record(
            0,
            0,
            60,
            0,
            "r1",
            &[(5, 'M'), (2, 'D'), (3, 'M')],
            b"ACGTACGT",
        )],
    );

    let (counts, _) = pileup_over(&bam, 0, 10, &PileupOptions::default());
    for (p, c) in counts.iter().enumerate() {
        let in_gap = (5..7).contains(&p);
        assert_eq!(c.matches, u32::from(!in_gap), "match count at {p}");
        assert_eq!(c.gaps, u32::from(in_gap), "gap count at {p}");
        assert_eq!(c.introns, 0);
    }
}

#[test]
fn test_overlapping_reads_stack() {
    let dir = TempDir::new().unwrap();
    let bam = dir.path().join("stack.bam");
    write_plain_bam(
        &bam,
        &[("chr1", 100_000)],
        &[
            encode_record(0, 100, 60, 0, "r1", &[(10, 'M')], b"AAAAAAAAAA"),
            encode_record(0, 105, 60, 0, "r2", &[(10, 'M')], b"CCCCCCCCCC"),
            encode_record(0, 105, 60, 0, "r3", &[(10, 'M')], b"CCCCCCCCCC"),
        ],
    );

    let (counts, accumulator) = pileup_over(&bam, 100, 120, &PileupOptions::default());
    // Depth profile: 1x over [100,105), 3x over [105,110), 2x over [110,115)
    for (i, expected) in [(0, 1u32), (5, 3), (10, 2), (15, 0)] {
        assert_eq!(counts[i as usize].matches, expected, "depth at offset {i}");
    }
    assert_eq!(counts[0].a, 1);
    assert_eq!(counts[5].a, 1);
    assert_eq!(counts[5].c, 2);
    assert_eq!(accumulator.max_count(PileupStat::Match), 3);
    assert_eq!(accumulator.max_count(PileupStat::C), 2);
}

#[test]
fn test_long_deletion_reported_as_intron_when_enabled() {
    let dir = TempDir::new().unwrap();
    let bam = dir.path().join("introns.bam");
    write_plain_bam(
        &bam,
        &[("chr1", 100_000)],
        &[encode_record(
            0,
            0,
            60,
            0,
            "r1",
            &[(5, 'M'), (50, 'D'), (5, 'M')],
            b"ACGTACGTAC",
        )],
    );

    // Threshold met: the deletion is an intron
    let (counts, _) = pileup_over(
        &bam,
        0,
        60,
        &PileupOptions {
            count_introns: true,
            gap_intron_threshold: Some(20),
        },
    );
    assert_eq!(counts[30].introns, 1);
    assert_eq!(counts[30].gaps, 0);

    // Intron mode off: the same deletion is a gap
    let (counts, _) = pileup_over(&bam, 0, 60, &PileupOptions::default());
    assert_eq!(counts[30].gaps, 1);
    assert_eq!(counts[30].introns, 0);
}

#[test]
fn test_spliced_read_skips_do_not_count_without_intron_mode() {
    let dir = TempDir::new().unwrap();
    let bam = dir.path().join("spliced.bam");
    write_plain_bam(
        &bam,
        &[("chr1", 100_000)],
        &[encode_record(
            0,
            10,
            60,
            0,
            "r1",
            &[(5, 'M'), (100, 'N'), (5, 'M')],
            b"ACGTACGTAC",
        )],
    );

    let (plain, _) = pileup_over(&bam, 0, 130, &PileupOptions::default());
    assert_eq!(plain[50].gaps, 0);
    assert_eq!(plain[50].introns, 0);
    assert_eq!(plain[12].matches, 1);
    assert_eq!(plain[117].matches, 1);

    let (spliced, _) = pileup_over(
        &bam,
        0,
        130,
        &PileupOptions {
            count_introns: true,
            gap_intron_threshold: None,
        },
    );
    assert_eq!(spliced[50].introns, 1);
    assert_eq!(spliced[50].gaps, 0);
}

#[test]
fn test_incremental_flush_equals_single_flush() {
    // Flushing at every record start must produce the same concatenated
    // array as accumulating everything and flushing once
    let dir = TempDir::new().unwrap();
    let bam = dir.path().join("flush.bam");
    let records: Vec<Vec<u8>> = (0..25)
        .map(|i| {
            encode_record(
                0,
                i * 13,
                60,
                0,
                &format!("r{i}"),
                &[(8, 'M'), (4, 'D'), (8, 'M')],
                b"ACGTACGTACGTACGT",
            )
        })
        .collect();
    write_plain_bam(&bam, &[("chr1", 100_000)], &records);

    let (incremental, _) = pileup_over(&bam, 0, 400, &PileupOptions::default());

    // Single flush at the end
    let mut reader = BamReader::open(&bam).unwrap();
    let index = RangeIndex::build_from_scan(&mut reader).unwrap();
    let mut cursor = AlignmentCursor::new(
        BamReader::open(&bam).unwrap(),
        &index,
        0,
        0,
        400,
        CursorOptions::default(),
    );
    let mut accumulator = PileupAccumulator::new(0, 400);
    let options = PileupOptions::default();
    while let Some(record) = cursor.advance().unwrap() {
        accumulator.accumulate_record(&record, &options);
    }
    let mut sink = CollectSink::default();
    accumulator.finish(&mut sink);

    assert_eq!(incremental, sink.counts);
}

#[test]
fn test_window_clamps_at_query_bounds() {
    // A read overlapping the window start contributes only its clamped part
    let dir = TempDir::new().unwrap();
    let bam = dir.path().join("clamp.bam");
    write_plain_bam(
        &bam,
        &[("chr1", 100_000)],
        &[encode_record(0, 90, 60, 0, "r1", &[(20, 'M')], b"AAAAAAAAAAAAAAAAAAAA")],
    );

    let (counts, _) = pileup_over(&bam, 100, 105, &PileupOptions::default());
    assert_eq!(counts.len(), 5);
    assert!(counts.iter().all(|c| c.matches == 1 && c.a == 1));

    let query_levels = pileup_over(&bam, 95, 100, &PileupOptions::default());
    assert!(query_levels.0.iter().all(|c| c.matches == 1));
}
