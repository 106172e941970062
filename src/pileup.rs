//! Streaming per-position coverage accumulation.
//!
//! The accumulator keeps counting arrays only for the sliding window between
//! the last flushed position and the highest position touched so far, so
//! memory stays bounded by read length plus flush cadence, never by contig
//! size. Per-base and generic-match counters are written per position;
//! gap and intron counters are boundary deltas (+1 at range start, -1 at
//! range end) that are prefix-summed only when positions are flushed, which
//! makes a range write O(1) no matter how long the deletion or skip is.

use crate::bam::BamRecord;
use log::debug;

/// Flush quantum: completed positions leave the accumulator in batches of
/// this many, with a single smaller tail batch per flush.
pub const FLUSH_QUANTUM: usize = 16;

/// Statistic kinds tracked per position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PileupStat {
    A,
    C,
    G,
    T,
    Match,
    Gap,
    Intron,
}

impl PileupStat {
    pub const ALL: [PileupStat; 7] = [
        PileupStat::A,
        PileupStat::C,
        PileupStat::G,
        PileupStat::T,
        PileupStat::Match,
        PileupStat::Gap,
        PileupStat::Intron,
    ];

    fn index(self) -> usize {
        match self {
            PileupStat::A => 0,
            PileupStat::C => 1,
            PileupStat::G => 2,
            PileupStat::T => 3,
            PileupStat::Match => 4,
            PileupStat::Gap => 5,
            PileupStat::Intron => 6,
        }
    }
}

/// Finalized counts for one reference position. Counts are unsigned;
/// overflow at unrealistic depths is not defended against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionCounts {
    pub a: u32,
    pub c: u32,
    pub g: u32,
    pub t: u32,
    pub matches: u32,
    pub gaps: u32,
    pub introns: u32,
}

impl PositionCounts {
    pub const ZERO: PositionCounts = PositionCounts {
        a: 0,
        c: 0,
        g: 0,
        t: 0,
        matches: 0,
        gaps: 0,
        introns: 0,
    };

    pub fn get(&self, stat: PileupStat) -> u32 {
        match stat {
            PileupStat::A => self.a,
            PileupStat::C => self.c,
            PileupStat::G => self.g,
            PileupStat::T => self.t,
            PileupStat::Match => self.matches,
            PileupStat::Gap => self.gaps,
            PileupStat::Intron => self.introns,
        }
    }
}

/// Receiver for flushed positions. Calls arrive in position order, never
/// overlapping, each position exactly once: whole stretches of untouched
/// positions through `push_zeros`, otherwise full quanta of
/// [`FLUSH_QUANTUM`] positions through `push_block` and one final shorter
/// remainder through `push_tail`.
pub trait PileupSink {
    fn push_zeros(&mut self, n: usize);
    fn push_block(&mut self, counts: &[PositionCounts]);
    fn push_tail(&mut self, counts: &[PositionCounts]);
}

/// How alignment records are decomposed into counter updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct PileupOptions {
    /// Count reference skips (and long deletions, see below) as introns.
    pub count_introns: bool,
    /// With intron counting on, a deletion at least this long is
    /// reclassified from gap to intron.
    pub gap_intron_threshold: Option<u32>,
}

pub struct PileupAccumulator {
    /// First position not yet flushed.
    ref_from: i32,
    /// One past the highest position touched so far; the arrays span
    /// `[ref_from, ref_to_open)`.
    ref_to_open: i32,
    /// Hard ceiling requested by the caller; nothing at or past it is
    /// counted or flushed.
    ref_stop: i32,
    a: Vec<u32>,
    c: Vec<u32>,
    g: Vec<u32>,
    t: Vec<u32>,
    matches: Vec<u32>,
    gap_delta: Vec<i32>,
    intron_delta: Vec<i32>,
    /// Running prefix values of the delta counters at `ref_from`, carried
    /// across flushes so later prefix sums continue where the last flush
    /// stopped.
    gap_carry: i32,
    intron_carry: i32,
    max_counts: [u32; 7],
}

impl PileupAccumulator {
    pub fn new(ref_from: i32, ref_stop: i32) -> Self {
        PileupAccumulator {
            ref_from,
            ref_to_open: ref_from,
            ref_stop,
            a: Vec::new(),
            c: Vec::new(),
            g: Vec::new(),
            t: Vec::new(),
            matches: Vec::new(),
            gap_delta: Vec::new(),
            intron_delta: Vec::new(),
            gap_carry: 0,
            intron_carry: 0,
            max_counts: [0; 7],
        }
    }

    /// Reinitialize for a new window, dropping all state including the
    /// per-statistic maxima.
    pub fn reset(&mut self, ref_from: i32, ref_stop: i32) {
        *self = PileupAccumulator::new(ref_from, ref_stop);
    }

    pub fn ref_from(&self) -> i32 {
        self.ref_from
    }

    pub fn ref_to_open(&self) -> i32 {
        self.ref_to_open
    }

    pub fn ref_stop(&self) -> i32 {
        self.ref_stop
    }

    /// Highest finalized value seen for `stat` since the last reset.
    /// Maintained while flushing, never by rescanning.
    pub fn max_count(&self, stat: PileupStat) -> u32 {
        self.max_counts[stat.index()]
    }

    /// Clamp `[ref_pos, ref_end)` to the live window. `None` when nothing
    /// remains: ranges wholly before `ref_from` belong to already-flushed
    /// positions and are dropped, which is sound because records arrive in
    /// non-decreasing start order.
    fn clamp(&self, ref_pos: i32, ref_end: i32) -> Option<(i32, i32)> {
        let s = ref_pos.max(self.ref_from);
        let e = ref_end.min(self.ref_stop);
        if s < e {
            Some((s, e))
        } else {
            None
        }
    }

    /// Grow the arrays so they cover positions up to `pos` (exclusive).
    fn grow_to(&mut self, pos: i32) {
        if pos > self.ref_to_open {
            let len = (pos - self.ref_from) as usize;
            self.a.resize(len, 0);
            self.c.resize(len, 0);
            self.g.resize(len, 0);
            self.t.resize(len, 0);
            self.matches.resize(len, 0);
            self.gap_delta.resize(len, 0);
            self.intron_delta.resize(len, 0);
            self.ref_to_open = pos;
        }
    }

    /// Count an aligned stretch into the generic match counter.
    pub fn add_match(&mut self, ref_pos: i32, ref_end: i32) {
        let Some((s, e)) = self.clamp(ref_pos, ref_end) else {
            return;
        };
        self.grow_to(e);
        let base = self.ref_from;
        for i in (s - base) as usize..(e - base) as usize {
            self.matches[i] += 1;
        }
    }

    /// Count the bases of an aligned stretch. `read_offset` is the read
    /// position corresponding to `ref_pos`; non-ACGT bases are skipped.
    pub fn add_bases(&mut self, ref_pos: i32, ref_end: i32, read_bases: &[u8], read_offset: usize) {
        let Some((s, e)) = self.clamp(ref_pos, ref_end) else {
            return;
        };
        self.grow_to(e);
        let base = self.ref_from;
        let read_skip = (s - ref_pos) as usize;
        for (k, i) in ((s - base) as usize..(e - base) as usize).enumerate() {
            match read_bases.get(read_offset + read_skip + k) {
                Some(b'A') => self.a[i] += 1,
                Some(b'C') => self.c[i] += 1,
                Some(b'G') => self.g[i] += 1,
                Some(b'T') => self.t[i] += 1,
                _ => {}
            }
        }
    }

    /// Count a deletion as a gap over `[ref_pos, ref_end)`. One boundary
    /// increment and one decrement, regardless of length; the counts become
    /// valid only at flush time.
    pub fn add_gap(&mut self, ref_pos: i32, ref_end: i32) {
        self.add_delta(ref_pos, ref_end, false);
    }

    /// Count a reference skip (or reclassified long deletion) as an intron.
    pub fn add_intron(&mut self, ref_pos: i32, ref_end: i32) {
        self.add_delta(ref_pos, ref_end, true);
    }

    fn add_delta(&mut self, ref_pos: i32, ref_end: i32, intron: bool) {
        let Some((s, e)) = self.clamp(ref_pos, ref_end) else {
            return;
        };
        // The decrement slot sits one past the covered range, so the arrays
        // must reach it; when the range runs into `ref_stop` the decrement
        // falls outside the window and is dropped, leaving the prefix sum
        // high through the remainder, which is what the truncated range
        // means.
        let decrement = e < self.ref_stop;
        self.grow_to(if decrement { e + 1 } else { e });
        let base = self.ref_from;
        let delta = if intron {
            &mut self.intron_delta
        } else {
            &mut self.gap_delta
        };
        delta[(s - base) as usize] += 1;
        if decrement {
            delta[(e - base) as usize] -= 1;
        }
    }

    /// Decompose one record into counter updates according to `options`.
    /// Callers must feed records in non-decreasing start order.
    pub fn accumulate_record(&mut self, record: &BamRecord, options: &PileupOptions) {
        let bases = record.decoded_seq();
        let mut ref_pos = record.pos;
        let mut read_offset = 0usize;

        for op in &record.cigar {
            let len = op.len() as i32;
            match op.op() {
                'M' | '=' | 'X' => {
                    self.add_bases(ref_pos, ref_pos + len, &bases, read_offset);
                    self.add_match(ref_pos, ref_pos + len);
                    ref_pos += len;
                    read_offset += len as usize;
                }
                'I' | 'S' => {
                    read_offset += len as usize;
                }
                'D' => {
                    let as_intron = options.count_introns
                        && options
                            .gap_intron_threshold
                            .is_some_and(|threshold| op.len() >= threshold);
                    if as_intron {
                        self.add_intron(ref_pos, ref_pos + len);
                    } else {
                        self.add_gap(ref_pos, ref_pos + len);
                    }
                    ref_pos += len;
                }
                'N' => {
                    if options.count_introns {
                        self.add_intron(ref_pos, ref_pos + len);
                    }
                    ref_pos += len;
                }
                // H and P consume neither read nor reference
                _ => {}
            }
        }
    }

    /// Flush finalized positions `[ref_from, target)` through the sink.
    /// The caller asserts safety: no record fed later may start before
    /// `target`. Delta counters are prefix-summed here, for exactly the
    /// flushed prefix, and the running values carry over to the next flush.
    pub fn advance_window<S: PileupSink>(&mut self, target: i32, sink: &mut S) {
        let target = target.min(self.ref_stop);
        if target <= self.ref_from {
            return;
        }
        let n = (target - self.ref_from) as usize;
        let touched = self.matches.len().min(n);

        if touched == 0 && self.gap_carry == 0 && self.intron_carry == 0 {
            // Nothing has reached these positions
            sink.push_zeros(n);
        } else {
            let mut buf: Vec<PositionCounts> = Vec::with_capacity(n);
            let mut gap_run = self.gap_carry;
            let mut intron_run = self.intron_carry;
            for i in 0..n {
                let counts = if i < touched {
                    gap_run += self.gap_delta[i];
                    intron_run += self.intron_delta[i];
                    PositionCounts {
                        a: self.a[i],
                        c: self.c[i],
                        g: self.g[i],
                        t: self.t[i],
                        matches: self.matches[i],
                        gaps: gap_run.max(0) as u32,
                        introns: intron_run.max(0) as u32,
                    }
                } else {
                    // Past the touched window only an unterminated delta
                    // range can contribute
                    PositionCounts {
                        gaps: gap_run.max(0) as u32,
                        introns: intron_run.max(0) as u32,
                        ..PositionCounts::ZERO
                    }
                };
                for stat in PileupStat::ALL {
                    let value = counts.get(stat);
                    if value > self.max_counts[stat.index()] {
                        self.max_counts[stat.index()] = value;
                    }
                }
                buf.push(counts);
            }
            self.gap_carry = gap_run;
            self.intron_carry = intron_run;

            let mut emitted = 0;
            while n - emitted >= FLUSH_QUANTUM {
                sink.push_block(&buf[emitted..emitted + FLUSH_QUANTUM]);
                emitted += FLUSH_QUANTUM;
            }
            if emitted < n {
                sink.push_tail(&buf[emitted..n]);
            }
        }

        // Slide the window
        if touched == self.matches.len() {
            self.a.clear();
            self.c.clear();
            self.g.clear();
            self.t.clear();
            self.matches.clear();
            self.gap_delta.clear();
            self.intron_delta.clear();
        } else {
            self.a.drain(..n);
            self.c.drain(..n);
            self.g.drain(..n);
            self.t.drain(..n);
            self.matches.drain(..n);
            self.gap_delta.drain(..n);
            self.intron_delta.drain(..n);
        }
        self.ref_from = target;
        if self.ref_to_open < target {
            self.ref_to_open = target;
        }
        debug!(
            "Flushed {} positions, window now {}..{}",
            n, self.ref_from, self.ref_to_open
        );
    }

    /// Flush everything up to the window ceiling.
    pub fn finish<S: PileupSink>(&mut self, sink: &mut S) {
        self.advance_window(self.ref_stop, sink);
    }
}
