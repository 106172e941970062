//! Hierarchical binned range index over alignment files.
//!
//! The binning scheme is the standard 6-level hierarchy over 512 Mbp: one
//! top bin, each level 8x finer, 37,450 bins total, plus a linear index of
//! the lowest record offset per 16 kbp window. An index is either parsed
//! from a persisted `.bai` file, loaded from this crate's own persisted
//! form, or rebuilt by a one-pass scan of the alignment file; all three
//! answer queries identically.

use crate::bam::{BamError, BamReader};
use crate::seqidx::SequenceIndex;
use log::debug;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

const BAI_MAGIC: &[u8; 4] = b"BAI\x01";
const SCAN_INDEX_MAGIC: &[u8; 8] = b"BPRIDX1\x00";

/// Right shift per level, coarsest first. Level 0 spans 512 Mbp, level 5
/// spans 16 kbp.
const LEVEL_SHIFTS: [u32; 6] = [29, 26, 23, 20, 17, 14];

/// First bin id of each level: offset(L) = ((1 << 3L) - 1) / 7.
const LEVEL_OFFSETS: [u32; 6] = [0, 1, 9, 73, 585, 4681];

pub const MIN_LEVEL: u32 = 0;
pub const MAX_LEVEL: u32 = 5;

/// Largest real bin id; the pseudo-bin right after it carries metadata in
/// persisted indexes and never describes positions.
const MAX_BIN: u32 = 37449;

const LINEAR_SHIFT: u32 = 14;

/// A contiguous byte range of the alignment file worth scanning for one or
/// more candidate records. Offsets are BGZF virtual positions for
/// compressed files, raw byte offsets for plain ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    pub fn new(start: u64, end: u64) -> Self {
        Chunk { start, end }
    }
}

/// Bins and linear index for one reference sequence.
#[derive(Default, Serialize, Deserialize)]
pub struct ReferenceIndex {
    bins: FxHashMap<u32, Vec<Chunk>>,
    linear: Vec<u64>,
}

impl ReferenceIndex {
    /// Lowest offset at which a record overlapping `start` or anything after
    /// it can begin, per the linear index. 0 when nothing is known.
    fn min_offset(&self, start: i32) -> u64 {
        if self.linear.is_empty() {
            return 0;
        }
        let window = (start.max(0) as usize) >> LINEAR_SHIFT;
        if window < self.linear.len() {
            self.linear[window]
        } else {
            *self.linear.last().unwrap()
        }
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn num_chunks(&self) -> usize {
        self.bins.values().map(|chunks| chunks.len()).sum()
    }
}

/// The immutable range index for a whole file: one `ReferenceIndex` per
/// reference, read-only after construction so concurrent queries need no
/// locking.
#[derive(Default, Serialize, Deserialize)]
pub struct RangeIndex {
    references: Vec<ReferenceIndex>,
    n_no_coor: Option<u64>,
}

/// Level of a bin id (0 = coarsest).
pub fn bin_level(bin: u32) -> u32 {
    for level in (0..LEVEL_OFFSETS.len()).rev() {
        if bin >= LEVEL_OFFSETS[level] {
            return level as u32;
        }
    }
    0
}

/// The smallest bin fully containing `[beg, end)`.
pub fn reg2bin(beg: i32, end: i32) -> u32 {
    let end = end - 1;
    for level in (MIN_LEVEL..=MAX_LEVEL).rev() {
        let shift = LEVEL_SHIFTS[level as usize];
        if beg >> shift == end >> shift {
            return LEVEL_OFFSETS[level as usize] + (beg >> shift) as u32;
        }
    }
    0
}

/// Bin ids of the given level whose interval overlaps `[beg, end)`.
fn bins_for_level(beg: i32, end: i32, level: u32) -> std::ops::RangeInclusive<u32> {
    let shift = LEVEL_SHIFTS[level as usize];
    let offset = LEVEL_OFFSETS[level as usize];
    let first = offset + (beg.max(0) >> shift) as u32;
    let last = offset + ((end - 1).max(0) >> shift) as u32;
    first..=last
}

/// The ancestor of `bin` (at `level`) at the coarser `ancestor_level`.
fn ancestor_at(bin: u32, level: u32, ancestor_level: u32) -> u32 {
    let rel = bin - LEVEL_OFFSETS[level as usize];
    LEVEL_OFFSETS[ancestor_level as usize] + (rel >> (3 * (level - ancestor_level)))
}

/// Merge chunks that overlap or touch, keeping them sorted by start. Shared
/// scan ranges collapse so a decompression boundary is never read twice.
fn merge_chunks(mut chunks: Vec<Chunk>) -> Vec<Chunk> {
    if chunks.is_empty() {
        return chunks;
    }
    chunks.sort_by_key(|c| c.start);

    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    let mut current = chunks[0];
    for chunk in chunks.into_iter().skip(1) {
        if chunk.start <= current.end {
            current.end = current.end.max(chunk.end);
        } else {
            merged.push(current);
            current = chunk;
        }
    }
    merged.push(current);
    merged
}

impl RangeIndex {
    pub fn num_references(&self) -> usize {
        self.references.len()
    }

    pub fn reference(&self, ref_id: u32) -> Option<&ReferenceIndex> {
        self.references.get(ref_id as usize)
    }

    /// Records without coordinates, when the persisted index carried the
    /// count.
    pub fn num_unplaced(&self) -> Option<u64> {
        self.n_no_coor
    }

    /// Candidate byte ranges for records overlapping `[start, end)` on
    /// `ref_id`, with the overlap test bounded to levels
    /// `min_level..=max_level`.
    ///
    /// Bins at a level within the bounds are tested against the window at
    /// their own granularity. Bins finer than `max_level` are still swept,
    /// through their ancestor bin at `max_level`: coarsening `max_level`
    /// therefore never loses a true overlap, it only admits more false
    /// positives (which the mandatory per-record overlap re-check filters
    /// out) in exchange for a coarser test. Bins coarser than `min_level`
    /// are skipped entirely, which drops the wide-spanning records stored
    /// there; that is the caller's bargain.
    ///
    /// The result is sorted by offset with adjacent/overlapping ranges
    /// merged, and is always a conservative superset: true overlap must be
    /// re-verified against each decoded record, because a record's
    /// reference span can cross a bin boundary.
    pub fn query(
        &self,
        ref_id: u32,
        start: i32,
        end: i32,
        min_level: u32,
        max_level: u32,
    ) -> Vec<Chunk> {
        let reference = match self.references.get(ref_id as usize) {
            Some(r) => r,
            None => return Vec::new(),
        };
        if start >= end || min_level > max_level {
            return Vec::new();
        }
        let max_level = max_level.min(MAX_LEVEL);

        let mut chunks = Vec::new();
        for (&bin, bin_chunks) in &reference.bins {
            let level = bin_level(bin);
            let include = if level < min_level {
                false
            } else if level <= max_level {
                bins_for_level(start, end, level).contains(&bin)
            } else {
                bins_for_level(start, end, max_level)
                    .contains(&ancestor_at(bin, level, max_level))
            };
            if include {
                chunks.extend_from_slice(bin_chunks);
            }
        }

        // The linear index is span-covering, so any record overlapping the
        // window starts at or after the floor, at every level bound
        let floor = reference.min_offset(start);
        chunks.retain(|chunk| chunk.end > floor);

        let merged = merge_chunks(chunks);
        debug!(
            "Index query {}:{}-{} levels {}..={} -> {} scan ranges",
            ref_id,
            start,
            end,
            min_level,
            max_level,
            merged.len()
        );
        merged
    }

    /// Parse a persisted `.bai` index.
    pub fn from_bai<R: Read>(reader: &mut R) -> Result<Self, BamError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != BAI_MAGIC {
            return Err(BamError::Format(format!(
                "invalid index magic bytes: {magic:?}"
            )));
        }

        let n_ref = read_i32(reader)?;
        if n_ref < 0 {
            return Err(BamError::IndexInconsistency(format!(
                "negative reference count: {n_ref}"
            )));
        }

        let mut references = Vec::with_capacity(n_ref as usize);
        for _ in 0..n_ref {
            references.push(Self::read_reference(reader)?);
        }

        // Trailing unplaced-record count is optional
        let n_no_coor = read_u64(reader).ok();

        Ok(RangeIndex {
            references,
            n_no_coor,
        })
    }

    fn read_reference<R: Read>(reader: &mut R) -> Result<ReferenceIndex, BamError> {
        let n_bin = read_i32(reader)?;
        if n_bin < 0 {
            return Err(BamError::IndexInconsistency(format!(
                "negative bin count: {n_bin}"
            )));
        }

        let mut bins: FxHashMap<u32, Vec<Chunk>> = FxHashMap::default();
        for _ in 0..n_bin {
            let bin = read_u32(reader)?;
            let n_chunk = read_i32(reader)?;
            if n_chunk < 0 {
                return Err(BamError::IndexInconsistency(format!(
                    "negative chunk count in bin {bin}: {n_chunk}"
                )));
            }
            let mut chunks = Vec::with_capacity(n_chunk as usize);
            for _ in 0..n_chunk {
                let start = read_u64(reader)?;
                let end = read_u64(reader)?;
                chunks.push(Chunk::new(start, end));
            }
            // The bin right past the last real one is a metadata pseudo-bin
            if bin <= MAX_BIN {
                bins.insert(bin, chunks);
            }
        }

        let n_intv = read_i32(reader)?;
        if n_intv < 0 {
            return Err(BamError::IndexInconsistency(format!(
                "negative interval count: {n_intv}"
            )));
        }
        let mut linear = Vec::with_capacity(n_intv as usize);
        for _ in 0..n_intv {
            linear.push(read_u64(reader)?);
        }

        Ok(ReferenceIndex { bins, linear })
    }

    /// Build the index by a one-pass scan of the alignment file, recording
    /// each mapped record's bin and `[start, end)` offsets. The reader must
    /// be positioned at the first record (fresh from `open`).
    pub fn build_from_scan(reader: &mut BamReader) -> Result<Self, BamError> {
        let n_ref = reader.references().len();
        let mut raw: Vec<(FxHashMap<u32, Vec<Chunk>>, Vec<u64>)> =
            (0..n_ref).map(|_| Default::default()).collect();
        let mut n_no_coor = 0u64;
        let mut n_records = 0u64;

        loop {
            let start_offset = reader.offset();
            let record = match reader.read_record()? {
                Some(record) => record,
                None => break,
            };
            let end_offset = reader.offset();
            n_records += 1;

            if record.is_unmapped() {
                n_no_coor += 1;
                continue;
            }
            let ref_id = record.ref_id as usize;
            if ref_id >= n_ref {
                return Err(BamError::IndexInconsistency(format!(
                    "record on reference {} but the header declares {}",
                    record.ref_id, n_ref
                )));
            }

            let beg = record.pos;
            let end = record.end_pos().max(beg + 1);
            let bin = reg2bin(beg, end);
            let (bins, linear) = &mut raw[ref_id];
            bins.entry(bin)
                .or_default()
                .push(Chunk::new(start_offset, end_offset));

            // Keep the lowest offset per 16 kbp window; offsets only grow
            // during the scan, so first write wins.
            let first_window = (beg >> LINEAR_SHIFT) as usize;
            let last_window = ((end - 1) >> LINEAR_SHIFT) as usize;
            if linear.len() <= last_window {
                linear.resize(last_window + 1, 0);
            }
            for window in linear.iter_mut().take(last_window + 1).skip(first_window) {
                if *window == 0 {
                    *window = start_offset;
                }
            }
        }

        // Consecutive records land in touching chunks; collapsing them per
        // bin keeps the index at its persisted-form size.
        let references: Vec<ReferenceIndex> = raw
            .into_par_iter()
            .map(|(bins, linear)| ReferenceIndex {
                bins: bins
                    .into_iter()
                    .map(|(bin, chunks)| (bin, merge_chunks(chunks)))
                    .collect(),
                linear,
            })
            .collect();

        debug!(
            "Scanned {} records into {} reference indexes ({} unplaced)",
            n_records, n_ref, n_no_coor
        );

        Ok(RangeIndex {
            references,
            n_no_coor: Some(n_no_coor),
        })
    }

    /// Persist a scan-built index together with the reference dictionary it
    /// was built against.
    pub fn save<W: Write>(
        &self,
        seq_index: &SequenceIndex,
        writer: &mut W,
    ) -> Result<(), BamError> {
        writer.write_all(SCAN_INDEX_MAGIC)?;
        let data = bincode::serde::encode_to_vec(
            (seq_index, &self.references, self.n_no_coor),
            bincode::config::standard(),
        )
        .map_err(|e| BamError::Format(format!("failed to encode index: {e:?}")))?;
        writer.write_all(&data)?;
        Ok(())
    }

    /// Load an index persisted by [`RangeIndex::save`], returning it with
    /// the reference dictionary it was built against so callers can check
    /// it still matches the alignment file.
    pub fn load<R: Read>(reader: &mut R) -> Result<(Self, SequenceIndex), BamError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != SCAN_INDEX_MAGIC {
            return Err(BamError::Format(format!(
                "invalid index magic bytes: {magic:?}"
            )));
        }
        let (seq_index, references, n_no_coor): (SequenceIndex, Vec<ReferenceIndex>, Option<u64>) =
            bincode::serde::decode_from_std_read(reader, bincode::config::standard())
                .map_err(|e| BamError::Format(format!("failed to decode index: {e:?}")))?;
        Ok((
            RangeIndex {
                references,
                n_no_coor,
            },
            seq_index,
        ))
    }
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32, BamError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, BamError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, BamError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
