//! Lazy cursor over the alignment records of one query window.
//!
//! A cursor pulls candidate byte ranges from the range index, decodes
//! records sequentially inside them, and yields only records passing the
//! search-mode filter. It owns its reader (and therefore its decode
//! buffers), so any number of cursors can run against the same immutable
//! index concurrently.

use crate::bam::{BamError, BamReader, BamRecord};
use crate::index::{Chunk, RangeIndex, MAX_LEVEL, MIN_LEVEL};
use log::debug;

/// How records are matched against the query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Yield records whose reference interval intersects the window.
    ByOverlap,
    /// Yield only records starting inside the window. Cheaper: no span
    /// computation is needed to decide membership.
    ByStart,
}

/// Pluggable identifier canonicalization. Unmappable names pass through
/// unchanged unless the cursor was built in strict mode.
pub trait IdMapper {
    fn map(&self, raw: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Positioned,
    Iterating,
    Exhausted,
}

/// Filters and index bounds for one query.
#[derive(Clone, Copy)]
pub struct CursorOptions {
    pub mode: SearchMode,
    pub min_mapq: Option<u8>,
    pub min_level: u32,
    pub max_level: u32,
}

impl Default for CursorOptions {
    fn default() -> Self {
        CursorOptions {
            mode: SearchMode::ByOverlap,
            min_mapq: None,
            min_level: MIN_LEVEL,
            max_level: MAX_LEVEL,
        }
    }
}

pub struct AlignmentCursor<'a> {
    reader: BamReader,
    ref_id: u32,
    start: i32,
    end: i32,
    options: CursorOptions,
    chunks: Vec<Chunk>,
    chunk_idx: usize,
    chunk_end: u64,
    state: CursorState,
    id_mapper: Option<&'a dyn IdMapper>,
    strict_ids: bool,
}

impl<'a> AlignmentCursor<'a> {
    /// Position a cursor over `[start, end)` on `ref_id`. The index lookup
    /// happens here; decoding starts on the first `advance`.
    pub fn new(
        reader: BamReader,
        index: &RangeIndex,
        ref_id: u32,
        start: i32,
        end: i32,
        options: CursorOptions,
    ) -> Self {
        let chunks = index.query(ref_id, start, end, options.min_level, options.max_level);
        debug!(
            "Cursor positioned on {}:{}-{} with {} candidate ranges",
            ref_id,
            start,
            end,
            chunks.len()
        );
        AlignmentCursor {
            reader,
            ref_id,
            start,
            end,
            options,
            chunks,
            chunk_idx: 0,
            chunk_end: 0,
            state: CursorState::Positioned,
            id_mapper: None,
            strict_ids: false,
        }
    }

    /// Position by reference name instead of id; fails with
    /// `UnknownReference` when the header has no such sequence. The mapper,
    /// if any, is consulted first so queries can use canonical names.
    pub fn by_name(
        reader: BamReader,
        index: &RangeIndex,
        name: &str,
        start: i32,
        end: i32,
        options: CursorOptions,
        id_mapper: Option<&'a dyn IdMapper>,
    ) -> Result<Self, BamError> {
        let resolved = match id_mapper.and_then(|m| m.map(name)) {
            Some(mapped) => mapped,
            None => name.to_string(),
        };
        let ref_id = reader
            .references()
            .iter()
            .position(|r| r.name == resolved || r.name == name)
            .ok_or_else(|| BamError::UnknownReference(name.to_string()))?;
        let mut cursor = Self::new(reader, index, ref_id as u32, start, end, options);
        cursor.id_mapper = id_mapper;
        Ok(cursor)
    }

    /// Require every yielded record's reference name to be mappable.
    pub fn set_strict_ids(&mut self, strict: bool) {
        self.strict_ids = strict;
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted
    }

    /// Canonical name of the record's reference, via the injected mapper.
    /// Consulted per call, never cached. Without a mapper (or when the
    /// mapper has no answer) the raw header name passes through.
    pub fn reference_name_of(&self, record: &BamRecord) -> Result<String, BamError> {
        let raw = self
            .reader
            .references()
            .get(record.ref_id as usize)
            .map(|r| r.name.as_str())
            .ok_or_else(|| BamError::UnknownReference(format!("id {}", record.ref_id)))?;
        match self.id_mapper.and_then(|m| m.map(raw)) {
            Some(mapped) => Ok(mapped),
            None if self.strict_ids && self.id_mapper.is_some() => {
                Err(BamError::UnknownReference(raw.to_string()))
            }
            None => Ok(raw.to_string()),
        }
    }

    /// Reference interval end used for overlap checks; a record that spans
    /// nothing still occupies its start position.
    fn effective_end(record: &BamRecord) -> i32 {
        record.end_pos().max(record.pos + 1)
    }

    fn passes_filters(&self, record: &BamRecord) -> bool {
        if record.is_unmapped() {
            return false;
        }
        if let Some(floor) = self.options.min_mapq {
            if record.mapq < floor {
                return false;
            }
        }
        match self.options.mode {
            SearchMode::ByStart => record.pos >= self.start && record.pos < self.end,
            SearchMode::ByOverlap => {
                record.pos < self.end && Self::effective_end(record) > self.start
            }
        }
    }

    /// Yield the next record passing all filters, or `None` once every
    /// candidate range is consumed. A decode error ends this cursor's
    /// sequence; previously yielded records stay valid and the shared index
    /// is untouched.
    pub fn advance(&mut self) -> Result<Option<BamRecord>, BamError> {
        loop {
            match self.state {
                CursorState::Exhausted => return Ok(None),
                CursorState::Positioned => {
                    if !self.enter_chunk()? {
                        return Ok(None);
                    }
                    self.state = CursorState::Iterating;
                }
                CursorState::Iterating => {}
            }

            if self.reader.offset() >= self.chunk_end {
                self.chunk_idx += 1;
                if !self.enter_chunk()? {
                    return Ok(None);
                }
            }

            let record = match self.reader.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    // The chunk promised more bytes than the file holds
                    self.state = CursorState::Exhausted;
                    if self.reader.offset() < self.chunk_end {
                        return Err(BamError::IndexInconsistency(format!(
                            "candidate range ends at {} but the file ends at {}",
                            self.chunk_end,
                            self.reader.offset()
                        )));
                    }
                    return Ok(None);
                }
                Err(e) => {
                    self.state = CursorState::Exhausted;
                    return Err(e);
                }
            };

            // Records are coordinate sorted: past the window (or past the
            // target reference) nothing further can match.
            if record.ref_id != self.ref_id as i32 {
                if record.ref_id < 0 || record.ref_id > self.ref_id as i32 {
                    self.state = CursorState::Exhausted;
                    return Ok(None);
                }
                continue;
            }
            if record.pos >= self.end {
                self.state = CursorState::Exhausted;
                return Ok(None);
            }

            if self.passes_filters(&record) {
                if self.strict_ids {
                    // Surface unmappable names now rather than on a later
                    // name lookup
                    self.reference_name_of(&record)?;
                }
                return Ok(Some(record));
            }
        }
    }

    /// Seek to the current chunk, exhausting the cursor when none remain.
    fn enter_chunk(&mut self) -> Result<bool, BamError> {
        match self.chunks.get(self.chunk_idx) {
            Some(chunk) => {
                self.reader.seek_to(chunk.start)?;
                self.chunk_end = chunk.end;
                Ok(true)
            }
            None => {
                self.state = CursorState::Exhausted;
                Ok(false)
            }
        }
    }
}

impl Iterator for AlignmentCursor<'_> {
    type Item = Result<BamRecord, BamError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}
