//! BAM container decoding: header, reference dictionary and alignment records.
//!
//! Supports both BGZF-compressed files (the normal case) and plain byte
//! streams. Record offsets are BGZF virtual positions for compressed files
//! and raw byte offsets for plain ones, so the same u64 offset model works
//! for both.

use crate::cigar::{self, CigarOp};
use log::debug;
use noodles::bgzf;
use std::fs::File;
use std::io::{BufReader, Error as IoError, Read, Seek, SeekFrom};
use std::path::Path;

const BAM_MAGIC: &[u8; 4] = b"BAM\x01";

/// 4-bit sequence codes as stored in BAM records.
const SEQ_NUC: &[u8; 16] = b"=ACMGRSVTWYHKDBN";

#[derive(Debug)]
pub enum BamError {
    Io(IoError),
    Format(String),
    TruncatedRecord(String),
    CorruptRecord(String),
    TagNotFound(String),
    TagType(String),
    IndexInconsistency(String),
    UnknownReference(String),
}

impl std::fmt::Display for BamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BamError::Io(e) => write!(f, "IO error: {}", e),
            BamError::Format(msg) => write!(f, "Invalid format: {}", msg),
            BamError::TruncatedRecord(msg) => write!(f, "Truncated record: {}", msg),
            BamError::CorruptRecord(msg) => write!(f, "Corrupt record: {}", msg),
            BamError::TagNotFound(tag) => write!(f, "Auxiliary tag not found: {}", tag),
            BamError::TagType(msg) => write!(f, "Auxiliary tag type mismatch: {}", msg),
            BamError::IndexInconsistency(msg) => write!(f, "Index inconsistency: {}", msg),
            BamError::UnknownReference(name) => write!(f, "Unknown reference: {}", name),
        }
    }
}

impl std::error::Error for BamError {}

impl From<IoError> for BamError {
    fn from(e: IoError) -> Self {
        BamError::Io(e)
    }
}

/// One entry of the reference dictionary. Length 0 is legal (unknown-length
/// contig) and is preserved as parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSequence {
    pub name: String,
    pub length: u32,
}

const BGZF_HEADER_SIZE: usize = 18;

/// Check whether a file starts with a valid BGZF header.
/// Returns `Ok(false)` for regular gzip, too-small files, or plain data.
fn is_bgzf<R: Read + Seek>(reader: &mut R) -> std::io::Result<bool> {
    let mut header = [0u8; BGZF_HEADER_SIZE];
    let result = match reader.read_exact(&mut header) {
        Ok(()) => {
            Ok(header[0..2] == [0x1f, 0x8b]      // gzip magic
                && header[2] == 0x08              // DEFLATE
                && header[3] == 0x04              // FEXTRA
                && header[10..12] == [0x06, 0x00] // XLEN=6
                && header[12..14] == [b'B', b'C'] // BC subfield
                && header[14..16] == [0x02, 0x00]) // SLEN=2
        }
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    };
    reader.seek(SeekFrom::Start(0))?;
    result
}

/// The underlying byte source: plain files track their own position so that
/// record offsets can be reported without an extra seek per read.
pub enum BamHandle {
    Plain { reader: BufReader<File>, pos: u64 },
    Compressed(bgzf::io::Reader<File>),
}

impl BamHandle {
    /// Offset of the next byte to be read: a raw byte offset for plain
    /// streams, a BGZF virtual position for compressed ones.
    pub fn offset(&self) -> u64 {
        match self {
            BamHandle::Plain { pos, .. } => *pos,
            BamHandle::Compressed(reader) => u64::from(reader.virtual_position()),
        }
    }

    /// Reposition to an offset previously reported by `offset()` or stored
    /// in an index chunk.
    pub fn seek_to(&mut self, offset: u64) -> std::io::Result<()> {
        match self {
            BamHandle::Plain { reader, pos } => {
                reader.seek(SeekFrom::Start(offset))?;
                *pos = offset;
                Ok(())
            }
            BamHandle::Compressed(reader) => {
                reader.seek(bgzf::VirtualPosition::from(offset)).map(|_| ())
            }
        }
    }
}

impl Read for BamHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            BamHandle::Plain { reader, pos } => {
                let n = reader.read(buf)?;
                *pos += n as u64;
                Ok(n)
            }
            BamHandle::Compressed(reader) => reader.read(buf),
        }
    }
}

/// Decoded alignment record. Owned by the iteration step that produced it;
/// the packed sequence is kept as stored and expanded on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct BamRecord {
    pub ref_id: i32,
    pub pos: i32,
    pub mapq: u8,
    pub bin: u16,
    pub flag: u16,
    pub next_ref_id: i32,
    pub next_pos: i32,
    pub tlen: i32,
    pub name: String,
    pub cigar: Vec<CigarOp>,
    seq: Vec<u8>,
    seq_len: usize,
    pub qual: Vec<u8>,
    aux: Vec<u8>,
}

/// A decoded auxiliary tag value. Integer widths (c/C/s/S/i/I) collapse to
/// i64; H hex strings are kept as text.
#[derive(Debug, Clone, PartialEq)]
pub enum Aux {
    Char(char),
    Int(i64),
    Float(f32),
    Text(String),
    Hex(String),
    IntArray(Vec<i64>),
    FloatArray(Vec<f32>),
}

impl BamRecord {
    pub const FLAG_PAIRED: u16 = 0x1;
    pub const FLAG_PROPER_PAIR: u16 = 0x2;
    pub const FLAG_UNMAPPED: u16 = 0x4;
    pub const FLAG_MATE_UNMAPPED: u16 = 0x8;
    pub const FLAG_REVERSE: u16 = 0x10;
    pub const FLAG_MATE_REVERSE: u16 = 0x20;
    pub const FLAG_FIRST_IN_PAIR: u16 = 0x40;
    pub const FLAG_SECOND_IN_PAIR: u16 = 0x80;
    pub const FLAG_SECONDARY: u16 = 0x100;
    pub const FLAG_QC_FAIL: u16 = 0x200;
    pub const FLAG_DUPLICATE: u16 = 0x400;
    pub const FLAG_SUPPLEMENTARY: u16 = 0x800;

    pub fn is_paired(&self) -> bool {
        self.flag & Self::FLAG_PAIRED != 0
    }

    pub fn is_unmapped(&self) -> bool {
        self.flag & Self::FLAG_UNMAPPED != 0 || self.ref_id < 0
    }

    pub fn is_reverse(&self) -> bool {
        self.flag & Self::FLAG_REVERSE != 0
    }

    pub fn is_first_in_pair(&self) -> bool {
        self.flag & Self::FLAG_FIRST_IN_PAIR != 0
    }

    pub fn is_second_in_pair(&self) -> bool {
        self.flag & Self::FLAG_SECOND_IN_PAIR != 0
    }

    pub fn is_secondary(&self) -> bool {
        self.flag & Self::FLAG_SECONDARY != 0
    }

    pub fn is_duplicate(&self) -> bool {
        self.flag & Self::FLAG_DUPLICATE != 0
    }

    pub fn is_supplementary(&self) -> bool {
        self.flag & Self::FLAG_SUPPLEMENTARY != 0
    }

    /// Number of reference positions covered by the alignment.
    pub fn reference_span(&self) -> u32 {
        cigar::reference_span(&self.cigar)
    }

    /// One past the last reference position covered: `pos + reference_span`.
    pub fn end_pos(&self) -> i32 {
        self.pos + self.reference_span() as i32
    }

    /// Read length as declared by the record.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Base at read offset `i` as an ASCII nucleotide (`N` family included).
    pub fn base(&self, i: usize) -> u8 {
        let byte = self.seq[i / 2];
        let code = if i % 2 == 0 { byte >> 4 } else { byte & 0xf };
        SEQ_NUC[code as usize]
    }

    /// Expand the 4-bit packed sequence into ASCII bases.
    pub fn decoded_seq(&self) -> Vec<u8> {
        (0..self.seq_len).map(|i| self.base(i)).collect()
    }

    /// Look up an auxiliary tag by its 2-character name. Tags are scanned on
    /// demand; the raw block is never decoded eagerly.
    pub fn aux(&self, tag: &[u8; 2]) -> Result<Aux, BamError> {
        let mut block = Block::new(&self.aux);
        while !block.is_done() {
            let name = [block.u8()?, block.u8()?];
            let type_code = block.u8()?;
            if &name == tag {
                return decode_aux_value(&mut block, type_code);
            }
            skip_aux_value(&mut block, type_code)?;
        }
        Err(BamError::TagNotFound(
            String::from_utf8_lossy(tag).into_owned(),
        ))
    }

    /// Integer value of a tag; `TagType` if the tag holds something else.
    pub fn aux_int(&self, tag: &[u8; 2]) -> Result<i64, BamError> {
        match self.aux(tag)? {
            Aux::Int(v) => Ok(v),
            other => Err(BamError::TagType(format!(
                "{}: expected integer, found {:?}",
                String::from_utf8_lossy(tag),
                other
            ))),
        }
    }

    /// Float value of a tag; `TagType` if the tag holds something else.
    pub fn aux_float(&self, tag: &[u8; 2]) -> Result<f32, BamError> {
        match self.aux(tag)? {
            Aux::Float(v) => Ok(v),
            other => Err(BamError::TagType(format!(
                "{}: expected float, found {:?}",
                String::from_utf8_lossy(tag),
                other
            ))),
        }
    }

    /// String value of a tag; `TagType` if the tag holds something else.
    pub fn aux_str(&self, tag: &[u8; 2]) -> Result<String, BamError> {
        match self.aux(tag)? {
            Aux::Text(v) => Ok(v),
            other => Err(BamError::TagType(format!(
                "{}: expected string, found {:?}",
                String::from_utf8_lossy(tag),
                other
            ))),
        }
    }
}

/// Bounds-checked cursor over one record block. Any read past the end means
/// the declared counts disagree with the declared block size.
struct Block<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Block<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], BamError> {
        if self.remaining() < n {
            return Err(BamError::CorruptRecord(format!(
                "need {} bytes at offset {}, {} remain in block",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, BamError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BamError> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, BamError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, BamError> {
        Ok(i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32, BamError> {
        Ok(f32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    /// Bytes up to and excluding the next NUL; consumes the NUL.
    fn cstr(&mut self) -> Result<&'a [u8], BamError> {
        let start = self.pos;
        while self.pos < self.data.len() {
            if self.data[self.pos] == 0 {
                let slice = &self.data[start..self.pos];
                self.pos += 1;
                return Ok(slice);
            }
            self.pos += 1;
        }
        Err(BamError::CorruptRecord(
            "unterminated string in record block".to_string(),
        ))
    }
}

fn decode_aux_value(block: &mut Block<'_>, type_code: u8) -> Result<Aux, BamError> {
    match type_code {
        b'A' => Ok(Aux::Char(block.u8()? as char)),
        b'c' => Ok(Aux::Int(block.u8()? as i8 as i64)),
        b'C' => Ok(Aux::Int(block.u8()? as i64)),
        b's' => Ok(Aux::Int(block.u16()? as i16 as i64)),
        b'S' => Ok(Aux::Int(block.u16()? as i64)),
        b'i' => Ok(Aux::Int(block.i32()? as i64)),
        b'I' => Ok(Aux::Int(block.u32()? as i64)),
        b'f' => Ok(Aux::Float(block.f32()?)),
        b'Z' => Ok(Aux::Text(
            String::from_utf8_lossy(block.cstr()?).into_owned(),
        )),
        b'H' => Ok(Aux::Hex(String::from_utf8_lossy(block.cstr()?).into_owned())),
        b'B' => {
            let subtype = block.u8()?;
            let count = block.i32()?;
            if count < 0 {
                return Err(BamError::CorruptRecord(format!(
                    "negative array tag count: {count}"
                )));
            }
            let count = count as usize;
            match subtype {
                b'c' => Ok(Aux::IntArray(
                    (0..count)
                        .map(|_| block.u8().map(|v| v as i8 as i64))
                        .collect::<Result<_, _>>()?,
                )),
                b'C' => Ok(Aux::IntArray(
                    (0..count)
                        .map(|_| block.u8().map(|v| v as i64))
                        .collect::<Result<_, _>>()?,
                )),
                b's' => Ok(Aux::IntArray(
                    (0..count)
                        .map(|_| block.u16().map(|v| v as i16 as i64))
                        .collect::<Result<_, _>>()?,
                )),
                b'S' => Ok(Aux::IntArray(
                    (0..count)
                        .map(|_| block.u16().map(|v| v as i64))
                        .collect::<Result<_, _>>()?,
                )),
                b'i' => Ok(Aux::IntArray(
                    (0..count)
                        .map(|_| block.i32().map(|v| v as i64))
                        .collect::<Result<_, _>>()?,
                )),
                b'I' => Ok(Aux::IntArray(
                    (0..count)
                        .map(|_| block.u32().map(|v| v as i64))
                        .collect::<Result<_, _>>()?,
                )),
                b'f' => Ok(Aux::FloatArray(
                    (0..count).map(|_| block.f32()).collect::<Result<_, _>>()?,
                )),
                other => Err(BamError::CorruptRecord(format!(
                    "unknown array tag subtype: {}",
                    other as char
                ))),
            }
        }
        other => Err(BamError::CorruptRecord(format!(
            "unknown tag type code: {}",
            other as char
        ))),
    }
}

fn skip_aux_value(block: &mut Block<'_>, type_code: u8) -> Result<(), BamError> {
    match type_code {
        b'A' | b'c' | b'C' => {
            block.bytes(1)?;
        }
        b's' | b'S' => {
            block.bytes(2)?;
        }
        b'i' | b'I' | b'f' => {
            block.bytes(4)?;
        }
        b'Z' | b'H' => {
            block.cstr()?;
        }
        b'B' => {
            let subtype = block.u8()?;
            let count = block.i32()?;
            if count < 0 {
                return Err(BamError::CorruptRecord(format!(
                    "negative array tag count: {count}"
                )));
            }
            let elem = match subtype {
                b'c' | b'C' => 1,
                b's' | b'S' => 2,
                b'i' | b'I' | b'f' => 4,
                other => {
                    return Err(BamError::CorruptRecord(format!(
                        "unknown array tag subtype: {}",
                        other as char
                    )))
                }
            };
            block.bytes(elem * count as usize)?;
        }
        other => {
            return Err(BamError::CorruptRecord(format!(
                "unknown tag type code: {}",
                other as char
            )))
        }
    }
    Ok(())
}

/// Parse one record from its block (the bytes following the block size).
/// All count fields are validated against the block bounds.
pub fn parse_record(data: &[u8]) -> Result<BamRecord, BamError> {
    let mut block = Block::new(data);

    let ref_id = block.i32()?;
    let pos = block.i32()?;
    let l_read_name = block.u8()? as usize;
    let mapq = block.u8()?;
    let bin = block.u16()?;
    let n_cigar_op = block.u16()? as usize;
    let flag = block.u16()?;
    let l_seq = block.i32()?;
    let next_ref_id = block.i32()?;
    let next_pos = block.i32()?;
    let tlen = block.i32()?;

    if l_read_name == 0 {
        return Err(BamError::CorruptRecord(
            "read name length must include the terminator".to_string(),
        ));
    }
    if l_seq < 0 {
        return Err(BamError::CorruptRecord(format!(
            "negative sequence length: {l_seq}"
        )));
    }
    let l_seq = l_seq as usize;

    let name_bytes = block.bytes(l_read_name)?;
    if name_bytes[l_read_name - 1] != 0 {
        return Err(BamError::CorruptRecord(
            "read name is not NUL-terminated".to_string(),
        ));
    }
    let name = std::str::from_utf8(&name_bytes[..l_read_name - 1])
        .map_err(|_| BamError::CorruptRecord("read name is not valid UTF-8".to_string()))?
        .to_string();

    let mut ops = Vec::with_capacity(n_cigar_op);
    for _ in 0..n_cigar_op {
        let raw = block.u32()?;
        let op = CigarOp::from_raw(raw).ok_or_else(|| {
            BamError::CorruptRecord(format!("invalid CIGAR operation code in {raw:#x}"))
        })?;
        ops.push(op);
    }

    let seq = block.bytes(l_seq.div_ceil(2))?.to_vec();
    let qual = block.bytes(l_seq)?.to_vec();
    let aux = block.bytes(block.remaining())?.to_vec();

    Ok(BamRecord {
        ref_id,
        pos,
        mapq,
        bin,
        flag,
        next_ref_id,
        next_pos,
        tlen,
        name,
        cigar: ops,
        seq,
        seq_len: l_seq,
        qual,
        aux,
    })
}

/// Streaming BAM reader: header parsed once at open, records decoded one at
/// a time into a reusable per-reader buffer.
pub struct BamReader {
    handle: BamHandle,
    header_text: String,
    references: Vec<ReferenceSequence>,
    block: Vec<u8>,
}

impl BamReader {
    /// Open a BAM file, autodetecting BGZF compression, and parse the header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BamError> {
        let mut file = File::open(path.as_ref())?;
        let handle = if is_bgzf(&mut file)? {
            BamHandle::Compressed(bgzf::io::Reader::new(file))
        } else {
            BamHandle::Plain {
                reader: BufReader::new(file),
                pos: 0,
            }
        };
        Self::from_handle(handle)
    }

    /// Construct from an already-positioned handle, reading the header.
    pub fn from_handle(mut handle: BamHandle) -> Result<Self, BamError> {
        let (header_text, references) = read_header(&mut handle)?;
        debug!(
            "Opened alignment file with {} reference sequences",
            references.len()
        );
        Ok(Self {
            handle,
            header_text,
            references,
            block: Vec::with_capacity(512),
        })
    }

    pub fn header_text(&self) -> &str {
        &self.header_text
    }

    pub fn references(&self) -> &[ReferenceSequence] {
        &self.references
    }

    /// Offset of the next record (virtual position or byte offset).
    pub fn offset(&self) -> u64 {
        self.handle.offset()
    }

    /// Reposition the reader at an offset obtained from `offset()` or from
    /// an index chunk. The next `read_record` decodes from there.
    pub fn seek_to(&mut self, offset: u64) -> Result<(), BamError> {
        self.handle.seek_to(offset)?;
        Ok(())
    }

    /// Decode the next record. `Ok(None)` at a clean end of stream; EOF
    /// inside a record is reported as `TruncatedRecord` since partial
    /// records must never be silently skipped.
    pub fn read_record(&mut self) -> Result<Option<BamRecord>, BamError> {
        let mut size_buf = [0u8; 4];
        match self.handle.read_exact(&mut size_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let block_size = i32::from_le_bytes(size_buf);
        if block_size < 0 {
            return Err(BamError::CorruptRecord(format!(
                "negative block size: {block_size}"
            )));
        }

        self.block.resize(block_size as usize, 0);
        self.handle.read_exact(&mut self.block).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                BamError::TruncatedRecord(format!(
                    "record declares {block_size} bytes but the stream ended early"
                ))
            } else {
                BamError::Io(e)
            }
        })?;

        parse_record(&self.block).map(Some)
    }
}

fn read_header(handle: &mut BamHandle) -> Result<(String, Vec<ReferenceSequence>), BamError> {
    let mut magic = [0u8; 4];
    handle
        .read_exact(&mut magic)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                BamError::Format("file too short for magic bytes".to_string())
            }
            _ => BamError::Io(e),
        })?;
    if &magic != BAM_MAGIC {
        return Err(BamError::Format(format!(
            "invalid magic bytes: {magic:?}"
        )));
    }

    let l_text = read_i32(handle)?;
    if l_text < 0 {
        return Err(BamError::Format(format!(
            "negative header text length: {l_text}"
        )));
    }
    let mut text = vec![0u8; l_text as usize];
    handle.read_exact(&mut text)?;
    let header_text = String::from_utf8_lossy(&text).into_owned();

    let n_ref = read_i32(handle)?;
    if n_ref < 0 {
        return Err(BamError::Format(format!(
            "negative reference count: {n_ref}"
        )));
    }

    let mut references = Vec::with_capacity(n_ref as usize);
    for _ in 0..n_ref {
        let l_name = read_i32(handle)?;
        if l_name <= 0 {
            return Err(BamError::Format(format!(
                "invalid reference name length: {l_name}"
            )));
        }
        let mut name_buf = vec![0u8; l_name as usize];
        handle.read_exact(&mut name_buf)?;
        if name_buf.pop() != Some(0) {
            return Err(BamError::Format(
                "reference name is not NUL-terminated".to_string(),
            ));
        }
        let name = String::from_utf8(name_buf)
            .map_err(|_| BamError::Format("reference name is not valid UTF-8".to_string()))?;

        let l_ref = read_i32(handle)?;
        if l_ref < 0 {
            return Err(BamError::Format(format!(
                "negative reference length: {l_ref}"
            )));
        }

        // l_ref == 0 is legal: an unknown-length contig
        references.push(ReferenceSequence {
            name,
            length: l_ref as u32,
        });
    }

    Ok((header_text, references))
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32, BamError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}
