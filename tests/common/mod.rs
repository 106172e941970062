//! Synthetic BAM fixtures for the integration tests.

use bampile::cigar::CigarOp;
use std::fs::File;
use std::io::Write;
use std::path::Path;

const SEQ_NUC: &[u8; 16] = b"=ACMGRSVTWYHKDBN";

fn nuc_code(base: u8) -> u8 {
    SEQ_NUC.iter().position(|&b| b == base).unwrap() as u8
}

/// One record with its block-size prefix, ready to append to a stream.
pub fn encode_record(
    ref_id: i32,
    pos: i32,
    mapq: u8,
    flag: u16,
    name: &str,
    cigar: &[(u32, char)],
    seq: &[u8],
) -> Vec<u8> {
    let mut block = Vec::new();
    block.extend_from_slice(&ref_id.to_le_bytes());
    block.extend_from_slice(&pos.to_le_bytes());
    block.push((name.len() + 1) as u8);
    block.push(mapq);
    block.extend_from_slice(&0u16.to_le_bytes()); // bin, unused by the decoder
    block.extend_from_slice(&(cigar.len() as u16).to_le_bytes());
    block.extend_from_slice(&flag.to_le_bytes());
    block.extend_from_slice(&(seq.len() as i32).to_le_bytes());
    block.extend_from_slice(&(-1i32).to_le_bytes()); // next_ref_id
    block.extend_from_slice(&(-1i32).to_le_bytes()); // next_pos
    block.extend_from_slice(&0i32.to_le_bytes()); // tlen
    block.extend_from_slice(name.as_bytes());
    block.push(0);
    for &(len, op) in cigar {
        block.extend_from_slice(&CigarOp::new(len, op).raw().to_le_bytes());
    }
    let mut i = 0;
    while i < seq.len() {
        let hi = nuc_code(seq[i]);
        let lo = if i + 1 < seq.len() {
            nuc_code(seq[i + 1])
        } else {
            0
        };
        block.push((hi << 4) | lo);
        i += 2;
    }
    block.extend(vec![0x20u8; seq.len()]); // qualities

    let mut data = Vec::with_capacity(block.len() + 4);
    data.extend_from_slice(&(block.len() as i32).to_le_bytes());
    data.extend_from_slice(&block);
    data
}

/// A whole uncompressed BAM byte stream.
pub fn encode_bam(refs: &[(&str, u32)], records: &[Vec<u8>]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(b"BAM\x01");
    data.extend_from_slice(&0i32.to_le_bytes()); // no SAM text
    data.extend_from_slice(&(refs.len() as i32).to_le_bytes());
    for &(name, length) in refs {
        data.extend_from_slice(&((name.len() + 1) as i32).to_le_bytes());
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        data.extend_from_slice(&(length as i32).to_le_bytes());
    }
    for record in records {
        data.extend_from_slice(record);
    }
    data
}

/// Write an uncompressed BAM file.
pub fn write_plain_bam(path: &Path, refs: &[(&str, u32)], records: &[Vec<u8>]) {
    let mut file = File::create(path).unwrap();
    file.write_all(&encode_bam(refs, records)).unwrap();
}

/// Write a BGZF-compressed BAM file.
pub fn write_bgzf_bam(path: &Path, refs: &[(&str, u32)], records: &[Vec<u8>]) {
    let file = File::create(path).unwrap();
    let mut writer = noodles::bgzf::io::Writer::new(file);
    writer.write_all(&encode_bam(refs, records)).unwrap();
    // The single-threaded writer appends the EOF block on drop
    writer.flush().unwrap();
}
