//! Synthetic alignment-file builders shared by the unit tests.

use crate::cigar::CigarOp;

const SEQ_NUC: &[u8; 16] = b"=ACMGRSVTWYHKDBN";

fn nuc_code(base: u8) -> u8 {
    SEQ_NUC.iter().position(|&b| b == base).unwrap() as u8
}

/// Assemble one record block (without the leading block size).
pub fn encode_block(
    ref_id: i32,
    pos: i32,
    mapq: u8,
    flag: u16,
    name: &str,
    cigar: &[(u32, char)],
    seq: &[u8],
    aux: &[u8],
) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&ref_id.to_le_bytes());
    data.extend_from_slice(&pos.to_le_bytes());
    data.push((name.len() + 1) as u8);
    data.push(mapq);
    data.extend_from_slice(&0u16.to_le_bytes()); // bin, unused by the decoder
    data.extend_from_slice(&(cigar.len() as u16).to_le_bytes());
    data.extend_from_slice(&flag.to_le_bytes());
    data.extend_from_slice(&(seq.len() as i32).to_le_bytes());
    data.extend_from_slice(&(-1i32).to_le_bytes()); // next_ref_id
    data.extend_from_slice(&(-1i32).to_le_bytes()); // next_pos
    data.extend_from_slice(&0i32.to_le_bytes()); // tlen
    data.extend_from_slice(name.as_bytes());
    data.push(0);
    for &(len, op) in cigar {
        data.extend_from_slice(&CigarOp::new(len, op).raw().to_le_bytes());
    }
    // 4-bit packed sequence, high nibble first
    let mut i = 0;
    while i < seq.len() {
        let hi = nuc_code(seq[i]);
        let lo = if i + 1 < seq.len() {
            nuc_code(seq[i + 1])
        } else {
            0
        };
        data.push((hi << 4) | lo);
        i += 2;
    }
    data.extend(vec![0x20u8; seq.len()]); // qualities
    data.extend_from_slice(aux);
    data
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
    let block = encode_block(ref_id, pos, mapq, flag, name, cigar, seq, &[]);
    let mut data = Vec::with_capacity(block.len() + 4);
    data.extend_from_slice(&(block.len() as i32).to_le_bytes());
    data.extend_from_slice(&block);
    data
}

/// A whole uncompressed BAM byte stream: magic, header, reference
/// dictionary, then the given records.
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
