// lib.rs
pub mod bam;
pub mod cigar;
pub mod cursor;
pub mod index;
pub mod pileup;
pub mod seqidx;

#[cfg(test)]
mod testutil;
