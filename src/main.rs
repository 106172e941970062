use bampile::bam::{BamError, BamReader};
use bampile::cursor::{AlignmentCursor, CursorOptions, SearchMode};
use bampile::index::{RangeIndex, MAX_LEVEL, MIN_LEVEL};
use bampile::pileup::{PileupAccumulator, PileupOptions, PileupSink, PileupStat, PositionCounts};
use bampile::seqidx::SequenceIndex;
use clap::Parser;
use log::{info, warn};
use rayon::ThreadPoolBuilder;
use regex::Regex;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::Path;

/// Common options shared between all commands
#[derive(Parser, Debug)]
struct CommonOpts {
    /// Path to the BAM file. If specified without an index, the tool will look for or generate an associated index file.
    #[clap(short = 'b', long, value_parser)]
    bam_file: String,

    /// Force the regeneration of the index, even if it already exists.
    #[clap(short = 'I', long, action)]
    force_reindex: bool,

    /// Number of threads for parallel processing.
    #[clap(short = 't', long, value_parser, default_value_t = NonZeroUsize::new(num_cpus::get().max(1)).unwrap())]
    num_threads: NonZeroUsize,

    /// Verbosity level (0 = error, 1 = info, 2 = debug)
    #[clap(short, long, default_value = "0")]
    verbose: u8,
}

/// Command-line tool for indexed range queries and pileups over BAM files.
#[derive(Parser, Debug)]
#[command(author, version, about, disable_help_subcommand = true)]
enum Args {
    /// List alignment records overlapping a target range
    Query {
        #[clap(flatten)]
        common: CommonOpts,

        /// Target range in the format `seq_name:start-end`
        #[clap(short = 'r', long, value_parser)]
        target_range: String,

        /// Match records by start position instead of by overlap
        #[clap(long, action)]
        by_start: bool,

        /// Minimum mapping quality for a record to be reported
        #[clap(short = 'q', long, value_parser)]
        min_mapq: Option<u8>,

        /// Coarsest index level to visit (0 = whole-chromosome bins)
        #[clap(long, value_parser)]
        min_level: Option<u32>,

        /// Finest index level to visit (5 = 16 kbp bins)
        #[clap(long, value_parser)]
        max_level: Option<u32>,
    },
    /// Per-position coverage and base composition over a target range
    Pileup {
        #[clap(flatten)]
        common: CommonOpts,

        /// Target range in the format `seq_name:start-end`
        #[clap(short = 'r', long, value_parser)]
        target_range: String,

        /// Count reference skips and long deletions as introns
        #[clap(long, action)]
        introns: bool,

        /// Deletions at least this long are reported as introns instead of gaps (requires --introns)
        #[clap(long, value_parser)]
        gap_intron_threshold: Option<u32>,

        /// Minimum mapping quality for a record to be counted
        #[clap(short = 'q', long, value_parser)]
        min_mapq: Option<u8>,
    },
    /// Index statistics per reference sequence
    Stats {
        #[clap(flatten)]
        common: CommonOpts,
    },
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    match args {
        Args::Query {
            common,
            target_range,
            by_start,
            min_mapq,
            min_level,
            max_level,
        } => {
            let (index, _seq_index) = initialize(&common)?;
            let (target_name, (start, end)) = parse_target_range(&target_range)?;

            let options = CursorOptions {
                mode: if by_start {
                    SearchMode::ByStart
                } else {
                    SearchMode::ByOverlap
                },
                min_mapq,
                min_level: min_level.unwrap_or(MIN_LEVEL),
                max_level: max_level.unwrap_or(MAX_LEVEL),
            };

            let reader = BamReader::open(&common.bam_file).map_err(to_io_error)?;
            let mut cursor =
                AlignmentCursor::by_name(reader, &index, &target_name, start, end, options, None)
                    .map_err(to_io_error)?;

            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            let mut count = 0u64;
            loop {
                let record = match cursor.advance().map_err(to_io_error)? {
                    Some(record) => record,
                    None => break,
                };
                let reference = cursor.reference_name_of(&record).map_err(to_io_error)?;
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    reference,
                    record.pos,
                    record.end_pos(),
                    record.name,
                    record.mapq,
                    bampile::cigar::to_string(&record.cigar),
                    record.flag,
                )?;
                count += 1;
            }
            out.flush()?;
            info!("Reported {} records for {}", count, target_range);
        }
        Args::Pileup {
            common,
            target_range,
            introns,
            gap_intron_threshold,
            min_mapq,
        } => {
            let (index, _seq_index) = initialize(&common)?;
            let (target_name, (start, end)) = parse_target_range(&target_range)?;

            let options = CursorOptions {
                mode: SearchMode::ByOverlap,
                min_mapq,
                ..Default::default()
            };
            let pileup_options = PileupOptions {
                count_introns: introns,
                gap_intron_threshold,
            };

            let reader = BamReader::open(&common.bam_file).map_err(to_io_error)?;
            let mut cursor =
                AlignmentCursor::by_name(reader, &index, &target_name, start, end, options, None)
                    .map_err(to_io_error)?;

            let stdout = io::stdout();
            let out = BufWriter::new(stdout.lock());
            let mut accumulator = PileupAccumulator::new(start, end);
            let mut sink = TsvSink::new(out, target_name, start, introns);

            loop {
                let record = match cursor.advance().map_err(to_io_error)? {
                    Some(record) => record,
                    None => break,
                };
                // No later record can start before this one, so everything
                // up to its start is final
                accumulator.advance_window(record.pos, &mut sink);
                accumulator.accumulate_record(&record, &pileup_options);
            }
            accumulator.finish(&mut sink);
            let mut out = sink.into_inner();
            out.flush()?;

            info!(
                "Pileup over {}: max coverage {}, max gap depth {}",
                target_range,
                accumulator.max_count(PileupStat::Match),
                accumulator.max_count(PileupStat::Gap)
            );
        }
        Args::Stats { common } => {
            let (index, seq_index) = initialize(&common)?;
            print_stats(&index, &seq_index);
        }
    }

    Ok(())
}

/// Initialize logging and the thread pool, then load or generate the index
/// based on common options
fn initialize(common: &CommonOpts) -> io::Result<(RangeIndex, SequenceIndex)> {
    env_logger::Builder::new()
        .filter_level(match common.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    ThreadPoolBuilder::new()
        .num_threads(common.num_threads.into())
        .build_global()
        .unwrap();

    if common.force_reindex {
        generate_index(&common.bam_file)
    } else {
        load_or_generate_index(&common.bam_file)
    }
}

fn load_or_generate_index(bam_file: &str) -> io::Result<(RangeIndex, SequenceIndex)> {
    let bai_file = format!("{}.bai", bam_file);
    let scan_file = format!("{}.bpr", bam_file);
    if Path::new(&bai_file).exists() {
        load_bai_index(bam_file, &bai_file)
    } else if Path::new(&scan_file).exists() {
        load_scan_index(bam_file, &scan_file)
    } else {
        generate_index(bam_file)
    }
}

fn load_bai_index(bam_file: &str, bai_file: &str) -> io::Result<(RangeIndex, SequenceIndex)> {
    warn_if_older(bam_file, bai_file);

    let reader = BamReader::open(bam_file).map_err(to_io_error)?;
    let seq_index = SequenceIndex::from_references(reader.references());

    let file = File::open(bai_file)?;
    let mut reader = BufReader::new(file);
    let index = RangeIndex::from_bai(&mut reader).map_err(to_io_error)?;

    if index.num_references() != seq_index.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Index describes {} references but the alignment file declares {}",
                index.num_references(),
                seq_index.len()
            ),
        ));
    }

    info!("Loaded index {}", bai_file);
    Ok((index, seq_index))
}

fn load_scan_index(bam_file: &str, scan_file: &str) -> io::Result<(RangeIndex, SequenceIndex)> {
    warn_if_older(bam_file, scan_file);

    let file = File::open(scan_file)?;
    let mut reader = BufReader::new(file);
    let (index, seq_index) = RangeIndex::load(&mut reader).map_err(to_io_error)?;

    // The persisted dictionary must still match the alignment file
    let bam_reader = BamReader::open(bam_file).map_err(to_io_error)?;
    let mismatch = bam_reader.references().len() != seq_index.len()
        || bam_reader
            .references()
            .iter()
            .enumerate()
            .any(|(id, r)| seq_index.get_name(id as u32) != Some(r.name.as_str()));
    if mismatch {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Reference dictionary in {} no longer matches {}; rerun with --force-reindex",
                scan_file, bam_file
            ),
        ));
    }

    info!("Loaded index {}", scan_file);
    Ok((index, seq_index))
}

fn generate_index(bam_file: &str) -> io::Result<(RangeIndex, SequenceIndex)> {
    let mut reader = BamReader::open(bam_file).map_err(to_io_error)?;
    let seq_index = SequenceIndex::from_references(reader.references());
    let index = RangeIndex::build_from_scan(&mut reader).map_err(to_io_error)?;

    let scan_file = format!("{}.bpr", bam_file);
    let file = File::create(&scan_file)?;
    let mut writer = BufWriter::new(file);
    index
        .save(&seq_index, &mut writer)
        .map_err(to_io_error)?;
    info!("Wrote index {}", scan_file);

    Ok((index, seq_index))
}

fn warn_if_older(bam_file: &str, index_file: &str) {
    let timestamps = (
        std::fs::metadata(bam_file).and_then(|m| m.modified()),
        std::fs::metadata(index_file).and_then(|m| m.modified()),
    );
    match timestamps {
        (Ok(bam_ts), Ok(index_ts)) => {
            if bam_ts > index_ts {
                warn!("WARNING:\tBAM file has been modified since index creation.");
            }
        }
        _ => {
            warn!("WARNING:\tUnable to compare timestamps of BAM file and index file. BAM file may have been modified since index creation.");
        }
    }
}

fn parse_target_range(target_range: &str) -> io::Result<(String, (i32, i32))> {
    let range_re = Regex::new(r"^(?P<name>.+):(?P<start>\d+)-(?P<end>\d+)$").unwrap();
    let captures = range_re.captures(target_range).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "Target range format should be `seq_name:start-end`",
        )
    })?;

    let start = captures["start"]
        .parse::<i32>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid start value"))?;
    let end = captures["end"]
        .parse::<i32>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid end value"))?;

    if start >= end {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Start value must be less than end value",
        ));
    }

    Ok((captures["name"].to_string(), (start, end)))
}

fn print_stats(index: &RangeIndex, seq_index: &SequenceIndex) {
    let mut entries: Vec<(&str, u32, u32)> = seq_index
        .iter()
        .map(|(id, name, length)| (name, id, length))
        .collect();
    entries.sort_by(|a, b| natord::compare(a.0, b.0));

    println!("reference\tlength\tbins\tchunks");
    let mut total_bins = 0;
    let mut total_chunks = 0;
    for (name, id, length) in entries {
        let (bins, chunks) = index
            .reference(id)
            .map(|r| (r.num_bins(), r.num_chunks()))
            .unwrap_or((0, 0));
        total_bins += bins;
        total_chunks += chunks;
        println!("{}\t{}\t{}\t{}", name, length, bins, chunks);
    }
    println!("total\t-\t{}\t{}", total_bins, total_chunks);
    if let Some(unplaced) = index.num_unplaced() {
        println!("unplaced records\t{}", unplaced);
    }
}

fn to_io_error(e: BamError) -> io::Error {
    match e {
        BamError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

/// Writes one tab-separated line per flushed position.
struct TsvSink<W: Write> {
    out: W,
    reference: String,
    pos: i32,
    show_introns: bool,
}

impl<W: Write> TsvSink<W> {
    fn new(out: W, reference: String, start: i32, show_introns: bool) -> Self {
        TsvSink {
            out,
            reference,
            pos: start,
            show_introns,
        }
    }

    fn write_row(&mut self, counts: &PositionCounts) {
        if self.show_introns {
            writeln!(
                self.out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                self.reference,
                self.pos,
                counts.a,
                counts.c,
                counts.g,
                counts.t,
                counts.matches,
                counts.gaps,
                counts.introns,
            )
            .unwrap();
        } else {
            writeln!(
                self.out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                self.reference,
                self.pos,
                counts.a,
                counts.c,
                counts.g,
                counts.t,
                counts.matches,
                counts.gaps,
            )
            .unwrap();
        }
        self.pos += 1;
    }

    fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> PileupSink for TsvSink<W> {
    fn push_zeros(&mut self, n: usize) {
        for _ in 0..n {
            self.write_row(&PositionCounts::ZERO);
        }
    }

    fn push_block(&mut self, counts: &[PositionCounts]) {
        for c in counts {
            self.write_row(c);
        }
    }

    fn push_tail(&mut self, counts: &[PositionCounts]) {
        for c in counts {
            self.write_row(c);
        }
    }
}
