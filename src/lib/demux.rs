//! H4 demultiplexing pipeline driver.
//!
//! Wires five input splitters, six barcode tables, the thread pool, and up
//! to two gzip writers into one streaming run:
//!
//! 1. Skip to the start of the configured record range.
//! 2. Read one block (default 10,000 records) from every input; blocks of
//!    unequal size abort the run.
//! 3. Submit the block set to the pool as a matching job; the pool's idle
//!    semaphore throttles the driver when all workers are busy.
//! 4. Drain finished jobs strictly in submission order and write output, so
//!    records leave in the exact order they were read even though matching
//!    is unordered across workers.
//!
//! The barcode layout in each read pair: R4 starts with a stagger run-in
//! whose table index shifts the A barcode; `R2.seq || R3.seq` carries the
//! D, B, A, and C barcodes (one skipped byte before B and before C); the
//! optional plate barcode sits at the start of I1.

use crate::barcode::BarcodeTable;
use crate::config::Config;
use crate::device::JobHandle;
use crate::errors::{Fqh4Error, Result};
use crate::gzip_writer::ParallelGzipWriter;
use crate::logging::{OperationTimer, format_count, format_percent};
use crate::matcher::{Match, MatchKind, min_edit_distance};
use crate::pool::ThreadPool;
use crate::splitter::{Block, FieldSplit, FieldSplitter};
use bstr::ByteSlice;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::available_parallelism;

/// Records per matching job.
const BLOCK_SIZE: usize = 10_000;

/// Stream order inside block sets.
const R1: usize = 0;
const R2: usize = 1;
const R3: usize = 2;
const R4: usize = 3;
const I1: usize = 4;

type ReadBlock = Block<FieldSplit<0b1111>>;
type Splitter = FieldSplitter<0b1111>;
type MatchedBlocks = (Vec<H4Match>, Vec<ReadBlock>);

/// Barcode tables for one run; shared read-only with the match workers.
struct Tables {
    a: BarcodeTable,
    b: BarcodeTable,
    c: BarcodeTable,
    d: BarcodeTable,
    stagger: BarcodeTable,
    plate: Option<BarcodeTable>,
}

/// Per-record match results for the dimensions the output needs.
///
/// The stagger match is consumed during matching (it only shifts the A
/// position), so it contributes to the quality flags but is not kept.
struct H4Match {
    a: Match,
    b: Match,
    c: Match,
    d: Match,
    p: Option<Match>,
    any_invalid: bool,
    any_unclear: bool,
}

/// Counters reported after a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DemuxSummary {
    /// Records processed.
    pub records: u64,
    /// Records with at least one `Invalid` dimension.
    pub any_invalid: u64,
    /// Records with at least one `Unclear` dimension.
    pub any_unclear: u64,
}

/// Slice of `data` at `[pos, pos + count)`, clamped to the available bytes.
fn clamped(data: &[u8], pos: usize, count: usize) -> &[u8] {
    let start = pos.min(data.len());
    let end = pos.saturating_add(count).min(data.len());
    &data[start..end]
}

/// Removes `n` bytes from the left, saturating.
fn clip_left(data: &[u8], n: usize) -> &[u8] {
    &data[n.min(data.len())..]
}

/// Matches every record of a block set against all barcode dimensions.
fn match_block(tables: &Tables, blocks: &[ReadBlock]) -> Vec<H4Match> {
    let scl = tables.stagger.max_code_length();
    let bcl = tables.b.max_code_length();
    let dcl = tables.d.max_code_length();
    let ccl = tables.c.max_code_length();

    let mut matches = Vec::with_capacity(blocks[R1].len());
    let mut rx = Vec::new();
    for i in 0..blocks[R1].len() {
        let s = min_edit_distance(clamped(blocks[R4].get(i).seq(), 0, scl), scl, &tables.stagger);
        // Entry order encodes the offset: entry 1 shifts by 0, entry 2 by 1.
        let sn = s.idx.saturating_sub(1);

        rx.clear();
        rx.extend_from_slice(blocks[R2].get(i).seq());
        rx.extend_from_slice(blocks[R3].get(i).seq());

        let d = min_edit_distance(clamped(&rx, 0, dcl), dcl, &tables.d);
        let b = min_edit_distance(clamped(&rx, dcl + 1, bcl), bcl, &tables.b);
        let acl = tables.a.min_code_length() + sn;
        let a = min_edit_distance(clamped(&rx, dcl + 1 + bcl, acl), acl, &tables.a);
        let c = min_edit_distance(clamped(&rx, dcl + 1 + bcl + acl + 1, ccl), ccl, &tables.c);
        let p = tables.plate.as_ref().map(|plate| {
            let pcl = plate.max_code_length();
            min_edit_distance(clamped(blocks[I1].get(i).seq(), 0, pcl), pcl, plate)
        });

        let mut any_invalid = false;
        let mut any_unclear = false;
        for m in [&s, &a, &b, &c, &d].into_iter().chain(p.as_ref()) {
            any_invalid |= m.kind == MatchKind::Invalid;
            any_unclear |= m.kind == MatchKind::Unclear;
        }
        matches.push(H4Match { a, b, c, d, p, any_invalid, any_unclear });
    }
    matches
}

fn put_both(
    r1_out: &mut Option<ParallelGzipWriter>,
    r2_out: &mut Option<ParallelGzipWriter>,
    data: &[u8],
) -> Result<()> {
    if let Some(writer) = r1_out {
        writer.put(data)?;
    }
    if let Some(writer) = r2_out {
        writer.put(data)?;
    }
    Ok(())
}

/// The assembled pipeline for one run.
pub struct H4Pipeline {
    pool: Arc<ThreadPool>,
    tables: Arc<Tables>,
    streams: Vec<Splitter>,
    r1_out: Option<ParallelGzipWriter>,
    r2_out: Option<ParallelGzipWriter>,
    lo: usize,
    hi: usize,
    block_size: usize,
    summary: DemuxSummary,
}

impl H4Pipeline {
    /// Loads barcode tables and opens all inputs and outputs.
    ///
    /// # Errors
    ///
    /// Returns an error for unreadable barcode files or inputs, bad ranges,
    /// or when no output is enabled.
    pub fn new(config: &Config, pool: Arc<ThreadPool>) -> Result<Self> {
        let range = config.read_range()?;
        if config.output.r1.is_empty() && config.output.r2.is_empty() {
            return Err(Fqh4Error::Config {
                reason: "neither output.R1 nor output.R2 is set".to_string(),
            });
        }

        let load = |spec: &crate::config::BarcodeSpec| -> Result<BarcodeTable> {
            BarcodeTable::load(config.barcode_path(spec), &spec.options()?)
        };
        let tables = Tables {
            a: load(&config.barcodes.a)?,
            b: load(&config.barcodes.b)?,
            c: load(&config.barcodes.c)?,
            d: load(&config.barcodes.d)?,
            stagger: load(&config.barcodes.stagger)?,
            plate: config.plate_spec().map(load).transpose()?,
        };

        let mut streams = vec![
            Splitter::new(config.read_path(&config.reads.r1))?,
            Splitter::new(config.read_path(&config.reads.r2))?,
            Splitter::new(config.read_path(&config.reads.r3))?,
            Splitter::new(config.read_path(&config.reads.r4))?,
        ];
        if tables.plate.is_some() {
            streams.push(Splitter::new(config.read_path(&config.reads.i1))?);
        }

        let out_root = config.output_root();
        let r1_out = if config.output.r1.is_empty() {
            None
        } else {
            Some(ParallelGzipWriter::new(out_root.join(&config.output.r1), Arc::clone(&pool))?)
        };
        let r2_out = if config.output.r2.is_empty() {
            None
        } else {
            Some(ParallelGzipWriter::new(out_root.join(&config.output.r2), Arc::clone(&pool))?)
        };

        Ok(Self {
            pool,
            tables: Arc::new(tables),
            streams,
            r1_out,
            r2_out,
            lo: range.lo,
            hi: range.hi,
            block_size: BLOCK_SIZE,
            summary: DemuxSummary::default(),
        })
    }

    /// Overrides the records-per-job block size.
    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size.max(1);
    }

    /// Runs the pipeline to completion and closes the outputs.
    ///
    /// # Errors
    ///
    /// Returns the first failure observed at a stage boundary: reader or
    /// writer breakdown, record count mismatches, or a range past the end
    /// of the inputs.
    pub fn run(&mut self) -> Result<DemuxSummary> {
        let timer = OperationTimer::new("Demultiplexing");
        self.skip_to_range_start()?;

        let mut jobs: VecDeque<JobHandle<MatchedBlocks>> = VecDeque::new();
        let mut next = self.lo;
        let mut any_eof = false;
        while !any_eof && next < self.hi {
            let want = self.block_size.min(self.hi - next);
            let mut blocks = Vec::with_capacity(self.streams.len());
            for stream in &mut self.streams {
                blocks.push(stream.read_block(want)?);
                any_eof |= stream.eof();
            }
            self.poll_streams()?;
            let count = blocks[R1].len();
            for (stream, block) in self.streams.iter().zip(&blocks).skip(1) {
                if block.len() != count {
                    return Err(Fqh4Error::LengthMismatch {
                        expected: count,
                        found: block.len(),
                        path: stream.reader().path().to_path_buf(),
                    });
                }
            }
            if count > 0 {
                let tables = Arc::clone(&self.tables);
                jobs.push_back(
                    self.pool.submit(move || (match_block(&tables, &blocks), blocks)),
                );
                next += count;
            }

            // Emit whatever is already finished, in submission order.
            while let Some(front) = jobs.front() {
                match front.try_wait()? {
                    Some((matches, blocks)) => {
                        jobs.pop_front();
                        self.emit(&matches, &blocks)?;
                    }
                    None => break,
                }
            }
            self.poll_writers()?;
        }

        while let Some(job) = jobs.pop_front() {
            let (matches, blocks) = job.wait()?;
            self.emit(&matches, &blocks)?;
        }

        if let Some(writer) = &mut self.r1_out {
            writer.close()?;
        }
        if let Some(writer) = &mut self.r2_out {
            writer.close()?;
        }

        timer.log_completion(self.summary.records);
        if self.summary.records > 0 {
            let records = self.summary.records;
            log::info!(
                "  reads with invalid barcode: {} ({})",
                format_count(self.summary.any_invalid),
                format_percent(self.summary.any_invalid as f64 / records as f64, 2),
            );
            log::info!(
                "  reads with unclear barcode: {} ({})",
                format_count(self.summary.any_unclear),
                format_percent(self.summary.any_unclear as f64 / records as f64, 2),
            );
        }
        Ok(self.summary)
    }

    /// Advances every stream to the first record of the range.
    fn skip_to_range_start(&mut self) -> Result<()> {
        for skipped in 0..self.lo {
            for stream in &mut self.streams {
                if stream.read_one()?.is_none() {
                    return Err(Fqh4Error::RangeExceedsInput {
                        requested: self.lo,
                        available: skipped,
                    });
                }
            }
        }
        Ok(())
    }

    fn poll_streams(&self) -> Result<()> {
        for stream in &self.streams {
            if stream.failed() {
                return Err(Fqh4Error::ReadFailed {
                    path: stream.reader().path().to_path_buf(),
                });
            }
        }
        Ok(())
    }

    fn poll_writers(&self) -> Result<()> {
        for writer in [&self.r1_out, &self.r2_out].into_iter().flatten() {
            if writer.failed() {
                return Err(Fqh4Error::WriteFailed { path: writer.path().to_path_buf() });
            }
        }
        Ok(())
    }

    /// Writes one matched block set; strictly sequential on the driver
    /// thread so records keep their input order.
    fn emit(&mut self, matches: &[H4Match], blocks: &[ReadBlock]) -> Result<()> {
        let tables = &self.tables;
        let r1_out = &mut self.r1_out;
        let r2_out = &mut self.r2_out;

        for (i, m) in matches.iter().enumerate() {
            let r1 = blocks[R1].get(i);
            let r2 = blocks[R2].get(i);
            let r3 = blocks[R3].get(i);
            let r4 = blocks[R4].get(i);

            // Synthesized header: read name token plus BX/RX/QX comments.
            let head = r1.head();
            let token = &head[..head.find_byteset(b" \t").unwrap_or(head.len())];
            put_both(r1_out, r2_out, token)?;
            put_both(r1_out, r2_out, b"\tBX:Z:")?;
            put_both(r1_out, r2_out, tables.a.tag(m.a.idx).as_bytes())?;
            put_both(r1_out, r2_out, tables.c.tag(m.c.idx).as_bytes())?;
            put_both(r1_out, r2_out, tables.b.tag(m.b.idx).as_bytes())?;
            put_both(r1_out, r2_out, tables.d.tag(m.d.idx).as_bytes())?;
            if let (Some(plate), Some(p)) = (&tables.plate, &m.p) {
                put_both(r1_out, r2_out, b"-")?;
                put_both(r1_out, r2_out, plate.tag(p.idx).as_bytes())?;
            }
            put_both(r1_out, r2_out, b"\tRX:Z:")?;
            put_both(r1_out, r2_out, r2.seq())?;
            put_both(r1_out, r2_out, r3.seq())?;
            if m.p.is_some() {
                put_both(r1_out, r2_out, b"+")?;
                put_both(r1_out, r2_out, blocks[I1].get(i).seq())?;
            }
            put_both(r1_out, r2_out, b"\tQX:Z:")?;
            put_both(r1_out, r2_out, r2.qual())?;
            put_both(r1_out, r2_out, r3.qual())?;
            if m.p.is_some() {
                put_both(r1_out, r2_out, b"+")?;
                put_both(r1_out, r2_out, blocks[I1].get(i).qual())?;
            }
            put_both(r1_out, r2_out, b"\n")?;

            // Remaining R1 lines, unchanged.
            if let Some(writer) = r1_out {
                writer.put_line(r1.seq())?;
                writer.put_line(r1.sep())?;
                writer.put_line(r1.qual())?;
            }

            // R4 with the stagger plus A barcode prefix removed.
            if let Some(writer) = r2_out {
                let clip = tables.stagger.max_code_length()
                    + 1
                    + if m.a.matched() {
                        tables.a.code(m.a.idx).len()
                    } else {
                        tables.a.max_code_length()
                    };
                writer.put_line(clip_left(r4.seq(), clip))?;
                writer.put_line(r4.sep())?;
                writer.put_line(clip_left(r4.qual(), clip))?;
            }

            self.summary.records += 1;
            self.summary.any_invalid += u64::from(m.any_invalid);
            self.summary.any_unclear += u64::from(m.any_unclear);
        }
        Ok(())
    }
}

/// Runs a configured demultiplex and persists the effective configuration
/// document to `<output.root>/H4.json`.
///
/// # Errors
///
/// Propagates any pipeline error; the configuration is only persisted after
/// a fully successful run.
pub fn run(config: &Config, doc: &serde_json::Value, pool: Arc<ThreadPool>) -> Result<DemuxSummary> {
    let mut pipeline = H4Pipeline::new(config, pool)?;
    let summary = pipeline.run()?;

    let path = config.output_root().join("H4.json");
    let text = serde_json::to_string_pretty(doc)
        .map_err(|e| Fqh4Error::Config { reason: e.to_string() })?;
    std::fs::write(&path, text).map_err(|source| Fqh4Error::Io {
        context: format!("persisting '{}'", path.display()),
        source,
    })?;
    Ok(summary)
}

/// Number of pool threads a configuration asks for.
#[must_use]
pub fn configured_threads(config: &Config) -> usize {
    config
        .pool_threads
        .unwrap_or_else(|| available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1))
}

/// Prints a resolved-configuration summary without touching the inputs.
///
/// Missing files are reported as `NA` instead of failing, so a
/// configuration can be reviewed before the data exists.
pub fn dry_run(config: &Config) {
    let range = config.read_range();
    match &range {
        Ok(r) if r.hi == usize::MAX => println!("range: {}-", r.lo),
        Ok(r) => println!("range: {}-{}", r.lo, r.hi),
        Err(_) => println!("range: INVALID ('{}')", config.range),
    }
    println!("pool_threads: {}", configured_threads(config));

    println!("barcodes");
    let table_stats = |name: &str, spec: Option<&crate::config::BarcodeSpec>| {
        print!("    {name}: ");
        let Some(spec) = spec else {
            println!("NA");
            return None;
        };
        let path = config.barcode_path(spec);
        let loaded = spec.options().and_then(|options| BarcodeTable::load(&path, &options));
        match loaded {
            Ok(table) => {
                println!(
                    "\"{}\"  {}  [{}, {}]  {}",
                    table.unclear_tag(),
                    table.len() - 1,
                    table.min_code_length(),
                    table.max_code_length(),
                    path.display()
                );
                Some(table)
            }
            Err(_) => {
                println!("NA  {}", path.display());
                None
            }
        }
    };
    let a = table_stats("A      ", Some(&config.barcodes.a));
    let b = table_stats("B      ", Some(&config.barcodes.b));
    let c = table_stats("C      ", Some(&config.barcodes.c));
    let d = table_stats("D      ", Some(&config.barcodes.d));
    let _ = table_stats("plate  ", config.plate_spec());
    let stagger = table_stats("stagger", Some(&config.barcodes.stagger));

    println!("reads");
    let read_stats = |name: &str, file: &str, open: bool| {
        let path = config.read_path(file);
        if open && path.is_file() {
            println!("    {name}: {}", path.display());
        } else {
            println!("    {name}: NA");
        }
    };
    read_stats("R1", &config.reads.r1, true);
    read_stats("R2", &config.reads.r2, true);
    read_stats("R3", &config.reads.r3, true);
    read_stats("R4", &config.reads.r4, true);
    read_stats("I1", &config.reads.i1, config.plate_enabled());

    println!("matches");
    if let Some(stagger) = &stagger {
        println!(
            "    stagger <- min_ed(R4.seq[0:{}], stagger)",
            stagger.max_code_length()
        );
    }
    if let (Some(a), Some(b), Some(c), Some(d)) = (&a, &b, &c, &d) {
        let total = d.max_code_length()
            + 1
            + b.max_code_length()
            + a.max_code_length()
            + 1
            + c.max_code_length();
        println!("    code_total_length: {total}");
    }

    println!("output");
    let out = |name: &str, file: &str, note: &str| {
        if file.is_empty() {
            println!("    {name}: NA{note}");
        } else {
            println!("    {name}: {}", config.output_root().join(file).display());
        }
    };
    out("R1", &config.output.r1, "");
    out("R2", &config.output.r2, " (no clipping)");
}
