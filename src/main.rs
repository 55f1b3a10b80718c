#![deny(unsafe_code)]

use anyhow::{Result, bail};
use clap::Parser;
use env_logger::Env;
use fqh4_lib::errors::Fqh4Error;
use fqh4_lib::pool::ThreadPool;
use fqh4_lib::{config, demux};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

/// Parallel FASTQ demultiplexer for H4 combinatorial barcodes.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON configuration file
    config: PathBuf,

    /// Remove an existing output directory before running
    #[arg(short, long)]
    force: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the resolved configuration and exit
    #[arg(long)]
    dry: bool,

    /// JSON-pointer overrides, e.g. --replace '{"/range": "0-1000"}'
    #[arg(long, value_name = "JSON")]
    replace: Vec<String>,
}

fn main() {
    // Print errors ourselves: `Display` only, so every failure is a single
    // diagnostic line no matter how deep its cause chain goes.
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    let mut doc = config::load_document(&args.config)?;
    for replace in &args.replace {
        config::apply_replace(&mut doc, replace)?;
    }
    let cfg = config::from_document(&doc)?;

    if args.dry {
        demux::dry_run(&cfg);
        return Ok(());
    }
    if cfg.output.r1.is_empty() && cfg.output.r2.is_empty() {
        bail!("neither R1 nor R2 output specified; nothing to do");
    }

    let out_root = cfg.output_root();
    if out_root.exists() {
        if !args.force {
            return Err(Fqh4Error::OutputExists { path: out_root }.into());
        }
        std::fs::remove_dir_all(&out_root)?;
    }
    std::fs::create_dir_all(&out_root)?;

    let pool = Arc::new(ThreadPool::new(demux::configured_threads(&cfg))?);
    info!(
        "Running fqh4 {} with {} pool threads",
        env!("CARGO_PKG_VERSION"),
        pool.num_threads()
    );
    let summary = demux::run(&cfg, &doc, pool)?;
    info!("Done: {} records", summary.records);
    Ok(())
}
