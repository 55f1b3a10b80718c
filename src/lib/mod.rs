#![deny(unsafe_code)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args
)]

//! # fqh4 - parallel FASTQ demultiplexer for H4 combinatorial barcodes
//!
//! Assigns each read tuple of five FASTQ streams to combinatorial cell and
//! plate barcodes by bounded edit-distance matching, tags the reads with a
//! composite identifier, optionally clips the stagger+barcode prefix from
//! R4, and writes gzip output. Inputs run to hundreds of gigabytes
//! decompressed, so every stage streams and every hand-off is bounded.
//!
//! ## Pipeline
//!
//! ```text
//! gzip_reader -> splitter ---\
//! gzip_reader -> splitter ----+--> pool: match_block --> demux --> gzip_writer
//! gzip_reader -> splitter ---/          (unordered)    (ordered)  (parallel)
//! ```
//!
//! - **[`queue`]** - bounded concurrent FIFO with explicit-release pops
//! - **[`device`]** / **[`pool`]** - single-consumer workers and the idle
//!   bitset pool that schedules matching and compression jobs
//! - **[`gzip_reader`]** - background decode into window-prefixed chunks
//! - **[`splitter`]** - zero-copy record parsing with boundary carry-over
//! - **[`matcher`]** - bounded Levenshtein scan over barcode tables
//! - **[`gzip_writer`]** - pigz-style ordered parallel gzip output
//! - **[`demux`]** - the driver tying all stages together
//!
//! Supporting modules: [`barcode`] (table loading), [`config`] (JSON
//! document and overrides), [`errors`], [`logging`].

pub mod barcode;
pub mod config;
pub mod demux;
pub mod device;
pub mod errors;
pub mod gzip_reader;
pub mod gzip_writer;
pub mod logging;
pub mod matcher;
pub mod pool;
pub mod queue;
pub mod splitter;

pub use errors::{Fqh4Error, Result};
