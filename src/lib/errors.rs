//! Custom error types for fqh4 operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for fqh4 operations
pub type Result<T> = std::result::Result<T, Fqh4Error>;

/// Error type for fqh4 operations
#[derive(Error, Debug)]
pub enum Fqh4Error {
    /// Invalid configuration document
    #[error("invalid configuration: {reason}")]
    Config {
        /// Explanation of what is wrong
        reason: String,
    },

    /// Malformed read range expression
    #[error("invalid read range '{value}': {reason}")]
    InvalidRange {
        /// The offending range string
        value: String,
        /// Explanation of why it's invalid
        reason: String,
    },

    /// Output directory already exists and `--force` was not given
    #[error("output directory '{path}' already exists (use --force to replace it)")]
    OutputExists {
        /// The output root
        path: PathBuf,
    },

    /// Failed to open a file
    #[error("cannot open {kind} file '{path}': {source}")]
    Open {
        /// Kind of file (e.g. "input", "output", "barcode")
        kind: &'static str,
        /// Path to the file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// General I/O failure
    #[error("I/O error while {context}: {source}")]
    Io {
        /// What was being done
        context: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The background gzip decoder for an input failed
    #[error("gzip stream '{path}' is corrupt or truncated")]
    ReadFailed {
        /// Path to the input file
        path: PathBuf,
    },

    /// The background compressor for an output failed
    #[error("writing gzip stream '{path}' failed")]
    WriteFailed {
        /// Path to the output file
        path: PathBuf,
    },

    /// Write attempted on a closed writer
    #[error("attempt to write into a closed gzip stream")]
    WriteClosed,

    /// Input FASTQ streams yielded different record counts
    #[error("inconsistent number of records across inputs: expected {expected}, got {found} from '{path}'")]
    LengthMismatch {
        /// Record count of the first stream
        expected: usize,
        /// Record count of the disagreeing stream
        found: usize,
        /// Path of the disagreeing stream
        path: PathBuf,
    },

    /// Corrupted or inconsistent barcode file
    #[error("corrupt barcode file '{path}': {reason}")]
    Barcode {
        /// Path to the barcode file
        path: PathBuf,
        /// Explanation of the problem
        reason: String,
    },

    /// More pool threads requested than the free-list can track
    #[error("thread pool oversubscribed: {requested} threads requested, at most {max} supported")]
    Oversubscribed {
        /// Requested thread count
        requested: usize,
        /// Hard cap
        max: usize,
    },

    /// A worker thread disappeared before delivering its result
    #[error("worker thread terminated unexpectedly")]
    WorkerLost,

    /// A record straddles more bytes than the chunk carry window
    #[error("record of {len} bytes exceeds the {window} byte carry window")]
    RecordTooLong {
        /// Tail length that did not fit
        len: usize,
        /// Configured window size
        window: usize,
    },

    /// The configured range starts past the end of the input
    #[error("read range starts at {requested} but inputs hold only {available} records")]
    RangeExceedsInput {
        /// First record index of the range
        requested: usize,
        /// Records actually present
        available: usize,
    },
}
