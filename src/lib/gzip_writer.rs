//! Parallel gzip writer producing a single ordered gzip stream.
//!
//! Architecture, after pigz:
//!
//! 1. `put`/`put_line` accumulate bytes into an input buffer of
//!    `num_threads x chunk_size` bytes; full buffers enter a bounded queue
//!    (producer back-pressure).
//! 2. A dedicated compressor thread splits each buffer into up to
//!    `num_threads` slices and submits one raw-deflate job per slice to the
//!    shared [`ThreadPool`].
//! 3. The compressor awaits the jobs *in submission order* and writes their
//!    output sequentially, so the byte stream order is preserved no matter
//!    which pool thread finishes first.
//!
//! Every slice is deflated as a raw stream ending in a `SYNC_FLUSH` empty
//! stored block, which is byte-aligned; concatenating such slices yields one
//! valid deflate stream. The final slice of the final buffer uses `FINISH`
//! to terminate it. A single gzip header is written at open and the
//! little-endian CRC-32 / length trailer at close.

use crate::errors::{Fqh4Error, Result};
use crate::pool::ThreadPool;
use crate::queue::ConcurrentQueue;
use flate2::{Compress, Compression, FlushCompress, Status};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

/// Fixed gzip header: magic, deflate, no flags, no mtime, Unix OS byte.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03];

/// Tuning knobs for a [`ParallelGzipWriter`].
#[derive(Debug, Clone)]
pub struct GzipWriterConfig {
    /// Deflate jobs per input buffer; defaults to the pool size.
    pub num_threads: Option<usize>,
    /// Bytes per deflate job.
    pub chunk_size: usize,
    /// Input buffers in flight between producers and the compressor.
    pub queue_depth: usize,
}

impl Default for GzipWriterConfig {
    fn default() -> Self {
        Self { num_threads: None, chunk_size: 1024 * 1024, queue_depth: 16 }
    }
}

/// Deflates one slice as a raw stream with the given flush mode.
fn deflate_slice(input: &[u8], flush: FlushCompress) -> io::Result<Vec<u8>> {
    let mut encoder = Compress::new(Compression::default(), false);
    let mut out = Vec::with_capacity(input.len() + input.len() / 3 + 64);
    loop {
        let consumed = encoder.total_in() as usize;
        let status = encoder
            .compress_vec(&input[consumed..], &mut out, flush)
            .map_err(|e| io::Error::other(format!("deflate failed: {e}")))?;
        match status {
            Status::StreamEnd => break,
            Status::Ok => {
                // A sync flush is complete once all input is consumed and
                // the encoder was not starved of output space.
                if matches!(flush, FlushCompress::Sync)
                    && encoder.total_in() as usize == input.len()
                    && out.len() < out.capacity()
                {
                    break;
                }
                if out.len() == out.capacity() {
                    out.reserve(32 * 1024);
                }
            }
            Status::BufError => out.reserve(32 * 1024),
        }
    }
    Ok(out)
}

/// Writes arbitrary byte strings to a gzip file, compressing in parallel
/// while preserving input order.
pub struct ParallelGzipWriter {
    buf: Vec<u8>,
    capacity: usize,
    queue: Arc<ConcurrentQueue<Vec<u8>>>,
    failed: Arc<AtomicBool>,
    total_in: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
    closed: bool,
    path: PathBuf,
}

impl ParallelGzipWriter {
    /// Creates a writer over `path` with default tuning.
    ///
    /// # Errors
    ///
    /// Returns an error if the output file cannot be created.
    pub fn new<P: AsRef<Path>>(path: P, pool: Arc<ThreadPool>) -> Result<Self> {
        Self::with_config(path, pool, &GzipWriterConfig::default())
    }

    /// Creates a writer over `path` with explicit tuning.
    ///
    /// # Errors
    ///
    /// Returns an error if the output file cannot be created or the gzip
    /// header cannot be written.
    pub fn with_config<P: AsRef<Path>>(
        path: P,
        pool: Arc<ThreadPool>,
        config: &GzipWriterConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let num_threads = config.num_threads.unwrap_or(pool.num_threads()).clamp(1, pool.num_threads());
        let chunk_size = config.chunk_size;
        let capacity = num_threads * chunk_size;

        let mut file = File::create(&path).map_err(|source| Fqh4Error::Open {
            kind: "output",
            path: path.clone(),
            source,
        })?;
        file.write_all(&GZIP_HEADER).map_err(|source| Fqh4Error::Io {
            context: format!("writing gzip header to '{}'", path.display()),
            source,
        })?;

        let queue = Arc::new(ConcurrentQueue::new(config.queue_depth));
        let failed = Arc::new(AtomicBool::new(false));
        let total_in = Arc::new(AtomicU64::new(0));

        let thread_queue = Arc::clone(&queue);
        let thread_failed = Arc::clone(&failed);
        let thread_total = Arc::clone(&total_in);
        let thread_path = path.clone();
        let handle = std::thread::spawn(move || {
            compressor_loop(
                file,
                &pool,
                &thread_queue,
                &thread_failed,
                &thread_total,
                capacity,
                chunk_size,
                &thread_path,
            );
        });

        Ok(Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            queue,
            failed,
            total_in,
            handle: Some(handle),
            closed: false,
            path,
        })
    }

    /// True if the compressor thread hit an error; subsequent writes are
    /// dropped silently.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// True once [`Self::close`] ran.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed
    }

    /// Uncompressed bytes consumed by the compressor so far; exact after
    /// close.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_in.load(Ordering::Relaxed)
    }

    /// The output path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends bytes to the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Fqh4Error::WriteClosed`] after [`Self::close`].
    pub fn put(&mut self, mut data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Fqh4Error::WriteClosed);
        }
        if self.failed() {
            return Ok(()); // sink writes after compressor failure
        }
        while !data.is_empty() {
            let room = self.capacity - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == self.capacity {
                let full = std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity));
                self.queue.push(full);
            }
        }
        Ok(())
    }

    /// Appends bytes plus a trailing newline.
    ///
    /// # Errors
    ///
    /// Returns [`Fqh4Error::WriteClosed`] after [`Self::close`].
    pub fn put_line(&mut self, data: &[u8]) -> Result<()> {
        self.put(data)?;
        self.put(b"\n")
    }

    /// Flushes the final buffer, joins the compressor thread, and reports
    /// its status. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Fqh4Error::WriteFailed`] if the compressor failed.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The buffer is strictly below capacity here (full buffers are
        // flushed eagerly), so the compressor recognizes it as final.
        let last = std::mem::take(&mut self.buf);
        self.queue.push(last);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if self.failed() {
            return Err(Fqh4Error::WriteFailed { path: self.path.clone() });
        }
        Ok(())
    }
}

impl Drop for ParallelGzipWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("{e}");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn compressor_loop(
    file: File,
    pool: &ThreadPool,
    queue: &ConcurrentQueue<Vec<u8>>,
    failed: &AtomicBool,
    total_in: &AtomicU64,
    capacity: usize,
    chunk_size: usize,
    path: &Path,
) {
    let mut out = BufWriter::new(file);
    let mut crc = crc32fast::Hasher::new();
    let mut total: u64 = 0;
    let mut saw_last = false;

    let result = (|| -> io::Result<()> {
        loop {
            let buf = queue.pop();
            let last = buf.len() < capacity;
            saw_last |= last;
            crc.update(&buf);
            total += buf.len() as u64;
            total_in.store(total, Ordering::Relaxed);

            let shared = Arc::new(buf);
            let mut jobs = Vec::new();
            let mut offset = 0;
            loop {
                let end = (offset + chunk_size).min(shared.len());
                let is_final_slice = last && end == shared.len();
                let flush =
                    if is_final_slice { FlushCompress::Finish } else { FlushCompress::Sync };
                let input = Arc::clone(&shared);
                let range = offset..end;
                jobs.push(pool.submit(move || deflate_slice(&input[range], flush)));
                offset = end;
                if offset >= shared.len() {
                    break;
                }
            }

            // Drain in submission order to keep the byte stream ordered.
            for job in jobs {
                let bytes = job.wait().map_err(|_| io::Error::other("deflate worker lost"))??;
                out.write_all(&bytes)?;
            }
            out.flush()?;
            if last {
                break;
            }
        }
        let crc = std::mem::take(&mut crc).finalize();
        out.write_all(&crc.to_le_bytes())?;
        out.write_all(&((total & 0xFFFF_FFFF) as u32).to_le_bytes())?;
        out.flush()?;
        Ok(())
    })();

    if let Err(e) = result {
        failed.store(true, Ordering::Release);
        log::error!("gzip compressor for '{}' failed: {e}", path.display());
        // Keep draining so producers blocked on the queue can finish.
        while !saw_last {
            saw_last = queue.pop().len() < capacity;
        }
    }
}
