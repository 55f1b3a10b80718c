//! Asynchronous chunked gzip reader.
//!
//! A [`GzipChunkReader`] owns one background thread that decompresses an
//! input file into fixed-size chunks and pushes them through a bounded queue,
//! so decode runs ahead of parsing while the queue depth bounds memory.
//!
//! Each chunk buffer reserves `window` unused bytes in front of the payload:
//!
//! ```text
//! buf[0 .. window)                 spare prefix (tail carry region)
//! buf[window .. window + size)     decompressed payload
//! ```
//!
//! The splitter copies the unterminated tail of the previous chunk into that
//! prefix, producing a view that is contiguous across the chunk boundary
//! without relocating payload.
//!
//! Plain (uncompressed) files are accepted too: the gzip magic is sniffed at
//! open, matching how the zlib `gzread` family behaves.

use crate::errors::{Fqh4Error, Result};
use crate::queue::ConcurrentQueue;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Buffer geometry and queue depth for a chunk reader.
#[derive(Debug, Clone, Copy)]
pub struct ChunkLayout {
    /// Spare prefix bytes per chunk; must exceed the longest record.
    pub window: usize,
    /// Payload bytes per chunk.
    pub chunk_size: usize,
    /// Chunks in flight between the decode thread and the consumer.
    pub depth: usize,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self { window: 16 * 1024, chunk_size: 1024 * 1024, depth: 16 }
    }
}

/// A chunk of decompressed bytes produced by the reader.
pub struct Chunk {
    /// Backing buffer of `window + chunk_size` bytes.
    pub(crate) buf: Vec<u8>,
    /// Offset of the first payload byte.
    pub window: usize,
    /// Number of valid payload bytes.
    pub size: usize,
    /// True only for the final chunk of the file.
    pub last: bool,
}

impl Chunk {
    /// The valid payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.window..self.window + self.size]
    }

    /// Zero-size terminal chunk pushed after a decoder failure.
    fn sentinel() -> Self {
        Self { buf: Vec::new(), window: 0, size: 0, last: false }
    }
}

enum Source {
    Gzip(MultiGzDecoder<BufReader<File>>),
    Plain(BufReader<File>),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Source::Gzip(reader) => reader.read(buf),
            Source::Plain(reader) => reader.read(buf),
        }
    }
}

fn open_source(path: &Path) -> Result<Source> {
    let mut file = File::open(path).map_err(|source| Fqh4Error::Open {
        kind: "input",
        path: path.to_path_buf(),
        source,
    })?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic).map_err(|source| Fqh4Error::Io {
        context: format!("probing '{}'", path.display()),
        source,
    })?;
    file.seek(SeekFrom::Start(0)).map_err(|source| Fqh4Error::Io {
        context: format!("rewinding '{}'", path.display()),
        source,
    })?;
    let reader = BufReader::with_capacity(128 * 1024, file);
    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(Source::Gzip(MultiGzDecoder::new(reader)))
    } else {
        Ok(Source::Plain(reader))
    }
}

/// Reads `buf` to fill level, tolerating the short reads a gzip decoder
/// produces at member boundaries. Returns the number of bytes read; less
/// than `buf.len()` only at end of stream.
fn read_fill(source: &mut Source, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Background-threaded chunk producer over a gzip or plain file.
pub struct GzipChunkReader {
    queue: Arc<ConcurrentQueue<Chunk>>,
    failed: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    layout: ChunkLayout,
    path: PathBuf,
    total_bytes: u64,
    eof: bool,
}

impl GzipChunkReader {
    /// Opens `path` with the default layout (16 KiB window, 1 MiB chunks,
    /// 16 chunks in flight).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_layout(path, ChunkLayout::default())
    }

    /// Opens `path` with an explicit layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn with_layout<P: AsRef<Path>>(path: P, layout: ChunkLayout) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut source = open_source(&path)?;

        let queue = Arc::new(ConcurrentQueue::new(layout.depth));
        let failed = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_queue = Arc::clone(&queue);
        let thread_failed = Arc::clone(&failed);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Acquire) {
                let mut buf = vec![0u8; layout.window + layout.chunk_size];
                let size = match read_fill(&mut source, &mut buf[layout.window..]) {
                    Ok(size) => size,
                    Err(_) => {
                        thread_failed.store(true, Ordering::Release);
                        thread_queue.push(Chunk::sentinel());
                        return;
                    }
                };
                let last = size < layout.chunk_size;
                thread_queue.push(Chunk { buf, window: layout.window, size, last });
                if last {
                    return;
                }
            }
        });

        Ok(Self {
            queue,
            failed,
            stop,
            handle: Some(handle),
            layout,
            path,
            total_bytes: 0,
            eof: false,
        })
    }

    /// Returns the next chunk, or a zero-size chunk once [`Self::eof`].
    pub fn read(&mut self) -> Chunk {
        if self.eof {
            return Chunk::sentinel();
        }
        let chunk = self.queue.pop();
        self.total_bytes += chunk.size as u64;
        self.eof = chunk.last || self.failed.load(Ordering::Acquire);
        chunk
    }

    /// True once the last chunk or a failure sentinel has been returned.
    #[must_use]
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// True if the background decoder hit an error.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Decompressed bytes handed out so far.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// The input path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The layout this reader was opened with.
    #[must_use]
    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }
}

impl Drop for GzipChunkReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            // Deplete the queue so a blocked push lets the thread observe stop.
            while !handle.is_finished() {
                let _ = self.queue.try_pop();
                std::thread::yield_now();
            }
            let _ = handle.join();
        }
    }
}
