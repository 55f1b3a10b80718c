//! Zero-copy chunk splitting into records.
//!
//! A [`ChunkSplitter`] pulls chunks from a [`GzipChunkReader`] and parses
//! them into records without copying payload. Records that straddle a chunk
//! boundary are handled by carrying the unterminated *tail* of the previous
//! chunk into the spare window prefix of the next one, so every record view
//! is contiguous within a single buffer.
//!
//! Parsing is parameterized by a [`SplitPolicy`]:
//!
//! - `trim` locates, inside a freshly assembled chunk view, the end of the
//!   last complete record; the residue becomes the tail.
//! - `split` consumes one record from the current view.
//!
//! [`ChunkSplitter::read_one`] hands out views valid until the next call.
//! [`ChunkSplitter::read_block`] returns a [`Block`]: an owned set of record
//! views plus every chunk needed to keep them alive, suitable for moving to
//! another thread.

use crate::errors::{Fqh4Error, Result};
use crate::gzip_reader::{ChunkLayout, GzipChunkReader};
use memchr::{memchr, memrchr};
use std::marker::PhantomData;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

/// Byte range into a chunk buffer.
pub type Span = Range<usize>;

/// Record-framing policy for a [`ChunkSplitter`].
pub trait SplitPolicy {
    /// Owned descriptor of one record, stored inside blocks.
    type Raw: Clone + Send + 'static;
    /// Borrowed view of one record.
    type Item<'a>;

    /// Returns the end (relative to `data`) of the last complete record;
    /// `[end, data.len())` is the tail carried into the next chunk. `last`
    /// chunks keep everything and produce no tail.
    fn trim(data: &[u8], last: bool) -> usize;

    /// Consumes one record from `cv` (absolute offsets into `buf`),
    /// advancing it.
    fn split(buf: &[u8], cv: &mut Span) -> Self::Raw;

    /// Materializes a stored descriptor against its chunk buffer.
    fn resolve<'a>(buf: &'a [u8], raw: &Self::Raw) -> Self::Item<'a>;
}

/// Returns true if the `@` at `at` begins a record header line.
///
/// A `\n@` pair is ambiguous: quality lines may start with `@` as well. From
/// a true record start the third line is the `+` separator, while from a
/// quality line the third line is a sequence line, which never begins with
/// `+`. Returns false when the chunk ends before the check can complete.
fn verified_record_start(data: &[u8], at: usize) -> bool {
    let Some(n0) = memchr(b'\n', &data[at..]).map(|p| at + p) else {
        return false;
    };
    let Some(n1) = memchr(b'\n', &data[n0 + 1..]).map(|p| n0 + 1 + p) else {
        return false;
    };
    data.get(n1 + 1) == Some(&b'+')
}

/// FASTQ trim: the tail starts at the last verifiable record start.
fn fastq_trim(data: &[u8], last: bool) -> usize {
    if last {
        return data.len();
    }
    for pos in memchr::memmem::rfind_iter(data, b"\n@") {
        let at = pos + 1;
        if verified_record_start(data, at) {
            return at;
        }
    }
    0
}

/// Advances `cv` past one newline-terminated line, returning the line
/// without its newline. The final line of a file may be unterminated.
fn take_line(buf: &[u8], cv: &mut Span) -> Span {
    match memchr(b'\n', &buf[cv.clone()]) {
        Some(p) => {
            let line = cv.start..cv.start + p;
            cv.start += p + 1;
            line
        }
        None => {
            let line = cv.clone();
            cv.start = cv.end;
            line
        }
    }
}

/// Newline-delimited records; the newline is excluded from the view.
pub struct LineSplit;

impl SplitPolicy for LineSplit {
    type Raw = Span;
    type Item<'a> = &'a [u8];

    fn trim(data: &[u8], last: bool) -> usize {
        if last {
            return data.len();
        }
        memrchr(b'\n', data).map_or(0, |p| p + 1)
    }

    fn split(buf: &[u8], cv: &mut Span) -> Span {
        take_line(buf, cv)
    }

    fn resolve<'a>(buf: &'a [u8], raw: &Span) -> &'a [u8] {
        &buf[raw.clone()]
    }
}

/// Whole FASTQ records (four lines, newlines included) as single views.
pub struct RecordSplit;

impl SplitPolicy for RecordSplit {
    type Raw = Span;
    type Item<'a> = &'a [u8];

    fn trim(data: &[u8], last: bool) -> usize {
        fastq_trim(data, last)
    }

    fn split(buf: &[u8], cv: &mut Span) -> Span {
        let start = cv.start;
        for _ in 0..4 {
            let _ = take_line(buf, cv);
        }
        start..cv.start
    }

    fn resolve<'a>(buf: &'a [u8], raw: &Span) -> &'a [u8] {
        &buf[raw.clone()]
    }
}

/// One FASTQ record as four line views, filtered by a compile-time mask.
///
/// Bit `i` of `MASK` keeps line `i` (0 = header, 1 = sequence, 2 =
/// separator, 3 = quality); masked-off lines resolve to empty slices.
pub struct FieldSplit<const MASK: u32>;

/// The four lines of one FASTQ record; masked-off lines are empty.
#[derive(Debug, Clone, Copy)]
pub struct SeqRecord<'a> {
    lines: [&'a [u8]; 4],
}

impl<'a> SeqRecord<'a> {
    /// Header line (without the trailing newline).
    #[must_use]
    pub fn head(&self) -> &'a [u8] {
        self.lines[0]
    }

    /// Base sequence line.
    #[must_use]
    pub fn seq(&self) -> &'a [u8] {
        self.lines[1]
    }

    /// `+` separator line.
    #[must_use]
    pub fn sep(&self) -> &'a [u8] {
        self.lines[2]
    }

    /// Quality line.
    #[must_use]
    pub fn qual(&self) -> &'a [u8] {
        self.lines[3]
    }
}

impl<const MASK: u32> SplitPolicy for FieldSplit<MASK> {
    type Raw = [Span; 4];
    type Item<'a> = SeqRecord<'a>;

    fn trim(data: &[u8], last: bool) -> usize {
        fastq_trim(data, last)
    }

    fn split(buf: &[u8], cv: &mut Span) -> [Span; 4] {
        let mut raw = [0..0, 0..0, 0..0, 0..0];
        for (i, slot) in raw.iter_mut().enumerate() {
            let line = take_line(buf, cv);
            if MASK & (1 << i) != 0 {
                *slot = line;
            }
        }
        raw
    }

    fn resolve<'a>(buf: &'a [u8], raw: &[Span; 4]) -> SeqRecord<'a> {
        SeqRecord {
            lines: [
                &buf[raw[0].clone()],
                &buf[raw[1].clone()],
                &buf[raw[2].clone()],
                &buf[raw[3].clone()],
            ],
        }
    }
}

/// Single bytes; the only policy with no framing at all.
pub struct CharSplit;

impl SplitPolicy for CharSplit {
    type Raw = Span;
    type Item<'a> = u8;

    fn trim(data: &[u8], _last: bool) -> usize {
        data.len()
    }

    fn split(_buf: &[u8], cv: &mut Span) -> Span {
        let raw = cv.start..cv.start + 1;
        cv.start += 1;
        raw
    }

    fn resolve(buf: &[u8], raw: &Span) -> u8 {
        buf[raw.start]
    }
}

/// An owned vector of record views plus the chunks that keep them alive.
///
/// Created by [`ChunkSplitter::read_block`]; the unit transferred across
/// thread boundaries.
pub struct Block<P: SplitPolicy> {
    views: Vec<(u32, P::Raw)>,
    chunks: Vec<Arc<Vec<u8>>>,
}

impl<P: SplitPolicy> Block<P> {
    /// Number of records in the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// True if the block holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// The `i`-th record view; valid as long as the block lives.
    #[must_use]
    pub fn get(&self, i: usize) -> P::Item<'_> {
        let (chunk, raw) = &self.views[i];
        P::resolve(&self.chunks[*chunk as usize], raw)
    }
}

/// Streaming record parser over chunked input.
pub struct ChunkSplitter<P: SplitPolicy> {
    reader: GzipChunkReader,
    cur: Arc<Vec<u8>>,
    cv: Span,
    tail: Span,
    last_seen: bool,
    buffered: bool,
    retained: Vec<Arc<Vec<u8>>>,
    _policy: PhantomData<P>,
}

impl<P: SplitPolicy> ChunkSplitter<P> {
    /// Opens `path` with the default chunk layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new<Q: AsRef<Path>>(path: Q) -> Result<Self> {
        Ok(Self::with_reader(GzipChunkReader::new(path)?))
    }

    /// Opens `path` with an explicit chunk layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn with_layout<Q: AsRef<Path>>(path: Q, layout: ChunkLayout) -> Result<Self> {
        Ok(Self::with_reader(GzipChunkReader::with_layout(path, layout)?))
    }

    /// Wraps an already opened reader.
    #[must_use]
    pub fn with_reader(reader: GzipChunkReader) -> Self {
        Self {
            reader,
            cur: Arc::new(Vec::new()),
            cv: 0..0,
            tail: 0..0,
            last_seen: false,
            buffered: false,
            retained: Vec::new(),
            _policy: PhantomData,
        }
    }

    /// The underlying reader.
    #[must_use]
    pub fn reader(&self) -> &GzipChunkReader {
        &self.reader
    }

    /// True once the last chunk is consumed and the view is empty.
    #[must_use]
    pub fn eof(&self) -> bool {
        self.last_seen && self.cv.is_empty()
    }

    /// True if the underlying reader failed.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.reader.failed()
    }

    /// Pulls the next chunk, carries the tail into its window prefix, and
    /// re-trims. Returns false at end of stream.
    fn next_chunk(&mut self) -> Result<bool> {
        if self.last_seen {
            return Ok(false);
        }
        let mut chunk = self.reader.read();
        if self.reader.failed() {
            self.last_seen = true;
            self.cv = 0..0;
            self.tail = 0..0;
            return Ok(false);
        }
        let carry = self.tail.len();
        if carry > chunk.window {
            return Err(Fqh4Error::RecordTooLong { len: carry, window: chunk.window });
        }
        let start = chunk.window - carry;
        let end = chunk.window + chunk.size;
        if carry > 0 {
            let tail = self.tail.clone();
            chunk.buf[start..chunk.window].copy_from_slice(&self.cur[tail]);
        }
        let trimmed = P::trim(&chunk.buf[start..end], chunk.last);
        self.last_seen = chunk.last;

        let _prev = std::mem::replace(&mut self.cur, Arc::new(chunk.buf));
        if self.buffered {
            self.retained.push(Arc::clone(&self.cur));
        }
        self.cv = start..start + trimmed;
        self.tail = start + trimmed..end;
        Ok(true)
    }

    /// Returns the next record view, or `None` at end of stream. The view is
    /// valid until the next call on this splitter.
    ///
    /// # Errors
    ///
    /// Returns [`Fqh4Error::RecordTooLong`] if a carried tail exceeds the
    /// chunk window.
    pub fn read_one(&mut self) -> Result<Option<P::Item<'_>>> {
        while self.cv.is_empty() {
            if !self.next_chunk()? {
                return Ok(None);
            }
        }
        let raw = P::split(&self.cur, &mut self.cv);
        Ok(Some(P::resolve(&self.cur, &raw)))
    }

    /// Reads up to `n` records into a [`Block`] that keeps every touched
    /// chunk alive, so the views stay valid after this splitter advances.
    ///
    /// # Errors
    ///
    /// Returns [`Fqh4Error::RecordTooLong`] if a carried tail exceeds the
    /// chunk window.
    pub fn read_block(&mut self, n: usize) -> Result<Block<P>> {
        self.buffered = true;
        self.retained.clear();
        self.retained.push(Arc::clone(&self.cur));

        let mut views = Vec::with_capacity(n);
        let mut status = Ok(());
        while views.len() < n {
            while self.cv.is_empty() {
                match self.next_chunk() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        status = Err(e);
                        break;
                    }
                }
            }
            if status.is_err() || self.cv.is_empty() {
                break;
            }
            let raw = P::split(&self.cur, &mut self.cv);
            views.push((self.retained.len() as u32 - 1, raw));
        }

        self.buffered = false;
        let chunks = std::mem::take(&mut self.retained);
        status?;
        Ok(Block { views, chunks })
    }
}

/// Splitter yielding one line at a time.
pub type LineSplitter = ChunkSplitter<LineSplit>;
/// Splitter yielding whole FASTQ records as single slices.
pub type RecordSplitter = ChunkSplitter<RecordSplit>;
/// Splitter yielding FASTQ records as four masked line views.
pub type FieldSplitter<const MASK: u32> = ChunkSplitter<FieldSplit<MASK>>;
/// Splitter yielding single bytes.
pub type CharSplitter = ChunkSplitter<CharSplit>;
