//! Barcode table loading.
//!
//! A barcode file holds one `tag WHITESPACE code` entry per line. Loading
//! prepends the reserved *unclear* entry at index 0: its tag is either
//! configured or derived as the first entry's leading letter followed by
//! zeros (`A01 -> A00`), and its code is empty. Matching never probes
//! index 0; it is the fallback identity written out for reads that could not
//! be assigned.

use crate::errors::{Fqh4Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Longest accepted barcode code. Keeps the matcher's DP rows small; real
/// codes are an order of magnitude shorter.
pub const MAX_CODE_LEN: usize = 64;

/// Load-time options for a barcode table.
#[derive(Debug, Clone, Default)]
pub struct BarcodeOptions {
    /// Explicit unclear tag; derived from the first entry when absent.
    pub unclear_tag: Option<String>,
    /// Replaces the leading letter of the unclear tag.
    pub code_letter: Option<char>,
    /// Sort entries 1..N by tag after loading.
    pub sort_by_tag: bool,
}

/// One `(tag, code)` pair.
#[derive(Debug, Clone)]
pub struct BarcodeEntry {
    tag: String,
    code: Vec<u8>,
}

impl BarcodeEntry {
    /// Human-readable identifier written into output headers.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Expected DNA-letter string.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

/// An ordered barcode table with the reserved unclear entry at index 0.
#[derive(Debug)]
pub struct BarcodeTable {
    entries: Vec<BarcodeEntry>,
    min_code_length: usize,
    max_code_length: usize,
    path: Option<PathBuf>,
}

fn corrupt(path: &Path, reason: impl Into<String>) -> Fqh4Error {
    Fqh4Error::Barcode { path: path.to_path_buf(), reason: reason.into() }
}

fn parse_line(line: &str) -> Option<(String, Vec<u8>)> {
    // A tag-only line is an entry with an empty code; stagger tables use
    // those for the zero-offset entry.
    let Some(tag_end) = line.find([' ', '\t']) else {
        return Some((line.to_string(), Vec::new()));
    };
    let code_start = line.rfind([' ', '\t'])? + 1;
    let tag = &line[..tag_end];
    let code = &line[code_start..];
    if tag.is_empty() || code.is_empty() || code_start <= tag_end {
        return None;
    }
    Some((tag.to_string(), code.as_bytes().to_vec()))
}

fn derived_unclear_tag(first_tag: &str) -> String {
    let letter = first_tag.chars().next().unwrap_or('X');
    let zeros = first_tag.chars().count().saturating_sub(1);
    format!("{letter}{}", "0".repeat(zeros))
}

impl BarcodeTable {
    /// Loads a barcode file.
    ///
    /// # Errors
    ///
    /// Returns [`Fqh4Error::Barcode`] for empty files, malformed or interior
    /// empty lines, duplicate tags, over-long codes, and unclear-tag
    /// collisions; [`Fqh4Error::Open`] if the file cannot be read.
    pub fn load<P: AsRef<Path>>(path: P, options: &BarcodeOptions) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| Fqh4Error::Open {
            kind: "barcode",
            path: path.to_path_buf(),
            source,
        })?;

        let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        if lines.is_empty() {
            return Err(corrupt(path, "no entries"));
        }

        let mut parsed = Vec::with_capacity(lines.len());
        for (number, line) in lines.iter().enumerate() {
            if line.is_empty() {
                return Err(corrupt(path, format!("empty line {} before end of file", number + 1)));
            }
            let Some((tag, code)) = parse_line(line) else {
                return Err(corrupt(path, format!("line {} is not 'tag code'", number + 1)));
            };
            if code.len() > MAX_CODE_LEN {
                return Err(corrupt(
                    path,
                    format!("code on line {} exceeds {MAX_CODE_LEN} bytes", number + 1),
                ));
            }
            parsed.push((tag, code));
        }

        let mut unclear_tag =
            options.unclear_tag.clone().unwrap_or_else(|| derived_unclear_tag(&parsed[0].0));
        if let Some(letter) = options.code_letter {
            let mut tail = unclear_tag.chars();
            tail.next();
            unclear_tag = format!("{letter}{}", tail.as_str());
        }

        let mut table = Self::build(unclear_tag, parsed, Some(path.to_path_buf()))?;
        if options.sort_by_tag {
            table.entries[1..].sort_by(|a, b| a.tag.cmp(&b.tag));
        }
        Ok(table)
    }

    /// Builds a table directly from `(tag, code)` pairs; used by tests and
    /// the loader.
    ///
    /// # Errors
    ///
    /// Returns [`Fqh4Error::Barcode`] on duplicate tags or unclear-tag
    /// collisions.
    pub fn from_entries(unclear_tag: &str, entries: &[(&str, &str)]) -> Result<Self> {
        let parsed =
            entries.iter().map(|(t, c)| ((*t).to_string(), c.as_bytes().to_vec())).collect();
        Self::build(unclear_tag.to_string(), parsed, None)
    }

    fn build(
        unclear_tag: String,
        parsed: Vec<(String, Vec<u8>)>,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let err_path = path.clone().unwrap_or_else(|| PathBuf::from("<memory>"));
        let mut entries = Vec::with_capacity(parsed.len() + 1);
        entries.push(BarcodeEntry { tag: unclear_tag, code: Vec::new() });

        let mut min_code_length = usize::MAX;
        let mut max_code_length = 0;
        for (tag, code) in parsed {
            if tag == entries[0].tag {
                return Err(corrupt(
                    &err_path,
                    format!("tag '{tag}' collides with the reserved unclear tag"),
                ));
            }
            if entries[1..].iter().any(|e| e.tag == tag) {
                return Err(corrupt(&err_path, format!("duplicate tag '{tag}'")));
            }
            min_code_length = min_code_length.min(code.len());
            max_code_length = max_code_length.max(code.len());
            entries.push(BarcodeEntry { tag, code });
        }
        Ok(Self { entries, min_code_length, max_code_length, path })
    }

    /// Total entries including the reserved unclear entry at index 0.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the table holds no real entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// The `i`-th entry's tag.
    #[must_use]
    pub fn tag(&self, i: usize) -> &str {
        &self.entries[i].tag
    }

    /// The `i`-th entry's code; empty for index 0.
    #[must_use]
    pub fn code(&self, i: usize) -> &[u8] {
        &self.entries[i].code
    }

    /// The reserved unclear tag.
    #[must_use]
    pub fn unclear_tag(&self) -> &str {
        &self.entries[0].tag
    }

    /// Shortest code among entries 1..N.
    #[must_use]
    pub fn min_code_length(&self) -> usize {
        self.min_code_length
    }

    /// Longest code among entries 1..N.
    #[must_use]
    pub fn max_code_length(&self) -> usize {
        self.max_code_length
    }

    /// The file this table was loaded from, when it came from disk.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Entries 1..N, skipping the reserved unclear entry.
    pub fn codes(&self) -> impl Iterator<Item = &BarcodeEntry> {
        self.entries[1..].iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_basic() {
        let file = write_file("A01\tAAAA\nA02\tCCCC\nA03 GGGG\n");
        let bc = BarcodeTable::load(file.path(), &BarcodeOptions::default()).unwrap();
        assert_eq!(bc.len(), 4);
        assert_eq!(bc.unclear_tag(), "A00");
        assert_eq!(bc.tag(1), "A01");
        assert_eq!(bc.code(1), b"AAAA");
        assert_eq!(bc.tag(3), "A03");
        assert_eq!(bc.code(3), b"GGGG");
        assert_eq!(bc.min_code_length(), 4);
        assert_eq!(bc.max_code_length(), 4);
    }

    #[test]
    fn test_trailing_empty_lines_allowed() {
        let file = write_file("B1 ACGT\nB2 TTTT\n\n\n");
        let bc = BarcodeTable::load(file.path(), &BarcodeOptions::default()).unwrap();
        assert_eq!(bc.len(), 3);
        assert_eq!(bc.unclear_tag(), "B0");
    }

    #[test]
    fn test_interior_empty_line_rejected() {
        let file = write_file("B1 ACGT\n\nB2 TTTT\n");
        assert!(BarcodeTable::load(file.path(), &BarcodeOptions::default()).is_err());
    }

    #[test]
    fn test_tag_only_line_has_empty_code() {
        let file = write_file("S1\nS2 GT\n");
        let bc = BarcodeTable::load(file.path(), &BarcodeOptions::default()).unwrap();
        assert_eq!(bc.code(1), b"");
        assert_eq!(bc.code(2), b"GT");
        assert_eq!(bc.min_code_length(), 0);
        assert_eq!(bc.max_code_length(), 2);
    }

    #[test]
    fn test_unclear_tag_collision() {
        let file = write_file("A00 AAAA\nA01 CCCC\n");
        let err = BarcodeTable::load(file.path(), &BarcodeOptions::default()).unwrap_err();
        assert!(format!("{err}").contains("unclear tag"));
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let file = write_file("A01 AAAA\nA01 CCCC\n");
        assert!(BarcodeTable::load(file.path(), &BarcodeOptions::default()).is_err());
    }

    #[test]
    fn test_explicit_unclear_tag() {
        let file = write_file("A01 AAAA\n");
        let options =
            BarcodeOptions { unclear_tag: Some("XXX".to_string()), ..BarcodeOptions::default() };
        let bc = BarcodeTable::load(file.path(), &options).unwrap();
        assert_eq!(bc.unclear_tag(), "XXX");
    }

    #[test]
    fn test_code_letter_override() {
        let file = write_file("A01 AAAA\nA02 CCCC\n");
        let options = BarcodeOptions { code_letter: Some('P'), ..BarcodeOptions::default() };
        let bc = BarcodeTable::load(file.path(), &options).unwrap();
        assert_eq!(bc.unclear_tag(), "P00");
    }

    #[test]
    fn test_sort_by_tag() {
        let file = write_file("S3 GG\nS1 AA\nS2 CC\n");
        let options = BarcodeOptions { sort_by_tag: true, ..BarcodeOptions::default() };
        let bc = BarcodeTable::load(file.path(), &options).unwrap();
        // Unclear tag derives from the first entry *before* sorting.
        assert_eq!(bc.unclear_tag(), "S0");
        assert_eq!(bc.tag(1), "S1");
        assert_eq!(bc.tag(2), "S2");
        assert_eq!(bc.tag(3), "S3");
    }

    #[test]
    fn test_variable_code_lengths() {
        let file = write_file("S1 A\nS2 ACGTAC\n");
        let bc = BarcodeTable::load(file.path(), &BarcodeOptions::default()).unwrap();
        assert_eq!(bc.min_code_length(), 1);
        assert_eq!(bc.max_code_length(), 6);
    }

    #[test]
    fn test_over_long_code_rejected() {
        let file = write_file(&format!("S1 {}\n", "A".repeat(MAX_CODE_LEN + 1)));
        assert!(BarcodeTable::load(file.path(), &BarcodeOptions::default()).is_err());
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = write_file("\n\n");
        assert!(BarcodeTable::load(file.path(), &BarcodeOptions::default()).is_err());
    }
}
