//! Bounded Levenshtein matching against barcode tables.
//!
//! The hot path is [`bounded_edit_distance`]: a single-row DP that strips
//! common prefixes and suffixes first and abandons a row as soon as its
//! minimum reaches the bound (the distance can only grow from there). Table
//! scans chain the bound as `best + 1`, so most entries are rejected after a
//! couple of rows.

use crate::barcode::BarcodeTable;

/// Plain two-row Levenshtein distance; the reference implementation.
#[must_use]
pub fn edit_distance(a: &[u8], b: &[u8]) -> usize {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut row: Vec<usize> = (0..=short.len()).collect();
    for (i, &lc) in long.iter().enumerate() {
        let mut diag = std::mem::replace(&mut row[0], i + 1);
        for (j, &sc) in short.iter().enumerate() {
            let cost = if sc == lc { diag } else { diag.min(row[j]).min(row[j + 1]) + 1 };
            diag = std::mem::replace(&mut row[j + 1], cost);
        }
    }
    row[short.len()]
}

/// Levenshtein distance truncated to `bound`:
/// `bounded_edit_distance(a, b, bound) == min(edit_distance(a, b), bound)`.
#[must_use]
pub fn bounded_edit_distance(a: &[u8], b: &[u8], bound: usize) -> usize {
    let (mut short, mut long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    // Matching prefixes and suffixes cannot change the distance.
    let prefix = short.iter().zip(long).take_while(|(x, y)| x == y).count();
    short = &short[prefix..];
    long = &long[prefix..];
    let suffix = short
        .iter()
        .rev()
        .zip(long.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    short = &short[..short.len() - suffix];
    long = &long[..long.len() - suffix];

    if short.is_empty() {
        return long.len().min(bound);
    }

    let mut row: Vec<usize> = (0..=short.len()).collect();
    for (i, &lc) in long.iter().enumerate() {
        let mut diag = std::mem::replace(&mut row[0], i + 1);
        let mut row_min = row[0];
        for (j, &sc) in short.iter().enumerate() {
            let cost = if sc == lc { diag } else { diag.min(row[j]).min(row[j + 1]) + 1 };
            diag = std::mem::replace(&mut row[j + 1], cost);
            row_min = row_min.min(cost);
        }
        if row_min >= bound {
            return bound; // can only get worse
        }
    }
    row[short.len()].min(bound)
}

/// Outcome class of a table match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Query shorter than the required length; no scan performed.
    Invalid,
    /// Two or more entries tie at the minimum distance.
    Unclear,
    /// Exact match, distance zero.
    Correct,
    /// Unique minimum at distance one or more.
    Corrected,
}

/// Result of matching a query against a barcode table.
#[derive(Debug, Clone, Copy)]
pub struct Match {
    /// Entry index; 0 (the reserved unclear entry) for `Invalid`/`Unclear`.
    pub idx: usize,
    /// Best edit distance found; `usize::MAX` for `Invalid`.
    pub ed: usize,
    /// Outcome class.
    pub kind: MatchKind,
}

impl Match {
    /// The no-scan result for short queries.
    #[must_use]
    pub fn invalid() -> Self {
        Self { idx: 0, ed: usize::MAX, kind: MatchKind::Invalid }
    }

    /// True for `Correct` and `Corrected` outcomes.
    #[must_use]
    pub fn matched(&self) -> bool {
        matches!(self.kind, MatchKind::Correct | MatchKind::Corrected)
    }
}

/// Scans entries 1..N of `table` for the closest code to `query`.
///
/// A query shorter than `required_len` is `Invalid` without probing the
/// table. An exact match returns `Correct` immediately. A tie at the current
/// minimum marks the result `Unclear`; a later strict improvement clears the
/// tie. `Unclear` results report index 0, the reserved unclear entry.
#[must_use]
pub fn min_edit_distance(query: &[u8], required_len: usize, table: &BarcodeTable) -> Match {
    if query.len() < required_len {
        return Match::invalid();
    }
    let mut best = usize::MAX;
    let mut idx = 0;
    let mut kind = MatchKind::Unclear;
    for i in 1..table.len() {
        let ed = bounded_edit_distance(query, table.code(i), best.saturating_add(1));
        if ed < best {
            best = ed;
            idx = i;
            if ed == 0 {
                return Match { idx, ed, kind: MatchKind::Correct };
            }
            kind = MatchKind::Corrected;
        } else if ed == best {
            kind = MatchKind::Unclear;
        }
    }
    if kind == MatchKind::Unclear {
        idx = 0;
    }
    Match { idx, ed: best, kind }
}
