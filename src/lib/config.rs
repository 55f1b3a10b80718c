//! Configuration document handling.
//!
//! The run is described by a JSON document (see the README for the shape).
//! The document is parsed into a [`serde_json::Value`] first so `--replace`
//! overrides can be applied through RFC 6901 pointers, then deserialized into
//! the typed [`Config`]. The post-replace document is what gets persisted to
//! `<output.root>/H4.json` after a successful run.

use crate::barcode::BarcodeOptions;
use crate::errors::{Fqh4Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Half-open record index range `[lo, hi)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRange {
    /// First record processed.
    pub lo: usize,
    /// One past the last record processed; `usize::MAX` for unbounded.
    pub hi: usize,
}

impl ReadRange {
    /// The unbounded range.
    #[must_use]
    pub fn full() -> Self {
        Self { lo: 0, hi: usize::MAX }
    }
}

impl FromStr for ReadRange {
    type Err = Fqh4Error;

    /// Grammar: `""` = all; `"N"` = `[N, inf)`; `"A-B"` = `[A, B)`;
    /// `"A:N"` = `[A, A+N)`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Fqh4Error::InvalidRange {
            value: s.to_string(),
            reason: reason.to_string(),
        };
        if s.is_empty() {
            return Ok(Self::full());
        }
        let parse = |num: &str, what: &str| {
            num.parse::<usize>().map_err(|_| invalid(&format!("{what} is not a number")))
        };
        let range = if let Some((lo, hi)) = s.split_once('-') {
            Self { lo: parse(lo, "start")?, hi: parse(hi, "end")? }
        } else if let Some((lo, count)) = s.split_once(':') {
            let lo = parse(lo, "start")?;
            Self { lo, hi: lo.saturating_add(parse(count, "count")?) }
        } else {
            Self { lo: parse(s, "start")?, hi: usize::MAX }
        };
        if range.lo >= range.hi {
            return Err(invalid("start must be below end"));
        }
        Ok(range)
    }
}

/// Per-table barcode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarcodeSpec {
    /// File name below `barcodes.root`; empty disables the table (plate only).
    #[serde(default)]
    pub file: String,
    /// Tag written for unassignable reads. Required; an empty string derives
    /// it from the first entry (`A01 -> A00`).
    pub unclear_tag: String,
    /// Single letter replacing the unclear tag's leading letter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_letter: Option<String>,
    /// Sort entries by tag after loading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by_tag: Option<bool>,
}

impl BarcodeSpec {
    /// Converts the settings into loader options.
    ///
    /// # Errors
    ///
    /// Returns a config error if `code_letter` is not exactly one character.
    pub fn options(&self) -> Result<BarcodeOptions> {
        let code_letter = match self.code_letter.as_deref() {
            None => None,
            Some(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c),
                    _ => {
                        return Err(Fqh4Error::Config {
                            reason: format!("code_letter '{s}' must be a single character"),
                        });
                    }
                }
            }
        };
        let unclear_tag =
            if self.unclear_tag.is_empty() { None } else { Some(self.unclear_tag.clone()) };
        Ok(BarcodeOptions { unclear_tag, code_letter, sort_by_tag: self.sort_by_tag.unwrap_or(false) })
    }
}

/// The `barcodes` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarcodesConfig {
    /// Directory holding the barcode files.
    pub root: String,
    /// Cell barcode dimension A.
    #[serde(rename = "A")]
    pub a: BarcodeSpec,
    /// Cell barcode dimension B.
    #[serde(rename = "B")]
    pub b: BarcodeSpec,
    /// Cell barcode dimension C.
    #[serde(rename = "C")]
    pub c: BarcodeSpec,
    /// Cell barcode dimension D.
    #[serde(rename = "D")]
    pub d: BarcodeSpec,
    /// Plate barcode; absent or empty `file` disables the dimension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate: Option<BarcodeSpec>,
    /// Stagger table; entry order encodes the offset.
    pub stagger: BarcodeSpec,
}

/// The `reads` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadsConfig {
    /// Directory holding the FASTQ inputs.
    pub root: String,
    /// R1 file name.
    #[serde(rename = "R1")]
    pub r1: String,
    /// R2 file name.
    #[serde(rename = "R2")]
    pub r2: String,
    /// R3 file name.
    #[serde(rename = "R3")]
    pub r3: String,
    /// R4 file name.
    #[serde(rename = "R4")]
    pub r4: String,
    /// I1 file name; only opened when the plate dimension is enabled.
    #[serde(default, rename = "I1")]
    pub i1: String,
}

/// The `output` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output directory; created on run, must not pre-exist without --force.
    pub root: String,
    /// Tagged R1 output file name; empty disables it.
    #[serde(default, rename = "R1")]
    pub r1: String,
    /// Clipped R4 output file name; empty disables clipping output.
    #[serde(default, rename = "R2")]
    pub r2: String,
}

/// The full configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Record range expression; empty processes everything.
    #[serde(default)]
    pub range: String,
    /// Worker threads; defaults to the machine's available parallelism.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_threads: Option<usize>,
    /// Barcode tables.
    pub barcodes: BarcodesConfig,
    /// FASTQ inputs.
    pub reads: ReadsConfig,
    /// Outputs.
    pub output: OutputConfig,
}

impl Config {
    /// Parses and validates the record range.
    ///
    /// # Errors
    ///
    /// Returns [`Fqh4Error::InvalidRange`] on malformed expressions.
    pub fn read_range(&self) -> Result<ReadRange> {
        self.range.parse()
    }

    /// True when the plate dimension (and the I1 input) is active.
    #[must_use]
    pub fn plate_enabled(&self) -> bool {
        self.plate_spec().is_some()
    }

    /// The plate spec when present with a non-empty file.
    #[must_use]
    pub fn plate_spec(&self) -> Option<&BarcodeSpec> {
        self.barcodes.plate.as_ref().filter(|p| !p.file.is_empty())
    }

    /// Absolute path of a barcode file.
    #[must_use]
    pub fn barcode_path(&self, spec: &BarcodeSpec) -> PathBuf {
        expand_home(&self.barcodes.root).join(&spec.file)
    }

    /// Absolute path of a read input.
    #[must_use]
    pub fn read_path(&self, file: &str) -> PathBuf {
        expand_home(&self.reads.root).join(file)
    }

    /// The output root directory.
    #[must_use]
    pub fn output_root(&self) -> PathBuf {
        expand_home(&self.output.root)
    }
}

/// Expands a leading `~/` to the user's home directory.
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
    expand_home_with(path, home.as_deref())
}

fn expand_home_with(path: &str, home: Option<&std::ffi::OsStr>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => Path::new(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Reads and parses the configuration file into a JSON document.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid JSON.
pub fn load_document(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).map_err(|source| Fqh4Error::Open {
        kind: "configuration",
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text)
        .map_err(|e| Fqh4Error::Config { reason: format!("{}: {e}", path.display()) })
}

/// Applies one `--replace` argument: a JSON object mapping RFC 6901
/// pointers to replacement values.
///
/// # Errors
///
/// Returns a config error if the argument is not a JSON object or a pointer
/// cannot be resolved or created.
pub fn apply_replace(doc: &mut Value, replace: &str) -> Result<()> {
    let patch: Value = serde_json::from_str(replace)
        .map_err(|e| Fqh4Error::Config { reason: format!("--replace is not valid JSON: {e}") })?;
    let Value::Object(entries) = patch else {
        return Err(Fqh4Error::Config {
            reason: "--replace must be a JSON object of pointer/value pairs".to_string(),
        });
    };
    for (pointer, value) in entries {
        set_pointer(doc, &pointer, value)?;
    }
    Ok(())
}

/// Sets the value at an RFC 6901 pointer, creating intermediate objects.
fn set_pointer(doc: &mut Value, pointer: &str, value: Value) -> Result<()> {
    let bad = |reason: String| Fqh4Error::Config { reason };
    if !pointer.starts_with('/') {
        return Err(bad(format!("pointer '{pointer}' must start with '/'")));
    }
    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect();

    let mut current = doc;
    for (i, token) in tokens.iter().enumerate() {
        let is_last = i + 1 == tokens.len();
        match current {
            Value::Object(map) => {
                if is_last {
                    map.insert(token.clone(), value);
                    return Ok(());
                }
                current = map.entry(token.clone()).or_insert_with(|| Value::Object(Default::default()));
            }
            Value::Array(items) => {
                let index: usize = token
                    .parse()
                    .map_err(|_| bad(format!("'{token}' is not an array index in '{pointer}'")))?;
                let slot = items
                    .get_mut(index)
                    .ok_or_else(|| bad(format!("index {index} out of bounds in '{pointer}'")))?;
                if is_last {
                    *slot = value;
                    return Ok(());
                }
                current = slot;
            }
            _ => {
                return Err(bad(format!(
                    "pointer '{pointer}' descends into a non-container value"
                )));
            }
        }
    }
    unreachable!("pointer tokens exhausted without terminal assignment")
}

/// Deserializes the (post-replace) document into the typed configuration.
///
/// # Errors
///
/// Returns a config error naming the offending field on shape mismatches.
pub fn from_document(doc: &Value) -> Result<Config> {
    serde_json::from_value(doc.clone())
        .map_err(|e| Fqh4Error::Config { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_range_grammar() {
        assert_eq!("".parse::<ReadRange>().unwrap(), ReadRange::full());
        assert_eq!("7".parse::<ReadRange>().unwrap(), ReadRange { lo: 7, hi: usize::MAX });
        assert_eq!("5-100".parse::<ReadRange>().unwrap(), ReadRange { lo: 5, hi: 100 });
        assert_eq!("5:100".parse::<ReadRange>().unwrap(), ReadRange { lo: 5, hi: 105 });
        assert!("10-5".parse::<ReadRange>().is_err());
        assert!("5-5".parse::<ReadRange>().is_err());
        assert!("x-5".parse::<ReadRange>().is_err());
        assert!("5;9".parse::<ReadRange>().is_err());
    }

    #[test]
    fn test_expand_home() {
        let home = std::ffi::OsStr::new("/home/user");
        assert_eq!(expand_home_with("~/data", Some(home)), PathBuf::from("/home/user/data"));
        assert_eq!(expand_home_with("/abs/data", Some(home)), PathBuf::from("/abs/data"));
        assert_eq!(expand_home_with("rel/data", Some(home)), PathBuf::from("rel/data"));
        assert_eq!(expand_home_with("~/data", None), PathBuf::from("~/data"));
    }

    fn sample_doc() -> Value {
        json!({
            "range": "0-1000",
            "pool_threads": 8,
            "barcodes": {
                "root": "/bc",
                "A": { "file": "A.txt", "unclear_tag": "A00" },
                "B": { "file": "B.txt", "unclear_tag": "" },
                "C": { "file": "C.txt", "unclear_tag": "" },
                "D": { "file": "D.txt", "unclear_tag": "" },
                "plate": { "file": "plate.txt", "unclear_tag": "" },
                "stagger": { "file": "stagger.txt", "unclear_tag": "", "sort_by_tag": true }
            },
            "reads": {
                "root": "/reads",
                "R1": "r1.fastq.gz", "R2": "r2.fastq.gz",
                "R3": "r3.fastq.gz", "R4": "r4.fastq.gz",
                "I1": "i1.fastq.gz"
            },
            "output": { "root": "/out", "R1": "tagged.fastq.gz", "R2": "clipped.fastq.gz" }
        })
    }

    #[test]
    fn test_typed_deserialization() {
        let config = from_document(&sample_doc()).unwrap();
        assert_eq!(config.read_range().unwrap(), ReadRange { lo: 0, hi: 1000 });
        assert_eq!(config.pool_threads, Some(8));
        assert!(config.plate_enabled());
        assert_eq!(config.barcode_path(&config.barcodes.a), PathBuf::from("/bc/A.txt"));
        assert_eq!(config.read_path(&config.reads.r3), PathBuf::from("/reads/r3.fastq.gz"));
        assert_eq!(config.barcodes.stagger.options().unwrap().sort_by_tag, true);
        // An explicit unclear tag passes through; an empty one defers to
        // derivation at load time.
        assert_eq!(config.barcodes.a.options().unwrap().unclear_tag.as_deref(), Some("A00"));
        assert_eq!(config.barcodes.b.options().unwrap().unclear_tag, None);
    }

    #[test]
    fn test_missing_unclear_tag_is_config_error() {
        let mut doc = sample_doc();
        doc["barcodes"]["B"].as_object_mut().unwrap().remove("unclear_tag");
        let err = from_document(&doc).unwrap_err();
        assert!(format!("{err}").contains("unclear_tag"));
    }

    #[test]
    fn test_plate_disabled_by_empty_file() {
        let mut doc = sample_doc();
        apply_replace(&mut doc, r#"{"/barcodes/plate/file": ""}"#).unwrap();
        let config = from_document(&doc).unwrap();
        assert!(!config.plate_enabled());
    }

    #[test]
    fn test_replace_overrides_and_creates() {
        let mut doc = sample_doc();
        apply_replace(&mut doc, r#"{"/range": "0:50", "/barcodes/A/sort_by_tag": true}"#).unwrap();
        let config = from_document(&doc).unwrap();
        assert_eq!(config.read_range().unwrap(), ReadRange { lo: 0, hi: 50 });
        assert_eq!(config.barcodes.a.sort_by_tag, Some(true));
    }

    #[test]
    fn test_replace_rejects_non_object() {
        let mut doc = sample_doc();
        assert!(apply_replace(&mut doc, r#"["not", "an", "object"]"#).is_err());
        assert!(apply_replace(&mut doc, "not json at all").is_err());
    }

    #[test]
    fn test_missing_section_is_config_error() {
        let doc = json!({ "range": "0-10" });
        assert!(from_document(&doc).is_err());
    }

    #[test]
    fn test_code_letter_validation() {
        let spec = BarcodeSpec {
            file: "x".into(),
            unclear_tag: String::new(),
            code_letter: Some("PQ".into()),
            sort_by_tag: None,
        };
        assert!(spec.options().is_err());
    }
}
