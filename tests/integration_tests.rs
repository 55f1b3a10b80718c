//! Integration tests for fqh4.
//!
//! Run with: `cargo test --test integration_tests`
//!
//! These tests drive the whole pipeline over synthetic five-file read sets
//! and verify the demultiplexed output byte for byte.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use fqh4_lib::config::{self, Config};
use fqh4_lib::demux::{self, H4Pipeline};
use fqh4_lib::pool::ThreadPool;
use serde_json::{Value, json};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// One synthetic read tuple; the barcode regions are given as the bytes the
/// position arithmetic will extract.
#[derive(Clone)]
struct ReadSpec {
    name: String,
    d: String,
    b: String,
    a: String,
    c: String,
    /// First bytes of R4, matched against the stagger table.
    stagger: String,
    /// R4 payload after the stagger+barcode prefix.
    tail: String,
    plate: Option<String>,
}

impl ReadSpec {
    fn clean(i: usize) -> Self {
        Self {
            name: format!("read{i}"),
            d: "AAAA".into(),
            b: "AAAA".into(),
            a: "AAAA".into(),
            c: "AAAA".into(),
            stagger: "AC".into(),
            tail: "ACGTACGTACGTACGT".into(),
            plate: Some("ACGT".into()),
        }
    }

    /// `R2.seq || R3.seq`: D, skipped byte, B, A, skipped byte, C.
    fn rx(&self) -> String {
        format!("{}N{}{}N{}", self.d, self.b, self.a, self.c)
    }

    fn r4_seq(&self) -> String {
        format!("{}N{}{}", self.stagger, self.a, self.tail)
    }
}

fn quals(len: usize) -> String {
    "F".repeat(len)
}

fn record(name: &str, desc: &str, seq: &str) -> String {
    format!("@{name} {desc}\n{seq}\n+\n{}\n", quals(seq.len()))
}

fn write_gz(path: &Path, data: &[u8]) {
    let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap();
}

fn read_gz(path: &Path) -> Vec<u8> {
    let mut decoder = GzDecoder::new(File::open(path).unwrap());
    let mut data = Vec::new();
    decoder.read_to_end(&mut data).unwrap();
    data
}

fn read_raw(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

/// Writes barcode tables, read files, and the configuration document.
fn setup(dir: &TempDir, reads: &[ReadSpec], with_plate: bool) -> Value {
    let root = dir.path();
    let bc = root.join("barcodes");
    let fastq = root.join("reads");
    std::fs::create_dir_all(&bc).unwrap();
    std::fs::create_dir_all(&fastq).unwrap();

    for letter in ["A", "B", "C", "D"] {
        std::fs::write(
            bc.join(format!("{letter}.txt")),
            format!("{letter}1 AAAA\n{letter}2 CCCC\n"),
        )
        .unwrap();
    }
    // Entry order encodes the stagger offset: S1 shifts by 0, S2 by 1.
    std::fs::write(bc.join("stagger.txt"), "S1\nS2 GT\n").unwrap();
    std::fs::write(bc.join("plate.txt"), "P1 ACGT\nP2 TGCA\n").unwrap();

    let mut files: Vec<(String, Vec<u8>)> =
        ["R1", "R2", "R3", "R4", "I1"].iter().map(|n| ((*n).to_string(), Vec::new())).collect();
    for spec in reads {
        let rx = spec.rx();
        let (r2, r3) = rx.split_at(9);
        files[0].1.extend_from_slice(record(&spec.name, "desc extra", "ACGTACGTACGT").as_bytes());
        files[1].1.extend_from_slice(record(&spec.name, "1", r2).as_bytes());
        files[2].1.extend_from_slice(record(&spec.name, "2", r3).as_bytes());
        files[3].1.extend_from_slice(record(&spec.name, "3", &spec.r4_seq()).as_bytes());
        let i1 = format!("{}TTTT", spec.plate.as_deref().unwrap_or("ACGT"));
        files[4].1.extend_from_slice(record(&spec.name, "4", &i1).as_bytes());
    }
    for (name, data) in &files {
        write_gz(&fastq.join(format!("{name}.fastq.gz")), data);
    }

    let plate_file = if with_plate { "plate.txt" } else { "" };
    json!({
        "range": "",
        "pool_threads": 2,
        "barcodes": {
            "root": bc.to_str().unwrap(),
            "A": { "file": "A.txt", "unclear_tag": "" },
            "B": { "file": "B.txt", "unclear_tag": "" },
            "C": { "file": "C.txt", "unclear_tag": "" },
            "D": { "file": "D.txt", "unclear_tag": "" },
            "plate": { "file": plate_file, "unclear_tag": "" },
            "stagger": { "file": "stagger.txt", "unclear_tag": "" }
        },
        "reads": {
            "root": fastq.to_str().unwrap(),
            "R1": "R1.fastq.gz", "R2": "R2.fastq.gz",
            "R3": "R3.fastq.gz", "R4": "R4.fastq.gz",
            "I1": "I1.fastq.gz"
        },
        "output": {
            "root": root.join("out").to_str().unwrap(),
            "R1": "R1_out.fastq.gz",
            "R2": "R2_out.fastq.gz"
        }
    })
}

fn run(doc: &Value) -> (Config, demux::DemuxSummary) {
    let cfg = config::from_document(doc).unwrap();
    std::fs::create_dir_all(cfg.output_root()).unwrap();
    let pool = Arc::new(ThreadPool::new(2).unwrap());
    let summary = demux::run(&cfg, doc, pool).unwrap();
    (cfg, summary)
}

/// The header line the driver synthesizes for one read.
fn expected_header(spec: &ReadSpec, tags: [&str; 4], plate_tag: Option<&str>) -> String {
    let rx = spec.rx();
    let (r2, r3) = rx.split_at(9);
    let [ta, tc, tb, td] = tags;
    let mut line = format!("@{}\tBX:Z:{ta}{tc}{tb}{td}", spec.name);
    if let Some(p) = plate_tag {
        line.push('-');
        line.push_str(p);
    }
    line.push_str(&format!("\tRX:Z:{r2}{r3}"));
    if plate_tag.is_some() {
        line.push_str(&format!("+{}TTTT", spec.plate.as_deref().unwrap()));
    }
    line.push_str(&format!("\tQX:Z:{}{}", quals(r2.len()), quals(r3.len())));
    if plate_tag.is_some() {
        line.push('+');
        line.push_str(&quals(8));
    }
    line.push('\n');
    line
}

#[test]
fn test_exact_match_all_dimensions() {
    let dir = TempDir::new().unwrap();
    let reads: Vec<ReadSpec> = (0..3).map(ReadSpec::clean).collect();
    let doc = setup(&dir, &reads, true);
    let (cfg, summary) = run(&doc);

    assert_eq!(summary.records, 3);
    assert_eq!(summary.any_invalid, 0);
    // The clean stagger prefix "AC" ties between "" and "GT" (both at
    // distance 2), so sn stays 0 and the read counts as unclear.
    assert_eq!(summary.any_unclear, 3);

    let r1_out = read_gz(&cfg.output_root().join("R1_out.fastq.gz"));
    let mut expected = String::new();
    for spec in &reads {
        expected.push_str(&expected_header(spec, ["A1", "C1", "B1", "D1"], Some("P1")));
        expected.push_str("ACGTACGTACGT\n+\n");
        expected.push_str(&quals(12));
        expected.push('\n');
    }
    assert_eq!(String::from_utf8(r1_out).unwrap(), expected);

    // R2_out: header line plus R4 with stagger(2) + gap(1) + |A| bytes
    // clipped from seq and qual.
    let r2_out = read_gz(&cfg.output_root().join("R2_out.fastq.gz"));
    let mut expected = String::new();
    for spec in &reads {
        expected.push_str(&expected_header(spec, ["A1", "C1", "B1", "D1"], Some("P1")));
        let r4 = spec.r4_seq();
        expected.push_str(&r4[7..]);
        expected.push_str("\n+\n");
        expected.push_str(&quals(r4.len())[7..]);
        expected.push('\n');
    }
    assert_eq!(String::from_utf8(r2_out).unwrap(), expected);

    // The effective configuration is persisted next to the outputs.
    let persisted: Value =
        serde_json::from_str(&String::from_utf8(read_raw(&cfg.output_root().join("H4.json"))).unwrap())
            .unwrap();
    assert_eq!(persisted, doc);
}

#[test]
fn test_single_substitution_corrected() {
    let dir = TempDir::new().unwrap();
    let mut spec = ReadSpec::clean(0);
    spec.a = "AACA".into(); // one substitution away from A1's AAAA
    let doc = setup(&dir, &[spec.clone()], true);
    let (cfg, summary) = run(&doc);

    assert_eq!(summary.any_invalid, 0);
    let r1_out = String::from_utf8(read_gz(&cfg.output_root().join("R1_out.fastq.gz"))).unwrap();
    // Corrected to A1: the tag is used even though the bases differ.
    assert!(r1_out.contains("\tBX:Z:A1C1B1D1-P1\t"), "got: {r1_out}");
}

#[test]
fn test_tie_yields_unclear_tag() {
    let dir = TempDir::new().unwrap();
    let mut spec = ReadSpec::clean(0);
    spec.a = "ATNN".into();
    let doc = setup(&dir, &[spec], true);
    // Replace table A with entries that tie for the query.
    let bc_root = Path::new(doc["barcodes"]["root"].as_str().unwrap()).to_path_buf();
    std::fs::write(bc_root.join("A.txt"), "A1 AAAA\nA2 TTTT\n").unwrap();
    let (cfg, summary) = run(&doc);

    // ATNN is distance 3 from both AAAA and TTTT: unclear, tag A0.
    assert_eq!(summary.any_unclear, 1);
    let r1_out = String::from_utf8(read_gz(&cfg.output_root().join("R1_out.fastq.gz"))).unwrap();
    assert!(r1_out.contains("\tBX:Z:A0C1B1D1-P1\t"), "got: {r1_out}");
}

#[test]
fn test_stagger_shift_widens_a_extraction() {
    let dir = TempDir::new().unwrap();
    let mut spec = ReadSpec::clean(0);
    // R4 starts with S2's code: offset 1, so A is extracted 5 bytes wide.
    spec.stagger = "GT".into();
    spec.a = "AAAAA".into();
    let doc = setup(&dir, &[spec.clone()], true);
    let (cfg, summary) = run(&doc);

    // The 5-byte query is one deletion from AAAA: corrected, not unclear.
    assert_eq!(summary.any_unclear, 0);
    assert_eq!(summary.any_invalid, 0);
    let r1_out = String::from_utf8(read_gz(&cfg.output_root().join("R1_out.fastq.gz"))).unwrap();
    assert!(r1_out.contains("\tBX:Z:A1C1B1D1-P1\t"), "got: {r1_out}");

    // Clipping uses the matched entry's code length (4), not the query's 5.
    let r2_out = String::from_utf8(read_gz(&cfg.output_root().join("R2_out.fastq.gz"))).unwrap();
    let r4 = spec.r4_seq();
    assert!(r2_out.contains(&format!("\n{}\n", &r4[7..])), "got: {r2_out}");
}

#[test]
fn test_plate_disabled_omits_i1() {
    let dir = TempDir::new().unwrap();
    let reads: Vec<ReadSpec> = (0..2).map(ReadSpec::clean).collect();
    let doc = setup(&dir, &reads, false);
    // No I1 file is needed at all when the plate dimension is off.
    std::fs::remove_file(
        Path::new(doc["reads"]["root"].as_str().unwrap()).join("I1.fastq.gz"),
    )
    .unwrap();
    let (cfg, summary) = run(&doc);

    assert_eq!(summary.records, 2);
    let r1_out = String::from_utf8(read_gz(&cfg.output_root().join("R1_out.fastq.gz"))).unwrap();
    let mut expected = String::new();
    for spec in &reads {
        expected.push_str(&expected_header(spec, ["A1", "C1", "B1", "D1"], None));
        expected.push_str("ACGTACGTACGT\n+\n");
        expected.push_str(&quals(12));
        expected.push('\n');
    }
    assert_eq!(r1_out, expected);
}

#[test]
fn test_range_selects_subset() {
    let dir = TempDir::new().unwrap();
    let reads: Vec<ReadSpec> = (0..10).map(ReadSpec::clean).collect();
    let mut doc = setup(&dir, &reads, true);
    config::apply_replace(&mut doc, r#"{"/range": "2:3"}"#).unwrap();
    let (cfg, summary) = run(&doc);

    assert_eq!(summary.records, 3);
    let r1_out = String::from_utf8(read_gz(&cfg.output_root().join("R1_out.fastq.gz"))).unwrap();
    assert!(!r1_out.contains("@read1\t"));
    assert!(r1_out.contains("@read2\t"));
    assert!(r1_out.contains("@read4\t"));
    assert!(!r1_out.contains("@read5\t"));
}

#[test]
fn test_range_past_input_end_fails() {
    let dir = TempDir::new().unwrap();
    let reads: Vec<ReadSpec> = (0..4).map(ReadSpec::clean).collect();
    let mut doc = setup(&dir, &reads, true);
    config::apply_replace(&mut doc, r#"{"/range": "100"}"#).unwrap();

    let cfg = config::from_document(&doc).unwrap();
    std::fs::create_dir_all(cfg.output_root()).unwrap();
    let pool = Arc::new(ThreadPool::new(2).unwrap());
    let err = demux::run(&cfg, &doc, pool).unwrap_err();
    assert!(format!("{err}").contains("read range starts at 100"));
}

#[test]
fn test_mismatched_input_lengths_fail() {
    let dir = TempDir::new().unwrap();
    let reads: Vec<ReadSpec> = (0..6).map(ReadSpec::clean).collect();
    let doc = setup(&dir, &reads, true);

    // Rewrite R3 one record short.
    let fastq_root = Path::new(doc["reads"]["root"].as_str().unwrap()).to_path_buf();
    let mut r3 = Vec::new();
    for spec in &reads[..5] {
        let rx = spec.rx();
        r3.extend_from_slice(record(&spec.name, "2", rx.split_at(9).1).as_bytes());
    }
    write_gz(&fastq_root.join("R3.fastq.gz"), &r3);

    let cfg = config::from_document(&doc).unwrap();
    std::fs::create_dir_all(cfg.output_root()).unwrap();
    let pool = Arc::new(ThreadPool::new(2).unwrap());
    let err = demux::run(&cfg, &doc, pool).unwrap_err();
    assert!(format!("{err}").contains("inconsistent number of records"));
}

#[test]
fn test_thread_counts_produce_identical_output() {
    let dir = TempDir::new().unwrap();
    let reads: Vec<ReadSpec> = (0..2000)
        .map(|i| {
            let mut spec = ReadSpec::clean(i);
            // Mix of clean, corrected, and shifted reads.
            match i % 3 {
                1 => spec.a = "AACA".into(),
                2 => {
                    spec.stagger = "GT".into();
                    spec.a = "AAAAA".into();
                }
                _ => {}
            }
            spec.plate = Some(if i % 2 == 0 { "ACGT".into() } else { "TGCA".into() });
            spec
        })
        .collect();

    let mut outputs = Vec::new();
    for threads in [1usize, 8] {
        let doc = setup(&dir, &reads, true);
        let cfg = config::from_document(&doc).unwrap();
        let out_root = cfg.output_root();
        if out_root.exists() {
            std::fs::remove_dir_all(&out_root).unwrap();
        }
        std::fs::create_dir_all(&out_root).unwrap();

        let pool = Arc::new(ThreadPool::new(threads).unwrap());
        let mut pipeline = H4Pipeline::new(&cfg, pool).unwrap();
        pipeline.set_block_size(128); // force many interleaved match jobs
        let summary = pipeline.run().unwrap();
        assert_eq!(summary.records, 2000);

        outputs.push((
            read_raw(&out_root.join("R1_out.fastq.gz")),
            read_raw(&out_root.join("R2_out.fastq.gz")),
        ));
    }

    // Output must not depend on worker count, compressed bytes included.
    assert_eq!(outputs[0].0, outputs[1].0);
    assert_eq!(outputs[0].1, outputs[1].1);
}

#[test]
fn test_dry_run_survives_missing_files() {
    let doc = json!({
        "range": "0-100",
        "barcodes": {
            "root": "/nonexistent",
            "A": { "file": "A.txt", "unclear_tag": "" },
            "B": { "file": "B.txt", "unclear_tag": "" },
            "C": { "file": "C.txt", "unclear_tag": "" },
            "D": { "file": "D.txt", "unclear_tag": "" },
            "plate": { "file": "", "unclear_tag": "" },
            "stagger": { "file": "stagger.txt", "unclear_tag": "" }
        },
        "reads": {
            "root": "/nonexistent",
            "R1": "R1.fastq.gz", "R2": "R2.fastq.gz",
            "R3": "R3.fastq.gz", "R4": "R4.fastq.gz"
        },
        "output": { "root": "/nonexistent/out", "R1": "a.gz", "R2": "" }
    });
    let cfg = config::from_document(&doc).unwrap();
    demux::dry_run(&cfg); // must not panic or fail
}
