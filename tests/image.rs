use clap::Parser;
use meripper::cmd::Cmd;
use meripper::cpd::encode;
use meripper::extract::Verdict;
use meripper::fpt::{encode_entry, encode_header};
use meripper::manifest::{Release, Variant};
use meripper::verify::sha256;
use meripper::{DecodeError, Scanner, analyze, extract_image};
use proptest::prelude::*;
use std::fs;

const MANIFEST_SIZE: usize = 0x284;
const PARTITION: usize = 0x1000;
const MANIFEST_AT: usize = 0x100;
const KERNEL_MET_AT: usize = 0x800;
const UPDATE_MET_AT: usize = 0x900;
const KERNEL_AT: usize = 0xA00;
const UPDATE_AT: usize = 0xC00;
const MODULE_SIZE: usize = 0x100;

fn record(tag: u32, body: &[u8]) -> Vec<u8> {
    let mut out = tag.to_le_bytes().to_vec();
    out.extend_from_slice(&((body.len() + 8) as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn reversed(mut hash: [u8; 32]) -> [u8; 32] {
    hash.reverse();
    hash
}

/// Extension 0x0A for a module stored with `compression`.
fn module_attributes(compression: u8, size: u32, hash: [u8; 32]) -> Vec<u8> {
    let mut body = vec![compression, 0, 0, 0];
    body.extend_from_slice(&size.to_le_bytes());
    body.extend_from_slice(&size.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0x8086u16.to_le_bytes());
    body.extend_from_slice(&reversed(hash));
    record(0x0A, &body)
}

fn metadata_hash(name: &str, hash: [u8; 32]) -> Vec<u8> {
    let mut out = vec![0u8; 12];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&[0, 2, 0x20, 0]);
    out.extend_from_slice(&0x38u32.to_le_bytes());
    out.extend_from_slice(&reversed(hash));
    out
}

/// Extension 0x03. The partition hash field starts with the partition
/// name so the recovery manifest probe finds it.
fn partition_info(size: u32, modules: &[Vec<u8>]) -> Vec<u8> {
    let mut body = b"FTPR".to_vec();
    body.extend_from_slice(&size.to_le_bytes());
    let mut hash = [0u8; 32];
    hash[..4].copy_from_slice(b"FTPR");
    body.extend_from_slice(&hash);
    body.extend_from_slice(&1u32.to_le_bytes());
    body.extend_from_slice(&[0u8; 12]);
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&[0u8; 20]);
    for m in modules {
        body.extend_from_slice(m);
    }
    record(0x03, &body)
}

fn manifest_header() -> Vec<u8> {
    let mut out = vec![0u8; MANIFEST_SIZE];
    out[0x04..0x08].copy_from_slice(&((MANIFEST_SIZE / 4) as u32).to_le_bytes());
    out[0x10..0x14].copy_from_slice(&0x8086u32.to_le_bytes());
    out[0x14] = 0x01;
    out[0x15] = 0x12;
    out[0x16..0x18].copy_from_slice(&0x2017u16.to_le_bytes());
    out[0x18..0x1C].copy_from_slice(&((MANIFEST_SIZE / 4) as u32).to_le_bytes());
    out[0x1C..0x20].copy_from_slice(b"$MN2");
    for (i, part) in [11u16, 6, 10, 1196].iter().enumerate() {
        out[0x24 + i * 2..0x26 + i * 2].copy_from_slice(&part.to_le_bytes());
    }
    out
}

fn region() -> Vec<u8> {
    region_with(0)
}

/// `kernel_compression` is stored in the kernel's metadata.
fn region_with(kernel_compression: u8) -> Vec<u8> {
    let mut buf = vec![0xFFu8; 0x4000];
    buf[..0x10].fill(0);
    buf[0x10..0x30].copy_from_slice(&encode_header(1, 0x20, 0x30, 0));
    buf[0x30..0x50].copy_from_slice(&encode_entry(b"FTPR", PARTITION as u32, 0x2000));
    let sum = buf[..0x30].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    buf[0x1B] = 0u8.wrapping_sub(sum);

    let kernel: Vec<u8> = (0..MODULE_SIZE).map(|i| i as u8).collect();
    let update = vec![0x5Au8; MODULE_SIZE];
    let kernel_met = module_attributes(kernel_compression, MODULE_SIZE as u32, sha256(&kernel));
    let update_met = module_attributes(0, MODULE_SIZE as u32, sha256(&update));
    let mut man = manifest_header();
    man.extend(partition_info(
        0x2000,
        &[
            metadata_hash("kernel", sha256(&kernel_met)),
            metadata_hash("fwupdate", sha256(&update_met)),
        ],
    ));

    let dir = encode(
        b"FTPR",
        &[
            ("FTPR.man", MANIFEST_AT as u32, man.len() as u32),
            ("kernel.met", KERNEL_MET_AT as u32, kernel_met.len() as u32),
            ("fwupdate.met", UPDATE_MET_AT as u32, update_met.len() as u32),
            ("kernel", KERNEL_AT as u32, MODULE_SIZE as u32),
            ("fwupdate", UPDATE_AT as u32, MODULE_SIZE as u32),
        ],
    );
    let mut put = |at: usize, data: &[u8]| buf[PARTITION + at..PARTITION + at + data.len()].copy_from_slice(data);
    put(0, &dir);
    put(MANIFEST_AT, &man);
    put(KERNEL_MET_AT, &kernel_met);
    put(UPDATE_MET_AT, &update_met);
    put(KERNEL_AT, &kernel);
    put(UPDATE_AT, &update);
    buf
}

#[test]
fn analyzes_synthetic_region() {
    let buf = region();
    let analysis = analyze(&buf, &Scanner::new().unwrap(), None).unwrap();

    assert_eq!(analysis.variant, Variant::Me);
    assert_eq!(analysis.version_string(), "11.6.10.1196");
    assert_eq!(analysis.date, "2017-12-01");
    assert_eq!(analysis.release, Release::Production);
    assert_eq!(analysis.anchor.tag, PARTITION + MANIFEST_AT + 0x1C);

    let ftpr = &analysis.cpds[0];
    assert!(ftpr.checksum_valid);
    assert_eq!(ftpr.partition_size, Some(0x2000));
    let names: Vec<_> = ftpr.all().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["FTPR.man", "kernel.met", "fwupdate.met", "kernel", "fwupdate"]);

    let diag = &analysis.diagnostics;
    assert!(diag.errors().iter().all(|e| e.contains("RSA Signature")), "{diag:?}");
    assert!(diag.warnings().iter().any(|w| w.contains("unneeded padding")), "{diag:?}");
}

#[test]
fn corrupt_module_only_fails_itself() {
    let scanner = Scanner::new().unwrap();
    let verdicts = |buf: &[u8]| {
        let analysis = analyze(buf, &scanner, None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let summary = extract_image(buf, &analysis, dir.path(), None).unwrap();
        summary
            .modules
            .iter()
            .map(|m| (m.name.clone(), m.verdict))
            .collect::<Vec<_>>()
    };

    let clean = region();
    let before = verdicts(&clean);
    for name in ["kernel.met", "fwupdate.met", "kernel", "fwupdate"] {
        assert!(before.contains(&(name.to_string(), Verdict::Valid)), "{name}: {before:?}");
    }

    let mut broken = clean.clone();
    broken[PARTITION + KERNEL_AT + 0x10] ^= 0xFF;
    let after = verdicts(&broken);
    assert!(after.contains(&("kernel".to_string(), Verdict::Invalid)));
    assert!(after.contains(&("fwupdate".to_string(), Verdict::Valid)));
    assert!(after.contains(&("kernel.met".to_string(), Verdict::Valid)));
}

#[test]
fn extraction_layout() {
    let buf = region();
    let analysis = analyze(&buf, &Scanner::new().unwrap(), None).unwrap();
    let dir = tempfile::tempdir().unwrap();
    extract_image(&buf, &analysis, dir.path(), None).unwrap();

    let folder = dir.path().join("FTPR [001000]");
    assert_eq!(fs::read(folder.join("fwupdate.mod")).unwrap(), vec![0x5A; MODULE_SIZE]);
    assert!(folder.join("kernel.mod").is_file());
    assert!(folder.join("FTPR.man").is_file());
    let text = fs::read_to_string(folder.join("FTPR.man.txt")).unwrap();
    assert!(text.contains("Extension 03"));
    assert!(folder.join("kernel.met.txt").is_file());

    let dump = fs::read(dir.path().join("FTPR [001000].bin")).unwrap();
    assert_eq!(dump.len(), 0x2000);
    assert_eq!(&dump[..4], b"$CPD");
}

#[test]
fn huffman_modules_without_dictionary_are_noted() {
    let scanner = Scanner::new().unwrap();
    let mut analysis = analyze(&region(), &scanner, None).unwrap();
    analysis.note_missing_dictionary();
    assert!(analysis.diagnostics.notes().is_empty());

    let buf = region_with(1);
    let mut analysis = analyze(&buf, &scanner, None).unwrap();
    analysis.note_missing_dictionary();
    assert_eq!(
        analysis.diagnostics.notes(),
        ["1 Huffman compressed module(s) cannot be decoded without a Huffman dictionary!"]
    );

    let dir = tempfile::tempdir().unwrap();
    extract_image(&buf, &analysis, dir.path(), None).unwrap();
    assert!(dir.path().join("FTPR [001000]").join("kernel.huff").is_file());
}

#[test]
fn not_an_engine_image() {
    let scanner = Scanner::new().unwrap();
    let mut buf = vec![0u8; 0x2000];
    buf[0x100..0x104].copy_from_slice(b"$FPT");
    assert!(matches!(analyze(&buf, &scanner, None), Err(DecodeError::NoFirmwareSignature)));
}

#[test]
fn command_line_extracts_into_timestamped_folder() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("me.bin");
    fs::write(&image, region()).unwrap();
    let out = dir.path().join("out");

    let cmd = Cmd::try_parse_from([
        "meripper",
        image.to_str().unwrap(),
        "-x",
        "-q",
        "--dfpt",
        "-o",
        out.to_str().unwrap(),
    ])
    .unwrap();
    cmd.run().unwrap();

    let stamped: Vec<_> = fs::read_dir(&out).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(stamped.len(), 1);
    assert!(stamped[0].file_name().unwrap().to_string_lossy().starts_with("meripper_"));
    let module = stamped[0].join("me.bin").join("FTPR [001000]").join("kernel.mod");
    assert!(module.is_file());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn truncated_images_never_panic(len in 0usize..0x4000) {
        let buf = region();
        let scanner = Scanner::new().unwrap();
        let _ = analyze(&buf[..len], &scanner, None);
    }

    #[test]
    fn scribbled_images_never_panic(at in 0usize..0x4000, value: u8) {
        let mut buf = region();
        buf[at] = value;
        let scanner = Scanner::new().unwrap();
        let _ = analyze(&buf, &scanner, None);
    }
}
