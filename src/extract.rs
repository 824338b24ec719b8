//! Module extraction.
//!
//! [`materialize`] turns one resolved module into the bytes and file name
//! to store plus its verdict, without touching the filesystem. The
//! writers below lay those out per partition and add the extension text
//! dumps.

use crate::diag::Diagnostics;
use crate::error::DecodeResult;
use crate::ext;
use crate::huffman::{self, HuffmanDict};
use crate::manifest::ManifestHeader;
use crate::resolve::{Compression, Expected, ModuleAttributes, ModuleKind, ResolvedCpd};
use crate::verify::{self, SigStatus, SignatureVerdict};
use crate::view::decode_at;
use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Properties and dictionary size Intel uses for its LZMA modules.
const INTEL_LZMA_PROPS: &[u8] = b"\x36\x00\x40\x00\x00";

/// Zero bytes Intel inserts inside the `.lzma` header.
const LZMA_HEADER_GAP: std::ops::Range<usize> = 0xE..0x11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid,
    Unknown,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Valid => "VALID",
            Verdict::Invalid => "INVALID",
            Verdict::Unknown => "UNKNOWN",
        })
    }
}

impl From<&SignatureVerdict> for Verdict {
    fn from(v: &SignatureVerdict) -> Self {
        match v.status {
            SigStatus::Valid => Verdict::Valid,
            SigStatus::Invalid => Verdict::Invalid,
            SigStatus::Undetermined => Verdict::Unknown,
        }
    }
}

/// What a verdict was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Signature,
    Hash,
    Checksum,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Check::Signature => "RSA Signature",
            Check::Hash => "Hash",
            Check::Checksum => "Checksum",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Materialized {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub check: Check,
    pub verdict: Verdict,
    pub decompressed: bool,
    /// Decompression that did not happen, left as a warning.
    pub problem: Option<String>,
}

impl Materialized {
    fn new(file_name: String, bytes: Vec<u8>, check: Check, verdict: Verdict) -> Self {
        Materialized {
            file_name,
            bytes,
            check,
            verdict,
            decompressed: false,
            problem: None,
        }
    }
}

fn hash_verdict(expected: &Expected, digests: &[[u8; 32]]) -> Verdict {
    match expected {
        Expected::Sha256(hash) if digests.contains(hash) => Verdict::Valid,
        Expected::Sha256(_) => Verdict::Invalid,
        Expected::None | Expected::Checksum(_) => Verdict::Unknown,
    }
}

/// Stored bytes of a module, clamped to the image.
pub fn stored_bytes<'a>(buf: &'a [u8], module: &ModuleAttributes) -> &'a [u8] {
    let end = module
        .start
        .saturating_add(module.size_comp as usize)
        .min(buf.len());
    buf.get(module.start..end).unwrap_or(&[])
}

/// Decode an Intel `.lzma` module.
pub fn decompress_lzma(stored: &[u8]) -> io::Result<Vec<u8>> {
    let data: Cow<'_, [u8]> =
        if stored.starts_with(INTEL_LZMA_PROPS) && stored.get(LZMA_HEADER_GAP) == Some(&[0u8, 0, 0][..]) {
            let mut fixed = stored[..LZMA_HEADER_GAP.start].to_vec();
            fixed.extend_from_slice(&stored[LZMA_HEADER_GAP.end..]);
            Cow::Owned(fixed)
        } else {
            Cow::Borrowed(stored)
        };

    let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)?;
    let mut decoder = xz2::read::XzDecoder::new_stream(&data[..], stream);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => Ok(out),
        // Streams without an end marker stop at the end of the input.
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && !out.is_empty() => {
            debug!(decoded = out.len(), "LZMA stream ended without end marker");
            Ok(out)
        }
        Err(e) => Err(e),
    }
}

/// Decide the stored file for one module. Empty modules are skipped.
pub fn materialize(buf: &[u8], module: &ModuleAttributes, dict: Option<&HuffmanDict>) -> Option<Materialized> {
    if module.empty {
        return None;
    }
    let stored = stored_bytes(buf, module);
    let name = &module.name;

    Some(match module.kind {
        ModuleKind::Manifest | ModuleKind::Key => Materialized::new(
            name.clone(),
            stored.to_vec(),
            Check::Signature,
            Verdict::from(&*module.signature),
        ),
        ModuleKind::Metadata => Materialized::new(
            name.clone(),
            stored.to_vec(),
            Check::Hash,
            hash_verdict(&module.expected, &[verify::sha256(stored)]),
        ),
        ModuleKind::Microcode => {
            let verdict = match module.expected {
                Expected::Checksum(0) => Verdict::Valid,
                Expected::Checksum(_) => Verdict::Invalid,
                _ => Verdict::Unknown,
            };
            Materialized::new(format!("{name}.bin"), stored.to_vec(), Check::Checksum, verdict)
        }
        ModuleKind::Module | ModuleKind::Data => payload(stored, module, dict),
    })
}

fn payload(stored: &[u8], module: &ModuleAttributes, dict: Option<&HuffmanDict>) -> Materialized {
    let name = &module.name;
    if module.encrypted {
        return Materialized::new(format!("{name}.encr"), stored.to_vec(), Check::Hash, Verdict::Unknown);
    }

    match module.compression {
        Compression::None if module.expected == Expected::None => {
            Materialized::new(name.clone(), stored.to_vec(), Check::Hash, Verdict::Unknown)
        }
        Compression::None => Materialized::new(
            format!("{name}.mod"),
            stored.to_vec(),
            Check::Hash,
            hash_verdict(&module.expected, &[verify::sha256(stored)]),
        ),
        Compression::Lzma => {
            let compressed = verify::sha256(stored);
            match decompress_lzma(stored) {
                Ok(mut out) => {
                    let size = module.size_uncomp as usize;
                    if out.len() < size {
                        out.resize(size, 0xFF);
                    }
                    let verdict = hash_verdict(&module.expected, &[compressed, verify::sha256(&out)]);
                    Materialized {
                        decompressed: true,
                        ..Materialized::new(format!("{name}.mod"), out, Check::Hash, verdict)
                    }
                }
                Err(e) => Materialized {
                    problem: Some(format!("Failed to decompress LZMA module \"{name}\": {e}")),
                    ..Materialized::new(
                        format!("{name}.lzma"),
                        stored.to_vec(),
                        Check::Hash,
                        hash_verdict(&module.expected, &[compressed]),
                    )
                },
            }
        }
        Compression::Huffman => {
            let Some(dict) = dict else {
                return Materialized {
                    problem: Some(format!(
                        "Huffman module \"{name}\" was left compressed, no dictionary given"
                    )),
                    ..Materialized::new(format!("{name}.huff"), stored.to_vec(), Check::Hash, Verdict::Unknown)
                };
            };
            match huffman::decompress(stored, module.size_uncomp as usize, dict, name) {
                Ok(out) => {
                    let verdict = hash_verdict(&module.expected, &[verify::sha256(&out)]);
                    Materialized {
                        decompressed: true,
                        ..Materialized::new(format!("{name}.mod"), out, Check::Hash, verdict)
                    }
                }
                Err(e) => Materialized {
                    problem: Some(e.to_string()),
                    ..Materialized::new(format!("{name}.huff"), stored.to_vec(), Check::Hash, Verdict::Unknown)
                },
            }
        }
        Compression::Other(_) => Materialized::new(name.clone(), stored.to_vec(), Check::Hash, Verdict::Unknown),
    }
}

/// Extensions stored after a key's own manifest header.
pub fn key_extensions(buf: &[u8], key: &ModuleAttributes) -> Option<String> {
    let hdr = decode_at::<ManifestHeader>(buf, key.start).ok()?;
    let end = key.start.saturating_add(key.size_comp as usize);
    let scan = ext::scan(buf, key.start + hdr.header_bytes(), end, &key.name);
    Some(render(&scan.records))
}

fn render(records: &[ext::ExtRecord]) -> String {
    records
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn cpd_folder_name(name: &str, instance: Option<u32>, offset: usize) -> String {
    match instance {
        Some(inid) if name.contains("LOCL") || name.contains("WCOD") => {
            format!("{name} {inid:04X} [{offset:06X}]")
        }
        _ => format!("{name} [{offset:06X}]"),
    }
}

#[derive(Debug, Clone)]
pub struct ExtractedModule {
    pub partition: String,
    pub name: String,
    pub path: PathBuf,
    pub kind: ModuleKind,
    pub compression: Compression,
    pub check: Check,
    pub verdict: Verdict,
    /// Rendered extensions of manifests, metadata and keys.
    pub extensions: Option<String>,
}

#[derive(Debug, Default)]
pub struct ExtractSummary {
    pub modules: Vec<ExtractedModule>,
    pub partitions: Vec<PathBuf>,
    pub diagnostics: Diagnostics,
}

/// Write every non-empty module of `cpd` into its own folder under `base`.
pub fn extract_cpd(
    buf: &[u8],
    cpd: &ResolvedCpd,
    base: &Path,
    dict: Option<&HuffmanDict>,
    summary: &mut ExtractSummary,
) -> DecodeResult<PathBuf> {
    let folder = base.join(cpd_folder_name(&cpd.name, cpd.instance_id, cpd.offset));
    fs::create_dir_all(&folder)?;

    for module in cpd.all() {
        let Some(out) = materialize(buf, module, dict) else {
            debug!(partition = %cpd.name, module = %module.name, "skipping empty module");
            continue;
        };
        let path = folder.join(&out.file_name);
        fs::write(&path, &out.bytes)?;
        if out.decompressed {
            info!(module = %module.name, "decompressed {}", module.compression.name());
        }
        if let Some(problem) = out.problem {
            summary.diagnostics.warning(problem);
        }

        let extensions = match module.kind {
            ModuleKind::Manifest | ModuleKind::Metadata => cpd.extensions_of(&module.name).map(render),
            ModuleKind::Key => key_extensions(buf, module),
            _ => None,
        };
        if let Some(text) = &extensions {
            fs::write(folder.join(format!("{}.txt", out.file_name)), text)?;
        }

        summary.modules.push(ExtractedModule {
            partition: cpd.name.clone(),
            name: module.name.clone(),
            path,
            kind: module.kind,
            compression: module.compression,
            check: out.check,
            verdict: out.verdict,
            extensions,
        });
    }
    Ok(folder)
}

/// A raw partition to copy out of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDump {
    /// Name, with the instance id or BPDT type where one applies.
    pub label: String,
    pub start: usize,
    pub size: usize,
}

impl PartitionDump {
    pub fn file_name(&self) -> String {
        format!("{} [{:06X}].bin", self.label, self.start)
    }
}

pub fn dump_partitions(
    buf: &[u8],
    dumps: &[PartitionDump],
    dir: &Path,
    summary: &mut ExtractSummary,
) -> DecodeResult<()> {
    fs::create_dir_all(dir)?;
    for dump in dumps {
        let end = dump.start.saturating_add(dump.size).min(buf.len());
        let Some(data) = buf.get(dump.start..end).filter(|d| !d.is_empty()) else {
            debug!(label = %dump.label, "partition lies outside the image");
            continue;
        };
        let path = dir.join(dump.file_name());
        fs::write(&path, data)?;
        summary.partitions.push(path);
    }
    Ok(())
}
