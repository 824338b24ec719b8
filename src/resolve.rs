//! Module Attribute Resolver.
//!
//! Merges a `$CPD` directory with the extensions of its manifest and
//! metadata entries into one [`ModuleAttributes`] row per module. The
//! manifest and metadata entries are walked first, since module rows are
//! created by their extensions; every other entry is classified in a
//! second pass.

use crate::cpd::CpdDirectory;
use crate::error::DecodeError;
use crate::ext::{self, ExtRecord, Extension, SkuAttributes};
use crate::manifest::ManifestHeader;
use crate::scan::{Anchor, ManifestAnchor, Scanner};
use crate::verify::{self, SignatureVerdict};
use crate::view::{decode_at, is_padding, slice_at, tag_at, u32_at};
use std::sync::Arc;
use tracing::debug;

/// Boot-chain modules described by the single `IBBP` metadata record.
const BOOT_CHAIN: [&str; 3] = ["IBBL", "IBB", "OBB"];

/// Distance searched around a manifest for its directory and vice versa.
const LOCATOR_WINDOW: usize = 0x1000;

/// Offset of the declared length inside a microcode update header.
const MICROCODE_SIZE_OFFSET: usize = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Huffman,
    Lzma,
    Other(u8),
}

impl Compression {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Compression::None,
            1 => Compression::Huffman,
            2 => Compression::Lzma,
            other => Compression::Other(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "Uncompressed",
            Compression::Huffman => "Huffman",
            Compression::Lzma => "LZMA",
            Compression::Other(_) => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Manifest,
    Metadata,
    Module,
    Key,
    Microcode,
    Data,
}

/// What a module's content is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    None,
    Sha256([u8; 32]),
    /// Microcode additive checksum, zero when valid.
    Checksum(u32),
}

#[derive(Debug, Clone)]
pub struct ModuleAttributes {
    pub name: String,
    pub kind: ModuleKind,
    pub compression: Compression,
    pub encrypted: bool,
    pub start: usize,
    pub size_comp: u32,
    pub size_uncomp: u32,
    pub empty: bool,
    pub expected: Expected,
    pub partition: String,
    pub instance_id: Option<u32>,
    /// Verdict of the manifest (or, for keys, the key) covering the row.
    pub signature: Arc<SignatureVerdict>,
    pub cpd_offset: usize,
    pub cpd_valid: bool,
}

/// The manifest that signs a directory, with its verdict computed once.
#[derive(Debug, Clone)]
pub struct ActiveManifest {
    pub header_at: usize,
    pub header: ManifestHeader,
    pub verdict: Arc<SignatureVerdict>,
}

impl ActiveManifest {
    /// Decode the manifest whose tag is at `anchor` and verify it.
    pub fn load(buf: &[u8], anchor: ManifestAnchor, sha1: bool) -> Result<Self, DecodeError> {
        let header_at = anchor.header().ok_or(DecodeError::Truncated {
            what: "manifest header",
            offset: anchor.tag,
            needed: crate::scan::MANIFEST_TAG_OFFSET,
            available: anchor.tag,
        })?;
        let header: ManifestHeader = decode_at(buf, header_at)?;
        let verdict = verify::rsa_verify(buf, header_at, &header, sha1);
        Ok(ActiveManifest {
            header_at,
            header,
            verdict: Arc::new(verdict),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveContext {
    /// Digest used by `.key` manifests.
    pub sha1: bool,
}

#[derive(Debug)]
pub struct EntryProblem {
    /// `<partition> > <entry>`
    pub location: String,
    pub error: DecodeError,
}

#[derive(Debug)]
pub struct ResolvedCpd {
    pub name: String,
    pub offset: usize,
    pub checksum_valid: bool,
    /// `.man` and `.met` rows.
    pub metadata: Vec<ModuleAttributes>,
    /// Modules, keys, microcode and data rows.
    pub modules: Vec<ModuleAttributes>,
    /// Decoded extensions per manifest/metadata entry, in directory order.
    pub extensions: Vec<(String, Vec<ExtRecord>)>,
    pub problems: Vec<EntryProblem>,
    pub vcn: Option<u32>,
    pub instance_id: Option<u32>,
    pub partition_size: Option<u32>,
    pub sku: Option<SkuAttributes>,
}

impl ResolvedCpd {
    /// Metadata rows followed by module rows.
    pub fn all(&self) -> impl Iterator<Item = &ModuleAttributes> {
        self.metadata.iter().chain(self.modules.iter())
    }

    pub fn find(&self, name: &str) -> Option<&ModuleAttributes> {
        self.all().find(|m| m.name == name)
    }

    pub fn extensions_of(&self, entry: &str) -> Option<&[ExtRecord]> {
        self.extensions
            .iter()
            .find(|(name, _)| name == entry)
            .map(|(_, records)| records.as_slice())
    }
}

/// Erased or beyond the image.
pub fn is_empty(buf: &[u8], start: usize, size: u32) -> bool {
    start > buf.len() || slice_at(buf, start, size as usize).is_some_and(is_padding)
}

fn strip_suffix(name: &str) -> &str {
    name.get(..name.len().saturating_sub(4)).unwrap_or(name)
}

struct RowBase<'a> {
    partition: &'a str,
    signature: &'a Arc<SignatureVerdict>,
    cpd_offset: usize,
    cpd_valid: bool,
}

impl RowBase<'_> {
    fn row(&self, name: String, kind: ModuleKind) -> ModuleAttributes {
        ModuleAttributes {
            name,
            kind,
            compression: Compression::None,
            encrypted: false,
            start: 0,
            size_comp: 0,
            size_uncomp: 0,
            empty: false,
            expected: Expected::None,
            partition: self.partition.to_string(),
            instance_id: None,
            signature: Arc::clone(self.signature),
            cpd_offset: self.cpd_offset,
            cpd_valid: self.cpd_valid,
        }
    }
}

/// Resolve every entry of `dir`. `manifest` is the manifest signing the
/// directory, if one was found.
pub fn resolve(
    buf: &[u8],
    dir: &CpdDirectory,
    manifest: Option<&ActiveManifest>,
    ctx: &ResolveContext,
) -> ResolvedCpd {
    let partition = dir.name();
    let undetermined = Arc::new(SignatureVerdict::undetermined());
    let signature = manifest.map(|m| &m.verdict).unwrap_or(&undetermined);
    let base = RowBase {
        partition: &partition,
        signature,
        cpd_offset: dir.offset,
        cpd_valid: dir.checksum_valid,
    };

    let mut out = ResolvedCpd {
        name: partition.clone(),
        offset: dir.offset,
        checksum_valid: dir.checksum_valid,
        metadata: Vec::new(),
        modules: Vec::new(),
        extensions: Vec::new(),
        problems: Vec::new(),
        vcn: None,
        instance_id: None,
        partition_size: None,
        sku: None,
    };
    // (metadata entry name, hash) in declaration order.
    let mut metadata_hashes: Vec<(String, [u8; 32])> = Vec::new();
    let mut has_metadata: Vec<String> = Vec::new();

    for entry in dir.entries.iter().filter(|e| e.has_extensions()) {
        let name = entry.name();
        let location = format!("{partition} > {name}");
        let start = dir.entry_start(entry);
        let end = start.saturating_add(entry.size as usize);

        let ext_start = if entry.is_manifest() {
            match decode_at::<ManifestHeader>(buf, start) {
                Ok(hdr) => Some(start + hdr.header_bytes()),
                Err(error) => {
                    out.problems.push(EntryProblem {
                        location: location.clone(),
                        error,
                    });
                    None
                }
            }
        } else {
            Some(start)
        };

        if let Some(ext_start) = ext_start {
            let scan = ext::scan(buf, ext_start, end, &location);
            for ext in scan.iter() {
                match ext {
                    Extension::PartitionInfo(info) => {
                        out.vcn = Some(info.vcn);
                        out.instance_id = Some(info.instance_id);
                        out.partition_size = Some(info.partition_size);
                        metadata_hashes
                            .extend(info.modules.iter().map(|m| (m.metadata_name(), m.hash)));
                    }
                    Extension::SignedPackageInfo(info) => {
                        out.vcn = Some(info.vcn);
                        metadata_hashes
                            .extend(info.modules.iter().map(|m| (m.metadata_name(), m.hash)));
                    }
                    Extension::ModuleAttributes(attr) => {
                        let mut row = base.row(strip_suffix(&name).to_string(), ModuleKind::Module);
                        row.compression = Compression::from_raw(attr.compression);
                        row.encrypted = attr.encryption != 0;
                        row.size_comp = attr.size_comp;
                        row.size_uncomp = attr.size_uncomp;
                        row.expected = Expected::Sha256(attr.hash);
                        out.modules.push(row);
                    }
                    Extension::ClientSystemInfo(info) => out.sku = Some(info.sku()),
                    Extension::Iunp(iunp) => {
                        let mut row = base.row(strip_suffix(&name).to_string(), ModuleKind::Module);
                        row.size_comp = iunp.size_uncomp;
                        row.size_uncomp = iunp.size_uncomp;
                        row.expected = Expected::Sha256(iunp.hash);
                        out.modules.push(row);
                    }
                    Extension::BootPolicy(policy) => {
                        for (module, block) in policy.modules() {
                            let mut row = base.row(module.to_string(), ModuleKind::Module);
                            row.expected = Expected::Sha256(block.hash);
                            out.modules.push(row);
                        }
                    }
                    Extension::PlatformId(_) | Extension::Other(_) | Extension::Unknown { .. } => {}
                }
            }
            out.problems.extend(scan.problems.into_iter().map(|error| EntryProblem {
                location: location.clone(),
                error,
            }));
            out.extensions.push((name.clone(), scan.records));
        }

        let kind = if entry.is_manifest() {
            ModuleKind::Manifest
        } else {
            ModuleKind::Metadata
        };
        let mut row = base.row(name.clone(), kind);
        row.start = start;
        row.size_comp = entry.size;
        row.size_uncomp = entry.size;
        row.empty = is_empty(buf, start, entry.size);
        out.metadata.push(row);
        has_metadata.push(strip_suffix(&name).to_string());
    }

    // First declaration wins when 0x03 and 0x0F disagree.
    for row in out.metadata.iter_mut() {
        row.instance_id = out.instance_id;
        if let Some((_, hash)) = metadata_hashes.iter().find(|(met, _)| *met == row.name) {
            row.expected = Expected::Sha256(*hash);
        }
    }

    let is_ibbp = partition == "IBBP";
    let mut present = Vec::new();

    for entry in dir.entries.iter().filter(|e| !e.has_extensions()) {
        let name = entry.name();
        let start = dir.entry_start(entry);

        if is_ibbp {
            present.push(name.clone());
            if let Some(row) = out.modules.iter_mut().find(|m| m.name == name) {
                row.size_comp = entry.size;
                row.size_uncomp = entry.size;
                has_metadata.push(name.clone());
            }
        }

        if has_metadata.contains(&name) {
            if let Some(row) = out.modules.iter_mut().find(|m| m.name == name) {
                row.start = start;
                row.instance_id = out.instance_id;
                row.empty = is_empty(buf, start, row.size_comp);
            }
        } else if name.contains(".key") {
            let verdict = match decode_at::<ManifestHeader>(buf, start) {
                Ok(hdr) => verify::rsa_verify(buf, start, &hdr, ctx.sha1),
                Err(e) => {
                    debug!(%name, "key manifest unreadable: {e}");
                    SignatureVerdict::undetermined()
                }
            };
            let mut row = base.row(name, ModuleKind::Key);
            row.start = start;
            row.size_comp = entry.size;
            row.size_uncomp = entry.size;
            row.empty = is_empty(buf, start, entry.size);
            row.signature = Arc::new(verdict);
            out.modules.push(row);
        } else if name.contains("upatch") {
            let declared = u32_at(buf, start + MICROCODE_SIZE_OFFSET).unwrap_or(0) as usize;
            let end = start.saturating_add(declared.min(entry.size as usize)).min(buf.len());
            let data = buf.get(start..end).unwrap_or(&[]);
            let mut row = base.row(name, ModuleKind::Microcode);
            row.start = start;
            row.size_comp = entry.size;
            row.size_uncomp = entry.size;
            row.empty = is_empty(buf, start, entry.size);
            row.expected = Expected::Checksum(verify::microcode_checksum(data));
            out.modules.push(row);
        } else {
            let mut row = base.row(name, ModuleKind::Data);
            row.start = start;
            row.size_comp = entry.size;
            row.size_uncomp = entry.size;
            row.empty = is_empty(buf, start, entry.size);
            out.modules.push(row);
        }
    }

    // Declared in the boot policy but not in the directory.
    if is_ibbp {
        out.modules
            .retain(|m| !BOOT_CHAIN.contains(&m.name.as_str()) || present.contains(&m.name));
    }

    out
}

/// Directory that owns the manifest tagged at `mn2_tag`, searched
/// backwards on 4-byte steps.
pub fn find_cpd_before(buf: &[u8], mn2_tag: usize) -> Option<usize> {
    (0..LOCATOR_WINDOW / 4)
        .map_while(|k| mn2_tag.checked_sub(4 * k))
        .find(|&at| tag_at(buf, at, b"$CPD"))
}

/// Manifest following the directory at `cpd`.
pub fn find_manifest_after(scanner: &Scanner, buf: &[u8], cpd: usize) -> Option<ManifestAnchor> {
    scanner
        .find_in(Anchor::Mn2, buf, cpd, LOCATOR_WINDOW)
        .map(ManifestAnchor::from_match)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpd::{self, offset_attrib};
    use crate::ext::tests::{metadata_entry, module_attributes, partition_info, record};
    use crate::verify::SigStatus;

    /// A bare `.man` entry: manifest header then its extensions.
    fn manifest_entry(extensions: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 0x284];
        out[0x04..0x08].copy_from_slice(&(0x284u32 / 4).to_le_bytes());
        out[0x10..0x14].copy_from_slice(&0x8086u32.to_le_bytes());
        out[0x1C..0x20].copy_from_slice(b"$MN2");
        out.extend_from_slice(extensions);
        out
    }

    struct Entry {
        name: &'static str,
        data: Vec<u8>,
    }

    /// Lay out a directory at offset 0 followed by each entry's data.
    fn build(partition: &[u8; 4], entries: Vec<Entry>) -> (Vec<u8>, CpdDirectory) {
        let mut data_at = 0x10 + entries.len() * 0x18;
        let mut table = Vec::new();
        for e in &entries {
            table.push((e.name, offset_attrib(data_at as u32, false), e.data.len() as u32));
            data_at += e.data.len();
        }
        let mut buf = cpd::encode(partition, &table);
        for e in entries {
            buf.extend(e.data);
        }
        let dir = CpdDirectory::decode(&buf, 0).unwrap();
        (buf, dir)
    }

    #[test]
    fn module_rows_come_from_metadata() {
        let kernel = vec![0x42u8; 0x40];
        let met_hash = [0x77u8; 32];
        let man = manifest_entry(&partition_info(
            b"FTPR",
            0x9000,
            7,
            &[metadata_entry("kernel", met_hash), metadata_entry("kernel", [0x99; 32])],
        ));
        let met = module_attributes(2, 0x40, 0x100, [0x55; 32]);
        let (buf, dir) = build(
            b"FTPR",
            vec![
                Entry { name: "FTPR.man", data: man },
                Entry { name: "kernel.met", data: met },
                Entry { name: "kernel", data: kernel },
                Entry { name: "blob", data: vec![0xFF; 0x10] },
            ],
        );

        let resolved = resolve(&buf, &dir, None, &ResolveContext::default());
        assert!(resolved.problems.is_empty(), "{:?}", resolved.problems);
        assert_eq!(resolved.partition_size, Some(0x9000));
        assert_eq!(resolved.instance_id, Some(7));
        assert_eq!(resolved.metadata.len(), 2);

        let met_row = resolved.find("kernel.met").unwrap();
        assert_eq!(met_row.kind, ModuleKind::Metadata);
        assert_eq!(met_row.expected, Expected::Sha256(met_hash));

        let kernel = resolved.find("kernel").unwrap();
        assert_eq!(kernel.compression, Compression::Lzma);
        assert_eq!(kernel.start, dir.entry_start(&dir.entries[2]));
        assert_eq!(kernel.instance_id, Some(7));
        assert!(!kernel.empty);
        assert_eq!(kernel.expected, Expected::Sha256([0x55; 32]));
        assert_eq!(kernel.signature.status, SigStatus::Undetermined);

        let blob = resolved.find("blob").unwrap();
        assert_eq!(blob.kind, ModuleKind::Data);
        assert!(blob.empty);
        assert_eq!(blob.expected, Expected::None);
        assert!(resolved.extensions_of("FTPR.man").is_some());
    }

    #[test]
    fn missing_boot_chain_modules_are_dropped() {
        let mut body = 0u32.to_le_bytes().to_vec();
        for fill in [0x11u8, 0x22, 0x33] {
            body.extend_from_slice(&2u32.to_le_bytes());
            body.extend_from_slice(&32u32.to_le_bytes());
            body.extend_from_slice(&[fill; 32]);
        }
        body.resize(0xB4 - 8, 0);
        let (buf, dir) = build(
            b"IBBP",
            vec![
                Entry { name: "BPM.met", data: record(0x13, &body) },
                Entry { name: "IBBL", data: vec![1; 0x20] },
                Entry { name: "IBB", data: vec![2; 0x30] },
            ],
        );

        let resolved = resolve(&buf, &dir, None, &ResolveContext::default());
        let names: Vec<_> = resolved.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["IBBL", "IBB"]);
        let ibb = resolved.find("IBB").unwrap();
        assert_eq!((ibb.size_comp, ibb.size_uncomp), (0x30, 0x30));
        assert_eq!(ibb.start, dir.entry_start(&dir.entries[2]));
        assert_eq!(ibb.expected, Expected::Sha256([0x22; 32]));
    }

    #[test]
    fn microcode_uses_declared_length() {
        let mut mc = vec![0u8; 0x40];
        mc[0x20..0x24].copy_from_slice(&0x30u32.to_le_bytes());
        mc[0..4].copy_from_slice(&0x30u32.wrapping_neg().to_le_bytes());
        mc[0x38] = 0xEE;
        let (buf, dir) = build(b"UCOD", vec![Entry { name: "upatch0", data: mc }]);
        let resolved = resolve(&buf, &dir, None, &ResolveContext::default());
        let row = resolved.find("upatch0").unwrap();
        assert_eq!(row.kind, ModuleKind::Microcode);
        assert_eq!(row.expected, Expected::Checksum(0));
    }

    #[test]
    fn microcode_length_is_capped_by_its_entry() {
        let mut mc = vec![0u8; 0x40];
        mc[0x20..0x24].copy_from_slice(&0x100u32.to_le_bytes());
        mc[0..4].copy_from_slice(&0x100u32.wrapping_neg().to_le_bytes());
        let (buf, dir) = build(
            b"UCOD",
            vec![
                Entry { name: "upatch0", data: mc },
                Entry { name: "trailer", data: vec![0x11; 0x100] },
            ],
        );
        let resolved = resolve(&buf, &dir, None, &ResolveContext::default());
        assert_eq!(resolved.find("upatch0").unwrap().expected, Expected::Checksum(0));
    }

    #[test]
    fn emptiness() {
        let buf = [0xFFu8, 0xFF, 0x00];
        assert!(is_empty(&buf, 0, 2));
        assert!(!is_empty(&buf, 0, 3));
        assert!(!is_empty(&buf, 1, 8));
        assert!(is_empty(&buf, 9, 1));
        assert!(is_empty(&buf, 1, 0));
    }

    #[test]
    fn locators() {
        let mut buf = vec![0u8; 0x800];
        buf[0x100..0x104].copy_from_slice(b"$CPD");
        buf[0x3FF] = 0;
        buf[0x400..0x404].copy_from_slice(b"$MN2");
        assert_eq!(find_cpd_before(&buf, 0x400), Some(0x100));
        assert_eq!(find_cpd_before(&buf, 0x402), None);
        let scanner = Scanner::new().unwrap();
        assert_eq!(find_manifest_after(&scanner, &buf, 0x100).map(|a| a.tag), Some(0x400));
    }
}
