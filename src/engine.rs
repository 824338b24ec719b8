//! Per-image driver: picks the recovery manifest, identifies the firmware
//! and collects every structure and diagnostic into an [`Analysis`].

use crate::bpdt::{self, Bpdt};
use crate::cpd::CpdDirectory;
use crate::db::FirmwareDb;
use crate::diag::Diagnostics;
use crate::error::{DecodeError, DecodeResult};
use crate::extract::{self, ExtractSummary, PartitionDump};
use crate::fpt::{self, FptTable, UNSET};
use crate::huffman::HuffmanDict;
use crate::manifest::{ManifestHeader, Release, Variant, Version};
use crate::resolve::{self, ActiveManifest, Compression, ModuleKind, ResolveContext, ResolvedCpd};
use crate::scan::{Anchor, ManifestAnchor, Scanner};
use crate::uncharted::{self, EngineExtent};
use crate::verify::SigStatus;
use crate::view::{decode_at, is_padding, slice_at, tag_at};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Partition names expected at fixed distances after a recovery manifest
/// tag: (distance from the tag end, bytes compared, accepted names).
const RECOVERY_PROBES: [(usize, usize, &[&[u8]]); 6] = [
    (0x274, 4, &[b"FTPR", b"OPR"]),
    (0x264, 4, &[b"FTPR", b"OP", b"WCOD", b"LOCL", b"IGRT"]),
    (0x28C, 4, &[b"BRIN"]),
    (0x2DC, 4, &[b"EpsR", b"EpsF"]),
    (0x270, 7, &[b"$MMEBUP"]),
    (0x26C, 4, &[b"WCOD", b"LOCL"]),
];

/// Second legacy module header of a TXE 1-2 manifest.
const TXE_MME_PROBE: usize = 0x270 + 0x80;

/// How the image was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareType {
    /// Full region whose origin can't be told apart.
    Region,
    RegionStock,
    /// Region built by the flash image tool.
    RegionExtracted,
    Update,
}

impl fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FirmwareType::Region => "Region",
            FirmwareType::RegionStock => "Region, Stock",
            FirmwareType::RegionExtracted => "Region, Extracted",
            FirmwareType::Update => "Update",
        })
    }
}

/// Everything learned about one image.
#[derive(Debug)]
pub struct Analysis {
    pub variant: Variant,
    pub version: Version,
    pub release: Release,
    pub date: String,
    pub svn: u8,
    pub vcn: u8,
    pub firmware_type: FirmwareType,
    /// Flash image tool version used to build the region, when recorded.
    pub fit_version: Option<[u16; 4]>,
    pub anchor: ManifestAnchor,
    pub manifest: ActiveManifest,
    pub fpt: Option<FptTable>,
    /// Start of the partition table including its pre-header.
    pub fpt_start: Option<usize>,
    /// Independent engine images in the file.
    pub fpt_count: usize,
    pub bpdts: Vec<Bpdt>,
    pub extent: Option<EngineExtent>,
    pub cpds: Vec<ResolvedCpd>,
    pub diagnostics: Diagnostics,
}

impl Analysis {
    /// Version the way the family prints it.
    pub fn version_string(&self) -> String {
        match self.variant {
            Variant::Sps => self.version.padded(),
            _ => self.version.to_string(),
        }
    }

    /// Note Huffman modules that extraction can only store compressed.
    pub fn note_missing_dictionary(&mut self) {
        let count = self
            .cpds
            .iter()
            .flat_map(|cpd| cpd.all())
            .filter(|m| m.compression == Compression::Huffman && !m.empty)
            .count();
        if count > 0 {
            self.diagnostics.note(format!(
                "{count} Huffman compressed module(s) cannot be decoded without a Huffman dictionary!"
            ));
        }
    }

    /// Instance id of the directory starting at `offset`.
    fn instance_at(&self, offset: usize) -> Option<u32> {
        self.cpds
            .iter()
            .find(|c| c.offset == offset)
            .and_then(|c| c.instance_id)
    }

    /// Every non-empty partition worth writing out, from the tables and
    /// from the uncharted walk.
    pub fn partition_dumps(&self, buf: &[u8]) -> Vec<PartitionDump> {
        let mut out = Vec::new();

        if let Some(table) = &self.fpt {
            for entry in &table.entries {
                if entry.is_blank() || entry.offset == 0 || entry.size == 0 || entry.offset == UNSET || entry.size == UNSET {
                    continue;
                }
                let start = table.partition_start(entry);
                if resolve::is_empty(buf, start, entry.size) {
                    continue;
                }
                let name = entry.name();
                let label = match self.instance_at(start) {
                    Some(inid) if matches!(&entry.name, b"WCOD" | b"LOCL") => format!("{name} {inid:04X}"),
                    _ => name,
                };
                out.push(PartitionDump {
                    label,
                    start,
                    size: entry.size as usize,
                });
            }
        }

        if let Some(extent) = &self.extent {
            for part in &extent.uncharted {
                out.push(PartitionDump {
                    label: format!("{} {:04X}", part.name, part.instance_id),
                    start: part.start,
                    size: part.end.saturating_sub(part.start),
                });
            }
        }

        for table in &self.bpdts {
            for part in table.stored() {
                if part.is_empty(buf) {
                    continue;
                }
                out.push(PartitionDump {
                    label: format!("{:02}_{}", part.kind, part.name),
                    start: part.start,
                    size: part.size as usize,
                });
            }
        }

        out
    }
}

/// Whether any partition name sits where a recovery manifest keeps it.
fn looks_like_recovery(buf: &[u8], anchor: ManifestAnchor) -> bool {
    RECOVERY_PROBES.iter().any(|&(distance, len, names)| {
        let at = anchor.end() + distance;
        let Some(window) = buf.get(at..at.saturating_add(len).min(buf.len())) else {
            return false;
        };
        names
            .iter()
            .any(|name| window.windows(name.len()).any(|w| w == *name))
    })
}

/// Re-anchor inside a partition that holds the recovery manifest. The
/// window only counts when it lies inside the image, and a window without
/// a manifest keeps the current anchor.
fn redefine(scanner: &Scanner, buf: &[u8], current: ManifestAnchor, start: usize, size: usize) -> ManifestAnchor {
    if start.saturating_add(size) >= buf.len() {
        debug!(start, size, "recovery window outside the image");
        return current;
    }
    match scanner.manifest_in(buf, start, size) {
        Some(found) => {
            debug!(tag = found.tag, start, "recovery window anchors manifest");
            found
        }
        None => {
            debug!(start, size, "no manifest in recovery window, keeping previous");
            current
        }
    }
}

fn detect_variant(
    buf: &[u8],
    scanner: &Scanner,
    db: Option<&dyn FirmwareDb>,
    anchor: ManifestAnchor,
    header: &ManifestHeader,
) -> Variant {
    if let Some(found) = db
        .and_then(|db| db.lookup(&header.public_key_prefix()))
        .and_then(|rec| rec.variant().and_then(Variant::from_name))
    {
        debug!(%found, "family from public key");
        return found;
    }

    if tag_at(buf, anchor.end() + TXE_MME_PROBE, b"$MME") {
        return Variant::Txe;
    }

    // Code partition modules only exist on the newer layouts.
    let modules = resolve::find_cpd_before(buf, anchor.tag)
        .and_then(|at| CpdDirectory::decode(buf, at).ok())
        .map(|dir| resolve::resolve(buf, &dir, None, &ResolveContext::default()))
        .map(|cpd| {
            cpd.modules
                .into_iter()
                .filter(|m| m.kind == ModuleKind::Module)
                .map(|m| m.name)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if !modules.is_empty() {
        return if modules.iter().any(|m| m == "fwupdate") {
            Variant::Me
        } else {
            Variant::Txe
        };
    }

    if scanner.has_sps_signature(buf) {
        Variant::Sps
    } else {
        Variant::Me
    }
}

fn firmware_type(
    buf: &[u8],
    fpt: Option<(&FptTable, usize)>,
    bpdts: &[Bpdt],
    variant: Variant,
    major: u16,
) -> (FirmwareType, Option<[u16; 4]>) {
    let Some((table, start)) = fpt else {
        return match bpdts.first() {
            Some(bpdt) => (FirmwareType::RegionExtracted, Some(bpdt.header.fit_version)),
            None => (FirmwareType::Update, None),
        };
    };

    let fit = table.header.fit_version;
    let fit_era = match variant {
        Variant::Me => (8..=11).contains(&major),
        Variant::Txe => major <= 2,
        Variant::Sps => major == 4,
    };
    if fit_era {
        return if fit[3] == 0 || fit[3] == 0xFFFF {
            (FirmwareType::RegionStock, None)
        } else {
            (FirmwareType::RegionExtracted, Some(fit))
        };
    }

    let placeholder_era = match variant {
        Variant::Me => major >= 12,
        Variant::Txe => major >= 3,
        Variant::Sps => major >= 5,
    };
    if placeholder_era {
        // Extracted regions keep the pre-header and the header tail
        // erased with a zeroed checksum.
        let erased = slice_at(buf, start, 0x10).is_some_and(is_padding)
            && slice_at(buf, start + 0x1C, 0x14).is_some_and(is_padding)
            && buf.get(start + 0x1B) == Some(&0);
        return if erased {
            (FirmwareType::RegionExtracted, None)
        } else {
            (FirmwareType::RegionStock, None)
        };
    }

    (FirmwareType::Region, None)
}

/// Analyze one image. Fails only when the image holds no engine firmware
/// or a required header runs past its end.
pub fn analyze(buf: &[u8], scanner: &Scanner, db: Option<&dyn FirmwareDb>) -> DecodeResult<Analysis> {
    let anchors = scanner.manifest_anchors(buf);
    let mut anchor = *anchors.first().ok_or(DecodeError::NoFirmwareSignature)?;
    let mut diag = Diagnostics::new();

    let bpdts = match bpdt::decode_all(buf, &scanner.find_all(Anchor::Bpdt, buf)) {
        Ok(tables) => tables,
        Err(e) => {
            warn!("ignoring unreadable BPDT: {e}");
            Vec::new()
        }
    };
    for table in &bpdts {
        if let Some(bup) = table.boot_update() {
            anchor = redefine(scanner, buf, anchor, bup.start, bup.size as usize);
        }
    }

    let fpt_hits = scanner.find_all(Anchor::Fpt, buf);
    let mut fpt = match fpt::select_primary(buf, &fpt_hits) {
        Some((offset, count)) => match FptTable::decode(buf, offset, count) {
            Ok(table) => Some(table),
            Err(e) => {
                warn!(offset, "ignoring unreadable $FPT: {e}");
                None
            }
        },
        None => None,
    };
    if let Some(table) = &fpt {
        for (i, entry) in table.entries.iter().enumerate() {
            if entry.is_recovery(table.rcvy_before(i)) {
                anchor = redefine(scanner, buf, anchor, table.partition_start(entry), entry.size as usize);
            }
        }
    }

    if !looks_like_recovery(buf, anchor) {
        if anchors.len() < 2 {
            debug!(tag = anchor.tag, "sole manifest is not a recovery manifest");
            return Err(DecodeError::NoFirmwareSignature);
        }
        anchor = scanner.recovery_probe(buf).ok_or(DecodeError::NoFirmwareSignature)?;
        info!(tag = anchor.tag, "recovery manifest located by probe");
    }
    if !anchor.has_intel_vendor(buf) {
        debug!(tag = anchor.tag, "rejected manifest without Intel vendor id");
        return Err(DecodeError::NoFirmwareSignature);
    }

    let header_at = anchor.header().ok_or(DecodeError::NoFirmwareSignature)?;
    let header: ManifestHeader = decode_at(buf, header_at)?;
    let major = header.version.major;
    let variant = detect_variant(buf, scanner, db, anchor, &header);
    let manifest = ActiveManifest::load(buf, anchor, variant.uses_sha1(major))?;
    info!(%variant, version = %header.version, tag = anchor.tag, "engine firmware identified");

    match manifest.verdict.status {
        SigStatus::Valid => {}
        SigStatus::Invalid => diag.error("Invalid FTPR RSA Signature!"),
        SigStatus::Undetermined => diag.error("Could not validate FTPR RSA Signature!"),
    }

    let mut release = Release::from_flags(header.flags);
    let mut fpt_count = 0;
    let mut fpt_start = None;
    let mut extent = None;

    if let Some(table) = fpt.as_mut() {
        // SPS 1 and 4 keep a second, default table.
        if variant == Variant::Sps && table.count == 2 && (major == 1 || major == 4) {
            table.count -= 1;
        }
        fpt_count = table.count;
        if fpt_count > 1 {
            diag.note(format!("Multiple ({fpt_count}) Intel Engine firmware detected in file!"));
        }

        let layout = table.checksum_layout(variant, major);
        let start = layout.table_start;
        fpt_start = Some(start);

        if let Some(used) = table.romb() {
            let bypass = if variant.is_cse(major) {
                match table.pre_header(buf, &layout) {
                    Some(pre) => used && pre.romb_instr[0] != 0,
                    None => true,
                }
            } else {
                true
            };
            if bypass {
                release = Release::RomBypass;
            }
        }

        if let Some((stored, computed)) = table.checksum_failed(buf, variant, major) {
            diag.warning(format!("Wrong $FPT checksum 0x{stored:02X}, expected 0x{computed:02X}!"));
        }
        if variant == Variant::Sps && major == 3 {
            let (stored, computed) = table.sps3_checksum(buf, &layout);
            if stored != computed {
                diag.warning(format!("Wrong $FPT SPS3 checksum 0x{stored:04X}, expected 0x{computed:04X}!"));
            }
        }
        if table.count_diff != 0 {
            diag.warning(format!(
                "Wrong $FPT entry count 0x{:02X}, expected 0x{:02X}!",
                table.declared_count(),
                table.computed_count()
            ));
        }

        let has_recovery = table
            .entries
            .iter()
            .enumerate()
            .any(|(i, e)| e.is_recovery(table.rcvy_before(i)));
        if !has_recovery && release != Release::RomBypass {
            diag.error("Recovery section missing, Manifest Header not found!");
        }

        if let Some(last) = &table.last {
            let found = uncharted::infer(buf, start, last, variant, major);
            if start == 0 {
                size_warning(buf, found.end, variant, &mut diag);
            }
            extent = Some(found);
        }
    }

    let (firmware_type, fit_version) = firmware_type(buf, fpt.as_ref().zip(fpt_start), &bpdts, variant, major);
    let cpds = resolve_all(buf, scanner, variant, major, &mut diag);

    Ok(Analysis {
        variant,
        version: header.version,
        release,
        date: header.date(),
        svn: header.svn,
        vcn: header.vcn,
        firmware_type,
        fit_version,
        anchor,
        manifest,
        fpt,
        fpt_start,
        fpt_count,
        bpdts,
        extent,
        cpds,
        diagnostics: diag,
    })
}

/// Compare the engine end against the file length for a bare region.
fn size_warning(buf: &[u8], engine_end: usize, variant: Variant, diag: &mut Diagnostics) {
    let file_end = buf.len();
    if engine_end > file_end {
        diag.warning("Firmware size exceeds file, possible data loss!");
    } else if engine_end < file_end {
        if is_padding(&buf[engine_end..]) {
            diag.warning("File size exceeds firmware, unneeded padding!");
        } else if !(variant == Variant::Sps && buf.windows(5).any(|w| w == b"$BIS\0")) {
            // SPS 4 leaves an empty $BIS partition past the last entry.
            diag.warning("File size exceeds firmware, data in padding!");
        }
    }
}

/// Resolve every code partition directory in the image.
fn resolve_all(buf: &[u8], scanner: &Scanner, variant: Variant, major: u16, diag: &mut Diagnostics) -> Vec<ResolvedCpd> {
    let sha1 = variant.uses_sha1(major);
    let ctx = ResolveContext { sha1 };
    let mut out = Vec::new();

    for offset in scanner.find_all(Anchor::Cpd, buf) {
        let dir = match CpdDirectory::decode(buf, offset) {
            Ok(dir) => dir,
            Err(e) => {
                debug!(offset, "skipping $CPD candidate: {e}");
                continue;
            }
        };
        let manifest = resolve::find_manifest_after(scanner, buf, offset)
            .filter(|a| a.has_intel_vendor(buf))
            .and_then(|a| ActiveManifest::load(buf, a, sha1).ok());
        let cpd = resolve::resolve(buf, &dir, manifest.as_ref(), &ctx);
        for problem in &cpd.problems {
            diag.error(format!("{}: {}", problem.location, problem.error));
        }
        out.push(cpd);
    }
    out
}

/// Write partitions and code partition modules of an analyzed image.
pub fn extract_image(
    buf: &[u8],
    analysis: &Analysis,
    out_dir: &Path,
    dict: Option<&HuffmanDict>,
) -> DecodeResult<ExtractSummary> {
    let mut summary = ExtractSummary::default();
    extract::dump_partitions(buf, &analysis.partition_dumps(buf), out_dir, &mut summary)?;
    for cpd in &analysis.cpds {
        extract::extract_cpd(buf, cpd, out_dir, dict, &mut summary)?;
    }
    info!(
        modules = summary.modules.len(),
        partitions = summary.partitions.len(),
        "extraction finished"
    );
    Ok(summary)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cpd;
    use crate::fpt::{FPT_ENTRY_SIZE, encode_entry, encode_header};

    pub(crate) const MANIFEST_SIZE: usize = 0x284;

    /// Manifest header with the Intel vendor id and the given version.
    pub(crate) fn manifest(version: [u16; 4]) -> Vec<u8> {
        let mut out = vec![0u8; MANIFEST_SIZE];
        out[0x04..0x08].copy_from_slice(&((MANIFEST_SIZE / 4) as u32).to_le_bytes());
        out[0x10..0x14].copy_from_slice(&0x8086u32.to_le_bytes());
        out[0x14] = 0x17;
        out[0x15] = 0x05;
        out[0x16..0x18].copy_from_slice(&0x2019u16.to_le_bytes());
        out[0x18..0x1C].copy_from_slice(&((MANIFEST_SIZE / 4) as u32).to_le_bytes());
        out[0x1C..0x20].copy_from_slice(b"$MN2");
        for (i, part) in version.iter().enumerate() {
            out[0x24 + i * 2..0x26 + i * 2].copy_from_slice(&part.to_le_bytes());
        }
        out
    }

    /// A bare ME 11 region: $FPT at 0 listing FTPR at 0x1000, a $CPD with
    /// a lone manifest entry, and `len` bytes in total.
    pub(crate) fn region(len: usize) -> Vec<u8> {
        let mut buf = vec![0xFFu8; len];
        buf[..0x10].fill(0);
        buf[0x10..0x30].copy_from_slice(&encode_header(1, 0x20, 0x30, 0));
        buf[0x30..0x30 + FPT_ENTRY_SIZE].copy_from_slice(&encode_entry(b"FTPR", 0x1000, 0x1000));
        let sum: u32 = buf[..0x30].iter().map(|&b| b as u32).sum();
        buf[0x1B] = (0x100 - (sum & 0xFF)) as u8;

        let dir = cpd::encode(b"FTPR", &[("FTPR.man", 0x40, MANIFEST_SIZE as u32)]);
        buf[0x1000..0x1000 + dir.len()].copy_from_slice(&dir);
        buf[0x1040..0x1040 + MANIFEST_SIZE].copy_from_slice(&manifest([11, 8, 50, 3425]));
        // Partition name where the recovery probe expects it.
        let tag_end = 0x1040 + 0x1C + 4;
        buf[tag_end + 0x274..tag_end + 0x278].copy_from_slice(b"FTPR");
        buf
    }

    #[test]
    fn identifies_bare_region() {
        let buf = region(0x3000);
        let scanner = Scanner::new().unwrap();
        let analysis = analyze(&buf, &scanner, None).unwrap();

        assert_eq!(analysis.anchor.tag, 0x1040 + 0x1C);
        assert_eq!(analysis.variant, Variant::Me);
        assert_eq!(analysis.version_string(), "11.8.50.3425");
        assert_eq!(analysis.date, "2019-05-17");
        assert_eq!(analysis.release, Release::Production);
        assert_eq!(analysis.firmware_type, FirmwareType::RegionStock);
        assert_eq!(analysis.fpt_start, Some(0));
        assert_eq!(analysis.fpt_count, 1);
        assert_eq!(analysis.extent.as_ref().map(|e| e.end), Some(0x2000));
        assert_eq!(analysis.cpds.len(), 1);
        assert_eq!(analysis.cpds[0].name, "FTPR");

        let diag = &analysis.diagnostics;
        assert_eq!(diag.errors().len(), 1, "{diag:?}");
        assert!(diag.errors()[0].contains("FTPR RSA Signature"));
        assert_eq!(diag.warnings(), ["File size exceeds firmware, unneeded padding!"]);
        assert!(diag.notes().is_empty());
    }

    #[test]
    fn reports_table_problems() {
        let mut buf = region(0x2000);
        buf[0x1B] ^= 0x01;
        buf[0x50..0x54].copy_from_slice(b"NFTP");
        let scanner = Scanner::new().unwrap();
        let analysis = analyze(&buf, &scanner, None).unwrap();

        let warnings = analysis.diagnostics.warnings();
        assert!(warnings.iter().any(|w| w.starts_with("Wrong $FPT checksum")), "{warnings:?}");
        assert!(warnings.contains(&"Wrong $FPT entry count 0x01, expected 0x02!".to_string()));
        assert!(!warnings.iter().any(|w| w.contains("File size")));
    }

    #[test]
    fn data_in_padding_is_reported() {
        let mut buf = region(0x3000);
        buf[0x2800] = 0x00;
        let analysis = analyze(&buf, &Scanner::new().unwrap(), None).unwrap();
        assert!(analysis
            .diagnostics
            .warnings()
            .contains(&"File size exceeds firmware, data in padding!".to_string()));
    }

    /// Manifest header at `at`, carrying the partition name the recovery
    /// probe looks for when `recovery` is set. Returns the tag offset.
    fn place_manifest(buf: &mut [u8], at: usize, version: [u16; 4], recovery: bool) -> usize {
        buf[at..at + MANIFEST_SIZE].copy_from_slice(&manifest(version));
        let tag = at + 0x1C;
        if recovery {
            buf[tag + 4 + 0x274..tag + 4 + 0x278].copy_from_slice(b"FTPR");
        }
        tag
    }

    #[test]
    fn boot_update_partition_holds_the_recovery_manifest() {
        let mut buf = vec![0xFFu8; 0x4000];
        let mut bpdt = vec![0xAA, 0x55, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00];
        bpdt.resize(0x18, 0);
        bpdt.extend_from_slice(&2u16.to_le_bytes());
        bpdt.extend_from_slice(&0u16.to_le_bytes());
        bpdt.extend_from_slice(&0x2000u32.to_le_bytes());
        bpdt.extend_from_slice(&0x1000u32.to_le_bytes());
        buf[..bpdt.len()].copy_from_slice(&bpdt);
        place_manifest(&mut buf, 0x1000, [11, 8, 50, 3425], true);
        let bup = place_manifest(&mut buf, 0x2040, [11, 0, 0, 1000], true);

        let scanner = Scanner::new().unwrap();
        let analysis = analyze(&buf, &scanner, None).unwrap();
        assert_eq!(analysis.anchor.tag, bup);
        assert_eq!(analysis.version_string(), "11.0.0.1000");
        assert_eq!(analysis.firmware_type, FirmwareType::RegionExtracted);

        // Without the table the first recovery manifest stays.
        buf[..bpdt.len()].fill(0xFF);
        let analysis = analyze(&buf, &scanner, None).unwrap();
        assert_eq!(analysis.anchor.tag, 0x1000 + 0x1C);
    }

    #[test]
    fn recovery_manifest_is_probed_past_other_manifests() {
        let mut buf = vec![0xFFu8; 0x4000];
        place_manifest(&mut buf, 0x1000, [11, 8, 50, 3425], false);
        let recovery = place_manifest(&mut buf, 0x2000, [11, 0, 0, 1000], true);

        let scanner = Scanner::new().unwrap();
        assert_eq!(scanner.recovery_probe(&buf).map(|a| a.tag), Some(recovery));
        let analysis = analyze(&buf, &scanner, None).unwrap();
        assert_eq!(analysis.anchor.tag, recovery);
        assert_eq!(analysis.version_string(), "11.0.0.1000");
        assert_eq!(analysis.firmware_type, FirmwareType::Update);
    }

    #[test]
    fn sps3_table_checksum_is_checked() {
        let mut buf = region(0x3000);
        buf[0x1040 + 0x24..0x1040 + 0x26].copy_from_slice(&3u16.to_le_bytes());
        buf[0x2800..0x280B].copy_from_slice(b"bup_rcv.met");
        let scanner = Scanner::new().unwrap();
        let is_sps3_warning = |w: &String| w.starts_with("Wrong $FPT SPS3 checksum");

        let analysis = analyze(&buf, &scanner, None).unwrap();
        assert_eq!(analysis.variant, Variant::Sps);
        assert_eq!(analysis.version.major, 3);
        let computed = crate::verify::checksum16(&buf[0x30..0x50]);
        let expected = format!("Wrong $FPT SPS3 checksum 0xFFFF, expected 0x{computed:04X}!");
        assert!(analysis.diagnostics.warnings().contains(&expected), "{:?}", analysis.diagnostics);

        buf[0x50..0x52].copy_from_slice(&computed.to_le_bytes());
        let analysis = analyze(&buf, &scanner, None).unwrap();
        assert!(!analysis.diagnostics.warnings().iter().any(is_sps3_warning));
    }

    #[test]
    fn rejects_images_without_engine() {
        let scanner = Scanner::new().unwrap();
        assert!(matches!(
            analyze(&vec![0xFF; 0x1000], &scanner, None),
            Err(DecodeError::NoFirmwareSignature)
        ));

        // A lone manifest with no partition name where recovery keeps it.
        let mut buf = region(0x3000);
        let tag_end = 0x1040 + 0x20;
        buf[tag_end + 0x274..tag_end + 0x278].fill(0xFF);
        assert!(matches!(analyze(&buf, &scanner, None), Err(DecodeError::NoFirmwareSignature)));

        // Right place, wrong vendor.
        let mut buf = region(0x3000);
        buf[0x1040 + 0x10] = 0x87;
        assert!(matches!(analyze(&buf, &scanner, None), Err(DecodeError::NoFirmwareSignature)));
    }

    #[test]
    fn database_names_the_family() {
        let buf = region(0x2000);
        let scanner = Scanner::new().unwrap();
        let key = hex::encode_upper([0u8; 16]);
        let db = crate::db::FlatFileDb::from_text(&format!("{key}_TXE\n"));
        let analysis = analyze(&buf, &scanner, Some(&db)).unwrap();
        assert_eq!(analysis.variant, Variant::Txe);
    }

    #[test]
    fn second_independent_table_is_noted() {
        let mut buf = region(0x10000);
        buf[0x8010..0x8030].copy_from_slice(&encode_header(1, 0x20, 0x30, 0));
        let analysis = analyze(&buf, &Scanner::new().unwrap(), None).unwrap();
        assert_eq!(analysis.fpt_count, 2);
        assert_eq!(
            analysis.diagnostics.notes(),
            ["Multiple (2) Intel Engine firmware detected in file!"]
        );
    }

    #[test]
    fn extracts_partitions_and_modules() {
        let buf = region(0x2000);
        let analysis = analyze(&buf, &Scanner::new().unwrap(), None).unwrap();
        let dumps = analysis.partition_dumps(&buf);
        assert_eq!(
            dumps,
            vec![PartitionDump {
                label: "FTPR".to_string(),
                start: 0x1000,
                size: 0x1000
            }]
        );

        let dir = tempfile::tempdir().unwrap();
        let summary = extract_image(&buf, &analysis, dir.path(), None).unwrap();
        assert!(dir.path().join("FTPR [001000].bin").is_file());
        assert!(dir.path().join("FTPR [001000]").join("FTPR.man").is_file());
        assert_eq!(summary.partitions.len(), 1);
        assert_eq!(summary.modules.len(), 1);
    }
}
