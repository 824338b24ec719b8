//! Engine size inference when the last partition carries no usable size.
//!
//! Older tables leave the last entry's size unset, and newer images append
//! partitions the table does not list at all. Both are measured by walking
//! the structures that follow.

use crate::cpd::{CPD_ENTRY_SIZE, CPD_HEADER_SIZE, CpdEntry, CpdHeader};
use crate::ext::PartitionInfo;
use crate::fpt::LastPartition;
use crate::manifest::{ManifestHeader, McpHeader, MmeHeaderNew, MmeHeaderOld, Variant};
use crate::scan::INTEL_VENDOR_ID;
use crate::view::{Decode, align_up, decode_at, name_str, tag_at};
use tracing::debug;

const ALIGNMENT: usize = 0x1000;

/// Bytes between the manifest header and the first module header.
const MODULE_TABLE_GAP: usize = 0xC;

/// `$SKU` block following the last legacy module header.
const LEGACY_SKU_SIZE: usize = 0xC;

/// A partition found after the last table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnchartedPartition {
    pub name: String,
    pub start: usize,
    pub end: usize,
    pub instance_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineExtent {
    /// Engine size from the start of the partition table, 4 KiB aligned.
    pub end: usize,
    pub uncharted: Vec<UnchartedPartition>,
}

/// Infer where the engine ends. `fpt_start` is the start of the partition
/// table including its pre-header; offsets in `last` are relative to it.
pub fn infer(
    buf: &[u8],
    fpt_start: usize,
    last: &LastPartition,
    variant: Variant,
    major: u16,
) -> EngineExtent {
    if last.is_uncharted() {
        let end = legacy_end(buf, fpt_start + last.offset as usize);
        return EngineExtent {
            end: align_up(end.saturating_sub(fpt_start), ALIGNMENT),
            uncharted: Vec::new(),
        };
    }

    let mut p = fpt_start + last.end as usize;
    if variant == Variant::Txe && major == 3 && !tag_at(buf, p, b"$CPD") && tag_at(buf, p + 0x1000, b"$CPD") {
        p += 0x1000;
    }
    p = walk_mcp(buf, p, variant);
    p = walk_legacy(buf, p);
    let mut uncharted = Vec::new();
    p = walk_cpd(buf, p, &mut uncharted);

    EngineExtent {
        end: align_up(p.saturating_sub(fpt_start), ALIGNMENT),
        uncharted,
    }
}

/// End of a partition whose manifest sits at `manifest`, measured by its
/// module headers.
fn legacy_end(buf: &[u8], manifest: usize) -> usize {
    let Ok(hdr) = decode_at::<ManifestHeader>(buf, manifest) else {
        debug!(manifest, "last partition has no readable manifest");
        return manifest;
    };
    let mod_start = manifest + hdr.header_bytes() + MODULE_TABLE_GAP;

    match &hdr.tag {
        b"$MN2" => (0..hdr.num_modules as usize)
            .map_while(|i| decode_at::<MmeHeaderNew>(buf, mod_start + i * MmeHeaderNew::SIZE).ok())
            .map(|m| manifest + m.offset_mn2 as usize + m.stored_size() as usize)
            .max()
            .unwrap_or(manifest),
        b"$MAN" => old_modules_end(buf, mod_start, hdr.num_modules).unwrap_or(manifest),
        _ => manifest,
    }
}

/// Code following `$MME` headers is stored back to back after the last
/// header and its `$SKU` block.
fn old_modules_end(buf: &[u8], mod_start: usize, count: u32) -> Option<usize> {
    let mut total = 0usize;
    let mut end = None;
    for i in 0..count as usize {
        let at = mod_start + i * MmeHeaderOld::SIZE;
        match decode_at::<MmeHeaderOld>(buf, at) {
            Ok(m) if &m.tag == b"$MME" => {
                total += m.size as usize;
                end = Some(at + MmeHeaderOld::SIZE + LEGACY_SKU_SIZE + total);
            }
            _ => break,
        }
    }
    end
}

fn manifest_at(buf: &[u8], p: usize, tag: &[u8; 4]) -> Option<ManifestHeader> {
    if !tag_at(buf, p + 0x1C, tag) {
        return None;
    }
    decode_at::<ManifestHeader>(buf, p)
        .ok()
        .filter(|hdr| hdr.vendor_id == INTEL_VENDOR_ID as u32)
}

/// `$MN2` partitions whose size is held by a trailing `$MCP` header.
fn walk_mcp(buf: &[u8], mut p: usize, variant: Variant) -> usize {
    while let Some(hdr) = manifest_at(buf, p, b"$MN2") {
        let mme = variant.mme_size();
        let mod_start = p + hdr.header_bytes() + MODULE_TABLE_GAP;
        let mcp_at = mod_start + hdr.num_modules as usize * mme + mme;
        let Ok(mcp) = decode_at::<McpHeader>(buf, mcp_at) else {
            break;
        };
        let advance = mcp.offset_code_mn2 as usize + mcp.code_size as usize;
        if &mcp.tag != b"$MCP" || advance == 0 {
            break;
        }
        debug!(p, advance, "uncharted $MN2 partition");
        p += advance;
    }
    p
}

fn walk_legacy(buf: &[u8], mut p: usize) -> usize {
    while let Some(hdr) = manifest_at(buf, p, b"$MAN") {
        let mod_start = p + hdr.header_bytes() + MODULE_TABLE_GAP;
        match old_modules_end(buf, mod_start, hdr.num_modules) {
            Some(end) if end > p => p = end,
            _ => break,
        }
    }
    p
}

/// Directories appended after the table, sized by the larger of their
/// declared partition size and their furthest module.
fn walk_cpd(buf: &[u8], mut p: usize, found: &mut Vec<UnchartedPartition>) -> usize {
    while tag_at(buf, p, b"$CPD") {
        let Ok(cpd) = decode_at::<CpdHeader>(buf, p) else {
            break;
        };
        let manifest = p + CPD_HEADER_SIZE + cpd.num_modules as usize * CPD_ENTRY_SIZE;
        let Some(hdr) = decode_at::<ManifestHeader>(buf, manifest).ok().filter(|h| h.is_mn2()) else {
            break;
        };
        let Ok(info) = decode_at::<PartitionInfo>(buf, manifest + hdr.header_bytes()) else {
            break;
        };
        if info.name != cpd.partition_name {
            break;
        }

        // Modules sit at odd indices, after the manifest and between
        // their metadata entries.
        let mut furthest = (0u32, 0usize);
        for i in (1..cpd.num_modules as usize).step_by(2) {
            let Ok(entry) = decode_at::<CpdEntry>(buf, p + CPD_HEADER_SIZE + i * CPD_ENTRY_SIZE) else {
                break;
            };
            if entry.has_extensions() {
                break;
            }
            if entry.offset() > furthest.0 {
                furthest = (entry.offset(), entry.offset() as usize + entry.size as usize);
            }
        }

        let advance = (info.partition_size as usize).max(furthest.1);
        if advance == 0 {
            break;
        }
        found.push(UnchartedPartition {
            name: name_str(&cpd.partition_name),
            start: p,
            end: p + advance,
            instance_id: info.instance_id,
        });
        p += advance;
    }
    p
}
