//! Boot Partition Descriptor Table (IFWI layout).

use crate::error::DecodeResult;
use crate::view::{Decode, decode_at, is_padding, slice_at};
use nom::{
    IResult,
    number::complete::{le_u16, le_u32},
};
use std::collections::HashSet;

pub const BPDT_HEADER_SIZE: usize = 0x18;
pub const BPDT_ENTRY_SIZE: usize = 0xC;

/// Entry type of the secondary table.
pub const TYPE_S_BPDT: u16 = 5;
/// Entry type of the boot-update partition holding the recovery manifest.
pub const TYPE_CSE_BUP: u16 = 2;

#[derive(Debug, Clone)]
pub struct BpdtHeader {
    pub signature: u32,
    pub desc_count: u16,
    pub version: u16,
    pub redundant_checksum: u32,
    pub ifwi_version: u32,
    pub fit_version: [u16; 4],
}

impl Decode for BpdtHeader {
    const SIZE: usize = BPDT_HEADER_SIZE;
    const NAME: &'static str = "BPDT header";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, signature) = le_u32(input)?;
        let (input, desc_count) = le_u16(input)?;
        let (input, version) = le_u16(input)?;
        let (input, redundant_checksum) = le_u32(input)?;
        let (input, ifwi_version) = le_u32(input)?;
        let (input, a) = le_u16(input)?;
        let (input, b) = le_u16(input)?;
        let (input, c) = le_u16(input)?;
        let (input, d) = le_u16(input)?;
        Ok((
            input,
            BpdtHeader {
                signature,
                desc_count,
                version,
                redundant_checksum,
                ifwi_version,
                fit_version: [a, b, c, d],
            },
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BpdtEntry {
    pub kind: u16,
    pub flags: u16,
    pub offset: u32,
    pub size: u32,
}

impl Decode for BpdtEntry {
    const SIZE: usize = BPDT_ENTRY_SIZE;
    const NAME: &'static str = "BPDT entry";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, kind) = le_u16(input)?;
        let (input, flags) = le_u16(input)?;
        let (input, offset) = le_u32(input)?;
        let (input, size) = le_u32(input)?;
        Ok((
            input,
            BpdtEntry {
                kind,
                flags,
                offset,
                size,
            },
        ))
    }
}

pub fn type_name(kind: u16) -> &'static str {
    match kind {
        0 => "OEM_SMIP",
        1 => "CSE_RBE",
        2 => "CSE_BUP",
        3 => "UCODE",
        4 => "IBB",
        5 => "S-BPDT",
        6 => "OBB",
        7 => "CSE_MAIN",
        8 => "ISH",
        9 => "CSE_IDLM",
        10 => "IFP_OVERRIDE",
        11 => "DEBUG_TOKENS",
        12 => "UFS_PHY",
        13 => "UFS_GPP_LUN",
        14 => "PMC",
        15 => "IUNIT",
        16 => "NVM_CONFIG",
        17 => "UEP",
        18 => "CSE_WCOD",
        19 => "CSE_LOCL",
        _ => "Unknown",
    }
}

/// One entry with its absolute position resolved.
#[derive(Debug, Clone)]
pub struct BpdtPartition {
    pub name: &'static str,
    pub kind: u16,
    /// Offset as stored; relative to the primary table start.
    pub offset: u32,
    pub size: u32,
    pub start: usize,
    pub secondary: bool,
}

impl BpdtPartition {
    pub fn end(&self) -> usize {
        self.start + self.size as usize
    }

    /// Zero offset or size means the slot is unused.
    pub fn is_unused(&self) -> bool {
        self.offset == 0 || self.size == 0
    }

    pub fn is_empty(&self, buf: &[u8]) -> bool {
        slice_at(buf, self.start, self.size as usize).is_some_and(is_padding)
    }
}

/// A primary table plus the entries of its secondary table, if any.
#[derive(Debug, Clone)]
pub struct Bpdt {
    pub offset: usize,
    pub header: BpdtHeader,
    pub partitions: Vec<BpdtPartition>,
    /// Offset of the secondary table, so the scanner hit for it is not
    /// decoded again as a primary table.
    pub secondary_at: Option<usize>,
}

fn read_entries(
    buf: &[u8],
    table: usize,
    base: usize,
    count: u16,
    secondary: bool,
) -> DecodeResult<Vec<BpdtPartition>> {
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let entry: BpdtEntry = decode_at(buf, table + BPDT_HEADER_SIZE + i * BPDT_ENTRY_SIZE)?;
        out.push(BpdtPartition {
            name: type_name(entry.kind),
            kind: entry.kind,
            offset: entry.offset,
            size: entry.size,
            start: base + entry.offset as usize,
            secondary,
        });
    }
    Ok(out)
}

impl Bpdt {
    /// Decode the table at `offset`; a type 5 entry pulls in the secondary
    /// table (one level only, it is not searched for further nesting).
    pub fn decode(buf: &[u8], offset: usize) -> DecodeResult<Self> {
        let header: BpdtHeader = decode_at(buf, offset)?;
        let primary = read_entries(buf, offset, offset, header.desc_count, false)?;

        let mut partitions = Vec::with_capacity(primary.len());
        let mut secondary_at = None;
        for part in primary {
            if part.kind == TYPE_S_BPDT {
                let s_offset = part.start;
                let s_header: BpdtHeader = decode_at(buf, s_offset)?;
                let entries = read_entries(buf, s_offset, offset, s_header.desc_count, true)?;
                secondary_at = Some(s_offset);
                partitions.push(part);
                partitions.extend(entries);
            } else {
                partitions.push(part);
            }
        }

        Ok(Bpdt {
            offset,
            header,
            partitions,
            secondary_at,
        })
    }

    /// Partitions worth storing: not the secondary table itself and not
    /// unused slots.
    pub fn stored(&self) -> impl Iterator<Item = &BpdtPartition> {
        self.partitions
            .iter()
            .filter(|p| p.kind != TYPE_S_BPDT && !p.is_unused())
    }

    pub fn boot_update(&self) -> Option<&BpdtPartition> {
        self.partitions
            .iter()
            .find(|p| !p.secondary && p.kind == TYPE_CSE_BUP)
    }
}

/// Decode every primary table, skipping scanner hits that are secondary
/// tables of an earlier primary.
pub fn decode_all(buf: &[u8], matches: &[usize]) -> DecodeResult<Vec<Bpdt>> {
    let mut seen_secondary = HashSet::new();
    let mut out = Vec::new();
    for &offset in matches {
        if seen_secondary.contains(&offset) {
            continue;
        }
        let table = Bpdt::decode(buf, offset)?;
        if let Some(s) = table.secondary_at {
            seen_secondary.insert(s);
        }
        out.push(table);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(count: u16) -> Vec<u8> {
        let mut out = vec![0xAA, 0x55, 0x00, 0x00];
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.resize(BPDT_HEADER_SIZE, 0);
        out
    }

    fn entry(kind: u16, offset: u32, size: u32) -> Vec<u8> {
        let mut out = kind.to_le_bytes().to_vec();
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out
    }

    fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    #[test]
    fn secondary_table_offsets_are_relative_to_primary() {
        let mut buf = vec![0u8; 0x4000];
        let base = 0x1000;
        put(&mut buf, base, &header(3));
        put(&mut buf, base + 0x18, &entry(2, 0x1000, 0x800));
        put(&mut buf, base + 0x24, &entry(5, 0x2000, 0x100));
        put(&mut buf, base + 0x30, &entry(4, 0, 0));
        put(&mut buf, base + 0x2000, &header(1));
        put(&mut buf, base + 0x2018, &entry(8, 0x2800, 0x400));

        let table = Bpdt::decode(&buf, base).unwrap();
        assert_eq!(table.secondary_at, Some(0x3000));
        assert_eq!(table.partitions.len(), 4);
        let ish = table.partitions.iter().find(|p| p.kind == 8).unwrap();
        assert!(ish.secondary);
        assert_eq!(ish.start, 0x3800);
        assert_eq!(ish.name, "ISH");

        let stored: Vec<_> = table.stored().map(|p| p.name).collect();
        assert_eq!(stored, vec!["CSE_BUP", "ISH"]);
        assert_eq!(table.boot_update().unwrap().start, 0x2000);

        let all = decode_all(&buf, &[base, 0x3000]).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn unknown_types_are_named() {
        assert_eq!(type_name(19), "CSE_LOCL");
        assert_eq!(type_name(77), "Unknown");
    }
}
