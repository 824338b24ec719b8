//! Flash Partition Table (`$FPT`).

use crate::error::DecodeResult;
use crate::manifest::Variant;
use crate::view::{self, Decode, array, decode_at, is_padding, name_str, slice_at, tag_at};
use nom::{
    IResult,
    number::complete::{le_u8, le_u16, le_u32},
};
use tracing::debug;

pub const FPT_HEADER_SIZE: usize = 0x20;
pub const FPT_ENTRY_SIZE: usize = 0x20;
pub const FPT_PRE_HEADER_SIZE: usize = 0x10;

/// Offset/size value meaning "not set".
pub const UNSET: u32 = 0xFFFF_FFFF;

/// Strides of recovery copies of the same table, checked in this order.
const BACKUP_STRIDES: [usize; 3] = [0x100, 0x2100, 0x1000];

/// ROM-Bypass instructions in front of the table.
#[derive(Debug, Clone, Copy)]
pub struct FptPreHeader {
    pub romb_instr: [u32; 4],
}

impl Decode for FptPreHeader {
    const SIZE: usize = FPT_PRE_HEADER_SIZE;
    const NAME: &'static str = "$FPT pre-header";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, a) = le_u32(input)?;
        let (input, b) = le_u32(input)?;
        let (input, c) = le_u32(input)?;
        let (input, d) = le_u32(input)?;
        Ok((input, FptPreHeader { romb_instr: [a, b, c, d] }))
    }
}

#[derive(Debug, Clone)]
pub struct FptHeader {
    pub tag: [u8; 4],
    pub num_partitions: u32,
    pub version: u8,
    pub entry_type: u8,
    pub length: u8,
    pub checksum: u8,
    pub flash_cycle_life: u16,
    pub flash_cycle_limit: u16,
    pub uma_size: u32,
    pub flags: u32,
    pub fit_version: [u16; 4],
}

impl Decode for FptHeader {
    const SIZE: usize = FPT_HEADER_SIZE;
    const NAME: &'static str = "$FPT header";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, tag) = array::<4>(input)?;
        let (input, num_partitions) = le_u32(input)?;
        let (input, version) = le_u8(input)?;
        let (input, entry_type) = le_u8(input)?;
        let (input, length) = le_u8(input)?;
        let (input, checksum) = le_u8(input)?;
        let (input, flash_cycle_life) = le_u16(input)?;
        let (input, flash_cycle_limit) = le_u16(input)?;
        let (input, uma_size) = le_u32(input)?;
        let (input, flags) = le_u32(input)?;
        let (input, fit_major) = le_u16(input)?;
        let (input, fit_minor) = le_u16(input)?;
        let (input, fit_hotfix) = le_u16(input)?;
        let (input, fit_build) = le_u16(input)?;
        Ok((
            input,
            FptHeader {
                tag,
                num_partitions,
                version,
                entry_type,
                length,
                checksum,
                flash_cycle_life,
                flash_cycle_limit,
                uma_size,
                flags,
                fit_version: [fit_major, fit_minor, fit_hotfix, fit_build],
            },
        ))
    }
}

#[derive(Debug, Clone)]
pub struct FptEntry {
    pub name: [u8; 4],
    pub owner: [u8; 4],
    pub offset: u32,
    pub size: u32,
    pub start_tokens: u32,
    pub max_tokens: u32,
    pub scratch_sectors: u32,
    pub flags: u32,
}

impl Decode for FptEntry {
    const SIZE: usize = FPT_ENTRY_SIZE;
    const NAME: &'static str = "$FPT entry";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, name) = array::<4>(input)?;
        let (input, owner) = array::<4>(input)?;
        let (input, offset) = le_u32(input)?;
        let (input, size) = le_u32(input)?;
        let (input, start_tokens) = le_u32(input)?;
        let (input, max_tokens) = le_u32(input)?;
        let (input, scratch_sectors) = le_u32(input)?;
        let (input, flags) = le_u32(input)?;
        Ok((
            input,
            FptEntry {
                name,
                owner,
                offset,
                size,
                start_tokens,
                max_tokens,
                scratch_sectors,
                flags,
            },
        ))
    }
}

impl FptEntry {
    /// Empty names mean the header declares more entries than exist.
    pub fn is_blank(&self) -> bool {
        self.name == [0xFF; 4] || self.name == [0; 4]
    }

    pub fn name(&self) -> String {
        if self.is_blank() || self.name[..2] == [0xE0, 0x15] {
            "----".to_string()
        } else {
            name_str(&self.name)
        }
    }

    pub fn owner(&self) -> String {
        if self.owner == [0xFF; 4] || self.owner == [0; 4] {
            "----".to_string()
        } else {
            name_str(&self.owner)
        }
    }

    /// Recovery partitions whose manifest identifies the firmware.
    /// `CODE` only counts when no `RCVY` was listed before it (ME 2).
    pub fn is_recovery(&self, rcvy_seen: bool) -> bool {
        match &self.name {
            b"CODE" => !rcvy_seen,
            b"RCVY" | b"FTPR" | b"IGRT" => true,
            _ => false,
        }
    }
}

/// Highest-offset partition, used for size inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastPartition {
    pub offset: u32,
    pub size: u32,
    /// `offset + size`, or [`UNSET`] when the entry carries no usable size.
    pub end: u32,
}

impl LastPartition {
    pub fn is_uncharted(&self) -> bool {
        self.end == UNSET
    }
}

/// Checksum coverage of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumLayout {
    /// Start of the table including the pre-header, when it has one.
    pub table_start: usize,
    /// Offset of the summed range from `table_start`.
    pub check_start: usize,
    pub has_pre_header: bool,
}

#[derive(Debug, Clone)]
pub struct FptTable {
    /// Offset of the `$FPT` tag.
    pub offset: usize,
    /// Independent tables found in the image after removing backup copies.
    pub count: usize,
    pub header: FptHeader,
    pub entries: Vec<FptEntry>,
    /// Actual minus declared number of entries.
    pub count_diff: i64,
    pub last: Option<LastPartition>,
}

/// Pick the primary table from all `$FPT` hits, skipping recovery copies
/// stored at fixed strides after it. Returns the tag offset and the number
/// of independent tables.
pub fn select_primary(buf: &[u8], matches: &[usize]) -> Option<(usize, usize)> {
    let mut offset = *matches.first()?;
    let mut count = matches.len();
    for stride in BACKUP_STRIDES {
        while tag_at(buf, offset + stride, b"$FPT") {
            debug!(offset, stride, "skipping backup $FPT copy");
            offset += stride;
            count = count.saturating_sub(1);
        }
    }
    Some((offset, count))
}

impl FptTable {
    pub fn decode(buf: &[u8], offset: usize, count: usize) -> DecodeResult<Self> {
        let header: FptHeader = decode_at(buf, offset)?;
        let mut entries = Vec::with_capacity(header.num_partitions.min(0x100) as usize);
        let mut count_diff = 0i64;
        let mut last: Option<LastPartition> = None;
        let mut step = offset + FPT_HEADER_SIZE;

        for _ in 0..header.num_partitions {
            let entry: FptEntry = decode_at(buf, step)?;
            if entry.is_blank() {
                count_diff -= 1;
            }

            let (p_offset, p_size) = (entry.offset, entry.size);
            let end = if 0 < p_offset && p_offset < UNSET && 0 < p_size && p_size < UNSET {
                p_offset.saturating_add(p_size)
            } else {
                UNSET
            };
            let best = last.map(|l| l.offset).unwrap_or(0);
            if best < p_offset && p_offset < UNSET {
                last = Some(LastPartition {
                    offset: p_offset,
                    size: p_size,
                    end,
                });
            }

            entries.push(entry);
            step += FPT_ENTRY_SIZE;
        }

        // Entries past the declared count, until an erased slot.
        while let Some(slot) = slice_at(buf, step + 2, 10) {
            if is_padding(slot) {
                break;
            }
            count_diff += 1;
            step += FPT_ENTRY_SIZE;
        }

        Ok(FptTable {
            offset,
            count,
            header,
            entries,
            count_diff,
            last,
        })
    }

    pub fn declared_count(&self) -> u32 {
        self.header.num_partitions
    }

    pub fn computed_count(&self) -> i64 {
        self.header.num_partitions as i64 + self.count_diff
    }

    /// Start of a partition; entry offsets are relative to the table start
    /// including its 16-byte pre-header.
    pub fn partition_start(&self, entry: &FptEntry) -> usize {
        (self.offset + entry.offset as usize).saturating_sub(FPT_PRE_HEADER_SIZE)
    }

    pub fn find(&self, name: &[u8; 4]) -> Option<&FptEntry> {
        self.entries.iter().find(|e| &e.name == name)
    }

    /// Which bytes the checksum covers. The pre-header is only present on
    /// some version/length combinations.
    pub fn checksum_layout(&self, variant: Variant, major: u16) -> ChecksumLayout {
        let base = self.offset.saturating_sub(FPT_PRE_HEADER_SIZE);
        match (self.header.version, self.header.length) {
            (0x20, 0x30) => ChecksumLayout {
                table_start: base,
                check_start: 0,
                has_pre_header: true,
            },
            (0x20, 0x20) if variant.is_cse(major) => ChecksumLayout {
                table_start: base,
                check_start: FPT_PRE_HEADER_SIZE,
                has_pre_header: true,
            },
            (0x10, 0x20) => ChecksumLayout {
                table_start: self.offset,
                check_start: 0,
                has_pre_header: false,
            },
            _ => ChecksumLayout {
                table_start: base,
                check_start: 0,
                has_pre_header: false,
            },
        }
    }

    pub fn pre_header(&self, buf: &[u8], layout: &ChecksumLayout) -> Option<FptPreHeader> {
        if !layout.has_pre_header {
            return None;
        }
        decode_at(buf, layout.table_start).ok()
    }

    /// 8-bit checksum as (stored, computed). Range and exemptions follow
    /// the layout rules; see [`FptTable::checksum_failed`].
    pub fn checksum(&self, buf: &[u8], layout: &ChecksumLayout) -> (u8, u8) {
        let start = layout.table_start + layout.check_start;
        let len = self.header.length as usize;
        let region = slice_at(buf, start, len).unwrap_or(&[]);
        let sum = region
            .iter()
            .fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
            .wrapping_sub(self.header.checksum as u32);
        (self.header.checksum, crate::verify::checksum8_from_sum(sum))
    }

    /// ME 12+ and TXE 3+ ship a zero placeholder checksum from FIT.
    pub fn checksum_failed(&self, buf: &[u8], variant: Variant, major: u16) -> Option<(u8, u8)> {
        let layout = self.checksum_layout(variant, major);
        let (stored, computed) = self.checksum(buf, &layout);
        let exempt = match variant {
            Variant::Me => major >= 12,
            Variant::Txe => major >= 3,
            Variant::Sps => false,
        };
        (stored != computed && !exempt).then_some((stored, computed))
    }

    /// SPS 3 keeps an extra 16-bit checksum right after the entries.
    /// Returns (stored, computed).
    pub fn sps3_checksum(&self, buf: &[u8], layout: &ChecksumLayout) -> (u16, u16) {
        let start = layout.table_start + 0x30;
        let len = self.header.num_partitions as usize * FPT_ENTRY_SIZE;
        let region = slice_at(buf, start, len).unwrap_or(&[]);
        let stored = view::u16_at(buf, start + len).unwrap_or(0);
        (stored, crate::verify::checksum16(region))
    }

    /// A `ROMB` entry, and whether it points anywhere.
    pub fn romb(&self) -> Option<bool> {
        self.find(b"ROMB").map(|e| e.offset != 0 && e.size != 0)
    }

    /// Partitions found before `index`, used for the `CODE`/`RCVY` rule.
    pub fn rcvy_before(&self, index: usize) -> bool {
        self.entries[..index.min(self.entries.len())]
            .iter()
            .any(|e| &e.name == b"RCVY")
    }
}

/// Printable offset/size, dashes for unset values.
pub fn display_u32(value: u32) -> String {
    if value == 0 || value == UNSET {
        "----------".to_string()
    } else {
        format!("0x{value:08X}")
    }
}

/// Raw FPT header used by table dumps and tests.
pub fn encode_header(num: u32, version: u8, length: u8, checksum: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(FPT_HEADER_SIZE);
    out.extend_from_slice(b"$FPT");
    out.extend_from_slice(&num.to_le_bytes());
    out.extend_from_slice(&[version, 0x10, length, checksum]);
    out.resize(FPT_HEADER_SIZE, 0);
    out
}

pub fn encode_entry(name: &[u8; 4], offset: u32, size: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(FPT_ENTRY_SIZE);
    out.extend_from_slice(name);
    out.extend_from_slice(&[0xFF; 4]);
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.resize(FPT_ENTRY_SIZE, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Table with the tag at 0x10 so the pre-header starts at 0.
    fn image(entries: &[(&[u8; 4], u32, u32)], version: u8, len: u8) -> Vec<u8> {
        let mut buf = vec![0xFFu8; 0x8000];
        buf[..0x10].fill(0);
        let hdr = encode_header(entries.len() as u32, version, len, 0);
        buf[0x10..0x30].copy_from_slice(&hdr);
        for (i, (name, off, size)) in entries.iter().enumerate() {
            let at = 0x30 + i * FPT_ENTRY_SIZE;
            buf[at..at + FPT_ENTRY_SIZE].copy_from_slice(&encode_entry(name, *off, *size));
        }
        buf
    }

    #[test]
    fn decodes_entries_and_last_partition() {
        let buf = image(&[(b"FTPR", 0x1000, 0x2000), (b"NFTP", 0x3000, 0)], 0x20, 0x20);
        let table = FptTable::decode(&buf, 0x10, 1).unwrap();
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.entries[0].name(), "FTPR");
        assert_eq!(table.partition_start(&table.entries[0]), 0x1000);
        assert_eq!(table.count_diff, 0);
        let last = table.last.unwrap();
        assert_eq!(last.offset, 0x3000);
        assert!(last.is_uncharted());
    }

    #[test]
    fn sized_last_partition_is_charted() {
        let buf = image(&[(b"FTPR", 0x1000, 0x2000), (b"NFTP", 0x3000, 0x800)], 0x20, 0x20);
        let table = FptTable::decode(&buf, 0x10, 1).unwrap();
        assert_eq!(table.last.unwrap().end, 0x3800);
    }

    #[test]
    fn counts_blank_and_extra_entries() {
        let mut buf = image(&[(b"FTPR", 0x1000, 0x2000), (&[0xFF; 4], 0, 0)], 0x20, 0x20);
        let table = FptTable::decode(&buf, 0x10, 1).unwrap();
        assert_eq!(table.count_diff, -1);

        // An undeclared third entry after the two declared ones.
        buf[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
        let table = FptTable::decode(&buf, 0x10, 1).unwrap();
        assert_eq!(table.entries.len(), 1);
        assert_eq!(table.count_diff, 1);
        assert_eq!(table.computed_count(), 2);
    }

    #[test]
    fn backup_copies_are_skipped() {
        let mut buf = vec![0u8; 0x4000];
        buf[0x10..0x14].copy_from_slice(b"$FPT");
        buf[0x110..0x114].copy_from_slice(b"$FPT");
        buf[0x1110..0x1114].copy_from_slice(b"$FPT");
        let (offset, count) = select_primary(&buf, &[0x10, 0x110, 0x1110]).unwrap();
        assert_eq!(offset, 0x1110);
        assert_eq!(count, 1);
    }

    #[test]
    fn independent_tables_are_kept() {
        let mut buf = vec![0u8; 0x10000];
        buf[0x10..0x14].copy_from_slice(b"$FPT");
        buf[0x8010..0x8014].copy_from_slice(b"$FPT");
        let (offset, count) = select_primary(&buf, &[0x10, 0x8010]).unwrap();
        assert_eq!(offset, 0x10);
        assert_eq!(count, 2);
    }

    #[test]
    fn checksum_over_header_and_entries() {
        let mut buf = image(&[(b"FTPR", 0x1000, 0x2000)], 0x20, 0x30);
        let table = FptTable::decode(&buf, 0x10, 1).unwrap();
        let layout = table.checksum_layout(Variant::Me, 9);
        assert_eq!(layout.table_start, 0);
        let (_, computed) = table.checksum(&buf, &layout);
        buf[0x10 + 0xB] = computed;
        let table = FptTable::decode(&buf, 0x10, 1).unwrap();
        assert!(table.checksum_failed(&buf, Variant::Me, 9).is_none());

        buf[0x10 + 0xB] = computed.wrapping_add(1);
        let table = FptTable::decode(&buf, 0x10, 1).unwrap();
        assert!(table.checksum_failed(&buf, Variant::Me, 9).is_some());
        // FIT placeholder checksums are not reported.
        assert!(table.checksum_failed(&buf, Variant::Me, 12).is_none());
    }

    #[test]
    fn layout_depends_on_family() {
        let buf = image(&[(b"FTPR", 0x1000, 0x2000)], 0x20, 0x20);
        let table = FptTable::decode(&buf, 0x10, 1).unwrap();
        assert_eq!(table.checksum_layout(Variant::Me, 11).check_start, 0x10);
        assert!(!table.checksum_layout(Variant::Me, 10).has_pre_header);
        let buf = image(&[(b"FTPR", 0x1000, 0x2000)], 0x10, 0x20);
        let table = FptTable::decode(&buf, 0x10, 1).unwrap();
        assert_eq!(table.checksum_layout(Variant::Me, 7).table_start, 0x10);
    }
}
