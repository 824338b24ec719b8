//! Code Partition Directory (`$CPD`), the module index of ME 11+, TXE 3+
//! and SPS 4+ partitions.

use crate::error::{DecodeError, DecodeResult};
use crate::verify;
use crate::view::{Decode, array, decode_at, name_str, slice_at};
use nom::{
    IResult,
    number::complete::{le_u8, le_u32},
};

pub const CPD_HEADER_SIZE: usize = 0x10;
pub const CPD_ENTRY_SIZE: usize = 0x18;

/// Offset of the checksum byte inside the header.
const CHECKSUM_INDEX: usize = 0xB;

const OFFSET_MASK: u32 = 0x01FF_FFFF;
const HUFFMAN_BIT: u32 = 25;

#[derive(Debug, Clone)]
pub struct CpdHeader {
    pub tag: [u8; 4],
    pub num_modules: u32,
    pub header_version: u8,
    pub entry_version: u8,
    pub header_length: u8,
    pub checksum: u8,
    pub partition_name: [u8; 4],
}

impl Decode for CpdHeader {
    const SIZE: usize = CPD_HEADER_SIZE;
    const NAME: &'static str = "$CPD header";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, tag) = array::<4>(input)?;
        let (input, num_modules) = le_u32(input)?;
        let (input, header_version) = le_u8(input)?;
        let (input, entry_version) = le_u8(input)?;
        let (input, header_length) = le_u8(input)?;
        let (input, checksum) = le_u8(input)?;
        let (input, partition_name) = array::<4>(input)?;
        Ok((
            input,
            CpdHeader {
                tag,
                num_modules,
                header_version,
                entry_version,
                header_length,
                checksum,
                partition_name,
            },
        ))
    }
}

/// Directory entry. `offset_attrib` packs the offset from the directory
/// start (bits 0..25) and the Huffman flag (bit 25); the upper bits are
/// reserved and not validated since shipped images set them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpdEntry {
    pub name: [u8; 12],
    pub offset_attrib: u32,
    /// Uncompressed size; the compressed one lives in extension 0x0A.
    pub size: u32,
    pub reserved: u32,
}

impl Decode for CpdEntry {
    const SIZE: usize = CPD_ENTRY_SIZE;
    const NAME: &'static str = "$CPD entry";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, name) = array::<12>(input)?;
        let (input, offset_attrib) = le_u32(input)?;
        let (input, size) = le_u32(input)?;
        let (input, reserved) = le_u32(input)?;
        Ok((
            input,
            CpdEntry {
                name,
                offset_attrib,
                size,
                reserved,
            },
        ))
    }
}

impl CpdEntry {
    pub fn offset(&self) -> u32 {
        self.offset_attrib & OFFSET_MASK
    }

    pub fn is_huffman(&self) -> bool {
        (self.offset_attrib >> HUFFMAN_BIT) & 1 == 1
    }

    pub fn name(&self) -> String {
        name_str(&self.name)
    }

    pub fn is_manifest(&self) -> bool {
        self.name().contains(".man")
    }

    pub fn is_metadata(&self) -> bool {
        self.name().contains(".met")
    }

    /// Entries whose content is an extension stream.
    pub fn has_extensions(&self) -> bool {
        self.is_manifest() || self.is_metadata()
    }
}

#[derive(Debug, Clone)]
pub struct CpdDirectory {
    pub offset: usize,
    pub header: CpdHeader,
    pub entries: Vec<CpdEntry>,
    pub checksum_valid: bool,
}

impl CpdDirectory {
    pub fn decode(buf: &[u8], offset: usize) -> DecodeResult<Self> {
        let header: CpdHeader = decode_at(buf, offset)?;
        if &header.tag != b"$CPD" {
            return Err(DecodeError::BadTag {
                what: CpdHeader::NAME,
                offset,
            });
        }

        let table_len = table_len(header.num_modules);
        let table = slice_at(buf, offset, table_len).ok_or(DecodeError::Truncated {
            what: "$CPD entry table",
            offset,
            needed: table_len,
            available: buf.len().saturating_sub(offset),
        })?;
        let (stored, computed) = checksum(table);

        let entries = (0..header.num_modules as usize)
            .map(|i| decode_at(buf, offset + CPD_HEADER_SIZE + i * CPD_ENTRY_SIZE))
            .collect::<DecodeResult<Vec<CpdEntry>>>()?;

        Ok(CpdDirectory {
            offset,
            header,
            entries,
            checksum_valid: stored == computed,
        })
    }

    pub fn name(&self) -> String {
        name_str(&self.header.partition_name)
    }

    /// Absolute offset of an entry's data.
    pub fn entry_start(&self, entry: &CpdEntry) -> usize {
        self.offset + entry.offset() as usize
    }

    pub fn find(&self, name: &str) -> Option<&CpdEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    /// First byte after the entry table, where the partition manifest sits.
    pub fn table_end(&self) -> usize {
        self.offset + table_len(self.header.num_modules)
    }
}

fn table_len(num_modules: u32) -> usize {
    CPD_HEADER_SIZE + num_modules as usize * CPD_ENTRY_SIZE
}

/// Directory checksum over header and entry table. Returns
/// (stored, computed).
pub fn checksum(table: &[u8]) -> (u8, u8) {
    verify::checksum8(table, CHECKSUM_INDEX)
}

/// Pack an entry's offset word.
pub fn offset_attrib(offset: u32, huffman: bool) -> u32 {
    (offset & OFFSET_MASK) | ((huffman as u32) << HUFFMAN_BIT)
}

/// Build a directory with a correct checksum. Entries are
/// (name, offset word, size).
pub fn encode(partition: &[u8; 4], entries: &[(&str, u32, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(table_len(entries.len() as u32));
    out.extend_from_slice(b"$CPD");
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0x01, 0x01, 0x10, 0x00]);
    out.extend_from_slice(partition);
    for (name, attrib, size) in entries {
        let mut raw = [0u8; 12];
        let len = name.len().min(12);
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        out.extend_from_slice(&raw);
        out.extend_from_slice(&attrib.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
    }
    let (_, computed) = checksum(&out);
    out[CHECKSUM_INDEX] = computed;
    out
}
