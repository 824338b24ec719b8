use crate::view::{Decode, array, skip};
use nom::{
    IResult,
    number::complete::{le_u8, le_u16, le_u32},
};
use std::fmt;

/// Engine firmware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Me,
    Txe,
    Sps,
}

impl Variant {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ME" => Some(Variant::Me),
            "TXE" => Some(Variant::Txe),
            "SPS" => Some(Variant::Sps),
            _ => None,
        }
    }

    /// Families that moved to the `$CPD` layout: ME 11+, TXE 3+, SPS 4+.
    pub fn is_cse(self, major: u16) -> bool {
        match self {
            Variant::Me => major >= 11,
            Variant::Txe => major >= 3,
            Variant::Sps => major >= 4,
        }
    }

    /// Families whose manifest signature is computed over SHA-1.
    pub fn uses_sha1(self, major: u16) -> bool {
        match self {
            Variant::Me => major < 6,
            Variant::Sps => major < 2,
            Variant::Txe => false,
        }
    }

    /// Size of each legacy `$MME` module header following a `$MN2` manifest.
    pub fn mme_size(self) -> usize {
        match self {
            Variant::Txe => 0x80,
            Variant::Me | Variant::Sps => 0x60,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Variant::Me => "ME",
            Variant::Txe => "TXE",
            Variant::Sps => "SPS",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub hotfix: u16,
    pub build: u16,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.hotfix, self.build)
    }
}

impl Version {
    /// SPS prints a zero padded version.
    pub fn padded(&self) -> String {
        format!(
            "{:02}.{:02}.{:02}.{:03}",
            self.major, self.minor, self.hotfix, self.build
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Production,
    PreProduction,
    RomBypass,
}

impl Release {
    pub fn from_flags(flags: u32) -> Self {
        if (flags >> 31) & 1 == 1 {
            Release::PreProduction
        } else {
            Release::Production
        }
    }

    pub fn short(self) -> &'static str {
        match self {
            Release::Production => "PRD",
            Release::PreProduction => "PRE",
            Release::RomBypass => "BYP",
        }
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Release::Production => "Production",
            Release::PreProduction => "Pre-Production",
            Release::RomBypass => "ROM-Bypass",
        })
    }
}

/// Signed manifest header (`$MN2`, or `$MAN` on ME 2-5 and SPS 1).
///
/// `public_key` and `signature` are kept as the on-disk bytes: both are
/// little-endian integers.
#[derive(Debug, Clone)]
pub struct ManifestHeader {
    pub header_type: u32,
    /// In 4-byte units.
    pub header_length: u32,
    pub header_version: u32,
    pub flags: u32,
    pub vendor_id: u32,
    pub day: u8,
    pub month: u8,
    pub year: u16,
    /// In 4-byte units.
    pub size: u32,
    pub tag: [u8; 4],
    pub num_modules: u32,
    pub version: Version,
    pub svn: u8,
    pub svn_8: u8,
    pub vcn: u8,
    pub key_size: u32,
    pub scratch_size: u32,
    pub public_key: [u8; 256],
    pub exponent: u32,
    pub signature: [u8; 256],
}

impl Decode for ManifestHeader {
    const SIZE: usize = 0x284;
    const NAME: &'static str = "manifest header";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, header_type) = le_u32(input)?;
        let (input, header_length) = le_u32(input)?;
        let (input, header_version) = le_u32(input)?;
        let (input, flags) = le_u32(input)?;
        let (input, vendor_id) = le_u32(input)?;
        let (input, day) = le_u8(input)?;
        let (input, month) = le_u8(input)?;
        let (input, year) = le_u16(input)?;
        let (input, size) = le_u32(input)?;
        let (input, tag) = array::<4>(input)?;
        let (input, num_modules) = le_u32(input)?;
        let (input, major) = le_u16(input)?;
        let (input, minor) = le_u16(input)?;
        let (input, hotfix) = le_u16(input)?;
        let (input, build) = le_u16(input)?;
        let (input, svn) = le_u8(input)?;
        let (input, _) = skip(3)(input)?;
        let (input, svn_8) = le_u8(input)?;
        let (input, _) = skip(3)(input)?;
        let (input, vcn) = le_u8(input)?;
        let (input, _) = skip(3 + 0x40)(input)?;
        let (input, key_size) = le_u32(input)?;
        let (input, scratch_size) = le_u32(input)?;
        let (input, public_key) = array::<256>(input)?;
        let (input, exponent) = le_u32(input)?;
        let (input, signature) = array::<256>(input)?;

        Ok((
            input,
            ManifestHeader {
                header_type,
                header_length,
                header_version,
                flags,
                vendor_id,
                day,
                month,
                year,
                size,
                tag,
                num_modules,
                version: Version {
                    major,
                    minor,
                    hotfix,
                    build,
                },
                svn,
                svn_8,
                vcn,
                key_size,
                scratch_size,
                public_key,
                exponent,
                signature,
            },
        ))
    }
}

impl ManifestHeader {
    pub fn header_bytes(&self) -> usize {
        self.header_length as usize * 4
    }

    pub fn size_bytes(&self) -> usize {
        self.size as usize * 4
    }

    pub fn is_mn2(&self) -> bool {
        &self.tag == b"$MN2"
    }

    pub fn is_debug_signed(&self) -> bool {
        (self.flags >> 31) & 1 == 1
    }

    pub fn is_pre_production(&self) -> bool {
        (self.flags >> 30) & 1 == 1
    }

    /// Dates are stored as BCD, so the hex digits read as decimal.
    pub fn date(&self) -> String {
        format!("{:04X}-{:02X}-{:02X}", self.year, self.month, self.day)
    }

    /// First 16 bytes of the public key, as used by the database.
    pub fn public_key_prefix(&self) -> String {
        hex::encode_upper(&self.public_key[..16])
    }
}

/// `$MME` module header used by ME 2-5 and SPS 1.
#[derive(Debug, Clone)]
pub struct MmeHeaderOld {
    pub tag: [u8; 4],
    pub guid: [u8; 16],
    pub version: Version,
    pub name: [u8; 16],
    pub hash: [u8; 20],
    pub size: u32,
    pub flags: u32,
}

impl Decode for MmeHeaderOld {
    const SIZE: usize = 0x50;
    const NAME: &'static str = "legacy module header";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, tag) = array::<4>(input)?;
        let (input, guid) = array::<16>(input)?;
        let (input, major) = le_u16(input)?;
        let (input, minor) = le_u16(input)?;
        let (input, hotfix) = le_u16(input)?;
        let (input, build) = le_u16(input)?;
        let (input, name) = array::<16>(input)?;
        let (input, hash) = array::<20>(input)?;
        let (input, size) = le_u32(input)?;
        let (input, flags) = le_u32(input)?;
        let (input, _) = skip(8)(input)?;
        Ok((
            input,
            MmeHeaderOld {
                tag,
                guid,
                version: Version {
                    major,
                    minor,
                    hotfix,
                    build,
                },
                name,
                hash,
                size,
                flags,
            },
        ))
    }
}

/// `$MME` module header used by ME 6-10, TXE 1-2 and SPS 2-3.
#[derive(Debug, Clone)]
pub struct MmeHeaderNew {
    pub tag: [u8; 4],
    pub name: [u8; 16],
    pub hash: [u8; 32],
    pub mod_base: u32,
    /// Code offset relative to the manifest.
    pub offset_mn2: u32,
    pub size_uncomp: u32,
    pub size_comp: u32,
    pub memory_size: u32,
    pub pre_uma_size: u32,
    pub entry_point: u32,
    pub flags: u32,
}

impl Decode for MmeHeaderNew {
    const SIZE: usize = 0x60;
    const NAME: &'static str = "module header";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, tag) = array::<4>(input)?;
        let (input, name) = array::<16>(input)?;
        let (input, hash) = array::<32>(input)?;
        let (input, mod_base) = le_u32(input)?;
        let (input, offset_mn2) = le_u32(input)?;
        let (input, size_uncomp) = le_u32(input)?;
        let (input, size_comp) = le_u32(input)?;
        let (input, memory_size) = le_u32(input)?;
        let (input, pre_uma_size) = le_u32(input)?;
        let (input, entry_point) = le_u32(input)?;
        let (input, flags) = le_u32(input)?;
        let (input, _) = skip(12)(input)?;
        Ok((
            input,
            MmeHeaderNew {
                tag,
                name,
                hash,
                mod_base,
                offset_mn2,
                size_uncomp,
                size_comp,
                memory_size,
                pre_uma_size,
                entry_point,
                flags,
            },
        ))
    }
}

impl MmeHeaderNew {
    /// Stored size of the module code; uncompressed modules leave the
    /// compressed size at zero.
    pub fn stored_size(&self) -> u32 {
        if self.size_comp > 0 {
            self.size_comp
        } else {
            self.size_uncomp
        }
    }
}

/// Multi Chip Package header, holds the partition code size on ME 7-10.
#[derive(Debug, Clone)]
pub struct McpHeader {
    pub tag: [u8; 4],
    pub header_size: u32,
    pub code_size: u32,
    pub offset_code_mn2: u32,
    pub offset_part_fpt: u32,
    pub hash: [u8; 32],
}

impl Decode for McpHeader {
    const SIZE: usize = 0x34;
    const NAME: &'static str = "multi chip package header";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, tag) = array::<4>(input)?;
        let (input, header_size) = le_u32(input)?;
        let (input, code_size) = le_u32(input)?;
        let (input, offset_code_mn2) = le_u32(input)?;
        let (input, offset_part_fpt) = le_u32(input)?;
        let (input, hash) = array::<32>(input)?;
        Ok((
            input,
            McpHeader {
                tag,
                header_size,
                code_size,
                offset_code_mn2,
                offset_part_fpt,
                hash,
            },
        ))
    }
}
