//! Tagged extension records stored in `.man`, `.met` and `.key` entries.
//!
//! Every record starts with a u32 tag and a u32 total length. Tags the
//! resolver consumes decode into typed structures; every known tag also
//! decodes into printable [`Record`]s for the extraction text dumps.

use crate::error::DecodeError;
use crate::view::{Decode, array, decode_at, name_str, reversed, skip, u32_at};
use nom::{
    IResult,
    number::complete::{le_u8, le_u16, le_u32, le_u64},
};
use std::fmt;
use tracing::debug;

/// Records visited per entry before the scan is abandoned.
pub const MAX_EXTENSIONS: usize = 100;

const EXT_HEADER_SIZE: usize = 8;

pub const TAG_PARTITION_INFO: u32 = 0x03;
pub const TAG_MODULE_ATTRIBUTES: u32 = 0x0A;
pub const TAG_CLIENT_SYSTEM_INFO: u32 = 0x0C;
pub const TAG_SIGNED_PACKAGE_INFO: u32 = 0x0F;
pub const TAG_IUNP: u32 = 0x10;
pub const TAG_BOOT_POLICY: u32 = 0x13;
pub const TAG_PLATFORM_ID: u32 = 0x32;

#[derive(Debug, Clone, Copy)]
enum Kind {
    U8,
    U16,
    U32,
    U64,
    Name(usize),
    /// 32-byte hash stored as a little-endian integer.
    Hash,
    /// u32 array printed as one little-endian number.
    Words(usize),
    Raw(usize),
}

impl Kind {
    fn size(self) -> usize {
        match self {
            Kind::U8 => 1,
            Kind::U16 => 2,
            Kind::U32 => 4,
            Kind::U64 => 8,
            Kind::Name(n) | Kind::Raw(n) => n,
            Kind::Hash => 32,
            Kind::Words(n) => n * 4,
        }
    }
}

struct Layout {
    title: &'static str,
    size: usize,
    fields: &'static [(&'static str, Kind)],
}

struct Shape {
    tag: u32,
    header: Layout,
    entry: Option<Layout>,
}

use Kind::*;

static SHAPES: &[Shape] = &[
    Shape {
        tag: 0x00,
        header: Layout {
            title: "System Info",
            size: 0x40,
            fields: &[
                ("MinUMASize", U32),
                ("ChipsetVersion", U32),
                ("IMGDefaultHash", Hash),
                ("PageableUMASize", U32),
                ("Reserved0", U64),
                ("Reserved1", U32),
            ],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x0C,
            fields: &[("Name", Name(4)), ("Version", U32), ("UserID", U16), ("Reserved", U16)],
        }),
    },
    Shape {
        tag: 0x01,
        header: Layout {
            title: "Init Script",
            size: 0x10,
            fields: &[("Reserved", U32), ("ModuleCount", U32)],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x18,
            fields: &[
                ("PartitionName", Name(4)),
                ("ModuleName", Name(12)),
                ("InitFlowFlags", U32),
                ("BootTypeFlags", U32),
            ],
        }),
    },
    Shape {
        tag: 0x02,
        header: Layout {
            title: "Feature Permissions",
            size: 0x0C,
            fields: &[("FeatureCount", U32)],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x04,
            fields: &[("UserID", U16), ("Reserved", U16)],
        }),
    },
    Shape {
        tag: 0x03,
        header: Layout {
            title: "Partition Info",
            size: 0x58,
            fields: &[
                ("PartitionName", Name(4)),
                ("PartitionSize", U32),
                ("Hash", Hash),
                ("VCN", U32),
                ("PartitionVer", U32),
                ("DataFormatVer", U32),
                ("InstanceID", U32),
                ("Flags", U32),
                ("Reserved", Words(5)),
            ],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x34,
            fields: &[
                ("Name", Name(12)),
                ("Type", U8),
                ("Compression", U8),
                ("Reserved", U16),
                ("MetadataSize", U32),
                ("MetadataHash", Hash),
            ],
        }),
    },
    Shape {
        tag: 0x04,
        header: Layout {
            title: "Shared Library",
            size: 0x1C,
            fields: &[
                ("ContextSize", U32),
                ("TotAlocVirtSpc", U32),
                ("CodeBaseAddress", U32),
                ("TLSSize", U32),
                ("Reserved", U32),
            ],
        },
        entry: None,
    },
    Shape {
        tag: 0x05,
        header: Layout {
            title: "Process Manifest",
            size: 0x46,
            fields: &[
                ("Flags", U32),
                ("CodeBaseAddress", U32),
                ("CodeSizeUncomp", U32),
                ("CM0HeapSize", U32),
                ("BSSSize", U32),
                ("DefaultHeapSize", U32),
                ("MainThreadEntry", U32),
                ("AllowedSysCalls", Words(3)),
                ("UserID", U16),
                ("Reserved0", U32),
                ("Reserved1", U16),
                ("Reserved2", U64),
                ("GroupID", Raw(6)),
            ],
        },
        entry: None,
    },
    Shape {
        tag: 0x06,
        header: Layout {
            title: "Threads",
            size: 0x08,
            fields: &[],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x10,
            fields: &[
                ("StackSize", U32),
                ("Flags", U32),
                ("SchedulPolicy", U32),
                ("Reserved", U32),
            ],
        }),
    },
    Shape {
        tag: 0x07,
        header: Layout {
            title: "Device IDs",
            size: 0x08,
            fields: &[],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x08,
            fields: &[("DeviceID", U32), ("Reserved", U32)],
        }),
    },
    Shape {
        tag: 0x08,
        header: Layout {
            title: "MMIO Ranges",
            size: 0x08,
            fields: &[],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x0C,
            fields: &[("BaseAddress", U32), ("SizeLimit", U32), ("Flags", U32)],
        }),
    },
    Shape {
        tag: 0x09,
        header: Layout {
            title: "Special File Producer",
            size: 0x0C,
            fields: &[("MajorNumber", U16), ("Flags", U16)],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x18,
            fields: &[
                ("Name", Name(12)),
                ("AccessMode", U16),
                ("UserID", U16),
                ("GroupID", U16),
                ("MinorNumber", U8),
                ("Reserved0", U8),
                ("Reserved1", U32),
            ],
        }),
    },
    Shape {
        tag: 0x0A,
        header: Layout {
            title: "Module Attributes",
            size: 0x38,
            fields: &[
                ("Compression", U8),
                ("Encryption", U8),
                ("Reserved0", U8),
                ("Reserved1", U8),
                ("SizeUncomp", U32),
                ("SizeComp", U32),
                ("DEV_ID", U16),
                ("VEN_ID", U16),
                ("Hash", Hash),
            ],
        },
        entry: None,
    },
    Shape {
        tag: 0x0B,
        header: Layout {
            title: "Locked Ranges",
            size: 0x08,
            fields: &[],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x08,
            fields: &[("RangeBase", U32), ("RangeSize", U32)],
        }),
    },
    Shape {
        tag: 0x0C,
        header: Layout {
            title: "Client System Info",
            size: 0x30,
            fields: &[
                ("FWSKUCaps", U32),
                ("FWSKUCapsReserv", Words(7)),
                ("FWSKUAttrib", U64),
            ],
        },
        entry: None,
    },
    Shape {
        tag: 0x0D,
        header: Layout {
            title: "User Info",
            size: 0x08,
            fields: &[],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x34,
            fields: &[
                ("UserID", U16),
                ("Reserved", U16),
                ("NVStorageQuota", U32),
                ("RAMStorageQuota", U32),
                ("WOPQuota", U32),
                ("WorkingDir", Name(36)),
            ],
        }),
    },
    Shape {
        tag: 0x0E,
        header: Layout {
            title: "Key Manifest",
            size: 0x24,
            fields: &[
                ("Type", U32),
                ("SVN", U32),
                ("OEMID", U16),
                ("ID", U8),
                ("Reserved0", U8),
                ("Reserved1", Words(4)),
            ],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x44,
            fields: &[
                ("Usage", Words(4)),
                ("Reserved0", Words(4)),
                ("Flags", U8),
                ("HashAlgorithm", U8),
                ("HashSize", U16),
                ("Hash", Raw(32)),
            ],
        }),
    },
    Shape {
        tag: 0x0F,
        header: Layout {
            title: "Signed Package Info",
            size: 0x34,
            fields: &[
                ("PartitionName", Name(4)),
                ("VCN", U32),
                ("UsageBitmap", Words(4)),
                ("SVN", U32),
                ("Reserved", Words(4)),
            ],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x34,
            fields: &[
                ("Name", Name(12)),
                ("Type", U8),
                ("HashAlgorithm", U8),
                ("HashSize", U16),
                ("MetadataSize", U32),
                ("MetadataHash", Hash),
            ],
        }),
    },
    Shape {
        tag: 0x10,
        header: Layout {
            title: "IUNP",
            size: 0x60,
            fields: &[
                ("ModuleCount", U32),
                ("Reserved0", Words(4)),
                ("SizeComp", U32),
                ("SizeUncomp", U32),
                ("Day", U8),
                ("Month", U8),
                ("Year", U16),
                ("Hash", Raw(32)),
                ("Reserved1", Words(6)),
            ],
        },
        entry: None,
    },
    Shape {
        tag: 0x12,
        header: Layout {
            title: "Unknown (FTPR)",
            size: 0x1C,
            fields: &[("ModuleCount", U32), ("Reserved", Words(4))],
        },
        entry: Some(Layout {
            title: "Module",
            size: 0x38,
            fields: &[("Values", Raw(0x38))],
        }),
    },
    Shape {
        tag: 0x13,
        header: Layout {
            title: "Boot Policy",
            size: 0xB4,
            fields: &[
                ("NemData", U32),
                ("IBBLHashAlg", U32),
                ("IBBLHashSize", U32),
                ("IBBLHash", Raw(32)),
                ("IBBHashAlg", U32),
                ("IBBHashSize", U32),
                ("IBBHash", Raw(32)),
                ("OBBHashAlg", U32),
                ("OBBHashSize", U32),
                ("OBBHash", Raw(32)),
                ("IBBFlags", U32),
                ("IBBMCHBar", U64),
                ("IBBVTDBar", U64),
                ("PMRLBase", U32),
                ("PMRLLimit", U32),
                ("PMRHBase", U32),
                ("PMRHLimit", U32),
                ("IBBEntryPoint", U32),
                ("IBBSegmentCount", U32),
                ("VendorAttrSize", U32),
            ],
        },
        entry: None,
    },
    Shape {
        tag: 0x14,
        header: Layout {
            title: "DNX",
            size: 0x148,
            fields: &[
                ("Major", U8),
                ("Minor", U8),
                ("Reserved0", U8),
                ("Reserved1", U8),
                ("OEMID", U16),
                ("PlatformID", U16),
                ("MachineID", Words(4)),
                ("IDSalt", U32),
                ("PublicKey", Raw(0x100)),
                ("PublicExponent", U32),
                ("RegionCount", U32),
                ("Flags", U32),
                ("Reserved2", U32),
                ("Reserved3", U32),
                ("Reserved4", U32),
                ("Reserved5", U32),
                ("ChunkSize", U32),
                ("ChunkCount", U32),
            ],
        },
        entry: None,
    },
    Shape {
        tag: 0x15,
        header: Layout {
            title: "Secure Token",
            size: 0x34,
            fields: &[
                ("ExtVersion", U32),
                ("PayloadVersion", U32),
                ("IDsCount", U32),
                ("TokenID", U32),
                ("Flags", U32),
                ("ExpirationSec", U32),
                ("ManufLot", U32),
                ("Reserved", Words(4)),
            ],
        },
        entry: None,
    },
    Shape {
        tag: 0x32,
        header: Layout {
            title: "SPS Platform ID",
            size: 0x10,
            fields: &[("Type", Name(4)), ("Reserved", U32)],
        },
        entry: None,
    },
];

fn shape_of(tag: u32) -> Option<&'static Shape> {
    SHAPES.iter().find(|s| s.tag == tag)
}

pub fn is_known(tag: u32) -> bool {
    shape_of(tag).is_some()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int { value: u64, width: usize },
    Text(String),
    Hex(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int { value, width } => write!(f, "{value:0width$X}"),
            Value::Text(s) | Value::Hex(s) => f.write_str(s),
        }
    }
}

/// One printable table: an extension header or one of its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub title: String,
    pub fields: Vec<(&'static str, Value)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title)?;
        for (name, value) in &self.fields {
            writeln!(f, "  {name:<16} : {value}")?;
        }
        Ok(())
    }
}

fn read_value(kind: Kind, bytes: &[u8]) -> Value {
    let int = |width: usize| {
        let mut le = [0u8; 8];
        le[..bytes.len()].copy_from_slice(bytes);
        Value::Int {
            value: u64::from_le_bytes(le),
            width,
        }
    };
    match kind {
        U8 => int(2),
        U16 => int(4),
        U32 => int(8),
        U64 => int(16),
        Name(_) => Value::Text(name_str(bytes)),
        Hash | Words(_) => {
            let mut be = bytes.to_vec();
            be.reverse();
            Value::Hex(hex::encode_upper(be))
        }
        Raw(_) => Value::Hex(hex::encode_upper(bytes)),
    }
}

/// Decode the fields of `layout` from `bytes`, which must hold at least
/// the fields' total size.
fn read_fields(layout: &Layout, title: String, bytes: &[u8]) -> Record {
    let mut fields = Vec::with_capacity(layout.fields.len());
    let mut at = 0;
    for &(name, kind) in layout.fields {
        let size = kind.size();
        if let Some(raw) = bytes.get(at..at + size) {
            fields.push((name, read_value(kind, raw)));
        }
        at += size;
    }
    Record { title, fields }
}

/// Sub-record of extensions 0x03 and 0x0F naming a module's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHash {
    pub name: [u8; 12],
    pub kind: u8,
    pub hash_type: u8,
    pub hash_size: u16,
    pub metadata_size: u32,
    /// Digest byte order.
    pub hash: [u8; 32],
}

impl Decode for MetadataHash {
    const SIZE: usize = 0x34;
    const NAME: &'static str = "metadata hash entry";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, name) = array::<12>(input)?;
        let (input, kind) = le_u8(input)?;
        let (input, hash_type) = le_u8(input)?;
        let (input, hash_size) = le_u16(input)?;
        let (input, metadata_size) = le_u32(input)?;
        let (input, hash) = array::<32>(input)?;
        Ok((
            input,
            MetadataHash {
                name,
                kind,
                hash_type,
                hash_size,
                metadata_size,
                hash: reversed(hash),
            },
        ))
    }
}

impl MetadataHash {
    /// Name of the `.met` entry this hash belongs to. Some images already
    /// carry the suffix in the name field.
    pub fn metadata_name(&self) -> String {
        let name = name_str(&self.name);
        if name.ends_with(".met") {
            name
        } else {
            format!("{name}.met")
        }
    }
}

fn metadata_hashes(body: &[u8], header: usize) -> Vec<MetadataHash> {
    body.get(header..)
        .unwrap_or(&[])
        .chunks_exact(MetadataHash::SIZE)
        .filter_map(|chunk| decode_at(chunk, 0).ok())
        .collect()
}

#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub name: [u8; 4],
    pub partition_size: u32,
    pub hash: [u8; 32],
    pub vcn: u32,
    pub partition_version: u32,
    pub data_format_version: u32,
    pub instance_id: u32,
    pub flags: u32,
    pub modules: Vec<MetadataHash>,
}

impl Decode for PartitionInfo {
    const SIZE: usize = 0x58;
    const NAME: &'static str = "partition info extension";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = skip(EXT_HEADER_SIZE)(input)?;
        let (input, name) = array::<4>(input)?;
        let (input, partition_size) = le_u32(input)?;
        let (input, hash) = array::<32>(input)?;
        let (input, vcn) = le_u32(input)?;
        let (input, partition_version) = le_u32(input)?;
        let (input, data_format_version) = le_u32(input)?;
        let (input, instance_id) = le_u32(input)?;
        let (input, flags) = le_u32(input)?;
        let (input, _) = skip(20)(input)?;
        Ok((
            input,
            PartitionInfo {
                name,
                partition_size,
                hash: reversed(hash),
                vcn,
                partition_version,
                data_format_version,
                instance_id,
                flags,
                modules: Vec::new(),
            },
        ))
    }
}

impl PartitionInfo {
    pub fn partition_name(&self) -> String {
        name_str(&self.name)
    }
}

/// Extension 0x0A, the attributes of the module owning a `.met` entry.
#[derive(Debug, Clone)]
pub struct MetadataAttributes {
    pub compression: u8,
    pub encryption: u8,
    pub size_uncomp: u32,
    pub size_comp: u32,
    pub device_id: u16,
    pub vendor_id: u16,
    /// Digest byte order; covers the stored bytes for LZMA and the
    /// decoded bytes for Huffman.
    pub hash: [u8; 32],
}

impl Decode for MetadataAttributes {
    const SIZE: usize = 0x38;
    const NAME: &'static str = "module attributes extension";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = skip(EXT_HEADER_SIZE)(input)?;
        let (input, compression) = le_u8(input)?;
        let (input, encryption) = le_u8(input)?;
        let (input, _) = skip(2)(input)?;
        let (input, size_uncomp) = le_u32(input)?;
        let (input, size_comp) = le_u32(input)?;
        let (input, device_id) = le_u16(input)?;
        let (input, vendor_id) = le_u16(input)?;
        let (input, hash) = array::<32>(input)?;
        Ok((
            input,
            MetadataAttributes {
                compression,
                encryption,
                size_uncomp,
                size_comp,
                device_id,
                vendor_id,
                hash: reversed(hash),
            },
        ))
    }
}

/// SKU attribute bit-fields of extension 0x0C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkuAttributes {
    /// In 0.5 MB units.
    pub cse_size: u8,
    pub sku_type: u8,
    pub lewisburg: bool,
    pub m3: bool,
    pub m0: bool,
    pub sku_platform: u8,
    pub si_class: u8,
}

impl SkuAttributes {
    pub fn from_bits(bits: u64) -> Self {
        let field = |shift: u32, width: u32| ((bits >> shift) & ((1 << width) - 1)) as u8;
        SkuAttributes {
            cse_size: field(0, 4),
            sku_type: field(4, 3),
            lewisburg: field(7, 1) == 1,
            m3: field(8, 1) == 1,
            m0: field(9, 1) == 1,
            sku_platform: field(10, 2),
            si_class: field(12, 4),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSystemInfo {
    pub sku_capabilities: u32,
    pub sku_attributes: u64,
}

impl Decode for ClientSystemInfo {
    const SIZE: usize = 0x30;
    const NAME: &'static str = "client system info extension";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = skip(EXT_HEADER_SIZE)(input)?;
        let (input, sku_capabilities) = le_u32(input)?;
        let (input, _) = skip(28)(input)?;
        let (input, sku_attributes) = le_u64(input)?;
        Ok((
            input,
            ClientSystemInfo {
                sku_capabilities,
                sku_attributes,
            },
        ))
    }
}

impl ClientSystemInfo {
    pub fn sku(&self) -> SkuAttributes {
        SkuAttributes::from_bits(self.sku_attributes)
    }
}

#[derive(Debug, Clone)]
pub struct SignedPackageInfo {
    pub name: [u8; 4],
    pub vcn: u32,
    pub svn: u32,
    pub modules: Vec<MetadataHash>,
}

impl Decode for SignedPackageInfo {
    const SIZE: usize = 0x34;
    const NAME: &'static str = "signed package info extension";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = skip(EXT_HEADER_SIZE)(input)?;
        let (input, name) = array::<4>(input)?;
        let (input, vcn) = le_u32(input)?;
        let (input, _) = skip(16)(input)?;
        let (input, svn) = le_u32(input)?;
        let (input, _) = skip(16)(input)?;
        Ok((
            input,
            SignedPackageInfo {
                name,
                vcn,
                svn,
                modules: Vec::new(),
            },
        ))
    }
}

/// Extension 0x10, describes the single uncompressed IUNP module.
#[derive(Debug, Clone)]
pub struct Iunp {
    pub module_count: u32,
    pub size_comp: u32,
    pub size_uncomp: u32,
    pub day: u8,
    pub month: u8,
    pub year: u16,
    /// Stored in digest order.
    pub hash: [u8; 32],
}

impl Decode for Iunp {
    const SIZE: usize = 0x60;
    const NAME: &'static str = "IUNP extension";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = skip(EXT_HEADER_SIZE)(input)?;
        let (input, module_count) = le_u32(input)?;
        let (input, _) = skip(16)(input)?;
        let (input, size_comp) = le_u32(input)?;
        let (input, size_uncomp) = le_u32(input)?;
        let (input, day) = le_u8(input)?;
        let (input, month) = le_u8(input)?;
        let (input, year) = le_u16(input)?;
        let (input, hash) = array::<32>(input)?;
        let (input, _) = skip(24)(input)?;
        Ok((
            input,
            Iunp {
                module_count,
                size_comp,
                size_uncomp,
                day,
                month,
                year,
                hash,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashBlock {
    pub algorithm: u32,
    pub size: u32,
    /// Stored in digest order.
    pub hash: [u8; 32],
}

impl HashBlock {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, algorithm) = le_u32(input)?;
        let (input, size) = le_u32(input)?;
        let (input, hash) = array::<32>(input)?;
        Ok((
            input,
            HashBlock {
                algorithm,
                size,
                hash,
            },
        ))
    }

    /// All zero or all erased means the module is not described.
    pub fn is_blank(&self) -> bool {
        let used = &self.hash[..(self.size as usize).min(32)];
        used.iter().all(|&b| b == 0) || used.iter().all(|&b| b == 0xFF)
    }
}

/// Extension 0x13, hashes of the boot-chain modules in `IBBP`.
#[derive(Debug, Clone)]
pub struct BootPolicy {
    pub nem_data: u32,
    pub ibbl: HashBlock,
    pub ibb: HashBlock,
    pub obb: HashBlock,
}

impl Decode for BootPolicy {
    const SIZE: usize = 0xB4;
    const NAME: &'static str = "boot policy extension";

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = skip(EXT_HEADER_SIZE)(input)?;
        let (input, nem_data) = le_u32(input)?;
        let (input, ibbl) = HashBlock::parse(input)?;
        let (input, ibb) = HashBlock::parse(input)?;
        let (input, obb) = HashBlock::parse(input)?;
        let (input, _) = skip(0x30)(input)?;
        Ok((
            input,
            BootPolicy {
                nem_data,
                ibbl,
                ibb,
                obb,
            },
        ))
    }
}

impl BootPolicy {
    /// (module name, hash) for every described boot-chain module.
    pub fn modules(&self) -> impl Iterator<Item = (&'static str, &HashBlock)> {
        [("IBBL", &self.ibbl), ("IBB", &self.ibb), ("OBB", &self.obb)]
            .into_iter()
            .filter(|(_, block)| !block.is_blank())
    }
}

#[derive(Debug, Clone)]
pub enum Extension {
    PartitionInfo(PartitionInfo),
    ModuleAttributes(MetadataAttributes),
    ClientSystemInfo(ClientSystemInfo),
    SignedPackageInfo(SignedPackageInfo),
    Iunp(Iunp),
    BootPolicy(BootPolicy),
    PlatformId(String),
    /// Known tag whose fields are only printed.
    Other(u32),
    Unknown { tag: u32, raw: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct ExtRecord {
    pub offset: usize,
    pub tag: u32,
    pub length: u32,
    pub ext: Extension,
    /// Header table followed by one table per entry.
    pub text: Vec<Record>,
}

impl fmt::Display for ExtRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Extension::Unknown { tag, raw } = &self.ext {
            return writeln!(f, "Extension {tag:02X}, Unknown (0x{:X} bytes)", raw.len());
        }
        for (i, record) in self.text.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{record}")?;
        }
        Ok(())
    }
}

/// Result of walking one entry's extension stream. Problems do not stop
/// the caller; they are reported next to whatever was decoded.
#[derive(Debug, Default)]
pub struct ExtScan {
    pub records: Vec<ExtRecord>,
    pub problems: Vec<DecodeError>,
}

impl ExtScan {
    pub fn iter(&self) -> impl Iterator<Item = &Extension> {
        self.records.iter().map(|r| &r.ext)
    }
}

fn typed(tag: u32, body: &[u8], header: usize) -> Result<Extension, DecodeError> {
    Ok(match tag {
        TAG_PARTITION_INFO => {
            let mut info: PartitionInfo = decode_at(body, 0)?;
            info.modules = metadata_hashes(body, header);
            Extension::PartitionInfo(info)
        }
        TAG_MODULE_ATTRIBUTES => Extension::ModuleAttributes(decode_at(body, 0)?),
        TAG_CLIENT_SYSTEM_INFO => Extension::ClientSystemInfo(decode_at(body, 0)?),
        TAG_SIGNED_PACKAGE_INFO => {
            let mut info: SignedPackageInfo = decode_at(body, 0)?;
            info.modules = metadata_hashes(body, header);
            Extension::SignedPackageInfo(info)
        }
        TAG_IUNP => Extension::Iunp(decode_at(body, 0)?),
        TAG_BOOT_POLICY => Extension::BootPolicy(decode_at(body, 0)?),
        TAG_PLATFORM_ID => Extension::PlatformId(name_str(body.get(8..12).unwrap_or(&[]))),
        other => Extension::Other(other),
    })
}

/// Decode one record whose bytes are `body` (tag and length included).
fn decode_record(tag: u32, body: &[u8], offset: usize) -> Result<ExtRecord, DecodeError> {
    let shape = shape_of(tag).ok_or(DecodeError::UnknownExtension { tag, offset })?;
    let header = &shape.header;
    if body.len() < header.size {
        return Err(DecodeError::Truncated {
            what: header.title,
            offset,
            needed: header.size,
            available: body.len(),
        });
    }

    let mut head = Record {
        title: format!("Extension {tag:02X}, {}", header.title),
        fields: vec![
            ("Tag", Value::Int { value: tag as u64, width: 2 }),
            ("Size", Value::Int { value: body.len() as u64, width: 8 }),
        ],
    };
    let rest = read_fields(header, String::new(), &body[EXT_HEADER_SIZE..header.size]);
    head.fields.extend(rest.fields);
    let mut text = vec![head];

    if let Some(entry) = &shape.entry {
        let chunks = body[header.size..].chunks_exact(entry.size);
        if !chunks.remainder().is_empty() {
            debug!(tag, offset, left = chunks.remainder().len(), "extension has a partial entry");
        }
        text.extend(chunks.map(|chunk| {
            read_fields(entry, format!("Extension {tag:02X} {}", entry.title), chunk)
        }));
    }

    Ok(ExtRecord {
        offset,
        tag,
        length: body.len() as u32,
        ext: typed(tag, body, header.size)?,
        text,
    })
}

/// Walk the extension stream in `buf[start..limit]`.
///
/// The scan advances by each record's declared length and never reads
/// past `limit`. Unknown tags are reported and skipped; a length that
/// cannot advance the stream or overruns the entry ends the scan.
pub fn scan(buf: &[u8], start: usize, limit: usize, entry: &str) -> ExtScan {
    let mut out = ExtScan::default();
    let mut at = start;
    let mut visited = 0;

    while at < limit {
        visited += 1;
        if visited > MAX_EXTENSIONS {
            out.problems.push(DecodeError::ExtensionLoop {
                entry: entry.to_string(),
            });
            break;
        }

        let (Some(tag), Some(length)) = (u32_at(buf, at), u32_at(buf, at + 4)) else {
            out.problems.push(DecodeError::Truncated {
                what: "extension header",
                offset: at,
                needed: EXT_HEADER_SIZE,
                available: buf.len().saturating_sub(at),
            });
            break;
        };
        if (length as usize) < EXT_HEADER_SIZE {
            out.problems.push(DecodeError::ExtensionLength {
                tag,
                offset: at,
                length,
            });
            break;
        }
        let end = at + length as usize;
        if end > limit || end > buf.len() {
            out.problems.push(DecodeError::Truncated {
                what: "extension",
                offset: at,
                needed: length as usize,
                available: limit.min(buf.len()).saturating_sub(at),
            });
            break;
        }

        let body = &buf[at..end];
        match decode_record(tag, body, at) {
            Ok(record) => out.records.push(record),
            Err(e) => {
                debug!(tag, offset = at, entry, "skipping extension: {e}");
                if matches!(e, DecodeError::UnknownExtension { .. }) {
                    out.records.push(ExtRecord {
                        offset: at,
                        tag,
                        length,
                        ext: Extension::Unknown {
                            tag,
                            raw: body.to_vec(),
                        },
                        text: Vec::new(),
                    });
                }
                out.problems.push(e);
            }
        }
        at = end;
    }
    out
}
