use thiserror::Error;

/// Errors produced while decoding an engine image.
///
/// Everything here is fatal only for the structure being decoded. The
/// per-image driver decides whether it ends the image or becomes a
/// diagnostic.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{what} at 0x{offset:X} is truncated: needs 0x{needed:X} bytes, 0x{available:X} available")]
    Truncated {
        what: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("{what} at 0x{offset:X} has an unexpected tag")]
    BadTag { what: &'static str, offset: usize },

    #[error("file does not contain Intel Engine firmware")]
    NoFirmwareSignature,

    #[error("extension scan of {entry} stopped after 100 records")]
    ExtensionLoop { entry: String },

    #[error("unimplemented $CPD extension 0x{tag:02X} at 0x{offset:X}")]
    UnknownExtension { tag: u32, offset: usize },

    #[error("$CPD extension 0x{tag:02X} at 0x{offset:X} declares length 0x{length:X}")]
    ExtensionLength { tag: u32, offset: usize, length: u32 },

    #[error("Huffman dictionary line {line}: {reason}")]
    Dictionary { line: usize, reason: String },

    #[error("failed to decompress {module}: {reason}")]
    Decompress { module: String, reason: String },

    #[error("invalid scan pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type DecodeResult<T> = Result<T, DecodeError>;
