//! Chunked Huffman decoder for `$CPD` modules flagged with the Huffman bit.
//!
//! The code tables are not part of the image. They come from a dictionary
//! file with one code per line:
//!
//! ```text
//! # table  code        symbol
//! 0        0101        e8
//! 0        0011001     0f1f44
//! ```
//!
//! The compressed module starts with one little-endian word per 4 KiB of
//! output. Bits 0..25 hold the chunk's offset from the module start and
//! bits 29..31 select the table it was coded with.

use crate::error::{DecodeError, DecodeResult};
use crate::view::u32_at;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const CHUNK_SIZE: usize = 0x1000;
pub const TABLE_COUNT: usize = 4;

const MAX_CODE_BITS: usize = 32;
const OFFSET_MASK: u32 = 0x01FF_FFFF;
const TABLE_SHIFT: u32 = 29;

#[derive(Debug, Clone, Default)]
struct Table {
    /// Keyed by (code length, code value).
    codes: HashMap<(u8, u32), Vec<u8>>,
    longest: u8,
}

#[derive(Debug, Clone, Default)]
pub struct HuffmanDict {
    tables: [Table; TABLE_COUNT],
}

impl HuffmanDict {
    pub fn load(path: &Path) -> DecodeResult<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> DecodeResult<Self> {
        let mut dict = HuffmanDict::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let content = raw.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let bad = |reason: &str| DecodeError::Dictionary {
                line,
                reason: reason.to_string(),
            };

            let fields: Vec<&str> = content.split_whitespace().collect();
            let [table, code, symbol] = fields[..] else {
                return Err(bad("expected <table> <code> <symbol>"));
            };
            let table: usize = table
                .parse()
                .ok()
                .filter(|&t| t < TABLE_COUNT)
                .ok_or_else(|| bad("table index must be 0 to 3"))?;
            if code.is_empty() || code.len() > MAX_CODE_BITS || !code.bytes().all(|b| b == b'0' || b == b'1') {
                return Err(bad("code must be 1 to 32 binary digits"));
            }
            let value = u32::from_str_radix(code, 2).map_err(|_| bad("code is not binary"))?;
            let symbol = hex::decode(symbol).map_err(|_| bad("symbol is not hex"))?;
            if symbol.is_empty() {
                return Err(bad("symbol is empty"));
            }

            let t = &mut dict.tables[table];
            let len = code.len() as u8;
            if t.codes.insert((len, value), symbol).is_some() {
                return Err(bad("duplicate code"));
            }
            t.longest = t.longest.max(len);
        }
        Ok(dict)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|t| t.codes.is_empty())
    }
}

/// MSB-first bit reader.
struct Bits<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Iterator for Bits<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(bit as u32)
    }
}

/// Decode a Huffman module of `size_uncomp` output bytes.
pub fn decompress(data: &[u8], size_uncomp: usize, dict: &HuffmanDict, module: &str) -> DecodeResult<Vec<u8>> {
    let fail = |reason: String| DecodeError::Decompress {
        module: module.to_string(),
        reason,
    };

    let chunks = size_uncomp.div_ceil(CHUNK_SIZE);
    let mut out = Vec::with_capacity(size_uncomp);
    for chunk in 0..chunks {
        let word = u32_at(data, chunk * 4).ok_or_else(|| fail(format!("chunk table ends at chunk {chunk}")))?;
        let offset = (word & OFFSET_MASK) as usize;
        let table = &dict.tables[((word >> TABLE_SHIFT) & 3) as usize];
        if table.codes.is_empty() {
            return Err(fail(format!("chunk {chunk} uses an empty table")));
        }
        let stream = data
            .get(offset..)
            .ok_or_else(|| fail(format!("chunk {chunk} starts past the module at 0x{offset:X}")))?;

        let want = CHUNK_SIZE.min(size_uncomp - out.len());
        let target = out.len() + want;
        let mut bits = Bits { data: stream, pos: 0 };
        let (mut code, mut len) = (0u32, 0u8);
        while out.len() < target {
            let bit = bits
                .next()
                .ok_or_else(|| fail(format!("chunk {chunk} ends after 0x{:X} bytes", want - (target - out.len()))))?;
            code = (code << 1) | bit;
            len += 1;
            if let Some(symbol) = table.codes.get(&(len, code)) {
                let take = symbol.len().min(target - out.len());
                out.extend_from_slice(&symbol[..take]);
                (code, len) = (0, 0);
            } else if len >= table.longest {
                return Err(fail(format!(
                    "chunk {chunk} has no code for {code:0width$b}",
                    width = len as usize
                )));
            }
        }
    }
    Ok(out)
}
