//! Byte-pattern discovery of engine structures.
//!
//! The image has no index of its own, so every structure is found by
//! scanning for its signature. All scanning goes through [`Scanner`]; the
//! rest of the crate only ever sees absolute offsets.

use crate::error::DecodeResult;
use crate::view::{self, tag_at};
use regex::bytes::Regex;
use tracing::debug;

/// Intel vendor id stored in every genuine manifest.
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// Offset of the manifest tag inside the manifest header.
pub const MANIFEST_TAG_OFFSET: usize = 0x1C;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// `\0$MN2` or `\0$MAN`. The leading NUL rejects a known false positive.
    Manifest,
    /// `\0$MN2` only.
    Mn2,
    Fpt,
    Bpdt,
    Cpd,
}

/// Location of a `$MN2`/`$MAN` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestAnchor {
    /// Offset of the `$` of the tag.
    pub tag: usize,
}

impl ManifestAnchor {
    /// Build from the offset of the NUL byte preceding the tag.
    pub fn from_match(start: usize) -> Self {
        ManifestAnchor { tag: start + 1 }
    }

    /// Start of the manifest header, if the tag is not too close to the
    /// beginning of the image.
    pub fn header(&self) -> Option<usize> {
        self.tag.checked_sub(MANIFEST_TAG_OFFSET)
    }

    /// First byte after the tag.
    pub fn end(&self) -> usize {
        self.tag + 4
    }

    pub fn is_legacy(&self, buf: &[u8]) -> bool {
        tag_at(buf, self.tag, b"$MAN")
    }

    /// Vendor id check; a mismatch means the anchor is a false positive.
    pub fn has_intel_vendor(&self, buf: &[u8]) -> bool {
        self.tag
            .checked_sub(0xC)
            .and_then(|at| view::u16_at(buf, at))
            == Some(INTEL_VENDOR_ID)
    }
}

pub struct Scanner {
    manifest: Regex,
    mn2: Regex,
    fpt: Regex,
    bpdt: Regex,
    cpd: Regex,
    recovery: Vec<Regex>,
    sps: Vec<Regex>,
}

impl Scanner {
    pub fn new() -> DecodeResult<Self> {
        let recovery = [
            r"(?s-u)\x00\$MN2.{628}FTPR",
            r"(?s-u)\x00\$MN2.{628}OPR\x00",
            r"(?s-u)\x00\$MN2.{612}IGRT",
            r"(?s-u)\x00\$MN2.{612}FTPR",
            r"(?s-u)\x00\$MN2.{612}OP..",
            r"(?s-u)\x00\$MAN.{652}BRIN",
            r"(?s-u)\x00\$MAN.{732}Eps",
        ]
        .iter()
        .map(|p| Regex::new(p))
        .collect::<Result<Vec<_>, _>>()?;
        let sps = [
            r"(?s-u)\$CPD.\x00\x00\x00\x01\x01\x10.OPR\x00",
            r"(?-u)bup_rcv\.met",
            r"(?-u)\$SKU\x03\x00\x00\x00\x2F\xE4\x01\x00",
            r"(?-u)\$SKU\x03\x00\x00\x00\x08\x00\x00\x00",
        ]
        .iter()
        .map(|p| Regex::new(p))
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Scanner {
            manifest: Regex::new(r"(?s-u)\x00\$M(?:N2|AN)")?,
            mn2: Regex::new(r"(?s-u)\x00\$MN2")?,
            fpt: Regex::new(r"(?s-u)\$FPT.\x00\x00\x00")?,
            bpdt: Regex::new(r"(?s-u)\xAA\x55[\x00\xAA]\x00.\x00\x01\x00")?,
            cpd: Regex::new(r"(?s-u)\$CPD.\x00\x00\x00\x01\x01\x10")?,
            recovery,
            sps,
        })
    }

    fn regex(&self, anchor: Anchor) -> &Regex {
        match anchor {
            Anchor::Manifest => &self.manifest,
            Anchor::Mn2 => &self.mn2,
            Anchor::Fpt => &self.fpt,
            Anchor::Bpdt => &self.bpdt,
            Anchor::Cpd => &self.cpd,
        }
    }

    /// Start offsets of every non-overlapping match, in image order.
    pub fn find_all(&self, anchor: Anchor, buf: &[u8]) -> Vec<usize> {
        self.regex(anchor).find_iter(buf).map(|m| m.start()).collect()
    }

    /// First match inside `buf[start..start + len]`, as an absolute offset.
    pub fn find_in(&self, anchor: Anchor, buf: &[u8], start: usize, len: usize) -> Option<usize> {
        let end = start.saturating_add(len).min(buf.len());
        let window = buf.get(start..end)?;
        self.regex(anchor).find(window).map(|m| start + m.start())
    }

    pub fn manifest_anchors(&self, buf: &[u8]) -> Vec<ManifestAnchor> {
        self.find_all(Anchor::Manifest, buf)
            .into_iter()
            .map(ManifestAnchor::from_match)
            .collect()
    }

    /// First manifest in a window, used when a partition table names the
    /// recovery partition.
    pub fn manifest_in(&self, buf: &[u8], start: usize, len: usize) -> Option<ManifestAnchor> {
        self.find_in(Anchor::Manifest, buf, start, len)
            .map(ManifestAnchor::from_match)
    }

    /// Locate a recovery manifest by its partition name at a fixed distance
    /// from the tag.
    pub fn recovery_probe(&self, buf: &[u8]) -> Option<ManifestAnchor> {
        self.recovery.iter().find_map(|re| {
            let found = re.find(buf).map(|m| ManifestAnchor::from_match(m.start()));
            if let Some(anchor) = found {
                debug!(tag = anchor.tag, "recovery manifest found by probe");
            }
            found
        })
    }

    /// Server Platform Services specific signatures.
    pub fn has_sps_signature(&self, buf: &[u8]) -> bool {
        self.sps.iter().any(|re| re.is_match(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_every_anchor_kind() {
        let mut buf = vec![0xFFu8; 0x400];
        buf[0x10..0x18].copy_from_slice(b"$FPT\x05\0\0\0");
        buf[0x100..0x108].copy_from_slice(&[0xAA, 0x55, 0x00, 0x00, 0x07, 0x00, 0x01, 0x00]);
        buf[0x200..0x20C].copy_from_slice(b"$CPD\x03\0\0\0\x01\x01\x10\0");
        buf[0x300] = 0;
        buf[0x301..0x305].copy_from_slice(b"$MN2");
        buf[0x380] = 0;
        buf[0x381..0x385].copy_from_slice(b"$MAN");

        let scanner = Scanner::new().unwrap();
        assert_eq!(scanner.find_all(Anchor::Fpt, &buf), vec![0x10]);
        assert_eq!(scanner.find_all(Anchor::Bpdt, &buf), vec![0x100]);
        assert_eq!(scanner.find_all(Anchor::Cpd, &buf), vec![0x200]);
        assert_eq!(scanner.find_all(Anchor::Mn2, &buf), vec![0x300]);

        let anchors = scanner.manifest_anchors(&buf);
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].tag, 0x301);
        assert_eq!(anchors[0].header(), Some(0x301 - 0x1C));
        assert!(anchors[1].is_legacy(&buf));
        assert_eq!(scanner.find_in(Anchor::Manifest, &buf, 0x310, 0x100), Some(0x380));
    }

    #[test]
    fn tag_without_leading_nul_is_ignored() {
        let mut buf = vec![0x11u8; 0x100];
        buf[0x40..0x44].copy_from_slice(b"$MN2");
        let scanner = Scanner::new().unwrap();
        assert!(scanner.manifest_anchors(&buf).is_empty());
    }

    #[test]
    fn vendor_id_is_checked_before_tag() {
        let mut buf = vec![0u8; 0x100];
        let header = 0x20;
        buf[header + 0x10..header + 0x12].copy_from_slice(&0x8086u16.to_le_bytes());
        buf[header + 0x1C..header + 0x20].copy_from_slice(b"$MN2");
        let anchor = ManifestAnchor { tag: header + 0x1C };
        assert!(anchor.has_intel_vendor(&buf));
        buf[header + 0x10] = 0x87;
        assert!(!anchor.has_intel_vendor(&buf));
    }
}
