//! Manifest signatures and the additive checksums used across the image.

use crate::manifest::ManifestHeader;
use num_bigint::BigUint;
use num_traits::Zero;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

/// Bytes before the RSA area that are covered by the signature.
const SIGNED_PREFIX: usize = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigStatus {
    Valid,
    Invalid,
    /// The signature could not be checked at all.
    Undetermined,
}

impl fmt::Display for SigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SigStatus::Valid => "VALID",
            SigStatus::Invalid => "INVALID",
            SigStatus::Undetermined => "UNKNOWN",
        })
    }
}

/// Result of checking one manifest (or key) signature. Shared by every
/// module resolved under that manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureVerdict {
    pub status: SigStatus,
    /// Low bits of `signature ^ exponent mod modulus`.
    pub decrypted: Vec<u8>,
    /// Digest of the signed region.
    pub computed: Vec<u8>,
}

impl SignatureVerdict {
    pub fn undetermined() -> Self {
        SignatureVerdict {
            status: SigStatus::Undetermined,
            decrypted: Vec::new(),
            computed: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == SigStatus::Valid
    }
}

/// Verify the RSA signature of the manifest whose header starts at `start`.
///
/// The key material comes from the manifest itself, so this is a
/// consistency check and not an authenticity check. `sha1` selects the
/// digest used by ME 2-5 and SPS 1.
pub fn rsa_verify(buf: &[u8], start: usize, hdr: &ManifestHeader, sha1: bool) -> SignatureVerdict {
    let modulus = BigUint::from_bytes_le(&hdr.public_key);
    let signature = BigUint::from_bytes_le(&hdr.signature);
    if modulus.is_zero() || hdr.exponent == 0 {
        debug!(start, "manifest carries no usable public key");
        return SignatureVerdict::undetermined();
    }

    // A signed range running past the image is hashed as far as it goes.
    let (hdr_len, size) = (hdr.header_bytes(), hdr.size_bytes());
    let prefix = clamped(buf, start, start.saturating_add(SIGNED_PREFIX));
    let body = clamped(buf, start.saturating_add(hdr_len), start.saturating_add(size));
    if start.saturating_add(size.max(SIGNED_PREFIX)) > buf.len() {
        debug!(start, hdr_len, size, "signed range runs past the image");
    }

    let computed: Vec<u8> = if sha1 {
        let mut hasher = Sha1::new();
        hasher.update(prefix);
        hasher.update(body);
        hasher.finalize().to_vec()
    } else {
        let mut hasher = Sha256::new();
        hasher.update(prefix);
        hasher.update(body);
        hasher.finalize().to_vec()
    };

    let decrypted_full = signature
        .modpow(&BigUint::from(hdr.exponent), &modulus)
        .to_bytes_be();
    let decrypted = low_bytes(&decrypted_full, computed.len());

    let status = if decrypted == computed {
        SigStatus::Valid
    } else {
        SigStatus::Invalid
    };
    SignatureVerdict {
        status,
        decrypted,
        computed,
    }
}

/// `buf[from..to]` cut to the buffer, empty when the range is inverted.
fn clamped(buf: &[u8], from: usize, to: usize) -> &[u8] {
    let to = to.min(buf.len());
    buf.get(from.min(to)..to).unwrap_or(&[])
}

/// Lowest `n` bytes of a big-endian integer, left padded with zeroes.
fn low_bytes(be: &[u8], n: usize) -> Vec<u8> {
    if be.len() >= n {
        be[be.len() - n..].to_vec()
    } else {
        let mut out = vec![0u8; n - be.len()];
        out.extend_from_slice(be);
        out
    }
}

/// Two's complement of an 8-bit sum.
pub fn checksum8_from_sum(sum: u32) -> u8 {
    (0x100u32.wrapping_sub(sum) & 0xFF) as u8
}

/// 8-bit checksum of `data` where the byte at `chk_index` holds the
/// checksum itself. Returns (stored, computed).
pub fn checksum8(data: &[u8], chk_index: usize) -> (u8, u8) {
    let stored = data.get(chk_index).copied().unwrap_or(0);
    let sum = data
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
        .wrapping_sub(stored as u32);
    (stored, checksum8_from_sum(sum))
}

/// Ones' complement of a 16-bit byte sum.
pub fn checksum16(data: &[u8]) -> u16 {
    let sum = data
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
    !(sum as u16)
}

/// Microcode updates sum to zero over their 32-bit words; the return value
/// is zero for a valid update.
pub fn microcode_checksum(data: &[u8]) -> u32 {
    let sum = data.chunks(4).fold(0u32, |acc, word| {
        let mut le = [0u8; 4];
        le[..word.len()].copy_from_slice(word);
        acc.wrapping_add(u32::from_le_bytes(le))
    });
    sum.wrapping_neg()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::decode_at;
    use num_bigint::BigInt;
    use num_traits::{One, Signed};

    /// 2^521 - 1, a Mersenne prime. With a prime modulus p, `(m^d)^e = m`
    /// whenever `e * d = 1 mod (p - 1)`.
    fn m521() -> BigUint {
        (BigUint::one() << 521u32) - BigUint::one()
    }

    fn mod_inverse(a: &BigUint, m: &BigUint) -> BigUint {
        let (mut old_r, mut r) = (BigInt::from(a.clone()), BigInt::from(m.clone()));
        let (mut old_s, mut s) = (BigInt::one(), BigInt::zero());
        while !r.is_zero() {
            let q = &old_r / &r;
            let next_r = &old_r - &q * &r;
            old_r = std::mem::replace(&mut r, next_r);
            let next_s = &old_s - &q * &s;
            old_s = std::mem::replace(&mut s, next_s);
        }
        let m = BigInt::from(m.clone());
        let mut inv = old_s % &m;
        if inv.is_negative() {
            inv += &m;
        }
        inv.to_biguint().unwrap()
    }

    /// Manifest at offset 0 signed with SHA-256 over a small body.
    fn signed_manifest() -> Vec<u8> {
        let mut buf = vec![0u8; 0x400];
        buf[0x04..0x08].copy_from_slice(&(0x284u32 / 4).to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&0x8086u32.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&(0x300u32 / 4).to_le_bytes());
        buf[0x1C..0x20].copy_from_slice(b"$MN2");
        for (i, b) in buf[0x284..0x300].iter_mut().enumerate() {
            *b = i as u8;
        }

        let p = m521();
        let e = 7u32;
        buf[0x80..0x80 + 66].copy_from_slice(&p.to_bytes_le());
        buf[0x180..0x184].copy_from_slice(&e.to_le_bytes());

        let mut hasher = Sha256::new();
        hasher.update(&buf[..0x80]);
        hasher.update(&buf[0x284..0x300]);
        let digest = BigUint::from_bytes_be(&hasher.finalize());
        let d = mod_inverse(&BigUint::from(e), &(&p - BigUint::one()));
        let sig = digest.modpow(&d, &p).to_bytes_le();
        buf[0x184..0x184 + sig.len()].copy_from_slice(&sig);
        buf
    }

    #[test]
    fn known_good_signature_is_valid() {
        let buf = signed_manifest();
        let hdr: ManifestHeader = decode_at(&buf, 0).unwrap();
        let verdict = rsa_verify(&buf, 0, &hdr, false);
        assert_eq!(verdict.status, SigStatus::Valid);
        assert_eq!(verdict.decrypted, verdict.computed);
    }

    #[test]
    fn flipping_signed_bytes_invalidates() {
        for at in [0x00, 0x7F, 0x284, 0x2FF] {
            let mut buf = signed_manifest();
            buf[at] ^= 0x01;
            let hdr: ManifestHeader = decode_at(&buf, 0).unwrap();
            assert_eq!(rsa_verify(&buf, 0, &hdr, false).status, SigStatus::Invalid, "byte {at:#x}");
        }
    }

    #[test]
    fn unusable_key_is_undetermined() {
        let mut buf = signed_manifest();
        buf[0x80..0x180].fill(0);
        let hdr: ManifestHeader = decode_at(&buf, 0).unwrap();
        assert_eq!(rsa_verify(&buf, 0, &hdr, false).status, SigStatus::Undetermined);
    }

    #[test]
    fn signed_range_past_the_image_is_invalid() {
        let mut buf = signed_manifest();
        buf[0x18..0x1C].copy_from_slice(&0x4000u32.to_le_bytes());
        let hdr: ManifestHeader = decode_at(&buf, 0).unwrap();
        let verdict = rsa_verify(&buf, 0, &hdr, false);
        assert_eq!(verdict.status, SigStatus::Invalid);

        let mut hasher = Sha256::new();
        hasher.update(&buf[..0x80]);
        hasher.update(&buf[0x284..]);
        assert_eq!(verdict.computed, hasher.finalize().to_vec());
    }

    #[test]
    fn checksums() {
        let mut data = vec![1u8, 2, 3, 0, 5];
        let (_, chk) = checksum8(&data, 3);
        data[3] = chk;
        let total: u32 = data.iter().map(|&b| b as u32).sum();
        assert_eq!(total & 0xFF, 0);
        assert_eq!(checksum8(&data, 3), (chk, chk));

        assert_eq!(checksum16(&[0x01, 0x02]), !0x0003u16);

        let mut mc = vec![0u8; 0x30];
        mc[0..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        mc[4..8].copy_from_slice(&0x1234_5678u32.wrapping_neg().to_le_bytes());
        assert_eq!(microcode_checksum(&mc), 0);
        mc[9] = 1;
        assert_ne!(microcode_checksum(&mc), 0);
    }
}
