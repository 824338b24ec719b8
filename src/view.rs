use crate::error::{DecodeError, DecodeResult};
use nom::{IResult, bytes::complete::take, number::complete::le_u32};

/// A packed little-endian structure with a fixed on-disk size.
///
/// Implementors describe their layout once with nom combinators in
/// `parse_inner`; callers go through [`decode_at`], which turns a short read
/// into [`DecodeError::Truncated`] instead of a parse failure.
pub trait Decode: Sized {
    /// Size of the structure in the image.
    const SIZE: usize;
    /// Human readable name used in errors.
    const NAME: &'static str;

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Self>;
}

/// Decode `T` from `buf` starting at `offset`.
pub fn decode_at<T: Decode>(buf: &[u8], offset: usize) -> DecodeResult<T> {
    let available = buf.len().saturating_sub(offset);
    let truncated = || DecodeError::Truncated {
        what: T::NAME,
        offset,
        needed: T::SIZE,
        available,
    };
    if available < T::SIZE {
        return Err(truncated());
    }
    match T::parse_inner(&buf[offset..offset + T::SIZE]) {
        Ok((_, value)) => Ok(value),
        Err(_) => Err(truncated()),
    }
}

/// Fixed-size byte array field.
pub fn array<const N: usize>(input: &[u8]) -> IResult<&[u8], [u8; N]> {
    let (input, bytes) = take(N)(input)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok((input, out))
}

/// Reserved field that is skipped.
pub fn skip(n: usize) -> impl Fn(&[u8]) -> IResult<&[u8], ()> {
    move |input| {
        let (input, _) = take(n)(input)?;
        Ok((input, ()))
    }
}

/// Read a little-endian u32 without building a structure.
pub fn u32_at(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    le_u32::<_, nom::error::Error<&[u8]>>(bytes).ok().map(|(_, v)| v)
}

/// Read a little-endian u16 without building a structure.
pub fn u16_at(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Bounded sub-slice.
pub fn slice_at(buf: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    buf.get(offset..offset.checked_add(len)?)
}

/// True when `buf[offset..]` starts with `tag`.
pub fn tag_at(buf: &[u8], offset: usize, tag: &[u8]) -> bool {
    slice_at(buf, offset, tag.len()) == Some(tag)
}

/// NUL-trimmed ASCII name.
pub fn name_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Flash erase pattern.
pub fn is_padding(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0xFF)
}

/// Hash stored as a little-endian integer; returns digest byte order.
pub fn reversed<const N: usize>(bytes: [u8; N]) -> [u8; N] {
    let mut out = bytes;
    out.reverse();
    out
}

pub fn align_up(value: usize, align: usize) -> usize {
    match value % align {
        0 => value,
        rem => value + (align - rem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nom::number::complete::le_u16;

    struct Pair {
        a: u16,
        b: u32,
    }

    impl Decode for Pair {
        const SIZE: usize = 6;
        const NAME: &'static str = "pair";

        fn parse_inner(input: &[u8]) -> IResult<&[u8], Self> {
            let (input, a) = le_u16(input)?;
            let (input, b) = le_u32(input)?;
            Ok((input, Pair { a, b }))
        }
    }

    #[test]
    fn decodes_in_bounds() {
        let buf = [0xAA, 0x01, 0x02, 0x04, 0x00, 0x00, 0x80, 0xFF];
        let pair: Pair = decode_at(&buf, 1).unwrap();
        assert_eq!(pair.a, 0x0201);
        assert_eq!(pair.b, 0x8000_0004);
    }

    #[test]
    fn short_read_is_truncated() {
        let buf = [0u8; 7];
        match decode_at::<Pair>(&buf, 3) {
            Err(DecodeError::Truncated { needed, available, .. }) => {
                assert_eq!(needed, 6);
                assert_eq!(available, 4);
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("expected a truncated read"),
        }
        assert!(decode_at::<Pair>(&buf, usize::MAX).is_err());
    }

    #[test]
    fn helpers() {
        assert_eq!(name_str(b"FTPR\0\0\0\0"), "FTPR");
        assert_eq!(name_str(b"rbe.met\0\0\0\0\0"), "rbe.met");
        assert!(is_padding(&[0xFF; 9]));
        assert!(!is_padding(&[0xFF, 0xFE]));
        assert_eq!(align_up(0x3500, 0x1000), 0x4000);
        assert_eq!(align_up(0x4000, 0x1000), 0x4000);
        assert_eq!(u32_at(&[1, 0, 0, 0], 0), Some(1));
        assert_eq!(u32_at(&[1, 0, 0], 0), None);
        assert!(tag_at(b"xx$CPD", 2, b"$CPD"));
    }
}
