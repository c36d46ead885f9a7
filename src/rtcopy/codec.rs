//! Primitive marshalling routines shared by every message of the legacy
//! protocol family.
//!
//! Integers travel most-significant-byte first regardless of host byte
//! order. Strings travel as their bytes followed by a single null
//! terminator, with no padding; the capacity of the receiving field bounds
//! how far a reader may scan for the terminator.

use bytes::{Buf, BufMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Malformed or out-of-range call input. A caller bug, not a wire
    /// condition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The message does not fit the destination buffer.
    #[error("message too large: {actual} bytes exceeds buffer size {max}")]
    MessageTooLarge { actual: usize, max: usize },

    /// Wire data failed structural validation.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A marshalling routine broke its own promise, e.g. wrote a byte count
    /// different from the length embedded in the header. Unconditionally
    /// fatal to the current session.
    #[error("internal marshalling error: {0}")]
    Internal(String),
}

pub fn try_get_u8(buf: &mut impl Buf) -> Result<u8, CodecError> {
    buf.try_get_u8()
        .map_err(|_| CodecError::Malformed("message truncated reading u8".into()))
}

pub fn try_get_u16(buf: &mut impl Buf) -> Result<u16, CodecError> {
    buf.try_get_u16()
        .map_err(|_| CodecError::Malformed("message truncated reading u16".into()))
}

pub fn try_get_u32(buf: &mut impl Buf) -> Result<u32, CodecError> {
    buf.try_get_u32()
        .map_err(|_| CodecError::Malformed("message truncated reading u32".into()))
}

pub fn try_get_u64(buf: &mut impl Buf) -> Result<u64, CodecError> {
    buf.try_get_u64()
        .map_err(|_| CodecError::Malformed("message truncated reading u64".into()))
}

pub fn try_get_i32(buf: &mut impl Buf) -> Result<i32, CodecError> {
    buf.try_get_i32()
        .map_err(|_| CodecError::Malformed("message truncated reading i32".into()))
}

/// Writes `s` followed by its null terminator. Fails if the string plus
/// terminator would not fit a receiving field of `field_capacity` bytes.
pub fn put_string(buf: &mut impl BufMut, s: &str, field_capacity: usize) -> Result<(), CodecError> {
    if s.len() + 1 > field_capacity {
        return Err(CodecError::InvalidArgument(format!(
            "string of length {} exceeds field capacity {}",
            s.len(),
            field_capacity
        )));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Writes `s` right-truncated so that it always fits a receiving field of
/// `field_capacity` bytes, reserving space for one null terminator. Used for
/// the trailing error string of reply messages, which must never make the
/// reply itself fail.
pub fn put_string_truncated(buf: &mut impl BufMut, s: &str, field_capacity: usize) {
    let mut len = s.len().min(field_capacity.saturating_sub(1));
    // never split a UTF-8 sequence
    while len > 0 && !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.put_slice(&s.as_bytes()[..len]);
    buf.put_u8(0);
}

/// Number of bytes [`put_string_truncated`] will write for `s`.
pub fn truncated_string_len(s: &str, field_capacity: usize) -> usize {
    let mut len = s.len().min(field_capacity.saturating_sub(1));
    while len > 0 && !s.is_char_boundary(len) {
        len -= 1;
    }
    len + 1
}

/// Reads a null-terminated string, scanning at most the smaller of the
/// source's remaining bytes and `field_capacity`. Failing to find the
/// terminator within that bound is a malformed message, never an unbounded
/// read.
pub fn try_get_string(buf: &mut impl Buf, field_capacity: usize) -> Result<String, CodecError> {
    let max = field_capacity.min(buf.remaining());
    let mut bytes = Vec::new();
    for _ in 0..max {
        match try_get_u8(buf)? {
            0 => {
                return String::from_utf8(bytes)
                    .map_err(|e| CodecError::Malformed(format!("string is not valid UTF-8: {}", e)));
            }
            b => bytes.push(b),
        }
    }
    Err(CodecError::Malformed(format!(
        "no string terminator within {} bytes",
        max
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::a("a", vec![97, 0])]
    #[case::abc("abc", vec![97, 98, 99, 0])]
    fn test_put_string(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s, 8).unwrap();
        assert_eq!(&buf, &expected);

        let mut deser_buf: &[u8] = &buf;
        let deser = try_get_string(&mut deser_buf, 8).unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(&deser, s);
    }

    #[test]
    fn test_put_string_too_long() {
        let mut buf = BytesMut::new();
        let actual = put_string(&mut buf, "abcdefgh", 8);
        assert_eq!(
            actual,
            Err(CodecError::InvalidArgument(
                "string of length 8 exceeds field capacity 8".into()
            ))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_put_string_exactly_fits() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "abcdefg", 8).unwrap();
        assert_eq!(&buf[..], b"abcdefg\0");
    }

    #[rstest]
    #[case::fits("short", 16, b"short\0".to_vec())]
    #[case::truncated("a longer error message", 8, b"a longe\0".to_vec())]
    #[case::capacity_one("abc", 1, vec![0])]
    fn test_put_string_truncated(#[case] s: &str, #[case] cap: usize, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_string_truncated(&mut buf, s, cap);
        assert_eq!(&buf[..], &expected[..]);
        assert_eq!(truncated_string_len(s, cap), expected.len());
    }

    #[test]
    fn test_put_string_truncated_respects_char_boundary() {
        let mut buf = BytesMut::new();
        // 'ä' is two bytes; truncating at 2 would split it
        put_string_truncated(&mut buf, "aä", 3);
        assert_eq!(&buf[..], b"a\0");
    }

    #[test]
    fn test_try_get_string_stops_at_terminator() {
        let mut buf: &[u8] = b"abc\0def";
        let actual = try_get_string(&mut buf, 64).unwrap();
        assert_eq!(&actual, "abc");
        assert_eq!(buf, b"def");
    }

    #[test]
    fn test_try_get_string_unterminated_within_capacity() {
        let mut buf: &[u8] = b"abcdefghij";
        let actual = try_get_string(&mut buf, 4);
        assert!(matches!(actual, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_try_get_string_unterminated_source_exhausted() {
        let mut buf: &[u8] = b"abc";
        let actual = try_get_string(&mut buf, 64);
        assert!(matches!(actual, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_try_get_string_not_unicode() {
        let mut buf: &[u8] = b"\xc0\xaf\0";
        let actual = try_get_string(&mut buf, 64);
        assert!(matches!(actual, Err(CodecError::Malformed(_))));
    }

    #[rstest]
    #[case::u8(vec![0xab], 0xabu64, 1)]
    #[case::u16(vec![0x12, 0x34], 0x1234u64, 2)]
    #[case::u32(vec![0x12, 0x34, 0x56, 0x78], 0x1234_5678u64, 4)]
    #[case::u64(vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08], 0x0102_0304_0506_0708u64, 8)]
    fn test_integers_are_msb_first(#[case] wire: Vec<u8>, #[case] expected: u64, #[case] width: usize) {
        let mut buf: &[u8] = &wire;
        let actual = match width {
            1 => try_get_u8(&mut buf).unwrap() as u64,
            2 => try_get_u16(&mut buf).unwrap() as u64,
            4 => try_get_u32(&mut buf).unwrap() as u64,
            8 => try_get_u64(&mut buf).unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(actual, expected);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_integer_read() {
        let mut buf: &[u8] = &[0x12, 0x34];
        assert!(matches!(try_get_u32(&mut buf), Err(CodecError::Malformed(_))));
    }
}
