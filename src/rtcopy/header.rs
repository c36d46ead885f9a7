//! The 12-byte header carried by every message of the protocol family.

use bytes::{Buf, BufMut};

use crate::rtcopy::codec::{try_get_u32, CodecError};
use crate::rtcopy::{RTCOPY_MAGIC, RTCOPY_MAGIC_OLD0};

/// `len_or_status` holds the body length on requests and, on some replies,
/// a status code instead. The interpretation is up to the message type.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MessageHeader {
    pub magic: u32,
    pub reqtype: u32,
    pub len_or_status: u32,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = 3 * size_of::<u32>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.magic);
        buf.put_u32(self.reqtype);
        buf.put_u32(self.len_or_status);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<MessageHeader, CodecError> {
        Ok(MessageHeader {
            magic: try_get_u32(buf)?,
            reqtype: try_get_u32(buf)?,
            len_or_status: try_get_u32(buf)?,
        })
    }

    /// Both the current and the legacy magic must be accepted on read; the
    /// current one is always written.
    pub fn check_magic(&self) -> Result<(), CodecError> {
        match self.magic {
            RTCOPY_MAGIC | RTCOPY_MAGIC_OLD0 => Ok(()),
            m => Err(CodecError::Malformed(format!(
                "unrecognized magic number 0x{:08x}",
                m
            ))),
        }
    }

    pub fn check_reqtype(&self, expected: u32) -> Result<(), CodecError> {
        if self.reqtype != expected {
            return Err(CodecError::Malformed(format!(
                "unexpected request type 0x{:08x}, expected 0x{:08x}",
                self.reqtype, expected
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case(MessageHeader { magic: RTCOPY_MAGIC, reqtype: 1, len_or_status: 0 })]
    #[case(MessageHeader { magic: RTCOPY_MAGIC_OLD0, reqtype: 14, len_or_status: 4096 })]
    #[case(MessageHeader { magic: 0xffff_ffff, reqtype: 0, len_or_status: 0xffff_ffff })]
    fn test_ser_deser(#[case] header: MessageHeader) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), MessageHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = MessageHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(header, deser);
    }

    #[test]
    fn test_wire_layout_is_big_endian() {
        let header = MessageHeader {
            magic: RTCOPY_MAGIC,
            reqtype: 0x0000_0001,
            len_or_status: 0x0102_0304,
        };
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(
            &buf[..],
            &[0x12, 0x0D, 0x03, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[rstest]
    #[case::current(RTCOPY_MAGIC, true)]
    #[case::legacy(RTCOPY_MAGIC_OLD0, true)]
    #[case::unknown(0xdead_beef, false)]
    fn test_check_magic(#[case] magic: u32, #[case] ok: bool) {
        let header = MessageHeader {
            magic,
            reqtype: 1,
            len_or_status: 0,
        };
        assert_eq!(header.check_magic().is_ok(), ok);
    }

    #[test]
    fn test_deser_truncated() {
        let mut b: &[u8] = &[0x12, 0x0D];
        assert!(MessageHeader::deser(&mut b).is_err());
    }
}
