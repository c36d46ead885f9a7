//! Wire client of the media-changer daemon.
//!
//! The daemon speaks the same framed request/reply shape as the rest of the
//! protocol family: a 12-byte header followed by a fixed-field body, over a
//! short-lived TCP connection per operation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::robot::element_status::{ElementStatus, ElementType};
use crate::robot::{MediaChanger, RobotError};
use crate::rtcopy::codec::{
    put_string, put_string_truncated, truncated_string_len, try_get_i32, try_get_string,
    try_get_u16, try_get_u32, try_get_u8, CodecError,
};
use crate::rtcopy::header::MessageHeader;
use crate::rtcopy::{CA_MAXVIDLEN, RMC_MAGIC, RTCP_MSGBUFSIZ};

pub const RMC_READELEM: u32 = 3;
pub const RMC_MOUNT: u32 = 4;
pub const RMC_UNMOUNT: u32 = 5;

/// Capacity of the error string in a daemon reply, terminator included.
pub const RMC_ERRMSG_CAPACITY: usize = 256;

/// A mount/dismount/element-status request towards the daemon.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RmcRequest {
    pub reqtype: u32,
    pub uid: u32,
    pub gid: u32,
    pub vid: String,
    pub drive_ordinal: u16,
    /// Force flag of a dismount; zero elsewhere.
    pub flags: u32,
}

impl RmcRequest {
    fn body_len(&self) -> usize {
        2 * size_of::<u32>() + self.vid.len() + 1 + size_of::<u16>() + size_of::<u32>()
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        if self.vid.len() > CA_MAXVIDLEN {
            return Err(CodecError::InvalidArgument(format!(
                "vid of length {} exceeds maximum {}",
                self.vid.len(),
                CA_MAXVIDLEN
            )));
        }
        let body_len = self.body_len();
        let total = MessageHeader::SERIALIZED_LEN + body_len;
        if total > RTCP_MSGBUFSIZ {
            return Err(CodecError::MessageTooLarge {
                actual: total,
                max: RTCP_MSGBUFSIZ,
            });
        }

        let start = buf.len();
        MessageHeader {
            magic: RMC_MAGIC,
            reqtype: self.reqtype,
            len_or_status: body_len as u32,
        }
        .ser(buf);
        buf.put_u32(self.uid);
        buf.put_u32(self.gid);
        put_string(buf, &self.vid, CA_MAXVIDLEN + 1)?;
        buf.put_u16(self.drive_ordinal);
        buf.put_u32(self.flags);

        let written = buf.len() - start;
        if written != total {
            return Err(CodecError::Internal(format!(
                "marshalled {} bytes but promised {} in the header",
                written, total
            )));
        }
        Ok(written)
    }

    pub fn deser_body(buf: &mut impl Buf, reqtype: u32) -> Result<RmcRequest, CodecError> {
        Ok(RmcRequest {
            reqtype,
            uid: try_get_u32(buf)?,
            gid: try_get_u32(buf)?,
            vid: try_get_string(buf, CA_MAXVIDLEN + 1)?,
            drive_ordinal: try_get_u16(buf)?,
            flags: try_get_u32(buf)?,
        })
    }
}

/// The daemon's reply: a status code, an error string, and, for
/// element-status requests, the elements after it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RmcReply {
    pub status: i32,
    pub error_message: String,
    pub elements: Vec<ElementStatus>,
}

impl RmcReply {
    pub fn ok() -> RmcReply {
        RmcReply {
            status: 0,
            error_message: String::new(),
            elements: Vec::new(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut, reqtype: u32) -> Result<usize, CodecError> {
        let mut body_len = size_of::<i32>()
            + truncated_string_len(&self.error_message, RMC_ERRMSG_CAPACITY)
            + size_of::<u16>();
        for element in &self.elements {
            body_len += size_of::<u8>()
                + size_of::<u16>()
                + size_of::<u8>()
                + element.vid.as_deref().unwrap_or("").len()
                + 1;
        }
        let total = MessageHeader::SERIALIZED_LEN + body_len;
        if total > RTCP_MSGBUFSIZ {
            return Err(CodecError::MessageTooLarge {
                actual: total,
                max: RTCP_MSGBUFSIZ,
            });
        }

        let start = buf.len();
        MessageHeader {
            magic: RMC_MAGIC,
            reqtype,
            len_or_status: body_len as u32,
        }
        .ser(buf);
        buf.put_i32(self.status);
        put_string_truncated(buf, &self.error_message, RMC_ERRMSG_CAPACITY);
        buf.put_u16(self.elements.len() as u16);
        for element in &self.elements {
            buf.put_u8(element.element_type.to_wire());
            buf.put_u16(element.address);
            buf.put_u8(element.full as u8);
            put_string(buf, element.vid.as_deref().unwrap_or(""), CA_MAXVIDLEN + 1)?;
        }

        let written = buf.len() - start;
        if written != total {
            return Err(CodecError::Internal(format!(
                "marshalled {} bytes but promised {} in the header",
                written, total
            )));
        }
        Ok(written)
    }

    pub fn deser_body(buf: &mut impl Buf) -> Result<RmcReply, CodecError> {
        let status = try_get_i32(buf)?;
        let error_message = try_get_string(buf, RMC_ERRMSG_CAPACITY)?;
        let count = try_get_u16(buf)?;
        let mut elements = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let element_type = ElementType::from_wire(try_get_u8(buf)?).ok_or_else(|| {
                CodecError::Malformed("unrecognized element type on the wire".into())
            })?;
            let address = try_get_u16(buf)?;
            let full = try_get_u8(buf)? != 0;
            let vid = try_get_string(buf, CA_MAXVIDLEN + 1)?;
            elements.push(ElementStatus {
                element_type,
                address,
                full,
                vid: if vid.is_empty() { None } else { Some(vid) },
            });
        }
        Ok(RmcReply {
            status,
            error_message,
            elements,
        })
    }
}

/// TCP client of one media-changer daemon.
pub struct RmcClient {
    host: String,
    port: u16,
    uid: u32,
    gid: u32,
    net_timeout: Duration,
}

impl RmcClient {
    pub fn new(host: &str, port: u16, uid: u32, gid: u32, net_timeout: Duration) -> RmcClient {
        RmcClient {
            host: host.to_string(),
            port,
            uid,
            gid,
            net_timeout,
        }
    }

    async fn round_trip(&self, request: &RmcRequest) -> Result<RmcReply, RobotError> {
        let mut buf = BytesMut::with_capacity(RTCP_MSGBUFSIZ);
        request
            .ser(&mut buf)
            .map_err(|e| RobotError::Communication(e.to_string()))?;

        debug!(host = %self.host, port = self.port, reqtype = request.reqtype, vid = %request.vid, "media changer request");
        let mut stream = timeout(self.net_timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| RobotError::Communication("connect timed out".into()))?
            .map_err(|e| RobotError::Communication(format!("failed to connect: {}", e)))?;

        timeout(self.net_timeout, stream.write_all(&buf))
            .await
            .map_err(|_| RobotError::Communication("write timed out".into()))?
            .map_err(|e| RobotError::Communication(format!("failed to write request: {}", e)))?;

        let mut header_buf = [0u8; MessageHeader::SERIALIZED_LEN];
        timeout(self.net_timeout, stream.read_exact(&mut header_buf))
            .await
            .map_err(|_| RobotError::Communication("read timed out".into()))?
            .map_err(|e| RobotError::Communication(format!("failed to read reply: {}", e)))?;

        let mut b: &[u8] = &header_buf;
        let header =
            MessageHeader::deser(&mut b).map_err(|e| RobotError::Communication(e.to_string()))?;
        if header.magic != RMC_MAGIC {
            return Err(RobotError::Communication(format!(
                "unrecognized magic number 0x{:08x} in the daemon reply",
                header.magic
            )));
        }
        let body_len = header.len_or_status as usize;
        if body_len > RTCP_MSGBUFSIZ - MessageHeader::SERIALIZED_LEN {
            return Err(RobotError::Communication(format!(
                "daemon reply body of {} bytes exceeds the message buffer",
                body_len
            )));
        }
        let mut body = vec![0u8; body_len];
        timeout(self.net_timeout, stream.read_exact(&mut body))
            .await
            .map_err(|_| RobotError::Communication("read timed out".into()))?
            .map_err(|e| RobotError::Communication(format!("failed to read reply: {}", e)))?;

        let mut b: &[u8] = &body;
        let reply =
            RmcReply::deser_body(&mut b).map_err(|e| RobotError::Communication(e.to_string()))?;
        if reply.status != 0 {
            return Err(RobotError::MediaChanger {
                code: reply.status as u32,
                message: reply.error_message,
            });
        }
        Ok(reply)
    }
}

#[async_trait]
impl MediaChanger for RmcClient {
    async fn move_to_drive(&self, vid: &str, drive_ordinal: u16) -> Result<(), RobotError> {
        self.round_trip(&RmcRequest {
            reqtype: RMC_MOUNT,
            uid: self.uid,
            gid: self.gid,
            vid: vid.to_string(),
            drive_ordinal,
            flags: 0,
        })
        .await
        .map(|_| ())
    }

    async fn move_from_drive(
        &self,
        vid: &str,
        drive_ordinal: u16,
        force: bool,
    ) -> Result<(), RobotError> {
        self.round_trip(&RmcRequest {
            reqtype: RMC_UNMOUNT,
            uid: self.uid,
            gid: self.gid,
            vid: vid.to_string(),
            drive_ordinal,
            flags: force as u32,
        })
        .await
        .map(|_| ())
    }

    async fn read_element_status(&self, vid: &str) -> Result<Vec<ElementStatus>, RobotError> {
        self.round_trip(&RmcRequest {
            reqtype: RMC_READELEM,
            uid: self.uid,
            gid: self.gid,
            vid: vid.to_string(),
            drive_ordinal: 0,
            flags: 0,
        })
        .await
        .map(|reply| reply.elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::net::TcpListener;

    const NET_TIMEOUT: Duration = Duration::from_secs(5);

    fn mount_request() -> RmcRequest {
        RmcRequest {
            reqtype: RMC_MOUNT,
            uid: 1001,
            gid: 1002,
            vid: "T12345".into(),
            drive_ordinal: 2,
            flags: 0,
        }
    }

    #[test]
    fn test_request_round_trip() {
        let request = mount_request();
        let mut buf = BytesMut::new();
        let written = request.ser(&mut buf).unwrap();
        assert_eq!(written, buf.len());

        let mut b: &[u8] = &buf;
        let header = MessageHeader::deser(&mut b).unwrap();
        assert_eq!(header.magic, RMC_MAGIC);
        assert_eq!(header.reqtype, RMC_MOUNT);
        assert_eq!(header.len_or_status as usize, b.remaining());

        let deser = RmcRequest::deser_body(&mut b, header.reqtype).unwrap();
        assert!(b.is_empty());
        assert_eq!(request, deser);
    }

    #[test]
    fn test_request_rejects_long_vid() {
        let mut request = mount_request();
        request.vid = "TOOLONGVID".into();
        let mut buf = BytesMut::new();
        assert!(matches!(
            request.ser(&mut buf),
            Err(CodecError::InvalidArgument(_))
        ));
    }

    #[rstest]
    #[case::ok(RmcReply::ok())]
    #[case::error(RmcReply { status: 7, error_message: "volume in use".into(), elements: vec![] })]
    #[case::elements(RmcReply {
        status: 0,
        error_message: "".into(),
        elements: vec![
            ElementStatus { element_type: ElementType::DataTransfer, address: 480, full: true, vid: Some("T12345".into()) },
            ElementStatus { element_type: ElementType::StorageCell, address: 10, full: false, vid: None },
        ],
    })]
    fn test_reply_round_trip(#[case] reply: RmcReply) {
        let mut buf = BytesMut::new();
        let written = reply.ser(&mut buf, RMC_READELEM).unwrap();
        assert_eq!(written, buf.len());

        let mut b: &[u8] = &buf;
        let header = MessageHeader::deser(&mut b).unwrap();
        assert_eq!(header.len_or_status as usize, b.remaining());

        let deser = RmcReply::deser_body(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(reply, deser);
    }

    async fn fake_daemon(listener: TcpListener, reply: RmcReply) -> RmcRequest {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut header_buf = [0u8; MessageHeader::SERIALIZED_LEN];
        stream.read_exact(&mut header_buf).await.unwrap();
        let mut b: &[u8] = &header_buf;
        let header = MessageHeader::deser(&mut b).unwrap();
        let mut body = vec![0u8; header.len_or_status as usize];
        stream.read_exact(&mut body).await.unwrap();
        let mut b: &[u8] = &body;
        let request = RmcRequest::deser_body(&mut b, header.reqtype).unwrap();

        let mut reply_buf = BytesMut::new();
        reply.ser(&mut reply_buf, header.reqtype).unwrap();
        stream.write_all(&reply_buf).await.unwrap();
        request
    }

    #[tokio::test]
    async fn test_mount_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let daemon = tokio::spawn(fake_daemon(listener, RmcReply::ok()));

        let client = RmcClient::new("127.0.0.1", port, 1001, 1002, NET_TIMEOUT);
        client.move_to_drive("T12345", 2).await.unwrap();

        let seen = daemon.await.unwrap();
        assert_eq!(seen.reqtype, RMC_MOUNT);
        assert_eq!(seen.vid, "T12345");
        assert_eq!(seen.drive_ordinal, 2);
    }

    #[tokio::test]
    async fn test_daemon_error_surfaces_code_and_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _daemon = tokio::spawn(fake_daemon(
            listener,
            RmcReply {
                status: 7,
                error_message: "volume in use".into(),
                elements: Vec::new(),
            },
        ));

        let client = RmcClient::new("127.0.0.1", port, 1001, 1002, NET_TIMEOUT);
        let actual = client.move_to_drive("T12345", 2).await;
        assert_eq!(
            actual,
            Err(RobotError::MediaChanger {
                code: 7,
                message: "volume in use".into()
            })
        );
    }

    #[tokio::test]
    async fn test_read_element_status_returns_elements() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let elements = vec![ElementStatus {
            element_type: ElementType::DataTransfer,
            address: 480,
            full: true,
            vid: Some("T12345".into()),
        }];
        let _daemon = tokio::spawn(fake_daemon(
            listener,
            RmcReply {
                status: 0,
                error_message: "".into(),
                elements: elements.clone(),
            },
        ));

        let client = RmcClient::new("127.0.0.1", port, 1001, 1002, NET_TIMEOUT);
        let actual = client.read_element_status("T12345").await.unwrap();
        assert_eq!(actual, elements);
    }
}
