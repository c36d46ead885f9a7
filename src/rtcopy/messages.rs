//! Message bodies of the mover-facing protocol.
//!
//! Every `ser` computes the body length first, verifies that header plus
//! body fit the fixed mover buffer, writes the header with that length
//! embedded, writes the body, and finally checks that the bytes actually
//! written equal the length promised in the header. A mismatch there is a
//! programming bug and is reported as a fatal internal error.

use bytes::{Buf, BufMut, BytesMut};

use crate::rtcopy::codec::{
    put_string, put_string_truncated, truncated_string_len, try_get_i32, try_get_string, try_get_u32,
    CodecError,
};
use crate::rtcopy::header::MessageHeader;
use crate::rtcopy::{
    CA_MAXDGNLEN, CA_MAXHOSTNAMELEN, CA_MAXUNMLEN, CA_MAXUSRNAMELEN, RTCOPY_MAGIC,
    RTCP_MSGBUFSIZ, VDQM_CLIENTINFO,
};

/// Capacity of the error string field of [`RtcpJobReply`], terminator
/// included.
pub const JOB_REPLY_ERRMSG_CAPACITY: usize = 512;

/// Submits a tape job to a mover or a peer bridge. The client host/port
/// fields name whoever the mover should call back.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RtcpJobRequest {
    pub vol_req_id: u32,
    pub client_port: u32,
    pub client_euid: u32,
    pub client_egid: u32,
    pub client_host: String,
    pub dgn: String,
    pub drive_unit: String,
    pub client_user_name: String,
}

impl RtcpJobRequest {
    fn body_len(&self) -> usize {
        4 * size_of::<u32>()
            + self.client_host.len() + 1
            + self.dgn.len() + 1
            + self.drive_unit.len() + 1
            + self.client_user_name.len() + 1
    }

    /// Checks every string field against its fixed wire-format capacity.
    /// Run before marshalling so a too-long field can never turn into a
    /// buffer overrun later.
    pub fn check_field_lengths(&self) -> Result<(), CodecError> {
        let fields: [(&str, &str, usize); 4] = [
            ("clientHost", &self.client_host, CA_MAXHOSTNAMELEN),
            ("dgn", &self.dgn, CA_MAXDGNLEN),
            ("driveUnit", &self.drive_unit, CA_MAXUNMLEN),
            ("clientUserName", &self.client_user_name, CA_MAXUSRNAMELEN),
        ];
        for (name, value, max) in fields {
            if value.len() > max {
                return Err(CodecError::InvalidArgument(format!(
                    "{} field is too long: length {} exceeds maximum {}",
                    name,
                    value.len(),
                    max
                )));
            }
        }
        Ok(())
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        self.check_field_lengths()?;

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
            magic: RTCOPY_MAGIC,
            reqtype: VDQM_CLIENTINFO,
            len_or_status: body_len as u32,
        }
        .ser(buf);
        buf.put_u32(self.vol_req_id);
        buf.put_u32(self.client_port);
        buf.put_u32(self.client_euid);
        buf.put_u32(self.client_egid);
        put_string(buf, &self.client_host, CA_MAXHOSTNAMELEN + 1)?;
        put_string(buf, &self.dgn, CA_MAXDGNLEN + 1)?;
        put_string(buf, &self.drive_unit, CA_MAXUNMLEN + 1)?;
        put_string(buf, &self.client_user_name, CA_MAXUSRNAMELEN + 1)?;

        let written = buf.len() - start;
        if written != total {
            return Err(CodecError::Internal(format!(
                "marshalled {} bytes but promised {} in the header",
                written, total
            )));
        }
        Ok(written)
    }

    pub fn deser_body(buf: &mut impl Buf) -> Result<RtcpJobRequest, CodecError> {
        Ok(RtcpJobRequest {
            vol_req_id: try_get_u32(buf)?,
            client_port: try_get_u32(buf)?,
            client_euid: try_get_u32(buf)?,
            client_egid: try_get_u32(buf)?,
            client_host: try_get_string(buf, CA_MAXHOSTNAMELEN + 1)?,
            dgn: try_get_string(buf, CA_MAXDGNLEN + 1)?,
            drive_unit: try_get_string(buf, CA_MAXUNMLEN + 1)?,
            client_user_name: try_get_string(buf, CA_MAXUSRNAMELEN + 1)?,
        })
    }
}

/// Reply to a job submission: a status code plus an optional error string.
///
/// An empty error string is the authoritative success signal of this
/// protocol; the status code alone does not make the reply a failure.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RtcpJobReply {
    pub status: i32,
    pub error_message: String,
}

impl RtcpJobReply {
    /// A reply body can never be smaller than a status code plus an empty,
    /// terminated string.
    pub const MIN_BODY_LEN: usize = size_of::<i32>() + 1;

    pub fn ser(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        // the error string is right-truncated rather than rejected
        let body_len =
            size_of::<i32>() + truncated_string_len(&self.error_message, JOB_REPLY_ERRMSG_CAPACITY);
        let total = MessageHeader::SERIALIZED_LEN + body_len;
        if total > RTCP_MSGBUFSIZ {
            return Err(CodecError::MessageTooLarge {
                actual: total,
                max: RTCP_MSGBUFSIZ,
            });
        }

        let start = buf.len();
        MessageHeader {
            magic: RTCOPY_MAGIC,
            reqtype: VDQM_CLIENTINFO,
            len_or_status: body_len as u32,
        }
        .ser(buf);
        buf.put_i32(self.status);
        put_string_truncated(buf, &self.error_message, JOB_REPLY_ERRMSG_CAPACITY);

        let written = buf.len() - start;
        if written != total {
            return Err(CodecError::Internal(format!(
                "marshalled {} bytes but promised {} in the header",
                written, total
            )));
        }
        Ok(written)
    }

    pub fn deser_body(buf: &mut impl Buf) -> Result<RtcpJobReply, CodecError> {
        Ok(RtcpJobReply {
            status: try_get_i32(buf)?,
            error_message: try_get_string(buf, JOB_REPLY_ERRMSG_CAPACITY)?,
        })
    }
}

/// First message the mover sends on its callback connection, identifying
/// the drive it was started on and the volume request it is serving. The
/// only integrity check available against mover/dispatcher desync.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RtcpdRequestInfo {
    pub vol_req_id: u32,
    pub drive_unit: String,
}

impl RtcpdRequestInfo {
    pub fn ser(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        let body_len = size_of::<u32>() + self.drive_unit.len() + 1;
        let total = MessageHeader::SERIALIZED_LEN + body_len;
        if total > RTCP_MSGBUFSIZ {
            return Err(CodecError::MessageTooLarge {
                actual: total,
                max: RTCP_MSGBUFSIZ,
            });
        }

        let start = buf.len();
        MessageHeader {
            magic: RTCOPY_MAGIC,
            reqtype: super::ReqType::RtcpInfoReq.into(),
            len_or_status: body_len as u32,
        }
        .ser(buf);
        buf.put_u32(self.vol_req_id);
        put_string(buf, &self.drive_unit, CA_MAXUNMLEN + 1)?;

        let written = buf.len() - start;
        if written != total {
            return Err(CodecError::Internal(format!(
                "marshalled {} bytes but promised {} in the header",
                written, total
            )));
        }
        Ok(written)
    }

    pub fn deser_body(buf: &mut impl Buf) -> Result<RtcpdRequestInfo, CodecError> {
        Ok(RtcpdRequestInfo {
            vol_req_id: try_get_u32(buf)?,
            drive_unit: try_get_string(buf, CA_MAXUNMLEN + 1)?,
        })
    }
}
