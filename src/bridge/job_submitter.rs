//! Submits a job request to a mover (or a peer bridge) over a short-lived
//! TCP connection and reads back the framed reply.

use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::rtcopy::codec::CodecError;
use crate::rtcopy::header::MessageHeader;
use crate::rtcopy::messages::{RtcpJobReply, RtcpJobRequest};
use crate::rtcopy::{RTCP_MSGBUFSIZ, VDQM_CLIENTINFO};

#[derive(Debug, Error)]
pub enum SubmitError {
    /// A request field exceeds its fixed wire-format width. Checked before
    /// marshalling so it can never become a buffer overrun.
    #[error("{peer}: {source}")]
    InvalidRequest { peer: &'static str, source: CodecError },

    /// Could not open the connection to the peer within the timeout.
    #[error("{peer}: failed to connect to {host}:{port}: {detail}")]
    ConnectFailed {
        peer: &'static str,
        host: String,
        port: u16,
        detail: String,
    },

    /// The connection broke while sending or receiving.
    #[error("{peer}: communication error: {detail}")]
    Communication { peer: &'static str, detail: String },

    /// The peer's reply failed structural validation.
    #[error("{peer}: malformed reply: {source}")]
    BadReply { peer: &'static str, source: CodecError },
}

/// Submits `request` to `host:port` and returns the peer's reply.
///
/// `peer_label` names the remote end ("RTCPD", "tape aggregator") in every
/// error so operators can tell which hop failed; the underlying error kind
/// is preserved alongside it.
pub async fn submit(
    host: &str,
    port: u16,
    net_timeout: Duration,
    peer_label: &'static str,
    request: &RtcpJobRequest,
) -> Result<RtcpJobReply, SubmitError> {
    request
        .check_field_lengths()
        .map_err(|source| SubmitError::InvalidRequest { peer: peer_label, source })?;

    let mut buf = BytesMut::with_capacity(RTCP_MSGBUFSIZ);
    request
        .ser(&mut buf)
        .map_err(|source| SubmitError::InvalidRequest { peer: peer_label, source })?;

    debug!(host, port, vol_req_id = request.vol_req_id, "submitting job request");
    let mut stream = timeout(net_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| SubmitError::ConnectFailed {
            peer: peer_label,
            host: host.to_string(),
            port,
            detail: "connect timed out".into(),
        })?
        .map_err(|e| SubmitError::ConnectFailed {
            peer: peer_label,
            host: host.to_string(),
            port,
            detail: e.to_string(),
        })?;

    timeout(net_timeout, stream.write_all(&buf))
        .await
        .map_err(|_| SubmitError::Communication {
            peer: peer_label,
            detail: "write timed out".into(),
        })?
        .map_err(|e| SubmitError::Communication {
            peer: peer_label,
            detail: format!("failed to write job request: {}", e),
        })?;

    read_reply(&mut stream, net_timeout, peer_label).await
}

/// Reads exactly one framed job reply: fixed-size header first, then the
/// body the header promises. Any validation failure is terminal; there is
/// no partial recovery on this channel.
pub async fn read_reply(
    stream: &mut TcpStream,
    net_timeout: Duration,
    peer_label: &'static str,
) -> Result<RtcpJobReply, SubmitError> {
    let mut header_buf = [0u8; MessageHeader::SERIALIZED_LEN];
    read_exact_with_timeout(stream, &mut header_buf, net_timeout, peer_label).await?;

    let mut b: &[u8] = &header_buf;
    let header = MessageHeader::deser(&mut b)
        .map_err(|source| SubmitError::BadReply { peer: peer_label, source })?;
    header
        .check_magic()
        .and_then(|()| header.check_reqtype(VDQM_CLIENTINFO))
        .map_err(|source| SubmitError::BadReply { peer: peer_label, source })?;

    let body_len = header.len_or_status as usize;
    if body_len < RtcpJobReply::MIN_BODY_LEN {
        return Err(SubmitError::BadReply {
            peer: peer_label,
            source: CodecError::Malformed(format!(
                "reply body of {} bytes is smaller than the minimal reply",
                body_len
            )),
        });
    }
    if body_len > RTCP_MSGBUFSIZ - MessageHeader::SERIALIZED_LEN {
        return Err(SubmitError::BadReply {
            peer: peer_label,
            source: CodecError::MessageTooLarge {
                actual: MessageHeader::SERIALIZED_LEN + body_len,
                max: RTCP_MSGBUFSIZ,
            },
        });
    }

    let mut body = vec![0u8; body_len];
    read_exact_with_timeout(stream, &mut body, net_timeout, peer_label).await?;

    let mut b: &[u8] = &body;
    let reply = RtcpJobReply::deser_body(&mut b)
        .map_err(|source| SubmitError::BadReply { peer: peer_label, source })?;
    debug!(status = reply.status, error_message = %reply.error_message, "job reply received");
    Ok(reply)
}

async fn read_exact_with_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    net_timeout: Duration,
    peer_label: &'static str,
) -> Result<(), SubmitError> {
    timeout(net_timeout, stream.read_exact(buf))
        .await
        .map_err(|_| SubmitError::Communication {
            peer: peer_label,
            detail: "read timed out".into(),
        })?
        .map_err(|e| SubmitError::Communication {
            peer: peer_label,
            detail: format!("failed to read reply: {}", e),
        })?;
    Ok(())
}
