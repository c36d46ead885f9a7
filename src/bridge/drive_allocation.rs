//! The drive-allocation sequence at the start of a tape session: submit the
//! job to the mover, accept the mover's callback, check that mover and
//! dispatcher still agree on what is being allocated, then fetch the volume
//! assignment from the real client.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::bridge::client_proxy::{ClientProxy, ClientReply, Volume};
use crate::bridge::job_submitter;
use crate::rtcopy::header::MessageHeader;
use crate::rtcopy::messages::{RtcpdRequestInfo, RtcpJobRequest};
use crate::rtcopy::{ReqType, RTCP_MSGBUFSIZ};
use crate::util::counter::SynchronizedCounter;

pub struct DriveAllocationProtocolEngine {
    net_timeout: Duration,
    accept_timeout: Duration,
    tx_counter: Arc<SynchronizedCounter>,
}

impl DriveAllocationProtocolEngine {
    pub fn new(
        net_timeout: Duration,
        accept_timeout: Duration,
        tx_counter: Arc<SynchronizedCounter>,
    ) -> DriveAllocationProtocolEngine {
        DriveAllocationProtocolEngine {
            net_timeout,
            accept_timeout,
            tx_counter,
        }
    }

    /// Runs the allocation sequence. Returns the client's volume
    /// assignment, `None` if the client has no work for this drive, and the
    /// mover's callback connection, which the caller registers as the
    /// session's initial connection.
    pub async fn run(
        &self,
        mover_host: &str,
        mover_port: u16,
        callback_listener: &TcpListener,
        callback_host: &str,
        callback_port: u16,
        job: &RtcpJobRequest,
        client: &dyn ClientProxy,
    ) -> anyhow::Result<(Option<Volume>, TcpStream)> {
        // The mover must call *us* back, not the original requester: the
        // job travels on with our own host/port in the client fields.
        let mut readdressed = job.clone();
        readdressed.client_host = callback_host.to_string();
        readdressed.client_port = callback_port as u32;

        let reply =
            job_submitter::submit(mover_host, mover_port, self.net_timeout, "RTCPD", &readdressed)
                .await?;
        // A non-empty error message is the failure signal; the status code
        // alone, with an empty message, is a soft success.
        if !reply.error_message.is_empty() {
            bail!(
                "RTCPD rejected job submission: {} (status {})",
                reply.error_message,
                reply.status
            );
        }

        let (mut stream, peer_addr) = timeout(self.accept_timeout, callback_listener.accept())
            .await
            .map_err(|_| anyhow!("timed out waiting for the mover callback connection"))?
            .context("failed to accept the mover callback connection")?;
        debug!(%peer_addr, "accepted mover callback connection");

        let request_info = self.read_request_info(&mut stream).await?;
        // Drive unit and volume-request id are the only integrity check
        // against mover/dispatcher desynchronization; a mismatch is fatal.
        if request_info.drive_unit != job.drive_unit {
            bail!(
                "malformed request information message: drive unit mismatch: expected {}, got {}",
                job.drive_unit,
                request_info.drive_unit
            );
        }
        if request_info.vol_req_id != job.vol_req_id {
            bail!(
                "malformed request information message: volume request id mismatch: expected {}, got {}",
                job.vol_req_id,
                request_info.vol_req_id
            );
        }

        let tx_id = self.tx_counter.next();
        let volume = match client
            .get_volume(tx_id, job.vol_req_id, &job.drive_unit)
            .await?
        {
            ClientReply::Volume(volume) => {
                info!(vid = %volume.vid, "client assigned a volume");
                Some(volume)
            }
            ClientReply::NoMoreFiles => {
                info!("client has no more files for this drive");
                None
            }
            ClientReply::ErrorReport { code, message } => {
                bail!("client returned an error instead of a volume: {} (code {})", message, code)
            }
        };
        Ok((volume, stream))
    }

    async fn read_request_info(&self, stream: &mut TcpStream) -> anyhow::Result<RtcpdRequestInfo> {
        let mut header_buf = [0u8; MessageHeader::SERIALIZED_LEN];
        timeout(self.net_timeout, stream.read_exact(&mut header_buf))
            .await
            .map_err(|_| anyhow!("timed out reading the request information header"))?
            .context("failed to read the request information header")?;

        let mut b: &[u8] = &header_buf;
        let header = MessageHeader::deser(&mut b)?;
        header.check_magic()?;
        header.check_reqtype(ReqType::RtcpInfoReq.into())?;

        let body_len = header.len_or_status as usize;
        if body_len > RTCP_MSGBUFSIZ - MessageHeader::SERIALIZED_LEN {
            bail!("request information body of {} bytes exceeds the message buffer", body_len);
        }
        let mut body = vec![0u8; body_len];
        timeout(self.net_timeout, stream.read_exact(&mut body))
            .await
            .map_err(|_| anyhow!("timed out reading the request information body"))?
            .context("failed to read the request information body")?;

        let mut b: &[u8] = &body;
        Ok(RtcpdRequestInfo::deser_body(&mut b)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::client_proxy::{MockClientProxy, VolumeMode};
    use crate::rtcopy::messages::RtcpJobReply;
    use bytes::BytesMut;
    use tokio::io::AsyncWriteExt;

    const NET_TIMEOUT: Duration = Duration::from_secs(5);

    fn job() -> RtcpJobRequest {
        RtcpJobRequest {
            vol_req_id: 4711,
            client_port: 9999,
            client_euid: 1001,
            client_egid: 1002,
            client_host: "requester".into(),
            dgn: "LTO5".into(),
            drive_unit: "drive0".into(),
            client_user_name: "stage".into(),
        }
    }

    fn engine() -> DriveAllocationProtocolEngine {
        DriveAllocationProtocolEngine::new(
            NET_TIMEOUT,
            NET_TIMEOUT,
            Arc::new(SynchronizedCounter::new(1)),
        )
    }

    /// A stand-in mover: answers the job submission and calls back with the
    /// given request information.
    async fn fake_mover(
        mover_listener: TcpListener,
        reply: RtcpJobReply,
        request_info: Option<RtcpdRequestInfo>,
    ) -> RtcpJobRequest {
        let (mut stream, _) = mover_listener.accept().await.unwrap();

        let mut header_buf = [0u8; MessageHeader::SERIALIZED_LEN];
        stream.read_exact(&mut header_buf).await.unwrap();
        let mut b: &[u8] = &header_buf;
        let header = MessageHeader::deser(&mut b).unwrap();
        let mut body = vec![0u8; header.len_or_status as usize];
        stream.read_exact(&mut body).await.unwrap();
        let mut b: &[u8] = &body;
        let seen_job = RtcpJobRequest::deser_body(&mut b).unwrap();

        let mut reply_buf = BytesMut::new();
        reply.ser(&mut reply_buf).unwrap();
        stream.write_all(&reply_buf).await.unwrap();

        if let Some(info) = request_info {
            let mut callback = TcpStream::connect((
                seen_job.client_host.as_str(),
                seen_job.client_port as u16,
            ))
            .await
            .unwrap();
            let mut info_buf = BytesMut::new();
            info.ser(&mut info_buf).unwrap();
            callback.write_all(&info_buf).await.unwrap();
            // keep the callback connection open until the test is done
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        seen_job
    }

    #[tokio::test]
    async fn test_successful_allocation() {
        let mover_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mover_port = mover_listener.local_addr().unwrap().port();
        let callback_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let callback_port = callback_listener.local_addr().unwrap().port();

        let mover = tokio::spawn(fake_mover(
            mover_listener,
            RtcpJobReply { status: 0, error_message: "".into() },
            Some(RtcpdRequestInfo { vol_req_id: 4711, drive_unit: "drive0".into() }),
        ));

        let mut client = MockClientProxy::new();
        client
            .expect_get_volume()
            .withf(|_, vol_req_id, drive_unit| *vol_req_id == 4711 && drive_unit == "drive0")
            .times(1)
            .returning(|_, _, _| {
                Ok(ClientReply::Volume(Volume {
                    vid: "T12345".into(),
                    mode: VolumeMode::Write,
                    label: "aul".into(),
                    density: "5000GC".into(),
                }))
            });

        let (volume, _initial_conn) = engine()
            .run(
                "127.0.0.1",
                mover_port,
                &callback_listener,
                "127.0.0.1",
                callback_port,
                &job(),
                &client,
            )
            .await
            .unwrap();
        assert_eq!(volume.unwrap().vid, "T12345");

        // the job travelled with the callback address, not the requester's
        let seen_job = mover.await.unwrap();
        assert_eq!(seen_job.client_host, "127.0.0.1");
        assert_eq!(seen_job.client_port, callback_port as u32);
        assert_eq!(seen_job.vol_req_id, 4711);
    }

    #[tokio::test]
    async fn test_no_more_files_is_a_graceful_outcome() {
        let mover_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mover_port = mover_listener.local_addr().unwrap().port();
        let callback_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let callback_port = callback_listener.local_addr().unwrap().port();

        let _mover = tokio::spawn(fake_mover(
            mover_listener,
            RtcpJobReply { status: 0, error_message: "".into() },
            Some(RtcpdRequestInfo { vol_req_id: 4711, drive_unit: "drive0".into() }),
        ));

        let mut client = MockClientProxy::new();
        client
            .expect_get_volume()
            .returning(|_, _, _| Ok(ClientReply::NoMoreFiles));

        let (volume, _initial_conn) = engine()
            .run(
                "127.0.0.1",
                mover_port,
                &callback_listener,
                "127.0.0.1",
                callback_port,
                &job(),
                &client,
            )
            .await
            .unwrap();
        assert!(volume.is_none());
    }

    #[tokio::test]
    async fn test_mover_error_message_fails_submission() {
        let mover_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mover_port = mover_listener.local_addr().unwrap().port();
        let callback_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let _mover = tokio::spawn(fake_mover(
            mover_listener,
            RtcpJobReply { status: -1, error_message: "drive is down".into() },
            None,
        ));

        let client = MockClientProxy::new();
        let actual = engine()
            .run(
                "127.0.0.1",
                mover_port,
                &callback_listener,
                "127.0.0.1",
                1,
                &job(),
                &client,
            )
            .await;
        let err = actual.err().unwrap().to_string();
        assert!(err.contains("drive is down"));
        assert!(err.contains("-1"));
    }

    #[rstest::rstest]
    #[case::wrong_unit(RtcpdRequestInfo { vol_req_id: 4711, drive_unit: "drive9".into() }, "drive unit mismatch")]
    #[case::wrong_vol_req(RtcpdRequestInfo { vol_req_id: 1, drive_unit: "drive0".into() }, "volume request id mismatch")]
    #[tokio::test]
    async fn test_request_info_cross_validation(
        #[case] info: RtcpdRequestInfo,
        #[case] expected: &str,
    ) {
        let mover_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mover_port = mover_listener.local_addr().unwrap().port();
        let callback_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let callback_port = callback_listener.local_addr().unwrap().port();

        let _mover = tokio::spawn(fake_mover(
            mover_listener,
            RtcpJobReply { status: 0, error_message: "".into() },
            Some(info),
        ));

        let client = MockClientProxy::new();
        let actual = engine()
            .run(
                "127.0.0.1",
                mover_port,
                &callback_listener,
                "127.0.0.1",
                callback_port,
                &job(),
                &client,
            )
            .await;
        assert!(actual.err().unwrap().to_string().contains(expected));
    }
}
