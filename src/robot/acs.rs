//! ACS robot control: asynchronous mount/dismount requests against the
//! vendor library, polled until the final response arrives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::robot::RobotError;
use crate::util::counter::SynchronizedCounter;

/// A response to an outstanding ACS request. The protocol acknowledges
/// first, may send any number of intermediates, and ends with exactly one
/// final response.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AcsResponse {
    Acknowledge,
    Intermediate,
    Final { status: u32, message: String },
}

/// Seam to the vendor client library's RPC surface.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AcsTransport: Send + Sync {
    async fn send_mount(&self, seq_number: u16, vid: &str, drive: &str) -> Result<(), RobotError>;

    async fn send_dismount(
        &self,
        seq_number: u16,
        vid: &str,
        drive: &str,
        force: bool,
    ) -> Result<(), RobotError>;

    /// Polls for the next response to the request with the given sequence
    /// number, blocking at most the transport's own polling interval.
    async fn next_response(&self, seq_number: u16) -> Result<AcsResponse, RobotError>;
}

pub struct AcsRobot {
    transport: Arc<dyn AcsTransport>,
    seq_counter: SynchronizedCounter,
    /// Ceiling on the whole poll loop of one request.
    response_timeout: Duration,
    /// Pause between polls while the robot works on the request.
    poll_interval: Duration,
}

impl AcsRobot {
    pub fn new(transport: Arc<dyn AcsTransport>, response_timeout: Duration) -> AcsRobot {
        AcsRobot {
            transport,
            seq_counter: SynchronizedCounter::new(1),
            response_timeout,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub async fn mount(&self, vid: &str, drive: &str) -> Result<(), RobotError> {
        let seq_number = self.next_seq_number();
        debug!(vid, drive, seq_number, "acs mount");
        self.transport.send_mount(seq_number, vid, drive).await?;
        self.await_final_response(seq_number).await?;
        info!(vid, drive, "acs mount complete");
        Ok(())
    }

    pub async fn dismount(&self, vid: &str, drive: &str, force: bool) -> Result<(), RobotError> {
        let seq_number = self.next_seq_number();
        debug!(vid, drive, seq_number, force, "acs dismount");
        self.transport
            .send_dismount(seq_number, vid, drive, force)
            .await?;
        self.await_final_response(seq_number).await?;
        info!(vid, drive, "acs dismount complete");
        Ok(())
    }

    fn next_seq_number(&self) -> u16 {
        // the vendor protocol carries 16-bit sequence numbers; wrapping is
        // harmless as long as concurrent requests stay distinct
        (self.seq_counter.next() % u64::from(u16::MAX)) as u16 + 1
    }

    async fn await_final_response(&self, seq_number: u16) -> Result<(), RobotError> {
        let poll = async {
            loop {
                match self.transport.next_response(seq_number).await? {
                    AcsResponse::Acknowledge => debug!(seq_number, "acs acknowledged"),
                    AcsResponse::Intermediate => debug!(seq_number, "acs intermediate response"),
                    AcsResponse::Final { status: 0, .. } => return Ok(()),
                    AcsResponse::Final { status, message } => {
                        return Err(RobotError::MediaChanger {
                            code: status,
                            message,
                        });
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(self.response_timeout, poll)
            .await
            .map_err(|_| {
                RobotError::Communication(format!(
                    "no final acs response within {}s",
                    self.response_timeout.as_secs()
                ))
            })?
    }
}
