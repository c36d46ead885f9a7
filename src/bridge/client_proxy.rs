//! The RPC boundary towards the gateway/client side of a session.
//!
//! The bridge only ever needs a handful of reply shapes from the client, so
//! they are modelled as one sum type matched exhaustively at the call
//! sites; anything else is an "unexpected response" error there.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// Mount mode requested for a volume.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VolumeMode {
    Read,
    Write,
}

/// The volume assignment a client hands out for a drive allocation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Volume {
    pub vid: String,
    pub mode: VolumeMode,
    pub label: String,
    pub density: String,
}

/// Replies a client can give to a volume request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ClientReply {
    Volume(Volume),
    /// The client has no work for this drive; the session should wind down.
    NoMoreFiles,
    /// The client reports an error instead of an assignment.
    ErrorReport { code: i32, message: String },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientProxy: Send + Sync {
    /// Asks the client side for a volume assignment. `tx_id` correlates the
    /// request with the session-wide transaction counter.
    async fn get_volume(
        &self,
        tx_id: u64,
        vol_req_id: u32,
        drive_unit: &str,
    ) -> anyhow::Result<ClientReply>;
}
