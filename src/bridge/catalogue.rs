//! The socket catalogue of one tape-mover session.
//!
//! One catalogue owns the full set of live connections of a session: the
//! (externally owned) listen socket and initial mover connection, each
//! registered by descriptor, the mover's disk/tape-IO control connections,
//! their at-most-one associated client connection each, and an optional
//! client migration-report connection. Registered control, client and
//! migration-report sockets are owned by the catalogue and closed exactly
//! once, either by an explicit release handing the socket back to the
//! caller or by dropping the catalogue. The listen and initial sockets are
//! never closed here; their lifetime belongs to the caller.
//!
//! The catalogue is single-owner by design. It is never shared between
//! tasks, so it carries no lock.

use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Wall-clock ceiling on how long a single client request may stay
/// unanswered before the session gives up on the client.
pub const CLIENT_REQ_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogueError {
    /// Malformed call input, e.g. a negative descriptor. A caller bug.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced catalogue entry does not exist.
    #[error("no such entry: {0}")]
    NoEntry(String),

    /// A socket was registered twice, or registered while a previous
    /// registration is still live.
    #[error("already set: {0}")]
    AlreadySet(String),

    /// The control connection still has a client reply pending; the client
    /// side must be released first.
    #[error("client connection still pending: {0}")]
    ClientStillPending(String),

    /// The per-connection state machine forbids the requested transition.
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),

    /// The oldest outstanding client request exceeded the allowed age.
    #[error("client request on socket {fd} timed out after {age:?}")]
    Timeout { fd: RawFd, age: Duration },

    /// The catalogue's internal bookkeeping is inconsistent. A programming
    /// bug, unconditionally fatal to the session.
    #[error("internal catalogue error: {0}")]
    Internal(String),
}

/// Anything the catalogue can track. Production code registers tokio
/// streams; tests register descriptor-only fakes.
pub trait CatalogueSocket {
    fn raw_fd(&self) -> RawFd;
}

impl CatalogueSocket for tokio::net::TcpStream {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }
}

impl CatalogueSocket for tokio::net::TcpListener {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }
}

/// The kind of reply the client owes a mover request. Determines the
/// pending status the control connection enters.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientReplyKind {
    FileToMigrate,
    FileToRecall,
    AckOfFileMigrated,
    AckOfFileRecalled,
}

/// What kind of client reply is outstanding on a control connection.
///
/// The only legal forward transition leaves `Idle`; the only legal backward
/// transition returns to `Idle` and requires an associated client
/// connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RtcpdStatus {
    Idle,
    WaitFileToMigrate,
    WaitFileToRecall,
    WaitAckOfFileMigrated,
    WaitAckOfFileRecalled,
}

impl From<ClientReplyKind> for RtcpdStatus {
    fn from(kind: ClientReplyKind) -> RtcpdStatus {
        match kind {
            ClientReplyKind::FileToMigrate => RtcpdStatus::WaitFileToMigrate,
            ClientReplyKind::FileToRecall => RtcpdStatus::WaitFileToRecall,
            ClientReplyKind::AckOfFileMigrated => RtcpdStatus::WaitAckOfFileMigrated,
            ClientReplyKind::AckOfFileRecalled => RtcpdStatus::WaitAckOfFileRecalled,
        }
    }
}

/// Semantic category of a ready descriptor, so the event loop knows which
/// handler to dispatch to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PendingSocketKind {
    Listen,
    InitialRtcpd,
    ClientMigrationReport,
    RtcpdDiskTapeIOControl,
    Client,
}

/// The descriptors a readiness poll should watch, with the running maximum
/// the poll call needs.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct FdSet {
    fds: std::collections::BTreeSet<RawFd>,
}

impl FdSet {
    pub fn new() -> FdSet {
        FdSet::default()
    }

    pub fn insert(&mut self, fd: RawFd) {
        self.fds.insert(fd);
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.contains(&fd)
    }

    pub fn max_fd(&self) -> Option<RawFd> {
        self.fds.iter().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.fds.iter().copied()
    }
}

/// One mover disk/tape-IO control connection and the client connection, if
/// any, whose reply to a specific mover request is outstanding.
#[derive(Debug)]
struct RtcpdConnection<S> {
    rtcpd_sock: S,
    client_sock: Option<S>,
    rtcpd_req_magic: u32,
    rtcpd_req_type: u32,
    rtcpd_req_tape_path: Option<String>,
    status: RtcpdStatus,
    client_req_timestamp: Instant,
    aggregator_tx_id: Option<u64>,
}

/// Read-only view of the pending request on a control connection, shaped
/// for marshalling the eventual reply back into the mover's wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest<'a> {
    pub rtcpd_fd: RawFd,
    pub req_magic: u32,
    pub req_type: u32,
    pub tape_path: Option<&'a str>,
    pub status: RtcpdStatus,
    pub aggregator_tx_id: Option<u64>,
}

struct ClientReqHistoryEntry {
    client_fd: RawFd,
    timestamp: Instant,
}

/// See the module documentation.
pub struct SocketCatalogue<S: CatalogueSocket> {
    listen_fd: Option<RawFd>,
    initial_rtcpd_fd: Option<RawFd>,
    migration_report_sock: Option<S>,
    rtcpd_conns: Vec<RtcpdConnection<S>>,
    /// Strict insertion order; the head is always the oldest outstanding
    /// client request.
    client_req_history: VecDeque<ClientReqHistoryEntry>,
    client_req_timeout: Duration,
}

impl<S: CatalogueSocket> SocketCatalogue<S> {
    pub fn new() -> SocketCatalogue<S> {
        Self::with_client_req_timeout(CLIENT_REQ_TIMEOUT)
    }

    pub fn with_client_req_timeout(client_req_timeout: Duration) -> SocketCatalogue<S> {
        SocketCatalogue {
            listen_fd: None,
            initial_rtcpd_fd: None,
            migration_report_sock: None,
            rtcpd_conns: Vec::new(),
            client_req_history: VecDeque::new(),
            client_req_timeout,
        }
    }

    fn check_fd(fd: RawFd) -> Result<(), CatalogueError> {
        if fd < 0 {
            return Err(CatalogueError::InvalidArgument(format!(
                "negative socket descriptor: {}",
                fd
            )));
        }
        Ok(())
    }

    fn check_not_registered(&self, fd: RawFd) -> Result<(), CatalogueError> {
        if self.listen_fd == Some(fd)
            || self.initial_rtcpd_fd == Some(fd)
            || self.migration_report_sock.as_ref().map(|s| s.raw_fd()) == Some(fd)
            || self.rtcpd_conns.iter().any(|c| {
                c.rtcpd_sock.raw_fd() == fd
                    || c.client_sock.as_ref().map(|s| s.raw_fd()) == Some(fd)
            })
        {
            return Err(CatalogueError::AlreadySet(format!(
                "socket descriptor {} is already registered",
                fd
            )));
        }
        Ok(())
    }

    /// Registers the callback listen socket. The catalogue never takes
    /// ownership of it.
    pub fn add_listen_socket(&mut self, fd: RawFd) -> Result<(), CatalogueError> {
        Self::check_fd(fd)?;
        if self.listen_fd.is_some() {
            return Err(CatalogueError::AlreadySet(
                "listen socket is already set".into(),
            ));
        }
        self.check_not_registered(fd)?;
        debug!(fd, "registering listen socket");
        self.listen_fd = Some(fd);
        Ok(())
    }

    /// Registers the mover's initial callback connection. The catalogue
    /// never takes ownership of it.
    pub fn add_initial_rtcpd_socket(&mut self, fd: RawFd) -> Result<(), CatalogueError> {
        Self::check_fd(fd)?;
        if self.initial_rtcpd_fd.is_some() {
            return Err(CatalogueError::AlreadySet(
                "initial rtcpd socket is already set".into(),
            ));
        }
        self.check_not_registered(fd)?;
        debug!(fd, "registering initial rtcpd socket");
        self.initial_rtcpd_fd = Some(fd);
        Ok(())
    }

    /// Takes ownership of the socket over which the client will receive
    /// migration reports.
    pub fn add_client_migration_report_sock(&mut self, sock: S) -> Result<(), CatalogueError> {
        let fd = sock.raw_fd();
        Self::check_fd(fd)?;
        if self.migration_report_sock.is_some() {
            return Err(CatalogueError::AlreadySet(
                "client migration-report socket is already set".into(),
            ));
        }
        self.check_not_registered(fd)?;
        debug!(fd, "registering client migration-report socket");
        self.migration_report_sock = Some(sock);
        Ok(())
    }

    pub fn release_client_migration_report_sock(&mut self) -> Result<S, CatalogueError> {
        self.migration_report_sock
            .take()
            .ok_or_else(|| CatalogueError::NoEntry("no client migration-report socket set".into()))
    }

    /// Takes ownership of a new mover disk/tape-IO control connection.
    pub fn add_rtcpd_disk_tape_io_control_socket(&mut self, sock: S) -> Result<(), CatalogueError> {
        let fd = sock.raw_fd();
        Self::check_fd(fd)?;
        self.check_not_registered(fd)?;
        debug!(fd, "registering rtcpd disk/tape-IO control connection");
        self.rtcpd_conns.push(RtcpdConnection {
            rtcpd_sock: sock,
            client_sock: None,
            rtcpd_req_magic: 0,
            rtcpd_req_type: 0,
            rtcpd_req_tape_path: None,
            status: RtcpdStatus::Idle,
            client_req_timestamp: Instant::now(),
            aggregator_tx_id: None,
        });
        Ok(())
    }

    /// Associates a client connection with the control connection whose
    /// mover request it will answer. Fails without side effects if the
    /// control connection is unknown, already has a client, or is not idle.
    #[allow(clippy::too_many_arguments)]
    pub fn add_client_conn(
        &mut self,
        rtcpd_fd: RawFd,
        req_magic: u32,
        req_type: u32,
        tape_path: Option<String>,
        client_sock: S,
        reply_kind: ClientReplyKind,
        aggregator_tx_id: Option<u64>,
    ) -> Result<(), CatalogueError> {
        Self::check_fd(rtcpd_fd)?;
        let client_fd = client_sock.raw_fd();
        Self::check_fd(client_fd)?;
        self.check_not_registered(client_fd)?;

        let conn = self
            .rtcpd_conns
            .iter_mut()
            .find(|c| c.rtcpd_sock.raw_fd() == rtcpd_fd)
            .ok_or_else(|| {
                CatalogueError::NoEntry(format!(
                    "no rtcpd disk/tape-IO control connection with descriptor {}",
                    rtcpd_fd
                ))
            })?;
        if conn.client_sock.is_some() {
            return Err(CatalogueError::AlreadySet(format!(
                "control connection {} already has an associated client connection",
                rtcpd_fd
            )));
        }
        if conn.status != RtcpdStatus::Idle {
            return Err(CatalogueError::IllegalTransition(format!(
                "control connection {} is not idle: {:?}",
                rtcpd_fd, conn.status
            )));
        }

        debug!(rtcpd_fd, client_fd, ?reply_kind, "associating client connection");
        let now = Instant::now();
        conn.rtcpd_req_magic = req_magic;
        conn.rtcpd_req_type = req_type;
        conn.rtcpd_req_tape_path = tape_path;
        conn.status = reply_kind.into();
        conn.client_req_timestamp = now;
        conn.aggregator_tx_id = aggregator_tx_id;
        conn.client_sock = Some(client_sock);
        self.client_req_history.push_back(ClientReqHistoryEntry {
            client_fd,
            timestamp: now,
        });
        Ok(())
    }

    /// Dissolves a client association, returning the client socket to the
    /// caller and the control connection to idle. The matching history
    /// entry is removed; the history being out of step with the entry is a
    /// programming bug, not a runtime condition.
    pub fn release_client_conn(
        &mut self,
        rtcpd_fd: RawFd,
        client_fd: RawFd,
    ) -> Result<S, CatalogueError> {
        Self::check_fd(rtcpd_fd)?;
        Self::check_fd(client_fd)?;

        let conn = self
            .rtcpd_conns
            .iter_mut()
            .find(|c| {
                c.rtcpd_sock.raw_fd() == rtcpd_fd
                    && c.client_sock.as_ref().map(|s| s.raw_fd()) == Some(client_fd)
            })
            .ok_or_else(|| {
                CatalogueError::NoEntry(format!(
                    "no control/client connection pair ({}, {})",
                    rtcpd_fd, client_fd
                ))
            })?;
        if conn.status == RtcpdStatus::Idle {
            return Err(CatalogueError::IllegalTransition(format!(
                "control connection {} has no pending client reply",
                rtcpd_fd
            )));
        }

        let history_pos = self
            .client_req_history
            .iter()
            .position(|e| e.client_fd == client_fd)
            .ok_or_else(|| {
                CatalogueError::Internal(format!(
                    "client request history has no entry for descriptor {}",
                    client_fd
                ))
            })?;
        self.client_req_history.remove(history_pos);

        debug!(rtcpd_fd, client_fd, "releasing client connection");
        conn.status = RtcpdStatus::Idle;
        conn.rtcpd_req_magic = 0;
        conn.rtcpd_req_type = 0;
        conn.rtcpd_req_tape_path = None;
        conn.aggregator_tx_id = None;
        let sock = conn
            .client_sock
            .take()
            .expect("client socket present: checked by the pair lookup above");
        Ok(sock)
    }

    /// Removes a control connection and returns its socket. Fails if a
    /// client reply is still pending on it; the client side must be
    /// released first.
    pub fn release_rtcpd_disk_tape_io_control_socket(
        &mut self,
        rtcpd_fd: RawFd,
    ) -> Result<S, CatalogueError> {
        Self::check_fd(rtcpd_fd)?;
        let pos = self
            .rtcpd_conns
            .iter()
            .position(|c| c.rtcpd_sock.raw_fd() == rtcpd_fd)
            .ok_or_else(|| {
                CatalogueError::NoEntry(format!(
                    "no rtcpd disk/tape-IO control connection with descriptor {}",
                    rtcpd_fd
                ))
            })?;
        if self.rtcpd_conns[pos].client_sock.is_some() {
            return Err(CatalogueError::ClientStillPending(format!(
                "control connection {} still has an associated client connection",
                rtcpd_fd
            )));
        }
        debug!(rtcpd_fd, "releasing rtcpd disk/tape-IO control connection");
        Ok(self.rtcpd_conns.remove(pos).rtcpd_sock)
    }

    /// Looks up the control connection a client connection is answering
    /// for.
    pub fn get_rtcpd_conn(&self, client_fd: RawFd) -> Result<PendingRequest<'_>, CatalogueError> {
        Self::check_fd(client_fd)?;
        self.rtcpd_conns
            .iter()
            .find(|c| c.client_sock.as_ref().map(|s| s.raw_fd()) == Some(client_fd))
            .map(|c| PendingRequest {
                rtcpd_fd: c.rtcpd_sock.raw_fd(),
                req_magic: c.rtcpd_req_magic,
                req_type: c.rtcpd_req_type,
                tape_path: c.rtcpd_req_tape_path.as_deref(),
                status: c.status,
                aggregator_tx_id: c.aggregator_tx_id,
            })
            .ok_or_else(|| {
                CatalogueError::NoEntry(format!(
                    "no control connection has client descriptor {}",
                    client_fd
                ))
            })
    }

    /// Number of still-open mover control connections. Reaching zero is the
    /// session's trigger for the final end-of-session message on the
    /// initial connection.
    pub fn rtcpd_conn_count(&self) -> usize {
        self.rtcpd_conns.len()
    }

    pub fn listen_fd(&self) -> Option<RawFd> {
        self.listen_fd
    }

    pub fn initial_rtcpd_fd(&self) -> Option<RawFd> {
        self.initial_rtcpd_fd
    }

    /// Clears and repopulates a readiness-poll set from every currently
    /// registered socket, returning it along with the maximum descriptor
    /// value the poll call needs.
    pub fn build_read_fd_set(&self) -> (FdSet, Option<RawFd>) {
        let mut set = FdSet::new();
        if let Some(fd) = self.listen_fd {
            set.insert(fd);
        }
        if let Some(fd) = self.initial_rtcpd_fd {
            set.insert(fd);
        }
        if let Some(sock) = &self.migration_report_sock {
            set.insert(sock.raw_fd());
        }
        for conn in &self.rtcpd_conns {
            set.insert(conn.rtcpd_sock.raw_fd());
            if let Some(client) = &conn.client_sock {
                set.insert(client.raw_fd());
            }
        }
        let max_fd = set.max_fd();
        (set, max_fd)
    }

    /// Given the result of a readiness poll, returns the first ready
    /// descriptor in fixed priority order: listen socket, initial
    /// connection, migration-report connection, then each control
    /// connection and its client. The ordering keeps control-plane events
    /// from starving behind data-plane volume.
    pub fn get_a_pending_socket(&self, ready: &FdSet) -> Option<(RawFd, PendingSocketKind)> {
        if let Some(fd) = self.listen_fd {
            if ready.contains(fd) {
                return Some((fd, PendingSocketKind::Listen));
            }
        }
        if let Some(fd) = self.initial_rtcpd_fd {
            if ready.contains(fd) {
                return Some((fd, PendingSocketKind::InitialRtcpd));
            }
        }
        if let Some(sock) = &self.migration_report_sock {
            let fd = sock.raw_fd();
            if ready.contains(fd) {
                return Some((fd, PendingSocketKind::ClientMigrationReport));
            }
        }
        for conn in &self.rtcpd_conns {
            let fd = conn.rtcpd_sock.raw_fd();
            if ready.contains(fd) {
                return Some((fd, PendingSocketKind::RtcpdDiskTapeIOControl));
            }
            if let Some(client) = &conn.client_sock {
                let fd = client.raw_fd();
                if ready.contains(fd) {
                    return Some((fd, PendingSocketKind::Client));
                }
            }
        }
        None
    }

    /// Checks the oldest outstanding client request against the timeout.
    /// Inspecting only the head of the strictly-ordered history bounds the
    /// worst-case detection latency for any single stuck peer.
    pub fn check_for_timeout(&self) -> Result<(), CatalogueError> {
        if let Some(oldest) = self.client_req_history.front() {
            let age = Instant::now().saturating_duration_since(oldest.timestamp);
            if age > self.client_req_timeout {
                warn!(fd = oldest.client_fd, ?age, "client request timed out");
                return Err(CatalogueError::Timeout {
                    fd: oldest.client_fd,
                    age,
                });
            }
        }
        Ok(())
    }

    pub fn client_req_history_len(&self) -> usize {
        self.client_req_history.len()
    }

    /// Read-only walk over every socket the catalogue owns (control
    /// connections, their clients, the migration-report socket). The event
    /// loop uses this to arm readiness futures; the listen and initial
    /// sockets are the caller's and are not included.
    pub fn owned_sockets(&self) -> impl Iterator<Item = &S> {
        self.migration_report_sock
            .iter()
            .chain(self.rtcpd_conns.iter().flat_map(|c| {
                std::iter::once(&c.rtcpd_sock).chain(c.client_sock.iter())
            }))
    }
}

impl<S: CatalogueSocket> Default for SocketCatalogue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: CatalogueSocket> Drop for SocketCatalogue<S> {
    /// Dropping the catalogue closes exactly the connections it still owns:
    /// every control connection, their associated clients, and the
    /// migration-report socket. The listen and initial sockets are only
    /// registered by descriptor and stay open.
    fn drop(&mut self) {
        let pending_clients = self
            .rtcpd_conns
            .iter()
            .filter(|c| c.client_sock.is_some())
            .count();
        if !self.rtcpd_conns.is_empty() || self.migration_report_sock.is_some() {
            debug!(
                control_conns = self.rtcpd_conns.len(),
                pending_clients,
                migration_report = self.migration_report_sock.is_some(),
                "closing connections still owned by the catalogue"
            );
        }
    }
}
