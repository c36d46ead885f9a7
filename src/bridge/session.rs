//! The per-session readiness loop.
//!
//! One task owns a catalogue and turns the crank: build the read set from
//! every registered socket, wait for the first one to become readable (or
//! for a new connection on the listen socket, or for the oldest client
//! request to exceed its timeout), and hand the caller a dispatchable
//! event. The dispatch priority is the catalogue's fixed order, which keeps
//! control-plane events from starving behind data-plane volume.

use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::bridge::catalogue::{
    CatalogueError, CatalogueSocket, FdSet, PendingSocketKind, SocketCatalogue,
};

/// What the readiness wait produced.
#[derive(Debug)]
pub enum SessionEvent {
    /// A new connection arrived on the listen socket. The caller decides
    /// whether it becomes a control connection and registers it.
    NewConnection(TcpStream),
    /// A registered socket has data to read, tagged with its semantic
    /// category.
    Readable(std::os::unix::io::RawFd, PendingSocketKind),
    /// Nothing happened within the poll bound.
    Idle,
}

/// Waits for the next session event, never longer than `poll_timeout`.
///
/// The timeout check runs first: a stuck client is reported before any
/// amount of unrelated traffic is served.
pub async fn next_event(
    catalogue: &SocketCatalogue<TcpStream>,
    listener: &TcpListener,
    initial_conn: &TcpStream,
    poll_timeout: Duration,
) -> Result<SessionEvent, CatalogueError> {
    catalogue.check_for_timeout()?;

    let mut readiness: Vec<(
        std::os::unix::io::RawFd,
        Pin<Box<dyn Future<Output = io::Result<Ready>> + Send + '_>>,
    )> = Vec::new();
    if let Some(fd) = catalogue.initial_rtcpd_fd() {
        readiness.push((fd, Box::pin(initial_conn.ready(Interest::READABLE))));
    }
    for sock in catalogue.owned_sockets() {
        readiness.push((sock.raw_fd(), Box::pin(sock.ready(Interest::READABLE))));
    }

    enum Wakeup {
        Accepted(io::Result<(TcpStream, std::net::SocketAddr)>),
        ReadySet(FdSet),
    }

    let listen_registered = catalogue.listen_fd().is_some();
    let wakeup = timeout(
        poll_timeout,
        poll_fn(|cx| {
            if listen_registered {
                if let Poll::Ready(r) = listener.poll_accept(cx) {
                    return Poll::Ready(Wakeup::Accepted(r));
                }
            }
            let mut ready_set = FdSet::new();
            for (fd, fut) in readiness.iter_mut() {
                // an errored socket counts as ready: the handler's read will
                // surface the error
                if fut.as_mut().poll(cx).is_ready() {
                    ready_set.insert(*fd);
                }
            }
            if ready_set.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(Wakeup::ReadySet(ready_set))
            }
        }),
    )
    .await;

    match wakeup {
        Err(_) => Ok(SessionEvent::Idle),
        Ok(Wakeup::Accepted(Ok((stream, peer_addr)))) => {
            debug!(%peer_addr, "accepted connection");
            Ok(SessionEvent::NewConnection(stream))
        }
        Ok(Wakeup::Accepted(Err(e))) => Err(CatalogueError::InvalidArgument(format!(
            "accept failed on the listen socket: {}",
            e
        ))),
        Ok(Wakeup::ReadySet(ready)) => {
            match catalogue.get_a_pending_socket(&ready) {
                Some((fd, kind)) => {
                    debug!(fd, ?kind, "socket ready");
                    Ok(SessionEvent::Readable(fd, kind))
                }
                // a socket turned ready and vanished from the catalogue in
                // between; treat as an idle turn of the crank
                None => Ok(SessionEvent::Idle),
            }
        }
    }
}
