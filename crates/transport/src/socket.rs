//! TCP socket setup and the cross-thread abort handle.
//!
//! The SSH layer owns the tokio stream, so cancellation keeps a duplicated
//! descriptor of the same socket. Shutting that duplicate down tears the
//! connection out from under any pending read or write immediately.

use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::error::{Result, TransportError};
use crate::target::ConnectTarget;

/// Send buffer size. Kept small so keystrokes are not queued behind bulk data.
pub const SEND_BUFFER_SIZE: u32 = 32 * 1024;

/// Receive buffer size. Larger so bulk output (e.g. `cat` of a log) streams.
pub const RECV_BUFFER_SIZE: u32 = 256 * 1024;

/// Take-and-close handle to a connected socket.
///
/// Cloning shares the same slot; whichever clone closes first wins and all
/// later calls are no-ops, so abort and graceful teardown can race safely.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    socket: Arc<Mutex<Option<StdTcpStream>>>,
}

impl AbortHandle {
    fn new(socket: StdTcpStream) -> Self {
        Self {
            socket: Arc::new(Mutex::new(Some(socket))),
        }
    }

    /// A handle with nothing to close.
    pub fn detached() -> Self {
        Self {
            socket: Arc::new(Mutex::new(None)),
        }
    }

    /// Shuts the socket down in both directions and releases the descriptor.
    ///
    /// Returns true if this call performed the close.
    pub fn close(&self) -> bool {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match socket {
            Some(socket) => {
                if let Err(e) = socket.shutdown(Shutdown::Both) {
                    // NotConnected just means the peer got there first.
                    if e.kind() != std::io::ErrorKind::NotConnected {
                        tracing::debug!(error = %e, "Socket shutdown failed");
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Returns true once the socket has been closed through any clone.
    pub fn is_closed(&self) -> bool {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Resolves `target` and connects a socket tuned for interactive use.
///
/// Nagle is disabled and the buffers are sized asymmetrically. SIGPIPE
/// needs no per-socket handling: the Rust runtime ignores it at startup
/// and a write to a dead peer surfaces as `EPIPE` instead.
pub async fn connect_socket(target: &ConnectTarget) -> Result<(TcpStream, AbortHandle)> {
    let addrs: Vec<SocketAddr> = lookup_host(target.address())
        .await
        .map_err(|e| {
            TransportError::ConnectionFailed(format!("failed to resolve {}: {}", target.host, e))
        })?
        .collect();

    if addrs.is_empty() {
        return Err(TransportError::ConnectionFailed(format!(
            "no addresses for {}",
            target.host
        )));
    }

    let mut last_error = None;
    for addr in addrs {
        match connect_addr(addr).await {
            Ok(stream) => {
                tracing::debug!(%addr, "TCP connection established");
                return into_abortable(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "TCP connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(TransportError::ConnectionFailed(match last_error {
        Some(e) => e.to_string(),
        None => "connection refused".to_string(),
    }))
}

async fn connect_addr(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
    socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Splits off a duplicate descriptor for the abort handle.
fn into_abortable(stream: TcpStream) -> Result<(TcpStream, AbortHandle)> {
    let std_stream = stream.into_std()?;
    let duplicate = std_stream.try_clone()?;
    std_stream.set_nonblocking(true)?;
    let stream = TcpStream::from_std(std_stream)?;
    Ok((stream, AbortHandle::new(duplicate)))
}
