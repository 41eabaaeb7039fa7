//! Lifecycle wrapper around [`TransportSession`].
//!
//! A client is created cheaply and unconnected, so it can be claimed
//! before any network I/O happens. It adds keepalive scheduling and an
//! abort flag that is effective immediately, even while `connect` is
//! still in flight.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};
use crate::session::TransportSession;
use crate::shell::{ExecOutput, ShellId, ShellStream};
use crate::target::{ConnectOptions, ConnectTarget, Credentials, PtySize};

/// Default interval between keepalive requests.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of consecutive keepalive failures before aborting.
pub const DEFAULT_KEEPALIVE_MAX_FAILURES: u32 = 3;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Keepalive schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// `None` disables keepalives.
    pub interval: Option<Duration>,
    pub max_failures: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            max_failures: DEFAULT_KEEPALIVE_MAX_FAILURES,
        }
    }
}

/// A reconnectable handle to one SSH connection.
pub struct TransportClient {
    id: ClientId,
    target: ConnectTarget,
    credentials: Credentials,
    options: ConnectOptions,
    keepalive: KeepaliveConfig,
    session: Mutex<Option<Arc<TransportSession>>>,
    keepalive_cancel: Mutex<Option<CancellationToken>>,
    /// Abort flag; cancelling it also interrupts an in-flight connect.
    aborted: CancellationToken,
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl TransportClient {
    pub fn new(target: ConnectTarget, credentials: Credentials, options: ConnectOptions) -> Self {
        Self {
            id: ClientId::next(),
            target,
            credentials,
            options,
            keepalive: KeepaliveConfig::default(),
            session: Mutex::new(None),
            keepalive_cancel: Mutex::new(None),
            aborted: CancellationToken::new(),
        }
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    fn current(&self) -> Option<Arc<TransportSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn session(&self) -> Result<Arc<TransportSession>> {
        if self.is_aborted() {
            return Err(TransportError::NotConnected);
        }
        self.current()
            .filter(|session| session.is_connected())
            .ok_or(TransportError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_ok()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_cancelled()
    }

    /// Host key fingerprint of the live connection.
    pub fn server_fingerprint(&self) -> Option<String> {
        self.current()
            .and_then(|session| session.server_fingerprint().map(str::to_string))
    }

    /// Connects if not already connected. A no-op on a live connection.
    pub async fn connect(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(TransportError::ConnectionFailed("aborted".to_string()));
        }
        if self.is_connected() {
            return Ok(());
        }

        // Dropping the connect future on abort drops its socket with it.
        let session = tokio::select! {
            result = TransportSession::connect(&self.target, &self.credentials, &self.options) => {
                Arc::new(result?)
            }
            _ = self.aborted.cancelled() => {
                return Err(TransportError::ConnectionFailed("aborted".to_string()));
            }
        };

        // abort() may have fired while we were connecting.
        if self.is_aborted() {
            session.abort();
            return Err(TransportError::ConnectionFailed("aborted".to_string()));
        }

        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&session));
        if let Some(previous) = previous {
            previous.abort();
        }

        self.start_keepalive(session);
        Ok(())
    }

    fn start_keepalive(&self, session: Arc<TransportSession>) {
        let Some(interval) = self.keepalive.interval else {
            return;
        };
        let cancel = CancellationToken::new();
        if let Some(previous) = self
            .keepalive_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel.clone())
        {
            previous.cancel();
        }

        let max_failures = self.keepalive.max_failures.max(1);
        let client_id = self.id;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !session.is_connected() {
                    break;
                }
                match session.send_keepalive().await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(
                            client = %client_id,
                            failures,
                            error = %e,
                            "Keepalive failed"
                        );
                        if failures >= max_failures {
                            tracing::warn!(client = %client_id, "Keepalive limit reached, aborting connection");
                            session.abort();
                            break;
                        }
                    }
                }
            }
        });
    }

    fn stop_keepalive(&self) {
        if let Some(cancel) = self
            .keepalive_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }

    pub async fn start_shell(&self, size: PtySize) -> Result<ShellStream> {
        self.session()?.start_shell(size).await
    }

    pub async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.session()?.exec(command).await
    }

    /// Non-blocking, FIFO-ordered write.
    pub fn queue_write(&self, shell: ShellId, data: Bytes) -> Result<()> {
        self.session()?.queue_write(shell, data)
    }

    pub async fn write(&self, shell: ShellId, data: Bytes) -> Result<()> {
        self.session()?.write(shell, data).await
    }

    pub fn resize(&self, shell: ShellId, size: PtySize) {
        if let Some(session) = self.current() {
            session.resize(shell, size);
        }
    }

    pub async fn close_shell(&self, shell: ShellId) {
        if let Some(session) = self.current() {
            session.close_shell(shell).await;
        }
    }

    /// Sets the abort flag and kills the socket. Safe from any context.
    ///
    /// The client stays unusable afterwards; reconnecting needs a new client.
    pub fn abort(&self) {
        self.aborted.cancel();
        self.stop_keepalive();
        if let Some(session) = self.current() {
            session.abort();
        }
    }

    /// Graceful teardown of the current connection. Idempotent.
    pub async fn disconnect(&self) {
        self.stop_keepalive();
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.disconnect().await;
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        // The keepalive task holds the session; stopping it lets the
        // session drop and close its socket.
        self.stop_keepalive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn client_for(port: u16) -> Arc<TransportClient> {
        Arc::new(TransportClient::new(
            ConnectTarget::new("127.0.0.1", "test").with_port(port),
            Credentials::Password("pw".to_string()),
            ConnectOptions::default().with_connect_timeout(Duration::from_millis(500)),
        ))
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = client_for(22);
        let b = client_for(22);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_unconnected_client_rejects_io() {
        let client = client_for(22);
        assert!(!client.is_connected());
        assert_eq!(
            client.queue_write(ShellId::next(), Bytes::from_static(b"x")),
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            client.exec("true").await.err(),
            Some(TransportError::NotConnected)
        );
        assert!(client.server_fingerprint().is_none());
        // Idempotent on a client that never connected.
        client.disconnect().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = client_for(port);
        let result = client.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_handshake_with_non_ssh_server_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });

        let client = client_for(port);
        let result = client.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_aborted_client_refuses_connect() {
        let client = client_for(22);
        client.abort();
        assert!(client.is_aborted());
        assert_eq!(
            client.connect().await,
            Err(TransportError::ConnectionFailed("aborted".to_string()))
        );
    }
}
