//! One physical SSH connection and the shells running over it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use russh::client::{self, Handle};
use russh::keys::{ssh_key, HashAlg};
use russh::Disconnect;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::authenticate;
use crate::error::{Result, TransportError};
use crate::flush::{FlushPolicy, ReadBatcher};
use crate::shell::{
    await_reply, collect_exec, ExecOutput, ShellCommand, ShellEvent, ShellId, ShellLoop,
    ShellStream, OUTPUT_CHANNEL_CAPACITY,
};
use crate::socket::{connect_socket, AbortHandle};
use crate::target::{ConnectOptions, ConnectTarget, Credentials, HostKeyPolicy, PtySize};

/// How long a shell task gets to wind down before it is abandoned.
const SHELL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on waiting for the server to answer a PTY or shell request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// russh callbacks for one connection.
pub struct ClientHandler {
    policy: HostKeyPolicy,
    fingerprint: Arc<Mutex<Option<String>>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        *self
            .fingerprint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(fingerprint.clone());

        let accepted = self.policy.accepts(&fingerprint);
        if let HostKeyPolicy::Fingerprint(expected) = &self.policy {
            if !accepted {
                tracing::warn!(
                    expected = %expected,
                    received = %fingerprint,
                    "Server host key does not match pinned fingerprint"
                );
            }
        }
        Ok(accepted)
    }
}

/// Bookkeeping for one running shell.
struct ShellTask {
    commands: mpsc::UnboundedSender<ShellCommand>,
    task: JoinHandle<()>,
}

/// An authenticated SSH connection.
///
/// All methods take `&self`; the session is meant to be shared behind an
/// `Arc`. [`TransportSession::abort`] may be called from anywhere at any
/// time; everything else is ordinary async teardown.
pub struct TransportSession {
    target: ConnectTarget,
    handle: tokio::sync::Mutex<Option<Handle<ClientHandler>>>,
    abort: AbortHandle,
    /// Parent of every shell task's token.
    cancel: CancellationToken,
    /// One-shot teardown guard.
    cleaned: AtomicBool,
    shells: Mutex<HashMap<ShellId, ShellTask>>,
    server_fingerprint: Option<String>,
    term: String,
    flush_policy: FlushPolicy,
}

impl TransportSession {
    /// Connects and authenticates. Never retries.
    pub async fn connect(
        target: &ConnectTarget,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let timeout = options.connect_timeout;
        tracing::info!(target = %target, "Connecting");

        let (stream, abort) = tokio::time::timeout(timeout, connect_socket(target))
            .await
            .map_err(|_| TransportError::ConnectionFailed("timed out".to_string()))??;

        let fingerprint = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            policy: options.host_key.clone(),
            fingerprint: Arc::clone(&fingerprint),
        };
        let config = Arc::new(client::Config::default());

        let handshake =
            tokio::time::timeout(timeout, client::connect_stream(config, stream, handler)).await;
        let mut handle = match handshake {
            Ok(Ok(handle)) => handle,
            Ok(Err(russh::Error::UnknownKey)) => {
                abort.close();
                return Err(TransportError::ConnectionFailed(
                    "host key mismatch".to_string(),
                ));
            }
            Ok(Err(e)) => {
                abort.close();
                return Err(TransportError::ConnectionFailed(format!(
                    "handshake failed: {}",
                    e
                )));
            }
            Err(_) => {
                abort.close();
                return Err(TransportError::ConnectionFailed("timed out".to_string()));
            }
        };

        if let Err(e) = authenticate(&mut handle, target, credentials, options).await {
            abort.close();
            return Err(e);
        }

        let server_fingerprint = fingerprint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!(
            target = %target,
            fingerprint = server_fingerprint.as_deref().unwrap_or("unknown"),
            "Connected"
        );

        Ok(Self {
            target: target.clone(),
            handle: tokio::sync::Mutex::new(Some(handle)),
            abort,
            cancel: CancellationToken::new(),
            cleaned: AtomicBool::new(false),
            shells: Mutex::new(HashMap::new()),
            server_fingerprint,
            term: options.term.clone(),
            flush_policy: FlushPolicy::default(),
        })
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    /// SHA-256 fingerprint of the server host key seen during the handshake.
    pub fn server_fingerprint(&self) -> Option<&str> {
        self.server_fingerprint.as_deref()
    }

    /// True until the connection is aborted or torn down.
    pub fn is_connected(&self) -> bool {
        !self.cleaned.load(Ordering::SeqCst) && !self.abort.is_closed()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    async fn open_channel(&self) -> Result<russh::Channel<client::Msg>> {
        self.ensure_connected()?;
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or(TransportError::NotConnected)?;
        handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::ChannelOpenFailed(e.to_string()))
    }

    /// Opens a channel, requests a PTY and starts the login shell.
    pub async fn start_shell(&self, size: PtySize) -> Result<ShellStream> {
        let mut channel = self.open_channel().await?;
        let mut early_output = Vec::new();

        channel
            .request_pty(
                true,
                &self.term,
                u32::from(size.cols),
                u32::from(size.rows),
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| TransportError::ShellRequestFailed(format!("pty: {}", e)))?;
        with_request_timeout(await_reply(&mut channel, &mut early_output, "pty")).await?;

        channel
            .request_shell(true)
            .await
            .map_err(|e| TransportError::ShellRequestFailed(format!("shell: {}", e)))?;
        with_request_timeout(await_reply(&mut channel, &mut early_output, "shell")).await?;

        let id = ShellId::next();
        let (events_tx, events_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shell = ShellLoop::new(
            id,
            channel,
            commands_rx,
            events_tx,
            self.cancel.child_token(),
            ReadBatcher::new(self.flush_policy),
        );
        let task = tokio::spawn(shell.run(early_output));

        self.shells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ShellTask {
                    commands: commands_tx,
                    task,
                },
            );

        tracing::info!(
            target = %self.target,
            shell = %id,
            cols = size.cols,
            rows = size.rows,
            "Shell started"
        );
        Ok(ShellStream::new(id, events_rx))
    }

    /// Runs `command` on a fresh channel of this connection.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::ShellRequestFailed(format!("exec: {}", e)))?;
        let output = collect_exec(&mut channel).await?;
        tracing::debug!(
            target = %self.target,
            exit_status = ?output.exit_status,
            "Exec finished"
        );
        Ok(output)
    }

    fn send_command(&self, shell: ShellId, command: ShellCommand) -> Result<()> {
        self.ensure_connected()?;
        let shells = self.shells.lock().unwrap_or_else(PoisonError::into_inner);
        let task = shells.get(&shell).ok_or(TransportError::NotConnected)?;
        task.commands
            .send(command)
            .map_err(|_| TransportError::NotConnected)
    }

    /// Queues `data` for the shell without waiting for it to be sent.
    ///
    /// Queued writes and [`TransportSession::write`] share one FIFO queue.
    pub fn queue_write(&self, shell: ShellId, data: Bytes) -> Result<()> {
        self.send_command(shell, ShellCommand::Write { data, reply: None })
    }

    /// Writes `data` to the shell and waits until the channel accepted all of it.
    pub async fn write(&self, shell: ShellId, data: Bytes) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.send_command(
            shell,
            ShellCommand::Write {
                data,
                reply: Some(reply),
            },
        )?;
        done.await.map_err(|_| TransportError::NotConnected)?
    }

    /// Best-effort terminal resize. Failures are logged, never returned.
    pub fn resize(&self, shell: ShellId, size: PtySize) {
        if let Err(e) = self.send_command(shell, ShellCommand::Resize(size)) {
            tracing::debug!(shell = %shell, error = %e, "Resize skipped");
        }
    }

    /// Closes one shell channel; the connection stays up.
    pub async fn close_shell(&self, shell: ShellId) {
        let task = self
            .shells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&shell);
        let Some(task) = task else {
            return;
        };
        let _ = task.commands.send(ShellCommand::Close);
        let abort = task.task.abort_handle();
        if tokio::time::timeout(SHELL_SHUTDOWN_TIMEOUT, task.task).await.is_err() {
            tracing::warn!(shell = %shell, "Shell task did not stop in time, aborting");
            abort.abort();
        }
    }

    /// Number of shells opened on this connection that have not been closed.
    pub fn shell_count(&self) -> usize {
        self.shells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sends an SSH keepalive request.
    pub async fn send_keepalive(&self) -> Result<()> {
        self.ensure_connected()?;
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or(TransportError::NotConnected)?;
        handle
            .send_keepalive(true)
            .await
            .map_err(|e| TransportError::SocketError(e.to_string()))
    }

    /// Kills the connection immediately from any thread or task.
    ///
    /// Pending reads and writes on every shell fail at once; shell streams
    /// end with [`crate::ShellExit::Cancelled`] or `ConnectionLost`.
    pub fn abort(&self) {
        self.cancel.cancel();
        if self.abort.close() {
            tracing::info!(target = %self.target, "Connection aborted");
        }
    }

    /// Graceful, idempotent teardown.
    ///
    /// Ends every shell stream, waits briefly for the shell tasks, sends an
    /// SSH disconnect if the socket is still up, and closes the socket.
    /// Returns true if this call did the work.
    pub async fn disconnect(&self) -> bool {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.cancel.cancel();

        let tasks: Vec<(ShellId, ShellTask)> = self
            .shells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, shell) in tasks {
            let abort = shell.task.abort_handle();
            if tokio::time::timeout(SHELL_SHUTDOWN_TIMEOUT, shell.task)
                .await
                .is_err()
            {
                tracing::warn!(shell = %id, "Shell task did not stop in time, aborting");
                abort.abort();
            }
        }

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if !self.abort.is_closed() {
                if let Err(e) = handle
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await
                {
                    tracing::debug!(error = %e, "SSH disconnect message failed");
                }
            }
        }

        self.abort.close();
        tracing::info!(target = %self.target, "Disconnected");
        true
    }

    #[cfg(test)]
    pub(crate) fn detached(target: ConnectTarget, abort: AbortHandle) -> Self {
        Self {
            target,
            handle: tokio::sync::Mutex::new(None),
            abort,
            cancel: CancellationToken::new(),
            cleaned: AtomicBool::new(false),
            shells: Mutex::new(HashMap::new()),
            server_fingerprint: None,
            term: crate::target::DEFAULT_TERM.to_string(),
            flush_policy: FlushPolicy::default(),
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if !*self.cleaned.get_mut() {
            self.cancel.cancel();
            self.abort.close();
        }
    }
}

async fn with_request_timeout<F>(request: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::time::timeout(REQUEST_TIMEOUT, request)
        .await
        .map_err(|_| TransportError::ShellRequestFailed("request timed out".to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::connect_socket;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn detached_session() -> (TransportSession, tokio::net::TcpStream, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = ConnectTarget::new("127.0.0.1", "test").with_port(port);
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let (stream, abort) = connect_socket(&target).await.unwrap();
        let peer = accept.await.unwrap();
        (TransportSession::detached(target, abort), stream, peer)
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (session, _stream, mut peer) = detached_session().await;
        assert!(session.is_connected());

        assert!(session.disconnect().await);
        assert!(!session.disconnect().await);
        assert!(!session.is_connected());

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "peer should observe the close");
    }

    #[tokio::test]
    async fn test_abort_then_disconnect() {
        let (session, _stream, _peer) = detached_session().await;
        session.abort();
        assert!(!session.is_connected());
        // Teardown after abort still runs exactly once.
        assert!(session.disconnect().await);
        assert!(!session.disconnect().await);
    }

    #[tokio::test]
    async fn test_operations_after_disconnect_fail() {
        let (session, _stream, _peer) = detached_session().await;
        session.disconnect().await;

        let shell = ShellId::next();
        assert_eq!(
            session.queue_write(shell, Bytes::from_static(b"ls\n")),
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            session.start_shell(PtySize::default()).await.err(),
            Some(TransportError::NotConnected)
        );
        assert_eq!(session.send_keepalive().await, Err(TransportError::NotConnected));
        // Resize is best-effort and silent.
        session.resize(shell, PtySize::new(100, 40));
    }

    #[tokio::test]
    async fn test_unknown_shell_is_not_connected() {
        let (session, _stream, _peer) = detached_session().await;
        let result = session.write(ShellId::next(), Bytes::from_static(b"x")).await;
        assert_eq!(result, Err(TransportError::NotConnected));
        assert_eq!(session.shell_count(), 0);
        session.close_shell(ShellId::next()).await;
    }
}
