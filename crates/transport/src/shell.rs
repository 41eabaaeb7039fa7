//! Remote shell channels.
//!
//! Every open shell is driven by one task that owns the russh channel. The
//! task multiplexes three inputs: commands from the owner (write, resize,
//! close), messages from the server, and the flush deadline of the output
//! batcher. Writes are processed strictly in queue order; output is
//! delivered in arrival order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::FutureExt;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};
use crate::flush::ReadBatcher;
use crate::target::PtySize;

/// Capacity of the output channel handed to the shell's consumer.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Largest slice handed to the channel in one write call.
const WRITE_CHUNK_SIZE: usize = 32 * 1024;

/// A write that cannot make progress for this long is treated as dead.
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on messages drained per wakeup.
const MAX_DRAIN: usize = 64;

/// Stop draining once this much output is pending.
const MAX_DRAIN_BYTES: usize = 64 * 1024;

static NEXT_SHELL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of one remote shell channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShellId(u64);

impl ShellId {
    /// Allocates a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_SHELL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ShellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shell-{}", self.0)
    }
}

/// Why a shell stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellExit {
    /// Server closed the channel without reporting a status.
    Eof,
    /// Remote process exited with this status.
    ExitStatus(u32),
    /// Closed from our side (close, disconnect, abort, consumer gone).
    Cancelled,
    /// The connection dropped underneath the channel.
    ConnectionLost(String),
}

impl ShellExit {
    /// Returns true if the remote end went away unexpectedly.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, ShellExit::ConnectionLost(_))
    }
}

/// Item of a shell's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Output(Bytes),
    /// Always the last event of a stream.
    Exit(ShellExit),
}

/// Consumer side of a running shell.
#[derive(Debug)]
pub struct ShellStream {
    id: ShellId,
    events: mpsc::Receiver<ShellEvent>,
}

impl ShellStream {
    /// Wraps an event receiver. Used by the transport itself and by
    /// alternative shell providers.
    pub fn new(id: ShellId, events: mpsc::Receiver<ShellEvent>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> ShellId {
        self.id
    }

    /// Next output chunk or the exit reason; `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<ShellEvent> {
        self.events.recv().await
    }
}

/// Output of a one-shot remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Requests accepted by a shell task.
#[derive(Debug)]
pub(crate) enum ShellCommand {
    Write {
        data: Bytes,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Resize(PtySize),
    Close,
}

/// Waits for the reply to a `want_reply` request, keeping any output that
/// arrives first.
pub(crate) async fn await_reply(
    channel: &mut Channel<Msg>,
    early_output: &mut Vec<u8>,
    what: &str,
) -> Result<()> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(TransportError::ShellRequestFailed(format!(
                    "{} request refused",
                    what
                )))
            }
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                early_output.extend_from_slice(&data);
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(TransportError::ShellRequestFailed(format!(
                    "channel closed during {} request",
                    what
                )))
            }
            Some(_) => {}
        }
    }
}

/// Runs a command on `channel` to completion and collects its output.
pub(crate) async fn collect_exec(channel: &mut Channel<Msg>) -> Result<ExecOutput> {
    let mut output = ExecOutput::default();
    let mut confirmed = false;
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => confirmed = true,
            Some(ChannelMsg::Failure) if !confirmed => {
                return Err(TransportError::ShellRequestFailed(
                    "exec request refused".to_string(),
                ))
            }
            Some(ChannelMsg::Data { data }) => output.stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, .. }) => output.stderr.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status }) => output.exit_status = Some(exit_status),
            Some(ChannelMsg::Close) | None => return Ok(output),
            Some(_) => {}
        }
    }
}

/// State owned by one shell task.
pub(crate) struct ShellLoop {
    id: ShellId,
    channel: Channel<Msg>,
    commands: mpsc::UnboundedReceiver<ShellCommand>,
    output: mpsc::Sender<ShellEvent>,
    cancel: CancellationToken,
    batcher: ReadBatcher,
    exit_status: Option<u32>,
    eof: bool,
}

impl ShellLoop {
    pub fn new(
        id: ShellId,
        channel: Channel<Msg>,
        commands: mpsc::UnboundedReceiver<ShellCommand>,
        output: mpsc::Sender<ShellEvent>,
        cancel: CancellationToken,
        batcher: ReadBatcher,
    ) -> Self {
        Self {
            id,
            channel,
            commands,
            output,
            cancel,
            batcher,
            exit_status: None,
            eof: false,
        }
    }

    pub async fn run(mut self, early_output: Vec<u8>) {
        self.batcher.push(&early_output, Instant::now());

        let exit = loop {
            let deadline = self
                .batcher
                .deadline(Instant::now())
                .map(tokio::time::Instant::from_std);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break ShellExit::Cancelled,
                command = self.commands.recv() => match command {
                    Some(ShellCommand::Write { data, reply }) => {
                        let result = self.write_all(&data).await;
                        if let Err(e) = &result {
                            tracing::warn!(shell = %self.id, error = %e, "Shell write failed");
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Some(ShellCommand::Resize(size)) => self.resize(size).await,
                    Some(ShellCommand::Close) | None => break ShellExit::Cancelled,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() =>
                {
                    if !self.flush().await {
                        break ShellExit::Cancelled;
                    }
                }
                message = self.channel.wait() => {
                    if let Some(exit) = self.absorb(message).or_else(|| self.drain()) {
                        break exit;
                    }
                    let now = Instant::now();
                    if (self.eof || self.batcher.flush_on_idle(now)) && !self.flush().await {
                        break ShellExit::Cancelled;
                    }
                }
            }
        };

        if exit == ShellExit::Cancelled {
            if let Err(e) = self.channel.close().await {
                tracing::trace!(shell = %self.id, error = %e, "Channel close after cancel failed");
            }
        }

        self.flush().await;
        tracing::debug!(shell = %self.id, exit = ?exit, "Shell loop finished");
        let _ = self.output.send(ShellEvent::Exit(exit)).await;
    }

    /// Folds one server message into the loop state; returns the exit
    /// reason once the channel is finished.
    fn absorb(&mut self, message: Option<ChannelMsg>) -> Option<ShellExit> {
        match message {
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                self.batcher.push(&data, Instant::now());
                None
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                self.exit_status = Some(exit_status);
                None
            }
            Some(ChannelMsg::Eof) => {
                self.eof = true;
                None
            }
            Some(ChannelMsg::Close) => Some(self.clean_exit()),
            Some(_) => None,
            None if self.eof || self.exit_status.is_some() => Some(self.clean_exit()),
            None => Some(ShellExit::ConnectionLost(
                "channel closed unexpectedly".to_string(),
            )),
        }
    }

    /// Consumes messages that are already queued without waiting.
    fn drain(&mut self) -> Option<ShellExit> {
        for _ in 0..MAX_DRAIN {
            if self.batcher.len() >= MAX_DRAIN_BYTES {
                break;
            }
            // `None` here means the next wait would block.
            let message = self.channel.wait().now_or_never()?;
            if let Some(exit) = self.absorb(message) {
                return Some(exit);
            }
        }
        None
    }

    fn clean_exit(&self) -> ShellExit {
        match self.exit_status {
            Some(code) => ShellExit::ExitStatus(code),
            None => ShellExit::Eof,
        }
    }

    /// Hands the pending batch to the consumer. Returns false if the
    /// consumer is gone or the loop was cancelled while waiting.
    async fn flush(&mut self) -> bool {
        let Some(bytes) = self.batcher.take() else {
            return true;
        };
        tokio::select! {
            sent = self.output.send(ShellEvent::Output(bytes)) => sent.is_ok(),
            _ = self.cancel.cancelled() => false,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(WRITE_CHUNK_SIZE) {
            match tokio::time::timeout(WRITE_STALL_TIMEOUT, self.channel.data(chunk)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(TransportError::SocketError(e.to_string())),
                Err(_) => {
                    return Err(TransportError::SocketError(
                        "write stalled".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    async fn resize(&mut self, size: PtySize) {
        if let Err(e) = self
            .channel
            .window_change(u32::from(size.cols), u32::from(size.rows), 0, 0)
            .await
        {
            tracing::warn!(shell = %self.id, error = %e, "Window change failed");
        } else {
            tracing::trace!(shell = %self.id, cols = size.cols, rows = size.rows, "Resized shell");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_ids_are_unique() {
        let a = ShellId::next();
        let b = ShellId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
        assert!(a.to_string().starts_with("shell-"));
    }

    #[test]
    fn test_exit_classification() {
        assert!(ShellExit::ConnectionLost("reset".into()).is_unexpected());
        assert!(!ShellExit::Eof.is_unexpected());
        assert!(!ShellExit::ExitStatus(0).is_unexpected());
        assert!(!ShellExit::Cancelled.is_unexpected());
    }

    #[tokio::test]
    async fn test_shell_stream_yields_events_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let id = ShellId::next();
        let mut stream = ShellStream::new(id, rx);
        assert_eq!(stream.id(), id);

        tx.send(ShellEvent::Output(Bytes::from_static(b"one"))).await.unwrap();
        tx.send(ShellEvent::Output(Bytes::from_static(b"two"))).await.unwrap();
        tx.send(ShellEvent::Exit(ShellExit::Eof)).await.unwrap();
        drop(tx);

        assert_eq!(
            stream.recv().await,
            Some(ShellEvent::Output(Bytes::from_static(b"one")))
        );
        assert_eq!(
            stream.recv().await,
            Some(ShellEvent::Output(Bytes::from_static(b"two")))
        );
        assert_eq!(stream.recv().await, Some(ShellEvent::Exit(ShellExit::Eof)));
        assert_eq!(stream.recv().await, None);
    }

    #[test]
    fn test_exec_output_helpers() {
        let output = ExecOutput {
            stdout: b"installed\n".to_vec(),
            stderr: Vec::new(),
            exit_status: Some(0),
        };
        assert!(output.success());
        assert_eq!(output.stdout_lossy(), "installed\n");
        assert!(!ExecOutput::default().success());
    }
}
