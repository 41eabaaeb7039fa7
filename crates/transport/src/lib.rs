//! # VivyTerm SSH transport
//!
//! One authenticated SSH connection and the shells running over it.
//!
//! ## Overview
//!
//! - **Socket**: TCP connect tuned for interactive latency, with an
//!   [`AbortHandle`] that kills the socket from any context
//! - **Session**: handshake, authentication, shell and exec channels,
//!   idempotent teardown ([`TransportSession`])
//! - **Client**: cheap, unconnected-until-asked wrapper adding keepalive
//!   scheduling and an abort flag ([`TransportClient`])
//! - **Flush**: adaptive batching of shell output ([`ReadBatcher`])
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            TransportClient              │  keepalive, abort flag
//! ├─────────────────────────────────────────┤
//! │           TransportSession              │  auth, channels, cleanup
//! ├─────────────────────────────────────────┤
//! │     ShellLoop (one task per shell)      │  FIFO writes, batched reads
//! ├─────────────────────────────────────────┤
//! │        TCP socket + AbortHandle         │  nodelay, tuned buffers
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use transport::{ConnectOptions, ConnectTarget, Credentials, PtySize, ShellEvent, TransportClient};
//!
//! # async fn run() -> transport::Result<()> {
//! let target = ConnectTarget::parse("me@example.com:22").expect("valid target");
//! let client = Arc::new(TransportClient::new(
//!     target,
//!     Credentials::Password("secret".into()),
//!     ConnectOptions::default(),
//! ));
//! client.connect().await?;
//!
//! let mut shell = client.start_shell(PtySize::default()).await?;
//! client.queue_write(shell.id(), "uptime\n".into())?;
//! while let Some(event) = shell.recv().await {
//!     match event {
//!         ShellEvent::Output(bytes) => print!("{}", String::from_utf8_lossy(&bytes)),
//!         ShellEvent::Exit(reason) => println!("shell ended: {reason:?}"),
//!     }
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`target`]: connection inputs
//! - [`socket`]: socket setup and abort
//! - [`auth`]: password, keyboard-interactive and public key auth
//! - [`session`]: the connection itself
//! - [`shell`]: shell streams and the per-shell I/O task
//! - [`client`]: lifecycle wrapper
//! - [`flush`]: adaptive output batching
//! - [`error`]: error types

pub mod auth;
pub mod client;
pub mod error;
pub mod flush;
pub mod session;
pub mod shell;
pub mod socket;
pub mod target;

pub use client::{ClientId, KeepaliveConfig, TransportClient};
pub use error::{Result, TransportError};
pub use flush::{FlushPolicy, ReadBatcher};
pub use session::TransportSession;
pub use shell::{ExecOutput, ShellEvent, ShellExit, ShellId, ShellStream};
pub use socket::AbortHandle;
pub use target::{
    AuthPrompt, ConnectOptions, ConnectTarget, Credentials, HostKeyPolicy, PromptRequest, PtySize,
};
