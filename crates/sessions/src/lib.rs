//! # VivyTerm Session Core
//!
//! Session orchestration on top of the [`transport`] crate: the list of
//! open terminal tabs, their connection state, automatic reconnection,
//! remote tmux integration and the bounded cache of terminal surfaces.
//!
//! ## Overview
//!
//! - **Orchestrator**: single-writer actor owning sessions, selection and
//!   every live shell; driven through an [`OrchestratorHandle`]
//! - **Shell Registry**: which client and shell back each session, plus
//!   in-flight start claims with staleness recovery
//! - **Reliability Actor**: exponential-backoff reconnect loop per dropped
//!   connection
//! - **Multiplexer Resolver**: create/attach/skip decisions for remote tmux
//! - **Terminal Cache**: LRU of terminal surfaces that never evicts the
//!   selected session
//! - **Persistence**: debounced JSON snapshot of the open tabs
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    OrchestratorHandle (UI)                    │
//! └───────────────┬──────────────────────────────▲───────────────┘
//!        commands │                 watch / events│
//! ┌───────────────▼──────────────────────────────┴───────────────┐
//! │                        Orchestrator                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//! │  │    Shell     │  │   Terminal   │  │    Multiplexer     │  │
//! │  │   Registry   │  │    Cache     │  │     Resolver       │  │
//! │  └──────────────┘  └──────────────┘  └────────────────────┘  │
//! └───────┬──────────────────────┬───────────────────▲───────────┘
//!         │ start / teardown     │ spawn              │ attempts
//! ┌───────▼──────────┐   ┌───────▼──────────────────┐ │
//! │ ShellConnector → │   │   Reliability Actor      ├─┘
//! │ TransportClient  │   └──────────────────────────┘
//! └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sessions::{Config, Orchestrator, OrchestratorSettings, SessionStore, SshConnector, StaticCredentials};
//! use transport::{ConnectTarget, Credentials};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let credentials = StaticCredentials::new().with_fallback(Credentials::Password("secret".into()));
//!     let connector = SshConnector::from_config(&config, Arc::new(credentials));
//!     let store = SessionStore::new(config.sessions_path());
//!
//!     let (handle, task) = Orchestrator::spawn(connector, OrchestratorSettings::from(&config), Some(store));
//!     let target = ConnectTarget::parse("alice@example.com").ok_or_else(|| anyhow::anyhow!("bad target"))?;
//!     let session = handle.open_connection(target, false).await?;
//!     handle.send_text(session, "uptime\n").await.ok();
//!
//!     handle.shutdown().await?;
//!     task.await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`model`]: Logical sessions and their state machine
//! - [`registry`]: Shell registry
//! - [`orchestrator`]: Session orchestrator actor and handle
//! - [`reliability`]: Reconnection backoff
//! - [`multiplexer`]: Remote tmux decisions and scripts
//! - [`cache`]: LRU terminal cache
//! - [`connector`]: Client seam and the SSH connector
//! - [`persistence`]: Session snapshot storage
//! - [`cwd`]: OSC 7 working directory tracking

pub mod cache;
pub mod config;
pub mod connector;
pub mod cwd;
pub mod model;
pub mod multiplexer;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod reliability;

// Re-export transport for convenience
pub use transport;

pub use config::Config;

pub use model::{ConnectionState, LogicalSession, MultiplexerStatus, SessionId, TransportKind};

pub use registry::{PendingStart, RegisterOutcome, Registration, ShellRegistry, StartClaim};

pub use orchestrator::{
    OpenOptions, Orchestrator, OrchestratorError, OrchestratorEvent, OrchestratorHandle,
    OrchestratorSettings, SessionsView,
};

pub use reliability::{ReconnectOutcome, Reconnector, ReliabilityActor, ReliabilityConfig, ReliabilityReport};

pub use multiplexer::{MultiplexerChoice, MultiplexerDecision, MultiplexerResolver, Ownership};

pub use cache::{TerminalCache, TerminalSurface};

pub use connector::{CredentialProvider, ShellClient, ShellConnector, SshConnector, StaticCredentials};

pub use persistence::{PersistenceError, SessionSnapshot, SessionStore};
