//! Session orchestrator.
//!
//! A single task owns the session list, the shell registry, the terminal
//! cache and the multiplexer resolver. Everything else talks to it through
//! an [`OrchestratorHandle`]: commands go in over an mpsc mailbox, the
//! session list comes out through a `watch` snapshot, and state changes,
//! output and prompts are broadcast as [`OrchestratorEvent`]s.
//!
//! Slow work (connecting, probing, starting shells, teardown) runs in
//! spawned tasks that report back through an internal channel, so the
//! actor itself never awaits the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transport::{ConnectTarget, PtySize, ShellEvent, ShellExit, ShellId, ShellStream, TransportError};

use crate::cache::{TerminalCache, TerminalSurface};
use crate::config::{Config, MultiplexerConfig};
use crate::connector::{ShellClient, ShellConnector};
use crate::cwd::CwdTracker;
use crate::model::{
    ConnectionState, LogicalSession, MultiplexerStatus, ServerId, SessionId, TransportKind,
};
use crate::multiplexer::{
    kill_command, parse_probe, MultiplexerChoice, MultiplexerDecision,
    MultiplexerResolver, Ownership, ProbeResult,
};
use crate::persistence::{SessionSnapshot, SessionStore};
use crate::registry::{RegisterOutcome, ShellRegistry, StartClaim};
use crate::reliability::{ReconnectOutcome, ReliabilityActor, ReliabilityConfig, Reconnector};

/// Capacity of the public command mailbox.
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Capacity of the internal channel fed by pumps and start tasks.
const INTERNAL_CHANNEL_SIZE: usize = 256;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_SIZE: usize = 256;

/// How long shutdown waits for background teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Orchestrator errors returned to callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("session limit of {0} reached")]
    QuotaExceeded(usize),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {0} is not connected")]
    NotConnected(SessionId),

    #[error("orchestrator has stopped")]
    Stopped,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Tunables, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_sessions: usize,
    pub cache_capacity: usize,
    pub pending_start_timeout: Duration,
    pub persist_debounce: Duration,
    pub default_size: PtySize,
    pub reliability: ReliabilityConfig,
    pub multiplexer: MultiplexerConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_sessions: config.sessions.max_sessions,
            cache_capacity: config.sessions.terminal_cache_capacity,
            pending_start_timeout: config.sessions.pending_start_timeout(),
            persist_debounce: config.sessions.persist_debounce(),
            default_size: PtySize::new(config.sessions.default_cols, config.sessions.default_rows),
            reliability: ReliabilityConfig::from(&config.reconnect),
            multiplexer: config.multiplexer.clone(),
        }
    }
}

/// Options for [`OrchestratorHandle::open`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Always create a new session, even if one exists for the target.
    pub force_new: bool,
    /// Overrides `multiplexer.enabled` for this session.
    pub multiplexer: Option<bool>,
    pub title: Option<String>,
}

/// Observable session list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionsView {
    pub sessions: Vec<LogicalSession>,
    pub selected: Option<SessionId>,
}

impl SessionsView {
    pub fn get(&self, session: SessionId) -> Option<&LogicalSession> {
        self.sessions.iter().find(|s| s.id == session)
    }
}

/// Events broadcast by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    StateChanged {
        session: SessionId,
        state: ConnectionState,
    },
    Output {
        session: SessionId,
        data: Bytes,
    },
    /// The user must pick a tmux session; answer with
    /// [`OrchestratorHandle::resolve_multiplexer`].
    MultiplexerPrompt {
        session: SessionId,
        candidates: Vec<String>,
    },
    Error {
        session: Option<SessionId>,
        message: String,
    },
}

type Reply<T> = oneshot::Sender<Result<T, OrchestratorError>>;

enum Command {
    Open {
        target: ConnectTarget,
        options: OpenOptions,
        reply: Reply<SessionId>,
    },
    Duplicate {
        session: SessionId,
        reply: Reply<SessionId>,
    },
    Close {
        session: SessionId,
        reply: Reply<()>,
    },
    Reconnect {
        session: SessionId,
        reply: Reply<()>,
    },
    Resize {
        session: SessionId,
        size: PtySize,
        reply: Reply<()>,
    },
    Select {
        session: Option<SessionId>,
        reply: Reply<()>,
    },
    SendText {
        session: SessionId,
        data: Bytes,
        reply: Reply<()>,
    },
    ResolveMultiplexer {
        session: SessionId,
        choice: MultiplexerChoice,
        reply: Reply<()>,
    },
    Scrollback {
        session: SessionId,
        reply: Reply<Option<Bytes>>,
    },
    SuspendForBackground {
        reply: Reply<()>,
    },
    DisconnectAll {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
    ReliabilityAttempt {
        session: SessionId,
        attempt: u32,
        reply: oneshot::Sender<ReconnectOutcome>,
    },
}

/// Reports from tasks spawned by the actor.
enum Internal<C> {
    StartFinished {
        session: SessionId,
        client: Arc<C>,
        kind: TransportKind,
        result: Result<StartedShell, TransportError>,
    },
    ShellOutput {
        session: SessionId,
        shell: ShellId,
        data: Bytes,
    },
    ShellEnded {
        session: SessionId,
        shell: ShellId,
        exit: ShellExit,
    },
}

struct StartedShell {
    stream: ShellStream,
    probe: Option<ProbeResult>,
}

/// Cheap, cloneable access to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<SessionsView>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, OrchestratorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        response.await.map_err(|_| OrchestratorError::Stopped)?
    }

    /// Opens (or reuses) a session for `target`. Returns as soon as the
    /// session exists; connecting continues in the background.
    pub async fn open_connection(
        &self,
        target: ConnectTarget,
        force_new: bool,
    ) -> Result<SessionId, OrchestratorError> {
        self.open(
            target,
            OpenOptions {
                force_new,
                ..OpenOptions::default()
            },
        )
        .await
    }

    pub async fn open(
        &self,
        target: ConnectTarget,
        options: OpenOptions,
    ) -> Result<SessionId, OrchestratorError> {
        self.request(|reply| Command::Open {
            target,
            options,
            reply,
        })
        .await
    }

    /// Opens a second shell on the same connection as `session`.
    pub async fn duplicate(&self, session: SessionId) -> Result<SessionId, OrchestratorError> {
        self.request(|reply| Command::Duplicate { session, reply }).await
    }

    pub async fn close_session(&self, session: SessionId) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Close { session, reply }).await
    }

    /// Manual retry for a failed or disconnected session.
    pub async fn reconnect(&self, session: SessionId) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Reconnect { session, reply }).await
    }

    pub async fn resize(&self, session: SessionId, size: PtySize) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Resize {
            session,
            size,
            reply,
        })
        .await
    }

    /// Selects a session (or clears the selection with `None`).
    pub async fn select(&self, session: Option<SessionId>) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Select { session, reply }).await
    }

    pub async fn send_text(
        &self,
        session: SessionId,
        data: impl Into<Bytes>,
    ) -> Result<(), OrchestratorError> {
        let data = data.into();
        self.request(|reply| Command::SendText {
            session,
            data,
            reply,
        })
        .await
    }

    /// Answers a [`OrchestratorEvent::MultiplexerPrompt`].
    pub async fn resolve_multiplexer(
        &self,
        session: SessionId,
        choice: MultiplexerChoice,
    ) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::ResolveMultiplexer {
            session,
            choice,
            reply,
        })
        .await
    }

    /// Buffered output of a cached terminal surface.
    pub async fn scrollback(&self, session: SessionId) -> Result<Option<Bytes>, OrchestratorError> {
        self.request(|reply| Command::Scrollback { session, reply }).await
    }

    /// Tears down every transport but keeps the session list.
    pub async fn suspend_for_background(&self) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::SuspendForBackground { reply }).await
    }

    /// Tears down every transport and removes every session.
    pub async fn disconnect_all(&self) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::DisconnectAll { reply }).await
    }

    /// Suspends everything, flushes the snapshot and stops the actor.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn sessions(&self) -> SessionsView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionsView> {
        self.view.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }
}

/// Forwards reliability attempts into the actor's mailbox.
struct MailboxReconnector {
    commands: mpsc::WeakSender<Command>,
}

impl Reconnector for MailboxReconnector {
    fn reconnect(&self, session: SessionId, attempt: u32) -> BoxFuture<'static, ReconnectOutcome> {
        let commands = self.commands.upgrade();
        Box::pin(async move {
            let stopped = || ReconnectOutcome::Fatal("orchestrator stopped".to_string());
            let Some(commands) = commands else {
                return stopped();
            };
            let (reply, response) = oneshot::channel();
            if commands
                .send(Command::ReliabilityAttempt {
                    session,
                    attempt,
                    reply,
                })
                .await
                .is_err()
            {
                return stopped();
            }
            response.await.unwrap_or_else(|_| stopped())
        })
    }
}

/// The actor. Create with [`Orchestrator::spawn`].
pub struct Orchestrator<K: ShellConnector> {
    connector: K,
    settings: OrchestratorSettings,
    store: Option<SessionStore>,

    sessions: Vec<LogicalSession>,
    selected: Option<SessionId>,
    registry: ShellRegistry<K::Client>,
    cache: TerminalCache<TerminalSurface>,
    resolver: MultiplexerResolver,

    /// Opens still connecting, for dedup.
    in_flight: HashMap<ServerId, SessionId>,
    /// Cancels each live shell's output pump.
    pumps: HashMap<SessionId, CancellationToken>,
    /// Cancels each running reliability actor.
    recoveries: HashMap<SessionId, CancellationToken>,
    /// Reliability attempts awaiting their start result.
    waiters: HashMap<SessionId, (u32, oneshot::Sender<ReconnectOutcome>)>,
    /// Multiplexer probe results awaiting a user choice.
    probes: HashMap<SessionId, bool>,
    trackers: HashMap<SessionId, CwdTracker>,
    sizes: HashMap<SessionId, PtySize>,

    commands: mpsc::Receiver<Command>,
    weak_commands: mpsc::WeakSender<Command>,
    internal: mpsc::Receiver<Internal<K::Client>>,
    internal_tx: mpsc::Sender<Internal<K::Client>>,
    view: watch::Sender<SessionsView>,
    events: broadcast::Sender<OrchestratorEvent>,
    background: JoinSet<()>,
    shutdown: CancellationToken,
    persist_at: Option<Instant>,
}

impl<K: ShellConnector> Orchestrator<K> {
    /// Starts the actor, restoring the snapshot from `store` if given.
    pub fn spawn(
        connector: K,
        settings: OrchestratorSettings,
        store: Option<SessionStore>,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let snapshot = match store.as_ref().map(SessionStore::load) {
            Some(Ok(snapshot)) => snapshot,
            Some(Err(e)) => {
                warn!(error = %e, "Failed to restore sessions, starting empty");
                SessionSnapshot::default()
            }
            None => SessionSnapshot::default(),
        };

        let (command_tx, commands) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (internal_tx, internal) = mpsc::channel(INTERNAL_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let initial = SessionsView {
            sessions: snapshot.sessions.clone(),
            selected: snapshot.selected,
        };
        let (view, view_rx) = watch::channel(initial);

        let actor = Self {
            resolver: MultiplexerResolver::from_config(&settings.multiplexer),
            registry: ShellRegistry::new(settings.pending_start_timeout),
            cache: TerminalCache::new(settings.cache_capacity),
            connector,
            settings,
            store,
            sessions: snapshot.sessions,
            selected: snapshot.selected,
            in_flight: HashMap::new(),
            pumps: HashMap::new(),
            recoveries: HashMap::new(),
            waiters: HashMap::new(),
            probes: HashMap::new(),
            trackers: HashMap::new(),
            sizes: HashMap::new(),
            commands,
            weak_commands: command_tx.downgrade(),
            internal,
            internal_tx,
            view,
            events: events.clone(),
            background: JoinSet::new(),
            shutdown: CancellationToken::new(),
            persist_at: None,
        };
        info!(sessions = actor.sessions.len(), "Session orchestrator started");

        let task = tokio::spawn(actor.run());
        let handle = OrchestratorHandle {
            commands: command_tx,
            view: view_rx,
            events,
        };
        (handle, task)
    }

    async fn run(mut self) {
        let mut shutdown_reply = None;
        loop {
            let persist_at = self.persist_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    // Every handle is gone.
                    None => break,
                },
                Some(message) = self.internal.recv() => self.handle_internal(message),
                _ = tokio::time::sleep_until(persist_at.unwrap_or_else(Instant::now)),
                    if persist_at.is_some() =>
                {
                    self.persist_now();
                }
                Some(result) = self.background.join_next(), if !self.background.is_empty() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Background teardown task failed");
                    }
                }
            }
        }

        info!("Session orchestrator shutting down");
        self.shutdown.cancel();
        self.suspend_all();
        self.persist_now();

        let mut background = std::mem::take(&mut self.background);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while background.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Background teardown did not finish in time");
            background.abort_all();
        }

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(Ok(()));
        }
        info!("Session orchestrator stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open {
                target,
                options,
                reply,
            } => {
                let _ = reply.send(self.open(target, options));
            }
            Command::Duplicate { session, reply } => {
                let _ = reply.send(self.duplicate(session));
            }
            Command::Close { session, reply } => {
                let _ = reply.send(self.close(session));
            }
            Command::Reconnect { session, reply } => {
                let _ = reply.send(self.reconnect(session));
            }
            Command::Resize {
                session,
                size,
                reply,
            } => {
                let _ = reply.send(self.resize(session, size));
            }
            Command::Select { session, reply } => {
                let _ = reply.send(self.select(session));
            }
            Command::SendText {
                session,
                data,
                reply,
            } => {
                let _ = reply.send(self.send_text(session, data));
            }
            Command::ResolveMultiplexer {
                session,
                choice,
                reply,
            } => {
                let _ = reply.send(self.resolve_multiplexer(session, choice));
            }
            Command::Scrollback { session, reply } => {
                let result = if self.contains(session) {
                    Ok(self.cache.peek_mut(session).map(|s| s.contents()))
                } else {
                    Err(OrchestratorError::SessionNotFound(session))
                };
                let _ = reply.send(result);
            }
            Command::SuspendForBackground { reply } => {
                info!("Suspending all sessions");
                self.suspend_all();
                self.persist_now();
                let _ = reply.send(Ok(()));
            }
            Command::DisconnectAll { reply } => {
                self.disconnect_all();
                let _ = reply.send(Ok(()));
            }
            Command::ReliabilityAttempt {
                session,
                attempt,
                reply,
            } => self.reliability_attempt(session, attempt, reply),
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(Err(OrchestratorError::Stopped));
            }
        }
    }

    fn handle_internal(&mut self, message: Internal<K::Client>) {
        match message {
            Internal::StartFinished {
                session,
                client,
                kind,
                result,
            } => {
                let owned = self
                    .registry
                    .pending(session)
                    .is_some_and(|pending| Arc::ptr_eq(&pending.client, &client));
                if !owned || !self.contains(session) {
                    // Torn down or superseded while starting.
                    debug!(session_id = %session, "Discarding result of a cancelled shell start");
                    let shell = result.ok().map(|started| started.stream.id());
                    self.release_client(client, shell, None);
                    return;
                }
                match result {
                    Ok(started) => self.on_shell_started(session, client, kind, started),
                    Err(e) => {
                        self.registry.cancel_start(session, &client);
                        self.release_client(client, None, None);
                        let waiter = self.waiters.remove(&session);
                        self.on_start_failed(session, e, waiter);
                    }
                }
            }
            Internal::ShellOutput {
                session,
                shell,
                data,
            } => self.on_output(session, shell, data),
            Internal::ShellEnded {
                session,
                shell,
                exit,
            } => self.on_shell_ended(session, shell, exit),
        }
    }

    // Operations

    fn open(
        &mut self,
        target: ConnectTarget,
        options: OpenOptions,
    ) -> Result<SessionId, OrchestratorError> {
        let server = crate::model::server_id(&target);

        if !options.force_new {
            if let Some(id) = self.in_flight.get(&server).copied() {
                debug!(session_id = %id, server = %server, "Joining in-flight open");
                return Ok(id);
            }
            if let Some(id) = self.sessions.iter().find(|s| s.server_id() == server).map(|s| s.id) {
                debug!(session_id = %id, server = %server, "Reusing existing session");
                self.select(Some(id))?;
                return Ok(id);
            }
        }

        self.check_quota()?;

        let mut session = LogicalSession::new(target, self.settings.reliability.auto_reconnect);
        session.multiplexer_enabled = options
            .multiplexer
            .unwrap_or(self.settings.multiplexer.enabled);
        if let Some(title) = options.title {
            session.title = title;
        }
        let id = session.id;
        info!(session_id = %id, target = %session.target, "Opening session");

        self.sessions.push(session);
        self.in_flight.insert(server, id);
        self.selected = Some(id);
        self.ensure_surface(id);
        self.start_shell(id, None);
        self.publish();
        Ok(id)
    }

    fn duplicate(&mut self, parent: SessionId) -> Result<SessionId, OrchestratorError> {
        let source = self
            .session(parent)
            .cloned()
            .ok_or(OrchestratorError::SessionNotFound(parent))?;
        if self.registry.registration(parent).is_none() {
            return Err(OrchestratorError::NotConnected(parent));
        }
        self.check_quota()?;

        let mut session = LogicalSession::new(source.target, source.auto_reconnect);
        session.parent_id = Some(parent);
        session.title = source.title;
        session.multiplexer_enabled = source.multiplexer_enabled;
        let id = session.id;
        info!(session_id = %id, parent_id = %parent, "Duplicating session");

        self.sessions.push(session);
        self.selected = Some(id);
        self.ensure_surface(id);
        self.start_shell(id, None);
        self.publish();
        Ok(id)
    }

    fn close(&mut self, id: SessionId) -> Result<(), OrchestratorError> {
        let index = self
            .sessions
            .iter()
            .position(|s| s.id == id)
            .ok_or(OrchestratorError::SessionNotFound(id))?;
        info!(session_id = %id, "Closing session");

        self.teardown(id, true);
        if self.selected == Some(id) {
            self.selected = next_selection(&self.sessions, index);
        }
        self.sessions.remove(index);
        self.cache.remove(id);
        self.trackers.remove(&id);
        self.sizes.remove(&id);
        self.probes.remove(&id);

        let _ = self.events.send(OrchestratorEvent::StateChanged {
            session: id,
            state: ConnectionState::Disconnected,
        });
        self.publish();
        Ok(())
    }

    fn reconnect(&mut self, id: SessionId) -> Result<(), OrchestratorError> {
        let state = self
            .session(id)
            .map(|s| s.state.clone())
            .ok_or(OrchestratorError::SessionNotFound(id))?;
        if matches!(state, ConnectionState::Connected) && self.registry.registration(id).is_some() {
            return Ok(());
        }
        info!(session_id = %id, "Manual reconnect");

        self.cancel_recovery(id);
        if let Some((_, reply)) = self.waiters.remove(&id) {
            let _ = reply.send(ReconnectOutcome::Fatal("superseded by manual reconnect".to_string()));
        }
        self.set_state(id, ConnectionState::Connecting);
        self.ensure_surface(id);
        self.start_shell(id, None);
        self.publish();
        Ok(())
    }

    fn resize(&mut self, id: SessionId, size: PtySize) -> Result<(), OrchestratorError> {
        if !self.contains(id) {
            return Err(OrchestratorError::SessionNotFound(id));
        }
        self.sizes.insert(id, size);
        if let Some(surface) = self.cache.peek_mut(id) {
            surface.resize(size);
        }
        if let Some(registration) = self.registry.registration(id) {
            registration.client.resize(registration.shell, size);
        }
        Ok(())
    }

    fn select(&mut self, session: Option<SessionId>) -> Result<(), OrchestratorError> {
        let Some(id) = session else {
            self.selected = None;
            self.publish();
            return Ok(());
        };
        if !self.contains(id) {
            return Err(OrchestratorError::SessionNotFound(id));
        }
        self.selected = Some(id);
        self.ensure_surface(id);
        if let Some(session) = self.session_mut(id) {
            session.touch();
        }
        self.publish();
        Ok(())
    }

    fn send_text(&mut self, id: SessionId, data: Bytes) -> Result<(), OrchestratorError> {
        if !self.contains(id) {
            return Err(OrchestratorError::SessionNotFound(id));
        }
        let registration = self
            .registry
            .registration(id)
            .ok_or(OrchestratorError::NotConnected(id))?;
        registration.client.queue_write(registration.shell, data)?;
        Ok(())
    }

    fn resolve_multiplexer(
        &mut self,
        id: SessionId,
        choice: MultiplexerChoice,
    ) -> Result<(), OrchestratorError> {
        let session = self.session(id).ok_or(OrchestratorError::SessionNotFound(id))?;
        if session.multiplexer != MultiplexerStatus::AwaitingChoice {
            debug!(session_id = %id, "No multiplexer prompt pending");
            return Ok(());
        }
        let installed = self.probes.remove(&id).unwrap_or(true);
        let decision = self.resolver.resolve_choice(id, choice);
        self.apply_multiplexer(id, &decision, installed);
        self.publish();
        Ok(())
    }

    fn suspend_all(&mut self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|s| s.id).collect();
        for id in ids {
            self.teardown(id, false);
            let active = self.session(id).is_some_and(|s| s.state.is_active());
            if active {
                self.set_state(id, ConnectionState::Disconnected);
            }
        }
        self.publish();
    }

    fn disconnect_all(&mut self) {
        info!(sessions = self.sessions.len(), "Disconnecting all sessions");
        let ids: Vec<SessionId> = self.sessions.iter().map(|s| s.id).collect();
        for id in &ids {
            self.teardown(*id, true);
        }
        self.sessions.clear();
        self.selected = None;
        self.cache.clear();
        self.trackers.clear();
        self.sizes.clear();
        self.probes.clear();
        for id in ids {
            let _ = self.events.send(OrchestratorEvent::StateChanged {
                session: id,
                state: ConnectionState::Disconnected,
            });
        }
        self.publish();
        self.persist_now();
    }

    fn reliability_attempt(
        &mut self,
        id: SessionId,
        attempt: u32,
        reply: oneshot::Sender<ReconnectOutcome>,
    ) {
        let Some(session) = self.session(id) else {
            let _ = reply.send(ReconnectOutcome::Fatal("session closed".to_string()));
            return;
        };
        if self.registry.registration(id).is_some() {
            let _ = reply.send(ReconnectOutcome::Connected);
            return;
        }
        if matches!(session.state, ConnectionState::Connecting)
            || self.registry.is_busy_at(id, std::time::Instant::now())
        {
            // Another start is running; its result settles the state.
            self.recoveries.remove(&id);
            let _ = reply.send(ReconnectOutcome::Fatal("connect in progress".to_string()));
            return;
        }

        self.set_state(id, ConnectionState::Reconnecting { attempt });
        self.start_shell(id, Some((attempt, reply)));
        self.publish();
    }

    // Shell lifecycle

    fn start_shell(&mut self, id: SessionId, waiter: Option<(u32, oneshot::Sender<ReconnectOutcome>)>) {
        let Some(session) = self.session(id) else {
            return;
        };
        let server = session.server_id();
        let enabled = session.multiplexer_enabled;
        let shared = session
            .parent_id
            .and_then(|parent| self.registry.registration(parent))
            .filter(|registration| registration.client.is_connected())
            .map(|registration| registration.client.clone());

        let (client, kind) = match shared {
            Some(client) => (client, TransportKind::Shared),
            None => match self.connector.create(&session.target) {
                Ok(client) => (client, TransportKind::Dedicated),
                Err(e) => {
                    self.on_start_failed(id, e, waiter);
                    return;
                }
            },
        };

        match self.registry.try_begin_start(id, client.clone()) {
            StartClaim::Registered => {
                if let Some((_, reply)) = waiter {
                    let _ = reply.send(ReconnectOutcome::Connected);
                }
                return;
            }
            StartClaim::InFlight => {
                debug!(session_id = %id, "Shell start already in flight");
                if let Some((_, reply)) = waiter {
                    // The running start settles the state; this loop is done.
                    self.recoveries.remove(&id);
                    let _ = reply.send(ReconnectOutcome::Fatal("connect in progress".to_string()));
                }
                return;
            }
            StartClaim::Claimed { stale } => {
                if let Some(stale) = stale {
                    self.release_client(stale.client, None, None);
                }
            }
        }

        if let Some(waiter) = waiter {
            self.waiters.insert(id, waiter);
        }

        let probe = self.resolver.probe_for(enabled, &server);
        let probe_timeout = self.settings.multiplexer.probe_timeout();
        let size = self.size_of(id);
        let tx = self.internal_tx.clone();
        debug!(session_id = %id, kind = ?kind, probe = probe.is_some(), "Starting shell");

        tokio::spawn(async move {
            let result = async {
                client.connect().await?;
                let probe = match probe {
                    Some(command) => {
                        match tokio::time::timeout(probe_timeout, client.exec(command)).await {
                            Ok(Ok(output)) => parse_probe(&output.stdout_lossy()),
                            Ok(Err(e)) => {
                                warn!(session_id = %id, error = %e, "Multiplexer probe failed");
                                None
                            }
                            Err(_) => {
                                warn!(session_id = %id, timeout = ?probe_timeout, "Multiplexer probe timed out");
                                None
                            }
                        }
                    }
                    None => None,
                };
                let stream = client.start_shell(size).await?;
                Ok::<_, TransportError>(StartedShell { stream, probe })
            }
            .await;
            let _ = tx
                .send(Internal::StartFinished {
                    session: id,
                    client,
                    kind,
                    result,
                })
                .await;
        });
    }

    fn on_shell_started(
        &mut self,
        id: SessionId,
        client: Arc<K::Client>,
        kind: TransportKind,
        started: StartedShell,
    ) {
        let shell = started.stream.id();
        self.remove_in_flight(id);

        match self.registry.register(id, client.clone(), shell, kind) {
            RegisterOutcome::Rejected => {
                self.release_client(client, Some(shell), None);
                return;
            }
            RegisterOutcome::Installed { replaced, stale } => {
                if let Some(replaced) = replaced {
                    warn!(session_id = %id, shell = %replaced.shell, "Replacing live shell");
                    self.release_client(replaced.client, Some(replaced.shell), None);
                }
                if let Some(stale) = stale {
                    self.release_client(stale.client, None, None);
                }
            }
        }

        let cancel = self.shutdown.child_token();
        if let Some(previous) = self.pumps.insert(id, cancel.clone()) {
            previous.cancel();
        }
        self.spawn_pump(id, started.stream, cancel);
        self.trackers.insert(id, CwdTracker::new());

        if let Some((_, reply)) = self.waiters.remove(&id) {
            let _ = reply.send(ReconnectOutcome::Connected);
        }
        // The actor that asked for this start returns on its own.
        self.recoveries.remove(&id);

        if let Some(session) = self.session_mut(id) {
            session.transport_kind = Some(kind);
            session.touch();
        }
        info!(session_id = %id, shell = %shell, kind = ?kind, "Session connected");
        self.set_state(id, ConnectionState::Connected);
        self.multiplexer_after_start(id, started.probe);
        self.publish();
    }

    fn on_start_failed(
        &mut self,
        id: SessionId,
        err: TransportError,
        waiter: Option<(u32, oneshot::Sender<ReconnectOutcome>)>,
    ) {
        self.remove_in_flight(id);
        let Some(session) = self.session(id) else {
            if let Some((_, reply)) = waiter {
                let _ = reply.send(ReconnectOutcome::Fatal("session closed".to_string()));
            }
            return;
        };
        let reason = err.to_string();
        let retry = err.is_retryable()
            && self.settings.reliability.auto_reconnect
            && session.auto_reconnect;
        if err.is_auth() {
            error!(session_id = %id, "Authentication failed");
        } else {
            warn!(session_id = %id, error = %err, "Shell start failed");
        }
        let _ = self.events.send(OrchestratorEvent::Error {
            session: Some(id),
            message: reason.clone(),
        });

        let recovering = self.has_live_recovery(id);
        match waiter {
            Some((attempt, reply)) if recovering => {
                if retry && attempt < self.settings.reliability.max_attempts {
                    self.set_state(id, ConnectionState::Reconnecting { attempt: attempt + 1 });
                    let _ = reply.send(ReconnectOutcome::Retry(reason));
                } else {
                    self.recoveries.remove(&id);
                    self.set_state(id, failure_state(&err));
                    let outcome = if retry {
                        ReconnectOutcome::Retry(reason)
                    } else {
                        ReconnectOutcome::Fatal(reason)
                    };
                    let _ = reply.send(outcome);
                }
            }
            waiter => {
                // No loop is left to drive this session.
                if let Some((_, reply)) = waiter {
                    let _ = reply.send(ReconnectOutcome::Fatal("recovery cancelled".to_string()));
                }
                if retry {
                    self.start_recovery(id);
                } else {
                    self.set_state(id, failure_state(&err));
                }
            }
        }
        self.publish();
    }

    fn on_output(&mut self, id: SessionId, shell: ShellId, data: Bytes) {
        if self.registry.registration(id).map(|r| r.shell) != Some(shell) {
            return;
        }
        if let Some(surface) = self.cache.peek_mut(id) {
            surface.feed(&data);
        }
        let directory = self.trackers.entry(id).or_default().feed(&data);
        if let Some(directory) = directory {
            let changed = self.session_mut(id).is_some_and(|session| {
                if session.working_directory.as_deref() == Some(directory.as_str()) {
                    false
                } else {
                    session.working_directory = Some(directory);
                    true
                }
            });
            if changed {
                self.publish();
            }
        }
        let _ = self.events.send(OrchestratorEvent::Output { session: id, data });
    }

    fn on_shell_ended(&mut self, id: SessionId, shell: ShellId, exit: ShellExit) {
        if self.registry.registration(id).map(|r| r.shell) != Some(shell) {
            debug!(session_id = %id, shell = %shell, exit = ?exit, "Ignoring exit of a retired shell");
            return;
        }
        if let Some(token) = self.pumps.remove(&id) {
            token.cancel();
        }
        let removed = self.registry.unregister(id);
        if let Some(registration) = removed.registration {
            let lost = matches!(exit, ShellExit::ConnectionLost(_) | ShellExit::Cancelled);
            if lost && !self.registry.has_client_references(&registration.client) {
                registration.client.abort();
            }
            self.release_client(registration.client, None, None);
        }
        if let Some(pending) = removed.pending {
            self.release_client(pending.client, None, None);
        }

        // Every teardown we start unregisters first, so a cancelled shell
        // that is still registered was killed underneath us.
        let lost = match &exit {
            ShellExit::ConnectionLost(reason) => Some(reason.clone()),
            ShellExit::Cancelled => Some("connection aborted".to_string()),
            ShellExit::Eof | ShellExit::ExitStatus(_) => None,
        };
        let Some(session) = self.session(id) else {
            return;
        };
        match lost {
            Some(reason) => {
                warn!(session_id = %id, reason = %reason, "Connection lost");
                let retry = self.settings.reliability.auto_reconnect && session.auto_reconnect;
                let _ = self.events.send(OrchestratorEvent::Error {
                    session: Some(id),
                    message: reason,
                });
                if retry {
                    self.start_recovery(id);
                } else {
                    self.set_state(id, ConnectionState::Disconnected);
                }
            }
            None => {
                info!(session_id = %id, exit = ?exit, "Remote shell exited");
                self.set_state(id, ConnectionState::Disconnected);
            }
        }
        if let Some(session) = self.session_mut(id) {
            session.transport_kind = None;
        }
        self.publish();
    }

    fn spawn_pump(&self, id: SessionId, mut stream: ShellStream, cancel: CancellationToken) {
        let tx = self.internal_tx.clone();
        let shell = stream.id();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.recv() => event,
                };
                let message = match event {
                    Some(ShellEvent::Output(data)) => Internal::ShellOutput {
                        session: id,
                        shell,
                        data,
                    },
                    Some(ShellEvent::Exit(exit)) => Internal::ShellEnded {
                        session: id,
                        shell,
                        exit,
                    },
                    None => Internal::ShellEnded {
                        session: id,
                        shell,
                        exit: ShellExit::ConnectionLost("shell stream closed".to_string()),
                    },
                };
                let last = matches!(message, Internal::ShellEnded { .. });
                if tx.send(message).await.is_err() || last {
                    break;
                }
            }
            debug!(session_id = %id, shell = %shell, "Shell pump finished");
        });
    }

    /// Drops everything live for `id`: pump, recovery, registration and
    /// pending start. Managed tmux sessions are killed when `kill_managed`.
    fn teardown(&mut self, id: SessionId, kill_managed: bool) {
        self.cancel_recovery(id);
        if let Some(token) = self.pumps.remove(&id) {
            token.cancel();
        }
        if let Some((_, reply)) = self.waiters.remove(&id) {
            let _ = reply.send(ReconnectOutcome::Fatal("session torn down".to_string()));
        }
        self.remove_in_flight(id);

        let kill = match self.session(id).map(|s| &s.multiplexer) {
            Some(MultiplexerStatus::Attached {
                name,
                ownership: Ownership::Managed,
            }) if kill_managed => Some(kill_command(name)),
            _ => None,
        };

        let removed = self.registry.unregister(id);
        if let Some(registration) = removed.registration {
            debug!(session_id = %id, shell = %registration.shell, "Tearing down shell");
            self.release_client(registration.client, Some(registration.shell), kill);
        }
        if let Some(pending) = removed.pending {
            if !self.registry.has_client_references(&pending.client) {
                pending.client.abort();
            }
            self.release_client(pending.client, None, None);
        }
        if let Some(session) = self.session_mut(id) {
            session.transport_kind = None;
        }
    }

    /// Closes `shell` and disconnects `client` in the background once no
    /// session references it.
    fn release_client(&mut self, client: Arc<K::Client>, shell: Option<ShellId>, kill: Option<String>) {
        let last = !self.registry.has_client_references(&client);
        if shell.is_none() && kill.is_none() && !last {
            return;
        }
        self.background.spawn(async move {
            if let Some(command) = kill {
                if let Err(e) = client.exec(command).await {
                    debug!(error = %e, "Failed to kill managed tmux session");
                }
            }
            if let Some(shell) = shell {
                client.close_shell(shell).await;
            }
            if last {
                client.disconnect().await;
            }
        });
    }

    /// Inserts or refreshes the surface for `id`, tearing down any
    /// session whose surface is evicted.
    fn ensure_surface(&mut self, id: SessionId) {
        if self.cache.touch(id) {
            return;
        }
        let surface = TerminalSurface::new(self.size_of(id));
        let evicted = self.cache.insert(id, surface, self.selected);
        for (evicted_id, _) in evicted {
            info!(session_id = %evicted_id, "Evicting terminal surface");
            self.teardown(evicted_id, false);
            self.trackers.remove(&evicted_id);
            let active = self.session(evicted_id).is_some_and(|s| s.state.is_active());
            if active {
                self.set_state(evicted_id, ConnectionState::Disconnected);
            }
        }
    }

    // Multiplexer

    fn multiplexer_after_start(&mut self, id: SessionId, probe: Option<ProbeResult>) {
        let Some(session) = self.session(id) else {
            return;
        };
        let server = session.server_id();
        let enabled = session.multiplexer_enabled;
        let remembered = match &session.multiplexer {
            MultiplexerStatus::Attached { name, .. } => Some(name.clone()),
            _ => None,
        };

        if let Some(probe) = &probe {
            self.resolver.record_probe(&server, probe);
        }
        let installed = probe
            .as_ref()
            .map(|p| p.installed)
            .or_else(|| self.resolver.cached_presence(&server))
            .unwrap_or(true);
        let decision =
            self.resolver
                .decide(enabled, &server, id, remembered.as_deref(), probe.as_ref());

        match decision {
            MultiplexerDecision::Prompt { candidates } => {
                info!(session_id = %id, candidates = candidates.len(), "Multiplexer choice needed");
                self.probes.insert(id, installed);
                if let Some(session) = self.session_mut(id) {
                    session.multiplexer = MultiplexerStatus::AwaitingChoice;
                }
                let _ = self
                    .events
                    .send(OrchestratorEvent::MultiplexerPrompt { session: id, candidates });
            }
            decision => self.apply_multiplexer(id, &decision, installed),
        }
    }

    fn apply_multiplexer(&mut self, id: SessionId, decision: &MultiplexerDecision, installed: bool) {
        let attachment = self.resolver.attachment(id, decision, installed);
        let status = match &attachment {
            Some(attachment) => MultiplexerStatus::Attached {
                name: attachment.name.clone(),
                ownership: attachment.ownership,
            },
            None => MultiplexerStatus::Off,
        };

        if let Some(command) = attachment.and_then(|a| a.pending_command) {
            if let Some(registration) = self.registry.registration(id) {
                debug!(session_id = %id, "Sending multiplexer command");
                let line = Bytes::from(format!("{command}\n"));
                if let Err(e) = registration.client.queue_write(registration.shell, line) {
                    warn!(session_id = %id, error = %e, "Failed to send multiplexer command");
                }
            }
        }
        if let Some(session) = self.session_mut(id) {
            session.multiplexer = status;
        }
    }

    // Reliability

    fn start_recovery(&mut self, id: SessionId) {
        self.cancel_recovery(id);
        let cancel = self.shutdown.child_token();
        let actor = ReliabilityActor::new(
            id,
            self.settings.reliability,
            MailboxReconnector {
                commands: self.weak_commands.clone(),
            },
            cancel.clone(),
        );
        if actor.spawn().is_some() {
            self.recoveries.insert(id, cancel);
            self.set_state(id, ConnectionState::Reconnecting { attempt: 1 });
        } else {
            self.set_state(id, ConnectionState::Disconnected);
        }
    }

    fn has_live_recovery(&self, id: SessionId) -> bool {
        self.recoveries
            .get(&id)
            .is_some_and(|token| !token.is_cancelled())
    }

    fn cancel_recovery(&mut self, id: SessionId) {
        if let Some(token) = self.recoveries.remove(&id) {
            token.cancel();
        }
    }

    // State helpers

    fn check_quota(&self) -> Result<(), OrchestratorError> {
        if self.sessions.len() >= self.settings.max_sessions {
            warn!(max = self.settings.max_sessions, "Session limit reached");
            return Err(OrchestratorError::QuotaExceeded(self.settings.max_sessions));
        }
        Ok(())
    }

    fn remove_in_flight(&mut self, id: SessionId) {
        self.in_flight.retain(|_, session| *session != id);
    }

    fn contains(&self, id: SessionId) -> bool {
        self.sessions.iter().any(|s| s.id == id)
    }

    fn session(&self, id: SessionId) -> Option<&LogicalSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    fn session_mut(&mut self, id: SessionId) -> Option<&mut LogicalSession> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    fn size_of(&self, id: SessionId) -> PtySize {
        self.sizes
            .get(&id)
            .copied()
            .unwrap_or(self.settings.default_size)
    }

    fn set_state(&mut self, id: SessionId, state: ConnectionState) {
        let Some(session) = self.session_mut(id) else {
            return;
        };
        if session.state == state {
            return;
        }
        debug!(session_id = %id, from = %session.state, to = %state, "State change");
        session.state = state.clone();
        let _ = self
            .events
            .send(OrchestratorEvent::StateChanged { session: id, state });
    }

    /// Pushes the session list to watchers and schedules a snapshot write.
    fn publish(&mut self) {
        self.view.send_replace(SessionsView {
            sessions: self.sessions.clone(),
            selected: self.selected,
        });
        if self.store.is_some() {
            self.persist_at = Some(Instant::now() + self.settings.persist_debounce);
        }
    }

    fn persist_now(&mut self) {
        self.persist_at = None;
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = SessionSnapshot::new(self.sessions.clone(), self.selected);
        if let Err(e) = store.save(&snapshot) {
            warn!(error = %e, "Failed to save session snapshot");
        }
    }
}

/// Session state after a failed start.
fn failure_state(err: &TransportError) -> ConnectionState {
    if err.is_channel() {
        ConnectionState::Disconnected
    } else {
        ConnectionState::Failed(err.to_string())
    }
}

/// Selection after closing `sessions[closed]`: the next session for the
/// same server, else the previous one, else any other session.
fn next_selection(sessions: &[LogicalSession], closed: usize) -> Option<SessionId> {
    let target = sessions.get(closed)?;
    let server = target.server_id();
    let after = sessions[closed + 1..].iter().find(|s| s.server_id() == server);
    let before = sessions[..closed].iter().rev().find(|s| s.server_id() == server);
    after
        .or(before)
        .or_else(|| sessions.iter().find(|s| s.id != target.id))
        .map(|s| s.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(host: &str) -> LogicalSession {
        LogicalSession::new(ConnectTarget::new(host, "alice"), true)
    }

    #[test]
    fn test_next_selection_prefers_next_sibling() {
        let list = vec![session("a"), session("b"), session("a"), session("a")];
        assert_eq!(next_selection(&list, 2), Some(list[3].id));
        assert_eq!(next_selection(&list, 0), Some(list[2].id));
    }

    #[test]
    fn test_next_selection_falls_back_to_previous_sibling() {
        let list = vec![session("a"), session("b"), session("a")];
        assert_eq!(next_selection(&list, 2), Some(list[0].id));
    }

    #[test]
    fn test_next_selection_falls_back_to_any_session() {
        let list = vec![session("b"), session("a"), session("c")];
        assert_eq!(next_selection(&list, 1), Some(list[0].id));

        let list = vec![session("a")];
        assert_eq!(next_selection(&list, 0), None);
        assert_eq!(next_selection(&list, 5), None);
    }

    #[test]
    fn test_failure_state_taxonomy() {
        assert_eq!(
            failure_state(&TransportError::ChannelOpenFailed("denied".into())),
            ConnectionState::Disconnected
        );
        assert!(matches!(
            failure_state(&TransportError::AuthenticationFailed),
            ConnectionState::Failed(_)
        ));
        assert!(matches!(
            failure_state(&TransportError::ConnectionFailed("refused".into())),
            ConnectionState::Failed(reason) if reason.contains("refused")
        ));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.sessions.max_sessions = 4;
        config.sessions.default_cols = 120;
        config.reconnect.max_attempts = 5;
        let settings = OrchestratorSettings::from(&config);
        assert_eq!(settings.max_sessions, 4);
        assert_eq!(settings.default_size.cols, 120);
        assert_eq!(settings.reliability.max_attempts, 5);
        assert_eq!(settings.persist_debounce, Duration::from_millis(300));
    }
}
