//! Shell registry: which client and shell back each logical session.
//!
//! Pure state, no I/O. The orchestrator is the only owner, so the table is
//! never shared behind a lock. Every operation that drops an entry hands
//! it back to the caller, who is responsible for closing it.
//!
//! Per session the registry holds a [`Registration`], a [`PendingStart`],
//! or neither. A pending start older than the staleness threshold no
//! longer blocks anything and is evicted by the next claim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use transport::ShellId;

use crate::model::{SessionId, TransportKind};

/// Default age after which a pending start is considered abandoned.
pub const DEFAULT_PENDING_START_TIMEOUT: Duration = Duration::from_secs(120);

/// A live shell bound to a session.
#[derive(Debug)]
pub struct Registration<C> {
    pub client: Arc<C>,
    pub shell: ShellId,
    pub kind: TransportKind,
}

/// An in-flight claim to start a shell for a session.
#[derive(Debug)]
pub struct PendingStart<C> {
    pub started_at: Instant,
    pub client: Arc<C>,
}

/// Result of [`ShellRegistry::try_begin_start`].
#[derive(Debug)]
pub enum StartClaim<C> {
    /// The claim was recorded. A stale claim it displaced is returned.
    Claimed { stale: Option<PendingStart<C>> },
    /// The session already has a live shell.
    Registered,
    /// Another start is in flight and still fresh.
    InFlight,
}

impl<C> StartClaim<C> {
    pub fn started(&self) -> bool {
        matches!(self, StartClaim::Claimed { .. })
    }
}

/// Result of [`ShellRegistry::register`].
#[derive(Debug)]
pub enum RegisterOutcome<C> {
    /// The registration is live. Displaced entries must be closed.
    Installed {
        replaced: Option<Registration<C>>,
        stale: Option<PendingStart<C>>,
    },
    /// A fresh start by a different client owns the session. The caller
    /// must close the shell it tried to register.
    Rejected,
}

/// Entries removed by [`ShellRegistry::unregister`].
#[derive(Debug)]
pub struct Removed<C> {
    pub registration: Option<Registration<C>>,
    pub pending: Option<PendingStart<C>>,
}

impl<C> Removed<C> {
    pub fn is_empty(&self) -> bool {
        self.registration.is_none() && self.pending.is_none()
    }
}

/// Registration and pending-start tables.
#[derive(Debug)]
pub struct ShellRegistry<C> {
    registrations: HashMap<SessionId, Registration<C>>,
    pending: HashMap<SessionId, PendingStart<C>>,
    stale_after: Duration,
}

impl<C> Default for ShellRegistry<C> {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_START_TIMEOUT)
    }
}

impl<C> ShellRegistry<C> {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            registrations: HashMap::new(),
            pending: HashMap::new(),
            stale_after,
        }
    }

    fn is_stale(&self, pending: &PendingStart<C>, now: Instant) -> bool {
        now.saturating_duration_since(pending.started_at) >= self.stale_after
    }

    /// Claims the right to start a shell for `session`.
    pub fn try_begin_start(&mut self, session: SessionId, client: Arc<C>) -> StartClaim<C> {
        self.try_begin_start_at(session, client, Instant::now())
    }

    pub fn try_begin_start_at(
        &mut self,
        session: SessionId,
        client: Arc<C>,
        now: Instant,
    ) -> StartClaim<C> {
        if self.registrations.contains_key(&session) {
            return StartClaim::Registered;
        }

        let existing_is_stale = self.pending.get(&session).map(|p| self.is_stale(p, now));
        let stale = match existing_is_stale {
            Some(false) => return StartClaim::InFlight,
            Some(true) => self.pending.remove(&session),
            None => None,
        };
        if stale.is_some() {
            tracing::warn!(session_id = %session, "Evicting stale pending shell start");
        }

        self.pending.insert(
            session,
            PendingStart {
                started_at: now,
                client,
            },
        );
        StartClaim::Claimed { stale }
    }

    /// Installs a live shell for `session`.
    pub fn register(
        &mut self,
        session: SessionId,
        client: Arc<C>,
        shell: ShellId,
        kind: TransportKind,
    ) -> RegisterOutcome<C> {
        self.register_at(session, client, shell, kind, Instant::now())
    }

    pub fn register_at(
        &mut self,
        session: SessionId,
        client: Arc<C>,
        shell: ShellId,
        kind: TransportKind,
        now: Instant,
    ) -> RegisterOutcome<C> {
        let mut stale = None;
        if let Some(pending) = self.pending.remove(&session) {
            if Arc::ptr_eq(&pending.client, &client) {
                // Our own claim, now fulfilled.
            } else if self.is_stale(&pending, now) {
                tracing::warn!(session_id = %session, "Registering over a stale pending start");
                stale = Some(pending);
            } else {
                tracing::debug!(
                    session_id = %session,
                    shell = %shell,
                    "Rejecting registration from a superseded start"
                );
                self.pending.insert(session, pending);
                return RegisterOutcome::Rejected;
            }
        }

        let replaced = self.registrations.insert(
            session,
            Registration {
                client,
                shell,
                kind,
            },
        );
        RegisterOutcome::Installed { replaced, stale }
    }

    /// Drops a pending start, but only if `client` still owns it.
    pub fn cancel_start(&mut self, session: SessionId, client: &Arc<C>) -> Option<PendingStart<C>> {
        let owned = self
            .pending
            .get(&session)
            .is_some_and(|pending| Arc::ptr_eq(&pending.client, client));
        if owned {
            self.pending.remove(&session)
        } else {
            None
        }
    }

    /// Removes everything recorded for `session`.
    pub fn unregister(&mut self, session: SessionId) -> Removed<C> {
        Removed {
            registration: self.registrations.remove(&session),
            pending: self.pending.remove(&session),
        }
    }

    /// True if any entry still references `client`.
    pub fn has_client_references(&self, client: &Arc<C>) -> bool {
        self.registrations
            .values()
            .any(|r| Arc::ptr_eq(&r.client, client))
            || self.pending.values().any(|p| Arc::ptr_eq(&p.client, client))
    }

    /// Sessions whose live shell runs on `client`.
    pub fn sessions_using(&self, client: &Arc<C>) -> Vec<SessionId> {
        self.registrations
            .iter()
            .filter(|(_, r)| Arc::ptr_eq(&r.client, client))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn registration(&self, session: SessionId) -> Option<&Registration<C>> {
        self.registrations.get(&session)
    }

    pub fn pending(&self, session: SessionId) -> Option<&PendingStart<C>> {
        self.pending.get(&session)
    }

    /// True if the session has a live shell or a fresh pending start.
    pub fn is_busy_at(&self, session: SessionId, now: Instant) -> bool {
        self.registrations.contains_key(&session)
            || self
                .pending
                .get(&session)
                .is_some_and(|p| !self.is_stale(p, now))
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty() && self.pending.is_empty()
    }

    /// Empties both tables, returning every entry for disposal.
    pub fn drain(&mut self) -> Vec<(SessionId, Removed<C>)> {
        let mut ids: Vec<SessionId> = self.registrations.keys().copied().collect();
        ids.extend(self.pending.keys().filter(|id| !self.registrations.contains_key(*id)));
        ids.into_iter().map(|id| (id, self.unregister(id))).collect()
    }
}
