//! Session data model.
//!
//! A [`LogicalSession`] is what the user sees as a tab: it outlives the
//! SSH connections that back it. Only the orchestrator mutates it.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use transport::ConnectTarget;
use uuid::Uuid;

use crate::multiplexer::Ownership;

/// Unique identifier of a logical session.
pub type SessionId = Uuid;

/// Identifier of a remote host, `user@host:port`.
pub type ServerId = String;

/// Returns the server id for a target.
pub fn server_id(target: &ConnectTarget) -> ServerId {
    target.to_string()
}

/// Connection state of a logical session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
    Disconnected,
    Failed(String),
}

impl ConnectionState {
    /// True while a connection exists or is being established.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting { .. }
        )
    }

    /// True if a manual retry is allowed.
    pub fn can_retry(&self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Failed(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting ({attempt})"),
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// How a session's shell reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// The session owns its connection.
    Dedicated,
    /// The connection is shared with another session.
    Shared,
}

/// Remote tmux state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MultiplexerStatus {
    /// Not used for this session.
    #[default]
    Off,
    /// Waiting for the user to pick between existing remote sessions.
    AwaitingChoice,
    /// Running inside the named remote session.
    Attached { name: String, ownership: Ownership },
}

/// A user-visible session (a tab).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalSession {
    pub id: SessionId,
    pub target: ConnectTarget,
    pub title: String,
    pub state: ConnectionState,
    /// Runtime only.
    #[serde(skip)]
    pub transport_kind: Option<TransportKind>,
    /// Whether shells for this session run inside tmux.
    #[serde(default)]
    pub multiplexer_enabled: bool,
    #[serde(default)]
    pub multiplexer: MultiplexerStatus,
    #[serde(default)]
    pub working_directory: Option<String>,
    pub created_at: SystemTime,
    pub last_active_at: SystemTime,
    pub auto_reconnect: bool,
    #[serde(default)]
    pub parent_id: Option<SessionId>,
}

impl LogicalSession {
    /// Creates a session in the `connecting` state.
    pub fn new(target: ConnectTarget, auto_reconnect: bool) -> Self {
        let now = SystemTime::now();
        Self {
            id: Uuid::new_v4(),
            title: target.host.clone(),
            target,
            state: ConnectionState::Connecting,
            transport_kind: None,
            multiplexer_enabled: false,
            multiplexer: MultiplexerStatus::Off,
            working_directory: None,
            created_at: now,
            last_active_at: now,
            auto_reconnect,
            parent_id: None,
        }
    }

    pub fn server_id(&self) -> ServerId {
        server_id(&self.target)
    }

    pub fn touch(&mut self) {
        self.last_active_at = SystemTime::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ConnectTarget {
        ConnectTarget::new("example.com", "alice")
    }

    #[test]
    fn test_new_session_defaults() {
        let session = LogicalSession::new(target(), true);
        assert_eq!(session.state, ConnectionState::Connecting);
        assert_eq!(session.title, "example.com");
        assert_eq!(session.server_id(), "alice@example.com:22");
        assert!(session.auto_reconnect);
        assert!(session.transport_kind.is_none());
        assert_eq!(session.multiplexer, MultiplexerStatus::Off);
        assert_eq!(session.created_at, session.last_active_at);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = LogicalSession::new(target(), true);
        let b = LogicalSession::new(target(), true);
        assert_ne!(a.id, b.id);
        assert_eq!(a.server_id(), b.server_id());
    }

    #[test]
    fn test_state_classification() {
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Connected.is_active());
        assert!(ConnectionState::Reconnecting { attempt: 2 }.is_active());
        assert!(!ConnectionState::Disconnected.is_active());

        assert!(ConnectionState::Idle.can_retry());
        assert!(ConnectionState::Failed("x".into()).can_retry());
        assert!(!ConnectionState::Connected.can_retry());
        assert!(!ConnectionState::Reconnecting { attempt: 1 }.can_retry());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting { attempt: 2 }.to_string(), "reconnecting (2)");
        assert_eq!(ConnectionState::Failed("timed out".into()).to_string(), "failed: timed out");
    }

    #[test]
    fn test_transport_kind_is_not_serialized() {
        let mut session = LogicalSession::new(target(), false);
        session.transport_kind = Some(TransportKind::Shared);
        session.working_directory = Some("/srv".to_string());

        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("transport_kind"));

        let restored: LogicalSession = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.transport_kind, None);
        assert_eq!(restored.working_directory.as_deref(), Some("/srv"));
        assert_eq!(restored.target, session.target);
    }
}
