//! Session snapshot storage.
//!
//! The open tabs and the selection are written to `sessions.json` in the
//! data directory. Writes go to a temporary file first and are renamed into
//! place so a crash never leaves a half-written snapshot.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ConnectionState, LogicalSession, MultiplexerStatus, SessionId};

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot storage errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to access session snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse session snapshot {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize session snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("unsupported session snapshot version {0}")]
    UnsupportedVersion(u32),
}

/// What is persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub version: u32,
    pub sessions: Vec<LogicalSession>,
    pub selected: Option<SessionId>,
}

impl SessionSnapshot {
    pub fn new(sessions: Vec<LogicalSession>, selected: Option<SessionId>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            sessions,
            selected,
        }
    }

    /// Prepares a loaded snapshot for use: every session starts out
    /// disconnected and a dangling selection is dropped.
    fn into_restored(mut self) -> Self {
        for session in &mut self.sessions {
            session.state = ConnectionState::Disconnected;
            session.transport_kind = None;
            if session.multiplexer == MultiplexerStatus::AwaitingChoice {
                session.multiplexer = MultiplexerStatus::Off;
            }
        }
        if let Some(selected) = self.selected {
            if !self.sessions.iter().any(|s| s.id == selected) {
                self.selected = self.sessions.first().map(|s| s.id);
            }
        }
        self
    }
}

/// JSON file holding a [`SessionSnapshot`].
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads and restores the snapshot. A missing file is an empty one.
    pub fn load(&self) -> Result<SessionSnapshot, PersistenceError> {
        if !self.path.exists() {
            tracing::debug!("Session snapshot not found at {:?}, starting empty", self.path);
            return Ok(SessionSnapshot::new(Vec::new(), None));
        }

        let contents = fs::read_to_string(&self.path).map_err(|source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        })?;
        let snapshot: SessionSnapshot =
            serde_json::from_str(&contents).map_err(|source| PersistenceError::Parse {
                path: self.path.clone(),
                source,
            })?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(PersistenceError::UnsupportedVersion(snapshot.version));
        }

        tracing::info!(
            "Loaded {} sessions from {:?}",
            snapshot.sessions.len(),
            self.path
        );
        Ok(snapshot.into_restored())
    }

    /// Writes the snapshot atomically.
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PersistenceError::Io { path, source }
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let contents = serde_json::to_string_pretty(snapshot)?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents).map_err(io_error(&temp_path))?;
        fs::rename(&temp_path, &self.path).map_err(io_error(&self.path))?;

        tracing::debug!(
            "Saved {} sessions to {:?}",
            snapshot.sessions.len(),
            self.path
        );
        Ok(())
    }
}
