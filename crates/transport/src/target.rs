//! Connection inputs: where to connect, how to authenticate, and how big
//! the terminal is.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default terminal type requested for the PTY.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Default bound on TCP connect plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Remote endpoint and login name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl ConnectTarget {
    /// Creates a target on the default SSH port.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
        }
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Parses `user@host[:port]`.
    pub fn parse(spec: &str) -> Option<Self> {
        let (user, rest) = spec.split_once('@')?;
        if user.is_empty() || rest.is_empty() {
            return None;
        }
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, port.parse().ok()?),
            _ => (rest, DEFAULT_SSH_PORT),
        };
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, user).with_port(port))
    }

    /// Returns `host:port` for resolution.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Secret material used to authenticate.
#[derive(Clone)]
pub enum Credentials {
    /// Password; also used to answer keyboard-interactive prompts.
    Password(String),
    /// OpenSSH/PEM private key, optionally encrypted.
    PrivateKey {
        pem: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(<redacted>)"),
            Credentials::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("pem", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl PtySize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// How the server's host key is checked during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any key; the fingerprint is still recorded.
    #[default]
    AcceptAny,
    /// Require this SHA-256 fingerprint (`SHA256:...` form).
    Fingerprint(String),
}

impl HostKeyPolicy {
    /// Whether a server presenting `fingerprint` may proceed.
    pub fn accepts(&self, fingerprint: &str) -> bool {
        match self {
            HostKeyPolicy::AcceptAny => true,
            HostKeyPolicy::Fingerprint(expected) => expected == fingerprint,
        }
    }
}

/// One prompt of a keyboard-interactive round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPrompt {
    pub text: String,
    pub echo: bool,
}

/// A keyboard-interactive round handed to whoever can answer it.
///
/// Each request belongs to exactly one authentication attempt; the reply
/// goes back over its own oneshot channel. Dropping `reply` cancels the
/// attempt.
#[derive(Debug)]
pub struct PromptRequest {
    pub target: ConnectTarget,
    pub name: String,
    pub instructions: String,
    pub prompts: Vec<AuthPrompt>,
    pub reply: oneshot::Sender<Vec<String>>,
}

/// Per-connection tuning and collaborators.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub term: String,
    pub host_key: HostKeyPolicy,
    /// Receives keyboard-interactive rounds. Without it, hidden prompts
    /// are answered with the password.
    pub prompter: Option<mpsc::Sender<PromptRequest>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            term: DEFAULT_TERM.to_string(),
            host_key: HostKeyPolicy::default(),
            prompter: None,
        }
    }
}

impl ConnectOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    pub fn with_host_key(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key = policy;
        self
    }

    pub fn with_prompter(mut self, prompter: mpsc::Sender<PromptRequest>) -> Self {
        self.prompter = Some(prompter);
        self
    }
}
