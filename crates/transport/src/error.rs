//! Error types for the transport crate.

use thiserror::Error;

/// Transport error type covering every way a connection or shell can fail.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Operation requires an established, authenticated connection.
    #[error("not connected")]
    NotConnected,

    /// Host resolution, TCP connect or SSH handshake failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server rejected every authentication method we tried.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The server refused to open a session channel.
    #[error("channel open failed: {0}")]
    ChannelOpenFailed(String),

    /// PTY, shell or exec request was refused.
    #[error("shell request failed: {0}")]
    ShellRequestFailed(String),

    /// Socket-level failure after the connection was established.
    #[error("socket error: {0}")]
    SocketError(String),
}

impl TransportError {
    /// Returns true for failures an automatic reconnect may fix.
    ///
    /// Authentication failures are excluded: the credentials that were
    /// rejected once will be rejected again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_) | TransportError::SocketError(_)
        )
    }

    /// Returns true if this is an authentication failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::AuthenticationFailed)
    }

    /// Returns true for channel and shell level failures.
    pub fn is_channel(&self) -> bool {
        matches!(
            self,
            TransportError::ChannelOpenFailed(_) | TransportError::ShellRequestFailed(_)
        )
    }
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::SocketError(err.to_string())
    }
}

impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(io_err) => TransportError::SocketError(io_err.to_string()),
            russh::Error::Disconnect | russh::Error::HUP => {
                TransportError::SocketError("connection closed by peer".to_string())
            }
            russh::Error::NotAuthenticated => TransportError::AuthenticationFailed,
            russh::Error::ChannelOpenFailure(reason) => {
                TransportError::ChannelOpenFailed(format!("{:?}", reason))
            }
            other => TransportError::ConnectionFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::NotConnected.to_string(), "not connected");
        assert_eq!(
            TransportError::ConnectionFailed("refused".to_string()).to_string(),
            "connection failed: refused"
        );
        assert_eq!(
            TransportError::AuthenticationFailed.to_string(),
            "authentication failed"
        );
        assert_eq!(
            TransportError::SocketError("reset".to_string()).to_string(),
            "socket error: reset"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(TransportError::ConnectionFailed("x".into()).is_retryable());
        assert!(TransportError::SocketError("x".into()).is_retryable());
        assert!(!TransportError::AuthenticationFailed.is_retryable());
        assert!(!TransportError::ShellRequestFailed("pty".into()).is_retryable());
        assert!(TransportError::AuthenticationFailed.is_auth());
        assert!(TransportError::ChannelOpenFailed("x".into()).is_channel());
        assert!(!TransportError::NotConnected.is_channel());
    }

    #[test]
    fn test_io_error_maps_to_socket_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        let err: TransportError = io.into();
        assert!(matches!(err, TransportError::SocketError(msg) if msg.contains("broken pipe")));
    }
}
