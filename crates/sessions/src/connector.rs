//! The seam between the orchestrator and the SSH transport.
//!
//! The orchestrator is generic over [`ShellConnector`] so it can be driven
//! by in-memory fakes in tests; [`SshConnector`] is the real thing.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use transport::{
    ConnectOptions, ConnectTarget, Credentials, ExecOutput, KeepaliveConfig, PtySize, ShellId,
    ShellStream, TransportClient, TransportError,
};

use crate::config::Config;

/// One connection as the orchestrator uses it.
pub trait ShellClient: Send + Sync + 'static {
    /// Connects if not already connected.
    fn connect(&self) -> BoxFuture<'_, transport::Result<()>>;

    fn is_connected(&self) -> bool;

    fn start_shell(&self, size: PtySize) -> BoxFuture<'_, transport::Result<ShellStream>>;

    fn exec(&self, command: String) -> BoxFuture<'_, transport::Result<ExecOutput>>;

    /// Non-blocking, FIFO-ordered write.
    fn queue_write(&self, shell: ShellId, data: Bytes) -> transport::Result<()>;

    /// Best-effort resize.
    fn resize(&self, shell: ShellId, size: PtySize);

    fn close_shell(&self, shell: ShellId) -> BoxFuture<'_, ()>;

    /// Immediate, any-context socket kill.
    fn abort(&self);

    /// Graceful, idempotent teardown.
    fn disconnect(&self) -> BoxFuture<'_, ()>;
}

/// Creates unconnected clients for a target.
pub trait ShellConnector: Send + Sync + 'static {
    type Client: ShellClient;

    fn create(&self, target: &ConnectTarget) -> transport::Result<Arc<Self::Client>>;
}

impl ShellClient for TransportClient {
    fn connect(&self) -> BoxFuture<'_, transport::Result<()>> {
        TransportClient::connect(self).boxed()
    }

    fn is_connected(&self) -> bool {
        TransportClient::is_connected(self)
    }

    fn start_shell(&self, size: PtySize) -> BoxFuture<'_, transport::Result<ShellStream>> {
        TransportClient::start_shell(self, size).boxed()
    }

    fn exec(&self, command: String) -> BoxFuture<'_, transport::Result<ExecOutput>> {
        async move { TransportClient::exec(self, &command).await }.boxed()
    }

    fn queue_write(&self, shell: ShellId, data: Bytes) -> transport::Result<()> {
        TransportClient::queue_write(self, shell, data)
    }

    fn resize(&self, shell: ShellId, size: PtySize) {
        TransportClient::resize(self, shell, size)
    }

    fn close_shell(&self, shell: ShellId) -> BoxFuture<'_, ()> {
        TransportClient::close_shell(self, shell).boxed()
    }

    fn abort(&self) {
        TransportClient::abort(self)
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        TransportClient::disconnect(self).boxed()
    }
}

/// Supplies credentials for a target. Storage is up to the implementor.
pub trait CredentialProvider: Send + Sync + 'static {
    fn credentials(&self, target: &ConnectTarget) -> Option<Credentials>;
}

/// In-memory credentials keyed by target, with an optional fallback.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    by_target: RwLock<HashMap<ConnectTarget, Credentials>>,
    fallback: Option<Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials used for any target without a specific entry.
    pub fn with_fallback(mut self, credentials: Credentials) -> Self {
        self.fallback = Some(credentials);
        self
    }

    pub fn insert(&self, target: ConnectTarget, credentials: Credentials) {
        self.by_target
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target, credentials);
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, target: &ConnectTarget) -> Option<Credentials> {
        self.by_target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

/// Creates [`TransportClient`]s.
pub struct SshConnector {
    credentials: Arc<dyn CredentialProvider>,
    options: ConnectOptions,
    keepalive: KeepaliveConfig,
}

impl SshConnector {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            credentials,
            options: ConnectOptions::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }

    /// Applies the `[transport]` section.
    pub fn from_config(config: &Config, credentials: Arc<dyn CredentialProvider>) -> Self {
        let transport = &config.transport;
        Self::new(credentials)
            .with_options(
                ConnectOptions::default()
                    .with_connect_timeout(transport.connect_timeout())
                    .with_term(transport.term.clone()),
            )
            .with_keepalive(KeepaliveConfig {
                interval: transport.keepalive_interval(),
                max_failures: transport.keepalive_max_failures,
            })
    }

    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }
}

impl ShellConnector for SshConnector {
    type Client = TransportClient;

    fn create(&self, target: &ConnectTarget) -> transport::Result<Arc<TransportClient>> {
        let credentials = self.credentials.credentials(target).ok_or_else(|| {
            tracing::warn!(target = %target, "No credentials available");
            TransportError::AuthenticationFailed
        })?;
        Ok(Arc::new(
            TransportClient::new(target.clone(), credentials, self.options.clone())
                .with_keepalive(self.keepalive),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn target(host: &str) -> ConnectTarget {
        ConnectTarget::new(host, "alice")
    }

    #[test]
    fn test_static_credentials_lookup() {
        let creds = StaticCredentials::new();
        creds.insert(target("a"), Credentials::Password("pa".into()));

        assert!(matches!(
            creds.credentials(&target("a")),
            Some(Credentials::Password(p)) if p == "pa"
        ));
        assert!(creds.credentials(&target("b")).is_none());

        let creds = StaticCredentials::new().with_fallback(Credentials::Password("any".into()));
        assert!(matches!(
            creds.credentials(&target("b")),
            Some(Credentials::Password(p)) if p == "any"
        ));
    }

    #[test]
    fn test_connector_without_credentials_fails_auth() {
        let connector = SshConnector::new(Arc::new(StaticCredentials::new()));
        assert_eq!(
            connector.create(&target("a")).err(),
            Some(TransportError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_connector_creates_distinct_unconnected_clients() {
        let creds = StaticCredentials::new().with_fallback(Credentials::Password("pw".into()));
        let mut config = Config::default();
        config.transport.connect_timeout_secs = 3;
        let connector = SshConnector::from_config(&config, Arc::new(creds));
        assert_eq!(connector.options.connect_timeout, Duration::from_secs(3));
        assert_eq!(connector.keepalive.interval, Some(Duration::from_secs(30)));

        let a = connector.create(&target("a")).unwrap();
        let b = connector.create(&target("a")).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(!ShellClient::is_connected(a.as_ref()));
    }
}
