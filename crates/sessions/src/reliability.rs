//! Automatic reconnection after an unexpected disconnect.
//!
//! Each dropped connection gets its own short-lived actor. It sleeps
//! `base × 2^(attempt−1)`, asks the orchestrator to reconnect, and stops on
//! success, on a fatal error, on cancellation, or after `max_attempts`.
//! Backoff state never leaves the actor.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectConfig;
use crate::model::SessionId;

/// Default number of reconnection attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Retry policy for one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilityConfig {
    pub auto_reconnect: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl From<&ReconnectConfig> for ReliabilityConfig {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            auto_reconnect: config.auto_reconnect,
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
        }
    }
}

impl ReliabilityConfig {
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Result of one reconnection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Connected,
    /// Failed, but another attempt may succeed.
    Retry(String),
    /// Retrying is pointless (bad credentials, session closed).
    Fatal(String),
}

/// Performs reconnection attempts on behalf of the actor.
pub trait Reconnector: Send + Sync + 'static {
    fn reconnect(&self, session: SessionId, attempt: u32) -> BoxFuture<'static, ReconnectOutcome>;
}

/// How an actor finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReliabilityReport {
    /// autoReconnect was off; nothing was attempted.
    Disabled,
    Reconnected { attempts: u32 },
    GaveUp { attempts: u32 },
    Stopped { attempts: u32, reason: String },
    Cancelled,
}

/// Backoff loop for one disconnect event.
pub struct ReliabilityActor<R> {
    session: SessionId,
    config: ReliabilityConfig,
    reconnector: R,
    cancel: CancellationToken,
    attempts: u32,
}

impl<R: Reconnector> ReliabilityActor<R> {
    pub fn new(
        session: SessionId,
        config: ReliabilityConfig,
        reconnector: R,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            config,
            reconnector,
            cancel,
            attempts: 0,
        }
    }

    /// Spawns the loop. Returns `None` when autoReconnect is off.
    pub fn spawn(self) -> Option<JoinHandle<ReliabilityReport>> {
        if !self.config.auto_reconnect {
            return None;
        }
        Some(tokio::spawn(self.run()))
    }

    pub async fn run(mut self) -> ReliabilityReport {
        if !self.config.auto_reconnect {
            return ReliabilityReport::Disabled;
        }

        while self.attempts < self.config.max_attempts {
            self.attempts += 1;
            let attempt = self.attempts;
            let delay = self.config.delay_for(attempt);
            tracing::info!(
                session_id = %self.session,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return ReliabilityReport::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return ReliabilityReport::Cancelled,
                outcome = self.reconnector.reconnect(self.session, attempt) => outcome,
            };

            match outcome {
                ReconnectOutcome::Connected => {
                    tracing::info!(session_id = %self.session, attempt, "Reconnected");
                    self.attempts = 0;
                    return ReliabilityReport::Reconnected { attempts: attempt };
                }
                ReconnectOutcome::Retry(reason) => {
                    tracing::debug!(session_id = %self.session, attempt, reason = %reason, "Reconnect attempt failed");
                }
                ReconnectOutcome::Fatal(reason) => {
                    tracing::info!(session_id = %self.session, reason = %reason, "Reconnect stopped");
                    return ReliabilityReport::Stopped {
                        attempts: attempt,
                        reason,
                    };
                }
            }
        }

        tracing::info!(
            session_id = %self.session,
            attempts = self.attempts,
            "Giving up on reconnect"
        );
        ReliabilityReport::GaveUp {
            attempts: self.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;
    use uuid::Uuid;

    /// Replays scripted outcomes and records when each attempt happened.
    #[derive(Clone, Default)]
    struct Scripted {
        outcomes: Arc<Mutex<VecDeque<ReconnectOutcome>>>,
        calls: Arc<Mutex<Vec<(u32, Instant)>>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<ReconnectOutcome>) -> Self {
            Self {
                outcomes: Arc::new(Mutex::new(outcomes.into())),
                calls: Arc::default(),
            }
        }

        fn calls(&self) -> Vec<(u32, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Reconnector for Scripted {
        fn reconnect(&self, _session: SessionId, attempt: u32) -> BoxFuture<'static, ReconnectOutcome> {
            self.calls.lock().unwrap().push((attempt, Instant::now()));
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ReconnectOutcome::Retry("refused".into()));
            Box::pin(async move { outcome })
        }
    }

    fn config(base: Duration) -> ReliabilityConfig {
        ReliabilityConfig::default().with_base_delay(base)
    }

    #[test]
    fn test_delay_doubles() {
        let config = config(Duration::from_millis(500));
        assert_eq!(config.delay_for(1), Duration::from_millis(500));
        assert_eq!(config.delay_for(2), Duration::from_secs(1));
        assert_eq!(config.delay_for(3), Duration::from_secs(2));
        assert_eq!(config.delay_for(0), Duration::from_millis(500));
        // Saturates instead of overflowing.
        assert!(config.delay_for(200) >= config.delay_for(31));
    }

    #[test]
    fn test_from_reconnect_config() {
        let config = ReliabilityConfig::from(&ReconnectConfig::default());
        assert_eq!(config, ReliabilityConfig::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_at_d_2d_4d_then_gives_up() {
        let d = Duration::from_secs(1);
        let reconnector = Scripted::new(Vec::new());
        let start = Instant::now();

        let report = ReliabilityActor::new(
            Uuid::new_v4(),
            config(d),
            reconnector.clone(),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert_eq!(report, ReliabilityReport::GaveUp { attempts: 3 });
        let calls = reconnector.calls();
        assert_eq!(calls.len(), 3);
        // Gaps of d, 2d and 4d from the disconnect.
        for ((attempt, at), (expected_attempt, expected)) in
            calls.iter().zip([(1, d), (2, d * 3), (3, d * 7)])
        {
            assert_eq!(*attempt, expected_attempt);
            let offset = *at - start;
            assert!(
                offset >= expected && offset < expected + Duration::from_millis(5),
                "attempt {attempt} at {offset:?}, expected {expected:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_the_loop() {
        let reconnector = Scripted::new(vec![
            ReconnectOutcome::Retry("timed out".into()),
            ReconnectOutcome::Connected,
        ]);
        let report = ReliabilityActor::new(
            Uuid::new_v4(),
            config(Duration::from_millis(100)),
            reconnector.clone(),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert_eq!(report, ReliabilityReport::Reconnected { attempts: 2 });
        assert_eq!(reconnector.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_outcome_stops_without_retrying() {
        let reconnector = Scripted::new(vec![ReconnectOutcome::Fatal("authentication failed".into())]);
        let report = ReliabilityActor::new(
            Uuid::new_v4(),
            config(Duration::from_millis(100)),
            reconnector.clone(),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert_eq!(
            report,
            ReliabilityReport::Stopped {
                attempts: 1,
                reason: "authentication failed".into()
            }
        );
        assert_eq!(reconnector.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_is_a_no_op() {
        let reconnector = Scripted::new(Vec::new());
        let actor = ReliabilityActor::new(
            Uuid::new_v4(),
            config(Duration::from_millis(100)).with_auto_reconnect(false),
            reconnector.clone(),
            CancellationToken::new(),
        );
        assert!(actor.spawn().is_none());

        let report = ReliabilityActor::new(
            Uuid::new_v4(),
            config(Duration::from_millis(100)).with_auto_reconnect(false),
            reconnector.clone(),
            CancellationToken::new(),
        )
        .run()
        .await;
        assert_eq!(report, ReliabilityReport::Disabled);
        assert!(reconnector.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let reconnector = Scripted::new(Vec::new());
        let cancel = CancellationToken::new();
        let handle = ReliabilityActor::new(
            Uuid::new_v4(),
            config(Duration::from_secs(10)),
            reconnector.clone(),
            cancel.clone(),
        )
        .spawn()
        .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), ReliabilityReport::Cancelled);
        assert!(reconnector.calls().is_empty());
    }
}
