//! Adaptive batching of shell output.
//!
//! Interactive output (echoed keystrokes, prompts) should reach the
//! terminal immediately. Bulk output (`cat`, build logs) should be
//! coalesced so the consumer is not woken for every 4 KiB packet. The
//! batcher measures throughput over a short window and stretches the
//! flush delay between [`FlushPolicy::min_delay`] and
//! [`FlushPolicy::max_delay`] accordingly.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

/// Window over which throughput is measured.
const RATE_WINDOW: Duration = Duration::from_millis(100);

/// Thresholds and delays for output batching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushPolicy {
    /// At or below this rate output counts as interactive.
    pub interactive_rate: f64,
    /// At or above this rate output counts as bulk.
    pub bulk_rate: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// A batch this large is flushed regardless of delay.
    pub max_batch: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            interactive_rate: 16.0 * 1024.0,
            bulk_rate: 1024.0 * 1024.0,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_batch: 64 * 1024,
        }
    }
}

impl FlushPolicy {
    /// Flush delay for a measured rate in bytes per second.
    pub fn delay_for_rate(&self, bytes_per_sec: f64) -> Duration {
        if bytes_per_sec <= self.interactive_rate {
            return self.min_delay;
        }
        if bytes_per_sec >= self.bulk_rate {
            return self.max_delay;
        }
        let t = (bytes_per_sec - self.interactive_rate) / (self.bulk_rate - self.interactive_rate);
        let span = self.max_delay.saturating_sub(self.min_delay);
        self.min_delay + span.mul_f64(t)
    }

    /// Returns true if the rate is low enough to flush without waiting.
    pub fn is_interactive(&self, bytes_per_sec: f64) -> bool {
        bytes_per_sec <= self.interactive_rate
    }
}

/// Sliding-window throughput estimate.
#[derive(Debug, Clone)]
struct RateMeter {
    window_start: Instant,
    window_bytes: usize,
    last_rate: f64,
}

impl RateMeter {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            window_bytes: 0,
            last_rate: 0.0,
        }
    }

    fn record(&mut self, bytes: usize, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= RATE_WINDOW {
            self.last_rate = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.window_start = now;
            self.window_bytes = 0;
        }
        self.window_bytes += bytes;
    }

    /// Best estimate: the larger of the last full window and the current one.
    fn bytes_per_sec(&self, now: Instant) -> f64 {
        let elapsed = now
            .saturating_duration_since(self.window_start)
            .max(Duration::from_millis(1));
        let current = self.window_bytes as f64 / elapsed.as_secs_f64().max(RATE_WINDOW.as_secs_f64());
        current.max(if elapsed >= RATE_WINDOW * 2 { 0.0 } else { self.last_rate })
    }
}

/// Accumulates output and decides when it should be handed on.
#[derive(Debug)]
pub struct ReadBatcher {
    policy: FlushPolicy,
    meter: RateMeter,
    pending: BytesMut,
    batch_started: Option<Instant>,
}

impl ReadBatcher {
    pub fn new(policy: FlushPolicy) -> Self {
        Self::starting_at(policy, Instant::now())
    }

    fn starting_at(policy: FlushPolicy, now: Instant) -> Self {
        Self {
            policy,
            meter: RateMeter::new(now),
            pending: BytesMut::new(),
            batch_started: None,
        }
    }

    /// Appends received bytes.
    pub fn push(&mut self, data: &[u8], now: Instant) {
        if data.is_empty() {
            return;
        }
        self.meter.record(data.len(), now);
        if self.batch_started.is_none() {
            self.batch_started = Some(now);
        }
        self.pending.extend_from_slice(data);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Current flush delay for the measured throughput.
    pub fn delay(&self, now: Instant) -> Duration {
        self.policy.delay_for_rate(self.meter.bytes_per_sec(now))
    }

    /// When the current batch must be flushed, if one is open.
    pub fn deadline(&self, now: Instant) -> Option<Instant> {
        self.batch_started.map(|start| start + self.delay(now))
    }

    /// Decides whether to flush now that the channel has nothing queued.
    ///
    /// Interactive traffic is flushed on the spot; bulk traffic waits for
    /// the deadline so more data can join the batch.
    pub fn flush_on_idle(&self, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        self.policy.is_interactive(self.meter.bytes_per_sec(now)) || self.is_due(now)
    }

    /// True if the batch is full or its deadline has passed.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        if self.pending.len() >= self.policy.max_batch {
            return true;
        }
        self.deadline(now).is_some_and(|deadline| now >= deadline)
    }

    /// Takes the pending batch, closing it.
    pub fn take(&mut self) -> Option<Bytes> {
        self.batch_started = None;
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }
}
