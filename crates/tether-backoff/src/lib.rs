//! Reconnection backoff for Tether clients.
//!
//! Three pieces, from pure to stateful:
//!
//! - [`BackoffSchedule`]: a pure `delay(attempt) -> Duration` over a fixed,
//!   non-decreasing list of delays, clamped to the last entry.
//! - [`ReconnectBackoff`]: the attempt counter for one logical client
//!   session. Hands out the next delay until `max_attempts` is reached,
//!   then reports [`BackoffExhausted`].
//! - [`RetryTimer`]: a cancellable single-shot timer. At most one retry is
//!   pending; arming it again replaces the previous deadline.
//!
//! # Integration
//!
//! The timer is designed to sit inside a driver's `tokio::select!` loop:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         Some(cmd) = cmd_rx.recv() => { /* handle commands */ }
//!         _ = retry.elapsed() => {
//!             // dial again
//!         }
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant as TokioInstant};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Backoff configuration. Deserializable so it can live in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before each attempt, in milliseconds. Index `n` is the wait
    /// before attempt `n + 1`; attempts past the end reuse the last entry.
    pub schedule_ms: Vec<u64>,
    /// Attempts allowed per outage before giving up.
    pub max_attempts: u32,
    /// Random extra delay (0..=jitter_ms) added to every attempt, to keep
    /// a fleet of clients from redialing in lockstep. Default 0: delays
    /// match the schedule exactly.
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            schedule_ms: vec![1_000, 2_000, 4_000, 8_000, 16_000],
            max_attempts: 5,
            jitter_ms: 0,
        }
    }
}

impl BackoffConfig {
    /// Fix out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`ReconnectBackoff::new`]. Rules:
    /// - an empty schedule falls back to the default schedule;
    /// - a decreasing entry is raised to its predecessor, so the schedule
    ///   is non-decreasing.
    pub fn validated(mut self) -> Self {
        if self.schedule_ms.is_empty() {
            warn!("empty backoff schedule, using default");
            self.schedule_ms = Self::default().schedule_ms;
        }
        let mut floor = 0;
        for delay in &mut self.schedule_ms {
            if *delay < floor {
                warn!(delay = *delay, floor, "backoff schedule decreases, raising entry");
                *delay = floor;
            }
            floor = *delay;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Schedule (pure)
// ---------------------------------------------------------------------------

/// A fixed, non-decreasing delay schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    /// Builds a schedule from a validated config.
    pub fn from_config(config: &BackoffConfig) -> Self {
        let delays = config
            .clone()
            .validated()
            .schedule_ms
            .into_iter()
            .map(Duration::from_millis)
            .collect();
        Self { delays }
    }

    /// Delay before attempt `attempt + 1` (0-indexed), clamped to the last
    /// entry for indexes past the end.
    pub fn delay(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(idx).copied().unwrap_or(Duration::ZERO)
    }

    /// Number of distinct entries.
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    /// `true` if the schedule has no entries (never, once validated).
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Reconnection gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("reconnection gave up after {attempts} attempts")]
pub struct BackoffExhausted {
    /// Attempts made before giving up.
    pub attempts: u32,
}

/// Attempt counter for one logical client session.
///
/// Survives across individual connections: the driver keeps one of these
/// for its whole life and calls [`reset`](Self::reset) whenever a
/// connection authenticates.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    schedule: BackoffSchedule,
    max_attempts: u32,
    jitter_ms: u64,
    attempts: u32,
}

impl ReconnectBackoff {
    /// Creates a controller with zero attempts made.
    pub fn new(config: BackoffConfig) -> Self {
        let config = config.validated();
        Self {
            schedule: BackoffSchedule::from_config(&config),
            max_attempts: config.max_attempts,
            jitter_ms: config.jitter_ms,
            attempts: 0,
        }
    }

    /// Claims the next attempt and returns how long to wait before it.
    ///
    /// # Errors
    /// [`BackoffExhausted`] once `max_attempts` attempts have been claimed
    /// since the last reset. The counter does not move past the maximum.
    pub fn next_delay(&mut self) -> Result<Duration, BackoffExhausted> {
        if self.attempts >= self.max_attempts {
            return Err(BackoffExhausted {
                attempts: self.attempts,
            });
        }
        let mut delay = self.schedule.delay(self.attempts);
        if self.jitter_ms > 0 {
            let extra = rand::rng().random_range(0..=self.jitter_ms);
            delay += Duration::from_millis(extra);
        }
        self.attempts += 1;
        debug!(
            attempt = self.attempts,
            max = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect attempt scheduled"
        );
        Ok(delay)
    }

    /// Back to zero attempts. Called on every successful authentication
    /// and on manual reconnect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts claimed since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Configured maximum.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `true` once no further attempt may be scheduled.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// The underlying schedule.
    pub fn schedule(&self) -> &BackoffSchedule {
        &self.schedule
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// A cancellable single-shot timer.
///
/// Holds at most one deadline. [`arm`](Self::arm) replaces any pending
/// deadline, so "schedule a new attempt" implicitly cancels the old one.
#[derive(Debug, Default)]
pub struct RetryTimer {
    deadline: Option<TokioInstant>,
}

impl RetryTimer {
    /// Creates a disarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer to fire `delay` from now, replacing any pending
    /// deadline.
    pub fn arm(&mut self, delay: Duration) {
        if self.deadline.is_some() {
            debug!("replacing pending retry timer");
        }
        self.deadline = Some(TokioInstant::now() + delay);
    }

    /// Disarms the timer. A no-op if nothing is pending.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// `true` while a deadline is pending.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// The pending deadline, if any.
    pub fn deadline(&self) -> Option<TokioInstant> {
        self.deadline
    }

    /// Waits for the pending deadline, then disarms.
    ///
    /// While disarmed this future pends forever, which lets it sit in a
    /// `tokio::select!` next to other branches. Cancel-safe: dropping the
    /// future before it fires leaves the deadline in place.
    pub async fn elapsed(&mut self) {
        let Some(deadline) = self.deadline else {
            std::future::pending::<()>().await;
            return;
        };
        time::sleep_until(deadline).await;
        self.deadline = None;
    }
}
