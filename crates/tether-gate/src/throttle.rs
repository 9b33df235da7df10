//! Rate-limited rejection logging.
//!
//! A misconfigured client can retry a bad credential many times a second.
//! Logging each rejection would flood the log, so the first rejection per
//! `(source, kind)` in each window is logged and the rest are counted.
//! The count is reported with the next logged rejection for that key.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tether_protocol::AuthErrorKind;
use tracing::warn;

/// Entries are swept once the map grows past this.
const SWEEP_THRESHOLD: usize = 4_096;

#[derive(Debug, Clone, Copy)]
struct Window {
    opened_at: Instant,
    suppressed: u64,
}

/// Per-key rate limiter for rejection diagnostics.
///
/// Shared by every connection task, hence the concurrent map.
#[derive(Debug)]
pub struct DiagnosticThrottle {
    window: Duration,
    windows: DashMap<(String, AuthErrorKind), Window>,
}

impl DiagnosticThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            windows: DashMap::new(),
        }
    }

    /// Records one rejection from `source` at `now`.
    ///
    /// Returns `Some(suppressed)` if this one should be logged, where
    /// `suppressed` is how many were swallowed in the previous window.
    /// Returns `None` if it falls inside an open window.
    pub fn admit(&self, source: &str, kind: AuthErrorKind, now: Instant) -> Option<u64> {
        if self.windows.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }
        match self.windows.entry((source.to_owned(), kind)) {
            Entry::Vacant(slot) => {
                slot.insert(Window {
                    opened_at: now,
                    suppressed: 0,
                });
                Some(0)
            }
            Entry::Occupied(mut slot) => {
                let w = slot.get_mut();
                if now.saturating_duration_since(w.opened_at) >= self.window {
                    let suppressed = w.suppressed;
                    *w = Window {
                        opened_at: now,
                        suppressed: 0,
                    };
                    Some(suppressed)
                } else {
                    w.suppressed += 1;
                    None
                }
            }
        }
    }

    /// Logs a rejection at `warn` unless it is throttled.
    pub fn report(&self, source: &str, kind: AuthErrorKind, message: &str) {
        if let Some(suppressed) = self.admit(source, kind, Instant::now()) {
            warn!(
                source,
                kind = %kind,
                code = kind.code(),
                suppressed,
                "credential rejected: {message}"
            );
        }
    }

    /// Drops windows that have closed.
    pub fn sweep(&self, now: Instant) {
        let window = self.window;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.opened_at) < window);
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}
