//! The credential guard: "give me a token that is good for a while".
//!
//! # Single-flight renewal
//!
//! Several parts of a client can ask for a credential at the same moment
//! (the connection about to redial, a re-auth after `TOKEN_EXPIRED`, an
//! HTTP call elsewhere in the app). If the stored credential is close to
//! expiry they would all renew, and most issuers revoke the previous
//! refresh token on each renewal, so all but one would fail.
//!
//! The guard keeps at most one renewal in flight. The first caller starts
//! it; everyone who arrives before it finishes awaits a clone of the same
//! shared future and gets the same result.
//!
//! ```text
//!  caller A ──┐
//!  caller B ──┼──→ [one renewal] ──→ store.set(fresh) ──→ A, B, C get `fresh`
//!  caller C ──┘
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Credential, CredentialRenewer, CredentialStore, GuardError};

type Renewal = Shared<BoxFuture<'static, Result<Credential, GuardError>>>;

/// Guard timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// A credential with less than this left is renewed before use.
    /// Default: 30 seconds.
    pub safety_margin_secs: u64,
    /// Upper bound on one renewal round-trip. Default: 10 seconds.
    pub renewal_timeout_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: 30,
            renewal_timeout_ms: 10_000,
        }
    }
}

impl GuardConfig {
    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    pub fn renewal_timeout(&self) -> Duration {
        Duration::from_millis(self.renewal_timeout_ms)
    }
}

#[derive(Default)]
struct Slot {
    generation: u64,
    inflight: Option<(u64, Renewal)>,
}

/// Hands out credentials that are valid for at least `safety_margin`.
///
/// Cheap to clone; clones share the store, the renewer and the in-flight
/// renewal.
pub struct CredentialGuard<S, R> {
    store: Arc<S>,
    renewer: Arc<R>,
    config: GuardConfig,
    slot: Arc<Mutex<Slot>>,
}

impl<S, R> Clone for CredentialGuard<S, R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            renewer: Arc::clone(&self.renewer),
            config: self.config.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<S: CredentialStore, R: CredentialRenewer> CredentialGuard<S, R> {
    pub fn new(store: Arc<S>, renewer: Arc<R>, config: GuardConfig) -> Self {
        Self {
            store,
            renewer,
            config,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Returns the stored credential if it has more than `safety_margin`
    /// left, otherwise renews it (single-flight) and returns the result.
    ///
    /// # Errors
    /// [`GuardError::Missing`] if nothing is stored; otherwise whatever
    /// the renewal failed with. Either way the caller cannot authenticate.
    pub async fn ensure_valid(&self) -> Result<Credential, GuardError> {
        let current = self.store.get().ok_or(GuardError::Missing)?;
        let remaining = current.remaining();
        if remaining > self.config.safety_margin() {
            return Ok(current);
        }
        debug!(remaining_secs = remaining.as_secs(), "credential within safety margin");
        self.renewal(current).await
    }

    /// Renews regardless of the local expiry, sharing any renewal that is
    /// already in flight.
    ///
    /// Used when the server reports `TOKEN_EXPIRED` for a credential the
    /// local clock still considers valid.
    ///
    /// # Errors
    /// As [`ensure_valid`](Self::ensure_valid).
    pub async fn refresh(&self) -> Result<Credential, GuardError> {
        let current = self.store.get().ok_or(GuardError::Missing)?;
        self.renewal(current).await
    }

    /// `true` while a renewal is running.
    pub fn is_renewing(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inflight
            .is_some()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Joins the in-flight renewal or starts one.
    ///
    /// A renewal that finished after `current` was read has already
    /// written its result to the store and cleared the slot, so the store
    /// is read again under the lock before starting another.
    fn renewal(&self, current: Credential) -> Renewal {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, renewal)) = &slot.inflight {
            debug!("joining in-flight renewal");
            return renewal.clone();
        }
        if let Some(stored) = self
            .store
            .get()
            .filter(|stored| *stored != current && stored.remaining() > self.config.safety_margin())
        {
            debug!("credential renewed while waiting; reusing it");
            return futures_util::future::ready(Ok(stored)).boxed().shared();
        }
        slot.generation += 1;
        let generation = slot.generation;

        let store = Arc::clone(&self.store);
        let renewer = Arc::clone(&self.renewer);
        let shared_slot = Arc::clone(&self.slot);
        let timeout = self.config.renewal_timeout();

        let renewal = async move {
            info!(sub = %current.claims().sub, "renewing credential");
            let result = match tokio::time::timeout(timeout, renewer.renew(&current)).await {
                Ok(Ok(fresh)) if fresh.is_expired() => Err(GuardError::Renewal(
                    "issuer returned an expired credential".into(),
                )),
                Ok(result) => result,
                Err(_) => Err(GuardError::Timeout),
            };
            match &result {
                Ok(fresh) => {
                    info!(exp = fresh.expires_at(), "credential renewed");
                    store.set(fresh.clone());
                }
                Err(e) => warn!(error = %e, "credential renewal failed"),
            }

            let mut slot = shared_slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.inflight.as_ref().is_some_and(|(g, _)| *g == generation) {
                slot.inflight = None;
            }
            result
        }
        .boxed()
        .shared();

        slot.inflight = Some((generation, renewal.clone()));
        renewal
    }
}
