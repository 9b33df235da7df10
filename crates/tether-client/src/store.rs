//! Where the current credential lives.
//!
//! The guard writes renewed credentials back into the same store the rest
//! of the application reads from, so an HTTP client elsewhere in the app
//! picks up the fresh token without talking to the connection.

use tokio::sync::watch;

use crate::Credential;

/// Shared credential storage.
///
/// Implementations must be cheap to read; the guard calls `get()` before
/// every connection attempt.
pub trait CredentialStore: Send + Sync + 'static {
    /// The current credential, if any.
    fn get(&self) -> Option<Credential>;

    /// Replaces the current credential.
    fn set(&self, credential: Credential);

    /// Forgets the current credential (logout).
    fn clear(&self);

    /// Observes changes. The receiver starts at the current value.
    fn subscribe(&self) -> watch::Receiver<Option<Credential>>;
}

/// In-memory store backed by a `watch` channel.
#[derive(Debug)]
pub struct MemoryCredentialStore {
    tx: watch::Sender<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new(initial: Option<Credential>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    fn set(&self, credential: Credential) {
        self.tx.send_replace(Some(credential));
    }

    fn clear(&self) {
        self.tx.send_replace(None);
    }

    fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}
