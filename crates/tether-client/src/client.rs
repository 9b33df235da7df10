//! `TetherClient` builder and handle.

use std::sync::Arc;
use std::time::Duration;

use tether_backoff::BackoffConfig;
use tether_protocol::RoomName;
use tokio::sync::{mpsc, watch};

use crate::driver::{Command, Driver};
use crate::{
    ClientConfig, ClientError, ClientEvent, ConnectionState, CredentialGuard, CredentialRenewer,
    CredentialStore, EventRegistry, GuardConfig, Subscription,
};

/// Builder for a [`TetherClient`].
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use tether_client::{HttpRenewer, MemoryCredentialStore, TetherClient};
///
/// let store = Arc::new(MemoryCredentialStore::new(Some(credential)));
/// let renewer = Arc::new(HttpRenewer::new("https://auth.example.com/renew"));
///
/// let client = TetherClient::builder()
///     .url("wss://rt.example.com")
///     .build(store, renewer);
///
/// client.join("route:R1")?;
/// client.subscribe("route_updated", |event| println!("{event:?}"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TetherClientBuilder {
    config: ClientConfig,
}

impl TetherClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the server URL.
    pub fn url(mut self, url: &str) -> Self {
        self.config.url = url.to_string();
        self
    }

    /// When `false`, nothing is dialed until [`TetherClient::start`].
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.config.autostart = autostart;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn guard(mut self, guard: GuardConfig) -> Self {
        self.config.guard = guard;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn coalesce_window(mut self, window: Duration) -> Self {
        self.config.coalesce_window_ms = window.as_millis() as u64;
        self
    }

    /// Spawns the driver task and returns a handle to it.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn build<S, R>(self, store: Arc<S>, renewer: Arc<R>) -> TetherClient
    where
        S: CredentialStore,
        R: CredentialRenewer,
    {
        let guard = CredentialGuard::new(store, renewer, self.config.guard.clone());
        let events = EventRegistry::new(self.config.coalesce_window());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let driver = Driver::new(self.config, guard, events.clone(), state_tx);
        tokio::spawn(driver.run(cmd_rx));

        TetherClient {
            commands: cmd_tx,
            state: state_rx,
            events,
        }
    }
}

/// Handle to a running client.
///
/// Cheap to clone. The connection is shut down once every handle has been
/// dropped.
#[derive(Debug, Clone)]
pub struct TetherClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: EventRegistry,
}

impl TetherClient {
    pub fn builder() -> TetherClientBuilder {
        TetherClientBuilder::new()
    }

    /// Connects a client built with `autostart(false)`. A no-op otherwise.
    ///
    /// # Errors
    /// [`ClientError::Shutdown`] if the driver has exited.
    pub fn start(&self) -> Result<(), ClientError> {
        self.command(Command::Start)
    }

    /// Adds `room` to the rooms joined on every (re)connection, and joins
    /// it now if connected.
    ///
    /// # Errors
    /// [`ClientError::Shutdown`] if the driver has exited.
    pub fn join(&self, room: impl Into<RoomName>) -> Result<(), ClientError> {
        self.command(Command::Join(room.into()))
    }

    /// Stops tracking `room`, and leaves it now if connected.
    ///
    /// # Errors
    /// [`ClientError::Shutdown`] if the driver has exited.
    pub fn leave(&self, room: impl Into<RoomName>) -> Result<(), ClientError> {
        self.command(Command::Leave(room.into()))
    }

    /// Reconnects now with a fresh attempt budget, from any state.
    ///
    /// # Errors
    /// [`ClientError::Shutdown`] if the driver has exited.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Reconnect)
    }

    /// Closes the connection and stops reconnecting.
    ///
    /// # Errors
    /// [`ClientError::Shutdown`] if the driver has exited.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect)
    }

    /// Registers `handler` for `topic`: one of `connect`,
    /// `reauthenticated`, `auth_error`, `disconnect`, `terminal`, `state`,
    /// or a room event name.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(ClientEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(topic, handler)
    }

    /// The current state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the state satisfies `predicate`, returning that state.
    ///
    /// # Errors
    /// [`ClientError::Shutdown`] if the driver exits first.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<ConnectionState, ClientError>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| ClientError::Shutdown)?;
        Ok(state.clone())
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Shutdown)
    }
}
