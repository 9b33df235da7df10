//! End-to-end tests: a `TetherClient` against a real `TetherServer`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tether::client::GuardError;
use tether::prelude::*;
use tether::protocol::unix_secs;
use tokio::sync::mpsc;

// =========================================================================
// Helpers
// =========================================================================

const SECRET: &[u8] = b"e2e-secret";

fn credential_from(keys: &JwtKeys, ttl_secs: i64) -> Credential {
    let claims = Claims {
        sub: "driver-7".into(),
        role: "driver".into(),
        username: "ana".into(),
        exp: (unix_secs() as i64 + ttl_secs) as u64,
        iat: unix_secs(),
    };
    Credential::parse(keys.issue(&claims).expect("issue")).expect("parse")
}

fn credential(ttl_secs: i64) -> Credential {
    credential_from(&JwtKeys::from_secret(SECRET), ttl_secs)
}

/// Issues fresh hour-long credentials signed with the server's key.
struct IssuingRenewer {
    keys: JwtKeys,
    calls: AtomicUsize,
}

impl IssuingRenewer {
    fn new() -> Self {
        Self {
            keys: JwtKeys::from_secret(SECRET),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialRenewer for IssuingRenewer {
    async fn renew(&self, _current: &Credential) -> Result<Credential, GuardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(credential_from(&self.keys, 3_600))
    }
}

async fn start_server(gate: GateConfig) -> (String, Broadcaster) {
    let server = TetherServerBuilder::new()
        .bind("127.0.0.1:0")
        .gate_config(gate)
        .build(JwtKeys::from_secret(SECRET))
        .await
        .expect("server should build");
    let url = format!("ws://{}", server.local_addr().expect("local addr"));
    let broadcaster = server.broadcaster();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    (url, broadcaster)
}

fn fast_backoff(max_attempts: u32) -> BackoffConfig {
    BackoffConfig {
        schedule_ms: vec![20, 40],
        max_attempts,
        jitter_ms: 0,
    }
}

fn client_for(
    url: &str,
    stored: Credential,
    renewer: &Arc<IssuingRenewer>,
) -> (TetherClient, Arc<MemoryCredentialStore>) {
    let store = Arc::new(MemoryCredentialStore::new(Some(stored)));
    let client = TetherClient::builder()
        .url(url)
        .backoff(fast_backoff(3))
        .coalesce_window(Duration::ZERO)
        .build(Arc::clone(&store), Arc::clone(renewer));
    (client, store)
}

async fn wait_for_state<F>(client: &TetherClient, predicate: F) -> ConnectionState
where
    F: FnMut(&ConnectionState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), client.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("driver exited")
}

async fn authenticated(client: &TetherClient) {
    wait_for_state(client, |s| *s == ConnectionState::Authenticated).await;
}

/// Polls `check` until it holds, for up to two seconds.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never became true");
}

fn channel_handler(
    client: &TetherClient,
    topic: &str,
) -> mpsc::UnboundedReceiver<ClientEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.subscribe(topic, move |event| {
        let _ = tx.send(event);
    });
    rx
}

async fn recv_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("handler dropped")
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_client_connects_and_receives_room_events() {
    let (url, broadcaster) = start_server(GateConfig::default()).await;
    let renewer = Arc::new(IssuingRenewer::new());
    let (client, _) = client_for(&url, credential(3_600), &renewer);
    let mut updates = channel_handler(&client, "route_updated");

    client.join("route:R1").unwrap();
    authenticated(&client).await;
    eventually(|| {
        let b = broadcaster.clone();
        async move { b.members("route:R1").await.len() == 1 }
    })
    .await;

    broadcaster
        .broadcast("route:R1", "route_updated", b"{\"eta\":9}".to_vec())
        .await;

    match recv_event(&mut updates).await {
        ClientEvent::Broadcast(event) => assert_eq!(event.data, b"{\"eta\":9}".to_vec()),
        other => panic!("expected broadcast, got {other:?}"),
    }
    assert_eq!(renewer.calls(), 0);
}

#[tokio::test]
async fn test_client_renews_expired_credential_before_connecting() {
    let (url, broadcaster) = start_server(GateConfig::default()).await;
    let renewer = Arc::new(IssuingRenewer::new());
    let stale = credential(-60);
    let (client, store) = client_for(&url, stale.clone(), &renewer);

    authenticated(&client).await;

    assert_eq!(renewer.calls(), 1);
    assert_ne!(store.get(), Some(stale));
    assert!(broadcaster.in_grace().await.is_empty());
}

#[tokio::test]
async fn test_client_reauthenticates_in_place_when_credential_lapses() {
    let gate = GateConfig::default().with_grace_period(Duration::from_secs(3));
    let (url, broadcaster) = start_server(gate).await;
    let renewer = Arc::new(IssuingRenewer::new());
    let store = Arc::new(MemoryCredentialStore::new(Some(credential(2))));
    let client = TetherClient::builder()
        .url(&url)
        .guard(GuardConfig {
            safety_margin_secs: 0,
            ..GuardConfig::default()
        })
        .coalesce_window(Duration::ZERO)
        .build(Arc::clone(&store), Arc::clone(&renewer));
    let mut reauthenticated = channel_handler(&client, "reauthenticated");
    let mut disconnects = channel_handler(&client, "disconnect");

    authenticated(&client).await;
    let before = broadcaster.connections_of("driver-7").await;

    assert!(matches!(
        recv_event(&mut reauthenticated).await,
        ClientEvent::Reauthenticated { .. }
    ));
    authenticated(&client).await;

    assert_eq!(broadcaster.connections_of("driver-7").await, before);
    assert!(disconnects.try_recv().is_err(), "re-auth must not reconnect");
    assert_eq!(renewer.calls(), 1);
}

#[tokio::test]
async fn test_client_rejoins_rooms_after_server_disconnect() {
    let (url, broadcaster) = start_server(GateConfig::default()).await;
    let renewer = Arc::new(IssuingRenewer::new());
    let (client, _) = client_for(&url, credential(3_600), &renewer);
    let mut updates = channel_handler(&client, "route_updated");

    client.join("route:R1").unwrap();
    client.join("route:R2").unwrap();
    authenticated(&client).await;
    eventually(|| {
        let b = broadcaster.clone();
        async move { b.members("route:R2").await.len() == 1 }
    })
    .await;
    let first = broadcaster.connections_of("driver-7").await[0];

    assert!(broadcaster.disconnect(first).await);

    eventually(|| {
        let b = broadcaster.clone();
        async move {
            let members = b.members("route:R1").await;
            members.len() == 1 && members[0] != first && b.members("route:R2").await.len() == 1
        }
    })
    .await;

    broadcaster.broadcast("route:R1", "route_updated", vec![1]).await;
    assert!(matches!(
        recv_event(&mut updates).await,
        ClientEvent::Broadcast(_)
    ));
}

#[tokio::test]
async fn test_client_gives_up_when_server_unreachable() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let renewer = Arc::new(IssuingRenewer::new());
    let store = Arc::new(MemoryCredentialStore::new(Some(credential(3_600))));
    let client = TetherClient::builder()
        .url(&format!("ws://127.0.0.1:{port}"))
        .backoff(fast_backoff(2))
        .coalesce_window(Duration::ZERO)
        .build(store, renewer);
    let mut terminal = channel_handler(&client, "terminal");

    let state = wait_for_state(&client, |s| matches!(s, ConnectionState::Closed { .. })).await;

    assert_eq!(
        state,
        ConnectionState::Closed {
            terminal: Some(TerminalError::ConnectionLost)
        }
    );
    assert_eq!(
        recv_event(&mut terminal).await,
        ClientEvent::Terminal(TerminalError::ConnectionLost)
    );
}

#[tokio::test]
async fn test_client_forged_credential_requires_login() {
    let (url, _) = start_server(GateConfig::default()).await;
    let renewer = Arc::new(IssuingRenewer::new());
    let forged = credential_from(&JwtKeys::from_secret(b"not-the-server"), 3_600);
    let (client, _) = client_for(&url, forged, &renewer);

    let state = wait_for_state(&client, |s| matches!(s, ConnectionState::Closed { .. })).await;

    assert_eq!(
        state,
        ConnectionState::Closed {
            terminal: Some(TerminalError::LoginRequired)
        }
    );
    assert_eq!(renewer.calls(), 0);
}

#[tokio::test]
async fn test_client_disconnect_stays_closed() {
    let (url, broadcaster) = start_server(GateConfig::default()).await;
    let renewer = Arc::new(IssuingRenewer::new());
    let (client, _) = client_for(&url, credential(3_600), &renewer);
    authenticated(&client).await;

    client.disconnect().unwrap();

    wait_for_state(&client, |s| *s == ConnectionState::Closed { terminal: None }).await;
    eventually(|| {
        let b = broadcaster.clone();
        async move { b.connection_count().await == 0 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state(), ConnectionState::Closed { terminal: None });
    assert_eq!(broadcaster.connection_count().await, 0);
}

#[tokio::test]
async fn test_client_manual_reconnect_after_disconnect() {
    let (url, _) = start_server(GateConfig::default()).await;
    let renewer = Arc::new(IssuingRenewer::new());
    let (client, _) = client_for(&url, credential(3_600), &renewer);
    authenticated(&client).await;

    client.disconnect().unwrap();
    wait_for_state(&client, |s| matches!(s, ConnectionState::Closed { .. })).await;
    client.reconnect().unwrap();

    authenticated(&client).await;
}
