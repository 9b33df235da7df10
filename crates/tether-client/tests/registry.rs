//! Integration tests for event subscriptions and coalescing.
//!
//! Paused-clock tests: `sleep` advances the Tokio clock instantly once all
//! tasks are idle, so window boundaries are deterministic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_client::{ClientEvent, ConnectionState, EventRegistry, TerminalError};
use tether_protocol::{DisconnectReason, RoomEvent};

// =========================================================================
// Helpers
// =========================================================================

type Seen = Arc<Mutex<Vec<ClientEvent>>>;

fn recorder() -> (Seen, impl Fn(ClientEvent) + Send + Sync + 'static) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |event| sink.lock().unwrap().push(event))
}

fn update(n: u8) -> ClientEvent {
    ClientEvent::Broadcast(RoomEvent {
        room: "route:R1".into(),
        name: "route_updated".into(),
        data: vec![n],
    })
}

fn payloads(seen: &Seen) -> Vec<u8> {
    seen.lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Broadcast(ev) => ev.data.first().copied(),
            _ => None,
        })
        .collect()
}

async fn settle() {
    // Let the delivery tasks run.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

const WINDOW: Duration = Duration::from_millis(100);

// =========================================================================
// Coalescing
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_burst_within_window_delivers_only_last() {
    let registry = EventRegistry::new(WINDOW);
    let (seen, handler) = recorder();
    registry.subscribe("route_updated", handler);

    for n in 1..=5 {
        registry.emit(update(n));
    }
    tokio::time::sleep(WINDOW * 2).await;

    assert_eq!(payloads(&seen), vec![5]);
}

#[tokio::test(start_paused = true)]
async fn test_nothing_delivered_before_window_closes() {
    let registry = EventRegistry::new(WINDOW);
    let (seen, handler) = recorder();
    registry.subscribe("route_updated", handler);

    registry.emit(update(1));
    tokio::time::sleep(WINDOW / 2).await;
    assert!(payloads(&seen).is_empty());

    tokio::time::sleep(WINDOW).await;
    assert_eq!(payloads(&seen), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_separate_bursts_each_deliver_their_last() {
    let registry = EventRegistry::new(WINDOW);
    let (seen, handler) = recorder();
    registry.subscribe("route_updated", handler);

    registry.emit(update(1));
    registry.emit(update(2));
    tokio::time::sleep(WINDOW * 3).await;
    registry.emit(update(3));
    registry.emit(update(4));
    tokio::time::sleep(WINDOW * 3).await;

    assert_eq!(payloads(&seen), vec![2, 4]);
}

#[tokio::test]
async fn test_zero_window_delivers_every_event_in_order() {
    let registry = EventRegistry::new(Duration::ZERO);
    let (seen, handler) = recorder();
    registry.subscribe("route_updated", handler);

    for n in 1..=4 {
        registry.emit(update(n));
    }
    settle().await;

    assert_eq!(payloads(&seen), vec![1, 2, 3, 4]);
}

// =========================================================================
// Topics and handlers
// =========================================================================

#[tokio::test]
async fn test_emit_routes_by_topic() {
    let registry = EventRegistry::new(Duration::ZERO);
    let (terminal_seen, on_terminal) = recorder();
    let (state_seen, on_state) = recorder();
    registry.subscribe("terminal", on_terminal);
    registry.subscribe("state", on_state);

    assert_eq!(registry.emit(ClientEvent::Terminal(TerminalError::ConnectionLost)), 1);
    assert_eq!(
        registry.emit(ClientEvent::Disconnected {
            reason: DisconnectReason::TransportClose
        }),
        0
    );
    settle().await;

    assert_eq!(
        *terminal_seen.lock().unwrap(),
        vec![ClientEvent::Terminal(TerminalError::ConnectionLost)]
    );
    assert!(state_seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_many_handlers_per_topic_all_called() {
    let registry = EventRegistry::new(Duration::ZERO);
    let (a, on_a) = recorder();
    let (b, on_b) = recorder();
    registry.subscribe("state", on_a);
    registry.subscribe("state", on_b);

    registry.emit(ClientEvent::StateChanged(ConnectionState::Authenticated));
    settle().await;

    assert_eq!(a.lock().unwrap().len(), 1);
    assert_eq!(b.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_removes_only_that_handler() {
    let registry = EventRegistry::new(Duration::ZERO);
    let (a, on_a) = recorder();
    let (b, on_b) = recorder();
    let sub_a = registry.subscribe("route_updated", on_a);
    registry.subscribe("route_updated", on_b);

    sub_a.unsubscribe();
    assert_eq!(registry.handler_count("route_updated"), 1);

    registry.emit(update(1));
    settle().await;

    assert!(payloads(&a).is_empty());
    assert_eq!(payloads(&b), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_drops_pending_window() {
    let registry = EventRegistry::new(WINDOW);
    let (seen, handler) = recorder();
    let sub = registry.subscribe("route_updated", handler);

    registry.emit(update(1));
    settle().await;
    sub.unsubscribe();
    tokio::time::sleep(WINDOW * 2).await;

    assert!(payloads(&seen).is_empty());
}

#[tokio::test]
async fn test_unsubscribe_after_registry_dropped_is_noop() {
    let registry = EventRegistry::new(Duration::ZERO);
    let (_, handler) = recorder();
    let sub = registry.subscribe("state", handler);
    drop(registry);
    sub.unsubscribe();
}
