//! Integration tests for room membership and fan-out.

use tether_protocol::RoomName;
use tether_room::{RoomConfig, RoomError, RoomRegistry};
use tether_transport::ConnectionId;
use tokio::sync::mpsc;

// =========================================================================
// Helpers
// =========================================================================

fn conn(n: u64) -> ConnectionId {
    ConnectionId::new(n)
}

fn room(name: &str) -> RoomName {
    RoomName::new(name)
}

/// Attaches `n` connections (ids 1..=n) and returns their receivers.
fn attached(
    reg: &mut RoomRegistry<String>,
    n: u64,
) -> Vec<mpsc::UnboundedReceiver<String>> {
    (1..=n)
        .map(|i| {
            let (tx, rx) = mpsc::unbounded_channel();
            reg.attach(conn(i), tx).unwrap();
            rx
        })
        .collect()
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

// =========================================================================
// Membership
// =========================================================================

#[test]
fn test_join_creates_room_and_leave_last_member_removes_it() {
    let mut reg = RoomRegistry::<String>::default();
    let _rx = attached(&mut reg, 1);

    assert!(reg.join(conn(1), room("route:R1")).unwrap());
    assert_eq!(reg.room_count(), 1);

    assert!(reg.leave(conn(1), &room("route:R1")));
    assert_eq!(reg.room_count(), 0);
}

#[test]
fn test_join_twice_is_idempotent() {
    let mut reg = RoomRegistry::<String>::default();
    let _rx = attached(&mut reg, 1);

    assert!(reg.join(conn(1), room("route:R1")).unwrap());
    assert!(!reg.join(conn(1), room("route:R1")).unwrap());
    assert_eq!(reg.members(&room("route:R1")), vec![conn(1)]);
}

#[test]
fn test_leave_non_member_returns_false() {
    let mut reg = RoomRegistry::<String>::default();
    let _rx = attached(&mut reg, 1);
    assert!(!reg.leave(conn(1), &room("route:R1")));
    assert!(!reg.leave(conn(9), &room("route:R1")));
}

#[test]
fn test_room_survives_while_any_member_remains() {
    let mut reg = RoomRegistry::<String>::default();
    let _rx = attached(&mut reg, 2);
    reg.join(conn(1), room("route:R1")).unwrap();
    reg.join(conn(2), room("route:R1")).unwrap();

    reg.leave(conn(1), &room("route:R1"));

    assert_eq!(reg.room_count(), 1);
    assert_eq!(reg.members(&room("route:R1")), vec![conn(2)]);
}

#[test]
fn test_join_unattached_connection_returns_error() {
    let mut reg = RoomRegistry::<String>::default();
    let result = reg.join(conn(1), room("route:R1"));
    assert!(matches!(result, Err(RoomError::NotAttached(_))));
}

#[test]
fn test_join_empty_name_returns_error() {
    let mut reg = RoomRegistry::<String>::default();
    let _rx = attached(&mut reg, 1);
    let result = reg.join(conn(1), room(""));
    assert!(matches!(result, Err(RoomError::InvalidName(_))));
}

#[test]
fn test_join_past_limit_returns_error() {
    let mut reg = RoomRegistry::<String>::new(RoomConfig {
        max_rooms_per_connection: 2,
    });
    let _rx = attached(&mut reg, 1);
    reg.join(conn(1), room("a")).unwrap();
    reg.join(conn(1), room("b")).unwrap();

    let result = reg.join(conn(1), room("c"));
    assert!(matches!(result, Err(RoomError::TooManyRooms(_, 2))));
    // Re-joining an existing room is still fine at the limit.
    assert!(!reg.join(conn(1), room("a")).unwrap());
}

#[test]
fn test_attach_twice_returns_error() {
    let mut reg = RoomRegistry::<String>::default();
    let _rx = attached(&mut reg, 1);
    let (tx, _rx2) = mpsc::unbounded_channel();
    assert!(matches!(
        reg.attach(conn(1), tx),
        Err(RoomError::AlreadyAttached(_))
    ));
}

#[test]
fn test_detach_leaves_every_room() {
    let mut reg = RoomRegistry::<String>::default();
    let _rx = attached(&mut reg, 2);
    reg.join(conn(1), room("route:R1")).unwrap();
    reg.join(conn(1), room("depot:7")).unwrap();
    reg.join(conn(2), room("depot:7")).unwrap();

    let left = reg.detach(conn(1));

    assert_eq!(left, vec![room("depot:7"), room("route:R1")]);
    assert_eq!(reg.room_count(), 1);
    assert_eq!(reg.members(&room("depot:7")), vec![conn(2)]);
    assert_eq!(reg.connection_count(), 1);
}

#[test]
fn test_rooms_of_is_sorted_by_name() {
    let mut reg = RoomRegistry::<String>::default();
    let _rx = attached(&mut reg, 1);
    reg.join(conn(1), room("zeta")).unwrap();
    reg.join(conn(1), room("alpha")).unwrap();

    assert_eq!(reg.rooms_of(conn(1)), vec![room("alpha"), room("zeta")]);
    assert!(reg.is_member(conn(1), &room("zeta")));
}

// =========================================================================
// Fan-out
// =========================================================================

#[test]
fn test_broadcast_reaches_only_members() {
    let mut reg = RoomRegistry::<String>::default();
    let mut rx = attached(&mut reg, 3);
    reg.join(conn(1), room("route:R1")).unwrap();
    reg.join(conn(2), room("route:R1")).unwrap();
    reg.join(conn(3), room("route:R2")).unwrap();

    let delivered = reg.broadcast(&room("route:R1"), &"eta:5".to_string());

    assert_eq!(delivered, 2);
    assert_eq!(drain(&mut rx[0]), vec!["eta:5"]);
    assert_eq!(drain(&mut rx[1]), vec!["eta:5"]);
    assert!(drain(&mut rx[2]).is_empty());
}

#[test]
fn test_broadcast_to_unknown_room_delivers_nothing() {
    let reg = RoomRegistry::<String>::default();
    assert_eq!(reg.broadcast(&room("nobody"), &"x".to_string()), 0);
}

#[test]
fn test_broadcast_skips_members_whose_task_exited() {
    let mut reg = RoomRegistry::<String>::default();
    let mut rx = attached(&mut reg, 2);
    reg.join(conn(1), room("route:R1")).unwrap();
    reg.join(conn(2), room("route:R1")).unwrap();

    let gone = rx.remove(0);
    drop(gone);

    assert_eq!(reg.broadcast(&room("route:R1"), &"x".to_string()), 1);
}

#[test]
fn test_send_to_targets_one_connection() {
    let mut reg = RoomRegistry::<String>::default();
    let mut rx = attached(&mut reg, 2);

    assert!(reg.send_to(conn(2), "hi".into()));
    assert!(!reg.send_to(conn(9), "hi".into()));

    assert!(drain(&mut rx[0]).is_empty());
    assert_eq!(drain(&mut rx[1]), vec!["hi"]);
}

#[test]
fn test_left_member_stops_receiving() {
    let mut reg = RoomRegistry::<String>::default();
    let mut rx = attached(&mut reg, 1);
    reg.join(conn(1), room("route:R1")).unwrap();
    reg.leave(conn(1), &room("route:R1"));

    reg.broadcast(&room("route:R1"), &"x".to_string());

    assert!(drain(&mut rx[0]).is_empty());
}
