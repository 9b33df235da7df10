//! Live route board: a server publishing stop ETAs and a dispatcher
//! dashboard following them through short-lived credentials.
//!
//! ```text
//! cargo run -p route-board -- [config.toml]
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether::client::GuardError;
use tether::prelude::*;
use tether::protocol::unix_secs;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub route: String,
    pub stop: u32,
    pub eta_minutes: u32,
}

fn room_of(route: &str) -> RoomName {
    RoomName::new(format!("route:{route}"))
}

/// Publishes one update to the route's room. Returns how many
/// connections it was queued for.
async fn publish(broadcaster: &Broadcaster, update: &RouteUpdate) -> usize {
    let data = match serde_json::to_vec(update) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode route update");
            return 0;
        }
    };
    broadcaster
        .broadcast(room_of(&update.route), "route_updated", data)
        .await
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Stands in for the auth service: signs credentials with the same key
/// the server verifies.
struct LocalIssuer {
    keys: JwtKeys,
    ttl_secs: u64,
}

impl LocalIssuer {
    fn issue(&self, sub: &str, role: &str, username: &str) -> Result<Credential, GuardError> {
        let now = unix_secs();
        let claims = Claims {
            sub: sub.into(),
            role: role.into(),
            username: username.into(),
            exp: now + self.ttl_secs,
            iat: now,
        };
        let token = self
            .keys
            .issue(&claims)
            .map_err(|e| GuardError::Renewal(e.to_string()))?;
        Ok(Credential::parse(token)?)
    }
}

impl CredentialRenewer for LocalIssuer {
    async fn renew(&self, current: &Credential) -> Result<Credential, GuardError> {
        let claims = current.claims();
        tracing::info!(sub = %claims.sub, "issuing renewed credential");
        self.issue(&claims.sub, &claims.role, &claims.username)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info,tether=debug");

    let config = match std::env::args().nth(1) {
        Some(path) => TetherConfig::load(path)?,
        None => TetherConfig::default(),
    };
    let secret =
        std::env::var("ROUTE_BOARD_SECRET").unwrap_or_else(|_| "route-board-dev-secret".into());

    let server = TetherServerBuilder::from_config(&config)
        .build(JwtKeys::from_secret(secret.as_bytes()))
        .await?;
    let url = format!("ws://{}", server.local_addr()?);
    let broadcaster = server.broadcaster();
    tracing::info!(%url, "route board listening");

    // Dispatcher dashboard. Credentials live 20 seconds, so the board
    // renews (and the server re-checks) several times a minute.
    let issuer = Arc::new(LocalIssuer {
        keys: JwtKeys::from_secret(secret.as_bytes()),
        ttl_secs: 20,
    });
    let store = Arc::new(MemoryCredentialStore::new(Some(issuer.issue(
        "dispatcher-1",
        "dispatcher",
        "dana",
    )?)));
    let dashboard = TetherClient::builder()
        .config(config.client.clone())
        .url(&url)
        .build(store, issuer);
    dashboard.join(room_of("R1"))?;
    dashboard.subscribe("route_updated", |event| {
        if let ClientEvent::Broadcast(event) = event {
            match serde_json::from_slice::<RouteUpdate>(&event.data) {
                Ok(update) => tracing::info!(?update, "board updated"),
                Err(e) => tracing::warn!(error = %e, "unreadable route update"),
            }
        }
    });
    dashboard.subscribe("terminal", |event| {
        tracing::error!(?event, "dashboard stopped");
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        let mut stop = 0u32;
        loop {
            ticker.tick().await;
            stop = stop % 12 + 1;
            let update = RouteUpdate {
                route: "R1".into(),
                stop,
                eta_minutes: 12 - stop,
            };
            let delivered = publish(&broadcaster, &update).await;
            tracing::debug!(stop, delivered, "published");
        }
    });

    server.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"route-board-test";

    #[tokio::test]
    async fn test_publish_reaches_dashboard_subscriber() {
        let server = TetherServerBuilder::new()
            .bind("127.0.0.1:0")
            .build(JwtKeys::from_secret(SECRET))
            .await
            .unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let broadcaster = server.broadcaster();
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let issuer = Arc::new(LocalIssuer {
            keys: JwtKeys::from_secret(SECRET),
            ttl_secs: 3_600,
        });
        let store = Arc::new(MemoryCredentialStore::new(Some(
            issuer.issue("dispatcher-1", "dispatcher", "dana").unwrap(),
        )));
        let dashboard = TetherClient::builder()
            .url(&url)
            .coalesce_window(Duration::ZERO)
            .build(store, issuer);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        dashboard.subscribe("route_updated", move |event| {
            let _ = tx.send(event);
        });
        dashboard.join(room_of("R1")).unwrap();

        let update = RouteUpdate {
            route: "R1".into(),
            stop: 3,
            eta_minutes: 9,
        };
        for _ in 0..100 {
            if broadcaster.members(room_of("R1")).await.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(publish(&broadcaster, &update).await, 1);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ClientEvent::Broadcast(event) => {
                assert_eq!(serde_json::from_slice::<RouteUpdate>(&event.data).unwrap(), update);
            }
            other => panic!("expected broadcast, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_to_empty_route_delivers_nothing() {
        let server = TetherServerBuilder::new()
            .bind("127.0.0.1:0")
            .build(JwtKeys::from_secret(SECRET))
            .await
            .unwrap();
        let update = RouteUpdate {
            route: "R9".into(),
            stop: 1,
            eta_minutes: 1,
        };
        assert_eq!(publish(&server.broadcaster(), &update).await, 0);
    }
}
