//! Integration tests for the WebSocket transport.
//!
//! These spin up a real listener on an OS-assigned port and dial it with
//! the same `WebSocketConnection` type the client uses, so both halves of
//! the transport are exercised over a real socket.

#[cfg(feature = "websocket")]
mod websocket {
    use std::time::Duration;

    use tether_transport::{
        Connection, Transport, WebSocketConnection, WebSocketTransport,
    };

    /// Binds a transport on `127.0.0.1:0` and returns it with its URL.
    async fn bind() -> (WebSocketTransport, String) {
        let transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("should have local addr");
        (transport, format!("ws://{addr}"))
    }

    /// Accepts one connection while dialing it from the client side.
    async fn pair() -> (WebSocketConnection, WebSocketConnection) {
        let (mut transport, url) = bind().await;
        let server = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });
        let client = WebSocketConnection::connect(&url)
            .await
            .expect("client should connect");
        let server = server.await.expect("accept task should complete");
        (server, client)
    }

    #[tokio::test]
    async fn test_websocket_accept_and_send_receive() {
        let (server, client) = pair().await;

        client.send(b"hello server").await.expect("client send");
        let received = server.recv().await.expect("server recv");
        assert_eq!(received.as_deref(), Some(&b"hello server"[..]));

        server.send(b"hello client").await.expect("server send");
        let received = client.recv().await.expect("client recv");
        assert_eq!(received.as_deref(), Some(&b"hello client"[..]));
    }

    #[tokio::test]
    async fn test_websocket_connections_get_distinct_ids() {
        let (server, client) = pair().await;
        assert_ne!(server.id(), client.id());
    }

    #[tokio::test]
    async fn test_websocket_both_sides_know_peer_addr() {
        let (server, client) = pair().await;
        let server_peer = server.peer_addr().expect("server sees client addr");
        let client_peer = client.peer_addr().expect("client sees server addr");
        assert!(server_peer.ip().is_loopback());
        assert!(client_peer.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_after_peer_close() {
        let (server, client) = pair().await;

        client.close().await.expect("client close");

        let received = tokio::time::timeout(Duration::from_secs(2), server.recv())
            .await
            .expect("recv should not hang")
            .expect("clean close is not an error");
        assert!(received.is_none(), "clean close should yield None");
    }

    #[tokio::test]
    async fn test_websocket_send_while_other_task_is_receiving() {
        // A task parked in recv() must not block sends on the same
        // connection: the sink and stream halves are locked separately.
        let (server, client) = pair().await;
        let server = std::sync::Arc::new(server);

        let reader = {
            let server = std::sync::Arc::clone(&server);
            tokio::spawn(async move { server.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), server.send(b"ping"))
            .await
            .expect("send must not wait for the reader")
            .expect("send should succeed");
        assert_eq!(
            client.recv().await.expect("client recv").as_deref(),
            Some(&b"ping"[..])
        );

        client.send(b"pong").await.expect("client send");
        let got = reader.await.expect("reader task").expect("server recv");
        assert_eq!(got.as_deref(), Some(&b"pong"[..]));
    }

    #[tokio::test]
    async fn test_websocket_connect_to_closed_port_fails() {
        let (transport, url) = bind().await;
        drop(transport);

        let result = WebSocketConnection::connect(&url).await;
        assert!(
            matches!(
                result,
                Err(tether_transport::TransportError::ConnectFailed(_))
            ),
            "dialing a closed port should fail"
        );
    }
}
