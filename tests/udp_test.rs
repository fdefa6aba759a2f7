//! Handshake and teardown over real UDP sockets on loopback.

mod common;

use bytes::Bytes;
use std::time::Duration;
use tokio::time::timeout;
use ucm_tokio::{CloseMode, CmConfig, CmEventKind, CmService, EndpointAttrs, UdpTransport};

#[tokio::test]
async fn test_udp_loopback_handshake() {
    common::init_tracing();
    let config = CmConfig::test().max_retries(6);
    let server = CmService::bind("127.0.0.1:0".parse().unwrap(), config.clone())
        .await
        .unwrap();
    let client = CmService::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap();

    let mut listener = server.listen(0x4000).unwrap();
    let mut client_ep = client.create_endpoint(EndpointAttrs::default());
    let mut server_ep = server.create_endpoint(EndpointAttrs::default());

    let conn = client
        .connect(
            &client_ep,
            *server.local_addr(),
            0x4000,
            Bytes::from_static(b"ping"),
        )
        .await
        .unwrap();

    let req = timeout(Duration::from_secs(5), listener.next_request())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(req.private_data().as_ref(), b"ping");
    assert_eq!(req.peer(), client.local_addr());
    server
        .accept(&req, &server_ep, Bytes::from_static(b"pong"))
        .await
        .unwrap();

    let ev = timeout(Duration::from_secs(5), client_ep.next_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.private_data().map(|b| b.as_ref()), Some(&b"pong"[..]));
    let ev = timeout(Duration::from_secs(5), server_ep.next_event())
        .await
        .unwrap()
        .unwrap();
    assert!(ev.is_connected());

    client.disconnect(&conn, CloseMode::Abrupt).await.unwrap();
    let ev = timeout(Duration::from_secs(5), server_ep.next_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.kind, CmEventKind::Disconnected);

    client_ep.free().await;
    server_ep.free().await;
    assert_eq!(client.counters().live(), 0);
    assert_eq!(server.counters().live(), 0);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_udp_custom_socket() {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let expected = socket.local_addr().unwrap();
    let service =
        CmService::with_transport(std::sync::Arc::new(UdpTransport::new(socket)), CmConfig::lan())
            .unwrap();
    assert_eq!(*service.local_addr(), expected);
    service.shutdown().await;
}
