//! Connection object lifecycle: every object is destroyed exactly once,
//! after the registry, its endpoint and any in-flight pass let go.

mod common;

use bytes::Bytes;
use common::{establish, faulty_service, next_event, next_request, settle, Pair};
use std::sync::Arc;
use std::time::Duration;
use ucm_tokio::{
    CloseMode, CmConfig, CmError, CmEventKind, CmService, EndpointAttrs, MemoryNetwork, Opcode,
    ResourceKind, Verdict,
};

#[tokio::test(start_paused = true)]
async fn test_destroyed_after_disconnect_and_free() {
    let pair = Pair::new(CmConfig::test());
    let mut est = establish(&pair, 0x100).await;

    pair.client
        .disconnect(&est.client_conn, CloseMode::Abrupt)
        .await
        .unwrap();
    assert_eq!(next_event(&mut est.server_ep).await.kind, CmEventKind::Disconnected);

    // Still held by the registry and the endpoints.
    settle().await;
    assert!(!est.client_conn.is_destroyed());
    assert!(!est.server_conn.is_destroyed());
    assert_eq!(pair.client.connections().await.len(), 1);

    est.client_ep.free().await;
    assert!(est.client_conn.is_destroyed());
    est.server_ep.free().await;
    assert!(est.server_conn.is_destroyed());

    for counters in [pair.client.counters(), pair.server.counters()] {
        assert_eq!(counters.created, 1);
        assert_eq!(counters.destroyed, 1);
        assert_eq!(counters.live(), 0);
    }
    assert!(pair.client.connections().await.is_empty());
    assert!(pair.server.connections().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_free_mid_handshake() {
    let pair = Pair::new(CmConfig::test());
    let mut listener = pair.server.listen(0x101).unwrap();
    let ep = pair.client.create_endpoint(EndpointAttrs::default());
    let conn = pair
        .client
        .connect(&ep, pair.server_addr(), 0x101, Bytes::new())
        .await
        .unwrap();
    let req = next_request(&mut listener).await;

    ep.free().await;
    assert!(conn.is_destroyed());
    assert_eq!(pair.client.counters().live(), 0);

    // The late REP finds nothing and is dropped.
    let server_ep = pair.server.create_endpoint(EndpointAttrs::default());
    pair.server
        .accept(&req, &server_ep, Bytes::new())
        .await
        .unwrap();
    settle().await;
    assert!(pair.client.counters().unmatched >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_request_destroyed() {
    let pair = Pair::new(CmConfig::test());
    let mut listener = pair.server.listen(0x102).unwrap();
    let mut ep = pair.client.create_endpoint(EndpointAttrs::default());
    pair.client
        .connect(&ep, pair.server_addr(), 0x102, Bytes::new())
        .await
        .unwrap();
    let req = next_request(&mut listener).await;
    pair.server.reject(&req, 1, Bytes::new()).await.unwrap();
    assert!(matches!(
        next_event(&mut ep).await.kind,
        CmEventKind::Rejected(_)
    ));

    settle().await;
    assert!(req.connection().is_destroyed());
    let server = pair.server.counters();
    assert_eq!((server.created, server.destroyed), (1, 1));

    ep.free().await;
    let client = pair.client.counters();
    assert_eq!((client.created, client.destroyed), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn test_endpoint_reused_after_unreachable() {
    let pair = Pair::new(CmConfig::test());
    pair.net.set_filter(|d| match d.opcode() {
        Some(Opcode::Req) => Verdict::Drop,
        _ => Verdict::Deliver,
    });
    let mut listener = pair.server.listen(0x103).unwrap();
    let mut ep = pair.client.create_endpoint(EndpointAttrs::default());

    let first = pair
        .client
        .connect(&ep, pair.server_addr(), 0x103, Bytes::new())
        .await
        .unwrap();
    assert_eq!(next_event(&mut ep).await.kind, CmEventKind::Unreachable);
    settle().await;

    pair.net.clear_filter();
    let second = pair
        .client
        .connect(&ep, pair.server_addr(), 0x103, Bytes::new())
        .await
        .unwrap();
    assert!(first.is_destroyed());
    assert_ne!(first.id(), second.id());
    // The released service id is handed out again.
    assert_eq!(first.local_port(), second.local_port());

    let req = next_request(&mut listener).await;
    let server_ep = pair.server.create_endpoint(EndpointAttrs::default());
    pair.server
        .accept(&req, &server_ep, Bytes::new())
        .await
        .unwrap();
    assert!(next_event(&mut ep).await.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_listener_stop_releases_pending_requests() {
    let pair = Pair::new(CmConfig::test());
    let mut listener = pair.server.listen(0x104).unwrap();
    let ep = pair.client.create_endpoint(EndpointAttrs::default());
    pair.client
        .connect(&ep, pair.server_addr(), 0x104, Bytes::new())
        .await
        .unwrap();
    let req = next_request(&mut listener).await;

    listener.stop();
    assert!(listener.next_request().await.is_none());
    settle().await;
    assert!(req.connection().is_destroyed());
    assert_eq!(pair.server.counters().live(), 0);

    let server_ep = pair.server.create_endpoint(EndpointAttrs::default());
    let err = pair
        .server
        .accept(&req, &server_ep, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CmError::InvalidState { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything() {
    let pair = Pair::new(CmConfig::test());
    let est = establish(&pair, 0x105).await;

    let disconnected = est.client_conn.clone();
    let waiter = tokio::spawn(async move { disconnected.wait_disconnected().await });

    pair.client.shutdown().await;
    pair.server.shutdown().await;
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();

    let mut listener = est.listener;
    assert!(listener.next_request().await.is_none());
    assert!(matches!(pair.client.listen(1), Err(CmError::Closed)));
    let ep = pair.client.create_endpoint(EndpointAttrs::default());
    assert!(matches!(
        pair.client
            .connect(&ep, pair.server_addr(), 1, Bytes::new())
            .await,
        Err(CmError::Closed)
    ));

    drop(est.client_ep);
    drop(est.server_ep);
    for counters in [pair.client.counters(), pair.server.counters()] {
        assert_eq!(counters.created, counters.destroyed);
    }
    assert!(est.client_conn.is_destroyed());
    assert!(est.server_conn.is_destroyed());
}

// ---------------------------------------------------------------------------
// Send failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_connect_send_failure_releases_object() {
    let net = MemoryNetwork::new();
    let server = CmService::with_transport(Arc::new(net.bind()), CmConfig::test()).unwrap();
    let (client, transport) = faulty_service(&net, CmConfig::test());
    let mut listener = server.listen(0x110).unwrap();
    let ep = client.create_endpoint(EndpointAttrs::default());

    transport.refuse_sends(true);
    let err = client
        .connect(&ep, *server.local_addr(), 0x110, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CmError::ResourceExhausted {
            resource: ResourceKind::Transport
        }
    ));
    assert!(ep.connection().is_none());

    settle().await;
    let counters = client.counters();
    assert_eq!(counters.send_errors, 1);
    assert_eq!(counters.req_tx, 0);
    assert_eq!((counters.created, counters.destroyed), (1, 1));
    assert!(client.connections().await.is_empty());
    assert!(listener.try_next_request().is_none());

    // The failed attempt gave its service id back.
    transport.refuse_sends(false);
    let conn = client
        .connect(&ep, *server.local_addr(), 0x110, Bytes::new())
        .await
        .unwrap();
    assert_eq!(conn.local_port(), 0xffff);
    next_request(&mut listener).await;
}

#[tokio::test(start_paused = true)]
async fn test_accept_send_failure_releases_object() {
    let net = MemoryNetwork::new();
    let (server, transport) = faulty_service(&net, CmConfig::test());
    let client = CmService::with_transport(Arc::new(net.bind()), CmConfig::test()).unwrap();
    let mut listener = server.listen(0x111).unwrap();
    let client_ep = client.create_endpoint(EndpointAttrs::default());
    let server_ep = server.create_endpoint(EndpointAttrs::default());

    client
        .connect(&client_ep, *server.local_addr(), 0x111, Bytes::new())
        .await
        .unwrap();
    let req = next_request(&mut listener).await;

    transport.refuse_sends(true);
    let err = server
        .accept(&req, &server_ep, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CmError::ResourceExhausted { .. }));
    assert!(server_ep.connection().is_none());
    assert!(req.connection().is_released());

    settle().await;
    assert!(req.connection().is_destroyed());
    let counters = server.counters();
    assert_eq!(counters.send_errors, 1);
    assert_eq!(counters.rep_tx, 0);
}

#[tokio::test(start_paused = true)]
async fn test_full_send_ring_fails_fast() {
    let net = MemoryNetwork::new();
    let server = CmService::with_transport(Arc::new(net.bind()), CmConfig::test()).unwrap();
    let (client, transport) = faulty_service(&net, CmConfig::test().send_slots(1).tx_burst(1));
    let _listener = server.listen(0x112).unwrap();
    transport.delay_sends(Duration::from_secs(1));

    let eps: Vec<_> = (0..3)
        .map(|_| client.create_endpoint(EndpointAttrs::default()))
        .collect();
    let to = *server.local_addr();
    let start = tokio::time::Instant::now();
    let (a, b, c) = tokio::join!(
        client.connect(&eps[0], to, 0x112, Bytes::new()),
        client.connect(&eps[1], to, 0x112, Bytes::new()),
        client.connect(&eps[2], to, 0x112, Bytes::new()),
    );

    // One REQ holds the only slot; the others are refused rather than queued.
    assert!(a.is_ok());
    for result in [b, c] {
        assert!(matches!(
            result,
            Err(CmError::ResourceExhausted {
                resource: ResourceKind::SendSlots
            })
        ));
    }
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(client.counters().send_errors, 2);
}
