//! Resilience tests: duplicated and lost datagrams, retry bounds and
//! backoff, and teardown against an unresponsive peer.

mod common;

use bytes::Bytes;
use common::{establish, next_event, next_request, settle, Pair};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use ucm_tokio::{
    CloseMode, CmConfig, CmError, CmEventKind, CmState, EndpointAttrs, Opcode, Verdict,
};

// ---------------------------------------------------------------------------
// Duplicate suppression
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_duplicate_req_single_request() {
    let pair = Pair::new(CmConfig::test());
    pair.net.set_filter(|d| match d.opcode() {
        Some(Opcode::Req) => Verdict::Duplicate,
        _ => Verdict::Deliver,
    });

    let mut listener = pair.server.listen(0x20).unwrap();
    let mut client_ep = pair.client.create_endpoint(EndpointAttrs::default());
    let server_ep = pair.server.create_endpoint(EndpointAttrs::default());
    pair.client
        .connect(&client_ep, pair.server_addr(), 0x20, Bytes::from_static(b"once"))
        .await
        .unwrap();

    let req = next_request(&mut listener).await;
    assert_eq!(req.private_data().as_ref(), b"once");
    pair.server
        .accept(&req, &server_ep, Bytes::new())
        .await
        .unwrap();
    assert!(next_event(&mut client_ep).await.is_connected());
    settle().await;
    assert!(listener.try_next_request().is_none());

    let server = pair.server.counters();
    assert_eq!(server.req_rx, 2);
    assert_eq!(server.dup_req, 1);
    assert_eq!(server.created, 1);
}

#[tokio::test(start_paused = true)]
async fn test_req_retransmit_while_pending_is_suppressed() {
    // The server never answers, so the client keeps retransmitting the same
    // REQ while the request sits with the application.
    let pair = Pair::new(CmConfig::test());
    let mut listener = pair.server.listen(0x21).unwrap();
    let mut ep = pair.client.create_endpoint(EndpointAttrs::default());
    pair.client
        .connect(&ep, pair.server_addr(), 0x21, Bytes::new())
        .await
        .unwrap();

    let _req = next_request(&mut listener).await;
    assert_eq!(next_event(&mut ep).await.kind, CmEventKind::Unreachable);
    assert!(listener.try_next_request().is_none());

    let server = pair.server.counters();
    assert_eq!(server.req_rx, 4);
    assert_eq!(server.dup_req, 3);
}

#[tokio::test(start_paused = true)]
async fn test_new_session_on_same_tuple_is_new_request() {
    let pair = Pair::new(CmConfig::test());
    let mut listener = pair.server.listen(0x22).unwrap();
    let ep = pair.client.create_endpoint(EndpointAttrs::default());

    pair.client
        .connect(&ep, pair.server_addr(), 0x22, Bytes::new())
        .await
        .unwrap();
    let first = next_request(&mut listener).await;

    // Replay the REQ with a different source session id from the same
    // client port: not a retransmission.
    let mut replay = ucm_tokio::Message::new(Opcode::Req);
    replay.sport = first.info().remote_port;
    replay.dport = 0x22;
    replay.s_id = first.info().remote_session ^ 0x5a5a;
    pair.net.inject(
        pair.client_addr(),
        pair.server_addr(),
        replay.to_bytes().unwrap(),
    );

    let second = next_request(&mut listener).await;
    assert_ne!(second.connection().id(), first.connection().id());
    assert_eq!(pair.server.counters().dup_req, 0);
}

// ---------------------------------------------------------------------------
// Retry bound and backoff
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_retry_bound_unreachable() {
    let pair = Pair::new(CmConfig::test());
    let sent_at = Arc::new(Mutex::new(Vec::new()));
    let log = sent_at.clone();
    pair.net.set_filter(move |d| match d.opcode() {
        Some(Opcode::Req) => {
            log.lock().push(Instant::now());
            Verdict::Drop
        }
        _ => Verdict::Deliver,
    });

    let _listener = pair.server.listen(0x30).unwrap();
    let mut ep = pair.client.create_endpoint(EndpointAttrs::default());
    let conn = pair
        .client
        .connect(&ep, pair.server_addr(), 0x30, Bytes::new())
        .await
        .unwrap();

    let ev = next_event(&mut ep).await;
    assert_eq!(ev.kind, CmEventKind::Unreachable);
    assert_eq!(ev.info.retries, 3);
    assert!(matches!(ev.into_error(), Some(CmError::Unreachable)));
    assert!(conn.is_released());

    settle().await;
    let times = sent_at.lock().clone();
    assert_eq!(times.len(), 4, "initial REQ plus max_retries retransmissions");
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps.windows(2).all(|g| g[1] > g[0]), "gaps {gaps:?}");
    assert!(gaps[0] >= Duration::from_millis(20));

    let client = pair.client.counters();
    assert_eq!(client.req_tx, 4);
    assert_eq!(client.req_retry, 3);
    assert!(ep.try_next_event().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_rep_exhaustion_local_failure() {
    let pair = Pair::new(CmConfig::test());
    pair.net.set_filter(|d| match d.opcode() {
        Some(Opcode::Rtu) => Verdict::Drop,
        _ => Verdict::Deliver,
    });

    let mut listener = pair.server.listen(0x31).unwrap();
    let mut client_ep = pair.client.create_endpoint(EndpointAttrs::default());
    let mut server_ep = pair.server.create_endpoint(EndpointAttrs::default());
    pair.client
        .connect(&client_ep, pair.server_addr(), 0x31, Bytes::new())
        .await
        .unwrap();
    let req = next_request(&mut listener).await;
    pair.server
        .accept(&req, &server_ep, Bytes::new())
        .await
        .unwrap();

    assert!(next_event(&mut client_ep).await.is_connected());
    let ev = next_event(&mut server_ep).await;
    assert_eq!(ev.kind, CmEventKind::LocalFailure);
    assert!(matches!(
        ev.into_error(),
        Some(CmError::ProtocolTimeout { retries: 3, .. })
    ));
    assert_eq!(pair.server.counters().rep_retry, 3);
    // Each REP retransmission was answered with a fresh RTU.
    assert_eq!(pair.client.counters().rtu_tx, 4);
}

// ---------------------------------------------------------------------------
// Lost handshake messages
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_lost_rtu_recovered() {
    let pair = Pair::new(CmConfig::test());
    let dropped = Arc::new(AtomicUsize::new(0));
    let seen = dropped.clone();
    pair.net.set_filter(move |d| match d.opcode() {
        Some(Opcode::Rtu) if seen.fetch_add(1, Ordering::SeqCst) == 0 => Verdict::Drop,
        _ => Verdict::Deliver,
    });

    let mut listener = pair.server.listen(0x40).unwrap();
    let mut client_ep = pair.client.create_endpoint(EndpointAttrs::default());
    let mut server_ep = pair.server.create_endpoint(EndpointAttrs::default());
    pair.client
        .connect(&client_ep, pair.server_addr(), 0x40, Bytes::new())
        .await
        .unwrap();
    let req = next_request(&mut listener).await;
    pair.server
        .accept(&req, &server_ep, Bytes::from_static(b"rep"))
        .await
        .unwrap();

    assert!(next_event(&mut client_ep).await.is_connected());
    assert!(next_event(&mut server_ep).await.is_connected());
    settle().await;
    assert!(client_ep.try_next_event().is_none());

    assert_eq!(pair.client.counters().rtu_tx, 2);
    assert_eq!(pair.server.counters().rep_retry, 1);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_over_lossy_network() {
    let config = CmConfig::test().max_retries(12);
    let pair = Pair::new(config);
    pair.net.set_loss_rate(0.25);
    pair.net.set_duplicate_rate(0.1);

    let mut listener = pair.server.listen(0x50).unwrap();
    let mut client_ep = pair.client.create_endpoint(EndpointAttrs::default());
    let mut server_ep = pair.server.create_endpoint(EndpointAttrs::default());
    pair.client
        .connect(&client_ep, pair.server_addr(), 0x50, Bytes::from_static(b"pd"))
        .await
        .unwrap();

    let req = next_request(&mut listener).await;
    pair.server
        .accept(&req, &server_ep, Bytes::new())
        .await
        .unwrap();
    assert!(next_event(&mut client_ep).await.is_connected());
    assert!(next_event(&mut server_ep).await.is_connected());

    settle().await;
    assert!(listener.try_next_request().is_none(), "duplicates never surface");
}

// ---------------------------------------------------------------------------
// Teardown against a silent peer
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_dreq_exhaustion_still_disconnects() {
    let pair = Pair::new(CmConfig::test());
    let mut est = establish(&pair, 0x60).await;
    pair.net.set_filter(|d| match d.opcode() {
        Some(Opcode::Dreq) => Verdict::Drop,
        _ => Verdict::Deliver,
    });

    pair.client
        .disconnect(&est.client_conn, CloseMode::Abrupt)
        .await
        .unwrap();
    assert_eq!(est.client_conn.state().await, CmState::Disconnected);
    assert_eq!(
        next_event(&mut est.client_ep).await.kind,
        CmEventKind::Disconnected
    );
    assert_eq!(pair.client.counters().dreq_retry, 3);
    assert_eq!(est.server_conn.state().await, CmState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_abrupt_disconnect_bounded_wait() {
    let client_config = CmConfig::test()
        .dreq_timeout(Duration::from_millis(100))
        .disconnect_wait(Duration::from_millis(50));
    let pair = Pair::with_configs(CmConfig::test(), client_config);
    let mut est = establish(&pair, 0x61).await;
    pair.net.set_filter(|d| match d.opcode() {
        Some(Opcode::Dreq) => Verdict::Drop,
        _ => Verdict::Deliver,
    });

    let err = pair
        .client
        .disconnect(&est.client_conn, CloseMode::Abrupt)
        .await
        .unwrap_err();
    assert!(matches!(err, CmError::Timeout { timeout_ms: 50 }));

    // Teardown carries on in the background.
    assert_eq!(
        next_event(&mut est.client_ep).await.kind,
        CmEventKind::Disconnected
    );
}
