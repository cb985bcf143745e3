use super::*;
use serde_json::json;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        jitter: false,
    }
}

struct Harness {
    transport: Transport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    connector: Arc<LoopbackConnector>,
    acceptor: LoopbackAcceptor,
}

fn harness(policy: ReconnectPolicy) -> Harness {
    let (connector, acceptor) = LoopbackConnector::new();
    let connector = Arc::new(connector);
    let (transport, events) =
        Transport::new(connector.clone(), Arc::new(StaticToken::new("ticket-1")), policy);
    Harness { transport, events, connector, acceptor }
}

async fn wait_status(transport: &Transport, status: ConnectionStatus) -> ConnectionState {
    let mut rx = transport.status();
    let state = timeout(WAIT, rx.wait_for(|s| s.status == status))
        .await
        .expect("status wait timed out")
        .expect("status channel closed");
    *state
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(WAIT, events.recv()).await.expect("event wait timed out").expect("events closed")
}

#[tokio::test]
async fn connect_without_token_is_authentication_error() {
    let (connector, _acceptor) = LoopbackConnector::new();
    let (transport, _events) =
        Transport::new(Arc::new(connector), Arc::new(StaticToken::empty()), fast_policy(1));

    let err = transport.connect().await.unwrap_err();

    assert_eq!(err, TransportError::Authentication);
    assert_eq!(transport.state().status, ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn connect_presents_token_and_reports_connected_first() {
    let mut h = harness(fast_policy(3));
    h.transport.connect().await.unwrap();

    let peer = timeout(WAIT, h.acceptor.accept()).await.unwrap().unwrap();
    assert_eq!(peer.token, "ticket-1");
    peer.push(Frame::event("task:update", json!({"id": 1})));

    assert_eq!(next_event(&mut h.events).await, TransportEvent::Connected { generation: 1 });
    match next_event(&mut h.events).await {
        TransportEvent::Frame(frame) => assert_eq!(frame.syscall, "task:update"),
        other => panic!("expected frame, got {other:?}"),
    }
    let state = wait_status(&h.transport, ConnectionStatus::Connected).await;
    assert_eq!(state.retry_count, 0);
    assert_eq!(state.generation, 1);
}

#[tokio::test]
async fn inbound_events_keep_wire_order() {
    let mut h = harness(fast_policy(3));
    h.transport.connect().await.unwrap();
    let peer = timeout(WAIT, h.acceptor.accept()).await.unwrap().unwrap();
    for i in 0..5 {
        peer.push(Frame::event("comment:create", json!({"seq": i})));
    }

    assert!(matches!(next_event(&mut h.events).await, TransportEvent::Connected { .. }));
    for i in 0..5 {
        match next_event(&mut h.events).await {
            TransportEvent::Frame(frame) => assert_eq!(frame.data["seq"], i),
            other => panic!("expected frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn request_resolves_with_correlated_reply() {
    let mut h = harness(fast_policy(3));
    h.transport.connect().await.unwrap();
    let mut peer = timeout(WAIT, h.acceptor.accept()).await.unwrap().unwrap();
    wait_status(&h.transport, ConnectionStatus::Connected).await;

    let server = tokio::spawn(async move {
        let req = peer.recv().await.unwrap();
        peer.push(Frame::event("task:update", json!({"unrelated": true})));
        peer.push(req.done_with(json!({"id": 42, "title": "renamed"})));
        peer
    });

    let reply = h
        .transport
        .request(Frame::request("task:update", json!({"id": 42})), WAIT)
        .await
        .unwrap();
    assert_eq!(reply.data["title"], "renamed");
    let _peer = server.await.unwrap();

    // The reply went to the waiter; only the unrelated event reached the stream.
    assert!(matches!(next_event(&mut h.events).await, TransportEvent::Connected { .. }));
    match next_event(&mut h.events).await {
        TransportEvent::Frame(frame) => assert_eq!(frame.data["unrelated"], true),
        other => panic!("expected frame, got {other:?}"),
    }
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn request_error_reply_is_rejected() {
    let mut h = harness(fast_policy(3));
    h.transport.connect().await.unwrap();
    let mut peer = timeout(WAIT, h.acceptor.accept()).await.unwrap().unwrap();
    wait_status(&h.transport, ConnectionStatus::Connected).await;

    tokio::spawn(async move {
        let req = peer.recv().await.unwrap();
        peer.push(req.error_reply("E_FORBIDDEN", "not your task"));
        peer
    });

    let err = h
        .transport
        .request(Frame::request("task:delete", json!({"id": 7})), WAIT)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        TransportError::Rejected {
            syscall: "task:delete".into(),
            code: Some("E_FORBIDDEN".into()),
            message: "not your task".into(),
        }
    );
}

#[tokio::test]
async fn request_times_out_without_reply() {
    let mut h = harness(fast_policy(3));
    h.transport.connect().await.unwrap();
    let _peer = timeout(WAIT, h.acceptor.accept()).await.unwrap().unwrap();
    wait_status(&h.transport, ConnectionStatus::Connected).await;

    let err = h
        .transport
        .request(Frame::request("task:get", json!({})), Duration::from_millis(30))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Timeout);
}

#[tokio::test]
async fn send_while_disconnected_is_not_connected() {
    let h = harness(fast_policy(3));
    let err = h.transport.send(Frame::join_channel("project:1")).unwrap_err();
    assert_eq!(err, TransportError::NotConnected);
}

#[tokio::test]
async fn dropped_link_reconnects_under_new_generation() {
    let mut h = harness(fast_policy(3));
    h.transport.connect().await.unwrap();
    let first = timeout(WAIT, h.acceptor.accept()).await.unwrap().unwrap();
    assert!(matches!(next_event(&mut h.events).await, TransportEvent::Connected { generation: 1 }));

    drop(first);

    assert_eq!(next_event(&mut h.events).await, TransportEvent::Disconnected);
    let _second = timeout(WAIT, h.acceptor.accept()).await.unwrap().unwrap();
    assert_eq!(next_event(&mut h.events).await, TransportEvent::Connected { generation: 2 });
    let state = wait_status(&h.transport, ConnectionStatus::Connected).await;
    assert_eq!(state.retry_count, 0);
}

#[tokio::test]
async fn request_in_flight_fails_when_link_drops() {
    let mut h = harness(fast_policy(3));
    h.transport.connect().await.unwrap();
    let mut peer = timeout(WAIT, h.acceptor.accept()).await.unwrap().unwrap();
    wait_status(&h.transport, ConnectionStatus::Connected).await;

    tokio::spawn(async move {
        let _req = peer.recv().await;
        drop(peer);
    });

    let err = h
        .transport
        .request(Frame::request("task:update", json!({})), WAIT)
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Closed);
}

#[tokio::test]
async fn exhausted_retries_go_offline_until_manual_retry() {
    let mut h = harness(fast_policy(2));
    h.connector.refuse_next(10);
    h.transport.connect().await.unwrap();

    let state = wait_status(&h.transport, ConnectionStatus::Offline).await;
    assert_eq!(state.retry_count, 2);
    assert_eq!(next_event(&mut h.events).await, TransportEvent::LinkDown);
    // Initial attempt plus two retries.
    assert_eq!(h.connector.attempts(), 3);

    h.connector.refuse_next(0);
    h.transport.retry().await.unwrap();
    let _peer = timeout(WAIT, h.acceptor.accept()).await.unwrap().unwrap();
    assert_eq!(next_event(&mut h.events).await, TransportEvent::Connected { generation: 1 });
}

#[tokio::test]
async fn disconnect_cancels_pending_retry() {
    let policy = ReconnectPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(50),
        jitter: false,
    };
    let h = harness(policy);
    h.connector.refuse_next(10);
    h.transport.connect().await.unwrap();
    wait_status(&h.transport, ConnectionStatus::Reconnecting).await;

    h.transport.disconnect().await;
    let attempts = h.connector.attempts();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(h.connector.attempts(), attempts);
    assert_eq!(h.transport.state().status, ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn second_connect_while_running_is_noop() {
    let mut h = harness(fast_policy(3));
    h.transport.connect().await.unwrap();
    h.transport.connect().await.unwrap();
    let _peer = timeout(WAIT, h.acceptor.accept()).await.unwrap().unwrap();
    wait_status(&h.transport, ConnectionStatus::Connected).await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.connector.attempts(), 1);
}

/// Mints a fresh numbered ticket per `token()` call.
#[derive(Default)]
struct MintingTokens {
    minted: AtomicU64,
}

#[async_trait::async_trait]
impl TokenSource for MintingTokens {
    async fn token(&self) -> Option<String> {
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        Some(format!("ticket-{n}"))
    }

    async fn has_token(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn connect_mints_one_ticket_per_link() {
    let (connector, mut acceptor) = LoopbackConnector::new();
    let tokens = Arc::new(MintingTokens::default());
    let (transport, _events) = Transport::new(Arc::new(connector), tokens.clone(), fast_policy(3));

    transport.connect().await.unwrap();
    let peer = timeout(WAIT, acceptor.accept()).await.unwrap().unwrap();
    wait_status(&transport, ConnectionStatus::Connected).await;

    assert_eq!(peer.token, "ticket-1");
    assert_eq!(tokens.minted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn session_ticket_source_checks_session_without_exchanging() {
    // Nothing listens here; has_token must not hit the network.
    let signed_in = SessionTicketSource::new("http://127.0.0.1:9", "sess-1");
    assert!(signed_in.has_token().await);

    let signed_out = SessionTicketSource::new("http://127.0.0.1:9", "");
    assert!(!signed_out.has_token().await);
}

#[test]
fn ws_url_converts_scheme_and_appends_ticket() {
    assert_eq!(
        ws_url("http://localhost:3000/", "abc").unwrap(),
        "ws://localhost:3000/api/ws?ticket=abc"
    );
    assert_eq!(
        ws_url("https://tasks.example.test", "t").unwrap(),
        "wss://tasks.example.test/api/ws?ticket=t"
    );
    assert!(ws_url("ftp://nope", "t").is_err());
}
