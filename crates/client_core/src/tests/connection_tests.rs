use super::*;
use async_trait::async_trait;
use shared::protocol::ServerEvent;
use std::{
    collections::VecDeque,
    sync::atomic::AtomicUsize,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

const STATUS_AVAILABLE: &str =
    r#"{"event":"status_update","data":{"status":"available","current_operation":null,"start_time":null,"connected_clients":2}}"#;

struct FakePeer {
    to_client: mpsc::Sender<Result<String, TransportError>>,
    from_client: mpsc::Receiver<String>,
}

struct FakeTransport {
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    peers: UnboundedSender<FakePeer>,
    opens: AtomicUsize,
}

impl FakeTransport {
    fn new(script: Vec<Result<(), TransportError>>) -> (Arc<Self>, UnboundedReceiver<FakePeer>) {
        let (peers, rx) = unbounded_channel();
        let transport = Arc::new(Self {
            script: Mutex::new(script.into()),
            peers,
            opens: AtomicUsize::new(0),
        });
        (transport, rx)
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, _url: &Url) -> Result<TransportLink, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        outcome?;
        let (to_client, inbound) = mpsc::channel(16);
        let (outbound, from_client) = mpsc::channel(16);
        let _ = self.peers.send(FakePeer {
            to_client,
            from_client,
        });
        Ok(TransportLink { outbound, inbound })
    }
}

/// A controller that accepts TCP but never finishes the handshake.
struct StalledTransport;

#[async_trait]
impl Transport for StalledTransport {
    async fn open(&self, _url: &Url) -> Result<TransportLink, TransportError> {
        std::future::pending().await
    }
}

fn handshake_refused() -> Result<(), TransportError> {
    Err(TransportError::Handshake("connection refused".to_string()))
}

fn manager(transport: Arc<FakeTransport>, policy: ReconnectPolicy) -> ConnectionManager {
    ConnectionManager::new(
        Url::parse("ws://machine.local/ws").unwrap(),
        transport,
        policy,
        ListenerRegistry::new(),
    )
}

fn record_events(
    registry: &ListenerRegistry,
    kind: EventKind,
) -> (crate::registry::Subscription, UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = unbounded_channel();
    let sub = registry.on(kind, move |event| {
        let _ = tx.send(event.clone());
        Ok(())
    });
    (sub, rx)
}

async fn wait_for_state(manager: &ConnectionManager, expected: ConnectionState) {
    let mut states = manager.watch_state();
    states
        .wait_for(|state| *state == expected)
        .await
        .expect("state channel open");
}

#[test]
fn fixed_policy_uses_constant_delay_within_budget() {
    let policy = ReconnectPolicy::default();
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.delay_for(1), Some(Duration::from_millis(3000)));
    assert_eq!(policy.delay_for(5), Some(Duration::from_millis(3000)));
    assert_eq!(policy.delay_for(6), None);
    assert_eq!(policy.delay_for(0), None);
}

#[test]
fn exponential_policy_doubles_and_caps() {
    let policy = ReconnectPolicy::exponential(
        10,
        Duration::from_millis(500),
        Duration::from_millis(3000),
    );
    assert_eq!(policy.delay_for(1), Some(Duration::from_millis(500)));
    assert_eq!(policy.delay_for(2), Some(Duration::from_millis(1000)));
    assert_eq!(policy.delay_for(3), Some(Duration::from_millis(2000)));
    assert_eq!(policy.delay_for(4), Some(Duration::from_millis(3000)));
    assert_eq!(policy.delay_for(10), Some(Duration::from_millis(3000)));
}

#[tokio::test]
async fn connect_attaches_registry_and_dispatches_frames() {
    let (transport, mut peers) = FakeTransport::new(Vec::new());
    let manager = manager(transport, ReconnectPolicy::default());
    let (_sub, mut events) = record_events(manager.registry(), EventKind::StatusUpdate);

    manager.connect().await.expect("connect");
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.is_connected());
    assert_eq!(manager.last_error(), None);

    let peer = peers.recv().await.expect("peer");
    peer.to_client
        .send(Ok(STATUS_AVAILABLE.to_string()))
        .await
        .expect("send");

    let event = events.recv().await.expect("event");
    assert_eq!(event.kind(), EventKind::StatusUpdate);
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_skipped() {
    let (transport, mut peers) = FakeTransport::new(Vec::new());
    let manager = manager(transport, ReconnectPolicy::default());
    let (_sub, mut events) = record_events(manager.registry(), EventKind::StatusUpdate);
    manager.connect().await.expect("connect");
    let peer = peers.recv().await.expect("peer");

    for frame in [
        "not json",
        r#"{"event":"firmware_update","data":{}}"#,
        r#"{"event":"status_update","data":{"status":"sleeping"}}"#,
        STATUS_AVAILABLE,
    ] {
        peer.to_client.send(Ok(frame.to_string())).await.expect("send");
    }

    let event = events.recv().await.expect("event");
    assert!(matches!(event, ServerEvent::StatusUpdate(ref s) if s.connected_clients == 2));
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn reconnect_keeps_existing_subscriptions() {
    let (transport, mut peers) = FakeTransport::new(Vec::new());
    let manager = manager(
        Arc::clone(&transport),
        ReconnectPolicy::fixed(3, Duration::from_millis(100)),
    );
    let (_sub, mut events) = record_events(manager.registry(), EventKind::StatusUpdate);
    manager.connect().await.expect("connect");

    let first = peers.recv().await.expect("first peer");
    drop(first);

    let second = peers.recv().await.expect("second peer");
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(transport.opens(), 2);

    second
        .to_client
        .send(Ok(STATUS_AVAILABLE.to_string()))
        .await
        .expect("send");
    assert_eq!(
        events.recv().await.expect("event").kind(),
        EventKind::StatusUpdate
    );
    assert_eq!(manager.registry().listener_count(EventKind::StatusUpdate), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausting_the_budget_reports_error_and_disconnects() {
    let (transport, mut peers) = FakeTransport::new(vec![
        Ok(()),
        handshake_refused(),
        handshake_refused(),
        handshake_refused(),
    ]);
    let manager = manager(
        Arc::clone(&transport),
        ReconnectPolicy::fixed(3, Duration::from_millis(100)),
    );
    manager.connect().await.expect("connect");
    drop(peers.recv().await.expect("peer"));

    wait_for_state(&manager, ConnectionState::Disconnected).await;

    assert_eq!(transport.opens(), 4);
    assert!(matches!(
        manager.last_error(),
        Some(ConnectionError::RetriesExhausted { attempts: 3, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn first_handshake_failure_rejects_then_retries_in_background() {
    let (transport, mut peers) = FakeTransport::new(vec![handshake_refused()]);
    let manager = manager(
        Arc::clone(&transport),
        ReconnectPolicy::fixed(5, Duration::from_millis(3000)),
    );

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ConnectionError::Transport(TransportError::Handshake(_))
    ));
    assert!(manager.state().is_connecting());
    assert!(manager.last_error().is_some());

    let _peer = peers.recv().await.expect("peer after retry");
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(manager.last_error(), None);
    assert_eq!(transport.opens(), 2);
}

#[tokio::test]
async fn disabled_policy_fails_without_retrying() {
    let (transport, _peers) = FakeTransport::new(vec![handshake_refused()]);
    let manager = manager(Arc::clone(&transport), ReconnectPolicy::disabled());

    assert!(manager.connect().await.is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_pending_retries() {
    let (transport, _peers) = FakeTransport::new(vec![handshake_refused()]);
    let manager = manager(
        Arc::clone(&transport),
        ReconnectPolicy::fixed(5, Duration::from_millis(1000)),
    );
    assert!(manager.connect().await.is_err());

    manager.disconnect().await;
    manager.disconnect().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(transport.opens(), 1);
}

#[tokio::test]
async fn connect_replaces_the_previous_transport() {
    let (transport, mut peers) = FakeTransport::new(Vec::new());
    let manager = manager(Arc::clone(&transport), ReconnectPolicy::default());

    manager.connect().await.expect("first connect");
    let mut first = peers.recv().await.expect("first peer");
    manager.connect().await.expect("second connect");
    let _second = peers.recv().await.expect("second peer");

    assert_eq!(first.from_client.recv().await, None);
    assert!(manager.is_connected());
    assert_eq!(transport.opens(), 2);
}

#[tokio::test]
async fn ping_requires_a_live_transport() {
    let (transport, mut peers) = FakeTransport::new(Vec::new());
    let manager = manager(transport, ReconnectPolicy::default());

    assert_eq!(manager.ping_server(), Err(ConnectionError::NotConnected));

    manager.connect().await.expect("connect");
    let mut peer = peers.recv().await.expect("peer");
    manager.ping_server().expect("ping");

    let frame = peer.from_client.recv().await.expect("frame");
    assert!(frame.contains(r#""event":"ping_server""#));

    manager.disconnect().await;
    assert!(!manager.is_connected());
    assert_eq!(manager.ping_server(), Err(ConnectionError::NotConnected));
}

#[tokio::test]
async fn disconnect_cancels_a_stalled_handshake() {
    let manager = Arc::new(ConnectionManager::new(
        Url::parse("ws://machine.local/ws").unwrap(),
        Arc::new(StalledTransport),
        ReconnectPolicy::default(),
        ListenerRegistry::new(),
    ));
    let connecting = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.connect().await }
    });
    wait_for_state(&manager, ConnectionState::Connecting).await;

    tokio::time::timeout(Duration::from_secs(2), manager.disconnect())
        .await
        .expect("disconnect must not wait for the handshake");
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let outcome = tokio::time::timeout(Duration::from_secs(2), connecting)
        .await
        .expect("connect resolves")
        .expect("connect task");
    assert_eq!(outcome, Err(ConnectionError::Cancelled));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test]
fn stale_generation_cannot_publish() {
    let (transport, _peers) = FakeTransport::new(Vec::new());
    let manager = manager(transport, ReconnectPolicy::default());
    let stale = manager.shared.advance();
    let current = manager.shared.advance();

    let (outbound, _from_client) = mpsc::channel(1);
    let (_to_client, inbound) = mpsc::channel(1);
    let link = TransportLink { outbound, inbound };

    assert!(!manager.shared.attach(stale, &link));
    assert!(!manager.shared.set_state(stale, ConnectionState::Connected));
    assert!(!manager.shared.report(stale, ConnectionError::NotConnected));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.last_error(), None);
    assert_eq!(manager.ping_server(), Err(ConnectionError::NotConnected));

    assert!(manager.shared.attach(current, &link));
    assert!(manager.is_connected());
    manager.ping_server().expect("ping over the current link");
}
