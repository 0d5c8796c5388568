//! Connection session tests
//!
//! Each test drives one session over an in-memory duplex pipe. The far end
//! is a raw peer that writes frames directly, so it can misbehave.
//!
//! Run with: cargo test --test connection_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tradenet::net::framing::encode_raw_frame;
use tradenet::net::serde_safe::{BoundedBytes, BoundedString, BoundedVec, to_bytes};
use tradenet::net::{
    BanEntry, BanList, BundledEnvelope, Capabilities, Capability, CapabilityListener,
    CloseConnectionReason, Connection, ConnectionListener, DirectMessage, Direction,
    EnvelopeReader, GetDataResponse, MessageListener, NetConfig, NetContext, NetError,
    NetworkEnvelope,
    PersistableNetworkPayload, PostcardResolver, ProtectedStorageEntry, RuleViolation,
    SendOutcome, StoragePayload, ViolationTolerances, WireEnvelope, MAX_PERMITTED_MESSAGE_SIZE,
    P2P_MESSAGE_VERSION,
};
use tradenet::types::NodeAddress;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// HARNESS
// =============================================================================

#[derive(Debug)]
enum Event {
    Connected,
    Message(NetworkEnvelope),
    Disconnected(CloseConnectionReason),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl MessageListener for Recorder {
    fn on_message(&self, envelope: &NetworkEnvelope, _connection: &Connection) {
        let _ = self.tx.send(Event::Message(envelope.clone()));
    }
}

impl ConnectionListener for Recorder {
    fn on_connection(&self, _connection: &Connection) {
        let _ = self.tx.send(Event::Connected);
    }

    fn on_disconnect(&self, reason: CloseConnectionReason, _connection: &Connection) {
        let _ = self.tx.send(Event::Disconnected(reason));
    }
}

/// Far end of the pipe, speaking raw frames
struct RawPeer {
    reader: EnvelopeReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl RawPeer {
    fn new(stream: DuplexStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: EnvelopeReader::new(
                read_half,
                MAX_PERMITTED_MESSAGE_SIZE,
                Arc::new(PostcardResolver),
            ),
            writer: write_half,
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn send_versioned(&mut self, message_version: u32, envelope: NetworkEnvelope) {
        let payload = to_bytes(&WireEnvelope {
            message_version,
            envelope,
        })
        .unwrap();
        self.send_raw(&encode_raw_frame(&payload)).await;
    }

    async fn send(&mut self, envelope: NetworkEnvelope) {
        self.send_versioned(P2P_MESSAGE_VERSION, envelope).await;
    }

    /// None on end of stream, error or timeout
    async fn recv(&mut self) -> Option<NetworkEnvelope> {
        match timeout(WAIT, self.reader.read_envelope()).await {
            Ok(Ok(Some(frame))) => Some(frame.wire.envelope),
            _ => None,
        }
    }

    async fn expect_close(&mut self, expected: &str) {
        match self.recv().await {
            Some(NetworkEnvelope::Close { reason }) => assert_eq!(reason.as_str(), expected),
            other => panic!("expected close {}, got {:?}", expected, other),
        }
    }
}

struct Harness {
    conn: Connection,
    peer: RawPeer,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Harness {
    fn start(ctx: NetContext, direction: Direction, peer_address: Option<NodeAddress>) -> Self {
        let (local, remote) = tokio::io::duplex(1 << 20);
        let (tx, events) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder { tx });
        let conn = Connection::new(
            local,
            direction,
            peer_address,
            recorder.clone(),
            recorder,
            Arc::new(ctx),
        );
        Self {
            conn,
            peer: RawPeer::new(remote),
            events,
        }
    }

    fn with_config(config: NetConfig) -> Self {
        Self::start(
            NetContext::new(config),
            Direction::Outbound,
            Some(peer_addr("peer.onion")),
        )
    }

    fn default_outbound() -> Self {
        Self::with_config(NetConfig::default())
    }

    async fn next_event(&mut self) -> Event {
        timeout(WAIT, self.events.recv())
            .await
            .expect("no event in time")
            .expect("listener dropped")
    }

    async fn next_message(&mut self) -> NetworkEnvelope {
        loop {
            match self.next_event().await {
                Event::Connected => continue,
                Event::Message(envelope) => return envelope,
                Event::Disconnected(reason) => panic!("unexpected disconnect: {}", reason),
            }
        }
    }

    async fn disconnected(&mut self) -> CloseConnectionReason {
        loop {
            if let Event::Disconnected(reason) = self.next_event().await {
                return reason;
            }
        }
    }

    async fn closed(&self) -> CloseConnectionReason {
        timeout(WAIT, self.conn.closed())
            .await
            .expect("session did not close in time")
    }
}

fn peer_addr(host: &str) -> NodeAddress {
    NodeAddress::new(host, 9999)
}

fn ping(nonce: u32) -> NetworkEnvelope {
    NetworkEnvelope::Ping {
        nonce,
        last_round_trip_time: 0,
    }
}

fn caps(list: &[Capability]) -> Capabilities {
    list.iter().copied().collect()
}

fn storage_entry(required: Capabilities) -> ProtectedStorageEntry {
    let payload = StoragePayload::new(1, b"offer".to_vec())
        .unwrap()
        .with_required_capabilities(required);
    ProtectedStorageEntry::new(payload, vec![7u8; 32], 1).unwrap()
}

fn persistable(data: &[u8]) -> PersistableNetworkPayload {
    PersistableNetworkPayload::new(2, data.to_vec()).unwrap()
}

fn direct_message(sender: NodeAddress, sealed: Vec<u8>) -> DirectMessage {
    DirectMessage {
        sender_node_address: sender,
        uid: BoundedString::new("msg-1").unwrap(),
        sealed: BoundedBytes::new(sealed).unwrap(),
    }
}

fn direct(sender: NodeAddress) -> NetworkEnvelope {
    NetworkEnvelope::Direct(direct_message(sender, vec![1, 2, 3]))
}

fn data_response(
    persistable: Vec<PersistableNetworkPayload>,
    supported_capabilities: Capabilities,
) -> NetworkEnvelope {
    NetworkEnvelope::GetDataResponse(GetDataResponse {
        entries: BoundedVec::default(),
        persistable: BoundedVec::new(persistable).unwrap(),
        request_nonce: 1,
        supported_capabilities,
    })
}

/// Far more than the unread pipe buffers
fn large_direct() -> NetworkEnvelope {
    NetworkEnvelope::Direct(direct_message(peer_addr("slow.onion"), vec![5; 10_000]))
}

/// Session whose far end stays open but never reads
fn start_unread(config: NetConfig) -> (Connection, DuplexStream) {
    let (local, remote) = tokio::io::duplex(64);
    let (tx, _events) = mpsc::unbounded_channel();
    let recorder = Arc::new(Recorder { tx });
    let conn = Connection::new(
        local,
        Direction::Outbound,
        Some(peer_addr("slow.onion")),
        recorder.clone(),
        recorder,
        Arc::new(NetContext::new(config)),
    );
    (conn, remote)
}

fn corrupted_frame() -> Vec<u8> {
    let payload = to_bytes(&WireEnvelope {
        message_version: P2P_MESSAGE_VERSION,
        envelope: ping(1),
    })
    .unwrap();
    let mut frame = encode_raw_frame(&payload);
    frame[8] ^= 0xff;
    frame
}

// =============================================================================
// CLOSE HANDSHAKE TESTS
// =============================================================================

#[tokio::test]
async fn test_peer_close_request() {
    let mut h = Harness::default_outbound();
    h.peer.send(NetworkEnvelope::close("APP_SHUT_DOWN")).await;

    assert_eq!(h.closed().await, CloseConnectionReason::CloseRequestedByPeer);
    assert_eq!(h.disconnected().await, CloseConnectionReason::CloseRequestedByPeer);
    assert!(h.conn.is_stopped());
    // No close message is sent back
    assert!(h.peer.recv().await.is_none());
}

#[tokio::test]
async fn test_end_of_stream_terminates() {
    let Harness { conn, peer, mut events } = Harness::default_outbound();
    drop(peer);

    assert_eq!(
        timeout(WAIT, conn.closed()).await.unwrap(),
        CloseConnectionReason::Terminated
    );
    let mut reasons = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if let Event::Disconnected(reason) = event {
            reasons.push(reason);
        }
    }
    assert_eq!(reasons, vec![CloseConnectionReason::Terminated]);
}

#[tokio::test]
async fn test_shutdown_twice_runs_both_callbacks() {
    let mut h = Harness::default_outbound();
    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();

    h.conn
        .shutdown_with_callback(CloseConnectionReason::AppShutDown, move || {
            let _ = tx1.send(());
        });
    h.conn
        .shutdown_with_callback(CloseConnectionReason::TooManyConnectionsOpen, move || {
            let _ = tx2.send(());
        });

    timeout(WAIT, rx1).await.unwrap().unwrap();
    timeout(WAIT, rx2).await.unwrap().unwrap();
    assert_eq!(h.conn.close_reason(), Some(CloseConnectionReason::AppShutDown));

    h.peer.expect_close("APP_SHUT_DOWN").await;
    assert!(h.peer.recv().await.is_none());

    // Exactly one disconnect notification
    assert_eq!(h.disconnected().await, CloseConnectionReason::AppShutDown);
    assert!(timeout(Duration::from_millis(200), h.events.recv()).await.is_err());
}

#[tokio::test]
async fn test_shutdown_releases_blocked_send() {
    let (conn, _remote) = start_unread(NetConfig::default());

    let sender = conn.clone();
    let pending = tokio::spawn(async move {
        sender.send(large_direct()).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());

    conn.shutdown(CloseConnectionReason::AppShutDown);
    assert_eq!(
        timeout(WAIT, conn.closed()).await.unwrap(),
        CloseConnectionReason::AppShutDown
    );
    let result = timeout(WAIT, pending).await.expect("send still blocked").unwrap();
    assert!(matches!(result, Err(NetError::Stopped)));
}

#[tokio::test]
async fn test_send_timeout_closes_session() {
    let config = NetConfig {
        send_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let (conn, _remote) = start_unread(config);

    let result = timeout(WAIT, conn.send(large_direct())).await.unwrap();
    assert!(matches!(result, Err(NetError::SendTimeout(_))));
    assert_eq!(
        timeout(WAIT, conn.closed()).await.unwrap(),
        CloseConnectionReason::SendMsgTimeout
    );
}

#[tokio::test]
async fn test_read_timeout_closes_session() {
    let config = NetConfig {
        socket_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let mut h = Harness::with_config(config);

    assert_eq!(h.closed().await, CloseConnectionReason::SocketTimeout);
    assert_eq!(h.disconnected().await, CloseConnectionReason::SocketTimeout);
    // Not a reason that announces itself
    assert!(h.peer.recv().await.is_none());
}

#[tokio::test]
async fn test_send_after_stop_is_noop() {
    let h = Harness::default_outbound();
    h.conn.shutdown(CloseConnectionReason::Terminated);
    h.closed().await;
    assert_eq!(h.conn.send(ping(1)).await.unwrap(), SendOutcome::Stopped);
}

// =============================================================================
// RULE VIOLATION TESTS
// =============================================================================

#[tokio::test]
async fn test_tolerance_minus_one_stays_open() {
    let mut h = Harness::default_outbound();

    // INVALID_DATA_TYPE tolerates one bad frame
    h.peer.send_raw(&corrupted_frame()).await;
    h.peer.send(ping(7)).await;
    assert_eq!(h.next_message().await, ping(7));
    assert_eq!(h.conn.rule_violation_count(RuleViolation::InvalidDataType), 1);
    assert!(!h.conn.is_stopped());

    // The second one closes
    h.peer.send_raw(&corrupted_frame()).await;
    h.peer.expect_close("INVALID_DATA_TYPE").await;
    assert_eq!(h.closed().await, CloseConnectionReason::RuleViolation);
    assert_eq!(h.conn.rule_violation(), Some(RuleViolation::InvalidDataType));
}

#[tokio::test]
async fn test_unknown_class_closes_without_message() {
    let mut h = Harness::default_outbound();

    // Version 1, envelope tag 42
    h.peer.send_raw(&encode_raw_frame(&[1, 42])).await;

    assert_eq!(h.closed().await, CloseConnectionReason::InvalidClassReceived);
    assert_eq!(h.conn.rule_violation(), Some(RuleViolation::InvalidClass));
    assert!(h.peer.recv().await.is_none());
}

#[tokio::test]
async fn test_wrong_message_version() {
    let mut h = Harness::default_outbound();
    h.peer.send_versioned(P2P_MESSAGE_VERSION + 1, ping(1)).await;

    h.peer.expect_close("WRONG_NETWORK_ID").await;
    assert_eq!(h.closed().await, CloseConnectionReason::RuleViolation);
    assert_eq!(h.conn.rule_violation(), Some(RuleViolation::WrongNetworkId));
}

#[tokio::test]
async fn test_oversized_envelope_closes_with_tolerance_one() {
    let config = NetConfig {
        permitted_message_size: 1000,
        tolerances: ViolationTolerances::new().with(RuleViolation::MaxMsgSizeExceeded, 1),
        ..Default::default()
    };
    let mut h = Harness::with_config(config);

    let payload = persistable(&[0xab; 2000]);
    h.peer
        .send(NetworkEnvelope::AddPersistableNetworkPayload { payload })
        .await;

    h.peer.expect_close("MAX_MSG_SIZE_EXCEEDED").await;
    assert_eq!(h.closed().await, CloseConnectionReason::RuleViolation);
    assert_eq!(h.conn.rule_violation(), Some(RuleViolation::MaxMsgSizeExceeded));
}

#[tokio::test]
async fn test_extended_size_only_for_data_response() {
    let config = NetConfig {
        permitted_message_size: 1000,
        ..Default::default()
    };
    let mut h = Harness::with_config(config);

    let response = data_response(
        vec![persistable(&[1; 1500]), persistable(&[2; 1500])],
        Capabilities::all(),
    );
    h.peer.send(response).await;
    assert!(matches!(
        h.next_message().await,
        NetworkEnvelope::GetDataResponse(_)
    ));
    assert_eq!(h.conn.rule_violation_count(RuleViolation::MaxMsgSizeExceeded), 0);

    // Same size without the extended flag
    let oversized = NetworkEnvelope::Direct(direct_message(peer_addr("peer.onion"), vec![3; 3000]));
    h.peer.send(oversized).await;
    assert!(matches!(h.next_message().await, NetworkEnvelope::Direct(_)));
    assert_eq!(h.conn.rule_violation_count(RuleViolation::MaxMsgSizeExceeded), 1);
    assert!(!h.conn.is_stopped());
}

#[tokio::test]
async fn test_invalid_hash_size_counts_as_oversized() {
    let mut h = Harness::default_outbound();
    let mut payload = persistable(b"trade stats");
    payload.hash = BoundedBytes::new(vec![0u8; 32]).unwrap();
    let envelope = NetworkEnvelope::AddPersistableNetworkPayload { payload };

    // Below tolerance the envelope is still delivered
    h.peer.send(envelope.clone()).await;
    assert_eq!(h.next_message().await, envelope);
    assert_eq!(h.conn.rule_violation_count(RuleViolation::MaxMsgSizeExceeded), 1);

    h.peer.send(envelope).await;
    h.peer.expect_close("MAX_MSG_SIZE_EXCEEDED").await;
    assert_eq!(h.closed().await, CloseConnectionReason::RuleViolation);
    assert_eq!(h.conn.rule_violation(), Some(RuleViolation::MaxMsgSizeExceeded));
}

#[tokio::test]
async fn test_frame_over_hard_ceiling_is_drained() {
    let config = NetConfig {
        permitted_message_size: 1000,
        max_permitted_message_size: 4096,
        ..Default::default()
    };
    let mut h = Harness::with_config(config);

    h.peer.send_raw(&encode_raw_frame(&vec![0u8; 8000])).await;
    h.peer.send(ping(3)).await;

    // Stream stays aligned: the next frame is delivered
    assert_eq!(h.next_message().await, ping(3));
    assert_eq!(h.conn.rule_violation_count(RuleViolation::MaxMsgSizeExceeded), 1);
    assert!(!h.conn.is_stopped());
}

#[tokio::test]
async fn test_inbound_throttle_one_report_per_batch() {
    let config = NetConfig {
        msg_throttle_per_sec: 10,
        inbound_spacing_sleep: Duration::ZERO,
        ..Default::default()
    };
    let mut h = Harness::with_config(config);

    for i in 0..15 {
        h.peer.send(ping(i)).await;
    }
    for _ in 0..15 {
        h.next_message().await;
    }
    assert_eq!(h.conn.rule_violation_count(RuleViolation::ThrottleLimitExceeded), 1);
    assert!(!h.conn.is_stopped());

    // Second batch reaches the tolerance
    for i in 15..22 {
        h.peer.send(ping(i)).await;
    }
    assert_eq!(h.closed().await, CloseConnectionReason::RuleViolation);
    assert_eq!(h.conn.rule_violation(), Some(RuleViolation::ThrottleLimitExceeded));
}

#[tokio::test]
async fn test_banned_peer_closed_on_connect() {
    let addr = peer_addr("banned.onion");
    let mut bans = BanList::new();
    bans.ban(BanEntry::new(addr.clone(), 3600, "test".into()));
    let ctx = NetContext::new(NetConfig::default()).with_ban_filter(Arc::new(RwLock::new(bans)));

    let mut h = Harness::start(ctx, Direction::Outbound, Some(addr));

    h.peer.expect_close("PEER_BANNED").await;
    assert_eq!(h.closed().await, CloseConnectionReason::PeerBanned);
    assert_eq!(h.disconnected().await, CloseConnectionReason::PeerBanned);
}

// =============================================================================
// PEER ADDRESS TESTS
// =============================================================================

#[tokio::test]
async fn test_inbound_learns_sender_address() {
    let mut h = Harness::start(NetContext::default(), Direction::Inbound, None);
    assert!(h.conn.peer_address().is_none());

    let alice = peer_addr("alice.onion");
    h.peer.send(direct(alice.clone())).await;
    assert!(matches!(h.next_message().await, NetworkEnvelope::Direct(_)));
    assert_eq!(h.conn.peer_address(), Some(alice));

    // A different sender on the same session is fatal
    h.peer.send(direct(peer_addr("mallory.onion"))).await;
    assert_eq!(h.closed().await, CloseConnectionReason::UnknownException);
}

#[tokio::test]
async fn test_bundle_sender_mismatch_is_fatal() {
    let mut h = Harness::default_outbound();
    let bundle = NetworkEnvelope::bundle(vec![
        BundledEnvelope::Direct(direct_message(peer_addr("peer.onion"), vec![1])),
        BundledEnvelope::Direct(direct_message(peer_addr("mallory.onion"), vec![2])),
    ])
    .unwrap();
    h.peer.send(bundle).await;

    assert!(matches!(h.next_message().await, NetworkEnvelope::Direct(_)));
    assert_eq!(h.closed().await, CloseConnectionReason::UnknownException);
    assert_eq!(h.disconnected().await, CloseConnectionReason::UnknownException);
}

#[tokio::test]
async fn test_banned_sender_dropped_on_inbound() {
    let banned = peer_addr("banned.onion");
    let mut bans = BanList::new();
    bans.ban(BanEntry::new(banned.clone(), 3600, "test".into()));
    let ctx = NetContext::new(NetConfig::default()).with_ban_filter(Arc::new(RwLock::new(bans)));
    let mut h = Harness::start(ctx, Direction::Inbound, None);

    h.peer.send(direct(banned)).await;

    h.peer.expect_close("PEER_BANNED").await;
    assert_eq!(h.closed().await, CloseConnectionReason::PeerBanned);
    assert_eq!(h.conn.rule_violation(), Some(RuleViolation::PeerBanned));
    loop {
        match h.next_event().await {
            Event::Connected => continue,
            Event::Message(envelope) => panic!("banned envelope delivered: {:?}", envelope),
            Event::Disconnected(reason) => {
                assert_eq!(reason, CloseConnectionReason::PeerBanned);
                break;
            }
        }
    }
}

// =============================================================================
// CAPABILITY TESTS
// =============================================================================

#[tokio::test]
async fn test_capability_gating() {
    let mut h = Harness::default_outbound();
    let entry = storage_entry(caps(&[Capability::Mediation]));

    // Peer has announced nothing yet
    let outcome = h
        .conn
        .send(NetworkEnvelope::AddData { entry: entry.clone() })
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::NotSupported);

    h.peer
        .send(NetworkEnvelope::SupportedCapabilities {
            capabilities: caps(&[Capability::AckMsg, Capability::Mediation]),
        })
        .await;
    assert!(matches!(
        h.next_message().await,
        NetworkEnvelope::SupportedCapabilities { .. }
    ));
    assert!(h.conn.is_capability_supported(Capability::Mediation));

    let outcome = h
        .conn
        .send(NetworkEnvelope::AddData { entry: entry.clone() })
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Sent { .. }));
    assert_eq!(h.peer.recv().await, Some(NetworkEnvelope::AddData { entry }));
}

#[tokio::test]
async fn test_bundle_filtered_per_element() {
    let mut h = Harness::default_outbound();
    let gated = BundledEnvelope::AddData {
        entry: storage_entry(caps(&[Capability::Arbitration])),
    };
    let open = BundledEnvelope::AddPersistableNetworkPayload {
        payload: persistable(b"trade stats"),
    };

    let bundle = NetworkEnvelope::bundle(vec![gated.clone(), open.clone()]).unwrap();
    let outcome = h.conn.send(bundle).await.unwrap();
    assert!(matches!(outcome, SendOutcome::Sent { .. }));
    assert_eq!(
        h.peer.recv().await,
        NetworkEnvelope::bundle(vec![open])
    );

    // Nothing left after filtering: not sent at all
    let bundle = NetworkEnvelope::bundle(vec![gated]).unwrap();
    assert_eq!(h.conn.send(bundle).await.unwrap(), SendOutcome::NotSupported);
}

#[tokio::test]
async fn test_missing_mandatory_capabilities() {
    let mut h = Harness::default_outbound();
    h.peer
        .send(NetworkEnvelope::SupportedCapabilities {
            capabilities: caps(&[Capability::Mediation]),
        })
        .await;

    assert_eq!(
        h.closed().await,
        CloseConnectionReason::MandatoryCapabilitiesNotSupported
    );
    assert!(h.conn.capabilities().is_empty());
}

#[tokio::test]
async fn test_data_response_without_capabilities_is_no_announcement() {
    let mut h = Harness::default_outbound();
    h.peer
        .send(data_response(vec![persistable(b"witness")], Capabilities::new()))
        .await;

    assert!(matches!(
        h.next_message().await,
        NetworkEnvelope::GetDataResponse(_)
    ));
    assert!(!h.conn.is_stopped());
    assert!(h.conn.capabilities().is_empty());

    // An explicit empty announcement still lacks the mandatory set
    h.peer
        .send(NetworkEnvelope::SupportedCapabilities {
            capabilities: Capabilities::new(),
        })
        .await;
    assert_eq!(
        h.closed().await,
        CloseConnectionReason::MandatoryCapabilitiesNotSupported
    );
}

struct CapabilityCounter(AtomicUsize);

impl CapabilityListener for CapabilityCounter {
    fn on_changed(&self, _capabilities: &Capabilities) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_capability_listener_subscription() {
    let mut h = Harness::default_outbound();
    let counter = Arc::new(CapabilityCounter(AtomicUsize::new(0)));
    let subscription = h.conn.add_capability_listener(counter.clone());

    let announce = |list: &[Capability]| NetworkEnvelope::SupportedCapabilities {
        capabilities: caps(list),
    };

    h.peer.send(announce(&[Capability::AckMsg])).await;
    h.next_message().await;
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);

    // Same set again: no change, no notification
    h.peer.send(announce(&[Capability::AckMsg])).await;
    h.next_message().await;
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);

    drop(subscription);
    h.peer
        .send(announce(&[Capability::AckMsg, Capability::Mediation]))
        .await;
    h.next_message().await;
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    assert!(h.conn.is_capability_supported(Capability::Mediation));
}

// =============================================================================
// DISPATCH TESTS
// =============================================================================

#[tokio::test]
async fn test_bundle_duplicates_delivered_once() {
    let mut h = Harness::default_outbound();
    let p = persistable(b"witness");
    let q = persistable(b"statistic");
    let element = |payload: &PersistableNetworkPayload| {
        BundledEnvelope::AddPersistableNetworkPayload {
            payload: payload.clone(),
        }
    };

    let bundle = NetworkEnvelope::bundle(vec![element(&p), element(&p), element(&q)]).unwrap();
    h.peer.send(bundle).await;
    h.peer.send(ping(9)).await;

    assert_eq!(
        h.next_message().await,
        NetworkEnvelope::AddPersistableNetworkPayload { payload: p }
    );
    assert_eq!(
        h.next_message().await,
        NetworkEnvelope::AddPersistableNetworkPayload { payload: q }
    );
    assert_eq!(h.next_message().await, ping(9));
}

#[tokio::test]
async fn test_ping_updates_statistics() {
    let mut h = Harness::default_outbound();
    h.peer
        .send(NetworkEnvelope::Ping {
            nonce: 1,
            last_round_trip_time: 42,
        })
        .await;
    h.next_message().await;

    let stats = h.conn.statistics();
    assert_eq!(stats.round_trip_time_ms, 42);
    assert_eq!(stats.messages_recv, 1);
    assert_eq!(stats.received_by_command.get("ping"), Some(&1));
}

// =============================================================================
// OUTBOUND THROTTLE TESTS
// =============================================================================

#[tokio::test]
async fn test_rapid_sends_are_spaced() {
    let mut h = Harness::default_outbound();
    let start = Instant::now();
    for i in 0..3 {
        let outcome = h.conn.send(ping(i)).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Sent { .. }));
    }
    assert!(start.elapsed() >= Duration::from_millis(100));

    for i in 0..3 {
        assert_eq!(h.peer.recv().await, Some(ping(i)));
    }
}

#[tokio::test]
async fn test_concurrent_sends_are_spaced() {
    let h = Harness::default_outbound();
    let start = Instant::now();
    let (a, b, c) = tokio::join!(
        h.conn.send(ping(1)),
        h.conn.send(ping(2)),
        h.conn.send(ping(3))
    );
    for outcome in [a, b, c] {
        assert!(matches!(outcome.unwrap(), SendOutcome::Sent { .. }));
    }
    assert!(start.elapsed() >= Duration::from_millis(100));
}
