//! Tradenet node: P2P session layer demo
//!
//! Accepts and dials TCP peers, wraps each socket in a session, announces
//! capabilities, answers pings and keeps the sequence number store for the
//! storage entries it receives.

use clap::Parser;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tradenet::net::{
    BanEntry, BanList, Capabilities, CloseConnectionReason, Connection, ConnectionListener,
    Direction, MessageListener, NetConfig, NetContext, NetworkEnvelope, ProtectedStorageEntry,
    DEFAULT_PORT, MSG_THROTTLE_PER_10_SEC, MSG_THROTTLE_PER_SEC, P2P_MESSAGE_VERSION,
};
use tradenet::storage::{MapValue, SequenceNumberMap};
use tradenet::types::NodeAddress;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const SEQUENCE_MAP_FILE: &str = "sequence_numbers.dat";
const BAN_LIST_FILE: &str = "banlist.dat";

/// Flush, ban expiry and status interval
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Keep-alive interval
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Ban applied to peers closed for rule violations
const VIOLATION_BAN_SECS: u64 = 3600;

/// Bound on waiting for sessions to finish closing at exit
const EXIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "tradenet", version, about = "Tradenet: P2P session layer node")]
struct Args {
    /// Listen port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Peers to dial (comma-separated host:port)
    #[arg(long)]
    peers: Option<String>,

    /// Network message version; peers on another version are rejected
    #[arg(long, default_value_t = P2P_MESSAGE_VERSION)]
    message_version: u32,

    /// Inbound ceiling per second
    #[arg(long, default_value_t = MSG_THROTTLE_PER_SEC)]
    msg_throttle_per_sec: usize,

    /// Inbound ceiling per ten seconds
    #[arg(long, default_value_t = MSG_THROTTLE_PER_10_SEC)]
    msg_throttle_per_10_sec: usize,

    /// Outbound throttle sleep in milliseconds
    #[arg(long, default_value_t = 50)]
    send_throttle_ms: u64,
}

/// Node state shared by all sessions
struct Node {
    ctx: Arc<NetContext>,
    capabilities: Capabilities,
    data_dir: PathBuf,
    bans: Arc<RwLock<BanList>>,
    sequence_numbers: SequenceNumberMap,
    connections: Mutex<HashMap<String, Connection>>,
    /// Outstanding pings: nonce -> (connection uid, sent at)
    pending_pings: Mutex<HashMap<u32, (String, Instant)>>,
    /// Last measured round trip per connection uid, millis
    round_trip_times: Mutex<HashMap<String, u64>>,
}

impl Node {
    fn new(args: &Args) -> Result<Self, Box<dyn std::error::Error>> {
        std::fs::create_dir_all(&args.data_dir)?;

        let sequence_numbers = SequenceNumberMap::load(args.data_dir.join(SEQUENCE_MAP_FILE))?;
        let mut bans = BanList::load_or_default(args.data_dir.join(BAN_LIST_FILE))?;
        bans.expire();
        info!("Loaded {} bans", bans.len());
        let bans = Arc::new(RwLock::new(bans));

        let config = NetConfig {
            message_version: args.message_version,
            msg_throttle_per_sec: args.msg_throttle_per_sec,
            msg_throttle_per_10_sec: args.msg_throttle_per_10_sec,
            send_msg_throttle_sleep: Duration::from_millis(args.send_throttle_ms),
            ..Default::default()
        };
        let ctx = NetContext::new(config).with_ban_filter(bans.clone());

        Ok(Self {
            ctx: Arc::new(ctx),
            capabilities: Capabilities::all(),
            data_dir: args.data_dir.clone(),
            bans,
            sequence_numbers,
            connections: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            round_trip_times: Mutex::new(HashMap::new()),
        })
    }

    fn open(self: &Arc<Self>, stream: TcpStream, direction: Direction, peer: Option<NodeAddress>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let message_listener: Arc<dyn MessageListener> = self.clone();
        let connection_listener: Arc<dyn ConnectionListener> = self.clone();
        Connection::new(
            stream,
            direction,
            peer,
            message_listener,
            connection_listener,
            self.ctx.clone(),
        );
    }

    async fn dial(self: Arc<Self>, addr: NodeAddress) {
        match TcpStream::connect((addr.host_name.as_str(), addr.port)).await {
            Ok(stream) => {
                info!("Connected to {}", addr);
                self.open(stream, Direction::Outbound, Some(addr));
            }
            Err(e) => warn!("Failed to connect to {}: {}", addr, e),
        }
    }

    fn connections(&self) -> Vec<Connection> {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Ordering rule: a stored sequence number is only replaced by a
    /// strictly greater one
    fn apply_storage_entry(&self, entry: &ProtectedStorageEntry, connection: &Connection) -> bool {
        let hash = entry.payload_hash();
        match self
            .sequence_numbers
            .put_if_greater(hash, MapValue::new(entry.sequence_number))
        {
            Ok(_) => {
                debug!(
                    "Stored entry {} with sequence number {}",
                    hex::encode(&hash[..8]),
                    entry.sequence_number
                );
                true
            }
            Err(stored) => {
                debug!(
                    "Rejected entry {} from {}: sequence number {} not above {}",
                    hex::encode(&hash[..8]),
                    connection,
                    entry.sequence_number,
                    stored.sequence_number
                );
                false
            }
        }
    }

    fn send_in_background(connection: &Connection, envelope: NetworkEnvelope) {
        let connection = connection.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.send(envelope).await {
                debug!("Send to {} failed: {}", connection, e);
            }
        });
    }

    async fn ping_all(&self) {
        for connection in self.connections() {
            let nonce: u32 = rand::thread_rng().r#gen();
            let last_round_trip_time = self
                .round_trip_times
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(connection.uid())
                .copied()
                .unwrap_or(0);
            self.pending_pings
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(nonce, (connection.uid().to_string(), Instant::now()));
            let ping = NetworkEnvelope::Ping {
                nonce,
                last_round_trip_time,
            };
            if let Err(e) = connection.send(ping).await {
                debug!("Ping to {} failed: {}", connection, e);
            }
        }
    }

    fn maintenance(&self) {
        let path = self.data_dir.join(SEQUENCE_MAP_FILE);
        match self.sequence_numbers.flush_if_dirty(&path) {
            Ok(true) => debug!("Flushed {} sequence numbers", self.sequence_numbers.len()),
            Ok(false) => {}
            Err(e) => error!("Failed to flush sequence map: {}", e),
        }

        self.bans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .expire();

        // Pings never answered
        self.pending_pings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, (_, sent)| sent.elapsed() < PING_INTERVAL * 2);

        info!(
            "Status: {} peers | {} sequence numbers | {} bans",
            self.connections.lock().unwrap_or_else(|e| e.into_inner()).len(),
            self.sequence_numbers.len(),
            self.bans.read().unwrap_or_else(|e| e.into_inner()).len()
        );
    }

    fn persist(&self, data_dir: &Path) {
        if let Err(e) = self.sequence_numbers.save(data_dir.join(SEQUENCE_MAP_FILE)) {
            error!("Failed to save sequence map: {}", e);
        }
        let bans = self.bans.read().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = bans.save(data_dir.join(BAN_LIST_FILE)) {
            error!("Failed to save ban list: {}", e);
        }
    }

    async fn shutdown(&self) {
        let connections = self.connections();
        info!("Closing {} connections", connections.len());
        for connection in &connections {
            connection.shutdown(CloseConnectionReason::AppShutDown);
        }
        for connection in &connections {
            if tokio::time::timeout(EXIT_TIMEOUT, connection.closed()).await.is_err() {
                warn!("{} did not close in time", connection);
            }
        }
        self.persist(&self.data_dir);
    }
}

impl ConnectionListener for Node {
    fn on_connection(&self, connection: &Connection) {
        info!("Peer connected: {}", connection);
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(connection.uid().to_string(), connection.clone());

        let announcement = NetworkEnvelope::SupportedCapabilities {
            capabilities: self.capabilities.clone(),
        };
        Self::send_in_background(connection, announcement);
    }

    fn on_disconnect(&self, reason: CloseConnectionReason, connection: &Connection) {
        if reason.is_intended() {
            info!("Peer disconnected: {} ({})", connection, reason);
        } else {
            warn!("Peer disconnected: {} ({})", connection, reason);
        }
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection.uid());
        self.round_trip_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection.uid());

        let violated = matches!(
            reason,
            CloseConnectionReason::RuleViolation | CloseConnectionReason::InvalidClassReceived
        );
        if let (true, Some(addr)) = (violated, connection.peer_address()) {
            let reason = connection
                .rule_violation()
                .map(|v| v.name())
                .unwrap_or(reason.name());
            self.bans
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .ban(BanEntry::new(addr, VIOLATION_BAN_SECS, reason.to_string()));
        }
    }
}

impl MessageListener for Node {
    fn on_message(&self, envelope: &NetworkEnvelope, connection: &Connection) {
        match envelope {
            NetworkEnvelope::AddData { entry } | NetworkEnvelope::RemoveData { entry } => {
                self.apply_storage_entry(entry, connection);
            }
            NetworkEnvelope::GetDataResponse(response) => {
                let accepted = response
                    .entries
                    .iter()
                    .filter(|entry| self.apply_storage_entry(entry, connection))
                    .count();
                info!(
                    "Data response from {}: {} of {} entries accepted, {} persistable payloads",
                    connection,
                    accepted,
                    response.entries.len(),
                    response.persistable.len()
                );
            }
            NetworkEnvelope::AddPersistableNetworkPayload { payload } => {
                debug!("Persistable payload {} from {}", hex::encode(&*payload.hash), connection);
            }
            NetworkEnvelope::Ping { nonce, .. } => {
                let pong = NetworkEnvelope::Pong {
                    request_nonce: *nonce,
                };
                Self::send_in_background(connection, pong);
            }
            NetworkEnvelope::Pong { request_nonce } => {
                let pending = self
                    .pending_pings
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(request_nonce);
                match pending {
                    Some((uid, sent)) if uid == connection.uid() => {
                        let rtt = sent.elapsed().as_millis() as u64;
                        debug!("Round trip to {}: {} ms", connection, rtt);
                        self.round_trip_times
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(uid, rtt);
                    }
                    _ => debug!("Unexpected pong {} from {}", request_nonce, connection),
                }
            }
            NetworkEnvelope::SupportedCapabilities { capabilities } => {
                debug!("{} supports {}", connection, capabilities);
            }
            NetworkEnvelope::Direct(message) => {
                info!(
                    "Direct message {} from {} ({} bytes)",
                    message.uid,
                    message.sender_node_address,
                    message.sealed.len()
                );
            }
            NetworkEnvelope::Close { .. } | NetworkEnvelope::Bundle { .. } => {}
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "tradenet=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    // Parse peers
    let mut peers = Vec::new();
    for peer in args.peers.iter().flat_map(|s| s.split(',')) {
        match peer.trim().parse::<NodeAddress>() {
            Ok(addr) => peers.push(addr),
            Err(e) => {
                error!("Invalid peer address {:?}: {}", peer, e);
                return;
            }
        }
    }

    info!(
        "Tradenet v{} | Port: {} | Message version: {}",
        VERSION, args.port, args.message_version
    );
    if !peers.is_empty() {
        info!("Peers: {:?}", peers.iter().map(|p| p.to_string()).collect::<Vec<_>>());
    }

    let node = match Node::new(&args) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("Failed to create node: {}", e);
            return;
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind port {}: {}", args.port, e);
            return;
        }
    };

    // Accept loop
    let node_clone = node.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!("Inbound connection from {}", remote);
                    node_clone.open(stream, Direction::Inbound, None);
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });

    for addr in peers {
        tokio::spawn(node.clone().dial(addr));
    }

    // Keep-alive
    let node_clone = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            node_clone.ping_all().await;
        }
    });

    // Flush and status
    let node_clone = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            interval.tick().await;
            node_clone.maintenance();
        }
    });

    info!("Tradenet running. Waiting for peer connections...");

    // Wait for shutdown
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    node.shutdown().await;
}
