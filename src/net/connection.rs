//! Connection session: one peer socket, its read loop and its close handshake
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► RUNNING ──(terminal condition)──► CLOSING ──► CLOSED
//!              ▲  │
//!              └──┘ envelope dispatched / violation tolerated
//! ```
//!
//! A session owns one background read task and one dispatch task. The read
//! task decodes frames and runs the inbound checks; everything that calls
//! into listeners is queued on the dispatch task so delivery keeps wire order
//! without blocking the socket. Every wait during teardown is bounded by
//! `NetConfig::shutdown_timeout`.

use super::ban::BanFilter;
use super::capabilities::{Capabilities, Capability};
use super::context::NetContext;
use super::framing::{EnvelopeReader, EnvelopeWriter, FrameError, ReceivedFrame, ResolveError};
use super::listener::{
    CapabilityListener, CapabilityRegistry, CapabilitySubscription, ConnectionListener,
    MessageListener, MessageListeners,
};
use super::message::{BundledEnvelope, BundledEnvelopes, NetworkEnvelope};
use super::rate_limit::{InboundThrottle, OutboundThrottle, SpacingThrottle};
use super::rule_violation::{CloseConnectionReason, RuleViolation, RuleViolations};
use super::serde_safe::BoundedVec;
use super::statistics::{ConnectionStatistics, StatisticsSnapshot};
use crate::types::NodeAddress;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Job = Box<dyn FnOnce() + Send>;
type Callback = Box<dyn FnOnce() + Send>;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("connection stopped")]
    Stopped,
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),
    #[error("sender address {declared} does not match peer address {known}")]
    SenderAddressMismatch {
        declared: NodeAddress,
        known: NodeAddress,
    },
}

/// Who opened the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// What `send` did with an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the socket; payload size in bytes
    Sent { size: usize },
    /// Dropped by capability gating (or an emptied bundle)
    NotSupported,
    /// Peer is banned; a PEER_BANNED violation was recorded
    PeerBanned,
    /// Session already stopped
    Stopped,
}

/// Outcome of one read-loop step
enum Flow {
    Continue,
    Close,
}

struct Inner {
    uid: String,
    direction: Direction,
    ctx: Arc<NetContext>,

    writer: tokio::sync::Mutex<Option<EnvelopeWriter<BoxedWriter>>>,
    /// Fired by teardown; aborts writes still pending on the socket
    cancel_tx: watch::Sender<bool>,
    send_throttle: Mutex<OutboundThrottle>,

    peer_address: RwLock<Option<NodeAddress>>,
    capabilities: RwLock<Capabilities>,
    violations: Mutex<RuleViolations>,

    /// Set once no more envelopes may be written
    stopped: AtomicBool,
    /// Set by the first shutdown call
    shutdown_started: AtomicBool,
    close_reason: OnceLock<CloseConnectionReason>,
    closed_tx: watch::Sender<Option<CloseConnectionReason>>,

    message_listeners: MessageListeners,
    capability_listeners: Arc<CapabilityRegistry>,
    connection_listener: Arc<dyn ConnectionListener>,
    statistics: ConnectionStatistics,

    dispatcher: Mutex<Option<mpsc::Sender<Job>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one peer session. Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("Listener panicked while handling a connection event");
    }
}

fn classify_io_error(e: &std::io::Error) -> CloseConnectionReason {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotConnected => CloseConnectionReason::SocketClosed,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            CloseConnectionReason::Reset
        }
        ErrorKind::UnexpectedEof => CloseConnectionReason::Terminated,
        ErrorKind::TimedOut => CloseConnectionReason::SocketTimeout,
        _ => CloseConnectionReason::UnknownException,
    }
}

impl Connection {
    /// Wrap an established socket and start its read loop.
    ///
    /// Must be called from within a Tokio runtime. `peer_address` is known
    /// up front for outbound sessions; inbound sessions learn it from the
    /// first envelope that declares a sender.
    pub fn new<S>(
        socket: S,
        direction: Direction,
        peer_address: Option<NodeAddress>,
        message_listener: Arc<dyn MessageListener>,
        connection_listener: Arc<dyn ConnectionListener>,
        ctx: Arc<NetContext>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = &ctx.config;
        let (read_half, write_half) = tokio::io::split(socket);

        // Writer strictly before reader
        let writer: BoxedWriter = Box::new(write_half);
        let writer = EnvelopeWriter::new(writer, config.message_version);
        let reader: BoxedReader = Box::new(read_half);
        let reader = EnvelopeReader::new(
            reader,
            config.max_permitted_message_size,
            ctx.resolver.clone(),
        );

        let (job_tx, mut job_rx) = mpsc::channel::<Job>(config.dispatch_queue_size.max(1));
        let dispatch_task = tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                run_job(job);
            }
        });

        let (closed_tx, _) = watch::channel(None);
        let (cancel_tx, _) = watch::channel(false);
        let send_throttle =
            OutboundThrottle::new(config.send_msg_throttle_trigger, config.send_msg_throttle_sleep);

        let connection = Self {
            inner: Arc::new(Inner {
                uid: uuid::Uuid::new_v4().to_string(),
                direction,
                writer: tokio::sync::Mutex::new(Some(writer)),
                cancel_tx,
                send_throttle: Mutex::new(send_throttle),
                peer_address: RwLock::new(peer_address.clone()),
                capabilities: RwLock::new(Capabilities::new()),
                violations: Mutex::new(RuleViolations::new()),
                stopped: AtomicBool::new(false),
                shutdown_started: AtomicBool::new(false),
                close_reason: OnceLock::new(),
                closed_tx,
                message_listeners: MessageListeners::default(),
                capability_listeners: Arc::new(CapabilityRegistry::default()),
                connection_listener: connection_listener.clone(),
                statistics: ConnectionStatistics::new(),
                dispatcher: Mutex::new(Some(job_tx.clone())),
                dispatch_task: Mutex::new(Some(dispatch_task)),
                read_task: Mutex::new(None),
                ctx,
            }),
        };
        connection.add_message_listener(message_listener);

        // First job on a fresh queue, so it always fits and precedes any delivery
        let conn = connection.clone();
        let on_connection: Job = Box::new(move || connection_listener.on_connection(&conn));
        if let Err(e) = job_tx.try_send(on_connection) {
            let job = match e {
                mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => {
                    job
                }
            };
            tokio::spawn(async move { run_job(job) });
        }
        drop(job_tx);

        let read_task = tokio::spawn(connection.clone().read_loop(reader));
        *connection.inner.read_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(read_task);

        debug!("New {} connection {} to {:?}", direction, connection.uid(), peer_address);

        if let Some(addr) = peer_address {
            if connection.is_banned(&addr) {
                connection.report_invalid_request(
                    RuleViolation::PeerBanned,
                    &format!("Connection to banned peer {}", addr),
                );
            }
        }

        connection
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn peer_address(&self) -> Option<NodeAddress> {
        self.inner
            .peer_address
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_peer_address(&self, addr: NodeAddress) {
        let mut current = self.inner.peer_address.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = current.as_ref() {
            if *existing != addr {
                warn!("Peer address of {} changed from {} to {}", self.uid(), existing, addr);
            }
        }
        *current = Some(addr);
    }

    /// Capabilities last announced by the peer
    pub fn capabilities(&self) -> Capabilities {
        self.inner
            .capabilities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_capability_supported(&self, capability: Capability) -> bool {
        self.inner
            .capabilities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(capability)
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.statistics.snapshot()
    }

    /// Violation that closed the session, if any
    pub fn rule_violation(&self) -> Option<RuleViolation> {
        self.inner
            .violations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .terminal()
    }

    pub fn rule_violation_count(&self, violation: RuleViolation) -> u32 {
        self.inner
            .violations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .count(violation)
    }

    pub fn rule_violations(&self) -> RuleViolations {
        self.inner
            .violations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown_started.load(Ordering::SeqCst)
    }

    /// Reason recorded by the first shutdown call
    pub fn close_reason(&self) -> Option<CloseConnectionReason> {
        self.inner.close_reason.get().copied()
    }

    /// Resolves once teardown has finished
    pub async fn closed(&self) -> CloseConnectionReason {
        let mut rx = self.inner.closed_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => *reason,
            Err(_) => None,
        };
        reason.unwrap_or(CloseConnectionReason::UnknownException)
    }

    pub fn print_details(&self) -> String {
        format!(
            "Connection{{peer={:?}, direction={}, uid={}, stopped={}, close_reason={:?}, rule_violation={:?}, rule_violations={}, capabilities={}, stats=[{}]}}",
            self.peer_address(),
            self.direction(),
            self.uid(),
            self.is_stopped(),
            self.close_reason(),
            self.rule_violation(),
            self.rule_violations(),
            self.capabilities(),
            self.statistics()
        )
    }

    // =========================================================================
    // LISTENERS
    // =========================================================================

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.inner.message_listeners.add(listener);
    }

    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        let removed = self.inner.message_listeners.remove(listener);
        if !removed {
            debug!("Tried to remove a message listener that was not registered on {}", self.uid());
        }
        removed
    }

    /// The listener stays registered while the returned handle lives
    pub fn add_capability_listener(
        &self,
        listener: Arc<dyn CapabilityListener>,
    ) -> CapabilitySubscription {
        self.inner.capability_listeners.subscribe(listener)
    }

    async fn enqueue(&self, job: Job) {
        let tx = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match tx {
            Some(tx) => {
                if tx.send(job).await.is_err() {
                    trace!("Dispatcher of {} closed, dropping job", self.uid());
                }
            }
            None => trace!("Dispatcher of {} gone, dropping job", self.uid()),
        }
    }

    async fn dispatch(&self, envelope: NetworkEnvelope) {
        let listeners = self.inner.message_listeners.snapshot();
        let conn = self.clone();
        self.enqueue(Box::new(move || {
            for listener in &listeners {
                listener.on_message(&envelope, &conn);
            }
        }))
        .await;
    }

    // =========================================================================
    // SEND
    // =========================================================================

    /// Send one envelope to the peer.
    ///
    /// Waits for the outbound throttle when sends come too close together.
    /// Safe to call concurrently; writes are serialized internally. A write
    /// failure closes the session and is returned to the caller.
    pub async fn send(&self, envelope: NetworkEnvelope) -> Result<SendOutcome, NetError> {
        let started = Instant::now();
        if self.is_stopped() {
            debug!("Called send on stopped connection {}", self.uid());
            return Ok(SendOutcome::Stopped);
        }

        if let Some(addr) = self.peer_address() {
            if self.is_banned(&addr) {
                self.report_invalid_request(
                    RuleViolation::PeerBanned,
                    &format!("Tried to send {} to banned peer", envelope.command()),
                );
                return Ok(SendOutcome::PeerBanned);
            }
        }

        let Some(envelope) = self.filter_by_capability(envelope) else {
            debug!("Capability for envelope is required but not supported by {}", self.uid());
            return Ok(SendOutcome::NotSupported);
        };

        let delay = self
            .inner
            .send_throttle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reserve();
        if !delay.is_zero() {
            debug!(
                "Two sends to {} within {:?}, delaying {} by {:?}",
                self.uid(),
                self.inner.ctx.config.send_msg_throttle_trigger,
                envelope.command(),
                delay
            );
            sleep(delay).await;
        }

        if self.is_stopped() {
            return Ok(SendOutcome::Stopped);
        }

        let send_timeout = self.inner.ctx.config.send_timeout;
        let result = match timeout(send_timeout, self.write(&envelope)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Sending {} to {} did not complete within {:?}",
                    envelope.command(),
                    self.uid(),
                    send_timeout
                );
                self.shutdown(CloseConnectionReason::SendMsgTimeout);
                return Err(NetError::SendTimeout(send_timeout));
            }
        };

        match result {
            Ok(size) => {
                let listeners = self.inner.message_listeners.snapshot();
                let conn = self.clone();
                let took = started.elapsed();
                self.enqueue(Box::new(move || {
                    conn.inner
                        .statistics
                        .on_message_sent(envelope.command(), size, took);
                    for listener in &listeners {
                        listener.on_message_sent(&envelope, &conn);
                    }
                }))
                .await;
                Ok(SendOutcome::Sent { size })
            }
            Err(e) => {
                self.handle_send_error(&e);
                Err(e)
            }
        }
    }

    /// Serialized write. Aborted by teardown so a peer that stops reading
    /// cannot hold the writer.
    async fn write(&self, envelope: &NetworkEnvelope) -> Result<usize, NetError> {
        let max_size = self.inner.ctx.config.max_size(envelope.permits_extended_size());
        let mut cancelled = self.inner.cancel_tx.subscribe();
        let write = async {
            let mut guard = self.inner.writer.lock().await;
            let writer = guard.as_mut().ok_or(NetError::Stopped)?;
            Ok::<usize, NetError>(writer.write_envelope(envelope, max_size).await?)
        };
        tokio::select! {
            result = write => result,
            _ = cancelled.wait_for(|cancelled| *cancelled) => Err(NetError::Stopped),
        }
    }

    fn handle_send_error(&self, e: &NetError) {
        if self.is_stopped() {
            return;
        }
        if let Some(suppressed) = self.inner.ctx.diagnostics.send_failure.permit() {
            warn!(
                "Send to {} failed: {} ({} similar failures suppressed)",
                self.uid(),
                e,
                suppressed
            );
        }
        // Local encoding problems do not implicate the peer
        if let NetError::Frame(FrameError::Io(io)) = e {
            self.shutdown(classify_io_error(io));
        }
    }

    /// Apply capability gating. `None` means nothing is left to send.
    fn filter_by_capability(&self, envelope: NetworkEnvelope) -> Option<NetworkEnvelope> {
        let capabilities = self.inner.capabilities.read().unwrap_or_else(|e| e.into_inner());
        let supported = |required: Option<&Capabilities>| {
            required.is_none_or(|required| capabilities.contains_all(required))
        };

        match envelope {
            NetworkEnvelope::Bundle { envelopes } => {
                let before = envelopes.len();
                let kept: Vec<BundledEnvelope> = envelopes
                    .into_iter()
                    .filter(|e| supported(e.required_capabilities()))
                    .collect();
                if kept.len() != before {
                    debug!(
                        "Removed {} bundle elements not supported by {}",
                        before - kept.len(),
                        self.uid()
                    );
                }
                if kept.is_empty() {
                    return None;
                }
                let envelopes: BundledEnvelopes = BoundedVec::new_unchecked(kept);
                Some(NetworkEnvelope::Bundle { envelopes })
            }
            other => supported(other.required_capabilities()).then_some(other),
        }
    }

    fn is_banned(&self, addr: &NodeAddress) -> bool {
        self.inner
            .ctx
            .ban_filter
            .as_ref()
            .is_some_and(|filter: &Arc<dyn BanFilter>| filter.is_banned(addr))
    }

    // =========================================================================
    // RULE VIOLATIONS
    // =========================================================================

    /// Count one violation. Returns true if the tolerance was reached and
    /// the session is closing.
    pub fn report_invalid_request(&self, violation: RuleViolation, message: &str) -> bool {
        let tolerance = self.inner.ctx.config.tolerances.get(violation);
        let report = self
            .inner
            .violations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(violation, tolerance);

        match self.inner.ctx.diagnostics.invalid_request.permit() {
            Some(suppressed) => warn!(
                "Rule violation {} ({}/{}) on {} from {:?}: {} ({} reports suppressed)",
                violation,
                report.count,
                report.tolerance,
                self.uid(),
                self.peer_address(),
                message,
                suppressed
            ),
            None => trace!("Rule violation {} on {}: {}", violation, self.uid(), message),
        }

        if report.closing {
            debug!(
                "Violation {} reached tolerance {} on {}, closing",
                violation,
                report.tolerance,
                self.uid()
            );
            self.shutdown(violation.close_reason());
            true
        } else {
            false
        }
    }

    // =========================================================================
    // READ LOOP
    // =========================================================================

    async fn read_loop(self, mut reader: EnvelopeReader<BoxedReader>) {
        let config = &self.inner.ctx.config;
        let mut inbound =
            InboundThrottle::new(config.msg_throttle_per_sec, config.msg_throttle_per_10_sec);
        let mut spacing =
            SpacingThrottle::new(config.inbound_spacing_trigger, config.inbound_spacing_sleep);

        loop {
            if self.is_stopped() {
                break;
            }

            let result = timeout(config.socket_timeout, reader.read_envelope()).await;

            if self.is_stopped() {
                break;
            }

            let flow = match result {
                Err(_) => {
                    debug!("Read timeout on {}", self.uid());
                    self.shutdown(CloseConnectionReason::SocketTimeout);
                    Flow::Close
                }
                Ok(Ok(None)) => {
                    debug!("Peer closed the stream on {}", self.uid());
                    self.shutdown(CloseConnectionReason::Terminated);
                    Flow::Close
                }
                Ok(Err(e)) => self.handle_read_error(e),
                Ok(Ok(Some(frame))) => self.on_frame(frame, &mut inbound, &mut spacing).await,
            };

            if let Flow::Close = flow {
                break;
            }
        }
        trace!("Read loop of {} finished", self.uid());
    }

    fn handle_read_error(&self, e: FrameError) -> Flow {
        let ours = self.inner.ctx.config.message_version;
        let closed = match e {
            FrameError::Io(io) => {
                let reason = classify_io_error(&io);
                debug!("Read failed on {}: {} ({})", self.uid(), io, reason);
                self.shutdown(reason);
                true
            }
            FrameError::InvalidMagic => {
                warn!("Invalid frame magic from {}, stream is corrupted", self.uid());
                self.shutdown(CloseConnectionReason::CorruptedData);
                true
            }
            FrameError::InvalidChecksum => self.report_invalid_request(
                RuleViolation::InvalidDataType,
                "invalid frame checksum",
            ),
            FrameError::MessageTooLarge(size, max) => self.report_invalid_request(
                RuleViolation::MaxMsgSizeExceeded,
                &format!("frame of {} bytes exceeds hard limit {}", size, max),
            ),
            FrameError::Resolve(err) => {
                let violation = match (&err, err.message_version()) {
                    (_, Some(version)) if version != ours => RuleViolation::WrongNetworkId,
                    (ResolveError::UnknownClass { .. }, _) => RuleViolation::InvalidClass,
                    (ResolveError::InvalidData { .. }, _) => RuleViolation::InvalidDataType,
                };
                self.report_invalid_request(violation, &err.to_string())
            }
            FrameError::Encode(err) => {
                error!("Unexpected encode error while reading on {}: {}", self.uid(), err);
                self.shutdown(CloseConnectionReason::UnknownException);
                true
            }
        };
        if closed { Flow::Close } else { Flow::Continue }
    }

    fn check(&self, violation: RuleViolation, message: impl FnOnce() -> String) -> Flow {
        if self.report_invalid_request(violation, &message()) {
            Flow::Close
        } else {
            Flow::Continue
        }
    }

    async fn on_frame(
        &self,
        frame: ReceivedFrame,
        inbound: &mut InboundThrottle,
        spacing: &mut SpacingThrottle,
    ) -> Flow {
        let config = &self.inner.ctx.config;
        let ReceivedFrame { wire, size } = frame;
        let envelope = wire.envelope;

        if let Some(addr) = self.peer_address() {
            if self.is_banned(&addr) {
                self.report_invalid_request(
                    RuleViolation::PeerBanned,
                    &format!("Received {} from banned peer {}", envelope.command(), addr),
                );
                // Never process a banned peer's envelope, closing or not
                return if self.is_shutting_down() { Flow::Close } else { Flow::Continue };
            }
        }

        let delay = spacing.delay_at(Instant::now());
        if !delay.is_zero() {
            trace!("Inbound envelopes on {} too close together, pausing {:?}", self.uid(), delay);
            sleep(delay).await;
        }

        self.inner.statistics.on_message_recv(envelope.command(), size);

        if !Self::hash_sizes_valid(&envelope) {
            if let Flow::Close = self.check(RuleViolation::MaxMsgSizeExceeded, || {
                "persistable payload with invalid hash size".to_string()
            }) {
                return Flow::Close;
            }
        }

        let max_size = config.max_size(envelope.permits_extended_size());
        if size > max_size {
            if let Flow::Close = self.check(RuleViolation::MaxMsgSizeExceeded, || {
                format!("{} of {} bytes exceeds {}", envelope.command(), size, max_size)
            }) {
                return Flow::Close;
            }
        }

        if inbound.record_at(Instant::now()) {
            if let Flow::Close = self.check(RuleViolation::ThrottleLimitExceeded, || {
                format!(
                    "more than {}/s or {}/10s envelopes",
                    config.msg_throttle_per_sec, config.msg_throttle_per_10_sec
                )
            }) {
                return Flow::Close;
            }
        }

        if wire.message_version != config.message_version {
            if let Flow::Close = self.check(RuleViolation::WrongNetworkId, || {
                format!(
                    "message version {} (ours {})",
                    wire.message_version, config.message_version
                )
            }) {
                return Flow::Close;
            }
        }

        // A data response without capabilities announces nothing
        let announced = match &envelope {
            NetworkEnvelope::GetDataResponse(resp) if resp.supported_capabilities.is_empty() => {
                None
            }
            other => other.supported_capabilities(),
        };
        if let Some(announced) = announced {
            if let Flow::Close = self.on_supported_capabilities(announced).await {
                return Flow::Close;
            }
        }

        if let NetworkEnvelope::Close { reason } = &envelope {
            if reason.as_str() == CloseConnectionReason::PeerBanned.name() {
                warn!("Peer {:?} closed {} because it banned us", self.peer_address(), self.uid());
            } else {
                info!("Peer {:?} closed {}: {}", self.peer_address(), self.uid(), reason);
            }
            self.shutdown(CloseConnectionReason::CloseRequestedByPeer);
            return Flow::Close;
        }

        if !envelope.is_keep_alive() {
            self.inner.statistics.update_last_activity();
        }
        if let NetworkEnvelope::Ping { last_round_trip_time, .. } = &envelope {
            if *last_round_trip_time > 0 {
                self.inner.statistics.set_round_trip_time(*last_round_trip_time);
            }
        }

        match envelope {
            NetworkEnvelope::Bundle { envelopes } => self.on_bundle(envelopes).await,
            envelope => {
                if let Some(sender) = envelope.sender_node_address() {
                    match self.process_sender_address(sender) {
                        Ok(true) => {}
                        Ok(false) => {
                            return if self.is_shutting_down() {
                                Flow::Close
                            } else {
                                Flow::Continue
                            };
                        }
                        Err(e) => return self.fail(e),
                    }
                }
                self.dispatch(envelope).await;
                Flow::Continue
            }
        }
    }

    fn hash_sizes_valid(envelope: &NetworkEnvelope) -> bool {
        match envelope {
            NetworkEnvelope::Bundle { envelopes } => envelopes
                .iter()
                .filter_map(BundledEnvelope::persistable_payload)
                .all(|p| p.verify_hash_size()),
            other => other.persistable_payload().is_none_or(|p| p.verify_hash_size()),
        }
    }

    /// Returns `Flow::Close` if the announcement was rejected
    async fn on_supported_capabilities(&self, announced: &Capabilities) -> Flow {
        let mandatory = &self.inner.ctx.config.mandatory_capabilities;
        if !announced.contains_all(mandatory) {
            warn!(
                "Peer {:?} on {} lacks mandatory capabilities {}",
                self.peer_address(),
                self.uid(),
                announced.missing(mandatory)
            );
            self.shutdown(CloseConnectionReason::MandatoryCapabilitiesNotSupported);
            return Flow::Close;
        }

        {
            let mut current = self.inner.capabilities.write().unwrap_or_else(|e| e.into_inner());
            if *current == *announced {
                return Flow::Continue;
            }
            current.set(announced);
        }
        debug!("Peer capabilities of {} updated to {}", self.uid(), announced);

        let listeners = self.inner.capability_listeners.snapshot();
        if !listeners.is_empty() {
            let announced = announced.clone();
            self.enqueue(Box::new(move || {
                for listener in &listeners {
                    listener.on_changed(&announced);
                }
            }))
            .await;
        }
        Flow::Continue
    }

    /// Validate or learn the peer address from a self-reporting envelope.
    /// `Ok(false)` means the sender is banned and the envelope must be skipped.
    fn process_sender_address(&self, sender: &NodeAddress) -> Result<bool, NetError> {
        match self.peer_address() {
            Some(known) if known != *sender => {
                return Err(NetError::SenderAddressMismatch {
                    declared: sender.clone(),
                    known,
                });
            }
            Some(_) => {}
            None => self.set_peer_address(sender.clone()),
        }

        if self.is_banned(sender) {
            self.report_invalid_request(
                RuleViolation::PeerBanned,
                &format!("Envelope from banned sender {}", sender),
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn on_bundle(&self, envelopes: BundledEnvelopes) -> Flow {
        let mut seen_hashes: HashSet<Vec<u8>> = HashSet::new();
        for element in envelopes {
            if self.is_shutting_down() {
                return Flow::Close;
            }

            if let Some(sender) = element.sender_node_address() {
                match self.process_sender_address(sender) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => return self.fail(e),
                }
            }

            if let Some(payload) = element.persistable_payload() {
                if !seen_hashes.insert(payload.hash.to_vec()) {
                    trace!(
                        "Skipping duplicate persistable payload {} in bundle",
                        hex::encode(&*payload.hash)
                    );
                    continue;
                }
            }

            self.dispatch(NetworkEnvelope::from(element)).await;
        }
        Flow::Continue
    }

    /// Local invariant broken: not the peer's fault to tolerate
    fn fail(&self, e: NetError) -> Flow {
        error!("Closing {}: {}", self.uid(), e);
        self.shutdown(CloseConnectionReason::UnknownException);
        Flow::Close
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Close the session. Idempotent; only the first reason is recorded.
    pub fn shutdown(&self, reason: CloseConnectionReason) {
        self.begin_shutdown(reason, None);
    }

    /// Close the session and run `on_complete` once teardown has finished.
    /// Later calls still run their callback, after the first teardown.
    pub fn shutdown_with_callback<F>(&self, reason: CloseConnectionReason, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.begin_shutdown(reason, Some(Box::new(on_complete)));
    }

    fn begin_shutdown(&self, reason: CloseConnectionReason, on_complete: Option<Callback>) {
        if self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("Shutdown of {} already in progress ({})", self.uid(), reason);
            if let Some(on_complete) = on_complete {
                let conn = self.clone();
                tokio::spawn(async move {
                    conn.closed().await;
                    on_complete();
                });
            }
            return;
        }

        let _ = self.inner.close_reason.set(reason);
        debug!(
            "Shutting down connection {} to {:?}: {}",
            self.uid(),
            self.peer_address(),
            reason
        );

        let conn = self.clone();
        if reason.send_close_message() {
            tokio::spawn(async move {
                conn.send_close_message(reason).await;
                conn.inner.stopped.store(true, Ordering::SeqCst);
                sleep(conn.inner.ctx.config.close_flush_delay).await;
                conn.teardown(reason, on_complete).await;
            });
        } else {
            self.inner.stopped.store(true, Ordering::SeqCst);
            tokio::spawn(async move {
                conn.teardown(reason, on_complete).await;
            });
        }
    }

    /// Bypasses ban, capability and throttle checks: the close frame must go out
    async fn send_close_message(&self, reason: CloseConnectionReason) {
        let name = match (reason, self.rule_violation()) {
            (CloseConnectionReason::RuleViolation, Some(violation)) => violation.name(),
            _ => reason.name(),
        };
        let envelope = NetworkEnvelope::close(name);
        match timeout(self.inner.ctx.config.close_flush_delay, self.write(&envelope)).await {
            Ok(Ok(size)) => {
                self.inner
                    .statistics
                    .on_message_sent(envelope.command(), size, Default::default());
            }
            Ok(Err(e)) => debug!("Could not send close message on {}: {}", self.uid(), e),
            Err(_) => debug!("Timed out sending close message on {}", self.uid()),
        }
    }

    async fn teardown(&self, reason: CloseConnectionReason, on_complete: Option<Callback>) {
        let bound = self.inner.ctx.config.shutdown_timeout;
        self.inner.stopped.store(true, Ordering::SeqCst);

        // Disconnect observer, queued behind pending deliveries
        let listener = self.inner.connection_listener.clone();
        let conn = self.clone();
        let job: Job = Box::new(move || listener.on_disconnect(reason, &conn));
        let tx = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let leftover = match tx {
            Some(tx) => match tx.send_timeout(job, bound).await {
                Ok(()) => None,
                Err(SendTimeoutError::Timeout(job)) | Err(SendTimeoutError::Closed(job)) => {
                    Some(job)
                }
            },
            None => Some(job),
        };
        if let Some(job) = leftover {
            tokio::spawn(async move { run_job(job) });
        }

        // Output stream, then the socket write half. Pending writes give up
        // the lock first.
        self.inner.cancel_tx.send_replace(true);
        match timeout(bound, self.inner.writer.lock()).await {
            Ok(mut guard) => {
                if let Some(mut writer) = guard.take() {
                    match timeout(bound, writer.shutdown()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => trace!("Shutdown of writer on {} failed: {}", self.uid(), e),
                        Err(_) => trace!("Shutdown of writer on {} timed out", self.uid()),
                    }
                }
            }
            Err(_) => debug!("Writer of {} busy at shutdown, dropping with session", self.uid()),
        }

        self.inner.capability_listeners.clear();

        // Input stream
        if let Some(read_task) = self
            .inner
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            read_task.abort();
        }

        // Task runner
        drop(
            self.inner
                .dispatcher
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        let dispatch_task = self
            .inner
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut dispatch_task) = dispatch_task {
            if timeout(bound, &mut dispatch_task).await.is_err() {
                debug!("Dispatcher of {} did not finish in {:?}, aborting", self.uid(), bound);
                dispatch_task.abort();
            }
        }

        debug!("Connection {} shutdown complete ({})", self.uid(), reason);
        if let Some(on_complete) = on_complete {
            run_job(on_complete);
        }
        self.inner.closed_tx.send_replace(Some(reason));
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.uid == other.inner.uid
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.uid.hash(state);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peer = self
            .peer_address()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        write!(
            f,
            "Connection{{peer={}, direction={}, uid={}}}",
            peer,
            self.direction(),
            self.uid()
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        use std::io::{Error, ErrorKind};
        assert_eq!(
            classify_io_error(&Error::from(ErrorKind::ConnectionReset)),
            CloseConnectionReason::Reset
        );
        assert_eq!(
            classify_io_error(&Error::from(ErrorKind::BrokenPipe)),
            CloseConnectionReason::Reset
        );
        assert_eq!(
            classify_io_error(&Error::from(ErrorKind::NotConnected)),
            CloseConnectionReason::SocketClosed
        );
        assert_eq!(
            classify_io_error(&Error::from(ErrorKind::UnexpectedEof)),
            CloseConnectionReason::Terminated
        );
        assert_eq!(
            classify_io_error(&Error::from(ErrorKind::TimedOut)),
            CloseConnectionReason::SocketTimeout
        );
        assert_eq!(
            classify_io_error(&Error::from(ErrorKind::PermissionDenied)),
            CloseConnectionReason::UnknownException
        );
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Inbound.to_string(), "inbound");
        assert_eq!(Direction::Outbound.to_string(), "outbound");
    }
}
