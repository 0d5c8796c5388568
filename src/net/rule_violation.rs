//! Rule violations, close reasons and per-connection violation accounting

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Classified protocol infraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuleViolation {
    PeerBanned,
    InvalidClass,
    InvalidDataType,
    MaxMsgSizeExceeded,
    ThrottleLimitExceeded,
    WrongNetworkId,
    /// Catch-all for infractions without a dedicated kind
    Generic,
}

impl RuleViolation {
    pub const ALL: [RuleViolation; 7] = [
        RuleViolation::PeerBanned,
        RuleViolation::InvalidClass,
        RuleViolation::InvalidDataType,
        RuleViolation::MaxMsgSizeExceeded,
        RuleViolation::ThrottleLimitExceeded,
        RuleViolation::WrongNetworkId,
        RuleViolation::Generic,
    ];

    /// Reports tolerated before the connection is closed.
    /// Severe kinds close on the first report.
    pub fn default_tolerance(self) -> u32 {
        match self {
            RuleViolation::PeerBanned => 1,
            RuleViolation::InvalidClass => 1,
            RuleViolation::WrongNetworkId => 1,
            RuleViolation::InvalidDataType => 2,
            RuleViolation::MaxMsgSizeExceeded => 2,
            RuleViolation::ThrottleLimitExceeded => 2,
            RuleViolation::Generic => 2,
        }
    }

    /// Close reason used once the tolerance is reached
    pub fn close_reason(self) -> CloseConnectionReason {
        match self {
            RuleViolation::PeerBanned => CloseConnectionReason::PeerBanned,
            RuleViolation::InvalidClass => CloseConnectionReason::InvalidClassReceived,
            _ => CloseConnectionReason::RuleViolation,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RuleViolation::PeerBanned => "PEER_BANNED",
            RuleViolation::InvalidClass => "INVALID_CLASS",
            RuleViolation::InvalidDataType => "INVALID_DATA_TYPE",
            RuleViolation::MaxMsgSizeExceeded => "MAX_MSG_SIZE_EXCEEDED",
            RuleViolation::ThrottleLimitExceeded => "THROTTLE_LIMIT_EXCEEDED",
            RuleViolation::WrongNetworkId => "WRONG_NETWORK_ID",
            RuleViolation::Generic => "RULE_VIOLATION",
        }
    }
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a session was closed. Exactly one is recorded per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseConnectionReason {
    // Transport faults
    SocketClosed,
    Reset,
    SocketTimeout,
    Terminated,
    CorruptedData,
    NoProtoBufferData,
    NoProtoBufferEnv,
    UnknownException,

    // Local decisions
    AppShutDown,
    CloseRequestedByPeer,

    SendMsgFailure,
    SendMsgTimeout,

    TooManyConnectionsOpen,
    TooManySeedNodesConnected,
    UnknownPeerAddress,

    // Peer misbehaviour
    RuleViolation,
    PeerBanned,
    InvalidClassReceived,
    MandatoryCapabilitiesNotSupported,
}

impl CloseConnectionReason {
    pub const ALL: [CloseConnectionReason; 19] = [
        CloseConnectionReason::SocketClosed,
        CloseConnectionReason::Reset,
        CloseConnectionReason::SocketTimeout,
        CloseConnectionReason::Terminated,
        CloseConnectionReason::CorruptedData,
        CloseConnectionReason::NoProtoBufferData,
        CloseConnectionReason::NoProtoBufferEnv,
        CloseConnectionReason::UnknownException,
        CloseConnectionReason::AppShutDown,
        CloseConnectionReason::CloseRequestedByPeer,
        CloseConnectionReason::SendMsgFailure,
        CloseConnectionReason::SendMsgTimeout,
        CloseConnectionReason::TooManyConnectionsOpen,
        CloseConnectionReason::TooManySeedNodesConnected,
        CloseConnectionReason::UnknownPeerAddress,
        CloseConnectionReason::RuleViolation,
        CloseConnectionReason::PeerBanned,
        CloseConnectionReason::InvalidClassReceived,
        CloseConnectionReason::MandatoryCapabilitiesNotSupported,
    ];

    /// Whether a Close envelope is sent before the socket is torn down
    pub fn send_close_message(self) -> bool {
        matches!(
            self,
            CloseConnectionReason::AppShutDown
                | CloseConnectionReason::TooManyConnectionsOpen
                | CloseConnectionReason::TooManySeedNodesConnected
                | CloseConnectionReason::UnknownPeerAddress
                | CloseConnectionReason::RuleViolation
                | CloseConnectionReason::PeerBanned
        )
    }

    /// Closed on purpose rather than because something broke
    pub fn is_intended(self) -> bool {
        matches!(
            self,
            CloseConnectionReason::AppShutDown
                | CloseConnectionReason::CloseRequestedByPeer
                | CloseConnectionReason::TooManyConnectionsOpen
                | CloseConnectionReason::TooManySeedNodesConnected
                | CloseConnectionReason::UnknownPeerAddress
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            CloseConnectionReason::SocketClosed => "SOCKET_CLOSED",
            CloseConnectionReason::Reset => "RESET",
            CloseConnectionReason::SocketTimeout => "SOCKET_TIMEOUT",
            CloseConnectionReason::Terminated => "TERMINATED",
            CloseConnectionReason::CorruptedData => "CORRUPTED_DATA",
            CloseConnectionReason::NoProtoBufferData => "NO_PROTO_BUFFER_DATA",
            CloseConnectionReason::NoProtoBufferEnv => "NO_PROTO_BUFFER_ENV",
            CloseConnectionReason::UnknownException => "UNKNOWN_EXCEPTION",
            CloseConnectionReason::AppShutDown => "APP_SHUT_DOWN",
            CloseConnectionReason::CloseRequestedByPeer => "CLOSE_REQUESTED_BY_PEER",
            CloseConnectionReason::SendMsgFailure => "SEND_MSG_FAILURE",
            CloseConnectionReason::SendMsgTimeout => "SEND_MSG_TIMEOUT",
            CloseConnectionReason::TooManyConnectionsOpen => "TOO_MANY_CONNECTIONS_OPEN",
            CloseConnectionReason::TooManySeedNodesConnected => "TOO_MANY_SEED_NODES_CONNECTED",
            CloseConnectionReason::UnknownPeerAddress => "UNKNOWN_PEER_ADDRESS",
            CloseConnectionReason::RuleViolation => "RULE_VIOLATION",
            CloseConnectionReason::PeerBanned => "PEER_BANNED",
            CloseConnectionReason::InvalidClassReceived => "INVALID_CLASS_RECEIVED",
            CloseConnectionReason::MandatoryCapabilitiesNotSupported => {
                "MANDATORY_CAPABILITIES_NOT_SUPPORTED"
            }
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.name() == name)
    }
}

impl fmt::Display for CloseConnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-kind tolerance overrides on top of [`RuleViolation::default_tolerance`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViolationTolerances {
    overrides: BTreeMap<RuleViolation, u32>,
}

impl ViolationTolerances {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tolerance for `violation`, never below 1
    pub fn get(&self, violation: RuleViolation) -> u32 {
        self.overrides
            .get(&violation)
            .copied()
            .unwrap_or_else(|| violation.default_tolerance())
            .max(1)
    }

    pub fn set(&mut self, violation: RuleViolation, tolerance: u32) {
        self.overrides.insert(violation, tolerance.max(1));
    }

    pub fn with(mut self, violation: RuleViolation, tolerance: u32) -> Self {
        self.set(violation, tolerance);
        self
    }
}

/// Result of recording one violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationReport {
    pub violation: RuleViolation,
    pub count: u32,
    pub tolerance: u32,
    /// The count reached the tolerance with this report
    pub closing: bool,
}

/// Violation counters of one connection.
/// Not synchronized itself; the connection keeps it behind a mutex so
/// check-and-increment is atomic.
#[derive(Debug, Clone, Default)]
pub struct RuleViolations {
    counts: BTreeMap<RuleViolation, u32>,
    terminal: Option<RuleViolation>,
}

impl RuleViolations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, violation: RuleViolation, tolerance: u32) -> ViolationReport {
        let count = self.counts.entry(violation).or_insert(0);
        *count = count.saturating_add(1);
        let count = *count;
        let closing = count >= tolerance;
        if closing && self.terminal.is_none() {
            self.terminal = Some(violation);
        }
        ViolationReport {
            violation,
            count,
            tolerance,
            closing,
        }
    }

    pub fn count(&self, violation: RuleViolation) -> u32 {
        self.counts.get(&violation).copied().unwrap_or(0)
    }

    /// Violation that closed the connection, if any
    pub fn terminal(&self) -> Option<RuleViolation> {
        self.terminal
    }

    pub fn counts(&self) -> &BTreeMap<RuleViolation, u32> {
        &self.counts
    }
}

impl fmt::Display for RuleViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .counts
            .iter()
            .map(|(v, n)| format!("{}={}", v, n))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
