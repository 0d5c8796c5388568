//! P2P networking layer

pub mod ban;
pub mod capabilities;
pub mod config;
pub mod connection;
pub mod context;
pub mod framing;
pub mod listener;
pub mod message;
pub mod rate_limit;
pub mod rule_violation;
pub mod serde_safe;
pub mod statistics;
pub mod types;

// Re-exports
pub use ban::{BanEntry, BanFilter, BanList};
pub use capabilities::{Capabilities, Capability};
pub use config::NetConfig;
pub use connection::{Connection, Direction, NetError, SendOutcome};
pub use context::{Diagnostics, NetContext};
pub use framing::{
    EnvelopeReader, EnvelopeResolver, EnvelopeWriter, FrameError, PostcardResolver,
    ReceivedFrame, ResolveError,
};
pub use listener::{
    CapabilityListener, CapabilitySubscription, ConnectionListener, MessageListener,
};
pub use message::{
    BundledEnvelope, DirectMessage, GetDataResponse, NetworkEnvelope, PersistableNetworkPayload,
    ProtectedStorageEntry, StoragePayload, WireEnvelope,
};
pub use rate_limit::{InboundThrottle, LogThrottle, OutboundThrottle, SpacingThrottle};
pub use rule_violation::{
    CloseConnectionReason, RuleViolation, RuleViolations, ViolationReport, ViolationTolerances,
};
pub use statistics::{ConnectionStatistics, StatisticsSnapshot};
pub use types::*;
