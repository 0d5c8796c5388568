pub mod crypto;
pub mod net;
pub mod storage;
pub mod types;

pub use crypto::{payload_hash, sha3};
pub use net::{
    Capabilities, Capability, CloseConnectionReason, Connection, NetConfig, NetContext, NetError,
    NetworkEnvelope, RuleViolation,
};
pub use storage::SequenceNumberMap;
pub use types::*;
