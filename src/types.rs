//! Core types shared by the network and storage layers

use crate::net::serde_safe::BoundedString;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// 32-byte content hash (SHA3-256)
pub type Hash = [u8; 32];

/// Maximum host name length accepted from the wire (onion v3 addresses are 62 chars)
pub const MAX_HOST_NAME_LEN: usize = 255;

/// Current unix time in seconds
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current unix time in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Address a peer is reachable at.
///
/// Peers behind an anonymity network are identified by host name, so this is
/// not a `SocketAddr`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(deserialize_with = "deserialize_host_name")]
    pub host_name: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host_name: impl Into<String>, port: u16) -> Self {
        Self {
            host_name: host_name.into(),
            port,
        }
    }

    /// Host name within the wire limit and non-empty
    pub fn is_valid(&self) -> bool {
        !self.host_name.is_empty() && self.host_name.len() <= MAX_HOST_NAME_LEN
    }
}

fn deserialize_host_name<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    BoundedString::<MAX_HOST_NAME_LEN>::deserialize(deserializer).map(BoundedString::into_inner)
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_name, self.port)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("missing port in {0}")]
    MissingPort(String),
    #[error("invalid port in {0}")]
    InvalidPort(String),
    #[error("invalid host name in {0}")]
    InvalidHost(String),
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::MissingPort(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| AddressParseError::InvalidPort(s.to_string()))?;
        let addr = NodeAddress::new(host, port);
        if !addr.is_valid() {
            return Err(AddressParseError::InvalidHost(s.to_string()));
        }
        Ok(addr)
    }
}
