//! Session configuration

use super::capabilities::Capabilities;
use super::rule_violation::ViolationTolerances;
use super::types::{
    CLOSE_FLUSH_DELAY, DISPATCH_QUEUE_SIZE, INBOUND_SPACING_SLEEP, INBOUND_SPACING_TRIGGER,
    LOG_THROTTLE_INTERVAL, MAX_PERMITTED_MESSAGE_SIZE, MSG_THROTTLE_PER_10_SEC,
    MSG_THROTTLE_PER_SEC, P2P_MESSAGE_VERSION, PERMITTED_MESSAGE_SIZE, SEND_MSG_THROTTLE_SLEEP,
    SEND_MSG_THROTTLE_TRIGGER, SEND_MSG_TIMEOUT, SHUTDOWN_TIMEOUT, SOCKET_TIMEOUT,
};
use std::time::Duration;

/// Network configuration shared by every session of a node
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Envelopes with another version come from a different network
    pub message_version: u32,
    /// Read timeout; a silent peer is closed with SOCKET_TIMEOUT
    pub socket_timeout: Duration,
    pub permitted_message_size: usize,
    /// Ceiling for extended-size envelopes; also the hard frame limit
    pub max_permitted_message_size: usize,
    pub send_msg_throttle_trigger: Duration,
    pub send_msg_throttle_sleep: Duration,
    /// Bound on one envelope write; exceeding it closes with SEND_MSG_TIMEOUT
    pub send_timeout: Duration,
    pub msg_throttle_per_sec: usize,
    pub msg_throttle_per_10_sec: usize,
    /// Independent of the per-second ceilings
    pub inbound_spacing_trigger: Duration,
    pub inbound_spacing_sleep: Duration,
    pub close_flush_delay: Duration,
    /// Bound on each teardown wait
    pub shutdown_timeout: Duration,
    pub log_throttle_interval: Duration,
    pub dispatch_queue_size: usize,
    pub mandatory_capabilities: Capabilities,
    pub tolerances: ViolationTolerances,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            message_version: P2P_MESSAGE_VERSION,
            socket_timeout: SOCKET_TIMEOUT,
            permitted_message_size: PERMITTED_MESSAGE_SIZE,
            max_permitted_message_size: MAX_PERMITTED_MESSAGE_SIZE,
            send_msg_throttle_trigger: SEND_MSG_THROTTLE_TRIGGER,
            send_msg_throttle_sleep: SEND_MSG_THROTTLE_SLEEP,
            send_timeout: SEND_MSG_TIMEOUT,
            msg_throttle_per_sec: MSG_THROTTLE_PER_SEC,
            msg_throttle_per_10_sec: MSG_THROTTLE_PER_10_SEC,
            inbound_spacing_trigger: INBOUND_SPACING_TRIGGER,
            inbound_spacing_sleep: INBOUND_SPACING_SLEEP,
            close_flush_delay: CLOSE_FLUSH_DELAY,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            log_throttle_interval: LOG_THROTTLE_INTERVAL,
            dispatch_queue_size: DISPATCH_QUEUE_SIZE,
            mandatory_capabilities: Capabilities::mandatory(),
            tolerances: ViolationTolerances::default(),
        }
    }
}

impl NetConfig {
    /// Size ceiling for one envelope
    pub fn max_size(&self, permits_extended_size: bool) -> usize {
        if permits_extended_size {
            self.max_permitted_message_size
        } else {
            self.permitted_message_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetConfig::default();
        assert_eq!(config.max_size(false), 200 * 1024);
        assert_eq!(config.max_size(true), 10 * 1024 * 1024);
        assert_eq!(config.socket_timeout, Duration::from_secs(240));
        assert_eq!(config.send_timeout, Duration::from_secs(90));
        assert_eq!(config.msg_throttle_per_sec, 200);
        assert_eq!(config.msg_throttle_per_10_sec, 1000);
    }
}
