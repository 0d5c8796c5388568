//! Process-owned state shared by every session of a node

use super::ban::BanFilter;
use super::config::NetConfig;
use super::framing::{EnvelopeResolver, PostcardResolver};
use super::rate_limit::LogThrottle;
use std::sync::Arc;

/// Log throttles, one per diagnostic category
#[derive(Debug)]
pub struct Diagnostics {
    /// Rule violation reports
    pub invalid_request: LogThrottle,
    /// Send failures on sessions that were still running
    pub send_failure: LogThrottle,
}

impl Diagnostics {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            invalid_request: LogThrottle::new(config.log_throttle_interval),
            send_failure: LogThrottle::new(config.log_throttle_interval),
        }
    }
}

/// Everything a session needs from its node besides the socket and the
/// listeners. Built once and shared by `Arc`.
pub struct NetContext {
    pub config: NetConfig,
    pub resolver: Arc<dyn EnvelopeResolver>,
    pub ban_filter: Option<Arc<dyn BanFilter>>,
    pub diagnostics: Diagnostics,
}

impl NetContext {
    pub fn new(config: NetConfig) -> Self {
        let diagnostics = Diagnostics::new(&config);
        Self {
            config,
            resolver: Arc::new(PostcardResolver),
            ban_filter: None,
            diagnostics,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn EnvelopeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_ban_filter(mut self, ban_filter: Arc<dyn BanFilter>) -> Self {
        self.ban_filter = Some(ban_filter);
        self
    }
}

impl Default for NetContext {
    fn default() -> Self {
        Self::new(NetConfig::default())
    }
}
