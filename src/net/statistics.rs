//! Per-connection traffic statistics

use crate::types::{now, now_millis};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Point-in-time copy of a connection's statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatisticsSnapshot {
    pub connected_at: u64,
    /// Last non-keep-alive envelope received, unix millis
    pub last_activity_ms: u64,
    pub last_recv: u64,
    pub last_send: u64,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub messages_recv: u64,
    pub messages_sent: u64,
    pub received_by_command: BTreeMap<&'static str, u64>,
    pub sent_by_command: BTreeMap<&'static str, u64>,
    pub round_trip_time_ms: u64,
    /// Time the last send spent in throttle and write
    pub last_send_duration_ms: u64,
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recv={} msgs/{} bytes sent={} msgs/{} bytes rtt={}ms age={}s",
            self.messages_recv,
            self.bytes_recv,
            self.messages_sent,
            self.bytes_sent,
            self.round_trip_time_ms,
            now().saturating_sub(self.connected_at)
        )
    }
}

/// Live statistics, updated from the read loop and the dispatch task
#[derive(Debug)]
pub struct ConnectionStatistics {
    inner: Mutex<StatisticsSnapshot>,
}

impl ConnectionStatistics {
    pub fn new() -> Self {
        let now_ms = now_millis();
        Self {
            inner: Mutex::new(StatisticsSnapshot {
                connected_at: now(),
                last_activity_ms: now_ms,
                ..Default::default()
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut StatisticsSnapshot) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    pub fn on_message_recv(&self, command: &'static str, size: usize) {
        self.with(|s| {
            s.last_recv = now();
            s.bytes_recv = s.bytes_recv.saturating_add(size as u64);
            s.messages_recv += 1;
            *s.received_by_command.entry(command).or_insert(0) += 1;
        });
    }

    pub fn on_message_sent(&self, command: &'static str, size: usize, took: Duration) {
        self.with(|s| {
            s.last_send = now();
            s.bytes_sent = s.bytes_sent.saturating_add(size as u64);
            s.messages_sent += 1;
            *s.sent_by_command.entry(command).or_insert(0) += 1;
            s.last_send_duration_ms = took.as_millis() as u64;
        });
    }

    pub fn update_last_activity(&self) {
        self.with(|s| s.last_activity_ms = now_millis());
    }

    pub fn set_round_trip_time(&self, millis: u64) {
        self.with(|s| s.round_trip_time_ms = millis);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.with(|s| s.last_activity_ms)
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.with(|s| s.clone())
    }
}

impl Default for ConnectionStatistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ConnectionStatistics::new();
        stats.on_message_recv("ping", 10);
        stats.on_message_recv("adddata", 100);
        stats.on_message_sent("pong", 8, Duration::from_millis(3));

        let snap = stats.snapshot();
        assert_eq!(snap.messages_recv, 2);
        assert_eq!(snap.bytes_recv, 110);
        assert_eq!(snap.messages_sent, 1);
        assert_eq!(snap.bytes_sent, 8);
        assert_eq!(snap.received_by_command.get("adddata"), Some(&1));
        assert_eq!(snap.sent_by_command.get("pong"), Some(&1));
        assert_eq!(snap.last_send_duration_ms, 3);
    }

    #[test]
    fn test_round_trip_time() {
        let stats = ConnectionStatistics::new();
        stats.set_round_trip_time(42);
        assert_eq!(stats.snapshot().round_trip_time_ms, 42);
    }
}
