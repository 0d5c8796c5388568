//! Ban oracle consumed by sessions, and a persistent ban list implementing it

use crate::types::{NodeAddress, now};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info};

/// Yes/no oracle: is this peer banned
pub trait BanFilter: Send + Sync {
    fn is_banned(&self, addr: &NodeAddress) -> bool;
}

/// Ban entry with expiration and reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    pub addr: NodeAddress,
    pub banned_at: u64,
    pub ban_until: u64,
    pub reason: String,
}

impl BanEntry {
    pub fn new(addr: NodeAddress, duration_secs: u64, reason: String) -> Self {
        let now = now();
        Self {
            addr,
            banned_at: now,
            ban_until: now.saturating_add(duration_secs),
            reason,
        }
    }

    pub fn is_expired(&self) -> bool {
        now() >= self.ban_until
    }
}

/// Maximum serialized size for BanList (security limit for file load)
/// Each entry ~100 bytes, 10000 entries = ~1MB
const MAX_BANLIST_FILE_SIZE: u64 = 1024 * 1024;

/// Persistent ban list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BanList {
    bans: HashMap<NodeAddress, BanEntry>,
}

impl BanList {
    pub fn new() -> Self {
        Self { bans: HashMap::new() }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let data = std::fs::read(&path)?;

        // Security: reject oversized files before deserialization
        if data.len() as u64 > MAX_BANLIST_FILE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("ban list file too large: {} bytes", data.len()),
            ));
        }

        bincode::deserialize(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Missing file means no bans yet
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        match Self::load(path) {
            Ok(list) => Ok(list),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let data = bincode::serialize(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, data)
    }

    pub fn ban(&mut self, entry: BanEntry) {
        info!("Banning {} until {} ({})", entry.addr, entry.ban_until, entry.reason);
        self.bans.insert(entry.addr.clone(), entry);
    }

    pub fn is_banned(&self, addr: &NodeAddress) -> bool {
        self.bans.get(addr).is_some_and(|entry| !entry.is_expired())
    }

    pub fn unban(&mut self, addr: &NodeAddress) -> bool {
        self.bans.remove(addr).is_some()
    }

    pub fn expire(&mut self) {
        self.bans.retain(|addr, entry| {
            let keep = !entry.is_expired();
            if !keep {
                debug!("Ban expired for {}", addr);
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }

    pub fn list(&self) -> Vec<&BanEntry> {
        self.bans.values().collect()
    }
}

impl BanFilter for BanList {
    fn is_banned(&self, addr: &NodeAddress) -> bool {
        BanList::is_banned(self, addr)
    }
}

/// Shared form used by a node: sessions read while the node bans
impl BanFilter for RwLock<BanList> {
    fn is_banned(&self, addr: &NodeAddress) -> bool {
        self.read()
            .unwrap_or_else(|e| e.into_inner())
            .is_banned(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("peer.onion", port)
    }

    #[test]
    fn test_ban_and_unban() {
        let mut list = BanList::new();
        list.ban(BanEntry::new(addr(1), 3600, "spam".into()));
        assert!(list.is_banned(&addr(1)));
        assert!(!list.is_banned(&addr(2)));
        assert!(list.unban(&addr(1)));
        assert!(!list.is_banned(&addr(1)));
    }

    #[test]
    fn test_expired_ban_not_banned() {
        let mut list = BanList::new();
        list.ban(BanEntry::new(addr(1), 0, "instant".into()));
        assert!(!list.is_banned(&addr(1)));
        list.expire();
        assert!(list.is_empty());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banlist.dat");

        let mut list = BanList::new();
        list.ban(BanEntry::new(addr(7), 3600, "bad".into()));
        list.save(&path).unwrap();

        let loaded = BanList::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.is_banned(&addr(7)));
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let list = BanList::load_or_default(dir.path().join("none.dat")).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_shared_filter() {
        let shared = RwLock::new(BanList::new());
        assert!(!BanFilter::is_banned(&shared, &addr(3)));
        shared
            .write()
            .unwrap()
            .ban(BanEntry::new(addr(3), 60, "x".into()));
        assert!(BanFilter::is_banned(&shared, &addr(3)));
    }
}
