//! Observer traits a node registers on sessions
//!
//! Capability listeners are held through [`CapabilitySubscription`] handles:
//! dropping the handle unregisters the listener, so a session never calls
//! into an observer its owner has discarded.

use super::capabilities::Capabilities;
use super::connection::Connection;
use super::message::NetworkEnvelope;
use super::rule_violation::CloseConnectionReason;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Receives envelopes delivered by a session, in wire order
pub trait MessageListener: Send + Sync {
    fn on_message(&self, envelope: &NetworkEnvelope, connection: &Connection);

    fn on_message_sent(&self, _envelope: &NetworkEnvelope, _connection: &Connection) {}
}

/// Session lifecycle observer, usually the node's connection registry
pub trait ConnectionListener: Send + Sync {
    fn on_connection(&self, connection: &Connection);

    fn on_disconnect(&self, reason: CloseConnectionReason, connection: &Connection);
}

/// Notified when the peer announces a new capability set
pub trait CapabilityListener: Send + Sync {
    fn on_changed(&self, capabilities: &Capabilities);
}

fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Ordered message listener list with identity-based removal
#[derive(Default)]
pub(crate) struct MessageListeners {
    listeners: Mutex<Vec<Arc<dyn MessageListener>>>,
}

impl MessageListeners {
    pub(crate) fn add(&self, listener: Arc<dyn MessageListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn MessageListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    /// Copy taken so callbacks run without the lock held
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn MessageListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[derive(Default)]
pub(crate) struct CapabilityRegistry {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Arc<dyn CapabilityListener>>>,
}

impl CapabilityRegistry {
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        listener: Arc<dyn CapabilityListener>,
    ) -> CapabilitySubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);
        CapabilitySubscription {
            registry: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn CapabilityListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Registration handle; the listener stays registered while this lives
#[must_use = "dropping the subscription unregisters the listener"]
pub struct CapabilitySubscription {
    registry: Weak<CapabilityRegistry>,
    id: u64,
}

impl CapabilitySubscription {
    /// False once the session has torn down its registry
    pub fn is_active(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => {
                let listeners = registry.listeners.lock().unwrap_or_else(|e| e.into_inner());
                listeners.contains_key(&self.id)
            }
            None => false,
        }
    }
}

impl Drop for CapabilitySubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}
