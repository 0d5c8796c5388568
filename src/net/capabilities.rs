//! Peer capability tags and capability sets
//!
//! A peer announces the features it supports as a set of small integer tags.
//! Tags this node does not know are dropped on decode, so newer peers can add
//! capabilities without breaking older ones.

use super::serde_safe::{BoundedVec, MAX_CAPABILITY_TAGS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Feature tag. Discriminants are the wire values and must never be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Capability {
    SeedNode = 0,
    TradeStatistics3 = 1,
    AccountAgeWitness = 2,
    SignedAccountAgeWitness = 3,
    AckMsg = 4,
    BundleOfEnvelopes = 5,
    Mediation = 6,
    RefundAgent = 7,
    NoAddressPrefix = 8,
    TradeStatisticsHashUpdate = 9,
    Arbitration = 10,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::SeedNode,
        Capability::TradeStatistics3,
        Capability::AccountAgeWitness,
        Capability::SignedAccountAgeWitness,
        Capability::AckMsg,
        Capability::BundleOfEnvelopes,
        Capability::Mediation,
        Capability::RefundAgent,
        Capability::NoAddressPrefix,
        Capability::TradeStatisticsHashUpdate,
        Capability::Arbitration,
    ];

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.tag() == tag)
    }

    pub fn name(self) -> &'static str {
        match self {
            Capability::SeedNode => "SEED_NODE",
            Capability::TradeStatistics3 => "TRADE_STATISTICS_3",
            Capability::AccountAgeWitness => "ACCOUNT_AGE_WITNESS",
            Capability::SignedAccountAgeWitness => "SIGNED_ACCOUNT_AGE_WITNESS",
            Capability::AckMsg => "ACK_MSG",
            Capability::BundleOfEnvelopes => "BUNDLE_OF_ENVELOPES",
            Capability::Mediation => "MEDIATION",
            Capability::RefundAgent => "REFUND_AGENT",
            Capability::NoAddressPrefix => "NO_ADDRESS_PRE_FIX",
            Capability::TradeStatisticsHashUpdate => "TRADE_STATISTICS_HASH_UPDATE",
            Capability::Arbitration => "ARBITRATION",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Wire form of a capability set
pub type CapabilityTags = BoundedVec<u32, MAX_CAPABILITY_TAGS>;

/// Ordered set of capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "CapabilityTags", into = "CapabilityTags")]
pub struct Capabilities {
    set: BTreeSet<Capability>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities every peer must announce to stay connected
    pub fn mandatory() -> Self {
        Self::from_iter([Capability::AckMsg])
    }

    /// Everything this build supports
    pub fn all() -> Self {
        Self::from_iter(Capability::ALL)
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.set.contains(&capability)
    }

    /// True if every capability in `required` is present
    pub fn contains_all(&self, required: &Capabilities) -> bool {
        required.set.is_subset(&self.set)
    }

    pub fn add(&mut self, capability: Capability) {
        self.set.insert(capability);
    }

    /// Merge another set into this one
    pub fn add_all(&mut self, other: &Capabilities) {
        self.set.extend(other.set.iter().copied());
    }

    /// Replace the whole set
    pub fn set(&mut self, other: &Capabilities) {
        self.set = other.set.clone();
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.set.iter().copied()
    }

    /// Capabilities in `required` missing from this set
    pub fn missing(&self, required: &Capabilities) -> Capabilities {
        Self {
            set: required.set.difference(&self.set).copied().collect(),
        }
    }

    pub fn to_tags(&self) -> Vec<u32> {
        self.set.iter().map(|c| c.tag()).collect()
    }

    /// Unknown tags are dropped
    pub fn from_tags(tags: &[u32]) -> Self {
        Self {
            set: tags.iter().filter_map(|t| Capability::from_tag(*t)).collect(),
        }
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            set: iter.into_iter().collect(),
        }
    }
}

impl From<CapabilityTags> for Capabilities {
    fn from(tags: CapabilityTags) -> Self {
        Self::from_tags(&tags)
    }
}

impl From<Capabilities> for CapabilityTags {
    fn from(caps: Capabilities) -> Self {
        // Known capabilities are far fewer than MAX_CAPABILITY_TAGS
        BoundedVec::new_unchecked(caps.to_tags())
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.set.iter().map(|c| c.name()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_all() {
        let peer = Capabilities::from_iter([
            Capability::AckMsg,
            Capability::BundleOfEnvelopes,
            Capability::Mediation,
        ]);
        let required = Capabilities::from_iter([Capability::AckMsg, Capability::Mediation]);
        assert!(peer.contains_all(&required));
        assert!(peer.contains_all(&Capabilities::new()));

        let required = Capabilities::from_iter([Capability::RefundAgent]);
        assert!(!peer.contains_all(&required));
        assert_eq!(peer.missing(&required), required);
    }

    #[test]
    fn test_add_all_and_set() {
        let mut caps = Capabilities::from_iter([Capability::SeedNode]);
        caps.add_all(&Capabilities::from_iter([Capability::AckMsg]));
        assert_eq!(caps.len(), 2);

        caps.set(&Capabilities::from_iter([Capability::Mediation]));
        assert_eq!(caps.len(), 1);
        assert!(caps.contains(Capability::Mediation));
        assert!(!caps.contains(Capability::SeedNode));
    }

    #[test]
    fn test_tags_are_ordered() {
        let caps = Capabilities::from_iter([Capability::Arbitration, Capability::SeedNode]);
        assert_eq!(caps.to_tags(), vec![0, 10]);
    }

    #[test]
    fn test_unknown_tags_dropped_on_decode() {
        let wire = postcard::to_allocvec(&vec![4u32, 999, 5]).unwrap();
        let caps: Capabilities = postcard::from_bytes(&wire).unwrap();
        assert_eq!(
            caps,
            Capabilities::from_iter([Capability::AckMsg, Capability::BundleOfEnvelopes])
        );
    }

    #[test]
    fn test_too_many_tags_rejected() {
        let tags: Vec<u32> = (0..(MAX_CAPABILITY_TAGS as u32 + 1)).collect();
        let wire = postcard::to_allocvec(&tags).unwrap();
        assert!(postcard::from_bytes::<Capabilities>(&wire).is_err());
    }

    #[test]
    fn test_display() {
        let caps = Capabilities::from_iter([Capability::AckMsg, Capability::SeedNode]);
        assert_eq!(caps.to_string(), "[SEED_NODE, ACK_MSG]");
    }
}
