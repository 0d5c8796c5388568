//! Protocol envelopes with bounded collections (defense-in-depth)

use super::capabilities::Capabilities;
use super::serde_safe::{
    BoundedBytes, BoundedString, BoundedVec, MAX_BUNDLE_ENVELOPES, MAX_DATA_SET_ENTRIES,
    MAX_HASH_BYTES, MAX_PAYLOAD_BYTES, MAX_PUB_KEY_BYTES, MAX_REASON_LEN, MAX_SEALED_BYTES,
    MAX_SIGNATURE_BYTES, MAX_UID_LEN,
};
use crate::crypto::{payload_hash, sha3_concat, PAYLOAD_HASH_SIZE};
use crate::types::{Hash, NodeAddress, now};
use serde::{Deserialize, Serialize};

/// Type aliases for bounded collections
pub type PayloadData = BoundedBytes<MAX_PAYLOAD_BYTES>;
pub type SealedData = BoundedBytes<MAX_SEALED_BYTES>;
pub type PubKeyBytes = BoundedBytes<MAX_PUB_KEY_BYTES>;
pub type Signature = BoundedBytes<MAX_SIGNATURE_BYTES>;
pub type PayloadHash = BoundedBytes<MAX_HASH_BYTES>;
pub type CloseReasonName = BoundedString<MAX_REASON_LEN>;
pub type MessageUid = BoundedString<MAX_UID_LEN>;
pub type BundledEnvelopes = BoundedVec<BundledEnvelope, MAX_BUNDLE_ENVELOPES>;
pub type DataSet = BoundedVec<ProtectedStorageEntry, MAX_DATA_SET_ENTRIES>;
pub type PersistableSet = BoundedVec<PersistableNetworkPayload, MAX_DATA_SET_ENTRIES>;

/// Opaque application payload kept in the protected data store.
/// Its content is not interpreted here; only its capability tags are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePayload {
    pub kind: u16,
    pub data: PayloadData,
    pub required_capabilities: Capabilities,
}

impl StoragePayload {
    pub fn new(kind: u16, data: Vec<u8>) -> Option<Self> {
        Some(Self {
            kind,
            data: BoundedBytes::new(data)?,
            required_capabilities: Capabilities::new(),
        })
    }

    pub fn with_required_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    /// Content hash, the key of the sequence number store
    pub fn hash(&self) -> Hash {
        sha3_concat(&self.kind.to_le_bytes(), &self.data)
    }
}

/// Signed, sequence-numbered storage entry gossiped by AddData/RemoveData
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedStorageEntry {
    pub payload: StoragePayload,
    pub owner_pub_key: PubKeyBytes,
    pub sequence_number: u32,
    pub signature: Signature,
    pub creation_time_stamp: u64,
}

impl ProtectedStorageEntry {
    pub fn new(
        payload: StoragePayload,
        owner_pub_key: Vec<u8>,
        sequence_number: u32,
    ) -> Option<Self> {
        Some(Self {
            payload,
            owner_pub_key: BoundedBytes::new(owner_pub_key)?,
            sequence_number,
            signature: BoundedBytes::default(),
            creation_time_stamp: now(),
        })
    }

    pub fn payload_hash(&self) -> Hash {
        self.payload.hash()
    }
}

/// Content-addressed payload (trade statistics, account age witnesses)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistableNetworkPayload {
    pub kind: u16,
    pub data: PayloadData,
    pub hash: PayloadHash,
    pub required_capabilities: Capabilities,
}

impl PersistableNetworkPayload {
    pub fn new(kind: u16, data: Vec<u8>) -> Option<Self> {
        let hash = payload_hash(&data).to_vec();
        Some(Self {
            kind,
            data: BoundedBytes::new(data)?,
            hash: BoundedBytes::new_unchecked(hash),
            required_capabilities: Capabilities::new(),
        })
    }

    pub fn with_required_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    /// Peers may only send hashes of the canonical size
    pub fn verify_hash_size(&self) -> bool {
        self.hash.len() == PAYLOAD_HASH_SIZE
    }
}

/// Envelope addressed to one peer; declares its sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub sender_node_address: NodeAddress,
    pub uid: MessageUid,
    /// Encrypted by the application layer, opaque here
    pub sealed: SealedData,
}

/// Bulk answer to a data request; allowed to exceed the ordinary ceiling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataResponse {
    pub entries: DataSet,
    pub persistable: PersistableSet,
    pub request_nonce: u32,
    pub supported_capabilities: Capabilities,
}

/// Element of a bundle. Bundles cannot contain bundles, which keeps
/// decoding depth bounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundledEnvelope {
    AddData { entry: ProtectedStorageEntry },
    RemoveData { entry: ProtectedStorageEntry },
    AddPersistableNetworkPayload { payload: PersistableNetworkPayload },
    Direct(DirectMessage),
}

impl BundledEnvelope {
    pub fn required_capabilities(&self) -> Option<&Capabilities> {
        match self {
            BundledEnvelope::AddData { entry } | BundledEnvelope::RemoveData { entry } => {
                Some(&entry.payload.required_capabilities)
            }
            BundledEnvelope::AddPersistableNetworkPayload { payload } => {
                Some(&payload.required_capabilities)
            }
            BundledEnvelope::Direct(_) => None,
        }
    }

    pub fn sender_node_address(&self) -> Option<&NodeAddress> {
        match self {
            BundledEnvelope::Direct(msg) => Some(&msg.sender_node_address),
            _ => None,
        }
    }

    pub fn persistable_payload(&self) -> Option<&PersistableNetworkPayload> {
        match self {
            BundledEnvelope::AddPersistableNetworkPayload { payload } => Some(payload),
            _ => None,
        }
    }
}

/// One protocol message unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkEnvelope {
    Close { reason: CloseReasonName },
    Bundle { envelopes: BundledEnvelopes },
    AddData { entry: ProtectedStorageEntry },
    RemoveData { entry: ProtectedStorageEntry },
    AddPersistableNetworkPayload { payload: PersistableNetworkPayload },
    Ping { nonce: u32, last_round_trip_time: u64 },
    Pong { request_nonce: u32 },
    SupportedCapabilities { capabilities: Capabilities },
    Direct(DirectMessage),
    GetDataResponse(GetDataResponse),
}

impl NetworkEnvelope {
    pub fn close(reason: &str) -> Self {
        NetworkEnvelope::Close {
            reason: BoundedString::truncated(reason),
        }
    }

    pub fn bundle(envelopes: Vec<BundledEnvelope>) -> Option<Self> {
        Some(NetworkEnvelope::Bundle {
            envelopes: BoundedVec::new(envelopes)?,
        })
    }

    pub fn command(&self) -> &'static str {
        match self {
            NetworkEnvelope::Close { .. } => "close",
            NetworkEnvelope::Bundle { .. } => "bundle",
            NetworkEnvelope::AddData { .. } => "adddata",
            NetworkEnvelope::RemoveData { .. } => "removedata",
            NetworkEnvelope::AddPersistableNetworkPayload { .. } => "addpersistable",
            NetworkEnvelope::Ping { .. } => "ping",
            NetworkEnvelope::Pong { .. } => "pong",
            NetworkEnvelope::SupportedCapabilities { .. } => "supportedcapabilities",
            NetworkEnvelope::Direct(_) => "direct",
            NetworkEnvelope::GetDataResponse(_) => "getdataresponse",
        }
    }

    /// Capabilities the wrapped payload needs on the receiving side.
    /// None when the envelope does not carry a capability-gated payload.
    pub fn required_capabilities(&self) -> Option<&Capabilities> {
        match self {
            NetworkEnvelope::AddData { entry } | NetworkEnvelope::RemoveData { entry } => {
                Some(&entry.payload.required_capabilities)
            }
            NetworkEnvelope::AddPersistableNetworkPayload { payload } => {
                Some(&payload.required_capabilities)
            }
            _ => None,
        }
    }

    /// Capability announcement carried by this envelope
    pub fn supported_capabilities(&self) -> Option<&Capabilities> {
        match self {
            NetworkEnvelope::SupportedCapabilities { capabilities } => Some(capabilities),
            NetworkEnvelope::GetDataResponse(resp) => Some(&resp.supported_capabilities),
            _ => None,
        }
    }

    pub fn permits_extended_size(&self) -> bool {
        matches!(self, NetworkEnvelope::GetDataResponse(_))
    }

    pub fn is_keep_alive(&self) -> bool {
        matches!(self, NetworkEnvelope::Ping { .. } | NetworkEnvelope::Pong { .. })
    }

    pub fn sender_node_address(&self) -> Option<&NodeAddress> {
        match self {
            NetworkEnvelope::Direct(msg) => Some(&msg.sender_node_address),
            _ => None,
        }
    }

    pub fn persistable_payload(&self) -> Option<&PersistableNetworkPayload> {
        match self {
            NetworkEnvelope::AddPersistableNetworkPayload { payload } => Some(payload),
            _ => None,
        }
    }
}

impl From<BundledEnvelope> for NetworkEnvelope {
    fn from(element: BundledEnvelope) -> Self {
        match element {
            BundledEnvelope::AddData { entry } => NetworkEnvelope::AddData { entry },
            BundledEnvelope::RemoveData { entry } => NetworkEnvelope::RemoveData { entry },
            BundledEnvelope::AddPersistableNetworkPayload { payload } => {
                NetworkEnvelope::AddPersistableNetworkPayload { payload }
            }
            BundledEnvelope::Direct(msg) => NetworkEnvelope::Direct(msg),
        }
    }
}

impl TryFrom<NetworkEnvelope> for BundledEnvelope {
    /// Envelope kinds that cannot travel inside a bundle are handed back
    type Error = NetworkEnvelope;

    fn try_from(envelope: NetworkEnvelope) -> Result<Self, Self::Error> {
        match envelope {
            NetworkEnvelope::AddData { entry } => Ok(BundledEnvelope::AddData { entry }),
            NetworkEnvelope::RemoveData { entry } => Ok(BundledEnvelope::RemoveData { entry }),
            NetworkEnvelope::AddPersistableNetworkPayload { payload } => {
                Ok(BundledEnvelope::AddPersistableNetworkPayload { payload })
            }
            NetworkEnvelope::Direct(msg) => Ok(BundledEnvelope::Direct(msg)),
            other => Err(other),
        }
    }
}

/// What actually goes on the wire: the envelope tagged with the sender's
/// message version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub message_version: u32,
    pub envelope: NetworkEnvelope,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::capabilities::Capability;

    fn entry(caps: Capabilities) -> ProtectedStorageEntry {
        let payload = StoragePayload::new(1, b"offer".to_vec())
            .unwrap()
            .with_required_capabilities(caps);
        ProtectedStorageEntry::new(payload, vec![1, 2, 3], 1).unwrap()
    }

    #[test]
    fn test_required_capabilities_unwraps_one_level() {
        let caps = Capabilities::from_iter([Capability::Mediation]);
        let add = NetworkEnvelope::AddData { entry: entry(caps.clone()) };
        assert_eq!(add.required_capabilities(), Some(&caps));

        let remove = NetworkEnvelope::RemoveData { entry: entry(caps.clone()) };
        assert_eq!(remove.required_capabilities(), Some(&caps));

        let payload = PersistableNetworkPayload::new(2, b"stats".to_vec())
            .unwrap()
            .with_required_capabilities(caps.clone());
        let persist = NetworkEnvelope::AddPersistableNetworkPayload { payload };
        assert_eq!(persist.required_capabilities(), Some(&caps));

        assert_eq!(NetworkEnvelope::close("APP_SHUT_DOWN").required_capabilities(), None);
    }

    #[test]
    fn test_envelope_flags() {
        let ping = NetworkEnvelope::Ping { nonce: 1, last_round_trip_time: 0 };
        assert!(ping.is_keep_alive());
        assert!(!ping.permits_extended_size());

        let resp = NetworkEnvelope::GetDataResponse(GetDataResponse {
            entries: BoundedVec::default(),
            persistable: BoundedVec::default(),
            request_nonce: 7,
            supported_capabilities: Capabilities::all(),
        });
        assert!(resp.permits_extended_size());
        assert_eq!(resp.supported_capabilities(), Some(&Capabilities::all()));
    }

    #[test]
    fn test_persistable_hash_size() {
        let payload = PersistableNetworkPayload::new(2, b"stats".to_vec()).unwrap();
        assert!(payload.verify_hash_size());

        let mut bad = payload.clone();
        bad.hash = BoundedBytes::new(vec![0u8; 32]).unwrap();
        assert!(!bad.verify_hash_size());
    }

    #[test]
    fn test_bundle_conversion() {
        let env = NetworkEnvelope::AddData { entry: entry(Capabilities::new()) };
        let element = BundledEnvelope::try_from(env.clone()).unwrap();
        assert_eq!(NetworkEnvelope::from(element), env);

        let close = NetworkEnvelope::close("x");
        assert_eq!(BundledEnvelope::try_from(close.clone()), Err(close));
    }

    #[test]
    fn test_close_reason_truncated() {
        let long = "X".repeat(MAX_REASON_LEN + 10);
        match NetworkEnvelope::close(&long) {
            NetworkEnvelope::Close { reason } => assert_eq!(reason.len(), MAX_REASON_LEN),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_storage_payload_hash_depends_on_kind() {
        let a = StoragePayload::new(1, b"x".to_vec()).unwrap();
        let b = StoragePayload::new(2, b"x".to_vec()).unwrap();
        assert_ne!(a.hash(), b.hash());
    }
}
