//! Cache of CASE resumption records.
//!
//! Both sides keep one record per peer. The responder looks records up by
//! resumption id, the initiator by fabric and peer node id.

use crate::messages::RESUMPTION_ID_LEN;
use crate::params::SessionParameters;
use dashmap::DashMap;
use pairing_crypto::GROUP_SIZE;
use pairing_fabric::{FabricIndex, NodeId};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// State needed to resume a CASE session
#[derive(Clone)]
pub struct ResumptionRecord {
    /// Id the peer presents to resume
    pub resumption_id: [u8; RESUMPTION_ID_LEN],
    /// ECDH shared secret of the original session
    pub shared_secret: Zeroizing<[u8; GROUP_SIZE]>,
    /// Fabric of the original session
    pub fabric_index: FabricIndex,
    /// Peer node id
    pub peer_node_id: NodeId,
    /// Peer timing hints
    pub peer_params: SessionParameters,
}

impl fmt::Debug for ResumptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumptionRecord")
            .field("fabric_index", &self.fabric_index)
            .field("peer_node_id", &self.peer_node_id)
            .finish_non_exhaustive()
    }
}

/// Concurrent resumption record store
#[derive(Clone, Default)]
pub struct ResumptionStore {
    by_id: Arc<DashMap<[u8; RESUMPTION_ID_LEN], ResumptionRecord>>,
    by_peer: Arc<DashMap<(FabricIndex, NodeId), [u8; RESUMPTION_ID_LEN]>>,
}

impl ResumptionStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a record, replacing any earlier record for the same peer
    pub fn insert(&self, record: ResumptionRecord) {
        let peer = (record.fabric_index, record.peer_node_id);
        if let Some(previous) = self.by_peer.insert(peer, record.resumption_id) {
            if previous != record.resumption_id {
                self.by_id.remove(&previous);
            }
        }
        debug!(
            "Stored resumption record for node {} on fabric {}",
            record.peer_node_id, record.fabric_index
        );
        self.by_id.insert(record.resumption_id, record);
    }

    /// Record presented by an initiator
    pub fn get_by_id(&self, resumption_id: &[u8]) -> Option<ResumptionRecord> {
        let id: [u8; RESUMPTION_ID_LEN] = resumption_id.try_into().ok()?;
        self.by_id.get(&id).map(|r| r.clone())
    }

    /// Record for dialling `peer_node_id` on `fabric_index`
    pub fn get_by_peer(
        &self,
        fabric_index: FabricIndex,
        peer_node_id: NodeId,
    ) -> Option<ResumptionRecord> {
        let id = *self.by_peer.get(&(fabric_index, peer_node_id))?;
        self.get_by_id(&id)
    }

    /// Forget one record
    pub fn remove(&self, resumption_id: &[u8; RESUMPTION_ID_LEN]) -> Option<ResumptionRecord> {
        let (_, record) = self.by_id.remove(resumption_id)?;
        self.by_peer
            .remove_if(&(record.fabric_index, record.peer_node_id), |_, id| {
                id == resumption_id
            });
        Some(record)
    }

    /// Forget every record of a fabric, returning how many were dropped
    pub fn remove_fabric(&self, fabric_index: FabricIndex) -> usize {
        let ids: Vec<[u8; RESUMPTION_ID_LEN]> = self
            .by_id
            .iter()
            .filter(|r| r.fabric_index == fabric_index)
            .map(|r| *r.key())
            .collect();
        for id in &ids {
            self.remove(id);
        }
        ids.len()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u8, fabric: u8, node: u64) -> ResumptionRecord {
        ResumptionRecord {
            resumption_id: [id; RESUMPTION_ID_LEN],
            shared_secret: Zeroizing::new([id; GROUP_SIZE]),
            fabric_index: FabricIndex::new(fabric).unwrap(),
            peer_node_id: NodeId(node),
            peer_params: SessionParameters::default(),
        }
    }

    #[test]
    fn test_lookup_both_ways() {
        let store = ResumptionStore::new();
        store.insert(record(1, 1, 100));
        assert_eq!(store.get_by_id(&[1; 16]).unwrap().peer_node_id, NodeId(100));
        let by_peer = store
            .get_by_peer(FabricIndex::new(1).unwrap(), NodeId(100))
            .unwrap();
        assert_eq!(by_peer.resumption_id, [1; 16]);
        assert!(store.get_by_id(&[1; 3]).is_none());
    }

    #[test]
    fn test_new_record_replaces_old_for_same_peer() {
        let store = ResumptionStore::new();
        store.insert(record(1, 1, 100));
        store.insert(record(2, 1, 100));
        assert_eq!(store.len(), 1);
        assert!(store.get_by_id(&[1; 16]).is_none());
        assert!(store.get_by_id(&[2; 16]).is_some());
    }

    #[test]
    fn test_remove_fabric() {
        let store = ResumptionStore::new();
        store.insert(record(1, 1, 100));
        store.insert(record(2, 1, 101));
        store.insert(record(3, 2, 100));
        assert_eq!(store.remove_fabric(FabricIndex::new(1).unwrap()), 2);
        assert_eq!(store.len(), 1);
        assert!(store
            .get_by_peer(FabricIndex::new(1).unwrap(), NodeId(100))
            .is_none());
        assert!(store
            .get_by_peer(FabricIndex::new(2).unwrap(), NodeId(100))
            .is_some());
    }
}
