//! Fabric table with index allocation and persistence.
//!
//! Index allocation uses a counter that only moves forward on a successful
//! add. Once it passes 254 the table is scanned for holes; indices freed by
//! [`FabricManager::revoke_fabric`] are handed out only after every other
//! free index, so a revoked index is not immediately reused.

use crate::{Fabric, FabricError, FabricIndex, FabricRecord, NodeId, MAX_LABEL_LEN};
use pairing_storage::StorageContext;
use serde_json::Value;
use std::collections::BTreeSet;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Storage key holding the fabric list
pub const FABRICS_KEY: &str = "fabrics";

/// Storage key holding the allocator counter
pub const NEXT_INDEX_KEY: &str = "nextFabricIndex";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Fabric table change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricEvent {
    /// A fabric was added
    Added(FabricIndex),
    /// Credentials, label or scoped data changed
    Updated(FabricIndex),
    /// A fabric was removed
    Removed(FabricIndex),
    /// A fabric was revoked
    Revoked(FabricIndex),
}

struct FabricTable {
    fabrics: Vec<Fabric>,
    /// May reach 255 after index 254 is taken
    next_index: u16,
    quarantined: BTreeSet<FabricIndex>,
}

impl FabricTable {
    fn position(&self, index: FabricIndex) -> Option<usize> {
        self.fabrics.iter().position(|f| f.index() == index)
    }

    fn is_free(&self, index: u8) -> bool {
        !self.fabrics.iter().any(|f| f.index().get() == index)
    }

    fn allocate(&self) -> Result<FabricIndex, FabricError> {
        if let Ok(candidate) = u8::try_from(self.next_index) {
            if candidate <= FabricIndex::MAX && self.is_free(candidate) {
                return FabricIndex::new(candidate);
            }
        }

        let free = || (FabricIndex::MIN..=FabricIndex::MAX).filter(|i| self.is_free(*i));
        let candidate = free()
            .find(|i| !self.quarantined.iter().any(|q| q.get() == *i))
            .or_else(|| free().next())
            .ok_or(FabricError::TableFull)?;
        FabricIndex::new(candidate)
    }

    fn records(&self) -> Vec<FabricRecord> {
        self.fabrics.iter().map(Fabric::to_record).collect()
    }
}

/// Owner of the node's fabrics
pub struct FabricManager {
    storage: StorageContext,
    table: RwLock<FabricTable>,
    events: broadcast::Sender<FabricEvent>,
}

impl FabricManager {
    /// Empty table backed by `storage`; call [`init_from_storage`](Self::init_from_storage) to load
    pub fn new(storage: StorageContext) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            storage,
            table: RwLock::new(FabricTable {
                fabrics: Vec::new(),
                next_index: FabricIndex::MIN as u16,
                quarantined: BTreeSet::new(),
            }),
            events,
        }
    }

    /// Load fabrics and allocator state, returning the number of fabrics.
    /// Backend failures are errors; missing or undecodable data starts empty.
    pub async fn init_from_storage(&self) -> Result<usize, FabricError> {
        let stored: Option<Value> = self.storage.get(FABRICS_KEY).await?;
        let next_index = match self.storage.get::<Value>(NEXT_INDEX_KEY).await? {
            Some(value) => serde_json::from_value::<u16>(value).ok(),
            None => None,
        };

        let fabrics = match stored.map(decode_fabrics).transpose() {
            Ok(fabrics) => fabrics.unwrap_or_default(),
            Err(e) => {
                warn!("Discarding undecodable fabric table: {}", e);
                Vec::new()
            }
        };

        // A counter behind the held indices would send the allocator into
        // the wraparound scan and reuse a freed index early
        let floor = fabrics
            .iter()
            .map(|f| f.index().get() as u16 + 1)
            .max()
            .unwrap_or(FabricIndex::MIN as u16);
        let next_index = next_index.unwrap_or(FabricIndex::MIN as u16).max(floor);

        let mut table = self.table.write().await;
        table.fabrics = fabrics;
        table.next_index = next_index;
        table.quarantined.clear();

        info!(
            "Loaded {} fabrics from storage (next index {})",
            table.fabrics.len(),
            table.next_index
        );
        Ok(table.fabrics.len())
    }

    /// Index the next added fabric should use
    pub async fn next_fabric_index(&self) -> Result<FabricIndex, FabricError> {
        self.table.read().await.allocate()
    }

    /// Add a fabric in memory. Call [`persist_fabrics`](Self::persist_fabrics) to store it.
    pub async fn add_fabric(&self, fabric: Fabric) -> Result<(), FabricError> {
        let mut table = self.table.write().await;
        let index = fabric.index();

        if table.position(index).is_some() {
            return Err(FabricError::DuplicateIndex(index));
        }
        if let Some(existing) = table.fabrics.iter().find(|f| f.same_trust_domain(&fabric)) {
            return Err(FabricError::Conflict {
                fabric_id: fabric.fabric_id().0,
                existing: existing.index(),
            });
        }

        info!(
            "Adding fabric {} (fabric id {}, node id {})",
            index,
            fabric.fabric_id(),
            fabric.node_id()
        );
        table.fabrics.push(fabric);
        table.quarantined.remove(&index);
        table.next_index = index.get() as u16 + 1;
        drop(table);

        self.notify(FabricEvent::Added(index));
        Ok(())
    }

    /// Remove a fabric and persist the table
    pub async fn remove_fabric(&self, index: FabricIndex) -> Result<Fabric, FabricError> {
        let fabric = self.take_fabric(index, false).await?;
        info!("Removed fabric {}", index);
        self.notify(FabricEvent::Removed(index));
        Ok(fabric)
    }

    /// Remove a fabric, quarantine its index and persist the table
    pub async fn revoke_fabric(&self, index: FabricIndex) -> Result<Fabric, FabricError> {
        let fabric = self.take_fabric(index, true).await?;
        info!("Revoked fabric {}", index);
        self.notify(FabricEvent::Revoked(index));
        Ok(fabric)
    }

    async fn take_fabric(&self, index: FabricIndex, quarantine: bool) -> Result<Fabric, FabricError> {
        let mut table = self.table.write().await;
        let position = table.position(index).ok_or(FabricError::NotFound(index))?;
        let fabric = table.fabrics.remove(position);
        let newly_quarantined = quarantine && table.quarantined.insert(index);

        if let Err(e) = self.store(&table).await {
            warn!("Failed to persist removal of fabric {}: {}", index, e);
            table.fabrics.insert(position, fabric);
            if newly_quarantined {
                table.quarantined.remove(&index);
            }
            return Err(e);
        }
        Ok(fabric)
    }

    /// Write the whole fabric list and allocator state
    pub async fn persist_fabrics(&self) -> Result<(), FabricError> {
        let table = self.table.read().await;
        self.store(&table).await
    }

    /// The fabric list is written last and is the commit point. A counter
    /// written ahead of a failed list write only skips indices.
    async fn store(&self, table: &FabricTable) -> Result<(), FabricError> {
        self.storage.set(NEXT_INDEX_KEY, &table.next_index).await?;
        self.storage.set(FABRICS_KEY, &table.records()).await?;
        debug!("Persisted {} fabrics", table.fabrics.len());
        Ok(())
    }

    /// All fabrics in insertion order
    pub async fn fabrics(&self) -> Vec<Fabric> {
        self.table.read().await.fabrics.clone()
    }

    /// Fabric at `index`
    pub async fn fabric(&self, index: FabricIndex) -> Option<Fabric> {
        let table = self.table.read().await;
        table.position(index).map(|p| table.fabrics[p].clone())
    }

    /// Fabric addressed by a CASE destination id
    pub async fn find_by_destination_id(
        &self,
        destination_id: &[u8],
        initiator_random: &[u8],
    ) -> Option<Fabric> {
        self.table
            .read()
            .await
            .fabrics
            .iter()
            .find(|f| f.matches_destination_id(destination_id, initiator_random))
            .cloned()
    }

    /// Fabric with the given root key and fabric id
    pub async fn find_by_root(&self, root_public_key: &[u8], fabric_id: u64) -> Option<Fabric> {
        self.table
            .read()
            .await
            .fabrics
            .iter()
            .find(|f| f.fabric_id().0 == fabric_id && f.root_public_key()[..] == *root_public_key)
            .cloned()
    }

    /// Change a fabric's label. Non-empty labels are unique across the table.
    pub async fn update_label(&self, index: FabricIndex, label: &str) -> Result<(), FabricError> {
        if label.chars().count() > MAX_LABEL_LEN {
            return Err(FabricError::InvalidLabel(MAX_LABEL_LEN));
        }

        let mut table = self.table.write().await;
        if !label.is_empty()
            && table
                .fabrics
                .iter()
                .any(|f| f.index() != index && f.label() == label)
        {
            return Err(FabricError::LabelConflict(label.to_string()));
        }
        let position = table.position(index).ok_or(FabricError::Unknown(index))?;

        let previous = table.fabrics[position].label().to_string();
        table.fabrics[position].set_label(label.to_string());
        if let Err(e) = self.store(&table).await {
            table.fabrics[position].set_label(previous);
            return Err(e);
        }
        drop(table);

        debug!("Fabric {} label set to {:?}", index, label);
        self.notify(FabricEvent::Updated(index));
        Ok(())
    }

    /// Replace a fabric's credentials (UpdateNOC), keeping label and scoped data
    pub async fn update_fabric(&self, fabric: Fabric) -> Result<(), FabricError> {
        let index = fabric.index();
        let mut table = self.table.write().await;
        let position = table.position(index).ok_or(FabricError::Unknown(index))?;
        if let Some(other) = table
            .fabrics
            .iter()
            .find(|f| f.index() != index && f.same_trust_domain(&fabric))
        {
            return Err(FabricError::Conflict {
                fabric_id: fabric.fabric_id().0,
                existing: other.index(),
            });
        }

        let mut fabric = fabric;
        let current = &table.fabrics[position];
        fabric.set_label(current.label().to_string());
        fabric.copy_scoped_data_from(current);

        let previous = std::mem::replace(&mut table.fabrics[position], fabric);
        if let Err(e) = self.store(&table).await {
            table.fabrics[position] = previous;
            return Err(e);
        }
        drop(table);

        info!("Updated credentials of fabric {}", index);
        self.notify(FabricEvent::Updated(index));
        Ok(())
    }

    /// Store (or with `None`, delete) fabric-scoped data
    pub async fn set_scoped_data(
        &self,
        index: FabricIndex,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), FabricError> {
        let mut table = self.table.write().await;
        let position = table.position(index).ok_or(FabricError::Unknown(index))?;

        let previous = table.fabrics[position].scoped_data(key).cloned();
        table.fabrics[position].set_scoped_data(key.to_string(), value);
        if let Err(e) = self.store(&table).await {
            table.fabrics[position].set_scoped_data(key.to_string(), previous);
            return Err(e);
        }
        drop(table);

        self.notify(FabricEvent::Updated(index));
        Ok(())
    }

    /// Fabric-scoped data stored under `key`
    pub async fn scoped_data(&self, index: FabricIndex, key: &str) -> Option<Value> {
        let table = self.table.read().await;
        table
            .position(index)
            .and_then(|p| table.fabrics[p].scoped_data(key).cloned())
    }

    /// Whether `node_id` is this node's id in the fabric at `index`
    pub async fn is_local_node(&self, index: FabricIndex, node_id: NodeId) -> bool {
        self.fabric(index)
            .await
            .is_some_and(|f| f.node_id() == node_id)
    }

    /// Receive table change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: FabricEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}


fn decode_fabrics(value: Value) -> Result<Vec<Fabric>, FabricError> {
    let records: Vec<FabricRecord> =
        serde_json::from_value(value).map_err(|e| FabricError::Corrupt(e.to_string()))?;
    let mut fabrics: Vec<Fabric> = Vec::with_capacity(records.len());
    for record in &records {
        let fabric = Fabric::from_record(record)?;
        if fabrics.iter().any(|f| f.index() == fabric.index()) {
            return Err(FabricError::Corrupt(format!(
                "duplicate fabric index {}",
                fabric.index()
            )));
        }
        fabrics.push(fabric);
    }
    Ok(fabrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::CertificateAuthority;
    use crate::fabric::tests::EPOCH_KEY;
    use crate::{FabricBuilder, VendorId};
    use pairing_crypto::KeyPair;
    use pairing_storage::{MemoryBackend, StorageBackend, StorageManager};
    use std::sync::Arc;

    struct Harness {
        ca: CertificateAuthority,
        key: KeyPair,
        backend: Arc<MemoryBackend>,
        manager: FabricManager,
    }

    impl Harness {
        fn new() -> Self {
            let backend = Arc::new(MemoryBackend::new());
            let storage = StorageManager::new(backend.clone());
            let manager = FabricManager::new(storage.create_context("fabrics").unwrap());
            Self {
                ca: CertificateAuthority::new_root(1, None),
                key: KeyPair::generate(),
                backend,
                manager,
            }
        }

        /// Fabric id doubles as node id so every fabric is distinct
        fn fabric(&self, index: u8) -> Fabric {
            let fabric_id = 0x1000 + index as u64;
            let noc = self
                .ca
                .issue_node(self.key.public_key(), fabric_id, fabric_id)
                .unwrap();
            FabricBuilder::new(self.key.clone())
                .index(FabricIndex::new(index).unwrap())
                .root_vendor_id(VendorId(0xFFF1))
                .identity_protection_key(EPOCH_KEY)
                .root_certificate(self.ca.certificate().clone())
                .operational_certificate(noc)
                .build()
                .unwrap()
        }

        async fn add(&self, index: u8) {
            self.manager.add_fabric(self.fabric(index)).await.unwrap();
        }

        async fn fill(&self) {
            for index in FabricIndex::MIN..=FabricIndex::MAX {
                self.add(index).await;
            }
        }

        async fn stored_fabrics(&self) -> Option<serde_json::Value> {
            self.backend
                .get(&["fabrics".to_string()], FABRICS_KEY)
                .await
                .unwrap()
        }
    }

    fn idx(i: u8) -> FabricIndex {
        FabricIndex::new(i).unwrap()
    }

    #[tokio::test]
    async fn test_first_index_is_one() {
        let h = Harness::new();
        assert_eq!(h.manager.next_fabric_index().await.unwrap(), idx(1));
    }

    #[tokio::test]
    async fn test_add_does_not_persist_until_requested() {
        let h = Harness::new();
        h.add(1).await;
        assert!(h.stored_fabrics().await.is_none());

        h.manager.persist_fabrics().await.unwrap();
        let stored = h.stored_fabrics().await.unwrap();
        let expected = serde_json::to_value(vec![h.manager.fabric(idx(1)).await.unwrap().to_record()])
            .unwrap();
        assert_eq!(stored, expected);
    }

    #[tokio::test]
    async fn test_duplicate_index_rejected() {
        let h = Harness::new();
        h.add(1).await;
        let err = h.manager.add_fabric(h.fabric(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "Fabric with index 1 already exists.");
    }

    #[tokio::test]
    async fn test_same_trust_domain_rejected() {
        let h = Harness::new();
        h.add(1).await;
        let same_domain = FabricBuilder::new(h.key.clone())
            .index(idx(2))
            .identity_protection_key(EPOCH_KEY)
            .root_certificate(h.ca.certificate().clone())
            .operational_certificate(h.fabric(1).operational_certificate().clone())
            .build()
            .unwrap();
        assert!(matches!(
            h.manager.add_fabric(same_domain).await,
            Err(FabricError::Conflict { existing, .. }) if existing == idx(1)
        ));
    }

    #[tokio::test]
    async fn test_remove_missing_fabric() {
        let h = Harness::new();
        let err = h.manager.remove_fabric(idx(1)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Fabric with index 1 cannot be removed because it does not exist."
        );
        assert!(matches!(
            h.manager.revoke_fabric(idx(1)).await,
            Err(FabricError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_does_not_reuse_index_before_wrap() {
        let h = Harness::new();
        h.add(1).await;
        h.manager.remove_fabric(idx(1)).await.unwrap();
        assert_eq!(h.manager.next_fabric_index().await.unwrap(), idx(2));
        assert_eq!(h.stored_fabrics().await, Some(serde_json::json!([])));
    }

    #[tokio::test]
    async fn test_revoke_does_not_reuse_index_before_wrap() {
        let h = Harness::new();
        h.add(1).await;
        h.manager.revoke_fabric(idx(1)).await.unwrap();
        assert_eq!(h.manager.next_fabric_index().await.unwrap(), idx(2));

        let h = Harness::new();
        h.add(1).await;
        h.add(2).await;
        h.manager.revoke_fabric(idx(1)).await.unwrap();
        assert_eq!(h.manager.next_fabric_index().await.unwrap(), idx(3));
    }

    #[tokio::test]
    async fn test_full_table() {
        let h = Harness::new();
        h.fill().await;
        let err = h.manager.next_fabric_index().await.unwrap_err();
        assert_eq!(err.to_string(), "No free fabric index available.");
    }

    #[tokio::test]
    async fn test_wraparound_reuses_lowest_free_index() {
        let h = Harness::new();
        h.fill().await;
        h.manager.remove_fabric(idx(100)).await.unwrap();
        assert_eq!(h.manager.next_fabric_index().await.unwrap(), idx(100));
        h.manager.remove_fabric(idx(1)).await.unwrap();
        assert_eq!(h.manager.next_fabric_index().await.unwrap(), idx(1));
    }

    #[tokio::test]
    async fn test_wraparound_prefers_non_revoked_indices() {
        let h = Harness::new();
        h.fill().await;
        h.manager.revoke_fabric(idx(1)).await.unwrap();
        assert_eq!(h.manager.next_fabric_index().await.unwrap(), idx(1));

        h.manager.remove_fabric(idx(100)).await.unwrap();
        assert_eq!(h.manager.next_fabric_index().await.unwrap(), idx(100));

        h.add(100).await;
        assert_eq!(h.manager.next_fabric_index().await.unwrap(), idx(1));
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let h = Harness::new();
        h.add(1).await;
        h.add(2).await;
        h.manager.update_label(idx(2), "office").await.unwrap();
        h.manager.remove_fabric(idx(1)).await.unwrap();

        let storage = StorageManager::new(h.backend.clone());
        let restored = FabricManager::new(storage.create_context("fabrics").unwrap());
        assert_eq!(restored.init_from_storage().await.unwrap(), 1);
        let fabrics = restored.fabrics().await;
        assert_eq!(fabrics[0].index(), idx(2));
        assert_eq!(fabrics[0].label(), "office");
        assert_eq!(restored.next_fabric_index().await.unwrap(), idx(3));
    }

    #[tokio::test]
    async fn test_empty_storage_initializes_empty() {
        let h = Harness::new();
        assert_eq!(h.manager.init_from_storage().await.unwrap(), 0);
        assert_eq!(h.manager.next_fabric_index().await.unwrap(), idx(1));
    }

    #[tokio::test]
    async fn test_corrupt_records_start_empty() {
        let h = Harness::new();
        h.backend
            .set(
                &["fabrics".to_string()],
                FABRICS_KEY,
                serde_json::json!([{"fabricIndex": 0}]),
            )
            .await
            .unwrap();
        h.backend
            .set(&["fabrics".to_string()], NEXT_INDEX_KEY, serde_json::json!("x"))
            .await
            .unwrap();
        assert_eq!(h.manager.init_from_storage().await.unwrap(), 0);
        assert_eq!(h.manager.next_fabric_index().await.unwrap(), idx(1));
    }

    #[tokio::test]
    async fn test_labels() {
        let h = Harness::new();
        h.add(1).await;
        h.add(2).await;

        h.manager.update_label(idx(1), "home").await.unwrap();
        assert!(matches!(
            h.manager.update_label(idx(2), "home").await,
            Err(FabricError::LabelConflict(_))
        ));
        assert!(matches!(
            h.manager.update_label(idx(2), &"x".repeat(33)).await,
            Err(FabricError::InvalidLabel(32))
        ));
        h.manager.update_label(idx(1), "").await.unwrap();
        h.manager.update_label(idx(2), "").await.unwrap();
        assert!(matches!(
            h.manager.update_label(idx(3), "away").await,
            Err(FabricError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn test_update_fabric_keeps_label_and_scoped_data() {
        let h = Harness::new();
        h.add(1).await;
        h.manager.update_label(idx(1), "home").await.unwrap();
        h.manager
            .set_scoped_data(idx(1), "acl", Some(serde_json::json!({"admin": true})))
            .await
            .unwrap();

        let replacement = h.fabric(1);
        let new_cert = replacement.operational_certificate().clone();
        h.manager.update_fabric(replacement).await.unwrap();

        let fabric = h.manager.fabric(idx(1)).await.unwrap();
        assert_eq!(fabric.operational_certificate(), &new_cert);
        assert_eq!(fabric.label(), "home");
        assert_eq!(
            h.manager.scoped_data(idx(1), "acl").await,
            Some(serde_json::json!({"admin": true}))
        );

        assert!(matches!(
            h.manager.update_fabric(h.fabric(2)).await,
            Err(FabricError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn test_scoped_data_delete() {
        let h = Harness::new();
        h.add(1).await;
        h.manager
            .set_scoped_data(idx(1), "k", Some(serde_json::json!(1)))
            .await
            .unwrap();
        h.manager.set_scoped_data(idx(1), "k", None).await.unwrap();
        assert_eq!(h.manager.scoped_data(idx(1), "k").await, None);
    }

    #[tokio::test]
    async fn test_find_by_destination_id_and_root() {
        let h = Harness::new();
        h.add(1).await;
        h.add(2).await;
        let target = h.manager.fabric(idx(2)).await.unwrap();
        let random = [3u8; 32];
        let dest = target.destination_id(&random, target.node_id()).unwrap();

        let found = h.manager.find_by_destination_id(&dest, &random).await.unwrap();
        assert_eq!(found.index(), idx(2));
        assert!(h.manager.find_by_destination_id(&[0u8; 32], &random).await.is_none());

        let by_root = h
            .manager
            .find_by_root(target.root_public_key(), target.fabric_id().0)
            .await
            .unwrap();
        assert_eq!(by_root.index(), idx(2));
        assert!(h.manager.is_local_node(idx(2), target.node_id()).await);
    }

    #[tokio::test]
    async fn test_events() {
        let h = Harness::new();
        let mut events = h.manager.subscribe();
        h.add(1).await;
        h.manager.update_label(idx(1), "a").await.unwrap();
        h.manager.revoke_fabric(idx(1)).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), FabricEvent::Added(idx(1)));
        assert_eq!(events.recv().await.unwrap(), FabricEvent::Updated(idx(1)));
        assert_eq!(events.recv().await.unwrap(), FabricEvent::Revoked(idx(1)));
    }

    /// Memory backend that fails writes to one armed key
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: std::sync::Mutex<Option<&'static str>>,
    }

    impl FlakyBackend {
        fn fail_writes_to(&self, key: Option<&'static str>) {
            *self.failing.lock().unwrap() = key;
        }
    }

    #[async_trait::async_trait]
    impl StorageBackend for FlakyBackend {
        async fn get(
            &self,
            contexts: &[String],
            key: &str,
        ) -> Result<Option<Value>, pairing_storage::StorageError> {
            self.inner.get(contexts, key).await
        }

        async fn set(
            &self,
            contexts: &[String],
            key: &str,
            value: Value,
        ) -> Result<(), pairing_storage::StorageError> {
            if *self.failing.lock().unwrap() == Some(key) {
                return Err(pairing_storage::StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.set(contexts, key, value).await
        }

        async fn delete(
            &self,
            contexts: &[String],
            key: &str,
        ) -> Result<(), pairing_storage::StorageError> {
            self.inner.delete(contexts, key).await
        }

        async fn keys(
            &self,
            contexts: &[String],
        ) -> Result<Vec<String>, pairing_storage::StorageError> {
            self.inner.keys(contexts).await
        }
    }

    fn flaky_manager(backend: &Arc<FlakyBackend>) -> FabricManager {
        let storage = StorageManager::new(backend.clone());
        FabricManager::new(storage.create_context("fabrics").unwrap())
    }

    async fn stored_len(backend: &FlakyBackend) -> usize {
        backend
            .get(&["fabrics".to_string()], FABRICS_KEY)
            .await
            .unwrap()
            .and_then(|v| v.as_array().map(Vec::len))
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_failed_write_keeps_memory_and_storage_in_step() {
        let h = Harness::new();
        let backend = Arc::new(FlakyBackend::default());
        let manager = flaky_manager(&backend);
        manager.add_fabric(h.fabric(1)).await.unwrap();
        manager.persist_fabrics().await.unwrap();

        for key in [NEXT_INDEX_KEY, FABRICS_KEY] {
            backend.fail_writes_to(Some(key));
            assert!(manager.remove_fabric(idx(1)).await.is_err());
            assert_eq!(manager.fabrics().await.len(), 1);
            assert_eq!(stored_len(&backend).await, 1);
        }

        backend.fail_writes_to(None);
        manager.remove_fabric(idx(1)).await.unwrap();
        assert_eq!(stored_len(&backend).await, 0);
    }

    #[tokio::test]
    async fn test_failed_persist_does_not_reuse_removed_index_after_restart() {
        let h = Harness::new();
        let backend = Arc::new(FlakyBackend::default());
        let manager = flaky_manager(&backend);
        manager.add_fabric(h.fabric(1)).await.unwrap();
        manager.add_fabric(h.fabric(2)).await.unwrap();
        manager.remove_fabric(idx(1)).await.unwrap();
        manager.add_fabric(h.fabric(3)).await.unwrap();
        assert_eq!(manager.next_fabric_index().await.unwrap(), idx(4));

        for key in [NEXT_INDEX_KEY, FABRICS_KEY] {
            backend.fail_writes_to(Some(key));
            assert!(manager.persist_fabrics().await.is_err());

            let restarted = flaky_manager(&backend);
            assert_eq!(restarted.init_from_storage().await.unwrap(), 1);
            let next = restarted.next_fabric_index().await.unwrap();
            assert_ne!(next, idx(1));
            assert!(next.get() >= 3);
        }
    }

    #[tokio::test]
    async fn test_stale_counter_is_raised_past_held_indices() {
        let h = Harness::new();
        h.add(1).await;
        h.add(2).await;
        h.manager.remove_fabric(idx(1)).await.unwrap();
        h.backend
            .set(&["fabrics".to_string()], NEXT_INDEX_KEY, serde_json::json!(1))
            .await
            .unwrap();

        let storage = StorageManager::new(h.backend.clone());
        let restored = FabricManager::new(storage.create_context("fabrics").unwrap());
        assert_eq!(restored.init_from_storage().await.unwrap(), 1);
        assert_eq!(restored.next_fabric_index().await.unwrap(), idx(3));
    }
}
