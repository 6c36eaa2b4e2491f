use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{AtxHeader, AtxId, Epoch, MalfeasanceProof, NodeId, VrfNonce};

/// Cached view of an accepted ATX, keyed by its target epoch. This is what
/// the voting engine consumes when weighing ballots.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub id: AtxId,
    pub node_id: NodeId,
    pub weight: u64,
    pub base_tick_height: u64,
    pub height: u64,
    pub nonce: VrfNonce,
    pub malicious: bool,
}

#[derive(Default)]
struct Inner {
    evicted: Option<Epoch>,
    epochs: HashMap<Epoch, HashMap<NodeId, Arc<CacheEntry>>>,
    proofs: HashMap<NodeId, Arc<MalfeasanceProof>>,
    malicious: HashMap<NodeId, ()>,
}

/// In-memory per-epoch ATX cache with an eviction horizon.
///
/// Epochs at or below the horizon are gone for good; additions targeting them
/// are refused so the voting engine never observes an entry that the horizon
/// already passed.
#[derive(Default)]
pub struct AtxCache {
    inner: RwLock<Inner>,
}

impl AtxCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_evicted(&self, epoch: Epoch) -> bool {
        match self.inner.read().evicted {
            Some(horizon) => epoch <= horizon,
            None => false,
        }
    }

    /// Advances the horizon and drops everything at or below it.
    pub fn evict(&self, horizon: Epoch) {
        let mut inner = self.inner.write();
        if inner.evicted.map_or(false, |current| horizon <= current) {
            return;
        }
        inner.evicted = Some(horizon);
        inner.epochs.retain(|epoch, _| *epoch > horizon);
    }

    /// Adds an accepted ATX under its target epoch. Returns the inserted
    /// entry, or `None` when the target epoch is already evicted.
    pub fn add(&self, header: &AtxHeader, nonce: VrfNonce, malicious: bool) -> Option<Arc<CacheEntry>> {
        let mut inner = self.inner.write();
        if let Some(horizon) = inner.evicted {
            if header.target_epoch() <= horizon {
                return None;
            }
        }
        let malicious = malicious || inner.malicious.contains_key(&header.node_id);
        let entry = Arc::new(CacheEntry {
            id: header.id,
            node_id: header.node_id,
            weight: u64::from(header.effective_num_units) * header.ticks,
            base_tick_height: header.base_tick_height,
            height: header.tick_height(),
            nonce,
            malicious,
        });
        inner
            .epochs
            .entry(header.target_epoch())
            .or_default()
            .insert(header.node_id, entry.clone());
        Some(entry)
    }

    pub fn get(&self, target_epoch: Epoch, node_id: NodeId) -> Option<Arc<CacheEntry>> {
        self.inner
            .read()
            .epochs
            .get(&target_epoch)
            .and_then(|entries| entries.get(&node_id))
            .cloned()
    }

    /// Flags an identity as malicious across every cached epoch.
    pub fn set_malicious(&self, node_id: NodeId) {
        let mut inner = self.inner.write();
        inner.malicious.insert(node_id, ());
        for entries in inner.epochs.values_mut() {
            if let Some(entry) = entries.get_mut(&node_id) {
                let mut updated = CacheEntry::clone(entry);
                updated.malicious = true;
                *entry = Arc::new(updated);
            }
        }
    }

    pub fn is_malicious(&self, node_id: NodeId) -> bool {
        self.inner.read().malicious.contains_key(&node_id)
    }

    pub fn cache_proof(&self, node_id: NodeId, proof: MalfeasanceProof) {
        self.inner.write().proofs.insert(node_id, Arc::new(proof));
    }

    pub fn proof(&self, node_id: NodeId) -> Option<Arc<MalfeasanceProof>> {
        self.inner.read().proofs.get(&node_id).cloned()
    }
}
