use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use serde::{Deserialize, Serialize};

use crate::errors::{AtxError, AtxResult};
use crate::types::{AtxHeader, AtxId, Epoch, NodeId, Validity, VerifiedAtx, VrfNonce};

const CF_ATXS: &str = "atxs";
const CF_EPOCH_NODE: &str = "atx_epoch_node";
const CF_NODE: &str = "atx_node";
const CF_COMMITMENTS: &str = "commitments";
const CF_IDENTITIES: &str = "identities";

/// Persisted form of an accepted ATX: the original wire blob plus the
/// quantities derived during validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredAtx {
    pub id: AtxId,
    pub node_id: NodeId,
    pub publish_epoch: Epoch,
    pub sequence: u64,
    pub num_units: u32,
    pub effective_num_units: u32,
    pub base_tick_height: u64,
    pub ticks: u64,
    pub nonce: Option<VrfNonce>,
    pub received: u64,
    pub validity: Validity,
    pub signature: Vec<u8>,
    pub blob: Vec<u8>,
}

impl StoredAtx {
    fn from_verified(vatx: &VerifiedAtx, nonce: Option<VrfNonce>) -> Self {
        Self {
            id: vatx.id(),
            node_id: vatx.node_id(),
            publish_epoch: vatx.publish_epoch(),
            sequence: vatx.atx().sequence,
            num_units: vatx.atx().num_units,
            effective_num_units: vatx.effective_num_units(),
            base_tick_height: vatx.base_tick_height(),
            ticks: vatx.ticks(),
            nonce,
            received: vatx.received(),
            validity: vatx.validity(),
            signature: vatx.atx().signature.to_vec(),
            blob: vatx.blob().to_vec(),
        }
    }

    pub fn header(&self) -> AtxHeader {
        AtxHeader {
            id: self.id,
            node_id: self.node_id,
            publish_epoch: self.publish_epoch,
            sequence: self.sequence,
            num_units: self.num_units,
            effective_num_units: self.effective_num_units,
            base_tick_height: self.base_tick_height,
            ticks: self.ticks,
            received: self.received,
            validity: self.validity,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MaliciousRecord {
    proof: Vec<u8>,
    received: u64,
}

fn epoch_node_key(epoch: Epoch, node_id: NodeId) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..4].copy_from_slice(&epoch.to_be_bytes());
    key[4..].copy_from_slice(node_id.as_bytes());
    key
}

fn node_epoch_key(node_id: NodeId, epoch: Epoch) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(node_id.as_bytes());
    key[32..].copy_from_slice(&epoch.to_be_bytes());
    key
}

/// ATX and identity store.
///
/// Writes go through [`StoreTx`], which serializes the check-then-write
/// section behind a store-level mutex and commits its batch atomically.
pub struct Store {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    pub fn open(path: &Path) -> AtxResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ATXS, Options::default()),
            ColumnFamilyDescriptor::new(CF_EPOCH_NODE, Options::default()),
            ColumnFamilyDescriptor::new(CF_NODE, Options::default()),
            ColumnFamilyDescriptor::new(CF_COMMITMENTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_IDENTITIES, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> AtxResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| AtxError::Config(format!("missing column family {name}")))
    }

    /// Opens a write transaction. Holds the store's write lock until commit
    /// or drop; keep validation and every other suspension point outside.
    pub fn begin(&self) -> StoreTx<'_> {
        StoreTx {
            store: self,
            batch: WriteBatch::default(),
            _guard: self.write_lock.lock(),
        }
    }

    pub fn has_atx(&self, id: AtxId) -> AtxResult<bool> {
        let cf = self.cf(CF_ATXS)?;
        Ok(self.db.get_cf(&cf, id.as_bytes())?.is_some())
    }

    fn read_record(&self, id: AtxId) -> AtxResult<Option<StoredAtx>> {
        let cf = self.cf(CF_ATXS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn get_header(&self, id: AtxId) -> AtxResult<Option<AtxHeader>> {
        Ok(self.read_record(id)?.map(|record| record.header()))
    }

    pub fn get_by_epoch_and_node(
        &self,
        epoch: Epoch,
        node_id: NodeId,
    ) -> AtxResult<Option<StoredAtx>> {
        let cf = self.cf(CF_EPOCH_NODE)?;
        let id = match self.db.get_cf(&cf, epoch_node_key(epoch, node_id))? {
            Some(value) => decode_id(&value)?,
            None => return Ok(None),
        };
        self.read_record(id)
    }

    /// Most recent ATX id seen from an identity, by publish epoch.
    pub fn get_last_id_by_node(&self, node_id: NodeId) -> AtxResult<Option<AtxId>> {
        let cf = self.cf(CF_NODE)?;
        let upper = node_epoch_key(node_id, Epoch::MAX);
        let mut iterator = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));
        if let Some(entry) = iterator.next() {
            let (key, value) = entry?;
            if key.len() == 36 && &key[..32] == node_id.as_bytes() {
                return Ok(Some(decode_id(&value)?));
            }
        }
        Ok(None)
    }

    /// The ATX against which an identity first committed its storage.
    pub fn commitment_atx(&self, node_id: NodeId) -> AtxResult<Option<AtxId>> {
        let cf = self.cf(CF_COMMITMENTS)?;
        match self.db.get_cf(&cf, node_id.as_bytes())? {
            Some(value) => Ok(Some(decode_id(&value)?)),
            None => Ok(None),
        }
    }

    pub fn nonce_by_id(&self, id: AtxId) -> AtxResult<Option<VrfNonce>> {
        Ok(self.read_record(id)?.and_then(|record| record.nonce))
    }

    pub fn is_malicious(&self, node_id: NodeId) -> AtxResult<bool> {
        let cf = self.cf(CF_IDENTITIES)?;
        Ok(self.db.get_cf(&cf, node_id.as_bytes())?.is_some())
    }

    /// Encoded malfeasance proof recorded for an identity, if any.
    pub fn malfeasance_proof(&self, node_id: NodeId) -> AtxResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_IDENTITIES)?;
        match self.db.get_cf(&cf, node_id.as_bytes())? {
            Some(value) => {
                let record: MaliciousRecord = bincode::deserialize(&value)?;
                Ok(Some(record.proof))
            }
            None => Ok(None),
        }
    }
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            write_lock: self.write_lock.clone(),
        }
    }
}

fn decode_id(value: &[u8]) -> AtxResult<AtxId> {
    let bytes: [u8; 32] = value
        .try_into()
        .map_err(|_| AtxError::Storage("invalid atx id encoding".into()))?;
    Ok(AtxId(bytes))
}

/// Batched write transaction over the store.
pub struct StoreTx<'a> {
    store: &'a Store,
    batch: WriteBatch,
    _guard: MutexGuard<'a, ()>,
}

impl StoreTx<'_> {
    pub fn get_by_epoch_and_node(
        &self,
        epoch: Epoch,
        node_id: NodeId,
    ) -> AtxResult<Option<StoredAtx>> {
        self.store.get_by_epoch_and_node(epoch, node_id)
    }

    /// Stages an ATX insert. Re-inserting a known id is a no-op that reports
    /// the already-stored nonce. The effective VRF nonce is the ATX's own or,
    /// for a non-initial ATX without one, the nonce inherited from its
    /// previous ATX.
    pub fn add_atx(&mut self, vatx: &VerifiedAtx) -> AtxResult<Option<VrfNonce>> {
        let id = vatx.id();
        if let Some(existing) = self.store.read_record(id)? {
            return Ok(existing.nonce);
        }

        let nonce = match vatx.atx().vrf_nonce {
            Some(nonce) => Some(nonce),
            None if vatx.atx().prev_atx_id.is_zero() => None,
            None => self.store.nonce_by_id(vatx.atx().prev_atx_id)?,
        };

        let record = StoredAtx::from_verified(vatx, nonce);
        let data = bincode::serialize(&record)?;
        let atxs = self.store.cf(CF_ATXS)?;
        self.batch.put_cf(&atxs, id.as_bytes(), data);

        let epoch_node = self.store.cf(CF_EPOCH_NODE)?;
        self.batch.put_cf(
            &epoch_node,
            epoch_node_key(vatx.publish_epoch(), vatx.node_id()),
            id.as_bytes(),
        );
        let node = self.store.cf(CF_NODE)?;
        self.batch.put_cf(
            &node,
            node_epoch_key(vatx.node_id(), vatx.publish_epoch()),
            id.as_bytes(),
        );
        if vatx.atx().is_initial() {
            if let Some(commitment) = vatx.atx().commitment_atx_id {
                let commitments = self.store.cf(CF_COMMITMENTS)?;
                self.batch
                    .put_cf(&commitments, vatx.node_id().as_bytes(), commitment.as_bytes());
            }
        }
        Ok(nonce)
    }

    /// Stages the malicious mark for an identity. The earliest recorded
    /// proof wins; marking an already-malicious identity is a no-op.
    pub fn set_malicious(&mut self, node_id: NodeId, proof: &[u8], received: u64) -> AtxResult<()> {
        if self.store.is_malicious(node_id)? {
            return Ok(());
        }
        let record = MaliciousRecord {
            proof: proof.to_vec(),
            received,
        };
        let cf = self.store.cf(CF_IDENTITIES)?;
        self.batch
            .put_cf(&cf, node_id.as_bytes(), bincode::serialize(&record)?);
        Ok(())
    }

    /// Atomically applies every staged write.
    pub fn commit(self) -> AtxResult<()> {
        self.store.db.write(self.batch)?;
        Ok(())
    }
}
