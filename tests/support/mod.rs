#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::Keypair;
use parking_lot::Mutex;
use tempfile::TempDir;

use atx_node::cache::{AtxCache, CacheEntry};
use atx_node::codec;
use atx_node::config::ContextualPolicy;
use atx_node::crypto;
use atx_node::errors::AtxResult;
use atx_node::handler::{AtxHandler, HandlerConfig};
use atx_node::interfaces::{
    AtxAddedObserver, AtxFetchOpts, AtxReceiver, Clock, EventReporter, Fetcher, GossipPublisher,
    NipostValidator, NipostVerifyError, VotingEngine,
};
use atx_node::store::Store;
use atx_node::types::{
    ActivationTx, AtxHeader, AtxId, Epoch, Hash32, MerkleProof, NiPost, NodeId, Peer, Post,
    PostMetadata, VerifiedAtx, VrfNonce,
};

pub const GOLDEN: AtxId = AtxId([0xaa; 32]);
pub const TICK_SIZE: u64 = 100;
pub const LEAVES: u64 = 400_000;
pub const LOCAL_PEER: &str = "local";

pub struct FakeClock {
    epoch: AtomicU32,
}

impl FakeClock {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch: AtomicU32::new(epoch),
        }
    }

    pub fn set(&self, epoch: Epoch) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn current_epoch(&self) -> Epoch {
        self.epoch.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeFetcher {
    pub registered: Mutex<Vec<(Peer, Vec<Hash32>)>>,
    pub poet_requests: Mutex<Vec<Hash32>>,
    pub atx_requests: Mutex<Vec<Vec<AtxId>>>,
}

#[async_trait]
impl Fetcher for FakeFetcher {
    fn register_peer_hashes(&self, peer: &Peer, hashes: Vec<Hash32>) {
        self.registered.lock().push((peer.clone(), hashes));
    }

    async fn get_poet_proof(&self, reference: Hash32) -> AtxResult<()> {
        self.poet_requests.lock().push(reference);
        Ok(())
    }

    async fn get_atxs(&self, ids: &[AtxId], opts: AtxFetchOpts) -> AtxResult<()> {
        assert!(!opts.limited, "dependency fetches must bypass rate limiting");
        self.atx_requests.lock().push(ids.to_vec());
        Ok(())
    }
}

pub struct FakeValidator {
    pub leaves: u64,
    pub full_post: bool,
    pub invalid_index: Option<u32>,
    pub nipost_failure: Option<String>,
    pub nipost_delay: Duration,
    pub nipost_calls: AtomicUsize,
    pub nonce_checks: Mutex<Vec<(NodeId, VrfNonce, u32)>>,
}

impl FakeValidator {
    pub fn new(leaves: u64) -> Self {
        Self {
            leaves,
            full_post: true,
            invalid_index: None,
            nipost_failure: None,
            nipost_delay: Duration::ZERO,
            nipost_calls: AtomicUsize::new(0),
            nonce_checks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_invalid_index(mut self, index: u32) -> Self {
        self.invalid_index = Some(index);
        self
    }

    pub fn with_nipost_failure(mut self, reason: &str) -> Self {
        self.nipost_failure = Some(reason.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.nipost_delay = delay;
        self
    }
}

impl NipostValidator for FakeValidator {
    fn vrf_nonce(
        &self,
        node_id: NodeId,
        _commitment_atx: AtxId,
        nonce: VrfNonce,
        _labels_per_unit: u64,
        num_units: u32,
    ) -> AtxResult<()> {
        self.nonce_checks.lock().push((node_id, nonce, num_units));
        Ok(())
    }

    fn post(
        &self,
        _node_id: NodeId,
        _commitment_atx: AtxId,
        _post: &Post,
        metadata: &PostMetadata,
        _num_units: u32,
    ) -> AtxResult<()> {
        assert_eq!(metadata.challenge, [0u8; 32], "initial post proves a zero challenge");
        Ok(())
    }

    fn initial_nipost_challenge(
        &self,
        _atx: &ActivationTx,
        _store: &Store,
        _golden_atx: AtxId,
    ) -> AtxResult<()> {
        Ok(())
    }

    fn nipost_challenge(&self, _atx: &ActivationTx, _store: &Store) -> AtxResult<()> {
        Ok(())
    }

    fn positioning_atx(
        &self,
        _id: AtxId,
        _store: &Store,
        _golden_atx: AtxId,
        _publish_epoch: Epoch,
    ) -> AtxResult<()> {
        Ok(())
    }

    fn nipost(
        &self,
        _node_id: NodeId,
        _commitment_atx: AtxId,
        _nipost: &NiPost,
        _expected_challenge: Hash32,
        _num_units: u32,
        _seed: &[u8],
    ) -> Result<u64, NipostVerifyError> {
        self.nipost_calls.fetch_add(1, Ordering::SeqCst);
        if !self.nipost_delay.is_zero() {
            std::thread::sleep(self.nipost_delay);
        }
        if let Some(index) = self.invalid_index {
            return Err(NipostVerifyError::InvalidIndex(index));
        }
        if let Some(reason) = &self.nipost_failure {
            return Err(NipostVerifyError::Failed(reason.clone()));
        }
        Ok(self.leaves)
    }

    fn is_verifying_full_post(&self) -> bool {
        self.full_post
    }
}

#[derive(Default)]
pub struct FakePublisher {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl GossipPublisher for FakePublisher {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> AtxResult<()> {
        self.published.lock().push((topic.to_string(), data));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBeacon {
    pub headers: Mutex<Vec<AtxHeader>>,
}

impl AtxReceiver for FakeBeacon {
    fn on_atx(&self, header: &AtxHeader) {
        self.headers.lock().push(header.clone());
    }
}

#[derive(Default)]
pub struct FakeTortoise {
    pub atxs: Mutex<Vec<(Epoch, AtxId, Arc<CacheEntry>)>>,
    pub malfeasant: Mutex<Vec<NodeId>>,
}

impl VotingEngine for FakeTortoise {
    fn on_atx(&self, target_epoch: Epoch, id: AtxId, entry: Arc<CacheEntry>) {
        self.atxs.lock().push((target_epoch, id, entry));
    }

    fn on_malfeasance(&self, node_id: NodeId) {
        self.malfeasant.lock().push(node_id);
    }
}

#[derive(Default)]
pub struct FakeAtxAdded {
    pub count: AtomicUsize,
}

impl AtxAddedObserver for FakeAtxAdded {
    fn on_atx_added(&self, _atx: &VerifiedAtx) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeEvents {
    pub activations: Mutex<Vec<AtxId>>,
}

impl EventReporter for FakeEvents {
    fn report_new_activation(&self, atx: &VerifiedAtx) {
        self.activations.lock().push(atx.id());
    }
}

pub struct Harness {
    pub handler: Arc<AtxHandler>,
    pub store: Store,
    pub cache: Arc<AtxCache>,
    pub clock: Arc<FakeClock>,
    pub fetcher: Arc<FakeFetcher>,
    pub validator: Arc<FakeValidator>,
    pub publisher: Arc<FakePublisher>,
    pub beacon: Arc<FakeBeacon>,
    pub tortoise: Arc<FakeTortoise>,
    pub atx_added: Arc<FakeAtxAdded>,
    pub events: Arc<FakeEvents>,
    _dir: TempDir,
}

pub fn harness() -> Harness {
    harness_with(ContextualPolicy::LogOnly, FakeValidator::new(LEAVES))
}

pub fn harness_with(policy: ContextualPolicy, validator: FakeValidator) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::open(dir.path()).expect("open store");
    let cache = Arc::new(AtxCache::new());
    let clock = Arc::new(FakeClock::new(5));
    let fetcher = Arc::new(FakeFetcher::default());
    let validator = Arc::new(validator);
    let publisher = Arc::new(FakePublisher::default());
    let beacon = Arc::new(FakeBeacon::default());
    let tortoise = Arc::new(FakeTortoise::default());
    let atx_added = Arc::new(FakeAtxAdded::default());
    let events = Arc::new(FakeEvents::default());

    let handler = AtxHandler::new(
        HandlerConfig {
            local: LOCAL_PEER.to_string(),
            tick_size: TICK_SIZE,
            golden_atx: GOLDEN,
            contextual_policy: policy,
        },
        store.clone(),
        cache.clone(),
        clock.clone(),
        publisher.clone(),
        fetcher.clone(),
        validator.clone(),
        beacon.clone(),
        tortoise.clone(),
        atx_added.clone(),
        events.clone(),
    )
    .expect("build handler");

    Harness {
        handler: Arc::new(handler),
        store,
        cache,
        clock,
        fetcher,
        validator,
        publisher,
        beacon,
        tortoise,
        atx_added,
        events,
        _dir: dir,
    }
}

pub fn keypair() -> Keypair {
    crypto::generate_keypair()
}

pub fn sample_nipost(poet_ref: Hash32) -> NiPost {
    NiPost {
        membership: MerkleProof {
            nodes: vec![[1u8; 32], [2u8; 32]],
            leaf_index: 0,
        },
        post: Post {
            nonce: 3,
            indices: vec![1, 2, 3, 4],
            pow: 11,
        },
        metadata: PostMetadata {
            challenge: poet_ref,
            labels_per_unit: 2048,
        },
    }
}

/// Signs the ATX with the keypair, stamping its smesher id.
pub fn sign(keypair: &Keypair, atx: &mut ActivationTx) {
    atx.smesher_id = crypto::node_id(keypair);
    atx.signature = crypto::sign_message(keypair, &atx.signed_bytes()).to_bytes();
}

/// A well-formed first ATX for the identity. `salt` varies the proof bytes
/// so two builds produce distinct ids.
pub fn initial_atx(keypair: &Keypair, epoch: Epoch, num_units: u32, salt: u8) -> ActivationTx {
    let mut atx = ActivationTx {
        publish_epoch: epoch,
        prev_atx_id: AtxId::ZERO,
        positioning_atx_id: GOLDEN,
        commitment_atx_id: Some(AtxId([0xcc; 32])),
        initial_post: Some(Post {
            nonce: 1,
            indices: vec![salt; 4],
            pow: 7,
        }),
        vrf_nonce: Some(99),
        node_id: Some(crypto::node_id(keypair)),
        sequence: 0,
        num_units,
        nipost: Some(sample_nipost([0xbb; 32])),
        ..ActivationTx::default()
    };
    sign(keypair, &mut atx);
    atx
}

/// A well-formed follow-up ATX chained to `prev`, positioned on it too.
pub fn next_atx(
    keypair: &Keypair,
    epoch: Epoch,
    prev: AtxId,
    sequence: u64,
    num_units: u32,
    vrf_nonce: Option<VrfNonce>,
) -> ActivationTx {
    let mut atx = ActivationTx {
        publish_epoch: epoch,
        prev_atx_id: prev,
        positioning_atx_id: prev,
        commitment_atx_id: None,
        initial_post: None,
        vrf_nonce,
        node_id: None,
        sequence,
        num_units,
        nipost: Some(sample_nipost([0xbb; 32])),
        ..ActivationTx::default()
    };
    sign(keypair, &mut atx);
    atx
}

pub fn encode(atx: &ActivationTx) -> Vec<u8> {
    codec::to_bytes(atx)
}

pub fn peer(name: &str) -> Peer {
    name.to_string()
}
