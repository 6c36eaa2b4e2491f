//! Capability interfaces for the collaborators surrounding the ATX pipeline.
//!
//! Production wires concrete implementations (p2p fetcher, PoST verifier,
//! beacon, voting engine); tests wire fakes. The handler only ever sees these
//! traits.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::CacheEntry;
use crate::errors::AtxResult;
use crate::store::Store;
use crate::types::{
    ActivationTx, AtxHeader, AtxId, Epoch, Hash32, NiPost, NodeId, Peer, Post, PostMetadata,
    VerifiedAtx, VrfNonce,
};

/// Gossip topic carrying inbound ATX payloads.
pub const TOPIC_ATX: &str = "atx";
/// Gossip topic carrying encoded [`crate::types::MalfeasanceGossip`] envelopes.
pub const TOPIC_MALFEASANCE_PROOF: &str = "malfeasance-proof";

/// Source of the current epoch.
pub trait Clock: Send + Sync {
    fn current_epoch(&self) -> Epoch;
}

/// Options for a dependency fetch. ATX prerequisites bypass the fetcher's
/// rate limiter because the caller is already mid-validation.
#[derive(Clone, Copy, Debug)]
pub struct AtxFetchOpts {
    pub limited: bool,
}

impl Default for AtxFetchOpts {
    fn default() -> Self {
        Self { limited: true }
    }
}

/// Asynchronous dependency fetcher. Resolves hashes to locally available
/// objects before validation proceeds.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Records which peer advertised which hashes so follow-up requests go to
    /// a peer that claims to have the data.
    fn register_peer_hashes(&self, peer: &Peer, hashes: Vec<Hash32>);

    async fn get_poet_proof(&self, reference: Hash32) -> AtxResult<()>;

    async fn get_atxs(&self, ids: &[AtxId], opts: AtxFetchOpts) -> AtxResult<()>;
}

/// Failure of the full NIPost verification. The invalid-index variant is
/// punishable and turns into a malfeasance proof instead of a rejection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NipostVerifyError {
    #[error("invalid post index {0}")]
    InvalidIndex(u32),
    #[error("nipost verification failed: {0}")]
    Failed(String),
}

/// Staged proof-of-space-time verifier.
pub trait NipostValidator: Send + Sync {
    fn vrf_nonce(
        &self,
        node_id: NodeId,
        commitment_atx: AtxId,
        nonce: VrfNonce,
        labels_per_unit: u64,
        num_units: u32,
    ) -> AtxResult<()>;

    fn post(
        &self,
        node_id: NodeId,
        commitment_atx: AtxId,
        post: &Post,
        metadata: &PostMetadata,
        num_units: u32,
    ) -> AtxResult<()>;

    fn initial_nipost_challenge(
        &self,
        atx: &ActivationTx,
        store: &Store,
        golden_atx: AtxId,
    ) -> AtxResult<()>;

    fn nipost_challenge(&self, atx: &ActivationTx, store: &Store) -> AtxResult<()>;

    fn positioning_atx(
        &self,
        id: AtxId,
        store: &Store,
        golden_atx: AtxId,
        publish_epoch: Epoch,
    ) -> AtxResult<()>;

    /// Verifies the full NIPost and returns the number of PoET leaves it
    /// proves. The seed selects the random label subset to check.
    fn nipost(
        &self,
        node_id: NodeId,
        commitment_atx: AtxId,
        nipost: &NiPost,
        expected_challenge: Hash32,
        num_units: u32,
        seed: &[u8],
    ) -> Result<u64, NipostVerifyError>;

    fn is_verifying_full_post(&self) -> bool;
}

/// Outbound gossip publisher.
#[async_trait]
pub trait GossipPublisher: Send + Sync {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> AtxResult<()>;
}

/// Beacon subscriber, notified of every accepted ATX header.
pub trait AtxReceiver: Send + Sync {
    fn on_atx(&self, header: &AtxHeader);
}

/// Voting/ordering engine notifications.
pub trait VotingEngine: Send + Sync {
    fn on_atx(&self, target_epoch: Epoch, id: AtxId, entry: Arc<CacheEntry>);
    fn on_malfeasance(&self, node_id: NodeId);
}

/// Store-level observer fired first after an ATX commit.
pub trait AtxAddedObserver: Send + Sync {
    fn on_atx_added(&self, atx: &VerifiedAtx);
}

/// Event bus reporting, fired last after an ATX is fully handled.
pub trait EventReporter: Send + Sync {
    fn report_new_activation(&self, atx: &VerifiedAtx);
}
