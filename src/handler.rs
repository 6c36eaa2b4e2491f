use std::cmp::min;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::{AtxCache, CacheEntry};
use crate::codec;
use crate::config::ContextualPolicy;
use crate::crypto;
use crate::errors::{AtxError, AtxResult};
use crate::inflight::{Begin, InFlight};
use crate::interfaces::{
    AtxAddedObserver, AtxFetchOpts, AtxReceiver, Clock, EventReporter, Fetcher, GossipPublisher,
    NipostValidator, NipostVerifyError, VotingEngine, TOPIC_MALFEASANCE_PROOF,
};
use crate::store::Store;
use crate::types::{
    ActivationTx, AtxHeader, AtxId, AtxMetadata, AtxProofMsg, Hash32, MalfeasanceGossip,
    MalfeasanceProof, NiPost, NodeId, Peer, PostMetadata, Validity, VerifiedAtx,
};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Static knobs of the ATX pipeline.
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    /// Our own transport peer id. Doubles as the seed for the verifier's
    /// random label subset.
    pub local: Peer,
    /// PoET leaves per verifiable tick.
    pub tick_size: u64,
    /// Always-valid bootstrap positioning anchor.
    pub golden_atx: AtxId,
    pub contextual_policy: ContextualPolicy,
}

/// Processes ATXs arriving from gossip and sync: validates them in stages,
/// detects equivocation and invalid proofs, persists accepted ATXs, and
/// notifies the downstream subscribers.
pub struct AtxHandler {
    local: Peer,
    tick_size: u64,
    golden_atx: AtxId,
    contextual_policy: ContextualPolicy,
    store: Store,
    cache: Arc<AtxCache>,
    clock: Arc<dyn Clock>,
    publisher: Arc<dyn GossipPublisher>,
    fetcher: Arc<dyn Fetcher>,
    validator: Arc<dyn NipostValidator>,
    beacon: Arc<dyn AtxReceiver>,
    tortoise: Arc<dyn VotingEngine>,
    atx_added: Arc<dyn AtxAddedObserver>,
    events: Arc<dyn EventReporter>,
    signers: Mutex<HashSet<NodeId>>,
    in_flight: InFlight,
}

impl AtxHandler {
    pub fn new(
        config: HandlerConfig,
        store: Store,
        cache: Arc<AtxCache>,
        clock: Arc<dyn Clock>,
        publisher: Arc<dyn GossipPublisher>,
        fetcher: Arc<dyn Fetcher>,
        validator: Arc<dyn NipostValidator>,
        beacon: Arc<dyn AtxReceiver>,
        tortoise: Arc<dyn VotingEngine>,
        atx_added: Arc<dyn AtxAddedObserver>,
        events: Arc<dyn EventReporter>,
    ) -> AtxResult<Self> {
        if config.tick_size == 0 {
            return Err(AtxError::Config("tick size must not be zero".into()));
        }
        Ok(Self {
            local: config.local,
            tick_size: config.tick_size,
            golden_atx: config.golden_atx,
            contextual_policy: config.contextual_policy,
            store,
            cache,
            clock,
            publisher,
            fetcher,
            validator,
            beacon,
            tortoise,
            atx_added,
            events,
            signers: Mutex::new(HashSet::new()),
            in_flight: InFlight::new(),
        })
    }

    /// Registers one of our own identities. Equivocation by a registered
    /// identity aborts storage instead of producing a proof against us.
    pub fn register_signer(&self, node_id: NodeId) {
        let mut signers = self.signers.lock();
        if !signers.insert(node_id) {
            error!(%node_id, "signing key already registered");
            return;
        }
        info!(%node_id, "registered signing key");
    }

    /// True when no ATX is currently being processed.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Handles an ATX received on the gossip channel. A constructed
    /// malfeasance proof is republished before the distinguished malicious
    /// error is returned, so the transport never re-scores the sender
    /// positively for relaying a punishable ATX.
    pub async fn handle_gossip(&self, peer: &Peer, data: &[u8]) -> AtxResult<()> {
        let result = self.handle_atx(None, peer, data).await;
        if let Err(err) = &result {
            if !matches!(err, AtxError::Malformed(_) | AtxError::Known(_)) {
                warn!(sender = %peer, %err, "failed to process gossiped atx");
            }
        }
        match result {
            Ok(Some(proof)) => {
                // Broadcast last: proof verification runs on this same task.
                let gossip = MalfeasanceGossip {
                    proof,
                    eligibility: None,
                };
                let encoded = codec::to_bytes(&gossip);
                if let Err(err) = self.publisher.publish(TOPIC_MALFEASANCE_PROOF, encoded).await {
                    error!(%err, "failed to broadcast malfeasance proof");
                    return Err(err);
                }
                Err(AtxError::Malicious)
            }
            Ok(None) => Ok(()),
            Err(AtxError::Known(_)) if peer == &self.local => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Handles an ATX fetched by sync against an expected hash. Known ATXs
    /// are reported as success.
    pub async fn handle_synced(
        &self,
        expected_hash: Hash32,
        peer: &Peer,
        data: &[u8],
    ) -> AtxResult<()> {
        match self.handle_atx(Some(expected_hash), peer, data).await {
            Ok(_) => Ok(()),
            Err(AtxError::Known(_)) => Ok(()),
            Err(err) => {
                if !matches!(err, AtxError::Malformed(_)) {
                    warn!(sender = %peer, %err, "failed to process synced atx");
                }
                Err(err)
            }
        }
    }

    async fn handle_atx(
        &self,
        expected_hash: Option<Hash32>,
        peer: &Peer,
        data: &[u8],
    ) -> AtxResult<Option<MalfeasanceProof>> {
        let received = now_unix();
        let atx: ActivationTx = codec::from_bytes(data)?;
        let id = atx.id();
        if let Some(expected) = expected_hash {
            if id.hash32() != expected {
                return Err(AtxError::WrongHash {
                    expected: hex::encode(expected),
                    actual: id.to_string(),
                });
            }
        }

        match self.in_flight.begin(id) {
            Begin::Waiter(result) => {
                debug!(%id, "atx is already being processed, waiting for result");
                return match result.await {
                    Ok(outcome) => outcome.map(|_| None),
                    Err(_) => Err(AtxError::Cancelled),
                };
            }
            Begin::Owner => {}
        }

        info!(%id, size = data.len(), "handling incoming atx");
        let result = self.process_atx(peer, atx, data.to_vec(), received).await;
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        self.in_flight.finish(id, &outcome);
        result
    }

    async fn process_atx(
        &self,
        peer: &Peer,
        atx: ActivationTx,
        blob: Vec<u8>,
        received: u64,
    ) -> AtxResult<Option<MalfeasanceProof>> {
        crypto::verify_atx_signature(&atx)?;

        let id = atx.id();
        if self.store.has_atx(id)? {
            return Err(AtxError::Known(id));
        }
        debug!(%id, epoch = atx.publish_epoch, smesher = %atx.smesher_id, "processing atx");

        self.syntactically_validate(&atx)?;

        let (poet_ref, deps) = collect_atx_deps(self.golden_atx, &atx);
        let poet_ref = poet_ref.ok_or_else(|| AtxError::Invalid("atx without nipost".into()))?;
        self.register_hashes(peer, poet_ref, &deps);
        self.fetch_references(poet_ref, &deps).await?;

        let (leaves, effective_num_units, proof) = self.validate_deps(id, &atx)?;
        if proof.is_some() {
            return Ok(proof);
        }

        match self.contextually_validate(&atx) {
            Ok(()) => debug!(%id, "atx is contextually valid"),
            Err(err) if self.contextual_policy == ContextualPolicy::Enforce => return Err(err),
            Err(err) => {
                warn!(%id, smesher = %atx.smesher_id, %err, "atx is contextually invalid")
            }
        }

        let mut base_tick_height = 0;
        if atx.positioning_atx_id != self.golden_atx {
            let positioning = self
                .store
                .get_header(atx.positioning_atx_id)?
                .ok_or_else(|| {
                    AtxError::Storage(format!(
                        "positioning atx {} not found",
                        atx.positioning_atx_id
                    ))
                })?;
            base_tick_height = positioning.tick_height();
        }

        let validity = if self.validator.is_verifying_full_post() {
            Validity::Valid
        } else {
            Validity::Unverified
        };
        let vatx = VerifiedAtx::new(
            atx,
            blob,
            received,
            validity,
            effective_num_units,
            base_tick_height,
            leaves / self.tick_size,
        )?;

        let proof = self.store_atx(&vatx)?;
        self.events.report_new_activation(&vatx);
        info!(id = %vatx.id(), epoch = vatx.publish_epoch(), malicious = proof.is_some(), "new atx");
        Ok(proof)
    }

    /// Stateless checks over a single decoded ATX, including the
    /// initial-ATX field-presence matrix and the initial proof-of-space.
    fn syntactically_validate(&self, atx: &ActivationTx) -> AtxResult<()> {
        let nipost = atx
            .nipost
            .as_ref()
            .ok_or_else(|| AtxError::Invalid("atx without nipost".into()))?;
        let current = self.clock.current_epoch();
        if atx.publish_epoch > current.saturating_add(1) {
            return Err(AtxError::Invalid(format!(
                "publish epoch too far in the future: {} > {}",
                atx.publish_epoch,
                current + 1
            )));
        }
        if atx.positioning_atx_id.is_zero() {
            return Err(AtxError::Invalid("empty positioning atx".into()));
        }

        if atx.is_initial() {
            let Some(initial_post) = &atx.initial_post else {
                return Err(AtxError::Invalid(
                    "no previous atx declared, but initial post is missing".into(),
                ));
            };
            if atx.node_id.is_none() {
                return Err(AtxError::Invalid(
                    "no previous atx declared, but node id is missing".into(),
                ));
            }
            let Some(nonce) = atx.vrf_nonce else {
                return Err(AtxError::Invalid(
                    "no previous atx declared, but vrf nonce is missing".into(),
                ));
            };
            let Some(commitment_atx) = atx.commitment_atx_id else {
                return Err(AtxError::Invalid(
                    "no previous atx declared, but commitment atx is missing".into(),
                ));
            };
            if commitment_atx.is_zero() {
                return Err(AtxError::Invalid("empty commitment atx".into()));
            }
            if atx.sequence != 0 {
                return Err(AtxError::Invalid(
                    "no previous atx declared, but sequence number is not zero".into(),
                ));
            }

            // The initial post proves a zero challenge with the labels-per-unit
            // the NIPost metadata declares.
            let metadata = PostMetadata {
                challenge: [0u8; 32],
                labels_per_unit: nipost.metadata.labels_per_unit,
            };
            self.validator
                .vrf_nonce(
                    atx.smesher_id,
                    commitment_atx,
                    nonce,
                    metadata.labels_per_unit,
                    atx.num_units,
                )
                .map_err(|err| AtxError::Invalid(format!("invalid vrf nonce: {err}")))?;
            self.validator
                .post(
                    atx.smesher_id,
                    commitment_atx,
                    initial_post,
                    &metadata,
                    atx.num_units,
                )
                .map_err(|err| AtxError::Invalid(format!("invalid initial post: {err}")))?;
        } else {
            if atx.node_id.is_some() {
                return Err(AtxError::Invalid(
                    "previous atx declared, but node id is included".into(),
                ));
            }
            if atx.initial_post.is_some() {
                return Err(AtxError::Invalid(
                    "previous atx declared, but initial post is included".into(),
                ));
            }
            if atx.commitment_atx_id.is_some() {
                return Err(AtxError::Invalid(
                    "previous atx declared, but commitment atx is included".into(),
                ));
            }
        }
        Ok(())
    }

    /// Validation that needs the store and the fetched dependencies. Returns
    /// the proven PoET leaves, the effective storage size, and a proof when
    /// the NIPost failed at a specific label index. Returning a proof is a
    /// successful classification, not an error.
    fn validate_deps(
        &self,
        id: AtxId,
        atx: &ActivationTx,
    ) -> AtxResult<(u64, u32, Option<MalfeasanceProof>)> {
        let nipost = atx
            .nipost
            .as_ref()
            .ok_or_else(|| AtxError::Invalid("atx without nipost".into()))?;

        let commitment_atx;
        let effective_num_units;
        if atx.is_initial() {
            self.validator
                .initial_nipost_challenge(atx, &self.store, self.golden_atx)?;
            effective_num_units = atx.num_units;
            commitment_atx = atx.commitment_atx_id.ok_or_else(|| {
                AtxError::Invalid("no previous atx declared, but commitment atx is missing".into())
            })?;
        } else {
            commitment_atx = self.store.commitment_atx(atx.smesher_id)?.ok_or_else(|| {
                AtxError::Invalid(format!("commitment atx for {} not found", atx.smesher_id))
            })?;
            effective_num_units = self.validate_non_initial(atx, nipost, commitment_atx)?;
        }

        self.validator.positioning_atx(
            atx.positioning_atx_id,
            &self.store,
            self.golden_atx,
            atx.publish_epoch,
        )?;

        let expected_challenge = atx.challenge_hash();
        info!(%id, challenge = %hex::encode(expected_challenge), "validating nipost");
        match self.validator.nipost(
            atx.smesher_id,
            commitment_atx,
            nipost,
            expected_challenge,
            atx.num_units,
            self.local.as_bytes(),
        ) {
            Ok(leaves) => Ok((leaves, effective_num_units, None)),
            Err(NipostVerifyError::InvalidIndex(index)) => {
                info!(%id, index, "atx with invalid post index");
                let proof = MalfeasanceProof::invalid_post_index(atx.clone(), index);
                let encoded = codec::to_bytes(&proof);
                let mut tx = self.store.begin();
                tx.set_malicious(atx.smesher_id, &encoded, now_unix())?;
                tx.commit()?;
                self.cache.cache_proof(atx.smesher_id, proof.clone());
                self.cache.set_malicious(atx.smesher_id);
                self.tortoise.on_malfeasance(atx.smesher_id);
                Ok((0, 0, Some(proof)))
            }
            Err(NipostVerifyError::Failed(reason)) => {
                Err(AtxError::Invalid(format!("invalid nipost: {reason}")))
            }
        }
    }

    fn validate_non_initial(
        &self,
        atx: &ActivationTx,
        nipost: &NiPost,
        commitment_atx: AtxId,
    ) -> AtxResult<u32> {
        self.validator.nipost_challenge(atx, &self.store)?;

        let prev = self.store.get_header(atx.prev_atx_id)?.ok_or_else(|| {
            AtxError::Invalid(format!("previous atx {} not found", atx.prev_atx_id))
        })?;

        let mut nonce = atx.vrf_nonce;
        if atx.num_units > prev.num_units && nonce.is_none() {
            info!(
                smesher = %atx.smesher_id,
                "post size increased without new vrf nonce, re-validating stored nonce"
            );
            // Rare path; read the store directly instead of the cache.
            nonce = Some(self.store.nonce_by_id(prev.id)?.ok_or_else(|| {
                AtxError::Storage(format!("no stored vrf nonce for atx {}", prev.id))
            })?);
        }
        if let Some(nonce) = nonce {
            self.validator
                .vrf_nonce(
                    atx.smesher_id,
                    commitment_atx,
                    nonce,
                    nipost.metadata.labels_per_unit,
                    atx.num_units,
                )
                .map_err(|err| AtxError::Invalid(format!("invalid vrf nonce: {err}")))?;
        }
        Ok(min(prev.num_units, atx.num_units))
    }

    /// Ensures the referenced previous ATX is the last one known for the
    /// identity, or that none exists when none is referenced.
    fn contextually_validate(&self, atx: &ActivationTx) -> AtxResult<()> {
        match self.store.get_last_id_by_node(atx.smesher_id)? {
            Some(last) if atx.prev_atx_id == last => Ok(()),
            Some(last) if atx.prev_atx_id.is_zero() => Err(AtxError::Contextual(format!(
                "no previous atx reported, but atx {last} already seen for the same identity"
            ))),
            Some(_) => Err(AtxError::Contextual(
                "last atx is not the one referenced".into(),
            )),
            None if atx.prev_atx_id.is_zero() => Ok(()),
            None => Err(AtxError::Contextual(format!(
                "previous atx {} not known for the identity",
                atx.prev_atx_id
            ))),
        }
    }

    /// Persists the ATX inside one store transaction, resolving equivocation
    /// against the identity's existing ATX in the same epoch, then fans out
    /// the post-commit notifications in their required order.
    fn store_atx(&self, vatx: &VerifiedAtx) -> AtxResult<Option<MalfeasanceProof>> {
        let node_id = vatx.node_id();
        let malicious = self.store.is_malicious(node_id)?;

        let mut proof = None;
        let nonce;
        {
            let mut tx = self.store.begin();
            if !malicious {
                if let Some(prev) = tx.get_by_epoch_and_node(vatx.publish_epoch(), node_id)? {
                    if prev.id != vatx.id() {
                        if self.signers.lock().contains(&node_id) {
                            // Our own identity published twice: fail the
                            // incoming ATX instead of punishing ourselves.
                            return Err(AtxError::SelfEquivocation(
                                node_id,
                                vatx.publish_epoch(),
                            ));
                        }
                        let prev_signature: [u8; 64] =
                            prev.signature.as_slice().try_into().map_err(|_| {
                                AtxError::Storage("invalid stored atx signature".into())
                            })?;
                        let multiple = MalfeasanceProof::multiple_atxs(
                            vatx.publish_epoch(),
                            AtxProofMsg {
                                inner: AtxMetadata {
                                    publish_epoch: prev.publish_epoch,
                                    msg_hash: prev.id.hash32(),
                                },
                                smesher_id: prev.node_id,
                                signature: prev_signature,
                            },
                            AtxProofMsg {
                                inner: AtxMetadata {
                                    publish_epoch: vatx.publish_epoch(),
                                    msg_hash: vatx.id().hash32(),
                                },
                                smesher_id: node_id,
                                signature: vatx.atx().signature,
                            },
                        );
                        tx.set_malicious(node_id, &codec::to_bytes(&multiple), now_unix())?;
                        warn!(
                            smesher = %node_id,
                            epoch = vatx.publish_epoch(),
                            prev = %prev.id,
                            curr = %vatx.id(),
                            "smesher produced more than one atx in the same epoch"
                        );
                        proof = Some(multiple);
                    }
                }
            }
            nonce = tx.add_atx(vatx)?;
            tx.commit()?;
        }
        let nonce =
            nonce.ok_or_else(|| AtxError::Storage(format!("no vrf nonce for atx {}", vatx.id())))?;

        self.atx_added.on_atx_added(vatx);
        if let Some(proof) = &proof {
            self.cache.cache_proof(node_id, proof.clone());
            self.cache.set_malicious(node_id);
            self.tortoise.on_malfeasance(node_id);
        }
        let header = vatx.header();
        let added = self.cache_atx(&header, nonce);
        self.beacon.on_atx(&header);
        if let Some(entry) = added {
            self.tortoise.on_atx(header.target_epoch(), header.id, entry);
        }
        debug!(id = %vatx.id(), epoch = vatx.publish_epoch(), "finished storing atx");
        Ok(proof)
    }

    /// Adds an accepted ATX to the per-epoch cache unless its target epoch
    /// was already evicted. A failed malicious-flag read skips the cache but
    /// never fails the accepted ATX.
    fn cache_atx(&self, header: &AtxHeader, nonce: u64) -> Option<Arc<CacheEntry>> {
        if self.cache.is_evicted(header.target_epoch()) {
            return None;
        }
        let malicious = match self.store.is_malicious(header.node_id) {
            Ok(malicious) => malicious,
            Err(err) => {
                error!(%err, "failed to read malicious flag");
                return None;
            }
        };
        self.cache.add(header, nonce, malicious)
    }

    fn register_hashes(&self, peer: &Peer, poet_ref: Hash32, deps: &[AtxId]) {
        let mut hashes = Vec::with_capacity(deps.len() + 1);
        hashes.extend(deps.iter().map(AtxId::hash32));
        hashes.push(poet_ref);
        self.fetcher.register_peer_hashes(peer, hashes);
    }

    /// Resolves the PoET proof first, then the prerequisite ATXs without
    /// rate limiting.
    async fn fetch_references(&self, poet_ref: Hash32, deps: &[AtxId]) -> AtxResult<()> {
        self.fetcher.get_poet_proof(poet_ref).await.map_err(|err| {
            AtxError::Fetch(format!(
                "missing poet proof {}: {err}",
                hex::encode(poet_ref)
            ))
        })?;
        if deps.is_empty() {
            return Ok(());
        }
        self.fetcher
            .get_atxs(deps, AtxFetchOpts { limited: false })
            .await
            .map_err(|err| AtxError::Fetch(format!("missing atx dependencies: {err}")))?;
        debug!(fetched = deps.len(), "done fetching references");
        Ok(())
    }
}

/// Unique dependencies of an ATX: the PoET proof reference and the
/// prerequisite ATX ids, with the zero sentinel and the golden anchor
/// filtered out.
fn collect_atx_deps(golden_atx: AtxId, atx: &ActivationTx) -> (Option<Hash32>, Vec<AtxId>) {
    let mut ids = vec![atx.prev_atx_id, atx.positioning_atx_id];
    if let Some(commitment) = atx.commitment_atx_id {
        ids.push(commitment);
    }
    let mut filtered = Vec::new();
    for id in ids {
        if !id.is_zero() && id != golden_atx && !filtered.contains(&id) {
            filtered.push(id);
        }
    }
    (
        atx.nipost.as_ref().map(|nipost| nipost.metadata.challenge),
        filtered,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Post;

    fn atx_with_deps(prev: AtxId, positioning: AtxId, commitment: Option<AtxId>) -> ActivationTx {
        ActivationTx {
            prev_atx_id: prev,
            positioning_atx_id: positioning,
            commitment_atx_id: commitment,
            nipost: Some(NiPost {
                membership: Default::default(),
                post: Post::default(),
                metadata: PostMetadata {
                    challenge: [7u8; 32],
                    labels_per_unit: 128,
                },
            }),
            ..ActivationTx::default()
        }
    }

    #[test]
    fn deps_filter_zero_golden_and_duplicates() {
        let golden = AtxId([1u8; 32]);
        let prev = AtxId([2u8; 32]);

        let (poet, deps) = collect_atx_deps(golden, &atx_with_deps(prev, prev, Some(golden)));
        assert_eq!(poet, Some([7u8; 32]));
        assert_eq!(deps, vec![prev]);

        let (_, deps) = collect_atx_deps(golden, &atx_with_deps(AtxId::ZERO, golden, None));
        assert!(deps.is_empty());
    }

    #[test]
    fn deps_without_nipost_have_no_poet_ref() {
        let mut atx = atx_with_deps(AtxId::ZERO, AtxId([3u8; 32]), None);
        atx.nipost = None;
        let (poet, deps) = collect_atx_deps(AtxId([1u8; 32]), &atx);
        assert_eq!(poet, None);
        assert_eq!(deps, vec![AtxId([3u8; 32])]);
    }
}
