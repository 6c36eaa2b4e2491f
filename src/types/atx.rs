use std::fmt;

use parity_scale_codec::{Decode, Encode, Error as CodecError, Input, Output};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::hash32;
use crate::errors::{AtxError, AtxResult};

/// Epoch in which an ATX is announced. Its weight becomes active one epoch
/// later (the target epoch).
pub type Epoch = u32;

/// VRF nonce binding an identity's storage commitment to the pseudo-random
/// label subset checked during verification.
pub type VrfNonce = u64;

/// Raw 32-byte hash as it travels on the wire and through the fetcher.
pub type Hash32 = [u8; 32];

/// Transport-level peer identifier.
pub type Peer = String;

/// Content-addressed activation transaction identifier.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    Encode, Decode,
)]
pub struct AtxId(pub Hash32);

impl AtxId {
    pub const ZERO: AtxId = AtxId([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn hash32(&self) -> Hash32 {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for AtxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Identity of a smesher: its Ed25519 public key bytes.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    Encode, Decode,
)]
pub struct NodeId(pub Hash32);

impl NodeId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Proof-of-space over labels, as carried by the initial post and the NIPost
/// bundle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Post {
    pub nonce: u32,
    pub indices: Vec<u8>,
    pub pow: u64,
}

impl Encode for Post {
    fn encode_to<O: Output + ?Sized>(&self, dest: &mut O) {
        codec::encode_compact_u32(dest, self.nonce);
        codec::encode_byte_slice(dest, &self.indices);
        codec::encode_compact_u64(dest, self.pow);
    }
}

impl Decode for Post {
    fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
        Ok(Post {
            nonce: codec::decode_compact_u32(input)?,
            indices: codec::decode_byte_slice(input, codec::MAX_POST_INDICES)?,
            pow: codec::decode_compact_u64(input)?,
        })
    }
}

/// Metadata the proof-of-space verifier consumes next to a [`Post`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct PostMetadata {
    pub challenge: Hash32,
    #[codec(compact)]
    pub labels_per_unit: u64,
}

/// Merkle membership proof anchoring the post in the PoET tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MerkleProof {
    pub nodes: Vec<Hash32>,
    pub leaf_index: u64,
}

impl Encode for MerkleProof {
    fn encode_to<O: Output + ?Sized>(&self, dest: &mut O) {
        codec::encode_slice(dest, &self.nodes);
        codec::encode_compact_u64(dest, self.leaf_index);
    }
}

impl Decode for MerkleProof {
    fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
        Ok(MerkleProof {
            nodes: codec::decode_slice(input, codec::MAX_MERKLE_NODES)?,
            leaf_index: codec::decode_compact_u64(input)?,
        })
    }
}

/// Non-interactive proof of space-time: a PoET membership proof over a
/// proof-of-space, plus the metadata the verifier needs. The metadata
/// challenge doubles as the PoET proof reference.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct NiPost {
    pub membership: MerkleProof,
    pub post: Post,
    pub metadata: PostMetadata,
}

/// Activation transaction as it travels on the wire.
///
/// The canonical encoding covers the fields in declaration order; the
/// signature signs everything above it and the derived id hashes the same
/// bytes without the smesher id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationTx {
    pub smesher_id: NodeId,
    pub publish_epoch: Epoch,
    pub prev_atx_id: AtxId,
    pub positioning_atx_id: AtxId,
    pub commitment_atx_id: Option<AtxId>,
    pub initial_post: Option<Post>,
    pub vrf_nonce: Option<VrfNonce>,
    pub node_id: Option<NodeId>,
    pub sequence: u64,
    pub num_units: u32,
    pub nipost: Option<NiPost>,
    pub signature: [u8; 64],
}

impl Default for ActivationTx {
    fn default() -> Self {
        Self {
            smesher_id: NodeId::default(),
            publish_epoch: 0,
            prev_atx_id: AtxId::ZERO,
            positioning_atx_id: AtxId::ZERO,
            commitment_atx_id: None,
            initial_post: None,
            vrf_nonce: None,
            node_id: None,
            sequence: 0,
            num_units: 0,
            nipost: None,
            signature: [0u8; 64],
        }
    }
}

impl ActivationTx {
    fn encode_fields<O: Output + ?Sized>(&self, dest: &mut O, with_smesher: bool) {
        if with_smesher {
            self.smesher_id.encode_to(dest);
        }
        codec::encode_compact_u32(dest, self.publish_epoch);
        self.prev_atx_id.encode_to(dest);
        self.positioning_atx_id.encode_to(dest);
        self.commitment_atx_id.encode_to(dest);
        self.initial_post.encode_to(dest);
        codec::encode_option_compact_u64(dest, &self.vrf_nonce);
        self.node_id.encode_to(dest);
        codec::encode_compact_u64(dest, self.sequence);
        codec::encode_compact_u32(dest, self.num_units);
        self.nipost.encode_to(dest);
    }

    /// Bytes covered by the Ed25519 signature.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.encode_fields(&mut bytes, true);
        bytes
    }

    /// Content-addressed identifier: hash of the canonical encoding without
    /// the signature and the smesher id.
    pub fn id(&self) -> AtxId {
        let mut bytes = Vec::new();
        self.encode_fields(&mut bytes, false);
        AtxId(hash32(&bytes))
    }

    /// Hash of the NIPost challenge section, expected to match the statement
    /// proven by the PoET chain.
    pub fn challenge_hash(&self) -> Hash32 {
        let mut bytes = Vec::new();
        codec::encode_compact_u32(&mut bytes, self.publish_epoch);
        codec::encode_compact_u64(&mut bytes, self.sequence);
        self.prev_atx_id.encode_to(&mut bytes);
        self.positioning_atx_id.encode_to(&mut bytes);
        self.commitment_atx_id.encode_to(&mut bytes);
        self.initial_post.encode_to(&mut bytes);
        hash32(&bytes)
    }

    /// True when the ATX claims to be the identity's first.
    pub fn is_initial(&self) -> bool {
        self.prev_atx_id.is_zero()
    }
}

impl Encode for ActivationTx {
    fn encode_to<O: Output + ?Sized>(&self, dest: &mut O) {
        self.encode_fields(dest, true);
        self.signature.encode_to(dest);
    }
}

impl Decode for ActivationTx {
    fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
        Ok(ActivationTx {
            smesher_id: NodeId::decode(input)?,
            publish_epoch: codec::decode_compact_u32(input)?,
            prev_atx_id: AtxId::decode(input)?,
            positioning_atx_id: AtxId::decode(input)?,
            commitment_atx_id: Option::<AtxId>::decode(input)?,
            initial_post: Option::<Post>::decode(input)?,
            vrf_nonce: codec::decode_option_compact_u64(input)?,
            node_id: Option::<NodeId>::decode(input)?,
            sequence: codec::decode_compact_u64(input)?,
            num_units: codec::decode_compact_u32(input)?,
            nipost: Option::<NiPost>::decode(input)?,
            signature: <[u8; 64]>::decode(input)?,
        })
    }
}

/// Validity tag assigned at ingestion time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    Unverified,
    Valid,
}

/// ATX accepted by the pipeline, enriched with the derived quantities the
/// rest of the node consumes.
#[derive(Clone, Debug)]
pub struct VerifiedAtx {
    atx: ActivationTx,
    id: AtxId,
    blob: Vec<u8>,
    received: u64,
    validity: Validity,
    effective_num_units: u32,
    base_tick_height: u64,
    ticks: u64,
}

impl VerifiedAtx {
    pub fn new(
        atx: ActivationTx,
        blob: Vec<u8>,
        received: u64,
        validity: Validity,
        effective_num_units: u32,
        base_tick_height: u64,
        ticks: u64,
    ) -> AtxResult<Self> {
        base_tick_height.checked_add(ticks).ok_or_else(|| {
            AtxError::Invalid("tick height overflows the positioning anchor".into())
        })?;
        let id = atx.id();
        Ok(Self {
            atx,
            id,
            blob,
            received,
            validity,
            effective_num_units,
            base_tick_height,
            ticks,
        })
    }

    pub fn atx(&self) -> &ActivationTx {
        &self.atx
    }

    pub fn id(&self) -> AtxId {
        self.id
    }

    pub fn node_id(&self) -> NodeId {
        self.atx.smesher_id
    }

    pub fn publish_epoch(&self) -> Epoch {
        self.atx.publish_epoch
    }

    pub fn target_epoch(&self) -> Epoch {
        self.atx.publish_epoch + 1
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn effective_num_units(&self) -> u32 {
        self.effective_num_units
    }

    pub fn base_tick_height(&self) -> u64 {
        self.base_tick_height
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick_height(&self) -> u64 {
        self.base_tick_height + self.ticks
    }

    /// Voting weight purchased by this ATX.
    pub fn weight(&self) -> u64 {
        u64::from(self.effective_num_units) * self.ticks
    }

    pub fn header(&self) -> AtxHeader {
        AtxHeader {
            id: self.id,
            node_id: self.atx.smesher_id,
            publish_epoch: self.atx.publish_epoch,
            sequence: self.atx.sequence,
            num_units: self.atx.num_units,
            effective_num_units: self.effective_num_units,
            base_tick_height: self.base_tick_height,
            ticks: self.ticks,
            received: self.received,
            validity: self.validity,
        }
    }
}

/// Store-facing projection of an accepted ATX.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AtxHeader {
    pub id: AtxId,
    pub node_id: NodeId,
    pub publish_epoch: Epoch,
    pub sequence: u64,
    pub num_units: u32,
    pub effective_num_units: u32,
    pub base_tick_height: u64,
    pub ticks: u64,
    pub received: u64,
    pub validity: Validity,
}

impl AtxHeader {
    pub fn tick_height(&self) -> u64 {
        self.base_tick_height + self.ticks
    }

    pub fn target_epoch(&self) -> Epoch {
        self.publish_epoch + 1
    }
}
