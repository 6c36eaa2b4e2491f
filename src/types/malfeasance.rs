use parity_scale_codec::{Decode, Encode};

use crate::types::{ActivationTx, Epoch, Hash32, NodeId};

/// Metadata identifying one of two conflicting ATXs.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct AtxMetadata {
    #[codec(compact)]
    pub publish_epoch: Epoch,
    pub msg_hash: Hash32,
}

/// One half of a double-publish proof: the signed metadata of an ATX.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct AtxProofMsg {
    pub inner: AtxMetadata,
    pub smesher_id: NodeId,
    pub signature: [u8; 64],
}

/// Two ATXs by the same identity in the same publish epoch.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct AtxProof {
    pub messages: [AtxProofMsg; 2],
}

/// Metadata identifying one of two conflicting ballots. Present only for
/// wire compatibility; ballots are validated elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BallotMetadata {
    #[codec(compact)]
    pub layer: u32,
    pub msg_hash: Hash32,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BallotProofMsg {
    pub inner: BallotMetadata,
    pub smesher_id: NodeId,
    pub signature: [u8; 64],
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BallotProof {
    pub messages: [BallotProofMsg; 2],
}

/// Metadata identifying one of two conflicting hare votes. Present only for
/// wire compatibility.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct HareMetadata {
    #[codec(compact)]
    pub layer: u32,
    #[codec(compact)]
    pub round: u32,
    pub msg_hash: Hash32,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct HareProofMsg {
    pub inner: HareMetadata,
    pub smesher_id: NodeId,
    pub signature: [u8; 64],
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct HareProof {
    pub messages: [HareProofMsg; 2],
}

/// A full ATX whose proof-of-space failed at a specific leaf.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct InvalidPostIndexProof {
    pub atx: ActivationTx,
    #[codec(compact)]
    pub invalid_index: u32,
}

/// Closed union of punishable misbehavior. Discriminants are part of the
/// wire format and must not be reordered.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum MalfeasanceKind {
    #[codec(index = 1)]
    MultipleAtxs(AtxProof),
    #[codec(index = 2)]
    MultipleBallots(BallotProof),
    #[codec(index = 3)]
    HareEquivocation(HareProof),
    #[codec(index = 4)]
    InvalidPostIndex(InvalidPostIndexProof),
}

/// Compact evidence of punishable misbehavior by an identity.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct MalfeasanceProof {
    #[codec(compact)]
    pub publish_epoch: Epoch,
    pub kind: MalfeasanceKind,
}

impl MalfeasanceProof {
    /// Double-publish proof from the signed metadata of two conflicting
    /// ATXs.
    pub fn multiple_atxs(epoch: Epoch, first: AtxProofMsg, second: AtxProofMsg) -> Self {
        Self {
            publish_epoch: epoch,
            kind: MalfeasanceKind::MultipleAtxs(AtxProof {
                messages: [first, second],
            }),
        }
    }

    /// Invalid-post-index proof carrying the offending ATX verbatim.
    pub fn invalid_post_index(atx: ActivationTx, invalid_index: u32) -> Self {
        let publish_epoch = atx.publish_epoch;
        Self {
            publish_epoch,
            kind: MalfeasanceKind::InvalidPostIndex(InvalidPostIndexProof { atx, invalid_index }),
        }
    }
}

/// Hare eligibility attached to relayed malfeasance proofs. The ATX pipeline
/// always publishes without one.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct HareEligibility {
    #[codec(compact)]
    pub layer: u32,
    #[codec(compact)]
    pub round: u32,
    pub proof: [u8; 80],
}

/// Envelope published on the malfeasance gossip topic.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct MalfeasanceGossip {
    pub proof: MalfeasanceProof,
    pub eligibility: Option<HareEligibility>,
}
