mod atx;
mod malfeasance;

pub use atx::{
    ActivationTx, AtxHeader, AtxId, Epoch, Hash32, MerkleProof, NiPost, NodeId, Peer, Post,
    PostMetadata, Validity, VerifiedAtx, VrfNonce,
};
pub use malfeasance::{
    AtxMetadata, AtxProof, AtxProofMsg, BallotMetadata, BallotProof, BallotProofMsg,
    HareEligibility, HareMetadata, HareProof, HareProofMsg, InvalidPostIndexProof,
    MalfeasanceGossip, MalfeasanceKind, MalfeasanceProof,
};
