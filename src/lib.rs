//! Activation transaction (ATX) ingestion and validation core.
//!
//! An ATX is a periodic, per-identity announcement that a participant has
//! re-proven storage of a unique dataset during a time window, purchasing
//! voting weight for a future epoch. This crate receives ATXs from gossip and
//! sync, performs syntactic, cryptographic, and contextual validation,
//! detects equivocation and invalid proofs, persists accepted ATXs, and
//! emits malfeasance proofs for punishable misbehavior.
//!
//! The embedding node wires concrete collaborators (fetcher, PoST verifier,
//! gossip publisher, beacon, voting engine) through the traits in
//! [`interfaces`] and drives the pipeline through [`handler::AtxHandler`].
//! Persistent state lives in [`store::Store`]; the hot per-epoch view the
//! voting engine reads lives in [`cache::AtxCache`].

pub mod cache;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod handler;
pub mod inflight;
pub mod interfaces;
pub mod store;
pub mod types;

pub use cache::{AtxCache, CacheEntry};
pub use config::{ContextualPolicy, NodeConfig};
pub use errors::{AtxError, AtxResult};
pub use handler::{AtxHandler, HandlerConfig};
pub use store::Store;
pub use types::{ActivationTx, AtxHeader, AtxId, MalfeasanceProof, NodeId, VerifiedAtx};
