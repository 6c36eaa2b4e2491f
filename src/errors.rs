use std::io;

use thiserror::Error;

use crate::types::{AtxId, Epoch, NodeId};

/// Crate-wide error type. Cloneable so the in-flight deduplicator can hand
/// one processing outcome to every concurrent waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AtxError {
    #[error("malformed atx: {0}")]
    Malformed(String),
    #[error("atx hash mismatch: expected {expected}, got {actual}")]
    WrongHash { expected: String, actual: String },
    #[error("known atx {0}")]
    Known(AtxId),
    #[error("syntactically invalid atx: {0}")]
    Invalid(String),
    #[error("contextually invalid atx: {0}")]
    Contextual(String),
    #[error("malicious atx")]
    Malicious,
    #[error("identity {0} already published an atx in epoch {1}")]
    SelfEquivocation(NodeId, Epoch),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl AtxError {
    /// Errors in this subset cause the transport layer to penalize the
    /// sending peer. Everything else is either locally recovered or treated
    /// as transient.
    pub fn is_reject(&self) -> bool {
        matches!(
            self,
            AtxError::Malformed(_) | AtxError::WrongHash { .. } | AtxError::Invalid(_)
        )
    }
}

impl From<rocksdb::Error> for AtxError {
    fn from(err: rocksdb::Error) -> Self {
        AtxError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for AtxError {
    fn from(err: bincode::Error) -> Self {
        AtxError::Serialization(err.to_string())
    }
}

impl From<io::Error> for AtxError {
    fn from(err: io::Error) -> Self {
        AtxError::Io(err.to_string())
    }
}

pub type AtxResult<T> = Result<T, AtxError>;
