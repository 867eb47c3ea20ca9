use std::io;

use tessera_model::{BlockId, TransactorError};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("deadline exceeded")]
    Expired,
    #[error("no usable coordinator for block {0}")]
    CoordinatorNone(BlockId),
    #[error("consensus failed: {0}")]
    ConsensusFailed(String),
    #[error("record signature invalid")]
    SignatureInvalid,
    #[error("record hash does not bind its message and peers")]
    HashMismatch,
    #[error("records disagree on non-signature fields")]
    MergeMismatch,
    #[error("peer {0} is unreachable: {1}")]
    Unreachable(tessera_model::PeerId, String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("wire document is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Transactor(#[from] TransactorError),
}

impl From<ClusterError> for TransactorError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Expired => Self::Expired,
            ClusterError::CoordinatorNone(block_id) => Self::CoordinatorNone(block_id),
            ClusterError::ConsensusFailed(reason) => Self::ConsensusFailed(reason),
            ClusterError::SignatureInvalid => Self::SignatureInvalid,
            ClusterError::Io(e) => Self::Io(e),
            ClusterError::Transactor(e) => e,
            other => Self::Protocol(other.to_string()),
        }
    }
}
