use std::io;

use tessera_model::{BlockId, OperationError, TransactorError, TrxId};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("stored document is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("block {0} not found")]
    BlockNotFound(BlockId),
    #[error("no pending transaction {trx_id} on block {block_id}")]
    MissingPending { block_id: BlockId, trx_id: TrxId },
    #[error("corrupt storage at {path}: {detail}")]
    Corrupt { path: String, detail: String },
    #[error("restore of block {block_id} failed: {detail}")]
    Restore { block_id: BlockId, detail: String },
}

impl StorageError {
    pub(crate) fn corrupt(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

impl From<StorageError> for TransactorError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(e) => Self::Io(e),
            StorageError::BlockNotFound(block_id) => Self::BlockNotFound(block_id),
            StorageError::MissingPending { block_id, trx_id } => {
                Self::MissingPending { block_id, trx_id }
            }
            other => Self::Other(other.into()),
        }
    }
}
