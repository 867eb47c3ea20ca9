use tessera_model::{BlockId, OperationError};
use tessera_source::SourceError;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("entry (de)serialization failed")]
    Entry(#[from] serde_json::Error),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("block {block_id} is not a usable chain block: {detail}")]
    Corrupt { block_id: BlockId, detail: String },
    #[error("chain block {0} not found")]
    BlockMissing(BlockId),
    #[error("prior-hash mismatch at block {block_id}")]
    PriorHashMismatch { block_id: BlockId },
}

impl ChainError {
    pub(crate) fn corrupt(block_id: &BlockId, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            block_id: block_id.clone(),
            detail: detail.into(),
        }
    }
}
