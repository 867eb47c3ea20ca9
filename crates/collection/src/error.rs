use tessera_chain::ChainError;
use tessera_model::{OperationError, TransactorError};
use tessera_source::SourceError;

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("no handler registered for action type `{0}`")]
    UnknownAction(String),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Transactor(#[from] TransactorError),
    #[error("action handler failed: {0}")]
    Handler(String),
}
