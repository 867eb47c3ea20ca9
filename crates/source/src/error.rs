use tessera_model::{OperationError, TransactorError};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Transactor(#[from] TransactorError),
}
