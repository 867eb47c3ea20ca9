//! The shared data model of tessera: opaque identifiers, JSON-attribute
//! blocks, splice-style block operations, per-block and aggregate transforms,
//! transaction contexts, and the [`Transactor`] trait every storage backend
//! implements.

mod block;
mod context;
pub mod hash;
mod ids;
mod ops;
mod transform;
mod transactor;

pub use block::{Block, BlockHeader, BlockType};
pub use context::{Rev, TrxContext, TrxRev};
pub use ids::{BlockId, CollectionId, PeerId, TrxId};
pub use ops::{apply_operation, with_operation, BlockOperation, OperationError};
pub use transform::{
    apply_transform, block_ids_for_transforms, merge_transforms, transform_for_block_id,
    transforms_from_transform, Transform, Transforms,
};
pub use transactor::{
    BlockGetResult, BlockState, CancelRequest, CommitOutcome, CommitRequest, CommitSuccess, Flag,
    GetRequest, GetResponse, MessageOptions, MissingTrx, PendOutcome, PendPolicy, PendRequest,
    PendSuccess, PendingTrx, StaleFailure, Transactor, TransactorError,
};
