use std::sync::Arc;

use async_trait::async_trait;
use tessera_model::{Block, BlockHeader, BlockId, BlockOperation, BlockType};

use crate::SourceError;

/// Read access to blocks.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// The block under `block_id`, or `None` if it does not exist (or is
    /// deleted as of this source's view).
    async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>, SourceError>;
}

#[async_trait]
impl<S: BlockSource + ?Sized> BlockSource for Arc<S> {
    async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>, SourceError> {
        (**self).try_get(block_id).await
    }
}

#[async_trait]
impl<'a, S: BlockSource + ?Sized> BlockSource for &'a S {
    async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>, SourceError> {
        (**self).try_get(block_id).await
    }
}

/// Mutable access to blocks, as exposed to action handlers and the chain.
///
/// Mutations are staged synchronously in memory; only reads can suspend.
/// Implementations stage into a [`crate::Tracker`] (directly or through an
/// [`crate::Atomic`]), so nothing here touches durable state.
#[async_trait]
pub trait BlockStore: BlockSource {
    /// Stage a brand-new block. The block's header fixes its id and owning
    /// collection for good.
    fn insert(&self, block: Block);

    /// Stage an operation against `block_id`.
    fn update(&self, block_id: BlockId, op: BlockOperation);

    /// Stage the deletion of `block_id`.
    fn delete(&self, block_id: BlockId);

    /// A fresh block id.
    fn generate_id(&self) -> BlockId;

    /// A header for a new block of `block_type` in this store's collection,
    /// with the given id or a fresh one.
    fn create_block_header(&self, block_type: BlockType, id: Option<BlockId>) -> BlockHeader;
}

#[async_trait]
impl<S: BlockStore + ?Sized> BlockStore for Arc<S> {
    fn insert(&self, block: Block) {
        (**self).insert(block)
    }

    fn update(&self, block_id: BlockId, op: BlockOperation) {
        (**self).update(block_id, op)
    }

    fn delete(&self, block_id: BlockId) {
        (**self).delete(block_id)
    }

    fn generate_id(&self) -> BlockId {
        (**self).generate_id()
    }

    fn create_block_header(&self, block_type: BlockType, id: Option<BlockId>) -> BlockHeader {
        (**self).create_block_header(block_type, id)
    }
}
