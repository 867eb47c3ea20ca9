use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tessera_model::{
    apply_transform, block_ids_for_transforms, transform_for_block_id, Block, BlockHeader,
    BlockId, BlockOperation, BlockType, CollectionId, Transform, Transforms,
};

use crate::{BlockSource, BlockStore, SourceError};

/// Stages mutations against a backing source.
///
/// Reads through the tracker see the staged changes merged over the source.
/// The staged [`Transforms`] are exclusively owned: other components observe
/// them only through [`Tracker::reset`], which atomically swaps in an empty
/// set and hands the prior one over.
pub struct Tracker<S> {
    source: S,
    collection_id: CollectionId,
    transforms: Mutex<Transforms>,
}

impl<S: BlockSource> Tracker<S> {
    pub fn new(source: S, collection_id: CollectionId) -> Self {
        Self::with_transforms(source, collection_id, Transforms::new())
    }

    /// A tracker pre-seeded with `transforms`, as used for trial staging
    /// during a sync round.
    pub fn with_transforms(source: S, collection_id: CollectionId, transforms: Transforms) -> Self {
        Self {
            source,
            collection_id,
            transforms: Mutex::new(transforms),
        }
    }

    pub fn collection_id(&self) -> &CollectionId {
        &self.collection_id
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// A snapshot of the currently staged transforms.
    pub fn transforms(&self) -> Transforms {
        self.transforms.lock().clone()
    }

    pub fn has_changes(&self) -> bool {
        !self.transforms.lock().is_empty()
    }

    /// The ids of every block this tracker has staged changes for.
    pub fn transformed_block_ids(&self) -> BTreeSet<BlockId> {
        block_ids_for_transforms(&self.transforms.lock())
    }

    /// Which of `remote` (remotely-modified ids) this tracker also touches.
    pub fn conflicts(&self, remote: &BTreeSet<BlockId>) -> Vec<BlockId> {
        let transforms = self.transforms.lock();
        let local = block_ids_for_transforms(&transforms);
        local.intersection(remote).cloned().collect()
    }

    /// Swap the staged transforms for an empty set, returning the prior one.
    ///
    /// Used both to discard staged work and to harvest it for downstream
    /// propagation.
    pub fn reset(&self) -> Transforms {
        std::mem::take(&mut *self.transforms.lock())
    }

    /// Merge `incoming` into the staged transforms as one atomic write.
    ///
    /// Replays with staging semantics rather than field-wise union, so a
    /// delete retracts a staged insert and an insert revives a staged
    /// delete.
    pub fn apply(&self, incoming: Transforms) {
        let mut transforms = self.transforms.lock();
        for block_id in incoming.deletes {
            stage_delete(&mut transforms, block_id);
        }
        for (_, block) in incoming.inserts {
            stage_insert(&mut transforms, block);
        }
        for (block_id, ops) in incoming.updates {
            transforms.updates.entry(block_id).or_default().extend(ops);
        }
    }

    /// Begin an all-or-nothing staging area over this tracker.
    pub fn atomic(&self) -> Atomic<'_, S> {
        Atomic {
            tracker: self,
            staged: Mutex::new(Transforms::new()),
        }
    }
}

fn stage_insert(transforms: &mut Transforms, block: Block) {
    let block_id = block.id().clone();
    transforms.deletes.remove(&block_id);
    transforms.inserts.insert(block_id, block);
}

fn stage_update(transforms: &mut Transforms, block_id: BlockId, op: BlockOperation) {
    transforms.updates.entry(block_id).or_default().push(op);
}

fn stage_delete(transforms: &mut Transforms, block_id: BlockId) {
    let had_insert = transforms.inserts.remove(&block_id).is_some();
    transforms.updates.remove(&block_id);
    if !had_insert {
        transforms.deletes.insert(block_id);
    }
}

/// Read `block_id` through `source` with `overlay` applied on top.
async fn resolve<S: BlockSource>(
    source: &S,
    block_id: &BlockId,
    overlay: Transform,
) -> Result<Option<Block>, SourceError> {
    if overlay.delete {
        return Ok(None);
    }
    let base = match overlay.insert {
        Some(_) => None,
        None if overlay.updates.is_empty() => return source.try_get(block_id).await,
        None => source.try_get(block_id).await?,
    };
    Ok(apply_transform(base, &overlay)?)
}

#[async_trait]
impl<S: BlockSource> BlockSource for Tracker<S> {
    async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>, SourceError> {
        let overlay = transform_for_block_id(&self.transforms.lock(), block_id);
        resolve(&self.source, block_id, overlay).await
    }
}

#[async_trait]
impl<S: BlockSource> BlockStore for Tracker<S> {
    fn insert(&self, block: Block) {
        stage_insert(&mut self.transforms.lock(), block);
    }

    fn update(&self, block_id: BlockId, op: BlockOperation) {
        stage_update(&mut self.transforms.lock(), block_id, op);
    }

    fn delete(&self, block_id: BlockId) {
        stage_delete(&mut self.transforms.lock(), block_id);
    }

    fn generate_id(&self) -> BlockId {
        BlockId::random()
    }

    fn create_block_header(&self, block_type: BlockType, id: Option<BlockId>) -> BlockHeader {
        BlockHeader {
            id: id.unwrap_or_else(BlockId::random),
            block_type,
            collection_id: self.collection_id.clone(),
        }
    }
}

/// A staging area whose changes land in the parent tracker all at once on
/// [`Atomic::commit`], or not at all when dropped.
pub struct Atomic<'t, S> {
    tracker: &'t Tracker<S>,
    staged: Mutex<Transforms>,
}

impl<S: BlockSource> Atomic<'_, S> {
    /// Apply everything staged here to the parent tracker in one atomic
    /// write.
    pub fn commit(self) {
        self.tracker.apply(self.staged.into_inner());
    }
}

#[async_trait]
impl<S: BlockSource> BlockSource for Atomic<'_, S> {
    async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>, SourceError> {
        let overlay = transform_for_block_id(&self.staged.lock(), block_id);
        resolve(&self.tracker, block_id, overlay).await
    }
}

#[async_trait]
impl<S: BlockSource> BlockStore for Atomic<'_, S> {
    fn insert(&self, block: Block) {
        stage_insert(&mut self.staged.lock(), block);
    }

    fn update(&self, block_id: BlockId, op: BlockOperation) {
        stage_update(&mut self.staged.lock(), block_id, op);
    }

    fn delete(&self, block_id: BlockId) {
        stage_delete(&mut self.staged.lock(), block_id);
    }

    fn generate_id(&self) -> BlockId {
        self.tracker.generate_id()
    }

    fn create_block_header(&self, block_type: BlockType, id: Option<BlockId>) -> BlockHeader {
        self.tracker.create_block_header(block_type, id)
    }
}
