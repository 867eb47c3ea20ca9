use std::collections::HashMap;

use async_trait::async_trait;
use log::trace;
use parking_lot::Mutex;
use tessera_model::{apply_operation, Block, BlockId, OperationError, Transforms};

use crate::{BlockSource, SourceError};

/// A read-through cache of unmodified blocks.
///
/// Only present blocks are memoized; a miss for an absent block falls
/// through to the source every time, so blocks created elsewhere become
/// visible without an explicit invalidation. Cached entries are treated as
/// immutable by readers; committed changes enter the cache through
/// [`CacheSource::transform_cache`] and invalidation through
/// [`CacheSource::clear`].
pub struct CacheSource<S> {
    source: S,
    cache: Mutex<HashMap<BlockId, Block>>,
}

impl<S: BlockSource> CacheSource<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Drop the cached copies of `block_ids`.
    pub fn clear<'a>(&self, block_ids: impl IntoIterator<Item = &'a BlockId>) {
        let mut cache = self.cache.lock();
        for block_id in block_ids {
            if cache.remove(block_id).is_some() {
                trace!("cache invalidated: {block_id}");
            }
        }
    }

    /// Apply committed `transforms` into the cache so subsequent reads see
    /// them without re-fetching.
    ///
    /// Updates touch only blocks already cached; inserts and deletes always
    /// take effect.
    pub fn transform_cache(&self, transforms: &Transforms) -> Result<(), OperationError> {
        let mut cache = self.cache.lock();
        for (block_id, block) in &transforms.inserts {
            cache.insert(block_id.clone(), block.clone());
        }
        for (block_id, ops) in &transforms.updates {
            if let Some(block) = cache.get_mut(block_id) {
                for op in ops {
                    apply_operation(block, op)?;
                }
            }
        }
        for block_id in &transforms.deletes {
            cache.remove(block_id);
        }
        Ok(())
    }

    #[cfg(test)]
    fn cached(&self, block_id: &BlockId) -> Option<Block> {
        self.cache.lock().get(block_id).cloned()
    }
}

#[async_trait]
impl<S: BlockSource> BlockSource for CacheSource<S> {
    async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>, SourceError> {
        if let Some(block) = self.cache.lock().get(block_id) {
            return Ok(Some(block.clone()));
        }
        let fetched = self.source.try_get(block_id).await?;
        if let Some(block) = &fetched {
            self.cache.lock().insert(block_id.clone(), block.clone());
        }
        Ok(fetched)
    }
}
