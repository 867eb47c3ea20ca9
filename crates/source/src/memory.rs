//! In-memory [`BlockSource`] for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tessera_model::{Block, BlockId};

use crate::{BlockSource, SourceError};

/// A block source over a plain map. Blocks put here play the role of the
/// "committed" state a tracker or cache layers over.
#[derive(Default)]
pub struct MemorySource {
    blocks: Mutex<HashMap<BlockId, Block>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, block: Block) {
        self.blocks.lock().insert(block.id().clone(), block);
    }

    pub fn remove(&self, block_id: &BlockId) {
        self.blocks.lock().remove(block_id);
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }
}

#[async_trait]
impl BlockSource for MemorySource {
    async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>, SourceError> {
        Ok(self.blocks.lock().get(block_id).cloned())
    }
}
