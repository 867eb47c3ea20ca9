use std::{marker::PhantomData, sync::Arc};

use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tessera_model::{
    apply_operation, hash::hash_bytes, Block, BlockId, BlockOperation, BlockType,
};
use tessera_source::{BlockSource, BlockStore, Tracker};

use crate::{
    blocks::{
        entries_array, new_data_block, new_header_block, opt_id, req_id, DEFAULT_ENTRIES_PER_BLOCK,
        ENTRIES, HEAD_ID, NEXT_ID, PRIOR_HASH, PRIOR_ID, TAIL_ID,
    },
    ChainError,
};

/// Configuration of a [`Chain`].
#[derive(Clone, Debug)]
pub struct ChainOptions {
    /// Maximum number of entries per data block.
    pub entries_per_block: usize,
    /// Block type of the header block, when the chain creates it itself.
    pub header_type: BlockType,
    /// Block type of data blocks.
    pub data_type: BlockType,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            entries_per_block: DEFAULT_ENTRIES_PER_BLOCK,
            header_type: BlockType::new("chainHeader"),
            data_type: BlockType::new("chainData"),
        }
    }
}

/// Identifies one entry position: a data block and an index into its
/// `entries`. Paths are stable as long as the entry is not removed, and can
/// restart an iteration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Path {
    pub block_id: BlockId,
    pub index: usize,
}

/// The shape of a planned append: which tail it lands in and which new data
/// blocks it will allocate. Computing the plan before staging lets callers
/// embed the touched block ids inside the appended entries themselves.
#[derive(Clone, Debug)]
pub struct AddPlan {
    pub(crate) tail_id: BlockId,
    pub(crate) tail_len: usize,
    pub(crate) new_block_ids: Vec<BlockId>,
}

/// Called when a rotation allocates a new tail data block: `(prior, new)`
/// where `prior` is the predecessor in its final state and `new` may be
/// amended before it is staged.
pub type BlockAddedHook = Box<dyn Fn(&Block, &mut Block) + Send + Sync>;

/// A doubly-linked list of fixed-capacity entry blocks.
///
/// All blocks live in the underlying tracker; each mutating operation runs
/// under one [`tessera_source::Atomic`] and commits together. Concurrent
/// writers must serialize at a higher layer; the collection does so with
/// its sync latch.
pub struct Chain<S, E> {
    tracker: Arc<Tracker<S>>,
    header_id: BlockId,
    options: ChainOptions,
    block_added: Option<BlockAddedHook>,
    _entry: PhantomData<fn() -> E>,
}

impl<S, E> Chain<S, E>
where
    S: BlockSource,
    E: Serialize + DeserializeOwned,
{
    /// Open the chain under `header_id`, creating it if necessary.
    ///
    /// Three starting states are handled:
    /// - no header block: header and one empty data block are staged;
    /// - a header block with null `headId`/`tailId` (synthesized by a
    ///   collection initializer): the pointers are filled in;
    /// - an intact header: nothing is written.
    pub async fn create_or_open(
        tracker: Arc<Tracker<S>>,
        header_id: BlockId,
        options: ChainOptions,
    ) -> Result<Chain<S, E>, ChainError> {
        let chain = Chain {
            tracker,
            header_id,
            options,
            block_added: None,
            _entry: PhantomData,
        };
        chain.ensure_initialized().await?;
        Ok(chain)
    }

    /// Install a hook invoked whenever a rotation allocates a new data
    /// block. The log uses this to stamp prior-hash back-links.
    pub fn with_block_added(mut self, hook: BlockAddedHook) -> Self {
        self.block_added = Some(hook);
        self
    }

    pub fn header_id(&self) -> &BlockId {
        &self.header_id
    }

    pub fn options(&self) -> &ChainOptions {
        &self.options
    }

    async fn ensure_initialized(&self) -> Result<(), ChainError> {
        match self.tracker.try_get(&self.header_id).await? {
            Some(header) => {
                if opt_id(&header, HEAD_ID)?.is_some() {
                    return Ok(());
                }
                // Header synthesized elsewhere with placeholder pointers.
                debug!("initializing chain under existing header {}", self.header_id);
                let atomic = self.tracker.atomic();
                let data_id = atomic.generate_id();
                let data_header =
                    atomic.create_block_header(self.options.data_type.clone(), Some(data_id.clone()));
                atomic.insert(new_data_block(data_header, Vec::new(), None));
                atomic.update(
                    self.header_id.clone(),
                    BlockOperation::assign(HEAD_ID, json!(data_id.as_str())),
                );
                atomic.update(
                    self.header_id.clone(),
                    BlockOperation::assign(TAIL_ID, json!(data_id.as_str())),
                );
                atomic.commit();
                Ok(())
            }
            None => {
                debug!("starting fresh chain {}", self.header_id);
                let atomic = self.tracker.atomic();
                let data_id = atomic.generate_id();
                let data_header =
                    atomic.create_block_header(self.options.data_type.clone(), Some(data_id.clone()));
                atomic.insert(new_data_block(data_header, Vec::new(), None));
                let header = atomic
                    .create_block_header(self.options.header_type.clone(), Some(self.header_id.clone()));
                atomic.insert(new_header_block(header, &data_id));
                atomic.commit();
                Ok(())
            }
        }
    }

    async fn header(&self) -> Result<Block, ChainError> {
        self.tracker
            .try_get(&self.header_id)
            .await?
            .ok_or_else(|| ChainError::BlockMissing(self.header_id.clone()))
    }

    async fn data_block(&self, block_id: &BlockId) -> Result<Block, ChainError> {
        self.tracker
            .try_get(block_id)
            .await?
            .ok_or_else(|| ChainError::BlockMissing(block_id.clone()))
    }

    pub async fn head_id(&self) -> Result<BlockId, ChainError> {
        req_id(&self.header().await?, HEAD_ID)
    }

    pub async fn tail_id(&self) -> Result<BlockId, ChainError> {
        req_id(&self.header().await?, TAIL_ID)
    }

    /// The path of the newest entry, or `None` for an empty chain.
    pub async fn tail_path(&self) -> Result<Option<Path>, ChainError> {
        let tail_id = self.tail_id().await?;
        let tail = self.data_block(&tail_id).await?;
        let len = entries_array(&tail)?.len();
        Ok((len > 0).then(|| Path {
            block_id: tail_id,
            index: len - 1,
        }))
    }

    /// Plan an append of `count` entries without staging anything.
    pub async fn plan_add(&self, count: usize) -> Result<AddPlan, ChainError> {
        let tail_id = self.tail_id().await?;
        let tail = self.data_block(&tail_id).await?;
        let tail_len = entries_array(&tail)?.len();
        let cap = self.options.entries_per_block;

        let fill = count.min(cap.saturating_sub(tail_len));
        let mut remaining = count - fill;
        let mut new_block_ids = Vec::new();
        while remaining > 0 {
            new_block_ids.push(self.tracker.generate_id());
            remaining -= remaining.min(cap);
        }
        Ok(AddPlan {
            tail_id,
            tail_len,
            new_block_ids,
        })
    }

    /// Every block a planned append will touch: the chain header, the
    /// current tail, and any data blocks the append allocates.
    pub fn planned_block_ids(&self, plan: &AddPlan) -> Vec<BlockId> {
        let mut ids = vec![self.header_id.clone(), plan.tail_id.clone()];
        ids.extend(plan.new_block_ids.iter().cloned());
        ids
    }

    /// Append `entries`, filling the current tail and rotating into freshly
    /// allocated data blocks as needed. Returns the path of the last entry
    /// appended.
    pub async fn add(&self, entries: Vec<E>) -> Result<Path, ChainError> {
        let plan = self.plan_add(entries.len()).await?;
        self.add_with_plan(&plan, entries).await
    }

    /// Execute a previously computed [`AddPlan`]. The chain must not have
    /// been mutated since the plan was taken.
    pub async fn add_with_plan(&self, plan: &AddPlan, entries: Vec<E>) -> Result<Path, ChainError> {
        let cap = self.options.entries_per_block;
        let values = entries
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;

        let mut tail = self.data_block(&plan.tail_id).await?;
        let mut last_path = Path {
            block_id: plan.tail_id.clone(),
            index: plan.tail_len.saturating_sub(1),
        };

        let atomic = self.tracker.atomic();
        let fill = values.len().min(cap.saturating_sub(plan.tail_len));
        if fill > 0 {
            let op = BlockOperation::splice(ENTRIES, plan.tail_len, 0, values[..fill].to_vec());
            apply_operation(&mut tail, &op)?;
            atomic.update(plan.tail_id.clone(), op);
            last_path = Path {
                block_id: plan.tail_id.clone(),
                index: plan.tail_len + fill - 1,
            };
        }

        // Rotate. `prior` mirrors the staged state of the predecessor so the
        // block-added hook sees it exactly as a later reader will.
        let mut prior = tail;
        let mut prior_id = plan.tail_id.clone();
        let mut offset = fill;
        for new_id in &plan.new_block_ids {
            let chunk_end = (offset + cap).min(values.len());
            let chunk = values[offset..chunk_end].to_vec();

            let op = BlockOperation::assign(NEXT_ID, json!(new_id.as_str()));
            apply_operation(&mut prior, &op)?;
            atomic.update(prior_id.clone(), op);

            let data_header =
                atomic.create_block_header(self.options.data_type.clone(), Some(new_id.clone()));
            let mut block = new_data_block(data_header, chunk.clone(), Some(&prior_id));
            if let Some(hook) = &self.block_added {
                hook(&prior, &mut block);
            }
            atomic.insert(block.clone());

            last_path = Path {
                block_id: new_id.clone(),
                index: chunk.len() - 1,
            };
            prior = block;
            prior_id = new_id.clone();
            offset = chunk_end;
        }

        // The tail pointer is (re)asserted on every append, whether or not
        // it moved.
        atomic.update(
            self.header_id.clone(),
            BlockOperation::assign(TAIL_ID, json!(prior_id.as_str())),
        );
        atomic.commit();
        Ok(last_path)
    }

    /// Remove up to `count` entries from the tail, deleting and unlinking
    /// emptied data blocks. Returns the removed entries in chain order.
    pub async fn pop(&self, count: usize) -> Result<Vec<E>, ChainError> {
        let head_id = self.head_id().await?;
        let mut block_id = self.tail_id().await?;
        let mut removed: Vec<Value> = Vec::new();
        let mut deleted_successor = false;
        let atomic = self.tracker.atomic();

        let new_tail_id = loop {
            let block = self.data_block(&block_id).await?;
            let entries = entries_array(&block)?;
            let take = entries.len().min(count - removed.len());
            let keep = entries.len() - take;
            let mut taken = entries[keep..].to_vec();
            taken.extend(removed);
            removed = taken;

            if keep == 0 && block_id != head_id {
                atomic.delete(block_id.clone());
                deleted_successor = true;
                let prior_id = opt_id(&block, PRIOR_ID)?
                    .ok_or_else(|| ChainError::corrupt(&block_id, "tail block without prior"))?;
                if removed.len() == count {
                    atomic.update(prior_id.clone(), BlockOperation::assign(NEXT_ID, Value::Null));
                    break prior_id;
                }
                block_id = prior_id;
            } else {
                if take > 0 {
                    atomic.update(
                        block_id.clone(),
                        BlockOperation::splice(ENTRIES, keep, take, Vec::new()),
                    );
                }
                if deleted_successor {
                    atomic.update(block_id.clone(), BlockOperation::assign(NEXT_ID, Value::Null));
                }
                break block_id;
            }
        };

        atomic.update(
            self.header_id.clone(),
            BlockOperation::assign(TAIL_ID, json!(new_tail_id.as_str())),
        );
        atomic.commit();

        removed
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(Into::into))
            .collect()
    }

    /// Remove up to `count` entries from the head, deleting and unlinking
    /// emptied data blocks. Returns the removed entries in chain order.
    pub async fn dequeue(&self, count: usize) -> Result<Vec<E>, ChainError> {
        let tail_id = self.tail_id().await?;
        let mut block_id = self.head_id().await?;
        let mut removed: Vec<Value> = Vec::new();
        let mut deleted_predecessor = false;
        let atomic = self.tracker.atomic();

        let new_head_id = loop {
            let block = self.data_block(&block_id).await?;
            let entries = entries_array(&block)?;
            let take = entries.len().min(count - removed.len());
            removed.extend(entries[..take].iter().cloned());

            if take == entries.len() && block_id != tail_id {
                atomic.delete(block_id.clone());
                deleted_predecessor = true;
                let next_id = opt_id(&block, NEXT_ID)?
                    .ok_or_else(|| ChainError::corrupt(&block_id, "head block without next"))?;
                block_id = next_id;
                if removed.len() == count {
                    atomic.update(block_id.clone(), BlockOperation::assign(PRIOR_ID, Value::Null));
                    atomic.update(block_id.clone(), BlockOperation::assign(PRIOR_HASH, Value::Null));
                    break block_id;
                }
            } else {
                if take > 0 {
                    atomic.update(
                        block_id.clone(),
                        BlockOperation::splice(ENTRIES, 0, take, Vec::new()),
                    );
                }
                if deleted_predecessor {
                    atomic.update(block_id.clone(), BlockOperation::assign(PRIOR_ID, Value::Null));
                    atomic.update(block_id.clone(), BlockOperation::assign(PRIOR_HASH, Value::Null));
                }
                break block_id;
            }
        };

        atomic.update(
            self.header_id.clone(),
            BlockOperation::assign(HEAD_ID, json!(new_head_id.as_str())),
        );
        atomic.commit();

        removed
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(Into::into))
            .collect()
    }

    /// A lazy, restartable cursor over the chain's entries.
    ///
    /// Starts at `starting` (inclusive) when given; otherwise at the head,
    /// or at the tail when `reverse`.
    pub async fn select(
        &self,
        starting: Option<Path>,
        reverse: bool,
    ) -> Result<ChainCursor<S, E>, ChainError> {
        let state = match starting {
            Some(path) => {
                let block = self.data_block(&path.block_id).await?;
                let len = entries_array(&block)?.len();
                if path.index >= len {
                    return Err(ChainError::corrupt(
                        &path.block_id,
                        format!("path index {} out of range {len}", path.index),
                    ));
                }
                Some(CursorBlock::at(block, path.index, reverse)?)
            }
            None => {
                let block_id = if reverse {
                    self.tail_id().await?
                } else {
                    self.head_id().await?
                };
                let block = self.data_block(&block_id).await?;
                Some(CursorBlock::whole(block, reverse)?)
            }
        };
        Ok(ChainCursor {
            tracker: Arc::clone(&self.tracker),
            state,
            reverse,
            _entry: PhantomData,
        })
    }

    /// Walk head → tail recomputing each predecessor's serialization hash
    /// and comparing it to its successor's back-link.
    pub async fn verify_back_links(&self) -> Result<(), ChainError> {
        let mut current = Some(self.head_id().await?);
        let mut prior: Option<Block> = None;
        while let Some(block_id) = current {
            let block = self.data_block(&block_id).await?;
            let stored = crate::blocks::opt_string(&block, PRIOR_HASH)?;
            match &prior {
                Some(prior_block) => {
                    let expected = hash_bytes(serde_json::to_vec(prior_block)?).to_base64url();
                    if stored.as_deref() != Some(expected.as_str()) {
                        return Err(ChainError::PriorHashMismatch { block_id });
                    }
                }
                None => {
                    if stored.is_some() {
                        return Err(ChainError::PriorHashMismatch { block_id });
                    }
                }
            }
            current = opt_id(&block, NEXT_ID)?;
            prior = Some(block);
        }
        Ok(())
    }
}

struct CursorBlock {
    block_id: BlockId,
    entries: Vec<Value>,
    prior_id: Option<BlockId>,
    next_id: Option<BlockId>,
    /// Forward: next index to yield. Reverse: count of entries still to
    /// yield (the next one is `pos - 1`).
    pos: usize,
}

impl CursorBlock {
    fn whole(block: Block, reverse: bool) -> Result<Self, ChainError> {
        let len = entries_array(&block)?.len();
        Self::new(block, if reverse { len } else { 0 })
    }

    fn at(block: Block, index: usize, reverse: bool) -> Result<Self, ChainError> {
        Self::new(block, if reverse { index + 1 } else { index })
    }

    fn new(block: Block, pos: usize) -> Result<Self, ChainError> {
        Ok(Self {
            block_id: block.id().clone(),
            entries: entries_array(&block)?.clone(),
            prior_id: opt_id(&block, PRIOR_ID)?,
            next_id: opt_id(&block, NEXT_ID)?,
            pos,
        })
    }
}

/// See [`Chain::select`]. The cursor holds its own handle on the tracker,
/// so it outlives the chain that produced it.
pub struct ChainCursor<S, E> {
    tracker: Arc<Tracker<S>>,
    state: Option<CursorBlock>,
    reverse: bool,
    _entry: PhantomData<fn() -> E>,
}

impl<S, E> ChainCursor<S, E>
where
    S: BlockSource,
    E: Serialize + DeserializeOwned,
{
    async fn load(&self, block_id: &BlockId) -> Result<Block, ChainError> {
        self.tracker
            .try_get(block_id)
            .await?
            .ok_or_else(|| ChainError::BlockMissing(block_id.clone()))
    }

    /// The next entry and its path, or `None` once the chain is exhausted.
    pub async fn next_entry(&mut self) -> Result<Option<(Path, E)>, ChainError> {
        loop {
            let Some(state) = &mut self.state else {
                return Ok(None);
            };
            if self.reverse {
                if state.pos > 0 {
                    state.pos -= 1;
                    let path = Path {
                        block_id: state.block_id.clone(),
                        index: state.pos,
                    };
                    let entry = serde_json::from_value(state.entries[state.pos].clone())?;
                    return Ok(Some((path, entry)));
                }
                self.state = match state.prior_id.clone() {
                    Some(prior_id) => {
                        let block = self.load(&prior_id).await?;
                        Some(CursorBlock::whole(block, true)?)
                    }
                    None => None,
                };
            } else {
                if state.pos < state.entries.len() {
                    let path = Path {
                        block_id: state.block_id.clone(),
                        index: state.pos,
                    };
                    let entry = serde_json::from_value(state.entries[state.pos].clone())?;
                    state.pos += 1;
                    return Ok(Some((path, entry)));
                }
                self.state = match state.next_id.clone() {
                    Some(next_id) => {
                        let block = self.load(&next_id).await?;
                        Some(CursorBlock::whole(block, false)?)
                    }
                    None => None,
                };
            }
        }
    }

    /// Drain the remaining entries into a vector.
    pub async fn collect_entries(mut self) -> Result<Vec<E>, ChainError> {
        let mut out = Vec::new();
        while let Some((_, entry)) = self.next_entry().await? {
            out.push(entry);
        }
        Ok(out)
    }
}
