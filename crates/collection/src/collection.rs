use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;
use tessera_chain::{ChainOptions, Log, LogCursor};
use tessera_model::{Block, BlockId, BlockType, CollectionId, Transactor, TrxId, TrxRev};
use tessera_source::{BlockSource, BlockStore, CacheSource, Tracker};

use crate::{
    action::{Action, ActionHandler, CollectionHeader, ConflictFilter},
    source::TransactorSource,
    CollectionError,
};

/// Per-collection tuning knobs.
#[derive(Clone, Debug)]
pub struct CollectionOptions {
    /// Capacity of each log chain data block.
    pub entries_per_block: usize,
    /// Block type of log data blocks.
    pub log_data_type: BlockType,
    /// Back-off before retrying a sync that was blocked by a concurrent
    /// pending transaction.
    pub pending_retry_delay_ms: u64,
    /// Deadline applied to each outbound transactor call.
    pub default_expiration_ms: u64,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            entries_per_block: tessera_chain::DEFAULT_ENTRIES_PER_BLOCK,
            log_data_type: BlockType::new("logData"),
            pending_retry_delay_ms: 100,
            default_expiration_ms: 30_000,
        }
    }
}

/// What it takes to open (or create) a collection: how to synthesize its
/// header, which handlers serve its action types, and how conflicts with
/// remote history are resolved.
pub struct CollectionInit {
    pub header: Arc<dyn CollectionHeader>,
    pub handlers: HashMap<String, Arc<dyn ActionHandler>>,
    pub filter_conflict: Option<Arc<dyn ConflictFilter>>,
}

type Cache<T> = Arc<CacheSource<Arc<TransactorSource<T>>>>;

/// A collection: blocks under one transactional boundary, an append-only
/// action log, and the act → update → sync loop that keeps local work and
/// cluster state converging.
///
/// Ownership is a strict chain: the collection owns one
/// [`TransactorSource`], a [`CacheSource`] over it, a [`Tracker`] over the
/// cache, and the queue of pending actions. All are dropped together.
pub struct Collection<T: Transactor> {
    id: CollectionId,
    init: CollectionInit,
    options: CollectionOptions,
    transactor: Arc<T>,
    source: Arc<TransactorSource<T>>,
    cache: Cache<T>,
    tracker: Arc<Tracker<Cache<T>>>,
    pending: Mutex<Vec<Action>>,
}

impl<T: Transactor> Collection<T> {
    /// Open the collection `id` against `transactor`, creating its header
    /// and log when they do not exist yet.
    ///
    /// For a brand-new collection the transaction context stays unset until
    /// the first successful sync; that is the signal to send the header id
    /// along with the first commit.
    pub async fn create_or_open(
        transactor: Arc<T>,
        id: CollectionId,
        init: CollectionInit,
        options: CollectionOptions,
    ) -> Result<Collection<T>, CollectionError> {
        let source = Arc::new(TransactorSource::new(
            Arc::clone(&transactor),
            id.clone(),
            options.default_expiration_ms,
        ));
        let cache = Arc::new(CacheSource::new(Arc::clone(&source)));
        let tracker = Arc::new(Tracker::new(Arc::clone(&cache), id.clone()));
        let collection = Collection {
            id: id.clone(),
            init,
            options,
            transactor,
            source,
            cache,
            tracker,
            pending: Mutex::new(Vec::new()),
        };

        let header_id = id.header_block_id();
        match collection.tracker.try_get(&header_id).await? {
            Some(_) => {
                let log = collection.live_log().await?;
                let context = log.get_trx_context().await?;
                debug!("opened collection {id} at rev {}", context.rev);
                collection.source.set_trx_context(Some(context));
            }
            None => {
                debug!("creating collection {id}");
                {
                    let atomic = collection.tracker.atomic();
                    let header = collection.init.header.create_header_block(&id, &atomic);
                    atomic.insert(header);
                    atomic.commit();
                }
                // Stages the log's first data block and chain pointers.
                collection.live_log().await?;
            }
        }
        Ok(collection)
    }

    pub fn id(&self) -> &CollectionId {
        &self.id
    }

    /// The collection's current transaction context, if it has synced or
    /// opened existing state.
    pub fn trx_context(&self) -> Option<tessera_model::TrxContext> {
        self.source.trx_context()
    }

    /// Number of actions applied locally but not yet synced.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Read a block through the collection's tracker: staged changes merged
    /// over cached committed state.
    pub async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>, CollectionError> {
        Ok(self.tracker.try_get(block_id).await?)
    }

    fn chain_options(&self) -> ChainOptions {
        ChainOptions {
            entries_per_block: self.options.entries_per_block,
            header_type: BlockType::new("logHeader"),
            data_type: self.options.log_data_type.clone(),
        }
    }

    async fn live_log(&self) -> Result<Log<Cache<T>, Action>, CollectionError> {
        Ok(Log::create_or_open(
            Arc::clone(&self.tracker),
            self.id.header_block_id(),
            self.chain_options(),
        )
        .await?)
    }

    /// Apply `actions` locally: each is dispatched to its registered
    /// handler, all mutations land atomically, and the actions queue as
    /// pending for the next sync.
    pub async fn act(&self, actions: &[Action]) -> Result<(), CollectionError> {
        self.apply_handlers(actions).await?;
        self.pending.lock().extend(actions.iter().cloned());
        Ok(())
    }

    async fn apply_handlers(&self, actions: &[Action]) -> Result<(), CollectionError> {
        let atomic = self.tracker.atomic();
        for action in actions {
            let handler = self
                .init
                .handlers
                .get(&action.action_type)
                .ok_or_else(|| CollectionError::UnknownAction(action.action_type.clone()))?;
            handler.handle(action, &atomic).await?;
        }
        atomic.commit();
        Ok(())
    }

    /// Absorb remote history: read the log past our context, filter pending
    /// actions through the conflict policy, invalidate touched cache
    /// entries, and replay local work when it collides with remote changes.
    pub async fn update(&self) -> Result<(), CollectionError> {
        // A fresh source with no context reads through to the tail.
        let fresh_source = Arc::new(TransactorSource::new(
            Arc::clone(&self.transactor),
            self.id.clone(),
            self.options.default_expiration_ms,
        ));
        let fresh_tracker = Arc::new(Tracker::new(fresh_source, self.id.clone()));
        let log: Log<_, Action> = Log::create_or_open(
            Arc::clone(&fresh_tracker),
            self.id.header_block_id(),
            self.chain_options(),
        )
        .await?;

        let start_rev = self.source.trx_context().map_or(0, |c| c.rev);
        let read = log.get_from(start_rev).await?;
        debug!(
            "update of {}: {} remote entries past rev {start_rev}",
            self.id,
            read.entries.len()
        );

        let mut any_conflicts = false;
        for entry in &read.entries {
            let Some(action_entry) = &entry.action else {
                continue;
            };

            if let Some(filter) = &self.init.filter_conflict {
                let snapshot: Vec<Action> = self.pending.lock().clone();
                let mut kept = Vec::new();
                let mut replacements = Vec::new();
                for pending in &snapshot {
                    match filter.filter(pending, &action_entry.actions) {
                        Some(action) if action == *pending => kept.push(action),
                        Some(replacement) => replacements.push(replacement),
                        None => debug!("pending action dropped by conflict filter"),
                    }
                }
                *self.pending.lock() = kept;
                if !replacements.is_empty() {
                    // Replacements go back through the normal handler path.
                    self.act(&replacements).await?;
                }
            }

            self.cache.clear(action_entry.block_ids.iter());
            let remote: BTreeSet<BlockId> = action_entry.block_ids.iter().cloned().collect();
            if !self.tracker.conflicts(&remote).is_empty() {
                any_conflicts = true;
            }
        }

        if any_conflicts {
            info!("remote changes collide with local work; replaying");
            self.replay_actions().await?;
        }
        // An unset context on a never-synced collection is the signal that
        // the header still needs committing; an empty remote log must not
        // erase it.
        if read.context.rev > 0 || self.source.trx_context().is_some() {
            self.source.set_trx_context(Some(read.context));
        }
        Ok(())
    }

    /// Rebuild the tracker's staged state from the pending queue: reset,
    /// then run every pending action through its handler again, picking up
    /// work admitted while the replay itself runs.
    async fn replay_actions(&self) -> Result<(), CollectionError> {
        self.tracker.reset();
        let mut replayed = 0;
        loop {
            let snapshot: Vec<Action> = {
                let pending = self.pending.lock();
                if replayed >= pending.len() {
                    break;
                }
                pending[replayed..].to_vec()
            };
            replayed += snapshot.len();
            self.apply_handlers(&snapshot).await?;
        }
        Ok(())
    }

    /// Push local changes to the cluster, retrying around stale failures
    /// until both the pending queue and the tracker drain.
    ///
    /// Serialized per collection by the `Collection.sync:<id>` latch. An
    /// action leaves the pending queue only once its transaction committed.
    pub async fn sync(&self) -> Result<(), CollectionError> {
        let _latch = tessera_common::acquire(format!("Collection.sync:{}", self.id)).await;
        loop {
            let snapshot: Vec<Action> = self.pending.lock().clone();
            if snapshot.is_empty() && !self.tracker.has_changes() {
                break;
            }

            // Trial staging: the current transforms plus this round's log
            // append, discarded wholesale if the push fails.
            let trial = Arc::new(Tracker::with_transforms(
                Arc::clone(&self.cache),
                self.id.clone(),
                self.tracker.transforms(),
            ));
            let log: Log<_, Action> = Log::create_or_open(
                Arc::clone(&trial),
                self.id.header_block_id(),
                self.chain_options(),
            )
            .await?;

            let current_rev = self.source.trx_context().map_or(0, |c| c.rev);
            let new_rev = current_rev + 1;
            let trx_id = TrxId::random();
            let (_, tail_path) = log
                .add_actions(
                    snapshot.clone(),
                    trx_id.clone(),
                    new_rev,
                    || trial.transformed_block_ids().into_iter().collect(),
                    None,
                    None,
                )
                .await?;
            let header_id = self
                .source
                .trx_context()
                .is_none()
                .then(|| self.id.header_block_id());

            match self
                .source
                .transact(
                    trial.transforms(),
                    trx_id.clone(),
                    new_rev,
                    tail_path.block_id.clone(),
                    header_id,
                )
                .await?
            {
                Some(stale) => {
                    if stale.pending.is_some() {
                        debug!("sync of {} blocked by a concurrent pending; backing off", self.id);
                        tokio::time::sleep(Duration::from_millis(
                            self.options.pending_retry_delay_ms,
                        ))
                        .await;
                    }
                    self.update().await?;
                }
                None => {
                    {
                        let mut pending = self.pending.lock();
                        let drained = snapshot.len().min(pending.len());
                        pending.drain(..drained);
                    }
                    let committed = trial.reset();
                    self.replay_actions().await?;
                    self.cache.transform_cache(&committed)?;
                    self.source.push_committed(TrxRev {
                        trx_id,
                        rev: new_rev,
                    });
                    info!("collection {} synced rev {new_rev}", self.id);
                }
            }
        }
        Ok(())
    }

    /// [`Collection::update`] followed by [`Collection::sync`].
    pub async fn update_and_sync(&self) -> Result<(), CollectionError> {
        self.update().await?;
        self.sync().await
    }

    /// Iterate every logged action, oldest-first, or newest-first when
    /// `forward` is false.
    pub async fn select_log(&self, forward: bool) -> Result<ActionCursor<T>, CollectionError> {
        let log = self.live_log().await?;
        let cursor = log.select(None, forward).await?;
        Ok(ActionCursor {
            cursor,
            forward,
            buffer: VecDeque::new(),
        })
    }

    /// Recompute and check every log back-link.
    pub async fn verify_log(&self) -> Result<(), CollectionError> {
        Ok(self.live_log().await?.verify_back_links().await?)
    }
}

/// See [`Collection::select_log`].
pub struct ActionCursor<T: Transactor> {
    cursor: LogCursor<Cache<T>, Action>,
    forward: bool,
    buffer: VecDeque<Action>,
}

impl<T: Transactor> ActionCursor<T> {
    pub async fn next_action(&mut self) -> Result<Option<Action>, CollectionError> {
        loop {
            if let Some(action) = self.buffer.pop_front() {
                return Ok(Some(action));
            }
            match self.cursor.next_entry().await? {
                None => return Ok(None),
                Some((_, entry)) => {
                    if let Some(action_entry) = entry.action {
                        if self.forward {
                            self.buffer.extend(action_entry.actions);
                        } else {
                            self.buffer.extend(action_entry.actions.into_iter().rev());
                        }
                    }
                }
            }
        }
    }

    /// Drain the remaining actions into a vector.
    pub async fn collect_actions(mut self) -> Result<Vec<Action>, CollectionError> {
        let mut out = Vec::new();
        while let Some(action) = self.next_action().await? {
            out.push(action);
        }
        Ok(out)
    }
}
