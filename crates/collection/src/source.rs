use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use tessera_common::now_millis;
use tessera_model::{
    block_ids_for_transforms, Block, BlockId, CancelRequest, CollectionId, CommitRequest,
    GetRequest, MessageOptions, PendPolicy, PendRequest, Rev, StaleFailure, Transactor,
    Transforms, TrxContext, TrxId, TrxRev,
};
use tessera_source::{BlockSource, SourceError};

use crate::CollectionError;

/// A [`BlockSource`] over a cluster-backed transactor, carrying the
/// collection's transaction context.
///
/// Reads pass the current context so storage peers serve (and catch up to)
/// the revisions this collection has seen. The context is mutated solely by
/// the owning collection.
pub struct TransactorSource<T> {
    transactor: Arc<T>,
    collection_id: CollectionId,
    trx_context: Mutex<Option<TrxContext>>,
    default_expiration_ms: u64,
}

impl<T: Transactor> TransactorSource<T> {
    pub fn new(
        transactor: Arc<T>,
        collection_id: CollectionId,
        default_expiration_ms: u64,
    ) -> Self {
        Self {
            transactor,
            collection_id,
            trx_context: Mutex::new(None),
            default_expiration_ms,
        }
    }

    pub fn collection_id(&self) -> &CollectionId {
        &self.collection_id
    }

    pub fn transactor(&self) -> &Arc<T> {
        &self.transactor
    }

    /// The context readers currently see. `None` means "read to the tail":
    /// either a collection that does not exist yet, or an update pass that
    /// wants everything.
    pub fn trx_context(&self) -> Option<TrxContext> {
        self.trx_context.lock().clone()
    }

    pub fn set_trx_context(&self, context: Option<TrxContext>) {
        *self.trx_context.lock() = context;
    }

    /// Record a successfully synced transaction and advance the context
    /// revision.
    pub fn push_committed(&self, trx_rev: TrxRev) {
        let mut context = self.trx_context.lock();
        let context = context.get_or_insert_with(TrxContext::default);
        context.rev = context.rev.max(trx_rev.rev);
        context.committed.push(trx_rev);
    }

    fn options(&self) -> MessageOptions {
        MessageOptions::with_expiration(now_millis() + self.default_expiration_ms)
    }

    /// Push `transforms` as transaction `trx_id` at `rev`: pend (failing
    /// fast on any concurrent pending), then commit with the log tail block
    /// first.
    ///
    /// `header_id` is set on the first commit of a new collection so the
    /// cluster creates the header atomically with it.
    ///
    /// Returns `None` on success, or the [`StaleFailure`] the caller must
    /// recover from.
    pub async fn transact(
        &self,
        transforms: Transforms,
        trx_id: TrxId,
        rev: Rev,
        tail_id: BlockId,
        header_id: Option<BlockId>,
    ) -> Result<Option<StaleFailure>, CollectionError> {
        let block_ids: Vec<BlockId> = block_ids_for_transforms(&transforms).into_iter().collect();

        let pend = self
            .transactor
            .pend(
                PendRequest {
                    transforms,
                    trx_id: trx_id.clone(),
                    rev: Some(rev),
                    policy: PendPolicy::Fail,
                },
                &self.options(),
            )
            .await?;
        if let Err(stale) = pend.into_result() {
            debug!("pend of {trx_id} stale: {stale}");
            return Ok(Some(stale));
        }

        let commit = self
            .transactor
            .commit(
                CommitRequest {
                    block_ids: block_ids.clone(),
                    trx_id: trx_id.clone(),
                    rev,
                    tail_id,
                    header_id,
                },
                &self.options(),
            )
            .await?;
        if let Err(stale) = commit.into_result() {
            debug!("commit of {trx_id} stale: {stale}");
            // Leave nothing pinned behind a failed transaction.
            self.transactor
                .cancel(
                    CancelRequest {
                        block_ids,
                        trx_id,
                    },
                    &self.options(),
                )
                .await?;
            return Ok(Some(stale));
        }
        Ok(None)
    }
}

#[async_trait]
impl<T: Transactor> BlockSource for TransactorSource<T> {
    async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>, SourceError> {
        let context = self.trx_context();
        let mut response = self
            .transactor
            .get(
                GetRequest {
                    block_ids: vec![block_id.clone()],
                    context,
                },
                &self.options(),
            )
            .await?;
        Ok(response.remove(block_id).and_then(|result| result.block))
    }
}
