use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use log::debug;
use tessera_common::now_millis;
use tessera_model::{
    apply_transform, block_ids_for_transforms, merge_transforms, transform_for_block_id,
    transforms_from_transform, BlockGetResult, BlockId, BlockState, CancelRequest, CommitOutcome,
    CommitRequest, CommitSuccess, GetRequest, GetResponse, MessageOptions, MissingTrx, PendOutcome,
    PendPolicy, PendRequest, PendSuccess, PendingTrx, Rev, StaleFailure, Transactor,
    TransactorError, Transforms, TrxRev,
};

use crate::{
    block::{BlockStorage, MaterializedBlock, RestoreCallback},
    RawStorage, StorageError,
};

/// The local transactor: implements `get`/`pend`/`cancel`/`commit` against
/// per-block storage.
///
/// Cluster members apply consensus operations through this; single-node
/// deployments (and tests) can hand it directly to a collection.
pub struct StorageRepo {
    storage: Arc<dyn RawStorage>,
    restore: Option<RestoreCallback>,
}

impl StorageRepo {
    pub fn new(storage: Arc<dyn RawStorage>) -> Self {
        Self {
            storage,
            restore: None,
        }
    }

    pub fn with_restore(storage: Arc<dyn RawStorage>, restore: RestoreCallback) -> Self {
        Self {
            storage,
            restore: Some(restore),
        }
    }

    /// The per-block storage engine for `block_id`.
    pub fn block(&self, block_id: &BlockId) -> BlockStorage {
        BlockStorage::new(
            block_id.clone(),
            Arc::clone(&self.storage),
            self.restore.clone(),
        )
    }

    /// Transactions committed at or above `rev` on any of `block_ids`,
    /// reconstructed as aggregate transforms keyed by transaction.
    /// `requesting` names the caller's own transaction, which never counts
    /// as missed, so a retried pend or commit stays idempotent.
    ///
    /// A single transaction's component revisions are assumed to agree
    /// across blocks.
    async fn collect_missing(
        &self,
        block_ids: impl IntoIterator<Item = &BlockId>,
        rev: Rev,
        requesting: &tessera_model::TrxId,
    ) -> Result<Vec<MissingTrx>, StorageError> {
        let mut by_trx: BTreeMap<tessera_model::TrxId, (Option<Rev>, Transforms)> = BTreeMap::new();
        for block_id in block_ids {
            let storage = self.block(block_id);
            let Some(latest) = storage.get_latest().await? else {
                continue;
            };
            if latest.rev < rev {
                continue;
            }
            for (found_rev, trx_id) in storage.list_revisions(rev, latest.rev).await? {
                if trx_id == *requesting {
                    continue;
                }
                let transform = storage.get_transaction(&trx_id).await?.ok_or_else(|| {
                    StorageError::corrupt(
                        format!("{block_id}/revs/{found_rev}.json"),
                        "revision without transaction",
                    )
                })?;
                let (_, transforms) = by_trx
                    .entry(trx_id)
                    .or_insert_with(|| (Some(found_rev), Transforms::new()));
                merge_transforms(
                    transforms,
                    transforms_from_transform(transform, block_id.clone()),
                );
            }
        }
        Ok(by_trx
            .into_iter()
            .map(|(trx_id, (rev, transforms))| MissingTrx {
                trx_id,
                rev,
                transforms,
            })
            .collect())
    }
}

fn check_options(options: &MessageOptions) -> Result<(), TransactorError> {
    if let Some(expiration) = options.expiration {
        if now_millis() > expiration {
            return Err(TransactorError::Expired);
        }
    }
    if let Some(signal) = &options.signal {
        if signal.is_cancelled() {
            return Err(TransactorError::Expired);
        }
    }
    Ok(())
}

#[async_trait]
impl Transactor for StorageRepo {
    async fn get(
        &self,
        request: GetRequest,
        options: &MessageOptions,
    ) -> Result<GetResponse, TransactorError> {
        check_options(options)?;
        let mut response = GetResponse::new();

        for block_id in &request.block_ids {
            let storage = self.block(block_id);

            // Catch up to transactions the caller has already seen
            // committed elsewhere.
            if let Some(context) = &request.context {
                let local_rev = storage.get_latest().await?.map_or(0, |l| l.rev);
                let mut ahead: Vec<&TrxRev> = context
                    .committed
                    .iter()
                    .filter(|c| c.rev > local_rev)
                    .collect();
                ahead.sort_by_key(|c| c.rev);
                for committed in ahead {
                    if storage
                        .get_pending_transaction(&committed.trx_id)
                        .await?
                        .is_some()
                    {
                        debug!(
                            "catching up block {block_id} to {} at rev {}",
                            committed.trx_id, committed.rev
                        );
                        storage
                            .commit_pending(&committed.trx_id, committed.rev)
                            .await?;
                    }
                }
            }

            let target_rev = request.context.as_ref().map(|c| c.rev).filter(|rev| *rev > 0);
            let materialized = match storage.get_block(target_rev).await {
                Ok(materialized) => materialized,
                Err(StorageError::BlockNotFound(_)) => MaterializedBlock {
                    block: None,
                    trx_rev: None,
                },
                Err(e) => return Err(e.into()),
            };

            let mut block = materialized.block;
            let pendings = storage
                .list_pending_transactions()
                .await?;
            let state_pendings = match request.context.as_ref().and_then(|c| c.trx_id.clone()) {
                Some(trx_id) => {
                    // The reader wants a specific pending overlaid.
                    let transform = storage
                        .get_pending_transaction(&trx_id)
                        .await?
                        .ok_or_else(|| TransactorError::MissingPending {
                            block_id: block_id.clone(),
                            trx_id: trx_id.clone(),
                        })?;
                    block = apply_transform(block, &transform)
                        .map_err(StorageError::Operation)?;
                    vec![trx_id]
                }
                None => pendings,
            };

            let latest = storage.get_latest().await?;
            response.insert(
                block_id.clone(),
                BlockGetResult {
                    block,
                    state: BlockState {
                        latest,
                        pendings: state_pendings,
                    },
                },
            );
        }
        Ok(response)
    }

    async fn pend(
        &self,
        request: PendRequest,
        options: &MessageOptions,
    ) -> Result<PendOutcome, TransactorError> {
        check_options(options)?;
        let block_ids: BTreeSet<BlockId> = block_ids_for_transforms(&request.transforms);

        // A request that is behind on revisions is told what it missed
        // rather than being allowed to stack a doomed pending.
        if let Some(rev) = request.rev {
            let missing = self
                .collect_missing(&block_ids, rev, &request.trx_id)
                .await?;
            if !missing.is_empty() {
                return Ok(PendOutcome::Stale(StaleFailure::missing(missing)));
            }
        }

        let mut observed: Vec<PendingTrx> = Vec::new();
        for block_id in &block_ids {
            let storage = self.block(block_id);
            for trx_id in storage
                .list_pending_transactions()
                .await?
            {
                if trx_id == request.trx_id {
                    continue;
                }
                let transform = match request.policy {
                    PendPolicy::Return => storage
                        .get_pending_transaction(&trx_id)
                        .await?,
                    _ => None,
                };
                observed.push(PendingTrx {
                    block_id: block_id.clone(),
                    trx_id,
                    transform,
                });
            }
        }
        if !observed.is_empty() && request.policy != PendPolicy::Continue {
            return Ok(PendOutcome::Stale(StaleFailure::pending(observed)));
        }

        for block_id in &block_ids {
            let transform = transform_for_block_id(&request.transforms, block_id);
            self.block(block_id)
                .save_pending_transaction(&request.trx_id, &transform)
                .await?;
        }

        Ok(PendOutcome::Success(PendSuccess {
            success: Default::default(),
            pending: observed,
            block_ids: block_ids.into_iter().collect(),
        }))
    }

    async fn cancel(
        &self,
        request: CancelRequest,
        options: &MessageOptions,
    ) -> Result<(), TransactorError> {
        check_options(options)?;
        for block_id in &request.block_ids {
            self.block(block_id)
                .delete_pending_transaction(&request.trx_id)
                .await?;
        }
        Ok(())
    }

    async fn commit(
        &self,
        request: CommitRequest,
        options: &MessageOptions,
    ) -> Result<CommitOutcome, TransactorError> {
        check_options(options)?;

        let missing = self
            .collect_missing(&request.block_ids, request.rev, &request.trx_id)
            .await?;
        if !missing.is_empty() {
            return Ok(CommitOutcome::Stale(StaleFailure::missing(missing)));
        }

        // Validate before mutating anything: every block must either hold
        // the pending or have already committed it.
        for block_id in &request.block_ids {
            let storage = self.block(block_id);
            if storage
                .get_pending_transaction(&request.trx_id)
                .await?
                .is_none()
                && storage
                    .get_transaction(&request.trx_id)
                    .await?
                    .is_none()
            {
                return Err(TransactorError::MissingPending {
                    block_id: block_id.clone(),
                    trx_id: request.trx_id.clone(),
                });
            }
        }

        // The log tail commits before any other block, so a reader that
        // finds the tail entry can always resolve the rest.
        let ordered = request
            .block_ids
            .iter()
            .filter(|id| **id == request.tail_id)
            .chain(request.block_ids.iter().filter(|id| **id != request.tail_id));
        for block_id in ordered {
            let storage = self.block(block_id);
            if storage
                .get_pending_transaction(&request.trx_id)
                .await?
                .is_some()
            {
                storage
                    .commit_pending(&request.trx_id, request.rev)
                    .await?;
            }
            // Otherwise this block already committed the transaction; a
            // retried commit is idempotent.
        }

        Ok(CommitOutcome::Success(CommitSuccess {
            success: Default::default(),
            coordinator_id: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tessera_model::{
        Block, BlockHeader, BlockOperation, BlockType, CollectionId, Transform, TrxContext, TrxId,
    };

    use crate::Memory;

    use super::*;

    fn repo() -> StorageRepo {
        StorageRepo::new(Arc::new(Memory::new()))
    }

    fn block(id: &str, value: i64) -> Block {
        Block::with_attrs(
            BlockHeader {
                id: BlockId::new(id),
                block_type: BlockType::new("T"),
                collection_id: CollectionId::new("C"),
            },
            [("value".to_owned(), json!(value))],
        )
    }

    fn trx(n: u64) -> TrxId {
        TrxId::new(format!("t-t-t-t-{n}"))
    }

    fn insert_transforms(id: &str, value: i64) -> Transforms {
        let mut transforms = Transforms::new();
        transforms.inserts.insert(BlockId::new(id), block(id, value));
        transforms
    }

    fn update_transforms(id: &str, value: i64) -> Transforms {
        let mut transforms = Transforms::new();
        transforms.updates.insert(
            BlockId::new(id),
            vec![BlockOperation::assign("value", json!(value))],
        );
        transforms
    }

    fn opts() -> MessageOptions {
        MessageOptions::default()
    }

    async fn pend_ok(repo: &StorageRepo, transforms: Transforms, trx_id: &TrxId, rev: Rev) {
        let outcome = repo
            .pend(
                PendRequest {
                    transforms,
                    trx_id: trx_id.clone(),
                    rev: Some(rev),
                    policy: PendPolicy::Fail,
                },
                &opts(),
            )
            .await
            .unwrap();
        outcome.into_result().expect("pend should succeed");
    }

    async fn commit_ok(repo: &StorageRepo, ids: &[&str], trx_id: &TrxId, rev: Rev) {
        let outcome = repo
            .commit(
                CommitRequest {
                    block_ids: ids.iter().map(|id| BlockId::new(*id)).collect(),
                    trx_id: trx_id.clone(),
                    rev,
                    tail_id: BlockId::new(ids[0]),
                    header_id: None,
                },
                &opts(),
            )
            .await
            .unwrap();
        outcome.into_result().expect("commit should succeed");
    }

    #[tokio::test]
    async fn pend_commit_get_round() {
        let r = repo();
        pend_ok(&r, insert_transforms("a", 1), &trx(1), 1).await;
        commit_ok(&r, &["a"], &trx(1), 1).await;

        let response = r
            .get(
                GetRequest {
                    block_ids: vec![BlockId::new("a")],
                    context: None,
                },
                &opts(),
            )
            .await
            .unwrap();
        let result = &response[&BlockId::new("a")];
        assert_eq!(result.block.as_ref().unwrap().attr("value"), Some(&json!(1)));
        assert_eq!(result.state.latest.as_ref().unwrap().rev, 1);
        assert!(result.state.pendings.is_empty());
    }

    #[tokio::test]
    async fn get_of_an_unknown_block_is_absent_not_an_error() {
        let r = repo();
        let response = r
            .get(
                GetRequest {
                    block_ids: vec![BlockId::new("nope")],
                    context: None,
                },
                &opts(),
            )
            .await
            .unwrap();
        let result = &response[&BlockId::new("nope")];
        assert_eq!(result.block, None);
        assert_eq!(result.state, BlockState::default());
    }

    #[tokio::test]
    async fn pend_policy_fail_refuses_on_existing_pending() {
        let r = repo();
        pend_ok(&r, insert_transforms("a", 1), &trx(1), 1).await;

        let outcome = r
            .pend(
                PendRequest {
                    transforms: update_transforms("a", 2),
                    trx_id: trx(2),
                    rev: Some(1),
                    policy: PendPolicy::Fail,
                },
                &opts(),
            )
            .await
            .unwrap();
        let stale = outcome.into_result().unwrap_err();
        let pending = stale.pending.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].trx_id, trx(1));
        assert_eq!(pending[0].transform, None);
    }

    #[tokio::test]
    async fn pend_policy_return_includes_the_transforms() {
        let r = repo();
        pend_ok(&r, insert_transforms("a", 1), &trx(1), 1).await;

        let outcome = r
            .pend(
                PendRequest {
                    transforms: update_transforms("a", 2),
                    trx_id: trx(2),
                    rev: Some(1),
                    policy: PendPolicy::Return,
                },
                &opts(),
            )
            .await
            .unwrap();
        let stale = outcome.into_result().unwrap_err();
        assert!(stale.pending.unwrap()[0].transform.is_some());
    }

    #[tokio::test]
    async fn pend_policy_continue_stacks_and_reports() {
        let r = repo();
        pend_ok(&r, insert_transforms("a", 1), &trx(1), 1).await;

        let outcome = r
            .pend(
                PendRequest {
                    transforms: update_transforms("a", 2),
                    trx_id: trx(2),
                    rev: None,
                    policy: PendPolicy::Continue,
                },
                &opts(),
            )
            .await
            .unwrap();
        let success = outcome.into_result().unwrap();
        assert_eq!(success.pending.len(), 1);
        assert_eq!(success.pending[0].trx_id, trx(1));
    }

    #[tokio::test]
    async fn stale_commit_reports_what_was_missed() {
        let r = repo();
        pend_ok(&r, insert_transforms("a", 1), &trx(1), 1).await;
        commit_ok(&r, &["a"], &trx(1), 1).await;

        // A second writer pends at the same rev and tries to commit.
        let outcome = r
            .pend(
                PendRequest {
                    transforms: update_transforms("a", 9),
                    trx_id: trx(2),
                    rev: Some(1),
                    policy: PendPolicy::Fail,
                },
                &opts(),
            )
            .await
            .unwrap();
        let stale = outcome.into_result().unwrap_err();
        let missing = stale.missing.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].trx_id, trx(1));
        assert_eq!(missing[0].rev, Some(1));
        assert!(missing[0].transforms.inserts.contains_key(&BlockId::new("a")));
    }

    #[tokio::test]
    async fn commit_without_pend_is_an_invariant_violation() {
        let r = repo();
        let err = r
            .commit(
                CommitRequest {
                    block_ids: vec![BlockId::new("a")],
                    trx_id: trx(1),
                    rev: 1,
                    tail_id: BlockId::new("a"),
                    header_id: None,
                },
                &opts(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransactorError::MissingPending { .. }));
    }

    #[tokio::test]
    async fn cancel_ignores_absent_pendings() {
        let r = repo();
        pend_ok(&r, insert_transforms("a", 1), &trx(1), 1).await;
        r.cancel(
            CancelRequest {
                block_ids: vec![BlockId::new("a"), BlockId::new("b")],
                trx_id: trx(1),
            },
            &opts(),
        )
        .await
        .unwrap();

        // The pending is gone; a new pend for the same blocks succeeds.
        pend_ok(&r, insert_transforms("a", 1), &trx(2), 1).await;
    }

    #[tokio::test]
    async fn get_with_context_catches_up_pending_commits() {
        let r = repo();
        pend_ok(&r, insert_transforms("a", 1), &trx(1), 1).await;
        // Not committed locally, but the caller's context says it is.
        let context = TrxContext::new(vec![TrxRev { trx_id: trx(1), rev: 1 }], 1);
        let response = r
            .get(
                GetRequest {
                    block_ids: vec![BlockId::new("a")],
                    context: Some(context),
                },
                &opts(),
            )
            .await
            .unwrap();
        let result = &response[&BlockId::new("a")];
        assert_eq!(result.block.as_ref().unwrap().attr("value"), Some(&json!(1)));
        assert_eq!(result.state.latest.as_ref().unwrap().rev, 1);

        // The catch-up durably committed the transaction.
        let latest = r.block(&BlockId::new("a")).get_latest().await.unwrap();
        assert_eq!(latest.unwrap().rev, 1);
    }

    #[tokio::test]
    async fn get_with_trx_overlay_shows_the_pending_state() {
        let r = repo();
        pend_ok(&r, insert_transforms("a", 1), &trx(1), 1).await;
        commit_ok(&r, &["a"], &trx(1), 1).await;
        pend_ok(&r, update_transforms("a", 5), &trx(2), 2).await;

        let mut context = TrxContext::new(vec![TrxRev { trx_id: trx(1), rev: 1 }], 1);
        context.trx_id = Some(trx(2));
        let response = r
            .get(
                GetRequest {
                    block_ids: vec![BlockId::new("a")],
                    context: Some(context),
                },
                &opts(),
            )
            .await
            .unwrap();
        let result = &response[&BlockId::new("a")];
        assert_eq!(result.block.as_ref().unwrap().attr("value"), Some(&json!(5)));
        assert_eq!(result.state.pendings, vec![trx(2)]);
    }

    #[tokio::test]
    async fn historical_reads_follow_the_context_rev() {
        let r = repo();
        pend_ok(&r, insert_transforms("a", 1), &trx(1), 1).await;
        commit_ok(&r, &["a"], &trx(1), 1).await;
        pend_ok(&r, update_transforms("a", 2), &trx(2), 2).await;
        commit_ok(&r, &["a"], &trx(2), 2).await;

        let context = TrxContext::new(vec![TrxRev { trx_id: trx(1), rev: 1 }], 1);
        let response = r
            .get(
                GetRequest {
                    block_ids: vec![BlockId::new("a")],
                    context: Some(context),
                },
                &opts(),
            )
            .await
            .unwrap();
        let result = &response[&BlockId::new("a")];
        assert_eq!(result.block.as_ref().unwrap().attr("value"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn expired_options_refuse_every_operation() {
        let r = repo();
        let expired = MessageOptions::with_expiration(1);
        let err = r
            .get(
                GetRequest {
                    block_ids: vec![BlockId::new("a")],
                    context: None,
                },
                &expired,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransactorError::Expired));
    }
}
