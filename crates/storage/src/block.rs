use std::sync::Arc;

use futures::future::BoxFuture;
use log::{debug, trace};
use serde::{de::DeserializeOwned, Serialize};
use tessera_model::{apply_transform, Block, BlockId, Rev, Transform, TrxId, TrxRev};

use crate::{meta::BlockMetadata, BlockArchive, RawStorage, RevRange, StorageError};

/// Fetches archived revisions for a block on demand.
///
/// Invoked when a read targets a revision outside the locally materializable
/// ranges. Returns `None` when no archive covers the block.
pub type RestoreCallback = Arc<
    dyn Fn(BlockId, Option<Rev>) -> BoxFuture<'static, Result<Option<BlockArchive>, StorageError>>
        + Send
        + Sync,
>;

/// A block (or its absence, when deleted) materialized at a revision.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterializedBlock {
    pub block: Option<Block>,
    /// The transaction whose application produced this state. `None` when
    /// the block simply did not exist yet at the requested revision.
    pub trx_rev: Option<TrxRev>,
}

/// Everything stored for one block id.
///
/// Layout under the block's prefix: `meta.json`, `revs/{rev}.json` (the
/// revision → transaction index), `pend/{trxId}.json`, `trx/{trxId}.json`
/// and `blocks/{trxId}.json` (materialized snapshots).
pub struct BlockStorage {
    block_id: BlockId,
    storage: Arc<dyn RawStorage>,
    restore: Option<RestoreCallback>,
}

impl BlockStorage {
    pub fn new(
        block_id: BlockId,
        storage: Arc<dyn RawStorage>,
        restore: Option<RestoreCallback>,
    ) -> Self {
        Self {
            block_id,
            storage,
            restore,
        }
    }

    pub fn block_id(&self) -> &BlockId {
        &self.block_id
    }

    fn meta_path(&self) -> String {
        format!("{}/meta.json", self.block_id)
    }

    fn rev_path(&self, rev: Rev) -> String {
        format!("{}/revs/{rev}.json", self.block_id)
    }

    fn pend_path(&self, trx_id: &TrxId) -> String {
        format!("{}/pend/{trx_id}.json", self.block_id)
    }

    fn trx_path(&self, trx_id: &TrxId) -> String {
        format!("{}/trx/{trx_id}.json", self.block_id)
    }

    fn block_path(&self, trx_id: &TrxId) -> String {
        format!("{}/blocks/{trx_id}.json", self.block_id)
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, StorageError> {
        match self.storage.read(path).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::corrupt(path, e.to_string())),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.storage.write(path, &bytes).await?)
    }

    pub async fn get_metadata(&self) -> Result<Option<BlockMetadata>, StorageError> {
        self.read_json(&self.meta_path()).await
    }

    pub async fn save_metadata(&self, meta: &BlockMetadata) -> Result<(), StorageError> {
        self.write_json(&self.meta_path(), meta).await
    }

    pub async fn get_latest(&self) -> Result<Option<TrxRev>, StorageError> {
        Ok(self.get_metadata().await?.and_then(|meta| meta.latest))
    }

    /// Record `trx_rev` as the latest committed state and keep the live
    /// range open through it.
    pub async fn set_latest(&self, trx_rev: TrxRev) -> Result<(), StorageError> {
        let mut meta = self.get_metadata().await?.unwrap_or_default();
        meta.merge_range((trx_rev.rev, None));
        meta.latest = Some(trx_rev);
        self.save_metadata(&meta).await
    }

    pub async fn get_transaction(&self, trx_id: &TrxId) -> Result<Option<Transform>, StorageError> {
        self.read_json(&self.trx_path(trx_id)).await
    }

    pub async fn get_pending_transaction(
        &self,
        trx_id: &TrxId,
    ) -> Result<Option<Transform>, StorageError> {
        self.read_json(&self.pend_path(trx_id)).await
    }

    pub async fn save_pending_transaction(
        &self,
        trx_id: &TrxId,
        transform: &Transform,
    ) -> Result<(), StorageError> {
        self.write_json(&self.pend_path(trx_id), transform).await
    }

    /// Remove a pending transaction. Removing an absent one is a no-op.
    pub async fn delete_pending_transaction(&self, trx_id: &TrxId) -> Result<(), StorageError> {
        Ok(self.storage.delete(&self.pend_path(trx_id)).await?)
    }

    /// Move a pending transaction into the committed transaction table.
    pub async fn promote_pending_transaction(&self, trx_id: &TrxId) -> Result<(), StorageError> {
        let transform = self.get_pending_transaction(trx_id).await?.ok_or_else(|| {
            StorageError::MissingPending {
                block_id: self.block_id.clone(),
                trx_id: trx_id.clone(),
            }
        })?;
        self.write_json(&self.trx_path(trx_id), &transform).await?;
        self.delete_pending_transaction(trx_id).await
    }

    /// Ids of all pending transactions. File stems that do not look like
    /// transaction ids are ignored.
    pub async fn list_pending_transactions(&self) -> Result<Vec<TrxId>, StorageError> {
        let names = self
            .storage
            .list(&format!("{}/pend", self.block_id))
            .await?;
        let mut ids: Vec<TrxId> = names
            .iter()
            .filter_map(|name| name.strip_suffix(".json"))
            .filter(|stem| TrxId::is_wellformed(stem))
            .map(TrxId::from)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// The `(rev, trxId)` pairs recorded between `start` and `end`,
    /// inclusive on both sides; ascending when `start <= end`, descending
    /// otherwise. Revisions at which this block did not change are simply
    /// absent.
    pub async fn list_revisions(
        &self,
        start: Rev,
        end: Rev,
    ) -> Result<Vec<(Rev, TrxId)>, StorageError> {
        let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
        let names = self
            .storage
            .list(&format!("{}/revs", self.block_id))
            .await?;
        let mut revs: Vec<Rev> = names
            .iter()
            .filter_map(|name| name.strip_suffix(".json"))
            .filter_map(|stem| stem.parse::<Rev>().ok())
            .filter(|rev| (lo..=hi).contains(rev))
            .collect();
        revs.sort_unstable();
        if start > end {
            revs.reverse();
        }

        let mut out = Vec::with_capacity(revs.len());
        for rev in revs {
            let path = self.rev_path(rev);
            let trx_id: TrxId = self
                .read_json(&path)
                .await?
                .ok_or_else(|| StorageError::corrupt(&path, "listed but unreadable"))?;
            out.push((rev, trx_id));
        }
        Ok(out)
    }

    pub async fn save_revision(&self, rev: Rev, trx_id: &TrxId) -> Result<(), StorageError> {
        self.write_json(&self.rev_path(rev), trx_id).await
    }

    pub async fn get_materialized_block(
        &self,
        trx_id: &TrxId,
    ) -> Result<Option<Block>, StorageError> {
        self.read_json(&self.block_path(trx_id)).await
    }

    pub async fn save_materialized_block(
        &self,
        trx_id: &TrxId,
        block: &Block,
    ) -> Result<(), StorageError> {
        self.write_json(&self.block_path(trx_id), block).await
    }

    /// Make `rev` locally materializable, restoring archived history if it
    /// lies outside the known ranges.
    ///
    /// Serialized per block by a named latch, so concurrent readers trigger
    /// at most one restore.
    pub async fn ensure_revision(&self, rev: Rev) -> Result<(), StorageError> {
        if self
            .get_metadata()
            .await?
            .is_some_and(|meta| meta.contains(rev))
        {
            return Ok(());
        }

        let _latch =
            tessera_common::acquire(format!("BlockStorage.ensureRevision:{}", self.block_id)).await;
        // Somebody else may have restored while we waited.
        if self
            .get_metadata()
            .await?
            .is_some_and(|meta| meta.contains(rev))
        {
            return Ok(());
        }

        let Some(restore) = &self.restore else {
            return Err(StorageError::BlockNotFound(self.block_id.clone()));
        };
        debug!("restoring block {} for rev {rev}", self.block_id);
        let archive = restore(self.block_id.clone(), Some(rev))
            .await?
            .ok_or_else(|| StorageError::BlockNotFound(self.block_id.clone()))?;
        self.absorb_archive(archive).await
    }

    /// Save an archive's revisions, transactions, materializations and
    /// pendings, and merge its range into the metadata.
    pub async fn absorb_archive(&self, archive: BlockArchive) -> Result<(), StorageError> {
        let (start, _) = archive.range;
        let oldest = archive.revisions.get(&start);
        if !oldest.is_some_and(|r| r.block.is_some()) {
            return Err(StorageError::Restore {
                block_id: self.block_id.clone(),
                detail: format!("archive lacks a materialization at its oldest revision {start}"),
            });
        }

        for (rev, revision) in &archive.revisions {
            self.save_revision(*rev, &revision.trx.trx_id).await?;
            self.write_json(&self.trx_path(&revision.trx.trx_id), &revision.trx.transform)
                .await?;
            if let Some(block) = &revision.block {
                self.save_materialized_block(&revision.trx.trx_id, block)
                    .await?;
            }
        }
        if let Some(pending) = &archive.pending {
            for (trx_id, transform) in pending {
                self.save_pending_transaction(trx_id, transform).await?;
            }
        }

        let mut meta = self.get_metadata().await?.unwrap_or_default();
        meta.merge_range(archive.range);
        self.save_metadata(&meta).await
    }

    /// Assemble the restore payload for `range`: every recorded revision in
    /// the span, a materialization at the oldest one, and the current
    /// pending set.
    pub async fn build_archive(&self, range: RevRange) -> Result<BlockArchive, StorageError> {
        use crate::meta::{ArchiveRevision, ArchiveTrx};

        let (start, end) = range;
        let end_rev = match end {
            Some(end) => end,
            None => {
                self.get_latest()
                    .await?
                    .ok_or_else(|| StorageError::BlockNotFound(self.block_id.clone()))?
                    .rev
            }
        };

        let mut revisions = std::collections::BTreeMap::new();
        for (rev, trx_id) in self.list_revisions(start, end_rev).await? {
            let path = self.trx_path(&trx_id);
            let transform = self
                .get_transaction(&trx_id)
                .await?
                .ok_or_else(|| StorageError::corrupt(&path, "revision without transaction"))?;
            let block = if revisions.is_empty() {
                // The oldest archived revision carries a snapshot.
                let materialized = self.get_block(Some(rev)).await?;
                materialized.block
            } else {
                None
            };
            revisions.insert(rev, ArchiveRevision {
                trx: ArchiveTrx { trx_id, transform },
                block,
            });
        }

        let mut pending = std::collections::BTreeMap::new();
        for trx_id in self.list_pending_transactions().await? {
            if let Some(transform) = self.get_pending_transaction(&trx_id).await? {
                pending.insert(trx_id, transform);
            }
        }

        Ok(BlockArchive {
            block_id: self.block_id.clone(),
            revisions,
            range: (start, Some(end_rev)),
            pending: (!pending.is_empty()).then_some(pending),
        })
    }

    /// Materialize the block at `rev`, or at the latest committed revision
    /// when `rev` is `None`.
    ///
    /// Finds the newest materialized snapshot at or below the target and
    /// replays the recorded transforms forward from it, saving the result as
    /// a new snapshot for the topmost transaction.
    pub async fn get_block(&self, rev: Option<Rev>) -> Result<MaterializedBlock, StorageError> {
        let meta = match self.get_metadata().await? {
            Some(meta) => Some(meta),
            None if self.restore.is_some() && rev.is_some() => None,
            None => return Err(StorageError::BlockNotFound(self.block_id.clone())),
        };

        let target = match rev {
            Some(rev) => rev,
            None => {
                meta.as_ref()
                    .and_then(|m| m.latest.as_ref())
                    .ok_or_else(|| StorageError::BlockNotFound(self.block_id.clone()))?
                    .rev
            }
        };

        if target == 0 {
            // Revisions start at 1; nothing can exist at or below 0.
            return Ok(MaterializedBlock {
                block: None,
                trx_rev: None,
            });
        }

        if rev.is_some() && !meta.as_ref().is_some_and(|m| m.contains(target)) {
            match self.ensure_revision(target).await {
                Ok(()) => {}
                Err(StorageError::BlockNotFound(_)) if meta.is_some() => {
                    // No archive to consult; the local history decides.
                    // The block may simply not have existed at `target`.
                }
                Err(e) => return Err(e),
            }
        }

        // Walk downward to the nearest snapshot.
        let recorded = self.list_revisions(target, 1).await?;
        let mut intervening: Vec<(Rev, TrxId)> = Vec::new();
        let mut base: Option<(Block, Rev, TrxId)> = None;
        for (rev, trx_id) in recorded {
            if let Some(block) = self.get_materialized_block(&trx_id).await? {
                base = Some((block, rev, trx_id));
                break;
            }
            intervening.push((rev, trx_id));
        }

        if base.is_none() && intervening.is_empty() {
            // Nothing recorded at or below the target: the block did not
            // exist yet at that revision.
            return Ok(MaterializedBlock {
                block: None,
                trx_rev: None,
            });
        }

        intervening.reverse();
        let (mut block, mut top) = match base {
            Some((block, rev, trx_id)) => (Some(block), TrxRev { trx_id, rev }),
            None => {
                // No snapshot below: the span must begin with the block's
                // creation, replayable from nothing.
                let (rev, trx_id) = intervening.remove(0);
                let path = self.trx_path(&trx_id);
                let transform = self
                    .get_transaction(&trx_id)
                    .await?
                    .ok_or_else(|| StorageError::corrupt(&path, "revision without transaction"))?;
                (apply_transform(None, &transform)?, TrxRev { trx_id, rev })
            }
        };

        let replayed = !intervening.is_empty();
        for (rev, trx_id) in intervening {
            let path = self.trx_path(&trx_id);
            let transform = self
                .get_transaction(&trx_id)
                .await?
                .ok_or_else(|| StorageError::corrupt(&path, "revision without transaction"))?;
            block = apply_transform(block, &transform)?;
            top = TrxRev { trx_id, rev };
        }

        if replayed {
            if let Some(block) = &block {
                trace!("caching materialization of {} at {}", self.block_id, top.rev);
                self.save_materialized_block(&top.trx_id, block).await?;
            }
        }

        Ok(MaterializedBlock {
            block,
            trx_rev: Some(top),
        })
    }

    /// Commit the pending transaction `trx_id` at `rev`: materialize it over
    /// the latest state, index the revision, advance `latest` and promote
    /// the pending entry into the committed table.
    pub async fn commit_pending(&self, trx_id: &TrxId, rev: Rev) -> Result<(), StorageError> {
        let transform = self.get_pending_transaction(trx_id).await?.ok_or_else(|| {
            StorageError::MissingPending {
                block_id: self.block_id.clone(),
                trx_id: trx_id.clone(),
            }
        })?;

        let base = match self.get_latest().await? {
            Some(_) => self.get_block(None).await?.block,
            None => None,
        };
        let block = apply_transform(base, &transform)?;
        if let Some(block) = &block {
            self.save_materialized_block(trx_id, block).await?;
        }
        self.save_revision(rev, trx_id).await?;
        self.set_latest(TrxRev {
            trx_id: trx_id.clone(),
            rev,
        })
        .await?;
        self.promote_pending_transaction(trx_id).await
    }
}
