use std::{collections::BTreeSet, sync::Arc};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tessera_common::now_millis;
use tessera_model::{hash::hash_bytes, BlockId, CollectionId, Rev, TrxContext, TrxId, TrxRev};
use tessera_source::{BlockSource, Tracker};

use crate::{
    blocks::PRIOR_HASH,
    chain::{Chain, ChainCursor, ChainOptions, Path},
    ChainError,
};

/// The record of one committed transaction's actions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry<A> {
    pub trx_id: TrxId,
    pub actions: Vec<A>,
    /// Every block the transaction touched, including the log chain blocks
    /// this very entry was appended into.
    pub block_ids: Vec<BlockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_ids: Option<Vec<CollectionId>>,
}

/// An explicit restatement of the committed-but-uncheckpointed set as of its
/// position in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    pub pendings: Vec<TrxRev>,
}

/// One log entry: exactly one of `action`/`checkpoint` is present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound = "A: Serialize + serde::de::DeserializeOwned")]
pub struct LogEntry<A> {
    pub timestamp: u64,
    pub rev: Rev,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionEntry<A>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointEntry>,
}

/// The result of [`Log::get_from`].
#[derive(Clone, Debug)]
pub struct LogRead<A> {
    /// The transaction context as of the newest entry.
    pub context: TrxContext,
    /// Action entries with `rev > start_rev`, in rev order.
    pub entries: Vec<LogEntry<A>>,
}

/// Chain options for a log with the given data-block type.
pub fn log_chain_options(data_type: &str) -> ChainOptions {
    ChainOptions {
        header_type: tessera_model::BlockType::new("logHeader"),
        data_type: tessera_model::BlockType::new(data_type),
        ..ChainOptions::default()
    }
}

/// An append-only ledger of actions and checkpoints over a [`Chain`], with
/// SHA-256 back-links between consecutive data blocks.
pub struct Log<S, A> {
    chain: Chain<S, LogEntry<A>>,
}

impl<S, A> Log<S, A>
where
    S: BlockSource,
    A: Serialize + DeserializeOwned + Clone,
{
    /// Open the log whose header block is `header_id`, creating the chain
    /// if it does not exist yet.
    pub async fn create_or_open(
        tracker: Arc<Tracker<S>>,
        header_id: BlockId,
        options: ChainOptions,
    ) -> Result<Log<S, A>, ChainError> {
        let chain = Chain::create_or_open(tracker, header_id, options)
            .await?
            .with_block_added(Box::new(|prior, added| {
                let serialized =
                    serde_json::to_vec(prior).expect("block serialization is infallible");
                let digest = hash_bytes(serialized).to_base64url();
                added.attrs.insert(PRIOR_HASH.to_owned(), json!(digest));
            }));
        Ok(Log { chain })
    }

    pub fn chain(&self) -> &Chain<S, LogEntry<A>> {
        &self.chain
    }

    /// Append an action entry.
    ///
    /// `block_ids` is a thunk because the full set of touched blocks is only
    /// known once this append's own chain blocks are accounted for: the
    /// entry's `block_ids` is the union of the thunk's result with the
    /// blocks the append itself touches.
    pub async fn add_actions(
        &self,
        actions: Vec<A>,
        trx_id: TrxId,
        rev: Rev,
        block_ids: impl FnOnce() -> Vec<BlockId>,
        collection_ids: Option<Vec<CollectionId>>,
        timestamp: Option<u64>,
    ) -> Result<(LogEntry<A>, Path), ChainError> {
        let plan = self.chain.plan_add(1).await?;
        let mut ids: BTreeSet<BlockId> = block_ids().into_iter().collect();
        ids.extend(self.chain.planned_block_ids(&plan));

        let entry = LogEntry {
            timestamp: timestamp.unwrap_or_else(now_millis),
            rev,
            action: Some(ActionEntry {
                trx_id,
                actions,
                block_ids: ids.into_iter().collect(),
                collection_ids,
            }),
            checkpoint: None,
        };
        let tail_path = self.chain.add_with_plan(&plan, vec![entry.clone()]).await?;
        Ok((entry, tail_path))
    }

    /// Append a checkpoint entry restating the currently committed set.
    pub async fn add_checkpoint(
        &self,
        pendings: Vec<TrxRev>,
        rev: Rev,
        timestamp: Option<u64>,
    ) -> Result<Path, ChainError> {
        let entry = LogEntry {
            timestamp: timestamp.unwrap_or_else(now_millis),
            rev,
            action: None,
            checkpoint: Some(CheckpointEntry { pendings }),
        };
        self.chain.add(vec![entry]).await
    }

    /// The transaction context as of the log's tail: the nearest
    /// checkpoint's pendings plus every action entry after it, at the tail
    /// entry's revision.
    pub async fn get_trx_context(&self) -> Result<TrxContext, ChainError> {
        let mut cursor = self.chain.select(None, true).await?;
        let mut context_rev: Option<Rev> = None;
        let mut after_checkpoint: Vec<TrxRev> = Vec::new();
        let mut base: Vec<TrxRev> = Vec::new();

        while let Some((_, entry)) = cursor.next_entry().await? {
            context_rev.get_or_insert(entry.rev);
            if let Some(checkpoint) = entry.checkpoint {
                base = checkpoint.pendings;
                break;
            }
            if let Some(action) = entry.action {
                after_checkpoint.push(TrxRev {
                    trx_id: action.trx_id,
                    rev: entry.rev,
                });
            }
        }

        after_checkpoint.reverse();
        base.extend(after_checkpoint);
        Ok(TrxContext::new(base, context_rev.unwrap_or(0)))
    }

    /// Action entries with `rev > start_rev` together with the context as of
    /// the newest entry.
    ///
    /// Walks backward from the tail collecting entries and pendings until a
    /// checkpoint bounds the committed set and `start_rev` bounds the
    /// entries.
    pub async fn get_from(&self, start_rev: Rev) -> Result<LogRead<A>, ChainError> {
        let mut cursor = self.chain.select(None, true).await?;
        let mut context_rev: Option<Rev> = None;
        let mut entries: Vec<LogEntry<A>> = Vec::new();
        let mut after_checkpoint: Vec<TrxRev> = Vec::new();
        let mut base: Vec<TrxRev> = Vec::new();
        let mut checkpoint_found = false;

        while let Some((_, entry)) = cursor.next_entry().await? {
            context_rev.get_or_insert(entry.rev);
            if checkpoint_found && entry.rev <= start_rev {
                break;
            }
            match (&entry.action, &entry.checkpoint) {
                (Some(action), _) => {
                    if !checkpoint_found {
                        after_checkpoint.push(TrxRev {
                            trx_id: action.trx_id.clone(),
                            rev: entry.rev,
                        });
                    }
                    if entry.rev > start_rev {
                        entries.push(entry.clone());
                    }
                }
                (None, Some(checkpoint)) => {
                    if !checkpoint_found {
                        base = checkpoint.pendings.clone();
                        checkpoint_found = true;
                    }
                    if entry.rev <= start_rev {
                        break;
                    }
                }
                (None, None) => {
                    return Err(ChainError::corrupt(
                        self.chain.header_id(),
                        "log entry with neither action nor checkpoint",
                    ))
                }
            }
        }

        entries.reverse();
        after_checkpoint.reverse();
        base.extend(after_checkpoint);
        Ok(LogRead {
            context: TrxContext::new(base, context_rev.unwrap_or(0)),
            entries,
        })
    }

    /// Iterate log entries; newest-first when `forward` is false.
    pub async fn select(
        &self,
        starting: Option<Path>,
        forward: bool,
    ) -> Result<LogCursor<S, A>, ChainError> {
        self.chain.select(starting, !forward).await
    }

    /// Validate every data block's back-link. See
    /// [`Chain::verify_back_links`].
    pub async fn verify_back_links(&self) -> Result<(), ChainError> {
        self.chain.verify_back_links().await
    }
}

pub type LogCursor<S, A> = ChainCursor<S, LogEntry<A>>;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tessera_source::{memory::MemorySource, BlockStore};

    use super::*;

    fn tracker() -> Arc<Tracker<MemorySource>> {
        Arc::new(Tracker::new(MemorySource::new(), CollectionId::new("C")))
    }

    async fn log(tracker: &Arc<Tracker<MemorySource>>) -> Log<MemorySource, String> {
        Log::create_or_open(
            Arc::clone(tracker),
            BlockId::new("log"),
            log_chain_options("logData"),
        )
        .await
        .unwrap()
    }

    fn trx(n: u64) -> TrxId {
        TrxId::new(format!("t-t-t-t-{n}"))
    }

    #[tokio::test]
    async fn empty_log_yields_the_zero_context() {
        let t = tracker();
        let l = log(&t).await;
        let context = l.get_trx_context().await.unwrap();
        assert_eq!(context.rev, 0);
        assert!(context.committed.is_empty());
    }

    #[tokio::test]
    async fn actions_accumulate_into_the_context() {
        let t = tracker();
        let l = log(&t).await;
        for rev in 1..=3u64 {
            l.add_actions(vec![format!("a{rev}")], trx(rev), rev, Vec::new, None, Some(rev))
                .await
                .unwrap();
        }

        let context = l.get_trx_context().await.unwrap();
        assert_eq!(context.rev, 3);
        assert_eq!(
            context.committed,
            vec![
                TrxRev { trx_id: trx(1), rev: 1 },
                TrxRev { trx_id: trx(2), rev: 2 },
                TrxRev { trx_id: trx(3), rev: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn checkpoint_restates_the_committed_set() {
        let t = tracker();
        let l = log(&t).await;
        l.add_actions(vec!["a1".into()], trx(1), 1, Vec::new, None, Some(1))
            .await
            .unwrap();
        l.add_actions(vec!["a2".into()], trx(2), 2, Vec::new, None, Some(2))
            .await
            .unwrap();
        // The checkpoint keeps only trx 2 alive.
        l.add_checkpoint(vec![TrxRev { trx_id: trx(2), rev: 2 }], 3, Some(3))
            .await
            .unwrap();
        l.add_actions(vec!["a4".into()], trx(4), 4, Vec::new, None, Some(4))
            .await
            .unwrap();

        let context = l.get_trx_context().await.unwrap();
        assert_eq!(context.rev, 4);
        assert_eq!(
            context.committed,
            vec![
                TrxRev { trx_id: trx(2), rev: 2 },
                TrxRev { trx_id: trx(4), rev: 4 },
            ]
        );
    }

    #[tokio::test]
    async fn get_from_returns_only_newer_action_entries() {
        let t = tracker();
        let l = log(&t).await;
        for rev in 1..=5u64 {
            l.add_actions(vec![format!("a{rev}")], trx(rev), rev, Vec::new, None, Some(rev))
                .await
                .unwrap();
        }

        let read = l.get_from(2).await.unwrap();
        assert_eq!(read.context.rev, 5);
        let revs: Vec<Rev> = read.entries.iter().map(|e| e.rev).collect();
        assert_eq!(revs, vec![3, 4, 5]);
        // Context still spans everything committed.
        assert_eq!(read.context.committed.len(), 5);
    }

    #[tokio::test]
    async fn rev_is_monotonic_across_reads() {
        let t = tracker();
        let l = log(&t).await;
        let mut last = 0;
        for rev in 1..=4u64 {
            l.add_actions(vec![format!("a{rev}")], trx(rev), rev, Vec::new, None, Some(rev))
                .await
                .unwrap();
            let read = l.get_from(0).await.unwrap();
            assert!(read.context.rev >= last);
            last = read.context.rev;
        }
    }

    #[tokio::test]
    async fn block_boundary_widens_the_touched_set_and_links_hashes() {
        let t = tracker();
        let l = log(&t).await;

        let mut sizes = Vec::new();
        for rev in 1..=33u64 {
            let (entry, _) = l
                .add_actions(vec![format!("a{rev}")], trx(rev), rev, Vec::new, None, Some(rev))
                .await
                .unwrap();
            sizes.push(entry.action.unwrap().block_ids.len());
        }

        // Entries 1..=32 touch the log header and the tail data block; entry
        // 33 rotates and additionally touches the freshly allocated block.
        assert!(sizes[..32].iter().all(|&n| n == 2), "{sizes:?}");
        assert_eq!(sizes[32], 3);

        l.verify_back_links().await.unwrap();
    }

    #[tokio::test]
    async fn tampering_breaks_the_back_links() {
        let t = tracker();
        let l = log(&t).await;
        for rev in 1..=33u64 {
            l.add_actions(vec![format!("a{rev}")], trx(rev), rev, Vec::new, None, Some(rev))
                .await
                .unwrap();
        }

        // Flip one entry in the first (hashed-over) data block.
        let head_id = l.chain().head_id().await.unwrap();
        t.update(
            head_id,
            tessera_model::BlockOperation::splice(
                "entries",
                0,
                1,
                vec![serde_json::json!({"timestamp": 0, "rev": 1})],
            ),
        );

        assert!(matches!(
            l.verify_back_links().await,
            Err(ChainError::PriorHashMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn select_iterates_entries_both_ways() {
        let t = tracker();
        let l = log(&t).await;
        for rev in 1..=3u64 {
            l.add_actions(vec![format!("a{rev}")], trx(rev), rev, Vec::new, None, Some(rev))
                .await
                .unwrap();
        }

        let mut forward = Vec::new();
        let mut cursor = l.select(None, true).await.unwrap();
        while let Some((_, entry)) = cursor.next_entry().await.unwrap() {
            forward.push(entry.rev);
        }
        assert_eq!(forward, vec![1, 2, 3]);

        let mut backward = Vec::new();
        let mut cursor = l.select(None, false).await.unwrap();
        while let Some((_, entry)) = cursor.next_entry().await.unwrap() {
            backward.push(entry.rev);
        }
        assert_eq!(backward, vec![3, 2, 1]);
    }
}
