use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use tessera_common::now_millis;
use tessera_model::{
    transform_for_block_id, transforms_from_transform, BlockId, CancelRequest, CommitOutcome,
    CommitRequest, CommitSuccess, GetRequest, GetResponse, MessageOptions, PendOutcome,
    PendRequest, PendSuccess, PeerId, Transactor, TransactorError, Transforms,
};

use crate::{
    record::{PeerInfo, RepoOperation},
    wire::{RepoMessage, RepoReply, RepoResult},
    ClusterError,
};

/// Coordinator discovery, DHT-backed in production. Interfaces only here:
/// the concrete routing lives with the peer-to-peer transport.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// The coordinator peer for `block_id`, skipping `excluded` peers.
    async fn find_coordinator(
        &self,
        block_id: &BlockId,
        excluded: &HashSet<PeerId>,
    ) -> Result<(PeerId, PeerInfo), ClusterError>;

    /// The cluster of peers cooperating on `block_id`, coordinator
    /// included.
    async fn find_cluster(
        &self,
        block_id: &BlockId,
    ) -> Result<BTreeMap<PeerId, PeerInfo>, ClusterError>;
}

/// Request/response delivery to a coordinator peer (the repo protocol).
#[async_trait]
pub trait RepoLink: Send + Sync {
    async fn send(
        &self,
        peer: &PeerId,
        info: &PeerInfo,
        message: RepoMessage,
    ) -> Result<RepoReply, ClusterError>;
}

#[derive(Clone, Copy, Debug)]
pub struct TransactorOptions {
    /// Deadline applied when the caller's options carry none.
    pub default_expiration_ms: u64,
}

impl Default for TransactorOptions {
    fn default() -> Self {
        Self {
            default_expiration_ms: 30_000,
        }
    }
}

/// One batch of blocks addressed to one coordinator peer.
struct Batch {
    peer_id: PeerId,
    info: PeerInfo,
    block_ids: Vec<BlockId>,
    /// The aggregated result, once the peer answered.
    response: Option<RepoResult>,
    /// Indexes of the retry batches that replaced this one after its peer
    /// failed. A subsumed batch contributes no response of its own.
    subsumed_by: Vec<usize>,
}

/// The cluster-backed transactor used by collections: routes each block to
/// its coordinator, batches per peer, retries around failed peers and
/// aggregates replies.
pub struct NetworkTransactor {
    directory: Arc<dyn PeerDirectory>,
    link: Arc<dyn RepoLink>,
    options: TransactorOptions,
    /// Coordinator cache; entries are dropped when their peer gets
    /// excluded by a failure.
    coordinators: Mutex<HashMap<BlockId, (PeerId, PeerInfo)>>,
}

impl NetworkTransactor {
    pub fn new(
        directory: Arc<dyn PeerDirectory>,
        link: Arc<dyn RepoLink>,
        options: TransactorOptions,
    ) -> Self {
        Self {
            directory,
            link,
            options,
            coordinators: Mutex::new(HashMap::new()),
        }
    }

    fn expiration(&self, options: &MessageOptions) -> u64 {
        options
            .expiration
            .unwrap_or_else(|| now_millis() + self.options.default_expiration_ms)
    }

    async fn coordinator_for(
        &self,
        block_id: &BlockId,
        excluded: &HashSet<PeerId>,
    ) -> Result<(PeerId, PeerInfo), ClusterError> {
        if let Some((peer_id, info)) = self.coordinators.lock().get(block_id) {
            if !excluded.contains(peer_id) {
                return Ok((peer_id.clone(), info.clone()));
            }
        }
        let found = self.directory.find_coordinator(block_id, excluded).await?;
        self.coordinators
            .lock()
            .insert(block_id.clone(), found.clone());
        Ok(found)
    }

    async fn batches_for(
        &self,
        block_ids: &[BlockId],
        excluded: &HashSet<PeerId>,
    ) -> Result<Vec<Batch>, ClusterError> {
        let mut by_peer: BTreeMap<PeerId, Batch> = BTreeMap::new();
        for block_id in block_ids {
            let (peer_id, info) = self.coordinator_for(block_id, excluded).await?;
            by_peer
                .entry(peer_id.clone())
                .or_insert_with(|| Batch {
                    peer_id,
                    info,
                    block_ids: Vec::new(),
                    response: None,
                    subsumed_by: Vec::new(),
                })
                .block_ids
                .push(block_id.clone());
        }
        Ok(by_peer.into_values().collect())
    }

    /// Issue `op_for` over `block_ids`, batched by coordinator. Returns the
    /// leaf results (one per batch that actually answered).
    async fn run(
        &self,
        block_ids: &[BlockId],
        op_for: impl Fn(&[BlockId]) -> RepoOperation,
        expiration: u64,
    ) -> Result<Vec<RepoResult>, TransactorError> {
        let mut excluded: HashSet<PeerId> = HashSet::new();
        let mut batches = self
            .batches_for(block_ids, &excluded)
            .await
            .map_err(TransactorError::from)?;

        let mut cursor = 0;
        while cursor < batches.len() {
            let index = cursor;
            cursor += 1;
            if batches[index].response.is_some() || !batches[index].subsumed_by.is_empty() {
                continue;
            }
            if now_millis() > expiration {
                return Err(TransactorError::Expired);
            }

            let message = RepoMessage {
                operations: vec![op_for(&batches[index].block_ids)],
                expiration: Some(expiration),
            };
            let sent = self
                .link
                .send(&batches[index].peer_id, &batches[index].info, message)
                .await;
            match sent {
                Ok(mut reply) => {
                    if reply.results.len() != 1 {
                        return Err(TransactorError::Protocol(format!(
                            "expected 1 result, got {}",
                            reply.results.len()
                        )));
                    }
                    batches[index].response = Some(reply.results.remove(0));
                }
                Err(e) => {
                    warn!(
                        "coordinator {} failed ({e}); rerouting its batch",
                        batches[index].peer_id
                    );
                    excluded.insert(batches[index].peer_id.clone());
                    self.coordinators
                        .lock()
                        .retain(|_, entry| !excluded.contains(&entry.0));

                    let retry_blocks = batches[index].block_ids.clone();
                    let retries = self
                        .batches_for(&retry_blocks, &excluded)
                        .await
                        .map_err(TransactorError::from)?;
                    let first_new = batches.len();
                    let indexes: Vec<usize> = (first_new..first_new + retries.len()).collect();
                    debug!("batch {index} subsumed by {indexes:?}");
                    batches[index].subsumed_by = indexes;
                    batches.extend(retries);
                }
            }
        }

        Ok(batches
            .into_iter()
            .filter_map(|batch| batch.response)
            .collect())
    }
}

#[async_trait]
impl Transactor for NetworkTransactor {
    async fn get(
        &self,
        request: GetRequest,
        options: &MessageOptions,
    ) -> Result<GetResponse, TransactorError> {
        let expiration = self.expiration(options);
        let context = request.context.clone();
        let results = self
            .run(
                &request.block_ids,
                |blocks| {
                    RepoOperation::Get(GetRequest {
                        block_ids: blocks.to_vec(),
                        context: context.clone(),
                    })
                },
                expiration,
            )
            .await?;

        let mut response = GetResponse::new();
        for result in results {
            match result.into_result()? {
                RepoResult::Get(partial) => response.extend(partial),
                other => {
                    return Err(TransactorError::Protocol(format!(
                        "get answered with {other:?}"
                    )))
                }
            }
        }
        Ok(response)
    }

    async fn pend(
        &self,
        request: PendRequest,
        options: &MessageOptions,
    ) -> Result<PendOutcome, TransactorError> {
        let expiration = self.expiration(options);
        let block_ids: Vec<BlockId> =
            tessera_model::block_ids_for_transforms(&request.transforms)
                .into_iter()
                .collect();
        let transforms = request.transforms.clone();
        let results = self
            .run(
                &block_ids,
                |blocks| {
                    // Only this batch's slice of the transforms travels to
                    // its coordinator.
                    let mut filtered = Transforms::new();
                    for block_id in blocks {
                        tessera_model::merge_transforms(
                            &mut filtered,
                            transforms_from_transform(
                                transform_for_block_id(&transforms, block_id),
                                block_id.clone(),
                            ),
                        );
                    }
                    RepoOperation::Pend(PendRequest {
                        transforms: filtered,
                        trx_id: request.trx_id.clone(),
                        rev: request.rev,
                        policy: request.policy,
                    })
                },
                expiration,
            )
            .await?;

        let mut merged = PendSuccess {
            success: Default::default(),
            pending: Vec::new(),
            block_ids: Vec::new(),
        };
        for result in results {
            match result.into_result()? {
                // Any stale reply preempts the rest: the caller has to
                // update and retry regardless of the other batches.
                RepoResult::Pend(PendOutcome::Stale(stale)) => {
                    return Ok(PendOutcome::Stale(stale))
                }
                RepoResult::Pend(PendOutcome::Success(success)) => {
                    merged.pending.extend(success.pending);
                    merged.block_ids.extend(success.block_ids);
                }
                other => {
                    return Err(TransactorError::Protocol(format!(
                        "pend answered with {other:?}"
                    )))
                }
            }
        }
        merged.block_ids.sort();
        merged.block_ids.dedup();
        Ok(PendOutcome::Success(merged))
    }

    async fn cancel(
        &self,
        request: CancelRequest,
        options: &MessageOptions,
    ) -> Result<(), TransactorError> {
        let expiration = self.expiration(options);
        let trx_id = request.trx_id.clone();
        let results = self
            .run(
                &request.block_ids,
                |blocks| {
                    RepoOperation::Cancel(CancelRequest {
                        block_ids: blocks.to_vec(),
                        trx_id: trx_id.clone(),
                    })
                },
                expiration,
            )
            .await?;
        for result in results {
            result.into_result()?;
        }
        Ok(())
    }

    async fn commit(
        &self,
        request: CommitRequest,
        options: &MessageOptions,
    ) -> Result<CommitOutcome, TransactorError> {
        let expiration = self.expiration(options);

        // Tail first: the log tail block's commit decides the transaction.
        // Only after it lands do the remaining blocks commit.
        let mut phases: Vec<Vec<BlockId>> = Vec::new();
        if request.block_ids.contains(&request.tail_id) {
            phases.push(vec![request.tail_id.clone()]);
            let rest: Vec<BlockId> = request
                .block_ids
                .iter()
                .filter(|id| **id != request.tail_id)
                .cloned()
                .collect();
            if !rest.is_empty() {
                phases.push(rest);
            }
        } else {
            phases.push(request.block_ids.clone());
        }

        let mut coordinator_id = None;
        for (phase_index, phase_blocks) in phases.iter().enumerate() {
            let results = self
                .run(
                    phase_blocks,
                    |blocks| {
                        RepoOperation::Commit(CommitRequest {
                            block_ids: blocks.to_vec(),
                            trx_id: request.trx_id.clone(),
                            rev: request.rev,
                            tail_id: request.tail_id.clone(),
                            header_id: request.header_id.clone(),
                        })
                    },
                    expiration,
                )
                .await?;

            for result in results {
                match result.into_result()? {
                    RepoResult::Commit(CommitOutcome::Stale(stale)) => {
                        return Ok(CommitOutcome::Stale(stale))
                    }
                    RepoResult::Commit(CommitOutcome::Success(success)) => {
                        if phase_index == 0 {
                            coordinator_id = coordinator_id.or(success.coordinator_id);
                        }
                    }
                    other => {
                        return Err(TransactorError::Protocol(format!(
                            "commit answered with {other:?}"
                        )))
                    }
                }
            }
        }

        Ok(CommitOutcome::Success(CommitSuccess {
            success: Default::default(),
            coordinator_id,
        }))
    }
}
