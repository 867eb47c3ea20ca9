use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tessera_model::PeerId;

use crate::{
    member::RecordState,
    record::{ClusterMessage, ClusterRecord, PeerInfo, RepoOperation},
    transactor::PeerDirectory,
    wire::RepoResult,
    ClusterError, ClusterMember,
};

/// Delivery of record updates between cluster peers.
///
/// The single-method surface of the cluster protocol: hand a peer a record,
/// get its merged view back.
#[async_trait]
pub trait ClusterNetwork: Send + Sync {
    async fn update(
        &self,
        peer: &PeerId,
        info: &PeerInfo,
        record: ClusterRecord,
    ) -> Result<ClusterRecord, ClusterError>;
}

/// The coordinator's side of the two-phase protocol for blocks this peer
/// coordinates: build the signed record, collect promises from every
/// cluster peer, then commits until a majority agrees, and return the
/// locally applied outcome.
pub struct ClusterCoordinator {
    member: Arc<ClusterMember>,
    directory: Arc<dyn PeerDirectory>,
    network: Arc<dyn ClusterNetwork>,
    /// Our own reachable addresses, advertised when the directory does not
    /// already list us.
    own_info: PeerInfo,
}

impl ClusterCoordinator {
    pub fn new(
        member: Arc<ClusterMember>,
        directory: Arc<dyn PeerDirectory>,
        network: Arc<dyn ClusterNetwork>,
        multiaddr: Vec<String>,
    ) -> Self {
        let own_info = PeerInfo {
            multiaddr,
            public_key: member.keypair().public_key_base64url(),
        };
        Self {
            member,
            directory,
            network,
            own_info,
        }
    }

    pub fn member(&self) -> &Arc<ClusterMember> {
        &self.member
    }

    /// Run `operation` through cluster consensus and return its outcome.
    ///
    /// A single-peer cluster degenerates to a local apply; everything still
    /// flows through the member so replayed records stay idempotent.
    pub async fn execute(
        &self,
        operation: RepoOperation,
        expiration: u64,
    ) -> Result<RepoResult, ClusterError> {
        let mut peers = crate::record::ClusterPeers::new();
        for block_id in operation.block_ids() {
            peers.extend(self.directory.find_cluster(&block_id).await?);
        }
        peers
            .entry(self.member.peer_id())
            .or_insert_with(|| self.own_info.clone());

        let message = ClusterMessage {
            operation,
            expiration,
        };
        let record = ClusterRecord::new(peers, message)?;
        let hash = record.message_hash.clone();

        // Our own promise; a solo cluster runs to consensus right here.
        let mut record = self.member.update(record).await?;
        if self.member.classify(&record) != RecordState::Consensus {
            // Promise phase across the cluster.
            record = self.broadcast(record).await?;
            record = self.member.update(record).await?;
            match self.member.classify(&record) {
                RecordState::Rejected => {
                    return Err(ClusterError::ConsensusFailed(reject_reasons(&record)))
                }
                RecordState::Promising | RecordState::OurPromiseNeeded => {
                    return Err(ClusterError::ConsensusFailed(
                        "promise set incomplete".into(),
                    ))
                }
                _ => {}
            }

            // Commit phase: our member signed its commit above; circulate
            // until a majority has.
            record = self.broadcast(record).await?;
            record = self.member.update(record).await?;
        }

        if self.member.classify(&record) != RecordState::Consensus {
            return Err(ClusterError::ConsensusFailed(
                "no commit majority before expiration".into(),
            ));
        }
        self.member
            .result_of(&hash)
            .await
            .ok_or_else(|| ClusterError::Protocol("consensus reached but no local result".into()))
    }

    /// Send `record` to every other peer, merging each reply. Unreachable
    /// peers are tolerated; consensus only needs a majority.
    async fn broadcast(&self, mut record: ClusterRecord) -> Result<ClusterRecord, ClusterError> {
        let us = self.member.peer_id();
        for (peer_id, info) in record.peers.clone() {
            if peer_id == us {
                continue;
            }
            match self.network.update(&peer_id, &info, record.clone()).await {
                Ok(remote) => {
                    record.merge(remote)?;
                }
                Err(e) => warn!("peer {peer_id} unreachable during broadcast: {e}"),
            }
        }
        debug!(
            "broadcast of {} done: {}/{} promises, {}/{} commits",
            record.message_hash,
            record.promise_approvals(),
            record.peers.len(),
            record.commit_approvals(),
            record.peers.len(),
        );
        Ok(record)
    }
}

fn reject_reasons(record: &ClusterRecord) -> String {
    let reasons: Vec<&str> = record
        .promises
        .values()
        .chain(record.commits.values())
        .filter_map(|s| s.reject_reason.as_deref())
        .collect();
    if reasons.is_empty() {
        "rejected".to_owned()
    } else {
        reasons.join("; ")
    }
}

/// Spawn the member's timers: periodically clean expired records and
/// re-propagate stalled ones to the rest of their cluster.
pub fn spawn_timers(
    member: Arc<ClusterMember>,
    network: Arc<dyn ClusterNetwork>,
    interval_ms: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let records = member.tick(tessera_common::now_millis()).await;
            let us = member.peer_id();
            for record in records {
                for (peer_id, info) in record.peers.clone() {
                    if peer_id == us {
                        continue;
                    }
                    match network.update(&peer_id, &info, record.clone()).await {
                        Ok(remote) => {
                            if let Err(e) = member.update(remote).await {
                                debug!("resolution merge failed: {e}");
                            }
                        }
                        Err(e) => debug!("resolution poll of {peer_id} failed: {e}"),
                    }
                }
            }
        }
    })
}
