use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, info, warn};
use tessera_common::now_millis;
use tessera_model::BlockId;
use tessera_storage::StorageRepo;
use tokio::sync::Mutex;

use crate::{
    record::{ClusterRecord, SignaturePhase, SignatureType},
    wire::{execute_message, RepoMessage, RepoResult},
    ClusterError, Keypair,
};

/// Member-side timing knobs.
#[derive(Clone, Copy, Debug)]
pub struct MemberOptions {
    /// How long a record may sit without its promise set completing before
    /// this member votes to reject it.
    pub promise_timeout_ms: u64,
    /// How often in-flight records are re-propagated to resolve stalls.
    pub resolution_interval_ms: u64,
}

impl Default for MemberOptions {
    fn default() -> Self {
        Self {
            promise_timeout_ms: 5_000,
            resolution_interval_ms: 2_000,
        }
    }
}

/// Where a record stands, from this member's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordState {
    /// We have not signed a promise yet.
    OurPromiseNeeded,
    /// Waiting for the rest of the promise set.
    Promising,
    /// Every peer promised; our commit signature is missing.
    OurCommitNeeded,
    /// A majority of commit approvals: the operation is agreed.
    Consensus,
    /// A promise rejection, or a majority of commit rejections.
    Rejected,
    /// Nothing for us to add; keep forwarding.
    Propagating,
}

struct ActiveRecord {
    record: ClusterRecord,
    received_at: u64,
    /// Set exactly once, when the record first reaches consensus.
    result: Option<RepoResult>,
}

/// A cluster member: receives records, contributes signatures, applies
/// agreed operations to the local storage repo exactly once, and tracks the
/// active record set for conflict detection.
pub struct ClusterMember {
    keypair: Keypair,
    repo: Arc<StorageRepo>,
    options: MemberOptions,
    active: Mutex<HashMap<String, ActiveRecord>>,
}

impl ClusterMember {
    pub fn new(keypair: Keypair, repo: Arc<StorageRepo>, options: MemberOptions) -> Self {
        Self {
            keypair,
            repo,
            options,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn peer_id(&self) -> tessera_model::PeerId {
        self.keypair.peer_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn repo(&self) -> &Arc<StorageRepo> {
        &self.repo
    }

    /// Classify `record` per the member state table.
    pub fn classify(&self, record: &ClusterRecord) -> RecordState {
        if record.any_promise_reject() || record.commit_rejects() >= record.majority() {
            return RecordState::Rejected;
        }
        if record.commit_approvals() >= record.majority() {
            return RecordState::Consensus;
        }
        let us = self.keypair.peer_id();
        let member_of = record.peers.contains_key(&us);
        if member_of && !record.promises.contains_key(&us) {
            return RecordState::OurPromiseNeeded;
        }
        if record.promises.len() < record.peers.len() {
            return RecordState::Promising;
        }
        if member_of && !record.commits.contains_key(&us) {
            return RecordState::OurCommitNeeded;
        }
        RecordState::Propagating
    }

    /// Handle an incoming record: validate, merge into the active set, run
    /// the state machine as far as it goes, and return the merged view.
    ///
    /// Invalid records error out and must not be propagated further.
    pub async fn update(&self, incoming: ClusterRecord) -> Result<ClusterRecord, ClusterError> {
        incoming.validate()?;
        if now_millis() > incoming.message.expiration {
            return Err(ClusterError::Expired);
        }

        let hash = incoming.message_hash.clone();
        let block_ids: BTreeSet<BlockId> = incoming.block_ids().into_iter().collect();

        let mut active = self.active.lock().await;

        // A record conflicts when its blocks intersect another in-flight
        // record we are already bound to by an approving promise.
        let us = self.keypair.peer_id();
        let conflict = active.iter().any(|(other_hash, other)| {
            other_hash != &hash
                && !matches!(
                    self.classify(&other.record),
                    RecordState::Consensus | RecordState::Rejected
                )
                && other
                    .record
                    .promises
                    .get(&us)
                    .is_some_and(|s| s.sig_type == SignatureType::Approve)
                && other
                    .record
                    .block_ids()
                    .iter()
                    .any(|id| block_ids.contains(id))
        });

        let mut entry = match active.remove(&hash) {
            Some(mut entry) => {
                entry.record.merge(incoming)?;
                entry
            }
            None => ActiveRecord {
                record: incoming,
                received_at: now_millis(),
                result: None,
            },
        };

        loop {
            match self.classify(&entry.record) {
                RecordState::OurPromiseNeeded => {
                    if conflict {
                        debug!("rejecting record {hash}: conflicts with the active set");
                        entry.record.sign(
                            &self.keypair,
                            SignaturePhase::Promise,
                            SignatureType::Reject,
                            Some("conflicts with an active record".into()),
                        );
                    } else {
                        entry.record.sign(
                            &self.keypair,
                            SignaturePhase::Promise,
                            SignatureType::Approve,
                            None,
                        );
                    }
                }
                RecordState::OurCommitNeeded => {
                    entry.record.sign(
                        &self.keypair,
                        SignaturePhase::Commit,
                        SignatureType::Approve,
                        None,
                    );
                }
                RecordState::Consensus => {
                    if entry.result.is_none() {
                        info!("consensus on record {hash}; applying");
                        entry.result = Some(self.apply(&entry.record).await);
                    }
                    break;
                }
                RecordState::Rejected | RecordState::Promising | RecordState::Propagating => break,
            }
        }

        let record = entry.record.clone();
        if self.classify(&record) == RecordState::Rejected {
            debug!("record {hash} rejected; dropped from the active set");
        } else {
            active.insert(hash, entry);
        }
        Ok(record)
    }

    /// The locally computed outcome of a record's operation, if this member
    /// has applied it.
    pub async fn result_of(&self, message_hash: &str) -> Option<RepoResult> {
        self.active
            .lock()
            .await
            .get(message_hash)
            .and_then(|entry| entry.result.clone())
    }

    async fn apply(&self, record: &ClusterRecord) -> RepoResult {
        let message = RepoMessage {
            operations: vec![record.message.operation.clone()],
            expiration: Some(record.message.expiration),
        };
        let mut reply = execute_message(self.repo.as_ref(), message).await;
        reply.results.remove(0)
    }

    /// Timer pass: clean expired records (keeping applied ones), vote to
    /// reject records whose promise set never completed, and return the
    /// records that still need resolution so the caller can re-propagate
    /// them.
    pub async fn tick(&self, now: u64) -> Vec<ClusterRecord> {
        let mut active = self.active.lock().await;
        let mut to_resolve = Vec::new();
        active.retain(|hash, entry| {
            let mut state = self.classify(&entry.record);
            if now > entry.record.message.expiration {
                if state != RecordState::Consensus {
                    debug!("record {hash} expired in state {state:?}; cleaned");
                    return false;
                }
                return true;
            }
            if matches!(state, RecordState::Promising | RecordState::Propagating)
                && now.saturating_sub(entry.received_at) > self.options.promise_timeout_ms
            {
                warn!("record {hash} stalled; voting to reject");
                entry.record.sign(
                    &self.keypair,
                    SignaturePhase::Commit,
                    SignatureType::Reject,
                    Some("promise timeout".into()),
                );
                state = self.classify(&entry.record);
            }
            if !matches!(state, RecordState::Consensus | RecordState::Rejected) {
                to_resolve.push(entry.record.clone());
            }
            state != RecordState::Rejected
        });
        to_resolve
    }
}
