use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use tessera_model::{hash::hash_bytes, BlockId, CancelRequest, CommitRequest, GetRequest, PendRequest, PeerId};

use crate::{keys::verify_signature, ClusterError, Keypair};

/// The peers party to a record, keyed by peer id.
pub type ClusterPeers = BTreeMap<PeerId, PeerInfo>;

/// How to reach and verify one peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub multiaddr: Vec<String>,
    /// base64url compressed public key; also the peer's id.
    pub public_key: String,
}

/// One block-store operation as carried by both wire protocols.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoOperation {
    Get(GetRequest),
    Pend(PendRequest),
    Cancel(CancelRequest),
    Commit(CommitRequest),
}

impl RepoOperation {
    /// The blocks the operation touches.
    pub fn block_ids(&self) -> Vec<BlockId> {
        match self {
            Self::Get(request) => request.block_ids.clone(),
            Self::Pend(request) => {
                tessera_model::block_ids_for_transforms(&request.transforms)
                    .into_iter()
                    .collect()
            }
            Self::Cancel(request) => request.block_ids.clone(),
            Self::Commit(request) => request.block_ids.clone(),
        }
    }
}

/// The operation under consensus, bound to an absolute expiration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMessage {
    pub operation: RepoOperation,
    pub expiration: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureType {
    Approve,
    Reject,
}

/// The protocol phase a signature belongs to. Part of the signed payload so
/// a promise cannot be replayed as a commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignaturePhase {
    Promise,
    Commit,
}

impl fmt::Display for SignaturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Promise => "promise",
            Self::Commit => "commit",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    #[serde(rename = "type")]
    pub sig_type: SignatureType,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

/// What a peer actually signs for a given record, phase and verdict.
pub fn signing_payload(message_hash: &str, phase: SignaturePhase, sig_type: SignatureType) -> Vec<u8> {
    let verdict = match sig_type {
        SignatureType::Approve => "approve",
        SignatureType::Reject => "reject",
    };
    format!("{phase}:{verdict}:{message_hash}").into_bytes()
}

/// The unit the cluster runs its two-phase promise/commit protocol over.
///
/// `message_hash` cryptographically binds `peers` and `message`; the
/// signature maps are the only fields that may differ between copies of the
/// same record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub message_hash: String,
    pub peers: ClusterPeers,
    pub message: ClusterMessage,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub promises: BTreeMap<PeerId, Signature>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commits: BTreeMap<PeerId, Signature>,
}

#[derive(Serialize)]
struct HashEnvelope<'a> {
    message: &'a ClusterMessage,
    peers: &'a ClusterPeers,
}

impl ClusterRecord {
    pub fn new(peers: ClusterPeers, message: ClusterMessage) -> Result<Self, ClusterError> {
        let message_hash = Self::compute_hash(&peers, &message)?;
        Ok(Self {
            message_hash,
            peers,
            message,
            promises: BTreeMap::new(),
            commits: BTreeMap::new(),
        })
    }

    pub fn compute_hash(peers: &ClusterPeers, message: &ClusterMessage) -> Result<String, ClusterError> {
        let bytes = serde_json::to_vec(&HashEnvelope { message, peers })?;
        Ok(hash_bytes(bytes).to_base64url())
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.message.operation.block_ids()
    }

    /// Majority threshold for commit consensus: ⌊|peers|/2⌋ + 1.
    pub fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    pub fn promise_approvals(&self) -> usize {
        count(&self.promises, SignatureType::Approve)
    }

    pub fn commit_approvals(&self) -> usize {
        count(&self.commits, SignatureType::Approve)
    }

    pub fn commit_rejects(&self) -> usize {
        count(&self.commits, SignatureType::Reject)
    }

    pub fn any_promise_reject(&self) -> bool {
        self.promises
            .values()
            .any(|s| s.sig_type == SignatureType::Reject)
    }

    /// Add this peer's signature for `phase`. A peer never overwrites a
    /// signature it already gave.
    pub fn sign(
        &mut self,
        keypair: &Keypair,
        phase: SignaturePhase,
        sig_type: SignatureType,
        reject_reason: Option<String>,
    ) {
        let peer_id = keypair.peer_id();
        let signature = Signature {
            sig_type,
            signature: keypair.sign(&signing_payload(&self.message_hash, phase, sig_type)),
            reject_reason,
        };
        let signatures = match phase {
            SignaturePhase::Promise => &mut self.promises,
            SignaturePhase::Commit => &mut self.commits,
        };
        signatures.entry(peer_id).or_insert(signature);
    }

    /// Validate the record's integrity: the hash binds message and peers,
    /// and every signature verifies under its claimed peer's key.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if Self::compute_hash(&self.peers, &self.message)? != self.message_hash {
            return Err(ClusterError::HashMismatch);
        }
        for (phase, signatures) in [
            (SignaturePhase::Promise, &self.promises),
            (SignaturePhase::Commit, &self.commits),
        ] {
            for (peer_id, signature) in signatures {
                let Some(info) = self.peers.get(peer_id) else {
                    return Err(ClusterError::SignatureInvalid);
                };
                let payload = signing_payload(&self.message_hash, phase, signature.sig_type);
                if !verify_signature(&info.public_key, &payload, &signature.signature) {
                    return Err(ClusterError::SignatureInvalid);
                }
            }
        }
        Ok(())
    }

    /// Merge `other` into `self`: non-signature fields must match exactly;
    /// promise and commit signatures are unioned (existing entries win).
    /// Returns whether anything was added.
    pub fn merge(&mut self, other: ClusterRecord) -> Result<bool, ClusterError> {
        if self.message_hash != other.message_hash {
            return Err(ClusterError::MergeMismatch);
        }
        if Self::compute_hash(&other.peers, &other.message)? != other.message_hash {
            return Err(ClusterError::HashMismatch);
        }

        let mut changed = false;
        for (peer_id, signature) in other.promises {
            if !self.peers.contains_key(&peer_id) {
                return Err(ClusterError::SignatureInvalid);
            }
            changed |= insert_new(&mut self.promises, peer_id, signature);
        }
        for (peer_id, signature) in other.commits {
            if !self.peers.contains_key(&peer_id) {
                return Err(ClusterError::SignatureInvalid);
            }
            changed |= insert_new(&mut self.commits, peer_id, signature);
        }
        Ok(changed)
    }
}

fn count(signatures: &BTreeMap<PeerId, Signature>, sig_type: SignatureType) -> usize {
    signatures.values().filter(|s| s.sig_type == sig_type).count()
}

fn insert_new(
    signatures: &mut BTreeMap<PeerId, Signature>,
    peer_id: PeerId,
    signature: Signature,
) -> bool {
    match signatures.entry(peer_id) {
        std::collections::btree_map::Entry::Vacant(entry) => {
            entry.insert(signature);
            true
        }
        std::collections::btree_map::Entry::Occupied(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn peer(keypair: &Keypair) -> (PeerId, PeerInfo) {
        (
            keypair.peer_id(),
            PeerInfo {
                multiaddr: vec!["127.0.0.1:0".into()],
                public_key: keypair.public_key_base64url(),
            },
        )
    }

    fn record(keys: &[&Keypair]) -> ClusterRecord {
        let peers: ClusterPeers = keys.iter().map(|k| peer(k)).collect();
        let message = ClusterMessage {
            operation: RepoOperation::Cancel(CancelRequest {
                block_ids: vec![BlockId::new("a")],
                trx_id: tessera_model::TrxId::new("t-t-t-t-1"),
            }),
            expiration: u64::MAX,
        };
        ClusterRecord::new(peers, message).unwrap()
    }

    #[test]
    fn hash_binds_message_and_peers() {
        let k1 = Keypair::generate();
        let k2 = Keypair::generate();
        let mut rec = record(&[&k1, &k2]);
        rec.validate().unwrap();

        // Tampering with the peer set breaks the binding.
        rec.peers.remove(&k2.peer_id());
        assert!(matches!(rec.validate(), Err(ClusterError::HashMismatch)));
    }

    #[test]
    fn signatures_verify_per_phase() {
        let k1 = Keypair::generate();
        let mut rec = record(&[&k1]);
        rec.sign(&k1, SignaturePhase::Promise, SignatureType::Approve, None);
        rec.validate().unwrap();

        // A promise signature moved into the commit map no longer verifies.
        let promise = rec.promises.remove(&k1.peer_id()).unwrap();
        rec.commits.insert(k1.peer_id(), promise);
        assert!(matches!(rec.validate(), Err(ClusterError::SignatureInvalid)));
    }

    #[test]
    fn foreign_signers_are_rejected() {
        let k1 = Keypair::generate();
        let outsider = Keypair::generate();
        let mut rec = record(&[&k1]);
        rec.sign(&outsider, SignaturePhase::Promise, SignatureType::Approve, None);
        assert!(matches!(rec.validate(), Err(ClusterError::SignatureInvalid)));
    }

    #[test]
    fn merge_unions_signatures_and_rejects_divergence() {
        let k1 = Keypair::generate();
        let k2 = Keypair::generate();
        let base = record(&[&k1, &k2]);

        let mut ours = base.clone();
        ours.sign(&k1, SignaturePhase::Promise, SignatureType::Approve, None);
        let mut theirs = base.clone();
        theirs.sign(&k2, SignaturePhase::Promise, SignatureType::Approve, None);

        assert!(ours.merge(theirs).unwrap());
        assert_eq!(ours.promise_approvals(), 2);

        // A record for a different message cannot merge.
        let other = record(&[&k1]);
        assert!(matches!(
            ours.merge(other),
            Err(ClusterError::MergeMismatch)
        ));
    }

    #[test]
    fn majority_is_floor_half_plus_one() {
        let keys: Vec<Keypair> = (0..5).map(|_| Keypair::generate()).collect();
        let refs: Vec<&Keypair> = keys.iter().collect();
        assert_eq!(record(&refs[..1]).majority(), 1);
        assert_eq!(record(&refs[..2]).majority(), 2);
        assert_eq!(record(&refs[..3]).majority(), 2);
        assert_eq!(record(&refs[..4]).majority(), 3);
        assert_eq!(record(&refs[..5]).majority(), 3);
    }
}
