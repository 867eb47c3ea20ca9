//! In-process doubles for the transport traits.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tessera_cluster::{
    wire::{execute_message, RepoMessage, RepoReply},
    ClusterError, ClusterMember, ClusterNetwork, ClusterRecord, PeerDirectory, PeerInfo, RepoLink,
};
use tessera_model::{BlockId, PeerId, Transactor};

pub fn peer_info(member: &ClusterMember) -> PeerInfo {
    PeerInfo {
        multiaddr: vec![],
        public_key: member.keypair().public_key_base64url(),
    }
}

/// Routes record updates directly to in-process members.
#[derive(Default)]
pub struct LoopbackNetwork {
    members: Mutex<HashMap<PeerId, Arc<ClusterMember>>>,
}

impl LoopbackNetwork {
    pub fn register(&self, member: Arc<ClusterMember>) {
        self.members.lock().insert(member.peer_id(), member);
    }
}

#[async_trait]
impl ClusterNetwork for LoopbackNetwork {
    async fn update(
        &self,
        peer: &PeerId,
        _info: &PeerInfo,
        record: ClusterRecord,
    ) -> Result<ClusterRecord, ClusterError> {
        let member = self
            .members
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| ClusterError::Unreachable(peer.clone(), "not registered".into()))?;
        member.update(record).await
    }
}

/// A directory with a fixed assignment of blocks to coordinators and one
/// shared cluster.
pub struct StaticDirectory {
    pub coordinators: Mutex<HashMap<BlockId, Vec<(PeerId, PeerInfo)>>>,
    pub cluster: BTreeMap<PeerId, PeerInfo>,
}

impl StaticDirectory {
    pub fn new(cluster: BTreeMap<PeerId, PeerInfo>) -> Self {
        Self {
            coordinators: Mutex::new(HashMap::new()),
            cluster,
        }
    }

    /// Assign coordinators for `block_id`, in preference order; discovery
    /// returns the first non-excluded one.
    pub fn assign(&self, block_id: &str, order: Vec<(PeerId, PeerInfo)>) {
        self.coordinators
            .lock()
            .insert(BlockId::new(block_id), order);
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn find_coordinator(
        &self,
        block_id: &BlockId,
        excluded: &HashSet<PeerId>,
    ) -> Result<(PeerId, PeerInfo), ClusterError> {
        let coordinators = self.coordinators.lock();
        let order = coordinators
            .get(block_id)
            .ok_or_else(|| ClusterError::CoordinatorNone(block_id.clone()))?;
        order
            .iter()
            .find(|(peer_id, _)| !excluded.contains(peer_id))
            .cloned()
            .ok_or_else(|| ClusterError::CoordinatorNone(block_id.clone()))
    }

    async fn find_cluster(
        &self,
        _block_id: &BlockId,
    ) -> Result<BTreeMap<PeerId, PeerInfo>, ClusterError> {
        Ok(self.cluster.clone())
    }
}

/// Dispatches repo messages to in-process transactors, with optional
/// injected failures.
#[derive(Default)]
pub struct LoopbackLink {
    servers: Mutex<HashMap<PeerId, Arc<dyn Transactor>>>,
    failing: Mutex<HashSet<PeerId>>,
    pub sent: Mutex<Vec<PeerId>>,
}

impl LoopbackLink {
    pub fn register(&self, peer_id: PeerId, server: Arc<dyn Transactor>) {
        self.servers.lock().insert(peer_id, server);
    }

    pub fn fail(&self, peer_id: &PeerId) {
        self.failing.lock().insert(peer_id.clone());
    }
}

#[async_trait]
impl RepoLink for LoopbackLink {
    async fn send(
        &self,
        peer: &PeerId,
        _info: &PeerInfo,
        message: RepoMessage,
    ) -> Result<RepoReply, ClusterError> {
        self.sent.lock().push(peer.clone());
        if self.failing.lock().contains(peer) {
            return Err(ClusterError::Unreachable(peer.clone(), "injected".into()));
        }
        let server = self
            .servers
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| ClusterError::Unreachable(peer.clone(), "not registered".into()))?;
        Ok(execute_message(server.as_ref(), message).await)
    }
}
