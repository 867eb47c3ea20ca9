//! The length-prefixed JSON protocols over real sockets.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tessera_cluster::{
    wire::{serve_cluster, serve_repo, RepoMessage, RepoResult, TcpClusterNetwork, TcpRepoLink},
    ClusterCoordinator, ClusterMember, Keypair, MemberOptions, PeerInfo, RepoLink, RepoOperation,
};
use tessera_common::now_millis;
use tessera_model::{
    Block, BlockHeader, BlockId, BlockType, CollectionId, PendOutcome, PendPolicy, PendRequest,
    Transactor, TrxId, Transforms,
};
use tessera_storage::{Memory, StorageRepo};
use tokio::net::TcpListener;

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

fn pend_op(block_id: &str, value: i64, trx_id: TrxId) -> RepoOperation {
    let mut transforms = Transforms::new();
    transforms
        .inserts
        .insert(BlockId::new(block_id), block(block_id, value));
    RepoOperation::Pend(PendRequest {
        transforms,
        trx_id,
        rev: Some(1),
        policy: PendPolicy::Fail,
    })
}

#[tokio::test]
async fn repo_protocol_round_trips_over_tcp() {
    let repo: Arc<dyn Transactor> = Arc::new(StorageRepo::new(Arc::new(Memory::new())));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(serve_repo(listener, repo));

    let link = TcpRepoLink;
    let peer = tessera_model::PeerId::new("server");
    let info = PeerInfo {
        multiaddr: vec![addr.to_string()],
        public_key: String::new(),
    };

    let message = RepoMessage {
        operations: vec![pend_op("a", 5, TrxId::new("t-t-t-t-1"))],
        expiration: Some(now_millis() + 30_000),
    };
    let reply = link.send(&peer, &info, message).await.unwrap();
    assert_eq!(reply.results.len(), 1);
    match &reply.results[0] {
        RepoResult::Pend(PendOutcome::Success(success)) => {
            assert_eq!(success.block_ids, vec![BlockId::new("a")]);
        }
        other => panic!("expected pend success, got {other:?}"),
    }
}

#[tokio::test]
async fn cluster_consensus_runs_over_tcp() {
    // Peer 1 serves the cluster protocol over a socket.
    let member1 = Arc::new(ClusterMember::new(
        Keypair::generate(),
        Arc::new(StorageRepo::new(Arc::new(Memory::new()))),
        MemberOptions::default(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(serve_cluster(listener, Arc::clone(&member1)));

    // Peer 0 coordinates.
    let member0 = Arc::new(ClusterMember::new(
        Keypair::generate(),
        Arc::new(StorageRepo::new(Arc::new(Memory::new()))),
        MemberOptions::default(),
    ));

    struct FixedDirectory {
        cluster: BTreeMap<tessera_model::PeerId, PeerInfo>,
    }
    #[async_trait::async_trait]
    impl tessera_cluster::PeerDirectory for FixedDirectory {
        async fn find_coordinator(
            &self,
            block_id: &BlockId,
            _excluded: &std::collections::HashSet<tessera_model::PeerId>,
        ) -> Result<(tessera_model::PeerId, PeerInfo), tessera_cluster::ClusterError> {
            self.cluster
                .iter()
                .next()
                .map(|(id, info)| (id.clone(), info.clone()))
                .ok_or_else(|| tessera_cluster::ClusterError::CoordinatorNone(block_id.clone()))
        }
        async fn find_cluster(
            &self,
            _block_id: &BlockId,
        ) -> Result<BTreeMap<tessera_model::PeerId, PeerInfo>, tessera_cluster::ClusterError>
        {
            Ok(self.cluster.clone())
        }
    }

    let cluster: BTreeMap<_, _> = [
        (
            member0.peer_id(),
            PeerInfo {
                multiaddr: vec![],
                public_key: member0.keypair().public_key_base64url(),
            },
        ),
        (
            member1.peer_id(),
            PeerInfo {
                multiaddr: vec![addr.to_string()],
                public_key: member1.keypair().public_key_base64url(),
            },
        ),
    ]
    .into();

    let coordinator = ClusterCoordinator::new(
        Arc::clone(&member0),
        Arc::new(FixedDirectory { cluster }),
        Arc::new(TcpClusterNetwork),
        vec![],
    );

    let trx = TrxId::new("t-t-t-t-1");
    let result = coordinator
        .execute(pend_op("a", 5, trx.clone()), now_millis() + 30_000)
        .await
        .unwrap();
    assert!(matches!(result, RepoResult::Pend(PendOutcome::Success(_))));

    // The remote member applied the pend through its own repo.
    let pendings = member1
        .repo()
        .block(&BlockId::new("a"))
        .list_pending_transactions()
        .await
        .unwrap();
    assert_eq!(pendings, vec![trx]);
}
