//! Promise/commit consensus across in-process members.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{peer_info, LoopbackNetwork, StaticDirectory};
use serde_json::json;
use tessera_cluster::{
    ClusterCoordinator, ClusterError, ClusterMember, ClusterMessage, ClusterRecord, Keypair,
    MemberOptions, RecordState, RepoOperation, RepoResult,
};
use tessera_common::now_millis;
use tessera_model::{
    Block, BlockHeader, BlockId, BlockType, CollectionId, CommitRequest, PendOutcome, PendPolicy,
    PendRequest, TrxId, Transforms,
};
use tessera_storage::{Memory, StorageRepo};

fn member() -> Arc<ClusterMember> {
    Arc::new(ClusterMember::new(
        Keypair::generate(),
        Arc::new(StorageRepo::new(Arc::new(Memory::new()))),
        MemberOptions::default(),
    ))
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

fn cluster_of(members: &[&Arc<ClusterMember>]) -> (Arc<StaticDirectory>, Arc<LoopbackNetwork>) {
    let peers: BTreeMap<_, _> = members
        .iter()
        .map(|m| (m.peer_id(), peer_info(m)))
        .collect();
    let directory = Arc::new(StaticDirectory::new(peers));
    let network = Arc::new(LoopbackNetwork::default());
    for m in members {
        network.register(Arc::clone(m));
    }
    (directory, network)
}

fn deadline() -> u64 {
    now_millis() + 60_000
}

#[tokio::test]
async fn three_peer_pend_reaches_every_repo() {
    let members = [member(), member(), member()];
    let refs: Vec<&Arc<ClusterMember>> = members.iter().collect();
    let (directory, network) = cluster_of(&refs);
    let coordinator =
        ClusterCoordinator::new(Arc::clone(&members[0]), directory, network, vec![]);

    let result = coordinator
        .execute(pend_op("a", 1, trx(1)), deadline())
        .await
        .unwrap();
    match result {
        RepoResult::Pend(PendOutcome::Success(success)) => {
            assert_eq!(success.block_ids, vec![BlockId::new("a")]);
        }
        other => panic!("expected pend success, got {other:?}"),
    }

    // Consensus applied the pend on every member's repo.
    for m in &members {
        let pendings = m
            .repo()
            .block(&BlockId::new("a"))
            .list_pending_transactions()
            .await
            .unwrap();
        assert_eq!(pendings, vec![trx(1)], "peer {}", m.peer_id());
    }
}

#[tokio::test]
async fn pend_then_commit_materializes_everywhere() {
    let members = [member(), member(), member()];
    let refs: Vec<&Arc<ClusterMember>> = members.iter().collect();
    let (directory, network) = cluster_of(&refs);
    let coordinator = ClusterCoordinator::new(
        Arc::clone(&members[0]),
        Arc::clone(&directory) as _,
        network,
        vec![],
    );

    coordinator
        .execute(pend_op("a", 7, trx(1)), deadline())
        .await
        .unwrap();
    let result = coordinator
        .execute(
            RepoOperation::Commit(CommitRequest {
                block_ids: vec![BlockId::new("a")],
                trx_id: trx(1),
                rev: 1,
                tail_id: BlockId::new("a"),
                header_id: None,
            }),
            deadline(),
        )
        .await
        .unwrap();
    assert!(matches!(
        result,
        RepoResult::Commit(tessera_model::CommitOutcome::Success(_))
    ));

    for m in &members {
        let latest = m
            .repo()
            .block(&BlockId::new("a"))
            .get_latest()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.rev, 1, "peer {}", m.peer_id());
    }
}

#[tokio::test]
async fn solo_cluster_degenerates_to_local_apply() {
    let m = member();
    let (directory, network) = cluster_of(&[&m]);
    let coordinator = ClusterCoordinator::new(Arc::clone(&m), directory, network, vec![]);

    let result = coordinator
        .execute(pend_op("a", 1, trx(1)), deadline())
        .await
        .unwrap();
    assert!(matches!(
        result,
        RepoResult::Pend(PendOutcome::Success(_))
    ));
}

#[tokio::test]
async fn conflicting_record_draws_a_promise_rejection() {
    let members = [member(), member(), member()];
    let refs: Vec<&Arc<ClusterMember>> = members.iter().collect();
    let (directory, network) = cluster_of(&refs);
    let coordinator0 =
        ClusterCoordinator::new(Arc::clone(&members[0]), Arc::clone(&directory) as _,
            Arc::clone(&network) as _, vec![]);

    // Leave a first record in flight at member 1: deliver only its promise
    // phase by hand.
    let peers: BTreeMap<_, _> = members.iter().map(|m| (m.peer_id(), peer_info(m))).collect();
    let first = ClusterRecord::new(
        peers.clone(),
        ClusterMessage {
            operation: pend_op("a", 1, trx(1)),
            expiration: deadline(),
        },
    )
    .unwrap();
    let first = members[1].update(first).await.unwrap();
    assert_eq!(members[1].classify(&first), RecordState::Promising);

    // A second transaction touching the same block now fails consensus.
    let err = coordinator0
        .execute(pend_op("a", 2, trx(2)), deadline())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::ConsensusFailed(_)), "{err}");
}

#[tokio::test]
async fn expired_records_are_refused_and_cleaned() {
    let m = member();
    let peers: BTreeMap<_, _> = [(m.peer_id(), peer_info(&m))].into();
    let expired = ClusterRecord::new(
        peers,
        ClusterMessage {
            operation: pend_op("a", 1, trx(1)),
            expiration: now_millis().saturating_sub(10),
        },
    )
    .unwrap();

    assert!(matches!(
        m.update(expired).await,
        Err(ClusterError::Expired)
    ));
}

#[tokio::test]
async fn tampered_records_are_dropped() {
    let m = member();
    let outsider = Keypair::generate();
    let peers: BTreeMap<_, _> = [(m.peer_id(), peer_info(&m))].into();
    let mut record = ClusterRecord::new(
        peers,
        ClusterMessage {
            operation: pend_op("a", 1, trx(1)),
            expiration: deadline(),
        },
    )
    .unwrap();

    // Operation swapped after hashing.
    let mut tampered = record.clone();
    tampered.message.expiration += 1;
    assert!(matches!(
        m.update(tampered).await,
        Err(ClusterError::HashMismatch)
    ));

    // Signature from a peer outside the record's peer set.
    record.sign(
        &outsider,
        tessera_cluster::SignaturePhase::Promise,
        tessera_cluster::SignatureType::Approve,
        None,
    );
    assert!(matches!(
        m.update(record).await,
        Err(ClusterError::SignatureInvalid)
    ));
}

#[tokio::test]
async fn resolution_timers_drive_a_stalled_record_to_consensus() {
    let members = [member(), member(), member()];
    let refs: Vec<&Arc<ClusterMember>> = members.iter().collect();
    let (_, network) = cluster_of(&refs);

    // The record reaches only member 0; nobody drives the phases.
    let peers: BTreeMap<_, _> = members.iter().map(|m| (m.peer_id(), peer_info(m))).collect();
    let record = ClusterRecord::new(
        peers,
        ClusterMessage {
            operation: pend_op("a", 1, trx(1)),
            expiration: deadline(),
        },
    )
    .unwrap();
    let record = members[0].update(record).await.unwrap();
    assert_eq!(members[0].classify(&record), RecordState::Promising);

    // The resolution timer re-propagates until the cluster converges.
    let timer = tessera_cluster::spawn_timers(
        Arc::clone(&members[0]),
        Arc::clone(&network) as _,
        50,
    );

    let mut applied = false;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let pendings = members[0]
            .repo()
            .block(&BlockId::new("a"))
            .list_pending_transactions()
            .await
            .unwrap();
        if pendings == vec![trx(1)] {
            applied = true;
            break;
        }
    }
    timer.abort();
    assert!(applied, "record never reached consensus via the timers");
}

#[tokio::test]
async fn stalled_records_time_out_via_tick() {
    let m = member();
    let other = member();
    let peers: BTreeMap<_, _> = [
        (m.peer_id(), peer_info(&m)),
        (other.peer_id(), peer_info(&other)),
    ]
    .into();
    let record = ClusterRecord::new(
        peers,
        ClusterMessage {
            operation: pend_op("a", 1, trx(1)),
            expiration: deadline(),
        },
    )
    .unwrap();

    // Our promise goes on, but the other peer never answers.
    let record = m.update(record).await.unwrap();
    assert_eq!(m.classify(&record), RecordState::Promising);

    // Past the promise timeout the member votes to reject; with two peers
    // one vote is not a majority, so the record stays in flight for the
    // resolution poll to circulate.
    let far_future = now_millis() + MemberOptions::default().promise_timeout_ms + 1_000;
    let to_resolve = m.tick(far_future).await;
    assert_eq!(to_resolve.len(), 1);
    assert_eq!(to_resolve[0].commit_rejects(), 1);

    // Once the record's expiration passes it is cleaned from the active
    // set entirely.
    let past_expiration = record.message.expiration + 1;
    assert!(m.tick(past_expiration).await.is_empty());
    assert!(m.tick(far_future).await.is_empty());
}
