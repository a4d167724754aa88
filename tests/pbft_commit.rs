//! Scenario 3 (spec.md §8) normal-case slice: single command, n=4, PBFT.
//! Checks the `PRE_PREPARE -> PREPARE -> COMMIT` chain lands the same
//! block on every replica and that the primary unicasts a `REPLY` back to
//! the client once it commits. View-change-on-primary-fault is not
//! exercised here (it hinges on the real wall-clock prepare-timer firing,
//! which this in-process harness does not control).

mod common;

use std::time::Duration;

use bft_orderer::message::ConsensusPayload;
use bft_orderer::protocol::ConsensusKind;
use bft_orderer::types::NodeId;
use common::Cluster;

#[tokio::test]
async fn single_command_commits_and_replies() {
    let cluster = Cluster::start(ConsensusKind::Pbft, 4).await;
    let leader = NodeId::from_index(0);

    cluster.submit(&leader, b"pbft command".to_vec()).await;

    let committed = cluster.wait_for_height(1, Duration::from_secs(5)).await;
    assert!(committed, "every replica should reach height 1");

    let leader_block = cluster.block_store(0).read_block(0).unwrap().unwrap();
    assert_eq!(leader_block.data.transactions, vec![b"pbft command".to_vec()]);

    for i in 1..4u32 {
        let block = cluster.block_store(i).read_block(0).unwrap().unwrap();
        assert_eq!(block.hash(), leader_block.hash(), "replica {i} diverged from the leader's committed block");
    }

    let reply = cluster
        .recv_client_message(Duration::from_secs(5))
        .await
        .expect("primary should unicast a REPLY once it commits");
    match reply.payload {
        ConsensusPayload::Reply { seq, .. } => assert_eq!(seq, 0),
        other => panic!("expected a REPLY, got {other:?}"),
    }

    cluster.stop_all().await;
}
