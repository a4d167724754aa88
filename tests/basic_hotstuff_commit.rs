//! Scenario 1 (spec.md §8): genesis commit, n=4, basic HotStuff. The
//! bootstrap leader `r_0` receives `"Genesis block"`, every replica should
//! write `0.txt` with a matching, non-empty-validation block within a few
//! view-phase round trips.

mod common;

use std::time::Duration;

use bft_orderer::protocol::ConsensusKind;
use bft_orderer::types::NodeId;
use common::Cluster;

#[tokio::test]
async fn genesis_command_commits_on_every_replica() {
    let cluster = Cluster::start(ConsensusKind::BasicHotStuff, 4).await;

    cluster.submit(&NodeId::from_index(0), b"Genesis block".to_vec()).await;

    let committed = cluster.wait_for_height(1, Duration::from_secs(5)).await;
    assert!(committed, "every replica should reach height 1");

    let leader_block = cluster.block_store(0).read_block(0).unwrap().unwrap();
    assert_eq!(leader_block.data.transactions, vec![b"Genesis block".to_vec()]);
    assert!(!leader_block.header.validation.is_empty());

    for i in 1..4u32 {
        let block = cluster.block_store(i).read_block(0).unwrap().unwrap();
        assert_eq!(block.hash(), leader_block.hash(), "replica {i} diverged from the leader's committed block");
    }

    cluster.stop_all().await;
}
