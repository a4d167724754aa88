//! Scenario 2 (spec.md §8): sequential batch commits, n=4, chained
//! HotStuff. The three-chain rule only commits a proposal once two further
//! proposals have been certified on top of it, so committing `BATCHES`
//! blocks needs `BATCHES + 2` proposals in flight; this submits all of them
//! up front, spaced enough apart for the leader's batcher to flush each one
//! into its own proposal, rather than waiting for each one to commit before
//! sending the next. Checks the resulting chain of committed blocks links
//! by `prev_block_hash` with no gaps and carries every submitted command
//! exactly once.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use bft_orderer::protocol::ConsensusKind;
use bft_orderer::types::NodeId;
use common::Cluster;

#[tokio::test]
async fn sequential_batches_commit_with_unbroken_chain() {
    let cluster = Cluster::start(ConsensusKind::ChainedHotStuff, 4).await;
    let leader = NodeId::from_index(0);

    const BATCHES: u64 = 6;
    let mut submitted = HashSet::new();
    for i in 0..BATCHES + 2 {
        let command = format!("batch-{i}").into_bytes();
        submitted.insert(command.clone());
        cluster.submit(&leader, command).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let committed = cluster.wait_for_height(BATCHES, Duration::from_secs(5)).await;
    assert!(committed, "every replica should commit at least {BATCHES} blocks");

    let leader_height = cluster.block_store(0).get_block_height();
    for node in 0..4u32 {
        let store = cluster.block_store(node);
        assert_eq!(store.get_block_height(), leader_height, "replica {node} committed height diverged from the leader");

        let mut previous_hash = None;
        let mut seen = HashSet::new();
        for height in 0..leader_height {
            let block = store.read_block(height).unwrap().unwrap();
            assert_eq!(block.data.transactions.len(), 1, "each proposal carried exactly one command");
            let command = block.data.transactions[0].clone();
            assert!(submitted.contains(&command), "committed a command nobody submitted");
            assert!(seen.insert(command), "the same command committed twice on replica {node}");
            if let Some(prev) = previous_hash {
                assert_eq!(block.header.prev_block_hash, prev, "chain broken at replica {node} height {height}");
            }
            previous_hash = Some(block.hash());
        }
    }

    cluster.stop_all().await;
}
