//! Integration tests for tree-network membership reconciled at barriers.

use std::sync::Arc;
use std::thread;

use smc2_core::{Communicator, TreeNode, ThreadComm};

#[test]
fn test_join_then_leave_scenario() {
    let node: TreeNode<&str> = TreeNode::new();
    node.add_child("h1");
    node.add_child("h2");
    assert_eq!(node.update_children(), 2);
    assert_eq!(node.children(), vec!["h1", "h2"]);

    node.remove_child("h1");
    assert_eq!(node.update_children(), 1);
    assert_eq!(node.children(), vec!["h2"]);
}

#[test]
fn test_requests_from_every_rank_reconciled_once() {
    // Each participant queues requests on a shared node between two barriers;
    // rank 0 reconciles, and every rank then sees the same children.
    const RANKS: usize = 6;
    let node: Arc<TreeNode<u32>> = Arc::new(TreeNode::new());
    for h in [100, 101, 102] {
        node.add_child(h);
    }
    node.update_children();

    let handles: Vec<_> = ThreadComm::group(RANKS)
        .into_iter()
        .map(|comm| {
            let node = Arc::clone(&node);
            thread::spawn(move || {
                let rank = comm.rank() as u32;
                node.add_child(rank);
                if rank % 2 == 1 {
                    node.remove_child(rank);
                }
                if rank < 3 {
                    node.remove_child(100 + rank);
                }
                comm.barrier();
                if comm.is_root() {
                    node.update_children();
                }
                comm.barrier();
                let seen = node.children();
                // a collective over the reconciled group agrees on its size
                let total = comm.all_reduce_sum_u64(seen.len() as u64);
                (seen, total)
            })
        })
        .collect();

    let expected = vec![0, 2, 4];
    for h in handles {
        let (seen, total) = h.join().unwrap();
        assert_eq!(seen, expected);
        assert_eq!(total, (RANKS * expected.len()) as u64);
    }
    assert_eq!(node.pending(), (0, 0));
    assert_eq!(node.update_children(), expected.len());
}

#[test]
fn test_parent_link_replaced() {
    let node: TreeNode<u8> = TreeNode::new();
    assert_eq!(node.parent(), None);
    node.set_parent(Some(3));
    node.set_parent(Some(9));
    assert_eq!(node.parent(), Some(9));
    node.set_parent(None);
    assert_eq!(node.parent(), None);
}
