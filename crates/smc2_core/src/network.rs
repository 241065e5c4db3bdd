//! Tree-network membership
//!
//! A node of the overlay that groups compute nodes for collective
//! communication. Children may ask to join or leave at any time from any
//! thread; requests are queued and only reach the `active` set at
//! [`TreeNode::update_children`], which the caller runs at a barrier where no
//! collective over the children is in flight.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

#[derive(Debug)]
struct Membership<H> {
    active: BTreeSet<H>,
    pending_join: BTreeSet<H>,
    pending_leave: BTreeSet<H>,
}

/// Membership record for one node. `H` is a communication handle.
#[derive(Debug)]
pub struct TreeNode<H> {
    parent: Mutex<Option<H>>,
    members: Mutex<Membership<H>>,
}

impl<H: Ord + Clone + core::fmt::Debug> Default for TreeNode<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Ord + Clone + core::fmt::Debug> TreeNode<H> {
    /// A node with no parent and no children.
    pub fn new() -> Self {
        Self {
            parent: Mutex::new(None),
            members: Mutex::new(Membership {
                active: BTreeSet::new(),
                pending_join: BTreeSet::new(),
                pending_leave: BTreeSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Membership<H>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the upward link. `None` detaches the node.
    pub fn set_parent(&self, handle: Option<H>) {
        *self.parent.lock().unwrap_or_else(PoisonError::into_inner) = handle;
    }

    pub fn parent(&self) -> Option<H> {
        self.parent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue `handle` to join. Returns `|active| + |pending_join|` as seen
    /// just before the insertion; concurrent joins may make it stale.
    pub fn add_child(&self, handle: H) -> usize {
        let mut m = self.lock();
        let n = m.active.len() + m.pending_join.len();
        debug!("child {:?} requested to join (group size estimate {})", handle, n);
        m.pending_join.insert(handle);
        n
    }

    /// Queue `handle` to leave.
    pub fn remove_child(&self, handle: H) {
        let mut m = self.lock();
        debug!("child {:?} requested to leave", handle);
        m.pending_leave.insert(handle);
    }

    /// Merge pending joins, then drop pending leaves. Returns `|active|`.
    pub fn update_children(&self) -> usize {
        let mut m = self.lock();
        let joins = core::mem::take(&mut m.pending_join);
        m.active.extend(joins);
        let leaves = core::mem::take(&mut m.pending_leave);
        for handle in &leaves {
            m.active.remove(handle);
        }
        assert!(
            m.pending_join.is_empty() && m.pending_leave.is_empty(),
            "pending membership requests survived reconciliation"
        );
        m.active.len()
    }

    /// Snapshot of the reconciled children.
    pub fn children(&self) -> Vec<H> {
        self.lock().active.iter().cloned().collect()
    }

    /// `(pending joins, pending leaves)` not yet reconciled.
    pub fn pending(&self) -> (usize, usize) {
        let m = self.lock();
        (m.pending_join.len(), m.pending_leave.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_join_then_leave() {
        let node: TreeNode<u32> = TreeNode::new();
        assert_eq!(node.add_child(1), 0);
        assert_eq!(node.add_child(2), 1);
        assert!(node.children().is_empty());
        assert_eq!(node.update_children(), 2);
        assert_eq!(node.children(), vec![1, 2]);

        node.remove_child(1);
        assert_eq!(node.children(), vec![1, 2]);
        assert_eq!(node.update_children(), 1);
        assert_eq!(node.children(), vec![2]);
    }

    #[test]
    fn test_update_is_idempotent() {
        let node: TreeNode<u32> = TreeNode::new();
        node.add_child(5);
        node.add_child(6);
        let first = node.update_children();
        let snapshot = node.children();
        assert_eq!(node.update_children(), first);
        assert_eq!(node.children(), snapshot);
        assert_eq!(node.pending(), (0, 0));
    }

    #[test]
    fn test_leave_wins_over_join_in_same_window() {
        let node: TreeNode<u32> = TreeNode::new();
        node.add_child(3);
        node.remove_child(3);
        assert_eq!(node.update_children(), 0);
    }

    #[test]
    fn test_parent_link() {
        let node: TreeNode<&'static str> = TreeNode::new();
        assert_eq!(node.parent(), None);
        node.set_parent(Some("root"));
        assert_eq!(node.parent(), Some("root"));
        node.set_parent(None);
        assert_eq!(node.parent(), None);
    }

    #[test]
    fn test_concurrent_requests() {
        let node: Arc<TreeNode<u32>> = Arc::new(TreeNode::new());
        for h in 0..10 {
            node.add_child(h);
        }
        node.update_children();

        let mut handles = Vec::new();
        for t in 0..8u32 {
            let node = Arc::clone(&node);
            handles.push(thread::spawn(move || {
                node.add_child(100 + t);
                if t < 5 {
                    node.remove_child(t);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let n = node.update_children();
        let expected: Vec<u32> = (5..10).chain(100..108).collect();
        assert_eq!(n, expected.len());
        assert_eq!(node.children(), expected);
    }
}
