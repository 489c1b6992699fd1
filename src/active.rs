use std::sync::Arc;

use slab::Slab;

use crate::op::CollOp;

/// The list of in-flight operations, polled in insertion order.
///
/// Nodes live in a slab so indices stay stable while the driver walks
/// the list without holding the lock across poll calls; `next`/`prev`
/// links give O(1) removal from the middle. The list mutex guards
/// only the structure, never an op's state machine.
pub(crate) struct ActiveList {
    nodes: Slab<ActiveNode>,
    head: Option<usize>,
    tail: Option<usize>,
}

struct ActiveNode {
    op: Arc<CollOp>,
    next: Option<usize>,
    prev: Option<usize>,
}

impl ActiveList {
    pub fn new() -> ActiveList {
        ActiveList {
            nodes: Slab::new(),
            head: None,
            tail: None,
        }
    }

    /// Appends at the tail, preserving poll order.
    pub fn insert(&mut self, op: Arc<CollOp>) -> usize {
        let prev = self.tail;
        let idx = self.nodes.insert(ActiveNode {
            op,
            next: None,
            prev,
        });

        match prev {
            Some(t) => self.nodes[t].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        idx
    }

    pub fn remove(&mut self, idx: usize) -> Arc<CollOp> {
        let node = self.nodes.remove(idx);

        match node.prev {
            Some(p) => self.nodes[p].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.nodes[n].prev = node.prev,
            None => self.tail = node.prev,
        }

        node.op
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn next(&self, idx: usize) -> Option<usize> {
        self.nodes[idx].next
    }

    pub fn op(&self, idx: usize) -> &Arc<CollOp> {
        &self.nodes[idx].op
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::ActiveList;
    use crate::flags::Flags;
    use crate::handle::CollHandle;
    use crate::op::{BroadcastArgs, CollArgs, CollOp, ConstPtr, GenericData, MutPtr, Options,
                    PollOutcome};

    fn dummy_op(sequence: u32) -> Arc<CollOp> {
        let args = CollArgs::Broadcast(BroadcastArgs {
            dst: MutPtr(std::ptr::null_mut()),
            src_node: 0,
            src: ConstPtr(std::ptr::null()),
            nbytes: 0,
        });
        Arc::new(CollOp {
            team_id: 0,
            sequence,
            flags: Flags::empty(),
            handle: CollHandle::INVALID,
            agg: None,
            poll_fn: |_, _, _, _| PollOutcome::pending(),
            data: Mutex::new(GenericData::new(args, Options::empty())),
        })
    }

    fn sequences(list: &ActiveList) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = list.head();
        while let Some(idx) = cur {
            out.push(list.op(idx).sequence);
            cur = list.next(idx);
        }
        out
    }

    #[test]
    fn insertion_order_is_poll_order() {
        let mut list = ActiveList::new();
        for seq in 0..4 {
            list.insert(dummy_op(seq));
        }
        assert_eq!(sequences(&list), vec![0, 1, 2, 3]);
    }

    #[test]
    fn middle_removal_keeps_links() {
        let mut list = ActiveList::new();
        let _a = list.insert(dummy_op(0));
        let b = list.insert(dummy_op(1));
        let _c = list.insert(dummy_op(2));

        let removed = list.remove(b);
        assert_eq!(removed.sequence, 1);
        assert_eq!(sequences(&list), vec![0, 2]);

        // Tail insert after a middle removal still lands last.
        list.insert(dummy_op(3));
        assert_eq!(sequences(&list), vec![0, 2, 3]);
    }

    #[test]
    fn drains_to_empty() {
        let mut list = ActiveList::new();
        let a = list.insert(dummy_op(0));
        let b = list.insert(dummy_op(1));
        list.remove(a);
        list.remove(b);
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert_eq!(list.head(), None);
    }
}
