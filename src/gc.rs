//! Snapshot-driven reclamation: the pending-delete list and the GC chain.
//!
//! A logically deleted node stays linked in the index so older snapshots can
//! still observe it. It is first parked on a lock-free pending list; the next
//! snapshot seals the accumulated list into a bucket keyed by that snapshot's
//! sequence number and inserts the bucket into the GC chain (a second
//! skiplist ordered by sequence number). When no live snapshot is older than
//! a bucket, the bucket is drained: every parked node is soft-deleted from
//! the index, unlinked by traversal, and handed to the epoch collector.
//!
//! Draining is cooperative: any snapshot close may trigger it, and an
//! on-demand sweep can run it as well.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{Guard, Shared};

use crate::{ActionBuffer, DEFAULT_HEIGHT_P, Item, Node, SkipList, default_key_cmp};

/// The GC chain holds few, short-lived buckets; a shallow tower is plenty.
const GC_CHAIN_MAX_LEVEL: usize = 8;

/// Lock-free intrusive stack of nodes awaiting a GC bucket.
///
/// Nodes are threaded through their `gc_link` field, so parking a node costs
/// one CAS and no allocation.
pub(crate) struct PendingList {
    head: AtomicUsize,
}

impl PendingList {
    pub(crate) fn new() -> PendingList {
        PendingList {
            head: AtomicUsize::new(0),
        }
    }

    /// Parks `node`. The caller must be the thread that won the dead-stamp
    /// CAS, so each node is pushed exactly once.
    pub(crate) fn push(&self, node: *const Node) {
        let n = unsafe {
            // SAFETY: the node is linked in the index and cannot be reclaimed
            // before it has moved through a GC bucket.
            &*node
        };
        loop {
            let h = self.head.load(Ordering::Acquire);
            n.gc_link.store(h, Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(h, node as usize, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Detaches the whole list, returning the head of the intrusive chain
    /// (zero when empty).
    pub(crate) fn take_all(&self) -> usize {
        self.head.swap(0, Ordering::AcqRel)
    }
}

/// An ordered set of per-snapshot buckets of retired index nodes.
pub(crate) struct GcChain {
    list: SkipList,
}

impl GcChain {
    pub(crate) fn new() -> GcChain {
        GcChain {
            // Keys are big-endian sequence numbers, so the default bytewise
            // comparator yields numeric order.
            list: SkipList::new(default_key_cmp, GC_CHAIN_MAX_LEVEL, DEFAULT_HEIGHT_P),
        }
    }

    /// Number of buckets currently in the chain.
    pub(crate) fn bucket_count(&self) -> u64 {
        self.list.get_stats().node_count
    }

    /// Seals `chain_head` (an intrusive list of dead index nodes) into a
    /// bucket keyed by `sn`. Empty windows produce no bucket.
    pub(crate) fn add_bucket(&self, sn: u64, chain_head: usize, guard: &Guard) {
        if chain_head == 0 {
            return;
        }
        let key = sn.to_be_bytes();
        let mut buf = ActionBuffer::new(self.list.max_level());
        self.list.insert_item(
            Item::new(&key, sn, None),
            chain_head as *mut u8,
            &mut buf,
            guard,
        );
    }

    /// Drains every bucket with `sn <= horizon`, soft-deleting its parked
    /// nodes from `store`. Returns the number of nodes handed over. Safe to
    /// call from multiple closing threads at once: each bucket is claimed by
    /// exactly one drainer.
    pub(crate) fn drain_upto(&self, horizon: u64, store: &SkipList, guard: &Guard) -> usize {
        let mut freed = 0usize;
        let mut chain_buf = ActionBuffer::new(self.list.max_level());
        let mut store_buf = ActionBuffer::new(store.max_level());

        let mut curr = self.list.next_node(self.list.head(), 0, guard);
        while !self.list.is_tail(curr.as_raw()) {
            let c = unsafe {
                // SAFETY: observed in the chain under `guard`.
                curr.deref()
            };
            let sn = {
                let bytes = c.item().bytes();
                // SAFETY: bucket keys are always written as 8 big-endian
                // bytes in `add_bucket`.
                u64::from_be_bytes(unsafe { bytes.try_into().unwrap_unchecked() })
            };
            if sn > horizon {
                break;
            }
            let next = self.list.next_node(curr, 0, guard);

            // Claim the bucket; concurrent drainers race on this swap.
            let chain_head = c.payload.swap(ptr::null_mut(), Ordering::AcqRel);
            if !chain_head.is_null() {
                let mut link = chain_head as usize;
                while link != 0 {
                    let node = link as *const Node;
                    let n = unsafe {
                        // SAFETY: parked nodes stay allocated until their
                        // soft delete below retires them.
                        &*node
                    };
                    link = n.gc_link.load(Ordering::Relaxed);
                    if store.delete_node(Shared::from(node), &mut store_buf, guard) {
                        freed += 1;
                    }
                }
            }
            self.list.delete_node(curr, &mut chain_buf, guard);
            curr = next;
        }
        freed
    }
}
