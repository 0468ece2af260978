#![doc = include_str!("../README.md")]
//! The core, concurrent, lock-free skiplist implementation.
//!
//! This module provides `SkipList`, the ordered index underneath Nitro. Keys
//! are variable-length byte strings ordered by a caller-supplied comparator,
//! and every key carries the multi-version stamps (`born_sn`/`dead_sn`) that
//! the snapshot layer filters on.
//!
//! # Internals
//!
//! -   **Nodes:** each node owns one [`Item`] and a tower of forward pointers
//!     whose height is drawn from a geometric distribution.
//! -   **Deletion marks:** the single deletion-mark bit of a node lives in the
//!     tag of its own `next` pointers. A node whose level-0 pointer is tagged
//!     is logically removed; any traversal that observes the tag helps unlink
//!     the node ("help delete").
//! -   **Reclamation:** a node is handed to the epoch collector only once it
//!     has been unlinked from every level it was ever linked at, so no reader
//!     holding a guard can observe freed memory.

use std::cmp;
use std::collections::HashSet;
use std::fmt;
use std::ptr;
use std::slice;
use std::sync::{
    Arc,
    atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

pub mod batch;
pub mod db;
pub mod error;
pub mod gc;
pub mod iterator;
pub mod persistence;
pub mod snapshot;

pub use crate::db::{Config, MemoryHooks, Nitro, Writer};
pub use crate::error::NitroError;
pub use crate::iterator::Iter;
pub use crate::snapshot::Snapshot;

pub(crate) const DEFAULT_MAX_LEVEL: usize = 32;
pub(crate) const DEFAULT_HEIGHT_P: f64 = 0.25;

/// Total order on byte keys. The default is plain bytewise comparison.
pub type KeyCompare = fn(&[u8], &[u8]) -> cmp::Ordering;

/// The default bytewise key comparator.
pub fn default_key_cmp(a: &[u8], b: &[u8]) -> cmp::Ordering {
    a.cmp(b)
}

/// A key together with its multi-version stamps.
///
/// `born_sn` is the sequence number at which the key became live; `dead_sn`
/// is zero while the key is live and set exactly once when it is logically
/// deleted. Replacement after a delete always uses a fresh `Item`.
pub struct Item {
    born_sn: u64,
    dead_sn: AtomicU64,
    data: ItemData,
}

enum ItemData {
    Owned(Box<[u8]>),
    Raw {
        ptr: *mut u8,
        len: usize,
        free: unsafe fn(*mut u8, usize),
    },
}

impl Item {
    pub(crate) fn new(key: &[u8], born_sn: u64, hooks: Option<crate::db::MemoryHooks>) -> Item {
        let data = match hooks {
            Some(h) if !key.is_empty() => unsafe {
                // SAFETY: the hook contract is malloc-like: it returns a
                // writable region of at least `key.len()` bytes or null.
                let p = (h.alloc)(key.len());
                assert!(!p.is_null(), "node allocator exhausted");
                ptr::copy_nonoverlapping(key.as_ptr(), p, key.len());
                ItemData::Raw {
                    ptr: p,
                    len: key.len(),
                    free: h.free,
                }
            },
            _ => ItemData::Owned(key.into()),
        };
        Item {
            born_sn,
            dead_sn: AtomicU64::new(0),
            data,
        }
    }

    /// Returns the raw key bytes.
    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            ItemData::Owned(b) => b,
            ItemData::Raw { ptr, len, .. } => unsafe {
                // SAFETY: `ptr` points to `len` initialized bytes owned by
                // this item and freed only in its destructor.
                slice::from_raw_parts(*ptr, *len)
            },
        }
    }

    pub(crate) fn born_sn(&self) -> u64 {
        self.born_sn
    }

    pub(crate) fn dead_sn(&self) -> u64 {
        self.dead_sn.load(Ordering::Acquire)
    }

    /// Stamps the item dead at `sn`. Returns false if it was already dead.
    pub(crate) fn mark_dead(&self, sn: u64) -> bool {
        self.dead_sn
            .compare_exchange(0, sn, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Drop for Item {
    fn drop(&mut self) {
        if let ItemData::Raw { ptr, len, free } = self.data {
            unsafe {
                // SAFETY: `ptr` was produced by the paired alloc hook with
                // exactly this size and has not been freed.
                free(ptr, len);
            }
        }
    }
}

// SAFETY: the raw pointer inside `ItemData::Raw` is uniquely owned by the
// item and only ever read through `bytes()`.
unsafe impl Send for Item {}
unsafe impl Sync for Item {}

/// A skiplist node: one owned item plus a tower of tagged forward pointers.
pub(crate) struct Node {
    item: Option<Item>,
    /// Forward pointers, one per level. Tag bit 1 is the deletion mark.
    next: Vec<Atomic<Node>>,
    /// Levels this node is still linked (or about to be linked) at. The node
    /// is retired to the epoch collector when this reaches zero.
    links_remaining: AtomicUsize,
    /// Intrusive link used by the pending-delete list and the GC chain.
    pub(crate) gc_link: AtomicUsize,
    /// Auxiliary payload pointer, unused by the index itself.
    pub(crate) payload: AtomicPtr<u8>,
}

impl Node {
    fn sentinel(height: usize) -> Node {
        Node {
            item: None,
            next: (0..height).map(|_| Atomic::null()).collect(),
            links_remaining: AtomicUsize::new(height),
            gc_link: AtomicUsize::new(0),
            payload: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn new(item: Item, height: usize, payload: *mut u8) -> Node {
        Node {
            item: Some(item),
            next: (0..height).map(|_| Atomic::null()).collect(),
            links_remaining: AtomicUsize::new(height),
            gc_link: AtomicUsize::new(0),
            payload: AtomicPtr::new(payload),
        }
    }

    pub(crate) fn height(&self) -> usize {
        self.next.len()
    }

    pub(crate) fn item(&self) -> &Item {
        // SAFETY: callers only reach this through traversal positions that
        // exclude the head and tail sentinels, the only nodes without items.
        unsafe { self.item.as_ref().unwrap_unchecked() }
    }
}

// SAFETY: nodes are shared across threads by design; all mutable state is
// atomic and the item is immutable after publication.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

/// Scratch buffer holding the predecessor/successor path of one search.
///
/// Each writer owns one of these so `find_path` never allocates per
/// operation. The stored pointers are only valid for the duration of the
/// operation that filled them (under its epoch guard).
pub struct ActionBuffer {
    preds: Vec<*const Node>,
    succs: Vec<*const Node>,
}

impl ActionBuffer {
    pub(crate) fn new(max_level: usize) -> ActionBuffer {
        ActionBuffer {
            preds: vec![ptr::null(); max_level],
            succs: vec![ptr::null(); max_level],
        }
    }

    pub(crate) fn pred(&self, level: usize) -> *const Node {
        self.preds[level]
    }

    pub(crate) fn succ(&self, level: usize) -> *const Node {
        self.succs[level]
    }
}

// SAFETY: the buffer holds scratch addresses, not owned data.
unsafe impl Send for ActionBuffer {}

/// How `find_path` treats a node that compares equal to the search key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchMode {
    /// Stop at the first node `>=` the key (lookups and seeks).
    Ge,
    /// Walk past equal nodes and stop at the first node `>` the key. Inserts
    /// use this so equal-key duplicates keep their level-0 insertion order.
    Gt,
}

/// Operation counters for one skiplist.
#[derive(Default)]
pub(crate) struct Stats {
    node_allocs: CachePadded<AtomicU64>,
    node_frees: CachePadded<AtomicU64>,
    inserts: AtomicU64,
    soft_deletes: AtomicU64,
    read_conflicts: AtomicU64,
    write_conflicts: AtomicU64,
}

/// A point-in-time copy of the skiplist counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReport {
    pub node_allocs: u64,
    pub node_frees: u64,
    pub node_count: u64,
    pub inserts: u64,
    pub soft_deletes: u64,
    pub read_conflicts: u64,
    pub write_conflicts: u64,
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "node_allocs     = {}", self.node_allocs)?;
        writeln!(f, "node_frees      = {}", self.node_frees)?;
        writeln!(f, "node_count      = {}", self.node_count)?;
        writeln!(f, "inserts         = {}", self.inserts)?;
        writeln!(f, "soft_deletes    = {}", self.soft_deletes)?;
        writeln!(f, "read_conflicts  = {}", self.read_conflicts)?;
        write!(f, "write_conflicts = {}", self.write_conflicts)
    }
}

/// A lock-free ordered set of [`Item`]s keyed by a caller-supplied comparator.
///
/// Equal-key duplicates are permitted; they appear at level 0 in insertion
/// order. All coordination is single-word CAS on tagged pointers.
pub(crate) struct SkipList {
    head: *const Node,
    tail: *const Node,
    max_level: usize,
    level: CachePadded<AtomicUsize>,
    p: f64,
    cmp: KeyCompare,
    stats: Arc<Stats>,
}

// SAFETY: head/tail are immutable sentinel addresses; everything reachable
// from them is managed through atomics and the epoch collector.
unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl SkipList {
    pub(crate) fn new(cmp: KeyCompare, max_level: usize, p: f64) -> SkipList {
        let tail = Box::into_raw(Box::new(Node::sentinel(max_level)));
        let head = Box::new(Node::sentinel(max_level));
        for l in 0..max_level {
            head.next[l].store(Shared::from(tail as *const Node), Ordering::Relaxed);
        }
        SkipList {
            head: Box::into_raw(head),
            tail,
            max_level,
            level: CachePadded::new(AtomicUsize::new(0)),
            p,
            cmp,
            stats: Arc::new(Stats::default()),
        }
    }

    pub(crate) fn max_level(&self) -> usize {
        self.max_level
    }

    pub(crate) fn key_cmp(&self) -> KeyCompare {
        self.cmp
    }

    pub(crate) fn head<'g>(&self) -> Shared<'g, Node> {
        Shared::from(self.head)
    }

    pub(crate) fn is_tail(&self, node: *const Node) -> bool {
        node == self.tail
    }

    pub(crate) fn get_stats(&self) -> StatsReport {
        let allocs = self.stats.node_allocs.load(Ordering::Relaxed);
        let frees = self.stats.node_frees.load(Ordering::Relaxed);
        StatsReport {
            node_allocs: allocs,
            node_frees: frees,
            node_count: allocs.saturating_sub(frees),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            soft_deletes: self.stats.soft_deletes.load(Ordering::Relaxed),
            read_conflicts: self.stats.read_conflicts.load(Ordering::Relaxed),
            write_conflicts: self.stats.write_conflicts.load(Ordering::Relaxed),
        }
    }

    fn random_height(&self) -> usize {
        let mut h = 1;
        while h < self.max_level && fastrand::f64() < self.p {
            h += 1;
        }
        h
    }

    pub(crate) fn note_read_conflict(&self) {
        self.stats.read_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Follows the level-`level` pointer of `node`, stripping the mark tag.
    pub(crate) fn next_node<'g>(
        &self,
        node: Shared<'g, Node>,
        level: usize,
        guard: &'g Guard,
    ) -> Shared<'g, Node> {
        unsafe {
            // SAFETY: `node` was observed in the list under `guard`, which
            // keeps it from being reclaimed while we read its tower.
            node.deref().next[level]
                .load(Ordering::Acquire, guard)
                .with_tag(0)
        }
    }

    /// Unlinks the marked node `curr` from `pred` at `level`. A successful
    /// unlink at the node's last remaining level retires it to the collector.
    pub(crate) fn help_unlink<'g>(
        &self,
        pred: Shared<'g, Node>,
        curr: Shared<'g, Node>,
        succ: Shared<'g, Node>,
        level: usize,
        guard: &'g Guard,
    ) -> bool {
        let p = unsafe {
            // SAFETY: both ends were observed under `guard`.
            pred.deref()
        };
        match p.next[level].compare_exchange(
            curr.with_tag(0),
            succ.with_tag(0),
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(_) => {
                self.finish_unlink(curr, 1, guard);
                true
            }
            Err(_) => false,
        }
    }

    /// Accounts for `count` levels of `node` becoming permanently unreachable.
    /// The final accounting hands the node to the epoch collector.
    fn finish_unlink<'g>(&self, node: Shared<'g, Node>, count: usize, guard: &'g Guard) {
        let n = unsafe {
            // SAFETY: the node is pinned by `guard` until this operation ends.
            node.deref()
        };
        if n.links_remaining.fetch_sub(count, Ordering::AcqRel) == count {
            // Last link is gone: the node is unreachable from every level and
            // only guards pinned before this point may still hold it.
            let raw = node.as_raw() as usize;
            let stats = Arc::clone(&self.stats);
            guard.defer(move || unsafe {
                // SAFETY: the node was allocated with `Owned::new` and is
                // unreachable; the collector runs this after every guard that
                // could observe it has been released.
                drop(Owned::<Node>::from_raw(raw as *mut Node));
                stats.node_frees.fetch_add(1, Ordering::Relaxed);
            });
        }
    }

    /// Top-down search for `key`, filling `buf` with the predecessor and
    /// successor at every level. Marked nodes encountered on the way are
    /// helped out of the list. Returns true when an exact (non-skipped) match
    /// is present at level 0.
    ///
    /// `skip` lets the snapshot layer treat not-yet-visible items as absent
    /// during seeks.
    pub(crate) fn find_path<'g>(
        &self,
        key: &[u8],
        mode: SearchMode,
        skip: Option<&dyn Fn(&Item) -> bool>,
        buf: &mut ActionBuffer,
        guard: &'g Guard,
    ) -> bool {
        'search: loop {
            let top = self.level.load(Ordering::Acquire);
            for l in (top + 1)..self.max_level {
                buf.preds[l] = self.head;
                buf.succs[l] = self.tail;
            }

            let mut pred: Shared<'g, Node> = self.head();
            for l in (0..=top).rev() {
                let mut curr = self.next_node(pred, l, guard);
                loop {
                    if curr.as_raw() == self.tail {
                        break;
                    }
                    let c = unsafe {
                        // SAFETY: `curr` was loaded from the list under
                        // `guard`, so it has not been reclaimed.
                        curr.deref()
                    };
                    let succ = c.next[l].load(Ordering::Acquire, guard);
                    if succ.tag() == 1 {
                        // `curr` is marked at this level; unlink it before
                        // moving on. A failed CAS means the path went stale.
                        if self.help_unlink(pred, curr, succ.with_tag(0), l, guard) {
                            curr = succ.with_tag(0);
                            continue;
                        }
                        self.stats.read_conflicts.fetch_add(1, Ordering::Relaxed);
                        continue 'search;
                    }
                    let item = c.item();
                    let advance = match (self.cmp)(item.bytes(), key) {
                        cmp::Ordering::Less => true,
                        cmp::Ordering::Equal => {
                            mode == SearchMode::Gt || skip.map_or(false, |f| f(item))
                        }
                        cmp::Ordering::Greater => skip.map_or(false, |f| f(item)),
                    };
                    if advance {
                        pred = curr;
                        curr = succ.with_tag(0);
                        continue;
                    }
                    break;
                }
                buf.preds[l] = pred.as_raw();
                buf.succs[l] = curr.as_raw();
            }

            let found = buf.succs[0] != self.tail && {
                let succ = unsafe {
                    // SAFETY: the successor was just observed under `guard`.
                    &*buf.succs[0]
                };
                (self.cmp)(succ.item().bytes(), key) == cmp::Ordering::Equal
            };
            return found;
        }
    }

    /// Inserts `item` as a new node, linking bottom-up. Duplicates are
    /// allowed; a new duplicate lands after its equals at level 0.
    pub(crate) fn insert_item(
        &self,
        item: Item,
        payload: *mut u8,
        buf: &mut ActionBuffer,
        guard: &Guard,
    ) -> *const Node {
        let height = self.random_height();
        let node = Owned::new(Node::new(item, height, payload)).into_shared(guard);
        self.stats.node_allocs.fetch_add(1, Ordering::Relaxed);
        let n = unsafe {
            // SAFETY: freshly allocated and pinned by `guard`.
            node.deref()
        };
        let key = n.item().bytes();

        // Level 0 is the publication point.
        loop {
            self.find_path(key, SearchMode::Gt, None, buf, guard);
            let pred = Shared::<Node>::from(buf.preds[0]);
            let succ = Shared::<Node>::from(buf.succs[0]);
            n.next[0].store(succ, Ordering::Relaxed);
            let p = unsafe {
                // SAFETY: `pred` is on the path filled under `guard`.
                pred.deref()
            };
            match p.next[0].compare_exchange(succ, node, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => break,
                Err(_) => {
                    self.stats.write_conflicts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Link the remaining tower levels. If the node is deleted while we
        // are still linking, the unreachable upper levels are written off so
        // the unlink accounting still completes.
        let mut linked_fully = true;
        'tower: for l in 1..height {
            loop {
                let cur = n.next[l].load(Ordering::Acquire, guard);
                if cur.tag() == 1 {
                    self.finish_unlink(node, height - l, guard);
                    linked_fully = false;
                    break 'tower;
                }
                let pred = Shared::<Node>::from(buf.preds[l]);
                let succ = Shared::<Node>::from(buf.succs[l]);
                if n.next[l]
                    .compare_exchange(cur, succ, Ordering::AcqRel, Ordering::Acquire, guard)
                    .is_err()
                {
                    // Either a concurrent mark appeared or the slot is stale;
                    // re-read and decide again.
                    continue;
                }
                let p = unsafe {
                    // SAFETY: `pred` is on the most recent path for `key`.
                    pred.deref()
                };
                match p.next[l].compare_exchange(
                    succ,
                    node,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => break,
                    Err(_) => {
                        self.stats.write_conflicts.fetch_add(1, Ordering::Relaxed);
                        self.find_path(key, SearchMode::Gt, None, buf, guard);
                    }
                }
            }
        }

        if linked_fully && height > 0 {
            self.level.fetch_max(height - 1, Ordering::AcqRel);
        }
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        node.as_raw()
    }

    /// Sets the deletion mark on every level of `node`, top to bottom. The
    /// level-0 mark is the commit point; returns true if this call set it.
    pub(crate) fn soft_delete<'g>(&self, node: Shared<'g, Node>, guard: &'g Guard) -> bool {
        let n = unsafe {
            // SAFETY: pinned by `guard`.
            node.deref()
        };
        let mut won = false;
        for l in (0..n.height()).rev() {
            let prev = n.next[l].fetch_or(1, Ordering::AcqRel, guard);
            if l == 0 && prev.tag() == 0 {
                won = true;
            }
        }
        if won {
            self.stats.soft_deletes.fetch_add(1, Ordering::Relaxed);
        }
        won
    }

    /// Logically removes `node` and eagerly walks its key range so the marked
    /// node is unlinked without waiting for an unrelated traversal.
    pub(crate) fn delete_node<'g>(
        &self,
        node: Shared<'g, Node>,
        buf: &mut ActionBuffer,
        guard: &'g Guard,
    ) -> bool {
        if !self.soft_delete(node, guard) {
            return false;
        }
        let n = unsafe {
            // SAFETY: pinned by `guard`.
            node.deref()
        };
        self.find_path(n.item().bytes(), SearchMode::Gt, None, buf, guard);
        true
    }

    /// Picks up to `n - 1` keys that split the key space into `n` roughly
    /// equal contiguous ranges, using the sparser upper levels as a sample.
    pub(crate) fn range_splitters(&self, n: usize, guard: &Guard) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = Vec::new();
        if n < 2 {
            return keys;
        }
        let top = self.level.load(Ordering::Acquire);
        for l in (0..=top).rev() {
            keys.clear();
            let mut curr = self.next_node(self.head(), l, guard);
            while curr.as_raw() != self.tail {
                let c = unsafe {
                    // SAFETY: observed in the list under `guard`.
                    curr.deref()
                };
                keys.push(c.item().bytes().to_vec());
                curr = self.next_node(curr, l, guard);
            }
            if keys.len() >= n {
                break;
            }
        }
        let cmp = self.cmp;
        keys.sort_by(|a, b| cmp(a, b));
        keys.dedup_by(|a, b| cmp(a, b) == cmp::Ordering::Equal);
        if keys.len() >= n {
            let len = keys.len();
            (1..n).map(|i| keys[i * len / n].clone()).collect()
        } else {
            keys
        }
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        // Exclusive access: collect every node still linked at any level
        // (nodes already retired to the collector are unreachable from all
        // levels and must not be freed twice), then free the survivors.
        unsafe {
            let guard = epoch::unprotected();
            let mut seen: HashSet<usize> = HashSet::new();
            for l in 0..self.max_level {
                let mut curr = (&(*self.head).next)[l]
                    .load(Ordering::Relaxed, guard)
                    .with_tag(0);
                while curr.as_raw() != self.tail {
                    seen.insert(curr.as_raw() as usize);
                    curr = curr.deref().next[l].load(Ordering::Relaxed, guard).with_tag(0);
                }
            }
            for &p in &seen {
                drop(Owned::<Node>::from_raw(p as *mut Node));
            }
            drop(Box::from_raw(self.head as *mut Node));
            drop(Box::from_raw(self.tail as *mut Node));
        }
    }
}
