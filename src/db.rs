//! The Nitro instance: configuration, writers, snapshots and bulk visitation.
//!
//! # Examples
//!
//! ```
//! use nitro::Nitro;
//!
//! let db = Nitro::new();
//! let mut w = db.new_writer();
//! w.put(b"alpha");
//! w.put(b"beta");
//! assert!(w.delete(b"alpha"));
//!
//! let snap = db.new_snapshot().unwrap();
//! assert_eq!(snap.count(), 1);
//!
//! let mut it = snap.new_iterator().unwrap();
//! it.seek_first();
//! assert_eq!(it.get(), b"beta");
//! it.close();
//! snap.close();
//! db.close();
//! ```

use std::alloc::Layout;
use std::collections::BTreeSet;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_epoch::{self as epoch, Shared};
use log::debug;

use crate::error::NitroError;
use crate::gc::{GcChain, PendingList};
use crate::snapshot::Snapshot;
use crate::{
    ActionBuffer, DEFAULT_HEIGHT_P, DEFAULT_MAX_LEVEL, Item, KeyCompare, Node, SearchMode,
    SkipList, StatsReport, default_key_cmp,
};

/// A malloc-like `(alloc, free)` pair supplying node key memory.
#[derive(Clone, Copy)]
pub struct MemoryHooks {
    pub alloc: unsafe fn(usize) -> *mut u8,
    pub free: unsafe fn(*mut u8, usize),
}

unsafe fn system_alloc(size: usize) -> *mut u8 {
    unsafe {
        // SAFETY: size is clamped to at least one byte, alignment is 1.
        std::alloc::alloc(Layout::from_size_align_unchecked(size.max(1), 1))
    }
}

unsafe fn system_free(ptr: *mut u8, size: usize) {
    unsafe {
        // SAFETY: `ptr` came from `system_alloc` with the same size.
        std::alloc::dealloc(ptr, Layout::from_size_align_unchecked(size.max(1), 1))
    }
}

impl MemoryHooks {
    /// Hooks backed by the global allocator.
    pub fn system() -> MemoryHooks {
        MemoryHooks {
            alloc: system_alloc,
            free: system_free,
        }
    }
}

/// Instance configuration. Start from `Config::default()` and chain the
/// with-style setters.
#[derive(Clone)]
pub struct Config {
    pub(crate) max_level: usize,
    pub(crate) height_probability: f64,
    pub(crate) key_cmp: KeyCompare,
    pub(crate) hooks: Option<MemoryHooks>,
    pub(crate) use_delta_interleaving: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_level: DEFAULT_MAX_LEVEL,
            height_probability: DEFAULT_HEIGHT_P,
            key_cmp: default_key_cmp,
            hooks: None,
            use_delta_interleaving: false,
        }
    }
}

impl Config {
    /// Caps skiplist tower height. Default 32.
    pub fn with_max_level(mut self, max_level: usize) -> Config {
        self.max_level = max_level.clamp(1, 64);
        self
    }

    /// Geometric probability used when drawing node heights. Default 0.25.
    pub fn with_height_probability(mut self, p: f64) -> Config {
        self.height_probability = p.clamp(0.0, 1.0);
        self
    }

    /// Replaces the bytewise key comparator.
    pub fn with_key_cmp(mut self, cmp: KeyCompare) -> Config {
        self.key_cmp = cmp;
        self
    }

    /// Routes key memory through a caller-supplied `(alloc, free)` pair
    /// instead of the global allocator.
    pub fn use_memory_mgmt(
        mut self,
        alloc: unsafe fn(usize) -> *mut u8,
        free: unsafe fn(*mut u8, usize),
    ) -> Config {
        self.hooks = Some(MemoryHooks { alloc, free });
        self
    }

    /// Enables shared-prefix delta encoding in on-disk dumps.
    pub fn use_delta_interleaving(mut self) -> Config {
        self.use_delta_interleaving = true;
        self
    }
}

pub(crate) struct NitroInner {
    pub(crate) store: SkipList,
    pub(crate) gc_chain: GcChain,
    pub(crate) pending: PendingList,
    pub(crate) curr_sn: AtomicU64,
    pub(crate) snapshots: Mutex<BTreeSet<u64>>,
    pub(crate) item_count: AtomicU64,
    pub(crate) closed: AtomicBool,
    pub(crate) config: Config,
}

impl NitroInner {
    /// Creates a snapshot at the next sequence number, sealing the pending
    /// deletes of the window that just closed into a GC bucket.
    pub(crate) fn new_snapshot(self: &Arc<Self>) -> Result<Arc<Snapshot>, NitroError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NitroError::Shutdown);
        }
        let guard = &epoch::pin();
        let (sn, count) = {
            let mut snaps = self.snapshots.lock().unwrap();
            let sn = self.curr_sn.fetch_add(1, Ordering::SeqCst) + 1;
            let chain = self.pending.take_all();
            self.gc_chain.add_bucket(sn, chain, guard);
            snaps.insert(sn);
            (sn, self.item_count.load(Ordering::SeqCst))
        };
        Ok(Arc::new(Snapshot::new(Arc::clone(self), sn, count)))
    }

    /// Final close of the snapshot at `sn`: unregister it and drain every GC
    /// bucket no longer bracketed by a live snapshot.
    pub(crate) fn snapshot_closed(&self, sn: u64) {
        let horizon = {
            let mut snaps = self.snapshots.lock().unwrap();
            snaps.remove(&sn);
            snaps.iter().next().copied().unwrap_or(u64::MAX)
        };
        let guard = &epoch::pin();
        let freed = self.gc_chain.drain_upto(horizon, &self.store, guard);
        if freed > 0 {
            debug!("gc: retired {} nodes below sn {}", freed, horizon);
            guard.flush();
        }
    }
}

/// An in-memory ordered key-value store with multi-version snapshots.
///
/// The handle is cheap to clone via [`Nitro::new_writer`] /
/// [`Nitro::new_snapshot`]; all of them share one instance.
pub struct Nitro {
    pub(crate) inner: Arc<NitroInner>,
}

impl Default for Nitro {
    fn default() -> Nitro {
        Nitro::new()
    }
}

impl Nitro {
    /// Opens an instance with the default configuration.
    pub fn new() -> Nitro {
        Nitro::with_config(Config::default())
    }

    /// Opens an instance with `config`.
    pub fn with_config(config: Config) -> Nitro {
        let store = SkipList::new(config.key_cmp, config.max_level, config.height_probability);
        Nitro {
            inner: Arc::new(NitroInner {
                store,
                gc_chain: GcChain::new(),
                pending: PendingList::new(),
                curr_sn: AtomicU64::new(0),
                snapshots: Mutex::new(BTreeSet::new()),
                item_count: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Creates a writer handle. Writers own their search scratch buffer and
    /// are meant to be thread-affined; create one per writing thread.
    pub fn new_writer(&self) -> Writer {
        Writer {
            inner: Arc::clone(&self.inner),
            buf: ActionBuffer::new(self.inner.store.max_level()),
        }
    }

    /// Creates a snapshot pinning the current state.
    pub fn new_snapshot(&self) -> Result<Arc<Snapshot>, NitroError> {
        self.inner.new_snapshot()
    }

    /// Number of currently visible items.
    pub fn item_count(&self) -> u64 {
        self.inner.item_count.load(Ordering::SeqCst)
    }

    /// Skiplist operation counters.
    pub fn get_stats(&self) -> StatsReport {
        self.inner.store.get_stats()
    }

    /// Number of sealed, undrained GC buckets.
    pub fn gc_chain_buckets(&self) -> u64 {
        self.inner.gc_chain.bucket_count()
    }

    /// Human-readable stats dump.
    pub fn dump_stats(&self) -> String {
        format!(
            "{}\ncurr_sn         = {}\nitem_count      = {}\nlive_snapshots  = {}\ngc_buckets      = {}",
            self.get_stats(),
            self.inner.curr_sn.load(Ordering::SeqCst),
            self.item_count(),
            self.inner.snapshots.lock().unwrap().len(),
            self.gc_chain_buckets(),
        )
    }

    /// On-demand reclamation sweep: drains unreferenced GC buckets and
    /// advances the epoch collector so deferred frees can run.
    pub fn collect(&self) {
        let horizon = {
            let snaps = self.inner.snapshots.lock().unwrap();
            snaps.iter().next().copied().unwrap_or(u64::MAX)
        };
        let guard = &epoch::pin();
        self.inner.gc_chain.drain_upto(horizon, &self.inner.store, guard);
        guard.flush();
    }

    /// Shuts the instance down. Idempotent. In-flight bulk operations abort
    /// with [`NitroError::Shutdown`]; pending deletes are sealed and every
    /// unreferenced GC bucket is drained.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let guard = &epoch::pin();
        let sn = self.inner.curr_sn.fetch_add(1, Ordering::SeqCst) + 1;
        let chain = self.inner.pending.take_all();
        self.inner.gc_chain.add_bucket(sn, chain, guard);
        let horizon = {
            let snaps = self.inner.snapshots.lock().unwrap();
            snaps.iter().next().copied().unwrap_or(u64::MAX)
        };
        self.inner.gc_chain.drain_upto(horizon, &self.inner.store, guard);
        guard.flush();
        // Give the collector a few cycles so deferred frees run promptly.
        for _ in 0..8 {
            epoch::pin().flush();
        }
    }

    /// Visits every item of `snap` exactly once, partitioning the key space
    /// into `shards` contiguous ranges processed by up to `concurrency`
    /// worker threads. The callback receives each key with its shard index;
    /// the first callback error aborts the remaining shards and is returned
    /// verbatim.
    pub fn visitor<F>(
        &self,
        snap: &Arc<Snapshot>,
        callb: F,
        shards: usize,
        concurrency: usize,
    ) -> Result<(), NitroError>
    where
        F: Fn(&[u8], usize) -> Result<(), NitroError> + Sync,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NitroError::Shutdown);
        }
        let shards = shards.max(1);
        let concurrency = concurrency.clamp(1, shards);
        let splitters = {
            let guard = epoch::pin();
            self.inner.store.range_splitters(shards, &guard)
        };

        let abort = AtomicBool::new(false);
        let err_slot: Mutex<Option<NitroError>> = Mutex::new(None);
        let (tx, rx) = crossbeam_channel::bounded::<usize>(shards);
        for i in 0..shards {
            tx.send(i).unwrap();
        }
        drop(tx);

        std::thread::scope(|s| {
            for _ in 0..concurrency {
                let rx = rx.clone();
                let callb = &callb;
                let splitters = &splitters;
                let abort = &abort;
                let err_slot = &err_slot;
                s.spawn(move || {
                    while let Ok(shard) = rx.recv() {
                        if abort.load(Ordering::Acquire) {
                            break;
                        }
                        if let Err(e) = self.visit_shard(snap, shard, splitters, callb, abort) {
                            abort.store(true, Ordering::Release);
                            let mut slot = err_slot.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                        }
                    }
                });
            }
        });

        match err_slot.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn visit_shard<F>(
        &self,
        snap: &Arc<Snapshot>,
        shard: usize,
        splitters: &[Vec<u8>],
        callb: &F,
        abort: &AtomicBool,
    ) -> Result<(), NitroError>
    where
        F: Fn(&[u8], usize) -> Result<(), NitroError> + Sync,
    {
        // Shards beyond the splitter count are empty ranges.
        if shard > splitters.len() {
            return Ok(());
        }
        let mut it = snap.new_iterator().ok_or(NitroError::Shutdown)?;
        if shard == 0 {
            it.seek_first();
        } else {
            it.seek(&splitters[shard - 1]);
        }
        if shard < splitters.len() {
            it.set_end(&splitters[shard]);
        }
        let mut n = 0usize;
        while it.valid() {
            if abort.load(Ordering::Acquire) {
                return Ok(());
            }
            if n & 0x3ff == 0 && self.inner.closed.load(Ordering::SeqCst) {
                return Err(NitroError::Shutdown);
            }
            callb(it.get(), shard)?;
            n += 1;
            it.next();
        }
        Ok(())
    }
}

/// A write handle. Each writer owns a scratch path buffer, so a writer must
/// not be shared between threads concurrently (it is `Send`, not `Sync`).
pub struct Writer {
    inner: Arc<NitroInner>,
    buf: ActionBuffer,
}

impl Writer {
    /// Inserts `key`. Duplicates are allowed; a duplicate lands after its
    /// equals in iteration order.
    pub fn put(&mut self, key: &[u8]) {
        let sn = self.inner.curr_sn.load(Ordering::SeqCst) + 1;
        let guard = &epoch::pin();
        self.inner.store.insert_item(
            Item::new(key, sn, self.inner.config.hooks),
            ptr::null_mut(),
            &mut self.buf,
            guard,
        );
        self.inner.item_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Inserts `key` only if no live node for it exists. Returns true when
    /// the insert happened.
    pub fn put_unique(&mut self, key: &[u8]) -> bool {
        let guard = &epoch::pin();
        let store = &self.inner.store;
        if store.find_path(key, SearchMode::Ge, None, &mut self.buf, guard) {
            let cmp = store.key_cmp();
            let mut curr = Shared::<Node>::from(self.buf.succ(0));
            while !store.is_tail(curr.as_raw()) {
                let c = unsafe {
                    // SAFETY: observed in the list under `guard`.
                    curr.deref()
                };
                if cmp(c.item().bytes(), key) != std::cmp::Ordering::Equal {
                    break;
                }
                if c.item().dead_sn() == 0 {
                    return false;
                }
                curr = store.next_node(curr, 0, guard);
            }
        }
        let sn = self.inner.curr_sn.load(Ordering::SeqCst) + 1;
        store.insert_item(
            Item::new(key, sn, self.inner.config.hooks),
            ptr::null_mut(),
            &mut self.buf,
            guard,
        );
        self.inner.item_count.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Logically deletes `key`. The node stays linked (older snapshots still
    /// observe it) and is parked for the GC chain; physical removal happens
    /// once no snapshot can see it. A node created and deleted inside the
    /// same write window is visible to no snapshot and is removed from the
    /// index right away instead. Returns false when no live node exists.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let sn = self.inner.curr_sn.load(Ordering::SeqCst) + 1;
        let guard = &epoch::pin();
        let store = &self.inner.store;
        if !store.find_path(key, SearchMode::Ge, None, &mut self.buf, guard) {
            return false;
        }
        let cmp = store.key_cmp();
        let mut curr = Shared::<Node>::from(self.buf.succ(0));
        while !store.is_tail(curr.as_raw()) {
            let c = unsafe {
                // SAFETY: observed in the list under `guard`.
                curr.deref()
            };
            if cmp(c.item().bytes(), key) != std::cmp::Ordering::Equal {
                break;
            }
            if c.item().mark_dead(sn) {
                if c.item().born_sn() == sn {
                    // Born and dead in the same window: skip the GC chain.
                    store.delete_node(curr, &mut self.buf, guard);
                } else {
                    self.inner.pending.push(curr.as_raw());
                }
                self.inner.item_count.fetch_sub(1, Ordering::SeqCst);
                return true;
            }
            curr = store.next_node(curr, 0, guard);
        }
        false
    }

    /// Creates a snapshot; equivalent to [`Nitro::new_snapshot`].
    pub fn new_snapshot(&self) -> Result<Arc<Snapshot>, NitroError> {
        self.inner.new_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.max_level, DEFAULT_MAX_LEVEL);
        assert_eq!(cfg.height_probability, DEFAULT_HEIGHT_P);
        assert!(cfg.hooks.is_none());
        assert!(!cfg.use_delta_interleaving);
    }

    #[test]
    fn test_put_unique_semantics() {
        let db = Nitro::new();
        let mut w = db.new_writer();
        assert!(w.put_unique(b"a"));
        assert!(!w.put_unique(b"a"));
        assert!(w.delete(b"a"));
        // The dead node no longer blocks a fresh insert.
        assert!(w.put_unique(b"a"));
        assert_eq!(db.item_count(), 1);
    }

    #[test]
    fn test_delete_missing_key() {
        let db = Nitro::new();
        let mut w = db.new_writer();
        w.put(b"a");
        assert!(!w.delete(b"b"));
        assert!(w.delete(b"a"));
        assert!(!w.delete(b"a"));
        assert_eq!(db.item_count(), 0);
    }

    #[test]
    fn test_close_idempotent() {
        let db = Nitro::new();
        db.close();
        db.close();
        assert_eq!(db.new_snapshot().err(), Some(NitroError::Shutdown));
    }

    #[test]
    fn test_visitor_on_closed_instance() {
        let db = Nitro::new();
        let snap = db.new_snapshot().unwrap();
        db.close();
        let r = db.visitor(&snap, |_k, _s| Ok(()), 4, 2);
        assert_eq!(r, Err(NitroError::Shutdown));
        snap.close();
    }

    #[test]
    fn test_custom_comparator() {
        fn reverse_cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
            b.cmp(a)
        }
        let db = Nitro::with_config(Config::default().with_key_cmp(reverse_cmp));
        let mut w = db.new_writer();
        for k in [&b"a"[..], b"b", b"c"] {
            w.put(k);
        }
        let snap = db.new_snapshot().unwrap();
        let mut it = snap.new_iterator().unwrap();
        let mut keys = Vec::new();
        it.seek_first();
        while it.valid() {
            keys.push(it.get().to_vec());
            it.next();
        }
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
        it.close();
        snap.close();
    }
}
