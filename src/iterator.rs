//! Snapshot iterators.
//!
//! An iterator owns an epoch guard for its whole lifetime: the guard is the
//! reader session that keeps unlinked nodes from being reclaimed while the
//! cursor can still observe them. `refresh` re-acquires the guard (after
//! re-seeking to the last key) so long-lived iterators do not hold back
//! reclamation indefinitely.

use std::cmp;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Guard, Shared};

use crate::snapshot::{Snapshot, is_visible};
use crate::{ActionBuffer, Item, Node, SearchMode};

/// A forward iterator over the keys visible in one snapshot.
///
/// Keys are produced in strictly non-decreasing comparator order; equal-key
/// duplicates appear in insertion order. The cursor starts unpositioned:
/// call [`Iter::seek_first`] or [`Iter::seek`] before reading.
pub struct Iter {
    snap: Arc<Snapshot>,
    guard: Guard,
    buf: ActionBuffer,
    prev: *const Node,
    curr: *const Node,
    valid: bool,
    end: Option<Box<[u8]>>,
    refresh_rate: usize,
    steps: usize,
}

impl Iter {
    pub(crate) fn new(snap: &Arc<Snapshot>) -> Option<Iter> {
        if !snap.open() {
            return None;
        }
        let max_level = snap.db.store.max_level();
        Some(Iter {
            snap: Arc::clone(snap),
            guard: epoch::pin(),
            buf: ActionBuffer::new(max_level),
            prev: ptr::null(),
            curr: ptr::null(),
            valid: false,
            end: None,
            refresh_rate: 0,
            steps: 0,
        })
    }

    /// Moves the cursor to the first visible key.
    pub fn seek_first(&mut self) {
        let store = &self.snap.db.store;
        let head = store.head();
        self.prev = head.as_raw();
        self.curr = store.next_node(head, 0, &self.guard).as_raw();
        self.valid = true;
        self.skip_unwanted();
    }

    /// Positions the cursor on the first visible key `>=` `key`.
    pub fn seek(&mut self, key: &[u8]) {
        let sn = self.snap.sn();
        let skip = move |item: &Item| item.born_sn() > sn;
        let store = &self.snap.db.store;
        store.find_path(key, SearchMode::Ge, Some(&skip), &mut self.buf, &self.guard);
        self.prev = self.buf.pred(0);
        self.curr = self.buf.succ(0);
        self.valid = true;
        self.skip_unwanted();
    }

    /// Positions the cursor on `key`, or on its predecessor when the exact
    /// key is absent or filtered out. No visibility filter is applied to the
    /// landing position; block-storage lookups resolve the block themselves.
    pub fn seek_prev(&mut self, key: &[u8]) {
        let sn = self.snap.sn();
        let skip = move |item: &Item| item.born_sn() > sn;
        let store = &self.snap.db.store;
        let found = store.find_path(key, SearchMode::Ge, Some(&skip), &mut self.buf, &self.guard);
        self.valid = true;
        self.prev = self.buf.pred(0);
        self.curr = self.buf.succ(0);
        if !found && self.prev != store.head().as_raw() {
            self.curr = self.prev;
            self.prev = ptr::null();
        }
    }

    /// Sets an exclusive end bound; the iterator becomes invalid at the first
    /// key `>=` the bound. Both seek paths honor the bound.
    pub fn set_end(&mut self, key: &[u8]) {
        if !key.is_empty() {
            self.end = Some(key.into());
        }
    }

    /// Returns true while the cursor is on an item (before the tail and any
    /// end bound).
    pub fn valid(&self) -> bool {
        if !self.valid || self.curr.is_null() {
            return false;
        }
        let store = &self.snap.db.store;
        if store.is_tail(self.curr) {
            return false;
        }
        if let Some(end) = &self.end {
            let c = unsafe {
                // SAFETY: `curr` is pinned by this iterator's guard.
                &*self.curr
            };
            if (store.key_cmp())(c.item().bytes(), end) != cmp::Ordering::Less {
                return false;
            }
        }
        true
    }

    /// Returns the current key bytes. The cursor must be valid.
    pub fn get(&self) -> &[u8] {
        assert!(self.valid(), "iterator is not positioned on an item");
        let c = unsafe {
            // SAFETY: `curr` is pinned by this iterator's guard.
            &*self.curr
        };
        c.item().bytes()
    }

    /// Advances to the next visible key, helping to unlink any deleted node
    /// it steps over.
    pub fn next(&mut self) {
        if !self.valid() {
            return;
        }
        self.advance();
        self.steps += 1;
        self.skip_unwanted();
        if self.refresh_rate > 0 && self.steps > self.refresh_rate {
            self.refresh();
            self.steps = 0;
        }
    }

    /// One raw level-0 step, mirroring the help-delete protocol: a marked
    /// current node is unlinked in place, or the cursor is re-seeked when the
    /// cached predecessor went stale.
    fn advance(&mut self) {
        let store = &self.snap.db.store;
        loop {
            let curr = Shared::<Node>::from(self.curr);
            let c = unsafe {
                // SAFETY: `curr` is pinned by this iterator's guard.
                curr.deref()
            };
            let succ = c.next[0].load(Ordering::Acquire, &self.guard);
            if succ.tag() == 1 {
                let prev = Shared::<Node>::from(self.prev);
                if !self.prev.is_null()
                    && store.help_unlink(prev, curr, succ.with_tag(0), 0, &self.guard)
                {
                    self.curr = succ.with_tag(0).as_raw();
                } else {
                    store.note_read_conflict();
                    let found = {
                        let key = c.item().bytes();
                        store.find_path(key, SearchMode::Ge, None, &mut self.buf, &self.guard)
                    };
                    let last = self.curr;
                    self.prev = self.buf.pred(0);
                    self.curr = self.buf.succ(0);
                    if found && last == self.curr {
                        continue;
                    }
                }
            } else {
                self.prev = self.curr;
                self.curr = succ.as_raw();
            }
            return;
        }
    }

    /// Skips items outside this snapshot's visibility window.
    fn skip_unwanted(&mut self) {
        let sn = self.snap.sn();
        loop {
            if !self.valid() {
                return;
            }
            let c = unsafe {
                // SAFETY: `curr` is pinned by this iterator's guard.
                &*self.curr
            };
            if is_visible(c.item(), sn) {
                return;
            }
            self.advance();
            self.steps += 1;
        }
    }

    /// Releases and re-acquires the reader session, re-seeking to the current
    /// key. Shortens the retention window of long-lived iterators so the
    /// collector can reclaim behind them.
    pub fn refresh(&mut self) {
        if !self.valid() {
            return;
        }
        let key = {
            let c = unsafe {
                // SAFETY: `curr` is pinned by the guard we are about to drop,
                // which stays alive until the new one is installed.
                &*self.curr
            };
            c.item().bytes().to_vec()
        };
        self.guard = epoch::pin();
        let store = &self.snap.db.store;
        store.find_path(&key, SearchMode::Ge, None, &mut self.buf, &self.guard);
        self.prev = self.buf.pred(0);
        self.curr = self.buf.succ(0);
        self.valid = true;
        // The re-seek may land on an invisible duplicate of the same key.
        self.skip_unwanted();
    }

    /// Automatically refresh the reader session every `rate` steps. Zero
    /// (the default) never refreshes.
    pub fn set_refresh_rate(&mut self, rate: usize) {
        self.refresh_rate = rate;
    }

    /// Closes the iterator, dropping its snapshot reference and session.
    pub fn close(self) {}
}

impl Drop for Iter {
    fn drop(&mut self) {
        self.snap.close();
    }
}
