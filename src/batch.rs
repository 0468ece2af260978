//! Batched bulk operations: the batch-descent primitive and `apply_ops`.
//!
//! `exec_batch_ops` walks the skiplist top-down with a sorted operation list,
//! partitioning the list by the right-hand node at each level and recursing
//! into the `[curr, right)` span one level lower. At level 0 every operation
//! falling inside the span is delivered in a single callback invocation, so
//! higher-level code can bulk-apply a contiguous range at once.

use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_epoch::{self as epoch, Guard, Shared};

use crate::error::NitroError;
use crate::snapshot::Snapshot;
use crate::{Nitro, Node, SkipList};

/// One queued operation: a key to bulk-insert.
pub(crate) struct BatchOp {
    pub(crate) key: Box<[u8]>,
}

impl SkipList {
    fn node_before<'g>(&self, a: Shared<'g, Node>, b: Shared<'g, Node>) -> bool {
        if a.as_raw() == b.as_raw() || a.as_raw() == self.tail || b.as_raw() == self.head {
            return false;
        }
        if a.as_raw() == self.head || b.as_raw() == self.tail {
            return true;
        }
        let (a, b) = unsafe {
            // SAFETY: both nodes were observed in the list under the caller's
            // guard and neither is a sentinel on this path.
            (a.deref(), b.deref())
        };
        (self.cmp)(a.item().bytes(), b.item().bytes()) == cmp::Ordering::Less
    }

    fn op_before_node<'g>(&self, op: &BatchOp, node: Shared<'g, Node>) -> bool {
        if node.as_raw() == self.tail {
            return true;
        }
        if node.as_raw() == self.head {
            return false;
        }
        let n = unsafe {
            // SAFETY: observed under the caller's guard, not a sentinel.
            node.deref()
        };
        (self.cmp)(&op.key, n.item().bytes()) == cmp::Ordering::Less
    }

    /// Runs the batch descent over `ops` (sorted by key). Every operation is
    /// delivered to `callb` exactly once, grouped by level-0 span.
    pub(crate) fn exec_batch_ops<F>(
        &self,
        ops: &[BatchOp],
        callb: &mut F,
        guard: &Guard,
    ) -> Result<(), NitroError>
    where
        F: FnMut(&[BatchOp]) -> Result<(), NitroError>,
    {
        if ops.is_empty() {
            return Ok(());
        }
        let top = self.level.load(Ordering::Acquire);
        let remaining = self.exec_batch_inner(
            self.head(),
            Shared::from(self.tail),
            top,
            ops,
            callb,
            guard,
        )?;
        assert!(
            remaining.is_empty(),
            "batch descent left {} operations unprocessed",
            remaining.len()
        );
        Ok(())
    }

    fn exec_batch_inner<'g, 'o, F>(
        &self,
        start: Shared<'g, Node>,
        end: Shared<'g, Node>,
        level: usize,
        mut ops: &'o [BatchOp],
        callb: &mut F,
        guard: &'g Guard,
    ) -> Result<&'o [BatchOp], NitroError>
    where
        F: FnMut(&[BatchOp]) -> Result<(), NitroError>,
    {
        let mut curr = start;
        while self.node_before(curr, end) && !ops.is_empty() {
            let right = self.next_node(curr, level, guard);
            if self.op_before_node(&ops[0], right) {
                if level == 0 {
                    let mut offset = 1;
                    while offset < ops.len() && self.op_before_node(&ops[offset], right) {
                        offset += 1;
                    }
                    callb(&ops[..offset])?;
                    ops = &ops[offset..];
                } else {
                    ops = self.exec_batch_inner(curr, right, level - 1, ops, callb, guard)?;
                }
            }
            curr = right;
        }
        Ok(ops)
    }
}

impl Nitro {
    /// Merges the contents of `src` (a snapshot, typically from another Nitro
    /// instance) into this instance using the batch-descent primitive, with
    /// `concurrency` workers bulk-inserting contiguous key ranges.
    ///
    /// Per-key insertion order from the source is preserved. The first worker
    /// error aborts the batch and is returned.
    pub fn apply_ops(&self, src: &Arc<Snapshot>, concurrency: usize) -> Result<(), NitroError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NitroError::Shutdown);
        }

        let mut ops: Vec<BatchOp> = Vec::new();
        {
            let mut it = src.new_iterator().ok_or(NitroError::Shutdown)?;
            it.seek_first();
            while it.valid() {
                ops.push(BatchOp {
                    key: it.get().into(),
                });
                it.next();
            }
        }
        if ops.is_empty() {
            return Ok(());
        }

        let concurrency = concurrency.max(1);
        let abort = AtomicBool::new(false);
        let err_slot: Mutex<Option<NitroError>> = Mutex::new(None);
        let (tx, rx) = crossbeam_channel::bounded::<(usize, usize)>(concurrency * 2);

        let descent = std::thread::scope(|s| {
            for _ in 0..concurrency {
                let rx = rx.clone();
                let ops = &ops;
                let abort = &abort;
                let err_slot = &err_slot;
                s.spawn(move || {
                    let mut w = self.new_writer();
                    // Keep draining after an abort so the dispatcher's
                    // bounded sends can never block without a receiver.
                    while let Ok((lo, hi)) = rx.recv() {
                        if abort.load(Ordering::Acquire) {
                            continue;
                        }
                        for op in &ops[lo..hi] {
                            if self.inner.closed.load(Ordering::SeqCst) {
                                abort.store(true, Ordering::Release);
                                let mut slot = err_slot.lock().unwrap();
                                if slot.is_none() {
                                    *slot = Some(NitroError::Shutdown);
                                }
                                break;
                            }
                            w.put(&op.key);
                        }
                    }
                });
            }

            let guard = &epoch::pin();
            let mut base = 0usize;
            let mut dispatch = |chunk: &[BatchOp]| -> Result<(), NitroError> {
                if abort.load(Ordering::Acquire) {
                    let slot = err_slot.lock().unwrap();
                    return Err(slot.clone().unwrap_or(NitroError::Shutdown));
                }
                let lo = base;
                base += chunk.len();
                tx.send((lo, lo + chunk.len()))
                    .map_err(|_| NitroError::Shutdown)?;
                Ok(())
            };
            let r = self.inner.store.exec_batch_ops(&ops, &mut dispatch, guard);
            drop(tx);
            r
        });

        if let Some(e) = err_slot.into_inner().unwrap() {
            return Err(e);
        }
        descent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActionBuffer, DEFAULT_HEIGHT_P, DEFAULT_MAX_LEVEL, Item, default_key_cmp};
    use std::ptr;

    fn key(i: u64) -> Vec<u8> {
        format!("{:010}", i).into_bytes()
    }

    fn list_with_keys(keys: &[Vec<u8>]) -> SkipList {
        let list = SkipList::new(default_key_cmp, DEFAULT_MAX_LEVEL, DEFAULT_HEIGHT_P);
        let mut buf = ActionBuffer::new(list.max_level());
        let guard = &epoch::pin();
        for k in keys {
            list.insert_item(Item::new(k, 1, None), ptr::null_mut(), &mut buf, guard);
        }
        list
    }

    #[test]
    fn test_batch_descent_covers_all_ops() {
        let existing: Vec<Vec<u8>> = (0..100).map(|i| key(i * 2)).collect();
        let list = list_with_keys(&existing);

        let ops: Vec<BatchOp> = (0..100)
            .map(|i| BatchOp {
                key: key(i * 2 + 1).into_boxed_slice(),
            })
            .collect();

        let guard = &epoch::pin();
        let mut delivered = 0usize;
        let mut last: Option<Vec<u8>> = None;
        let mut cb = |chunk: &[BatchOp]| -> Result<(), NitroError> {
            delivered += chunk.len();
            for op in chunk {
                if let Some(prev) = &last {
                    assert!(prev[..] < op.key[..]);
                }
                last = Some(op.key.to_vec());
            }
            Ok(())
        };
        list.exec_batch_ops(&ops, &mut cb, guard).unwrap();
        assert_eq!(delivered, ops.len());
    }

    #[test]
    fn test_batch_descent_empty_list() {
        let list = list_with_keys(&[]);
        let ops: Vec<BatchOp> = (0..10)
            .map(|i| BatchOp {
                key: key(i).into_boxed_slice(),
            })
            .collect();
        let guard = &epoch::pin();
        let mut delivered = 0usize;
        let mut cb = |chunk: &[BatchOp]| -> Result<(), NitroError> {
            delivered += chunk.len();
            Ok(())
        };
        list.exec_batch_ops(&ops, &mut cb, guard).unwrap();
        assert_eq!(delivered, 10);
    }

    #[test]
    fn test_batch_descent_callback_error_aborts() {
        let existing: Vec<Vec<u8>> = (0..50).map(key).collect();
        let list = list_with_keys(&existing);
        let ops: Vec<BatchOp> = (0..50)
            .map(|i| BatchOp {
                key: key(i).into_boxed_slice(),
            })
            .collect();
        let guard = &epoch::pin();
        let boom = NitroError::Callback("boom".into());
        let mut calls = 0;
        let mut cb = |_chunk: &[BatchOp]| -> Result<(), NitroError> {
            calls += 1;
            Err(NitroError::Callback("boom".into()))
        };
        assert_eq!(list.exec_batch_ops(&ops, &mut cb, guard), Err(boom));
        assert_eq!(calls, 1);
    }
}
