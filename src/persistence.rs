//! Ordered on-disk dumps and restore.
//!
//! A dump is a directory: a serialized manifest plus one data file per shard,
//! written in parallel by the visitor. Records are length-prefixed key bytes,
//! optionally delta-encoded against the previous key in the shard when the
//! instance was configured with delta interleaving. The contract is
//! round-trip fidelity: a dump of snapshot `S` followed by a fresh load
//! reproduces exactly the set and ordering of keys visible in `S`, and the
//! loaded snapshot's count equals the source's.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::Nitro;
use crate::Writer;
use crate::error::NitroError;
use crate::snapshot::Snapshot;

const DUMP_MAGIC: u32 = 0x4e49_5452;
const DUMP_VERSION: u32 = 1;
const MANIFEST_NAME: &str = "manifest";

/// Written once per dump directory; the loader validates it before touching
/// any shard file.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    magic: u32,
    version: u32,
    shards: u32,
    delta_interleaved: bool,
}

fn shard_path(dir: &Path, idx: usize) -> PathBuf {
    dir.join(format!("shard-{:04}.data", idx))
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

struct ShardWriter {
    out: BufWriter<File>,
    last: Vec<u8>,
    delta: bool,
}

impl ShardWriter {
    fn new(file: File, delta: bool) -> ShardWriter {
        ShardWriter {
            out: BufWriter::new(file),
            last: Vec::new(),
            delta,
        }
    }

    fn write_key(&mut self, key: &[u8]) -> io::Result<()> {
        if self.delta {
            let shared = common_prefix_len(&self.last, key).min(u16::MAX as usize);
            let rest = &key[shared..];
            self.out.write_all(&(shared as u16).to_le_bytes())?;
            self.out.write_all(&(rest.len() as u32).to_le_bytes())?;
            self.out.write_all(rest)?;
            self.last.clear();
            self.last.extend_from_slice(key);
        } else {
            self.out.write_all(&(key.len() as u32).to_le_bytes())?;
            self.out.write_all(key)?;
        }
        Ok(())
    }

    fn finish(mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Reads exactly `buf.len()` bytes. `Ok(false)` is a clean end-of-file at a
/// record boundary; a partial header or body is a corrupt dump.
fn fill(r: &mut impl Read, buf: &mut [u8]) -> Result<bool, NitroError> {
    let mut got = 0;
    while got < buf.len() {
        let k = r
            .read(&mut buf[got..])
            .map_err(|e| NitroError::Io(e.to_string()))?;
        if k == 0 {
            if got == 0 {
                return Ok(false);
            }
            return Err(NitroError::Corrupt("truncated record".into()));
        }
        got += k;
    }
    Ok(true)
}

impl Nitro {
    /// Dumps the keys visible in `snap`, in order, into the directory `dir`
    /// using `concurrency` shard writers. `callb`, when present, observes
    /// every key before it is written.
    pub fn store_to_disk(
        &self,
        dir: &Path,
        snap: &Arc<Snapshot>,
        concurrency: usize,
        callb: Option<&(dyn Fn(&[u8]) + Sync)>,
    ) -> Result<(), NitroError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NitroError::Shutdown);
        }
        fs::create_dir_all(dir)?;
        let shards = concurrency.max(1);
        let delta = self.inner.config.use_delta_interleaving;

        let mut writers: Vec<Mutex<ShardWriter>> = Vec::with_capacity(shards);
        for i in 0..shards {
            let f = File::create(shard_path(dir, i))?;
            writers.push(Mutex::new(ShardWriter::new(f, delta)));
        }

        self.visitor(
            snap,
            |key, shard| {
                if let Some(cb) = callb {
                    cb(key);
                }
                let mut w = writers[shard].lock().unwrap();
                w.write_key(key).map_err(|e| NitroError::Io(e.to_string()))
            },
            shards,
            shards,
        )?;

        for w in writers {
            w.into_inner().unwrap().finish()?;
        }

        // The manifest is written last so a partial dump never loads.
        let mf = File::create(dir.join(MANIFEST_NAME))?;
        bincode::serialize_into(
            BufWriter::new(mf),
            &Manifest {
                magic: DUMP_MAGIC,
                version: DUMP_VERSION,
                shards: shards as u32,
                delta_interleaved: delta,
            },
        )
        .map_err(|e| NitroError::Io(e.to_string()))?;
        Ok(())
    }

    /// Loads a dump directory produced by [`Nitro::store_to_disk`] with up to
    /// `concurrency` loader threads and returns a snapshot of the restored
    /// contents. `callb`, when present, observes every key as it is applied.
    pub fn load_from_disk(
        &self,
        dir: &Path,
        concurrency: usize,
        callb: Option<&(dyn Fn(&[u8]) + Sync)>,
    ) -> Result<Arc<Snapshot>, NitroError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NitroError::Shutdown);
        }
        let mf = File::open(dir.join(MANIFEST_NAME))?;
        let manifest: Manifest = bincode::deserialize_from(BufReader::new(mf))
            .map_err(|e| NitroError::Corrupt(e.to_string()))?;
        if manifest.magic != DUMP_MAGIC {
            return Err(NitroError::Corrupt("bad magic".into()));
        }
        if manifest.version != DUMP_VERSION {
            warn!("unsupported dump version {}", manifest.version);
            return Err(NitroError::Corrupt(format!(
                "unsupported version {}",
                manifest.version
            )));
        }

        if manifest.shards == 0 || manifest.shards > 4096 {
            return Err(NitroError::Corrupt(format!(
                "implausible shard count {}",
                manifest.shards
            )));
        }

        let shards = manifest.shards as usize;
        let workers = concurrency.clamp(1, shards);
        let abort = AtomicBool::new(false);
        let err_slot: Mutex<Option<NitroError>> = Mutex::new(None);
        let (tx, rx) = crossbeam_channel::bounded::<usize>(shards);
        for i in 0..shards {
            tx.send(i).unwrap();
        }
        drop(tx);

        std::thread::scope(|s| {
            for _ in 0..workers {
                let rx = rx.clone();
                let abort = &abort;
                let err_slot = &err_slot;
                s.spawn(move || {
                    let mut w = self.new_writer();
                    while let Ok(shard) = rx.recv() {
                        if abort.load(Ordering::Acquire) {
                            break;
                        }
                        if let Err(e) = self.load_shard(
                            dir,
                            shard,
                            manifest.delta_interleaved,
                            &mut w,
                            callb,
                        ) {
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

        if let Some(e) = err_slot.into_inner().unwrap() {
            return Err(e);
        }
        self.new_snapshot()
    }

    fn load_shard(
        &self,
        dir: &Path,
        idx: usize,
        delta: bool,
        w: &mut Writer,
        callb: Option<&(dyn Fn(&[u8]) + Sync)>,
    ) -> Result<(), NitroError> {
        let f = File::open(shard_path(dir, idx))?;
        let mut r = BufReader::new(f);
        let mut last: Vec<u8> = Vec::new();
        let mut key: Vec<u8> = Vec::new();
        let mut n = 0usize;
        loop {
            if n & 0xfff == 0 && self.inner.closed.load(Ordering::SeqCst) {
                return Err(NitroError::Shutdown);
            }
            if delta {
                let mut hdr = [0u8; 2];
                if !fill(&mut r, &mut hdr)? {
                    return Ok(());
                }
                let shared = u16::from_le_bytes(hdr) as usize;
                if shared > last.len() {
                    return Err(NitroError::Corrupt("delta prefix out of range".into()));
                }
                let mut len_buf = [0u8; 4];
                if !fill(&mut r, &mut len_buf)? {
                    return Err(NitroError::Corrupt("truncated record".into()));
                }
                let rest_len = u32::from_le_bytes(len_buf) as usize;
                key.clear();
                key.extend_from_slice(&last[..shared]);
                let start = key.len();
                key.resize(start + rest_len, 0);
                if rest_len > 0 && !fill(&mut r, &mut key[start..])? {
                    return Err(NitroError::Corrupt("truncated record".into()));
                }
                last.clear();
                last.extend_from_slice(&key);
            } else {
                let mut len_buf = [0u8; 4];
                if !fill(&mut r, &mut len_buf)? {
                    return Ok(());
                }
                let len = u32::from_le_bytes(len_buf) as usize;
                key.clear();
                key.resize(len, 0);
                if len > 0 && !fill(&mut r, &mut key)? {
                    return Err(NitroError::Corrupt("truncated record".into()));
                }
            }
            if let Some(cb) = callb {
                cb(&key);
            }
            w.put(&key);
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_prefix_len() {
        assert_eq!(common_prefix_len(b"", b"abc"), 0);
        assert_eq!(common_prefix_len(b"abc", b"abd"), 2);
        assert_eq!(common_prefix_len(b"abc", b"abc"), 3);
        assert_eq!(common_prefix_len(b"abcd", b"ab"), 2);
    }

    #[test]
    fn test_manifest_round_trip() {
        let m = Manifest {
            magic: DUMP_MAGIC,
            version: DUMP_VERSION,
            shards: 8,
            delta_interleaved: true,
        };
        let bytes = bincode::serialize(&m).unwrap();
        let back: Manifest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.magic, DUMP_MAGIC);
        assert_eq!(back.shards, 8);
        assert!(back.delta_interleaved);
    }

    #[test]
    fn test_fill_detects_truncation() {
        let data = [1u8, 2, 3];
        let mut r = io::Cursor::new(&data[..]);
        let mut buf = [0u8; 2];
        assert!(fill(&mut r, &mut buf).unwrap());
        let mut buf = [0u8; 2];
        assert_eq!(
            fill(&mut r, &mut buf),
            Err(NitroError::Corrupt("truncated record".into()))
        );
    }
}
