//! Durable store for a ledger node: the commit-index counter, the lease
//! table, and the segment log, persisted together as one JSON snapshot
//! replaced atomically on every mutation.

use crate::api::{Lease, Segment};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("lease not found for range {0}")]
    LeaseNotFound(String),
    #[error("stale lease for range {range_id}: epoch {incoming} below stored {stored}")]
    StaleLease {
        range_id: String,
        incoming: u64,
        stored: u64,
    },
    #[error("commit index {supplied} is not the successor of {current}")]
    IndexGap { supplied: u64, current: u64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    commit_index: u64,
    leases: HashMap<String, Lease>,
    segments: Vec<Segment>,
}

#[derive(Clone)]
pub struct DurableStore {
    inner: Arc<Mutex<StoreInner>>,
}

struct StoreInner {
    path: PathBuf,
    state: Snapshot,
}

impl DurableStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let state = if path.exists() {
            let data = fs::read(path)?;
            serde_json::from_slice(&data)?
        } else {
            Snapshot::default()
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                path: path.to_path_buf(),
                state,
            })),
        })
    }

    pub fn get_commit_index(&self) -> u64 {
        self.lock().state.commit_index
    }

    pub fn next_commit_index(&self) -> StoreResult<u64> {
        let mut inner = self.lock();
        let next = inner.state.commit_index + 1;
        inner.state.commit_index = next;
        if let Err(err) = inner.persist() {
            inner.state.commit_index = next - 1;
            return Err(err);
        }
        Ok(next)
    }

    /// Upserts by range. Epochs never go backwards; a strictly lower
    /// incoming epoch is a fenced-out writer and is rejected.
    pub fn put_lease(&self, lease: Lease) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(stored) = inner.state.leases.get(&lease.range_id) {
            if lease.epoch < stored.epoch {
                return Err(StoreError::StaleLease {
                    range_id: lease.range_id,
                    incoming: lease.epoch,
                    stored: stored.epoch,
                });
            }
        }
        let previous = inner
            .state
            .leases
            .insert(lease.range_id.clone(), lease.clone());
        if let Err(err) = inner.persist() {
            match previous {
                Some(old) => {
                    inner.state.leases.insert(lease.range_id, old);
                }
                None => {
                    inner.state.leases.remove(&lease.range_id);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn get_lease(&self, range_id: &str) -> StoreResult<Lease> {
        self.lock()
            .state
            .leases
            .get(range_id)
            .cloned()
            .ok_or_else(|| StoreError::LeaseNotFound(range_id.to_string()))
    }

    /// Sorted upsert by commit index; re-delivery of an index replaces
    /// the stored copy instead of duplicating it.
    pub fn put_segment(&self, seg: Segment) -> StoreResult<()> {
        let mut inner = self.lock();
        let undo = inner.insert_segment(seg);
        if let Err(err) = inner.persist() {
            inner.undo_insert(undo);
            return Err(err);
        }
        Ok(())
    }

    /// Leader commit after quorum: advances the counter and appends the
    /// segment in one persisted mutation, so a crash can never observe
    /// the counter ahead of the log.
    pub fn commit_segment(&self, seg: Segment) -> StoreResult<()> {
        let mut inner = self.lock();
        let current = inner.state.commit_index;
        if seg.commit_index != current + 1 {
            return Err(StoreError::IndexGap {
                supplied: seg.commit_index,
                current,
            });
        }
        inner.state.commit_index = seg.commit_index;
        let undo = inner.insert_segment(seg);
        if let Err(err) = inner.persist() {
            inner.state.commit_index = current;
            inner.undo_insert(undo);
            return Err(err);
        }
        Ok(())
    }

    /// Follower ingest of leader fan-out. Arrivals may be out of order;
    /// the counter tracks the highest index seen.
    pub fn accept_replicated(&self, seg: Segment) -> StoreResult<()> {
        let mut inner = self.lock();
        let previous_index = inner.state.commit_index;
        inner.state.commit_index = previous_index.max(seg.commit_index);
        let undo = inner.insert_segment(seg);
        if let Err(err) = inner.persist() {
            inner.state.commit_index = previous_index;
            inner.undo_insert(undo);
            return Err(err);
        }
        Ok(())
    }

    /// Segments with `commit_index >= from`, ascending, at most `limit`
    /// when given.
    pub fn list_segments_from(&self, from: u64, limit: Option<usize>) -> Vec<Segment> {
        let inner = self.lock();
        let start = inner
            .state
            .segments
            .partition_point(|seg| seg.commit_index < from);
        let mut out: Vec<Segment> = inner.state.segments[start..].to_vec();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

enum InsertUndo {
    Remove(usize),
    Restore(usize, Segment),
}

impl StoreInner {
    fn insert_segment(&mut self, seg: Segment) -> InsertUndo {
        let position = self
            .state
            .segments
            .partition_point(|existing| existing.commit_index < seg.commit_index);
        let replaces = self
            .state
            .segments
            .get(position)
            .map(|existing| existing.commit_index == seg.commit_index)
            .unwrap_or(false);
        if replaces {
            let old = std::mem::replace(&mut self.state.segments[position], seg);
            InsertUndo::Restore(position, old)
        } else {
            self.state.segments.insert(position, seg);
            InsertUndo::Remove(position)
        }
    }

    fn undo_insert(&mut self, undo: InsertUndo) {
        match undo {
            InsertUndo::Remove(position) => {
                self.state.segments.remove(position);
            }
            InsertUndo::Restore(position, old) => {
                self.state.segments[position] = old;
            }
        }
    }

    fn persist(&self) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(&self.state)?;
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ledger.json".to_string());
        let tmp = self.path.with_file_name(format!("{file_name}.tmp"));
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
