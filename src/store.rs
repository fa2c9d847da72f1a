//! Durable JSON store for captured request records
//!
//! The store is a single pretty-printed JSON array. Every write replaces the
//! whole document through a temporary file in the same directory followed by
//! a rename, so a reader only ever sees a complete document.
//!
//! [`RecordStore::append`] is the one append contract both recorder strategies
//! go through. It holds the store's mutex for the full read-modify-write.
//! [`RecordStore::append_gated`] additionally lets a caller that stopped
//! waiting veto the final rename through a [`CommitGate`].

use crate::record::RequestRecord;
use parking_lot::Mutex;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Errors from reading or writing the store document
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem fault
    #[error("I/O error on record store {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Content could not be encoded or decoded as a record array
    #[error("malformed record store {}: {source}", .path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Which half of an append failed
#[derive(Debug, Error)]
pub enum AppendError {
    #[error("failed to load existing records: {0}")]
    Read(#[source] StoreError),
    #[error("failed to persist records: {0}")]
    Write(#[source] StoreError),
    /// The caller gave up before the write was committed; nothing was written
    #[error("append abandoned before commit")]
    Abandoned,
}

const GATE_PENDING: u8 = 0;
const GATE_COMMITTING: u8 = 1;
const GATE_ABANDONED: u8 = 2;

/// One-shot handshake between a pending append and the caller waiting on it.
///
/// Exactly one side wins: either the writer claims the commit right before
/// the rename, or the waiter abandons first and the writer discards its
/// staged file.
#[derive(Debug)]
pub struct CommitGate(AtomicU8);

impl CommitGate {
    pub fn new() -> Self {
        Self(AtomicU8::new(GATE_PENDING))
    }

    /// Give up on the append. Returns `false` if the write already claimed
    /// the commit, in which case it will land.
    pub fn abandon(&self) -> bool {
        self.0
            .compare_exchange(GATE_PENDING, GATE_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn claim_commit(&self) -> bool {
        self.0
            .compare_exchange(GATE_PENDING, GATE_COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for CommitGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Deserialize the records at `path`.
///
/// A missing or blank file is an empty history.
pub fn read_records(path: &Path) -> Result<Vec<RequestRecord>, StoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    serde_json::from_slice(&data).map_err(|source| StoreError::Serialization {
        path: path.to_path_buf(),
        source,
    })
}

/// Serialize `records` to `path`, replacing whatever was there.
///
/// Output is pretty-printed with two-space indentation and the file is
/// readable and writable by the owner only.
pub fn write_records(records: &[RequestRecord], path: &Path) -> Result<(), StoreError> {
    let staged = stage_records(records, path)?;
    commit_staged(staged, path)
}

/// Write the serialized document to a synced temp file next to `path`
fn stage_records(records: &[RequestRecord], path: &Path) -> Result<NamedTempFile, StoreError> {
    let data = serde_json::to_vec_pretty(records).map_err(|source| StoreError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;

    let io_err = |source: io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    // NamedTempFile is created with mode 0600 on Unix
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&data).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    Ok(tmp)
}

fn commit_staged(staged: NamedTempFile, path: &Path) -> Result<(), StoreError> {
    staged.persist(path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// A record store at a fixed path with serialized appends
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current history
    pub fn read(&self) -> Result<Vec<RequestRecord>, StoreError> {
        let _guard = self.lock.lock();
        read_records(&self.path)
    }

    /// Replace the history with `records`
    pub fn write(&self, records: &[RequestRecord]) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        write_records(records, &self.path)
    }

    /// Append `records` to the history, returning the new history length.
    ///
    /// Blocks the calling thread for the whole read-modify-write; run it on
    /// the blocking pool from async code.
    pub fn append(&self, records: &[RequestRecord]) -> Result<usize, AppendError> {
        self.append_gated(records, &CommitGate::new())
    }

    /// Like [`append`](Self::append), but the rename only happens if `gate`
    /// has not been abandoned. An abandoned append leaves the store untouched.
    pub fn append_gated(
        &self,
        records: &[RequestRecord],
        gate: &CommitGate,
    ) -> Result<usize, AppendError> {
        let _guard = self.lock.lock();

        let mut history = read_records(&self.path).map_err(AppendError::Read)?;
        history.extend_from_slice(records);
        let staged = stage_records(&history, &self.path).map_err(AppendError::Write)?;

        if !gate.claim_commit() {
            debug!(
                path = %self.path.display(),
                discarded = records.len(),
                "Append abandoned by caller, store left unchanged"
            );
            return Err(AppendError::Abandoned);
        }
        commit_staged(staged, &self.path).map_err(AppendError::Write)?;

        debug!(
            path = %self.path.display(),
            appended = records.len(),
            total = history.len(),
            "Records appended to store"
        );

        Ok(history.len())
    }

    /// Hold the store lock, stalling every append until the guard drops
    #[cfg(test)]
    pub(crate) fn stall(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.lock.lock()
    }
}
