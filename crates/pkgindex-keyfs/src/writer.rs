//! Transaction writer
//!
//! A [`Writer`] holds the write admission of its [`Storage`] and one redb
//! write transaction. Every `record_set` updates the typed-key index
//! right away so later reads in the same transaction see the pending
//! value; the buffered changes become one changelog entry at commit.

use crate::changelog::{ChangeRecord, ChangedKeys, ChangelogEntry, RelpathAt, Value};
use crate::connection::{self, RawRead, check_blob_path};
use crate::error::{KeyFsError, KeyFsResult};
use crate::keys::TypedKey;
use crate::storage::Storage;
use crate::tables;
use parking_lot::MutexGuard;
use pkgindex_common::Serial;
use redb::{ReadableTable, WriteTransaction};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a successful commit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Key changes were written at this serial
    Committed(Serial),
    /// Only blobs changed, no serial was consumed
    FilesOnly,
    /// Nothing changed, the transaction was closed
    Empty,
}

impl CommitOutcome {
    /// Serial consumed by the commit, if any
    #[must_use]
    pub fn serial(self) -> Option<Serial> {
        match self {
            Self::Committed(serial) => Some(serial),
            Self::FilesOnly | Self::Empty => None,
        }
    }
}

/// Callback run after a successful commit
pub type CommitCallback = Box<dyn FnOnce() + Send>;

/// Open write transaction at `commit_serial`
pub struct Writer<'a> {
    // dropped before the admission guard
    txn: WriteTransaction,
    _admission: MutexGuard<'a, ()>,
    storage: &'a Storage,
    frontier: Option<Serial>,
    commit_serial: Serial,
    changes: BTreeMap<String, ChangeRecord>,
    dirty_files: BTreeSet<String>,
    on_commit: Vec<CommitCallback>,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(
        storage: &'a Storage,
        txn: WriteTransaction,
        admission: MutexGuard<'a, ()>,
    ) -> KeyFsResult<Self> {
        let frontier = txn.raw_last_serial()?;
        let commit_serial = frontier.map_or(0, |serial| serial + 1);
        Ok(Self {
            txn,
            _admission: admission,
            storage,
            frontier,
            commit_serial,
            changes: BTreeMap::new(),
            dirty_files: BTreeSet::new(),
            on_commit: Vec::new(),
        })
    }

    /// Serial this transaction will commit at
    #[must_use]
    pub fn commit_serial(&self) -> Serial {
        self.commit_serial
    }

    /// Highest committed serial when the transaction was opened
    #[must_use]
    pub fn frontier(&self) -> Option<Serial> {
        self.frontier
    }

    /// Relpaths changed so far
    #[must_use]
    pub fn changes(&self) -> &BTreeMap<String, ChangeRecord> {
        &self.changes
    }

    /// Record a new value for `key`, `None` marks a deletion.
    ///
    /// The back-serial is taken from the typed-key index.
    pub fn record_set(&mut self, key: &TypedKey, value: Option<Arc<Value>>) -> KeyFsResult<()> {
        let back_serial = match self.changes.get(&key.relpath) {
            Some(pending) => pending.back_serial,
            None => self.txn.raw_typedkey(&key.relpath)?.map(|(_, serial)| serial),
        };
        self.record_set_with_back_serial(key, value, back_serial)
    }

    /// Record a new value for `key` with an explicit back-serial
    pub fn record_set_with_back_serial(
        &mut self,
        key: &TypedKey,
        value: Option<Arc<Value>>,
        back_serial: Option<Serial>,
    ) -> KeyFsResult<()> {
        self.write_typedkey(&key.relpath, &key.name)?;
        self.changes.insert(
            key.relpath.clone(),
            ChangeRecord {
                keyname: key.name.clone(),
                back_serial,
                value,
            },
        );
        Ok(())
    }

    fn write_typedkey(&self, relpath: &str, keyname: &str) -> KeyFsResult<()> {
        let previous = {
            let mut kv = self.txn.open_table(tables::KV)?;
            let previous = kv.get(relpath)?.map(|row| row.value().1);
            kv.insert(relpath, (keyname, self.commit_serial))?;
            previous
        };
        let mut idx = self.txn.open_multimap_table(tables::KV_SERIAL_IDX)?;
        if let Some(previous) = previous.filter(|serial| *serial != self.commit_serial) {
            idx.remove(previous, relpath)?;
        }
        idx.insert(self.commit_serial, relpath)?;
        Ok(())
    }

    /// Value of `relpath` visible at `serial`, pending writes included
    pub fn get_relpath_at(&self, relpath: &str, serial: Serial) -> KeyFsResult<Option<RelpathAt>> {
        let cache = self.storage.cache();
        match self.changes.get(relpath) {
            Some(pending) if serial >= self.commit_serial => Ok(Some(RelpathAt {
                serial: self.commit_serial,
                back_serial: pending.back_serial,
                value: pending.value.clone(),
            })),
            Some(pending) => match pending.back_serial {
                Some(back) => connection::walk_back(&self.txn, cache, relpath, back, serial),
                None => Ok(None),
            },
            None => {
                connection::resolve_relpath_at(&self.txn, cache, relpath, serial, self.frontier)
            }
        }
    }

    /// Keyname and latest serial of `relpath`, pending writes included
    pub fn db_read_typedkey(&self, relpath: &str) -> KeyFsResult<(String, Serial)> {
        self.txn
            .raw_typedkey(relpath)?
            .ok_or_else(|| KeyFsError::KeyNotFound(relpath.to_string()))
    }

    /// Store a blob
    pub fn io_file_set(&mut self, path: &str, data: &[u8]) -> KeyFsResult<()> {
        check_blob_path(path)?;
        if path.ends_with("-tmp") {
            return Err(KeyFsError::InvalidPath(path.to_string()));
        }
        {
            let mut files = self.txn.open_table(tables::FILES)?;
            files.insert(path, (data.len() as u64, data))?;
        }
        self.dirty_files.insert(path.to_string());
        Ok(())
    }

    /// Remove a blob, returns whether it existed
    pub fn io_file_delete(&mut self, path: &str) -> KeyFsResult<bool> {
        check_blob_path(path)?;
        let existed = {
            let mut files = self.txn.open_table(tables::FILES)?;
            files.remove(path)?.is_some()
        };
        self.dirty_files.insert(path.to_string());
        Ok(existed)
    }

    pub fn io_file_exists(&self, path: &str) -> KeyFsResult<bool> {
        check_blob_path(path)?;
        Ok(self.txn.raw_file_size(path)?.is_some())
    }

    pub fn io_file_get(&self, path: &str) -> KeyFsResult<Vec<u8>> {
        check_blob_path(path)?;
        self.txn
            .raw_file(path)?
            .map(|(_, data)| data)
            .ok_or_else(|| KeyFsError::KeyNotFound(path.to_string()))
    }

    pub fn io_file_size(&self, path: &str) -> KeyFsResult<Option<u64>> {
        check_blob_path(path)?;
        self.txn.raw_file_size(path)
    }

    /// Register a callback to run once the transaction committed.
    ///
    /// Callbacks run after the write admission is released, so they may
    /// open a new write transaction.
    pub fn on_commit_success(&mut self, callback: CommitCallback) {
        self.on_commit.push(callback);
    }

    /// Write the changelog entry, commit and fire the commit notification
    pub fn commit(self) -> KeyFsResult<CommitOutcome> {
        let Self {
            txn,
            _admission: admission,
            storage,
            commit_serial,
            changes,
            dirty_files,
            on_commit,
            ..
        } = self;

        let outcome = if changes.is_empty() {
            if dirty_files.is_empty() {
                txn.abort()?;
                debug!("nothing to commit, closing transaction");
                CommitOutcome::Empty
            } else {
                txn.commit()?;
                info!("wrote {} files without increasing serial", dirty_files.len());
                CommitOutcome::FilesOnly
            }
        } else {
            let entry = ChangelogEntry { changes };
            {
                let data = entry.to_bytes()?;
                let mut changelog = txn.open_table(tables::CHANGELOG)?;
                changelog.insert(commit_serial, data.as_slice())?;
            }
            txn.commit()?;
            info!("committed at {}", commit_serial);
            debug!("committed {}", ChangedKeys(&entry.changes));
            let entry = Arc::new(entry);
            storage.cache().put_entry(commit_serial, Arc::clone(&entry));
            storage.notify_committed(commit_serial, &entry);
            CommitOutcome::Committed(commit_serial)
        };

        // listeners ran in serial order under the admission; callbacks may write
        drop(admission);
        for callback in on_commit {
            callback();
        }
        Ok(outcome)
    }

    /// Abort without consuming a serial
    pub fn rollback(self) -> KeyFsResult<()> {
        let commit_serial = self.commit_serial;
        self.txn.abort()?;
        info!("roll back at {}", commit_serial);
        Ok(())
    }
}
