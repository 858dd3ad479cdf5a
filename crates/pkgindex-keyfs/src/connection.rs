//! Read access to the keyfs relations
//!
//! [`Connection`] is a read snapshot of the database. The resolution logic
//! (changelog decoding, the back-serial walk, by-keyname scans) is written
//! once against [`RawRead`] so the [`crate::Writer`] can reuse it inside a
//! write transaction.

use crate::cache::ReadCache;
use crate::changelog::{ChangelogEntry, RelpathAt, RelpathInfo};
use crate::error::{KeyFsError, KeyFsResult};
use crate::tables;
use pkgindex_common::Serial;
use redb::{ReadTransaction, ReadableMultimapTable, ReadableTable, WriteTransaction};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Raw row access shared by read and write transactions
pub(crate) trait RawRead {
    fn raw_typedkey(&self, relpath: &str) -> KeyFsResult<Option<(String, Serial)>>;
    fn raw_changelog(&self, serial: Serial) -> KeyFsResult<Option<Vec<u8>>>;
    fn raw_last_serial(&self) -> KeyFsResult<Option<Serial>>;
    fn raw_relpaths_at(&self, serial: Serial) -> KeyFsResult<Vec<String>>;
    fn raw_file(&self, path: &str) -> KeyFsResult<Option<(u64, Vec<u8>)>>;
    fn raw_file_size(&self, path: &str) -> KeyFsResult<Option<u64>>;
}

macro_rules! impl_raw_read {
    ($txn:ty) => {
        impl RawRead for $txn {
            fn raw_typedkey(&self, relpath: &str) -> KeyFsResult<Option<(String, Serial)>> {
                let table = self.open_table(tables::KV)?;
                Ok(table.get(relpath)?.map(|row| {
                    let (keyname, serial) = row.value();
                    (keyname.to_string(), serial)
                }))
            }

            fn raw_changelog(&self, serial: Serial) -> KeyFsResult<Option<Vec<u8>>> {
                let table = self.open_table(tables::CHANGELOG)?;
                Ok(table.get(serial)?.map(|row| row.value().to_vec()))
            }

            fn raw_last_serial(&self) -> KeyFsResult<Option<Serial>> {
                let table = self.open_table(tables::CHANGELOG)?;
                Ok(table.last()?.map(|(serial, _)| serial.value()))
            }

            fn raw_relpaths_at(&self, serial: Serial) -> KeyFsResult<Vec<String>> {
                let table = self.open_multimap_table(tables::KV_SERIAL_IDX)?;
                let mut relpaths = Vec::new();
                for relpath in table.get(serial)? {
                    relpaths.push(relpath?.value().to_string());
                }
                Ok(relpaths)
            }

            fn raw_file(&self, path: &str) -> KeyFsResult<Option<(u64, Vec<u8>)>> {
                let table = self.open_table(tables::FILES)?;
                Ok(table.get(path)?.map(|row| {
                    let (size, data) = row.value();
                    (size, data.to_vec())
                }))
            }

            fn raw_file_size(&self, path: &str) -> KeyFsResult<Option<u64>> {
                let table = self.open_table(tables::FILES)?;
                Ok(table.get(path)?.map(|row| row.value().0))
            }
        }
    };
}

impl_raw_read!(ReadTransaction);
impl_raw_read!(WriteTransaction);

/// Reject absolute blob paths
pub(crate) fn check_blob_path(path: &str) -> KeyFsResult<()> {
    if path.is_empty() || path.starts_with('/') || Path::new(path).is_absolute() {
        return Err(KeyFsError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Decoded changelog entry of `serial`, through the changelog pool
pub(crate) fn get_changes(
    raw: &impl RawRead,
    cache: &ReadCache,
    serial: Serial,
) -> KeyFsResult<Arc<ChangelogEntry>> {
    if let Some(entry) = cache.get_entry(serial) {
        return Ok(entry);
    }
    let data = raw
        .raw_changelog(serial)?
        .ok_or(KeyFsError::SerialNotFound(serial))?;
    let entry = Arc::new(ChangelogEntry::from_bytes(&data)?);
    cache.put_entry(serial, Arc::clone(&entry));
    Ok(entry)
}

/// Walk the back-serial chain of `relpath` starting at `start` until a
/// write at or before `serial` is found.
pub(crate) fn walk_back(
    raw: &impl RawRead,
    cache: &ReadCache,
    relpath: &str,
    start: Serial,
    serial: Serial,
) -> KeyFsResult<Option<RelpathAt>> {
    let mut current = start;
    loop {
        let changes = get_changes(raw, cache, current)?;
        let found = changes.relpath_at(relpath, current).ok_or_else(|| {
            KeyFsError::Consistency(format!(
                "relpath {relpath:?} missing from changelog entry {current}"
            ))
        })?;
        if current <= serial {
            return Ok(Some(found));
        }
        match found.back_serial {
            Some(back) if back < current => current = back,
            Some(back) => {
                return Err(KeyFsError::Consistency(format!(
                    "relpath {relpath:?} at {current} points forward to {back}"
                )));
            }
            None => return Ok(None),
        }
    }
}

/// Value of `relpath` visible at `serial`, `None` if it never existed then.
///
/// `serial` is clamped to `frontier`: nothing newer than the frontier
/// exists yet, and only results at or below it are stable enough to cache.
pub(crate) fn resolve_relpath_at(
    raw: &impl RawRead,
    cache: &ReadCache,
    relpath: &str,
    serial: Serial,
    frontier: Option<Serial>,
) -> KeyFsResult<Option<RelpathAt>> {
    let Some(frontier) = frontier else {
        return Ok(None);
    };
    let serial = serial.min(frontier);
    if let Some(found) = cache.get_relpath_at(relpath, serial) {
        return Ok(Some(found));
    }
    let Some((_, last_serial)) = raw.raw_typedkey(relpath)? else {
        return Ok(None);
    };
    let result = walk_back(raw, cache, relpath, last_serial, serial)?;
    if let Some(found) = &result {
        cache.put_relpath_at(relpath, serial, found.clone());
    }
    Ok(result)
}

/// Latest entry of every relpath with one of `keynames` whose most recent
/// write is at or before `at_serial`, newest first.
pub(crate) fn iter_relpaths_at(
    raw: &impl RawRead,
    cache: &ReadCache,
    keynames: &BTreeSet<String>,
    at_serial: Serial,
) -> KeyFsResult<Vec<RelpathInfo>> {
    let mut result = Vec::new();
    for serial in (0..=at_serial).rev() {
        let relpaths = raw.raw_relpaths_at(serial)?;
        if relpaths.is_empty() {
            continue;
        }
        let changes = get_changes(raw, cache, serial)?;
        for relpath in relpaths {
            let Some(record) = changes.changes.get(&relpath) else {
                continue;
            };
            if !keynames.contains(&record.keyname) {
                continue;
            }
            result.push(RelpathInfo {
                keyname: record.keyname.clone(),
                relpath,
                serial,
                back_serial: record.back_serial,
                value: record.value.clone(),
            });
        }
    }
    Ok(result)
}

/// Read snapshot of the keyfs at the serial it was opened at
pub struct Connection {
    txn: ReadTransaction,
    cache: Arc<ReadCache>,
    last_serial: Option<Serial>,
}

impl Connection {
    pub(crate) fn new(txn: ReadTransaction, cache: Arc<ReadCache>) -> KeyFsResult<Self> {
        let last_serial = txn.raw_last_serial()?;
        Ok(Self {
            txn,
            cache,
            last_serial,
        })
    }

    /// Highest committed serial visible in this snapshot
    #[must_use]
    pub fn last_changelog_serial(&self) -> Option<Serial> {
        self.last_serial
    }

    /// Keyname and latest serial of `relpath`
    pub fn db_read_typedkey(&self, relpath: &str) -> KeyFsResult<(String, Serial)> {
        self.txn
            .raw_typedkey(relpath)?
            .ok_or_else(|| KeyFsError::KeyNotFound(relpath.to_string()))
    }

    /// Encoded changelog entry, `None` if the serial was never committed
    pub fn get_raw_changelog_entry(&self, serial: Serial) -> KeyFsResult<Option<Vec<u8>>> {
        self.txn.raw_changelog(serial)
    }

    /// Decoded changelog entry of `serial`
    pub fn get_changes(&self, serial: Serial) -> KeyFsResult<Arc<ChangelogEntry>> {
        get_changes(&self.txn, &self.cache, serial)
    }

    /// Value of `relpath` visible at `serial`
    pub fn get_relpath_at(&self, relpath: &str, serial: Serial) -> KeyFsResult<Option<RelpathAt>> {
        resolve_relpath_at(&self.txn, &self.cache, relpath, serial, self.last_serial)
    }

    /// Range scan by keyname, see [`RelpathInfo`]
    pub fn iter_relpaths_at(
        &self,
        keynames: &BTreeSet<String>,
        at_serial: Serial,
    ) -> KeyFsResult<Vec<RelpathInfo>> {
        match self.last_serial {
            Some(last) => iter_relpaths_at(&self.txn, &self.cache, keynames, at_serial.min(last)),
            None => Ok(Vec::new()),
        }
    }

    /// Check if a blob exists
    pub fn io_file_exists(&self, path: &str) -> KeyFsResult<bool> {
        check_blob_path(path)?;
        Ok(self.txn.raw_file_size(path)?.is_some())
    }

    /// Blob content
    pub fn io_file_get(&self, path: &str) -> KeyFsResult<Vec<u8>> {
        check_blob_path(path)?;
        self.txn
            .raw_file(path)?
            .map(|(_, data)| data)
            .ok_or_else(|| KeyFsError::KeyNotFound(path.to_string()))
    }

    /// Blob size, `None` if the blob does not exist
    pub fn io_file_size(&self, path: &str) -> KeyFsResult<Option<u64>> {
        check_blob_path(path)?;
        self.txn.raw_file_size(path)
    }
}
