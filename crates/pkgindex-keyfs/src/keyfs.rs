//! Key-level API over [`Storage`]
//!
//! [`KeyFs`] hands out read transactions pinned to a serial and write
//! transactions that commit at the next serial. Both implement
//! [`KeyRead`], so code that only reads can take either.

use crate::backend::{StorageBackend, backend_for};
use crate::changelog::{ChangelogEntry, RelpathAt, RelpathInfo, Value};
use crate::connection::Connection;
use crate::error::{KeyFsError, KeyFsResult};
use crate::keys::TypedKey;
use crate::storage::{CommitNotify, Storage};
use crate::writer::{CommitOutcome, Writer};
use parking_lot::RwLock;
use pkgindex_common::Serial;
use pkgindex_common::config::StorageConfig;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Listener called for every committed serial, own or imported.
///
/// Listeners run while the write admission is held and must not open
/// write transactions themselves.
pub type ChangeListener = Arc<dyn Fn(Serial, &ChangelogEntry) + Send + Sync>;

/// Read access shared by read and write transactions
pub trait KeyRead {
    /// Serial this transaction reads at, `None` on an empty store
    fn at_serial(&self) -> Option<Serial>;

    /// Value of `relpath` visible at `serial`
    fn get_relpath_at(&self, relpath: &str, serial: Serial) -> KeyFsResult<Option<RelpathAt>>;

    fn io_file_exists(&self, path: &str) -> KeyFsResult<bool>;
    fn io_file_get(&self, path: &str) -> KeyFsResult<Vec<u8>>;
    fn io_file_size(&self, path: &str) -> KeyFsResult<Option<u64>>;

    /// Serial of the last write to `key` at or before `serial` and the
    /// value it wrote
    fn last_serial_and_value_at(
        &self,
        key: &TypedKey,
        serial: Serial,
    ) -> KeyFsResult<Option<(Serial, Option<Arc<Value>>)>> {
        Ok(self
            .get_relpath_at(&key.relpath, serial)?
            .map(|found| (found.serial, found.value)))
    }

    /// Current value of `key`, `None` if absent or deleted
    fn get(&self, key: &TypedKey) -> KeyFsResult<Option<Arc<Value>>> {
        let Some(at) = self.at_serial() else {
            return Ok(None);
        };
        Ok(self
            .get_relpath_at(&key.relpath, at)?
            .and_then(|found| found.value))
    }

    /// Current value of `key` decoded into `T`
    fn get_as<T: DeserializeOwned>(&self, key: &TypedKey) -> KeyFsResult<Option<T>>
    where
        Self: Sized,
    {
        match self.get(key)? {
            Some(value) => Ok(Some(T::deserialize(&*value)?)),
            None => Ok(None),
        }
    }

    fn exists(&self, key: &TypedKey) -> KeyFsResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Read transaction pinned to one serial
pub struct ReadTx {
    conn: Connection,
    at_serial: Option<Serial>,
}

impl ReadTx {
    /// Underlying connection
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Latest entries of all relpaths with one of `keynames`
    pub fn iter_relpaths(&self, keynames: &BTreeSet<String>) -> KeyFsResult<Vec<RelpathInfo>> {
        match self.at_serial {
            Some(at) => self.conn.iter_relpaths_at(keynames, at),
            None => Ok(Vec::new()),
        }
    }
}

impl KeyRead for ReadTx {
    fn at_serial(&self) -> Option<Serial> {
        self.at_serial
    }

    fn get_relpath_at(&self, relpath: &str, serial: Serial) -> KeyFsResult<Option<RelpathAt>> {
        self.conn.get_relpath_at(relpath, serial)
    }

    fn io_file_exists(&self, path: &str) -> KeyFsResult<bool> {
        self.conn.io_file_exists(path)
    }

    fn io_file_get(&self, path: &str) -> KeyFsResult<Vec<u8>> {
        self.conn.io_file_get(path)
    }

    fn io_file_size(&self, path: &str) -> KeyFsResult<Option<u64>> {
        self.conn.io_file_size(path)
    }
}

/// Write transaction; dropping it without commit rolls back
pub struct WriteTx<'a> {
    writer: Writer<'a>,
}

impl WriteTx<'_> {
    /// Serial the transaction commits at
    #[must_use]
    pub fn commit_serial(&self) -> Serial {
        self.writer.commit_serial()
    }

    pub fn set(&mut self, key: &TypedKey, value: Value) -> KeyFsResult<()> {
        self.writer.record_set(key, Some(Arc::new(value)))
    }

    /// Serialize `value` and store it under `key`
    pub fn set_as<T: Serialize>(&mut self, key: &TypedKey, value: &T) -> KeyFsResult<()> {
        self.set(key, serde_json::to_value(value)?)
    }

    /// Logically erase `key` by recording a deletion
    pub fn delete(&mut self, key: &TypedKey) -> KeyFsResult<()> {
        self.writer.record_set(key, None)
    }

    pub fn io_file_set(&mut self, path: &str, data: &[u8]) -> KeyFsResult<()> {
        self.writer.io_file_set(path, data)
    }

    pub fn io_file_delete(&mut self, path: &str) -> KeyFsResult<bool> {
        self.writer.io_file_delete(path)
    }

    pub fn on_commit_success(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.writer.on_commit_success(Box::new(callback));
    }

    pub fn commit(self) -> KeyFsResult<CommitOutcome> {
        self.writer.commit()
    }

    pub fn rollback(self) -> KeyFsResult<()> {
        self.writer.rollback()
    }
}

impl KeyRead for WriteTx<'_> {
    fn at_serial(&self) -> Option<Serial> {
        Some(self.writer.commit_serial())
    }

    fn get_relpath_at(&self, relpath: &str, serial: Serial) -> KeyFsResult<Option<RelpathAt>> {
        self.writer.get_relpath_at(relpath, serial)
    }

    fn io_file_exists(&self, path: &str) -> KeyFsResult<bool> {
        self.writer.io_file_exists(path)
    }

    fn io_file_get(&self, path: &str) -> KeyFsResult<Vec<u8>> {
        self.writer.io_file_get(path)
    }

    fn io_file_size(&self, path: &str) -> KeyFsResult<Option<u64>> {
        self.writer.io_file_size(path)
    }
}

/// Serial-ordered transactional key/value and blob store
pub struct KeyFs {
    storage: Storage,
    serial_tx: Arc<watch::Sender<Option<Serial>>>,
    listeners: Arc<RwLock<Vec<ChangeListener>>>,
}

impl KeyFs {
    /// Open the store configured by `config` below `data_dir`
    pub fn open(config: &StorageConfig, data_dir: &Path) -> KeyFsResult<Self> {
        let backend = backend_for(config, data_dir);
        Self::with_backend(backend.as_ref(), config)
    }

    /// Open the store on an explicit backend
    pub fn with_backend(backend: &dyn StorageBackend, config: &StorageConfig) -> KeyFsResult<Self> {
        let serial_tx = Arc::new(watch::Sender::new(None));
        let listeners: Arc<RwLock<Vec<ChangeListener>>> = Arc::default();
        let notify: CommitNotify = {
            let serial_tx = Arc::clone(&serial_tx);
            let listeners = Arc::clone(&listeners);
            Box::new(move |serial, entry| {
                for listener in listeners.read().iter() {
                    listener(serial, entry);
                }
                serial_tx.send_replace(Some(serial));
            })
        };
        let storage = Storage::open(backend, config, notify)?;
        serial_tx.send_replace(storage.get_connection()?.last_changelog_serial());
        Ok(Self {
            storage,
            serial_tx,
            listeners,
        })
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Highest committed serial, `None` on an empty store
    pub fn last_serial(&self) -> KeyFsResult<Option<Serial>> {
        Ok(self.storage.get_connection()?.last_changelog_serial())
    }

    /// Read transaction at the current frontier
    pub fn read_transaction(&self) -> KeyFsResult<ReadTx> {
        let conn = self.storage.get_connection()?;
        let at_serial = conn.last_changelog_serial();
        Ok(ReadTx { conn, at_serial })
    }

    /// Read transaction at `serial`, clamped to the frontier
    pub fn read_transaction_at(&self, serial: Serial) -> KeyFsResult<ReadTx> {
        let conn = self.storage.get_connection()?;
        let at_serial = conn.last_changelog_serial().map(|last| last.min(serial));
        Ok(ReadTx { conn, at_serial })
    }

    /// Open a write transaction at the next serial
    pub fn begin_write(&self) -> KeyFsResult<WriteTx<'_>> {
        Ok(WriteTx {
            writer: self.storage.write_transaction()?,
        })
    }

    /// Run `f` in a write transaction; commit on `Ok`, roll back on `Err`
    pub fn write<T, E>(
        &self,
        f: impl FnOnce(&mut WriteTx<'_>) -> Result<T, E>,
    ) -> Result<(T, CommitOutcome), E>
    where
        E: From<KeyFsError>,
    {
        let mut tx = self.begin_write()?;
        match f(&mut tx) {
            Ok(value) => Ok((value, tx.commit()?)),
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Decoded changelog entry of `serial`
    pub fn read_changelog(&self, serial: Serial) -> KeyFsResult<Arc<ChangelogEntry>> {
        let conn = self.storage.get_connection()?;
        match conn.last_changelog_serial() {
            Some(last) if serial <= last => conn.get_changes(serial),
            _ => Err(KeyFsError::SerialNotFound(serial)),
        }
    }

    /// Apply a changelog entry received from a primary.
    ///
    /// Back-serials are taken from the entry as is; `serial` must be the
    /// next serial of this store.
    pub fn import_changes(&self, serial: Serial, entry: &ChangelogEntry) -> KeyFsResult<()> {
        let mut writer = self.storage.write_transaction()?;
        let expected = writer.commit_serial();
        if serial != expected {
            writer.rollback()?;
            return Err(KeyFsError::ImportOutOfOrder {
                expected,
                got: serial,
            });
        }
        if entry.changes.is_empty() {
            writer.rollback()?;
            return Err(KeyFsError::Consistency(format!(
                "empty changelog entry for serial {serial}"
            )));
        }
        for (relpath, record) in &entry.changes {
            writer.record_set_with_back_serial(
                &TypedKey::new(record.keyname.as_str(), relpath.as_str()),
                record.value.clone(),
                record.back_serial,
            )?;
        }
        writer.commit()?;
        debug!("imported serial {}", serial);
        Ok(())
    }

    /// Wait until a commit at or beyond `serial` is visible.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    pub async fn wait_tx_serial(&self, serial: Serial, timeout: Duration) -> bool {
        let mut rx = self.serial_tx.subscribe();
        tokio::time::timeout(
            timeout,
            rx.wait_for(|current| current.is_some_and(|current| current >= serial)),
        )
        .await
        .is_ok_and(|waited| waited.is_ok())
    }

    /// Receiver of the latest committed serial
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Serial>> {
        self.serial_tx.subscribe()
    }

    /// Register a listener for committed changes.
    ///
    /// Listeners are called while the committing transaction still holds
    /// the write admission, in serial order. A listener must not open a
    /// write transaction; use [`WriteTx::on_commit_success`] for that.
    pub fn add_change_listener(&self, listener: ChangeListener) {
        self.listeners.write().push(listener);
    }

    /// Read cache metrics
    #[must_use]
    pub fn metrics(&self) -> Vec<(&'static str, &'static str, u64)> {
        self.storage.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::keys::PatternKey;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LINKS: PatternKey =
        PatternKey::new("PROJSIMPLELINKS", "{user}/{index}/+simple/{project}");
    const NAMES: PatternKey = PatternKey::new("PROJNAMES", "{user}/{index}/.projects");

    fn keyfs() -> KeyFs {
        KeyFs::with_backend(&MemoryBackend, &StorageConfig::default()).unwrap()
    }

    fn links(project: &str) -> TypedKey {
        LINKS.key(&[("user", "root"), ("index", "pypi"), ("project", project)])
    }

    fn set(keyfs: &KeyFs, key: &TypedKey, value: Value) -> Serial {
        let mut tx = keyfs.begin_write().unwrap();
        tx.set(key, value).unwrap();
        tx.commit().unwrap().serial().unwrap()
    }

    #[test]
    fn test_serials_are_gapless() {
        let keyfs = keyfs();
        assert_eq!(keyfs.last_serial().unwrap(), None);
        let mut serials = Vec::new();
        for i in 0..5 {
            if i == 2 {
                let mut tx = keyfs.begin_write().unwrap();
                tx.set(&links("rolled"), json!(i)).unwrap();
                tx.rollback().unwrap();
            }
            serials.push(set(&keyfs, &links("six"), json!(i)));
        }
        assert_eq!(serials, vec![0, 1, 2, 3, 4]);
        assert_eq!(keyfs.last_serial().unwrap(), Some(4));
    }

    #[test]
    fn test_resolve_between_writes() {
        let keyfs = keyfs();
        let key = links("six");
        let other = links("other");
        // six written at 0, 2 and 5
        set(&keyfs, &key, json!("s0"));
        set(&keyfs, &other, json!(1));
        set(&keyfs, &key, json!("s2"));
        set(&keyfs, &other, json!(3));
        set(&keyfs, &other, json!(4));
        set(&keyfs, &key, json!("s5"));

        let rtx = keyfs.read_transaction().unwrap();
        let expected = ["s0", "s0", "s2", "s2", "s2", "s5"];
        for (serial, want) in expected.iter().enumerate() {
            let (found, value) = rtx
                .last_serial_and_value_at(&key, serial as Serial)
                .unwrap()
                .unwrap();
            assert_eq!(value.as_deref(), Some(&json!(want)));
            assert!(found <= serial as Serial);
        }
        assert!(rtx.get_relpath_at(&other.relpath, 0).unwrap().is_none());

        let at5 = rtx.get_relpath_at(&key.relpath, 5).unwrap().unwrap();
        assert_eq!((at5.serial, at5.back_serial), (5, Some(2)));
    }

    #[test]
    fn test_read_snapshot_is_pinned() {
        let keyfs = keyfs();
        let key = links("six");
        set(&keyfs, &key, json!("old"));
        let rtx = keyfs.read_transaction().unwrap();
        set(&keyfs, &key, json!("new"));

        assert_eq!(rtx.at_serial(), Some(0));
        assert_eq!(rtx.get(&key).unwrap().as_deref(), Some(&json!("old")));
        let fresh = keyfs.read_transaction().unwrap();
        assert_eq!(fresh.get(&key).unwrap().as_deref(), Some(&json!("new")));
        let pinned = keyfs.read_transaction_at(0).unwrap();
        assert_eq!(pinned.get(&key).unwrap().as_deref(), Some(&json!("old")));
    }

    #[test]
    fn test_delete_is_a_write() {
        let keyfs = keyfs();
        let key = links("six");
        set(&keyfs, &key, json!("v"));
        let mut tx = keyfs.begin_write().unwrap();
        tx.delete(&key).unwrap();
        assert!(!tx.exists(&key).unwrap());
        assert_eq!(tx.commit().unwrap(), CommitOutcome::Committed(1));

        let rtx = keyfs.read_transaction().unwrap();
        assert!(!rtx.exists(&key).unwrap());
        let deleted = rtx.get_relpath_at(&key.relpath, 1).unwrap().unwrap();
        assert_eq!((deleted.serial, deleted.value), (1, None));
        let changes = keyfs.read_changelog(1).unwrap();
        assert!(changes.changes[&key.relpath].value.is_none());
    }

    #[test]
    fn test_write_closure_rolls_back_on_error() {
        let keyfs = keyfs();
        let result: Result<((), CommitOutcome), KeyFsError> = keyfs.write(|tx| {
            tx.set(&links("six"), json!(1))?;
            Err(KeyFsError::Consistency("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(keyfs.last_serial().unwrap(), None);

        let (serial, outcome) = keyfs
            .write(|tx| -> KeyFsResult<Serial> {
                tx.set(&links("six"), json!(1))?;
                Ok(tx.commit_serial())
            })
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed(serial));
    }

    #[test]
    fn test_read_changelog_beyond_frontier() {
        let keyfs = keyfs();
        assert!(keyfs.read_changelog(0).unwrap_err().is_not_found());
        set(&keyfs, &links("six"), json!(1));
        assert_eq!(keyfs.read_changelog(0).unwrap().changes.len(), 1);
        assert!(matches!(
            keyfs.read_changelog(1),
            Err(KeyFsError::SerialNotFound(1))
        ));
    }

    #[test]
    fn test_iter_relpaths_by_keyname() {
        let keyfs = keyfs();
        let names = NAMES.key(&[("user", "root"), ("index", "pypi")]);
        set(&keyfs, &links("a"), json!("a0"));
        set(&keyfs, &names, json!(["a"]));
        set(&keyfs, &links("b"), json!("b2"));
        set(&keyfs, &links("a"), json!("a3"));

        let rtx = keyfs.read_transaction().unwrap();
        let keynames = BTreeSet::from(["PROJSIMPLELINKS".to_string()]);
        let rows = rtx.iter_relpaths(&keynames).unwrap();
        let seen: Vec<_> = rows.iter().map(|r| (r.relpath.as_str(), r.serial)).collect();
        assert_eq!(
            seen,
            vec![("root/pypi/+simple/a", 3), ("root/pypi/+simple/b", 2)]
        );
        assert_eq!(rows[0].back_serial, Some(0));

        let older = rtx.connection().iter_relpaths_at(&keynames, 2).unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].relpath, "root/pypi/+simple/b");
    }

    #[test]
    fn test_import_preserves_back_serials() {
        let primary = keyfs();
        let replica = keyfs();
        let imported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&imported);
        replica.add_change_listener(Arc::new(move |_: Serial, entry: &ChangelogEntry| {
            counter.fetch_add(entry.changes.len(), Ordering::Relaxed);
        }));

        set(&primary, &links("six"), json!(1));
        set(&primary, &links("six"), json!(2));
        for serial in 0..=1 {
            replica
                .import_changes(serial, &primary.read_changelog(serial).unwrap())
                .unwrap();
        }
        assert_eq!(imported.load(Ordering::Relaxed), 2);

        let rtx = replica.read_transaction().unwrap();
        let at1 = rtx.get_relpath_at(&links("six").relpath, 1).unwrap().unwrap();
        assert_eq!(at1.back_serial, Some(0));
        assert_eq!(at1.value.as_deref(), Some(&json!(2)));

        let err = replica
            .import_changes(5, &primary.read_changelog(1).unwrap())
            .unwrap_err();
        assert!(matches!(
            err,
            KeyFsError::ImportOutOfOrder { expected: 2, got: 5 }
        ));
    }

    #[tokio::test]
    async fn test_wait_tx_serial() {
        let keyfs = keyfs();
        assert!(!keyfs.wait_tx_serial(0, Duration::from_millis(10)).await);
        set(&keyfs, &links("six"), json!(1));
        assert!(keyfs.wait_tx_serial(0, Duration::from_millis(10)).await);
        assert!(!keyfs.wait_tx_serial(1, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_tx_serial_wakes_on_commit() {
        let keyfs = Arc::new(keyfs());
        let waiter = {
            let keyfs = Arc::clone(&keyfs);
            tokio::spawn(async move { keyfs.wait_tx_serial(1, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        set(&keyfs, &links("six"), json!(1));
        set(&keyfs, &links("six"), json!(2));
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_typed_values() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Record {
            serial: Option<u64>,
        }
        let keyfs = keyfs();
        let mut tx = keyfs.begin_write().unwrap();
        tx.set_as(&links("six"), &Record { serial: Some(7) }).unwrap();
        tx.commit().unwrap();
        let rtx = keyfs.read_transaction().unwrap();
        assert_eq!(
            rtx.get_as::<Record>(&links("six")).unwrap(),
            Some(Record { serial: Some(7) })
        );
    }

    #[test]
    fn test_commit_callback_runs_after_admission_release() {
        let config = StorageConfig {
            write_admission_timeout_secs: 0,
            ..StorageConfig::default()
        };
        let keyfs = Arc::new(KeyFs::with_backend(&MemoryBackend, &config).unwrap());
        let follow_up = Arc::new(AtomicUsize::new(0));

        let mut tx = keyfs.begin_write().unwrap();
        tx.set(&links("six"), json!(1)).unwrap();
        let (inner, done) = (Arc::clone(&keyfs), Arc::clone(&follow_up));
        tx.on_commit_success(move || {
            let mut tx = inner.begin_write().unwrap();
            tx.set(&links("other"), json!(2)).unwrap();
            let serial = tx.commit().unwrap().serial().unwrap();
            done.store(serial as usize, Ordering::SeqCst);
        });
        assert_eq!(tx.commit().unwrap(), CommitOutcome::Committed(0));

        assert_eq!(follow_up.load(Ordering::SeqCst), 1);
        assert_eq!(keyfs.last_serial().unwrap(), Some(1));
    }
}
