//! Connection/backend adapter
//!
//! Owns the redb database, the shared read cache and the single-writer
//! admission. Readers never take the admission lock.

use crate::backend::StorageBackend;
use crate::cache::ReadCache;
use crate::changelog::ChangelogEntry;
use crate::connection::Connection;
use crate::error::{KeyFsError, KeyFsResult};
use crate::schema;
use crate::writer::Writer;
use parking_lot::Mutex;
use pkgindex_common::Serial;
use pkgindex_common::config::StorageConfig;
use redb::Database;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info};

/// Commit notification, fired synchronously after every committed serial
pub type CommitNotify = Box<dyn Fn(Serial, &ChangelogEntry) + Send + Sync>;

/// Backend database plus write admission
pub struct Storage {
    db: Database,
    backend_name: &'static str,
    cache: Arc<ReadCache>,
    admission: Mutex<()>,
    write_admission_timeout: Duration,
    notify: CommitNotify,
    last_commit_timestamp: Mutex<Option<SystemTime>>,
}

impl Storage {
    /// Connect through `backend`, run crash recovery and create any
    /// missing schema objects.
    pub fn open(
        backend: &dyn StorageBackend,
        config: &StorageConfig,
        notify: CommitNotify,
    ) -> KeyFsResult<Self> {
        let db = backend.connect()?;
        backend.perform_crash_recovery(&db)?;
        let created = schema::ensure_tables_exist(&db, db.begin_write()?)?;
        if !created.is_empty() {
            info!(
                "Created {} schema objects in {}",
                created.len(),
                backend.description()
            );
        }
        Ok(Self {
            db,
            backend_name: backend.name(),
            cache: Arc::new(ReadCache::new(config.cache_size, config.big_value_threshold)),
            admission: Mutex::new(()),
            write_admission_timeout: config.write_admission_timeout(),
            notify,
            last_commit_timestamp: Mutex::new(None),
        })
    }

    /// Name of the backend in use
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub(crate) fn cache(&self) -> &ReadCache {
        &self.cache
    }

    /// Open a read snapshot
    pub fn get_connection(&self) -> KeyFsResult<Connection> {
        Connection::new(self.db.begin_read()?, Arc::clone(&self.cache))
    }

    /// Acquire write admission and open a write transaction.
    ///
    /// Fails with [`KeyFsError::WriteAdmissionTimeout`] when another
    /// writer holds the admission longer than the configured timeout.
    pub fn write_transaction(&self) -> KeyFsResult<Writer<'_>> {
        let Some(admission) = self.admission.try_lock_for(self.write_admission_timeout) else {
            error!(
                "Could not acquire write admission within {:?}",
                self.write_admission_timeout
            );
            return Err(KeyFsError::WriteAdmissionTimeout(self.write_admission_timeout));
        };
        let txn = self.db.begin_write()?;
        Writer::new(self, txn, admission)
    }

    pub(crate) fn notify_committed(&self, serial: Serial, entry: &ChangelogEntry) {
        *self.last_commit_timestamp.lock() = Some(SystemTime::now());
        (self.notify)(serial, entry);
    }

    /// Wall-clock time of the last commit made through this handle
    #[must_use]
    pub fn last_commit_timestamp(&self) -> Option<SystemTime> {
        *self.last_commit_timestamp.lock()
    }

    /// Read cache metrics as `(name, kind, value)` triples
    #[must_use]
    pub fn metrics(&self) -> Vec<(&'static str, &'static str, u64)> {
        self.cache.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileBackend, MemoryBackend};
    use crate::keys::TypedKey;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_notify_fires_with_serial() {
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let sink = Arc::clone(&seen);
        let storage = Storage::open(
            &MemoryBackend,
            &StorageConfig::default(),
            Box::new(move |serial, entry| {
                assert_eq!(entry.changes.len(), 1);
                sink.store(serial, Ordering::Relaxed);
            }),
        )
        .unwrap();

        let mut writer = storage.write_transaction().unwrap();
        writer
            .record_set(&TypedKey::new("K", "x"), Some(Arc::new(json!(1))))
            .unwrap();
        writer.commit().unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 0);
        assert!(storage.last_commit_timestamp().is_some());
    }

    #[test]
    fn test_write_admission_timeout() {
        let config = StorageConfig {
            write_admission_timeout_secs: 0,
            ..StorageConfig::default()
        };
        let storage = Storage::open(&MemoryBackend, &config, Box::new(|_, _| {})).unwrap();
        let _writer = storage.write_transaction().unwrap();
        assert!(matches!(
            storage.write_transaction(),
            Err(KeyFsError::WriteAdmissionTimeout(_))
        ));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join(".redb_db"));
        let config = StorageConfig::default();
        {
            let storage = Storage::open(&backend, &config, Box::new(|_, _| {})).unwrap();
            let mut writer = storage.write_transaction().unwrap();
            writer
                .record_set(&TypedKey::new("K", "x"), Some(Arc::new(json!("kept"))))
                .unwrap();
            writer.commit().unwrap();
        }
        let storage = Storage::open(&backend, &config, Box::new(|_, _| {})).unwrap();
        let conn = storage.get_connection().unwrap();
        assert_eq!(conn.last_changelog_serial(), Some(0));
        let found = conn.get_relpath_at("x", 0).unwrap().unwrap();
        assert_eq!(found.value.as_deref(), Some(&json!("kept")));
    }
}
