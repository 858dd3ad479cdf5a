//! Storage backends
//!
//! A backend knows how to produce a connected [`redb::Database`] and how to
//! recover after a crash. The trait is sealed: the set of backends is
//! fixed by this crate and selected once from configuration.

use crate::error::KeyFsResult;
use pkgindex_common::config::{BackendKind, StorageConfig};
use redb::Database;
use redb::backends::InMemoryBackend;
use std::path::{Path, PathBuf};
use tracing::info;

mod sealed {
    pub trait Sealed {}
}

/// Physical connection provider for [`crate::Storage`]
pub trait StorageBackend: sealed::Sealed + Send + Sync {
    /// Short backend identifier
    fn name(&self) -> &'static str;

    /// Human readable description
    fn description(&self) -> &'static str;

    /// Open (or create) the database
    fn connect(&self) -> KeyFsResult<Database>;

    /// Hook run after connecting, before the schema check.
    ///
    /// Redb commits are atomic and durable, so there is nothing to
    /// repair for the backends in this crate.
    fn perform_crash_recovery(&self, _db: &Database) -> KeyFsResult<()> {
        Ok(())
    }
}

/// Database file on local disk
#[derive(Clone, Debug)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Backend for the database file at `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Location of the database file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl sealed::Sealed for FileBackend {}

impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "redb_file"
    }

    fn description(&self) -> &'static str {
        "redb database file with blobs stored in the database"
    }

    fn connect(&self) -> KeyFsResult<Database> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existed = self.path.exists();
        let db = Database::create(&self.path)?;
        if !existed {
            info!("Created database file {:?}", self.path);
        }
        Ok(db)
    }
}

/// Volatile in-memory database
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryBackend;

impl sealed::Sealed for MemoryBackend {}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "redb_memory"
    }

    fn description(&self) -> &'static str {
        "in-memory redb database for testing only"
    }

    fn connect(&self) -> KeyFsResult<Database> {
        Ok(redb::Builder::new().create_with_backend(InMemoryBackend::new())?)
    }
}

/// Pick the backend named by the storage configuration
pub fn backend_for(config: &StorageConfig, data_dir: &Path) -> Box<dyn StorageBackend> {
    match config.backend {
        BackendKind::File => Box::new(FileBackend::new(data_dir.join(&config.db_filename))),
        BackendKind::Memory => Box::new(MemoryBackend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_backend_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("nested/deeper/.redb_db"));
        backend.connect().unwrap();
        assert!(backend.path().exists());
    }

    #[test]
    fn test_backend_selection() {
        let dir = tempdir().unwrap();
        let mut config = StorageConfig::default();
        assert_eq!(backend_for(&config, dir.path()).name(), "redb_file");
        config.backend = BackendKind::Memory;
        assert_eq!(backend_for(&config, dir.path()).name(), "redb_memory");
    }
}
