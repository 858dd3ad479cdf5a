//! pkgindex KeyFS - serial-ordered transactional key/value and blob store
//!
//! Every committed write transaction gets the next serial and one
//! changelog entry. A typed-key index points each relpath at the serial
//! of its latest write; older values are reached through back-serials.
//! Readers pin a serial and never block the single writer.

pub mod backend;
pub mod cache;
pub mod changelog;
pub mod connection;
pub mod error;
pub mod keyfs;
pub mod keys;
pub mod schema;
pub mod storage;
pub mod tables;
pub mod writer;

// Re-exports
pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use cache::{CacheStats, ReadCache};
pub use changelog::{ChangeRecord, ChangelogEntry, RelpathAt, RelpathInfo, Value};
pub use connection::Connection;
pub use error::{KeyFsError, KeyFsResult};
pub use keyfs::{ChangeListener, KeyFs, KeyRead, ReadTx, WriteTx};
pub use keys::{PatternKey, TypedKey};
pub use storage::Storage;
pub use writer::{CommitOutcome, Writer};
