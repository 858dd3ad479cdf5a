//! Redb table definitions for the keyfs relations.
//!
//! Three logical relations plus one index:
//! - `kv`: relpath -> (keyname, serial of the latest write)
//! - `changelog`: serial -> JSON-encoded changelog entry
//! - `files`: blob path -> (size, data)
//! - `kv_serial_idx`: serial -> relpaths whose latest write is that serial

use redb::{MultimapTableDefinition, TableDefinition};

pub const KV: TableDefinition<&str, (&str, u64)> = TableDefinition::new("kv");
pub const CHANGELOG: TableDefinition<u64, &[u8]> = TableDefinition::new("changelog");
pub const FILES: TableDefinition<&str, (u64, &[u8])> = TableDefinition::new("files");
pub const KV_SERIAL_IDX: MultimapTableDefinition<u64, &str> =
    MultimapTableDefinition::new("kv_serial_idx");
