//! Self-healing schema
//!
//! On startup the catalog of existing tables is reflected and exactly the
//! missing expected objects are created inside one write transaction.
//! Existing objects are never dropped or altered.

use crate::error::{KeyFsError, KeyFsResult};
use crate::tables;
use redb::{Database, MultimapTableHandle, TableHandle, WriteTransaction};
use std::collections::BTreeSet;
use tracing::info;

/// Kind of schema object
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchemaKind {
    Table,
    Index,
}

/// One expected schema object
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaObject {
    pub kind: SchemaKind,
    pub name: &'static str,
}

/// Objects the keyfs needs; tables are listed before indexes
pub const EXPECTED_SCHEMA: &[SchemaObject] = &[
    SchemaObject {
        kind: SchemaKind::Table,
        name: "changelog",
    },
    SchemaObject {
        kind: SchemaKind::Table,
        name: "kv",
    },
    SchemaObject {
        kind: SchemaKind::Table,
        name: "files",
    },
    SchemaObject {
        kind: SchemaKind::Index,
        name: "kv_serial_idx",
    },
];

/// Objects currently present in the database
pub fn reflect_schema(db: &Database) -> KeyFsResult<BTreeSet<(SchemaKind, String)>> {
    let read_txn = db.begin_read()?;
    let mut present = BTreeSet::new();
    for handle in read_txn.list_tables()? {
        present.insert((SchemaKind::Table, handle.name().to_string()));
    }
    for handle in read_txn.list_multimap_tables()? {
        present.insert((SchemaKind::Index, handle.name().to_string()));
    }
    Ok(present)
}

fn missing_from(present: &BTreeSet<(SchemaKind, String)>) -> Vec<SchemaObject> {
    EXPECTED_SCHEMA
        .iter()
        .filter(|obj| !present.contains(&(obj.kind, obj.name.to_string())))
        .copied()
        .collect()
}

/// Create all missing objects in `write_txn` and commit it.
///
/// Returns the objects that were created.
pub fn ensure_tables_exist(
    db: &Database,
    write_txn: WriteTransaction,
) -> KeyFsResult<Vec<SchemaObject>> {
    let present = reflect_schema(db)?;
    let missing = missing_from(&present);
    if missing.is_empty() {
        write_txn.abort()?;
        return Ok(missing);
    }
    if present.is_empty() {
        info!("DB: Creating schema");
    } else {
        info!("DB: Updating schema");
    }
    for obj in &missing {
        create_object(&write_txn, obj).map_err(|e| {
            KeyFsError::Schema(format!("cannot create {:?} {}: {}", obj.kind, obj.name, e))
        })?;
    }
    write_txn
        .commit()
        .map_err(|e| KeyFsError::Schema(format!("cannot commit schema: {e}")))?;
    Ok(missing)
}

fn create_object(write_txn: &WriteTransaction, obj: &SchemaObject) -> KeyFsResult<()> {
    match obj.name {
        "changelog" => {
            write_txn.open_table(tables::CHANGELOG)?;
        }
        "kv" => {
            write_txn.open_table(tables::KV)?;
        }
        "files" => {
            write_txn.open_table(tables::FILES)?;
        }
        "kv_serial_idx" => {
            write_txn.open_multimap_table(tables::KV_SERIAL_IDX)?;
        }
        other => return Err(KeyFsError::Schema(format!("unknown schema object {other}"))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, StorageBackend};

    fn missing_objects(db: &Database) -> KeyFsResult<Vec<SchemaObject>> {
        Ok(missing_from(&reflect_schema(db)?))
    }

    #[test]
    fn test_creates_everything_on_empty_db() {
        let db = MemoryBackend.connect().unwrap();
        assert_eq!(missing_objects(&db).unwrap().len(), EXPECTED_SCHEMA.len());

        let created = ensure_tables_exist(&db, db.begin_write().unwrap()).unwrap();
        assert_eq!(created.len(), EXPECTED_SCHEMA.len());
        assert!(missing_objects(&db).unwrap().is_empty());
    }

    #[test]
    fn test_creates_only_missing_objects() {
        let db = MemoryBackend.connect().unwrap();
        let txn = db.begin_write().unwrap();
        {
            let mut table = txn.open_table(tables::KV).unwrap();
            table.insert("root/pypi/.projects", ("PROJNAMES", 0u64)).unwrap();
        }
        txn.commit().unwrap();

        let created = ensure_tables_exist(&db, db.begin_write().unwrap()).unwrap();
        let names: Vec<_> = created.iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["changelog", "files", "kv_serial_idx"]);

        // existing data survives
        let read_txn = db.begin_read().unwrap();
        let table = read_txn.open_table(tables::KV).unwrap();
        use redb::ReadableTable;
        assert!(table.get("root/pypi/.projects").unwrap().is_some());
    }

    #[test]
    fn test_second_run_is_noop() {
        let db = MemoryBackend.connect().unwrap();
        ensure_tables_exist(&db, db.begin_write().unwrap()).unwrap();
        let created = ensure_tables_exist(&db, db.begin_write().unwrap()).unwrap();
        assert!(created.is_empty());
    }
}
