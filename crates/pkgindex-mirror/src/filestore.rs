//! Release file entries
//!
//! Every release link of a mirrored project maps to one keyfs record that
//! remembers where the file comes from. The file content itself is a
//! keyfs blob stored under the same relpath once it was downloaded.

use crate::error::MirrorResult;
use crate::keys::{STAGEEXTFILE, STAGEFILE};
use crate::links::{Link, split_basename};
use pkgindex_common::StageName;
use pkgindex_keyfs::{KeyRead, TypedKey, WriteTx};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Persisted metadata of a release file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntryRecord {
    pub project: String,
    pub version: Option<String>,
    pub url: String,
    pub hash_spec: Option<String>,
}

/// A release file entry of a stage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub key: TypedKey,
    pub record: FileEntryRecord,
}

impl FileEntry {
    #[must_use]
    pub fn relpath(&self) -> &str {
        &self.key.relpath
    }

    #[must_use]
    pub fn project(&self) -> &str {
        &self.record.project
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.record.version.as_deref()
    }

    /// Check if the file content is stored locally
    pub fn file_exists(&self, tx: &impl KeyRead) -> MirrorResult<bool> {
        Ok(tx.io_file_exists(self.relpath())?)
    }

    /// Store the file content
    pub fn file_set(&self, tx: &mut WriteTx<'_>, data: &[u8]) -> MirrorResult<()> {
        Ok(tx.io_file_set(self.relpath(), data)?)
    }

    /// Remove the file content, keeping the entry
    pub fn file_delete(&self, tx: &mut WriteTx<'_>) -> MirrorResult<bool> {
        Ok(tx.io_file_delete(self.relpath())?)
    }

    /// Remove the file content and the entry
    pub fn delete(&self, tx: &mut WriteTx<'_>) -> MirrorResult<()> {
        tx.io_file_delete(self.relpath())?;
        tx.delete(&self.key)?;
        Ok(())
    }
}

/// File entries of one stage
#[derive(Clone, Debug)]
pub struct FileStore {
    stage: StageName,
}

impl FileStore {
    #[must_use]
    pub fn new(stage: StageName) -> Self {
        Self { stage }
    }

    /// Local key of a release link.
    ///
    /// Links with a usable hash are stored below `+f/` by digest, all
    /// others below `+e/` by a digest of their URL directory.
    #[must_use]
    pub fn key_from_link(&self, link: &Link) -> TypedKey {
        let stage = [
            ("user", self.stage.user.as_str()),
            ("index", self.stage.index.as_str()),
        ];
        match link.hash_value().filter(|digest| digest.len() >= 16) {
            Some(digest) => STAGEFILE.key(&[
                stage[0],
                stage[1],
                ("hashdir_a", &digest[..3]),
                ("hashdir_b", &digest[3..16]),
                ("filename", link.basename.as_str()),
            ]),
            None => {
                let url = link.url.as_str();
                let dir = url.rsplit_once('/').map_or(url, |(dir, _)| dir);
                let dirname = hex::encode(Sha256::digest(dir.as_bytes()));
                STAGEEXTFILE.key(&[
                    stage[0],
                    stage[1],
                    ("dirname", &dirname[..16]),
                    ("filename", link.basename.as_str()),
                ])
            }
        }
    }

    /// Create or update the entry of `link` and return it
    pub fn maplink(
        &self,
        tx: &mut WriteTx<'_>,
        link: &Link,
        project: &str,
    ) -> MirrorResult<FileEntry> {
        let key = self.key_from_link(link);
        let record = FileEntryRecord {
            project: project.to_string(),
            version: split_basename(&link.basename).map(|parts| parts.version),
            url: link.url.to_string(),
            hash_spec: link.hash_spec.clone(),
        };
        let current: Option<FileEntryRecord> = tx.get_as(&key)?;
        if current.as_ref() != Some(&record) {
            tx.set_as(&key, &record)?;
        }
        Ok(FileEntry { key, record })
    }

    /// Entry stored under `relpath`, if any
    pub fn get_file_entry(
        &self,
        tx: &impl KeyRead,
        relpath: &str,
    ) -> MirrorResult<Option<FileEntry>> {
        let key = TypedKey::new(STAGEFILE.name, relpath);
        let record: Option<FileEntryRecord> = tx.get_as(&key)?;
        Ok(record.map(|record| FileEntry { key, record }))
    }

    /// Entry of a simple link href, ignoring its hash fragment
    pub fn entry_from_href(
        &self,
        tx: &impl KeyRead,
        href: &str,
    ) -> MirrorResult<Option<FileEntry>> {
        let relpath = href.split_once('#').map_or(href, |(path, _)| path);
        self.get_file_entry(tx, relpath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgindex_common::config::StorageConfig;
    use pkgindex_keyfs::{KeyFs, MemoryBackend};
    use reqwest::Url;

    const HASH: &str = "3a5a3d4a4e6f1b5c8d7e9f0a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e";

    fn store() -> FileStore {
        FileStore::new(StageName::new("root", "pypi"))
    }

    fn link(url: &str) -> Link {
        Link::new(Url::parse(url).unwrap(), None, None)
    }

    #[test]
    fn test_keys_by_hash_and_by_url() {
        let hashed = store().key_from_link(&link(&format!(
            "https://files.example/six-1.0.tar.gz#sha256={HASH}"
        )));
        assert_eq!(
            hashed.relpath,
            "root/pypi/+f/3a5/a3d4a4e6f1b5c/six-1.0.tar.gz"
        );
        assert_eq!(hashed.name, "STAGEFILE");

        let plain = store().key_from_link(&link("https://files.example/a/six-1.0.tar.gz"));
        assert!(plain.relpath.starts_with("root/pypi/+e/"));
        assert!(plain.relpath.ends_with("/six-1.0.tar.gz"));
        let sibling = store().key_from_link(&link("https://files.example/a/six-1.1.tar.gz"));
        assert_eq!(
            plain.relpath.rsplit_once('/').unwrap().0,
            sibling.relpath.rsplit_once('/').unwrap().0
        );
    }

    #[test]
    fn test_maplink_and_delete() {
        let keyfs = KeyFs::with_backend(&MemoryBackend, &StorageConfig::default()).unwrap();
        let store = store();
        let link = link(&format!("https://files.example/six-1.0.tar.gz#sha256={HASH}"));

        let mut tx = keyfs.begin_write().unwrap();
        let entry = store.maplink(&mut tx, &link, "six").unwrap();
        assert_eq!(entry.version(), Some("1.0"));
        assert!(!entry.file_exists(&tx).unwrap());
        entry.file_set(&mut tx, b"content").unwrap();
        tx.commit().unwrap();

        let rtx = keyfs.read_transaction().unwrap();
        let href = format!("{}#sha256={HASH}", entry.relpath());
        let found = store.entry_from_href(&rtx, &href).unwrap().unwrap();
        assert_eq!(found, entry);
        assert!(found.file_exists(&rtx).unwrap());
        drop(rtx);

        let mut tx = keyfs.begin_write().unwrap();
        assert!(found.file_delete(&mut tx).unwrap());
        assert!(store.get_file_entry(&tx, entry.relpath()).unwrap().is_some());
        found.delete(&mut tx).unwrap();
        assert!(store.get_file_entry(&tx, entry.relpath()).unwrap().is_none());
        tx.commit().unwrap();
    }
}
