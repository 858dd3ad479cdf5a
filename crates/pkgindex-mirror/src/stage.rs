//! Mirror stage
//!
//! A [`MirrorStage`] serves the release links of an upstream index through
//! keyfs. Freshness is tracked in memory by [`MirrorCaches`]; the links
//! themselves are persisted per project as a [`SimpleLinksRecord`].
//! Fetching and storing fresh links lives in [`crate::sync`].

use crate::caches::MirrorCaches;
use crate::error::{MirrorError, MirrorResult};
use crate::filestore::{FileEntry, FileStore};
use crate::http::UpstreamClient;
use crate::keys::{MIRRORNAMESINIT, PROJNAMES, PROJSIMPLELINKS};
use crate::links::split_basename;
use crate::replication::ReplicationChannel;
use parking_lot::Mutex;
use pkgindex_common::config::{Config, MirrorConfig, NodeRole};
use pkgindex_common::{ProjectName, Serial, StageName};
use pkgindex_keyfs::{ChangelogEntry, KeyFs, KeyRead, TypedKey, Value, WriteTx};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Persisted simple links of one project.
///
/// `serial` is the upstream serial the links were fetched at, `None` when
/// upstream did not send one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleLinksRecord {
    pub serial: Option<u64>,
    pub links: Vec<(String, String)>,
    #[serde(default)]
    pub requires_python: Vec<Option<String>>,
    #[serde(default)]
    pub yanked: Vec<Option<String>>,
}

impl SimpleLinksRecord {
    /// Decode a stored value; a cleared (`{}`) record counts as absent
    pub fn from_value(value: &Value) -> MirrorResult<Option<Self>> {
        if value.as_object().is_some_and(serde_json::Map::is_empty) {
            return Ok(None);
        }
        Ok(Some(Self::deserialize(value)?))
    }

    /// Links joined with their metadata
    #[must_use]
    pub fn simple_links(&self) -> Vec<SimpleLink> {
        self.links
            .iter()
            .enumerate()
            .map(|(i, (basename, href))| SimpleLink {
                basename: basename.clone(),
                href: href.clone(),
                requires_python: self.requires_python.get(i).cloned().flatten(),
                yanked: self.yanked.get(i).cloned().flatten(),
            })
            .collect()
    }
}

/// One release link as served by the stage
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimpleLink {
    pub basename: String,
    /// Local relpath with the upstream hash fragment, if any
    pub href: String,
    pub requires_python: Option<String>,
    pub yanked: Option<String>,
}

impl SimpleLink {
    /// Relpath of the file entry
    #[must_use]
    pub fn entrypath(&self) -> &str {
        self.href.split_once('#').map_or(&self.href, |(path, _)| path)
    }

    #[must_use]
    pub fn version(&self) -> Option<String> {
        split_basename(&self.basename).map(|parts| parts.version)
    }
}

/// Compare link sets ignoring order
#[must_use]
pub fn same_links(a: &[SimpleLink], b: &[SimpleLink]) -> bool {
    a.iter().collect::<HashSet<_>>() == b.iter().collect::<HashSet<_>>()
}

/// Metadata of one version, derived from its links
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VersionMetadata {
    pub name: String,
    pub version: String,
    pub requires_python: Option<String>,
    pub yanked: Option<String>,
    /// Entry paths of the release files
    pub elinks: Vec<String>,
}

/// Cached state of one project
#[derive(Clone, Debug, Default)]
pub(crate) struct CachedLinks {
    pub is_expired: bool,
    pub links: Option<Vec<SimpleLink>>,
    pub serial: Option<u64>,
}

pub(crate) struct StageInner {
    pub(crate) keyfs: Arc<KeyFs>,
    pub(crate) client: Arc<dyn UpstreamClient>,
    pub(crate) replication: Arc<dyn ReplicationChannel>,
    pub(crate) caches: Arc<MirrorCaches>,
    pub(crate) filestore: FileStore,
    pub(crate) stage: StageName,
    pub(crate) config: MirrorConfig,
    pub(crate) primary_url: Option<String>,
    pub(crate) replica_uuid: Option<String>,
    pub(crate) background: Arc<Semaphore>,
    offline_logged: Mutex<HashSet<String>>,
}

/// Mirror of one upstream index
#[derive(Clone)]
pub struct MirrorStage {
    pub(crate) inner: Arc<StageInner>,
}

pub(crate) fn project_name(project: &str) -> MirrorResult<String> {
    Ok(ProjectName::new(project)?.as_str().to_string())
}

impl MirrorStage {
    /// Create the stage configured in `config.mirror`
    pub fn new(
        keyfs: Arc<KeyFs>,
        config: &Config,
        client: Arc<dyn UpstreamClient>,
        replication: Arc<dyn ReplicationChannel>,
        caches: Arc<MirrorCaches>,
    ) -> Self {
        let stage = StageName::new(config.mirror.user.as_str(), config.mirror.index.as_str());
        let primary_url = match &config.node.role {
            NodeRole::Replica { primary_url } => Some(primary_url.clone()),
            NodeRole::Primary => None,
        };
        if replication.is_replica() {
            register_replica_listener(&keyfs, &stage, Arc::clone(&caches));
        }
        Self {
            inner: Arc::new(StageInner {
                keyfs,
                client,
                replication,
                caches,
                filestore: FileStore::new(stage.clone()),
                stage,
                config: config.mirror.clone(),
                primary_url,
                replica_uuid: config.node.replica_uuid.clone(),
                background: Arc::new(Semaphore::new(config.mirror.max_background_refreshes.max(1))),
                offline_logged: Mutex::new(HashSet::new()),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &StageName {
        &self.inner.stage
    }

    #[must_use]
    pub fn keyfs(&self) -> &Arc<KeyFs> {
        &self.inner.keyfs
    }

    #[must_use]
    pub fn caches(&self) -> &Arc<MirrorCaches> {
        &self.inner.caches
    }

    #[must_use]
    pub fn filestore(&self) -> &FileStore {
        &self.inner.filestore
    }

    #[must_use]
    pub fn is_replica(&self) -> bool {
        self.inner.replication.is_replica()
    }

    pub(crate) fn cache_expiry(&self) -> Duration {
        self.inner.config.cache_expiry()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.inner.config.request_timeout()
    }

    fn stage_params(&self) -> [(&str, &str); 2] {
        [
            ("user", self.inner.stage.user.as_str()),
            ("index", self.inner.stage.index.as_str()),
        ]
    }

    pub(crate) fn key_projsimplelinks(&self, project: &str) -> TypedKey {
        let [user, index] = self.stage_params();
        PROJSIMPLELINKS.key(&[user, index, ("project", project)])
    }

    pub(crate) fn key_projects(&self) -> TypedKey {
        PROJNAMES.key(&self.stage_params())
    }

    pub(crate) fn key_names_init(&self) -> TypedKey {
        MIRRORNAMESINIT.key(&self.stage_params())
    }

    pub(crate) fn load_record(
        &self,
        tx: &impl KeyRead,
        project: &str,
    ) -> MirrorResult<Option<SimpleLinksRecord>> {
        match tx.get(&self.key_projsimplelinks(project))? {
            Some(value) => SimpleLinksRecord::from_value(&value),
            None => Ok(None),
        }
    }

    pub(crate) fn load_cache_links_in(
        &self,
        tx: &impl KeyRead,
        project: &str,
    ) -> MirrorResult<CachedLinks> {
        let Some(record) = self.load_record(tx, project)? else {
            return Ok(CachedLinks {
                is_expired: true,
                ..CachedLinks::default()
            });
        };
        let mut links = record.simple_links();
        if self.inner.config.offline {
            let mut cached = Vec::with_capacity(links.len());
            for link in links {
                if self.is_file_cached(tx, &link)? {
                    cached.push(link);
                }
            }
            links = cached;
        }
        Ok(CachedLinks {
            is_expired: self
                .inner
                .caches
                .retrieve_times
                .is_expired(project, self.cache_expiry()),
            links: Some(links),
            serial: record.serial,
        })
    }

    pub(crate) fn load_cache_links(&self, project: &str) -> MirrorResult<CachedLinks> {
        let rtx = self.inner.keyfs.read_transaction()?;
        self.load_cache_links_in(&rtx, project)
    }

    fn is_file_cached(&self, tx: &impl KeyRead, link: &SimpleLink) -> MirrorResult<bool> {
        match self.inner.filestore.entry_from_href(tx, &link.href)? {
            Some(entry) => entry.file_exists(tx),
            None => Ok(false),
        }
    }

    /// Log stale offline use once per project
    pub(crate) fn note_offline_use(&self, project: &str) {
        if self.inner.offline_logged.lock().insert(project.to_string()) {
            debug!("using stale links for {:?} due to offline mode", project);
        }
    }

    /// Check if a non-empty links record is stored for `project`
    pub fn is_project_cached(&self, project: &str) -> MirrorResult<bool> {
        let project = project_name(project)?;
        let rtx = self.inner.keyfs.read_transaction()?;
        Ok(self.load_record(&rtx, &project)?.is_some())
    }

    pub(crate) fn project_names_in(&self, tx: &impl KeyRead) -> MirrorResult<BTreeSet<String>> {
        Ok(tx.get_as(&self.key_projects())?.unwrap_or_default())
    }

    /// Names of the projects cached on this stage
    pub fn cached_project_names(&self) -> MirrorResult<BTreeSet<String>> {
        let rtx = self.inner.keyfs.read_transaction()?;
        self.project_names_in(&rtx)
    }

    pub(crate) fn add_project_name(&self, tx: &mut WriteTx<'_>, project: &str) -> MirrorResult<()> {
        let mut names = self.project_names_in(&*tx)?;
        if names.insert(project.to_string()) {
            tx.set_as(&self.key_projects(), &names)?;
        }
        Ok(())
    }

    fn remove_project_name(&self, tx: &mut WriteTx<'_>, project: &str) -> MirrorResult<bool> {
        let mut names = self.project_names_in(&*tx)?;
        let removed = names.remove(project);
        if removed {
            tx.set_as(&self.key_projects(), &names)?;
        }
        Ok(removed)
    }

    /// Check if the project exists, asking upstream when it is not cached
    pub async fn has_project(&self, project: &str) -> MirrorResult<bool> {
        if self.is_project_cached(project)? {
            return Ok(true);
        }
        match self.get_links(project).await {
            Ok(_) => Ok(true),
            Err(MirrorError::UpstreamNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Versions found in the project's links
    pub async fn list_versions(&self, project: &str) -> MirrorResult<BTreeSet<String>> {
        match self.get_links(project).await {
            Ok(links) => Ok(links.iter().filter_map(SimpleLink::version).collect()),
            Err(MirrorError::UpstreamNotFound(_)) => Ok(BTreeSet::new()),
            Err(e) => Err(e),
        }
    }

    /// Metadata of `version`, `None` if no link carries that version
    pub async fn get_version_metadata(
        &self,
        project: &str,
        version: &str,
    ) -> MirrorResult<Option<VersionMetadata>> {
        let project = project_name(project)?;
        let links = match self.get_links(&project).await {
            Ok(links) => links,
            Err(MirrorError::UpstreamNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut metadata: Option<VersionMetadata> = None;
        for link in links
            .iter()
            .filter(|link| link.version().as_deref() == Some(version))
        {
            let entry = metadata.get_or_insert_with(|| VersionMetadata {
                name: project.clone(),
                version: version.to_string(),
                ..VersionMetadata::default()
            });
            if link.requires_python.is_some() {
                entry.requires_python.clone_from(&link.requires_python);
            }
            if link.yanked.is_some() {
                entry.yanked.clone_from(&link.yanked);
            }
            entry.elinks.push(link.entrypath().to_string());
        }
        Ok(metadata)
    }

    fn delete_project_in(&self, tx: &mut WriteTx<'_>, project: &str) -> MirrorResult<bool> {
        let Some(record) = self.load_record(&*tx, project)? else {
            return Ok(false);
        };
        for (_, href) in &record.links {
            if let Some(entry) = self.inner.filestore.entry_from_href(&*tx, href)? {
                if entry.file_exists(&*tx)? {
                    entry.delete(tx)?;
                }
            }
        }
        tx.delete(&self.key_projsimplelinks(project))?;
        self.remove_project_name(tx, project)?;
        Ok(true)
    }

    /// Remove the cached links of `project` and its downloaded files
    pub fn delete_project(&self, project: &str) -> MirrorResult<()> {
        let project = project_name(project)?;
        let (deleted, _) = self
            .inner
            .keyfs
            .write(|tx| self.delete_project_in(tx, &project))?;
        if !deleted {
            return Err(MirrorError::NotFound(format!(
                "project {:?} not found on stage {}",
                project, self.inner.stage
            )));
        }
        self.inner.caches.retrieve_times.expire(&project);
        info!("deleted project {:?} from {}", project, self.inner.stage);
        Ok(())
    }

    /// Remove the downloaded files of one version, keeping the links so
    /// the release can be fetched again. Returns the number of files.
    pub fn delete_version(&self, project: &str, version: &str) -> MirrorResult<usize> {
        let project = project_name(project)?;
        let (deleted, _) = self.inner.keyfs.write(|tx| -> MirrorResult<usize> {
            let Some(record) = self.load_record(&*tx, &project)? else {
                return Err(MirrorError::NotFound(format!(
                    "project {:?} not found on stage {}",
                    project, self.inner.stage
                )));
            };
            let mut deleted = 0;
            for link in record.simple_links() {
                if link.version().as_deref() != Some(version) {
                    continue;
                }
                if let Some(entry) = self.inner.filestore.entry_from_href(&*tx, &link.href)? {
                    if entry.file_exists(&*tx)? && entry.file_delete(tx)? {
                        deleted += 1;
                    }
                }
            }
            Ok(deleted)
        })?;
        Ok(deleted)
    }

    /// Entry of a release file of this stage
    pub fn get_file_entry(&self, relpath: &str) -> MirrorResult<Option<FileEntry>> {
        let rtx = self.inner.keyfs.read_transaction()?;
        self.inner.filestore.get_file_entry(&rtx, relpath)
    }

    /// Remove one downloaded file and its entry. The project leaves the
    /// cached name set once none of its files is stored anymore.
    pub fn delete_link_entry(&self, entry: &FileEntry) -> MirrorResult<()> {
        self.inner.keyfs.write(|tx| -> MirrorResult<()> {
            let Some(current) = self.inner.filestore.get_file_entry(&*tx, entry.relpath())? else {
                return Err(MirrorError::NotFound(format!("no entry {:?}", entry.relpath())));
            };
            if !current.file_exists(&*tx)? {
                return Err(MirrorError::NotFound(format!(
                    "entry has no file data {:?}",
                    entry.relpath()
                )));
            }
            current.delete(tx)?;
            let project = current.project();
            let mut still_cached = false;
            if let Some(record) = self.load_record(&*tx, project)? {
                for link in record.simple_links() {
                    if self.is_file_cached(&*tx, &link)? {
                        still_cached = true;
                        break;
                    }
                }
            }
            if !still_cached {
                self.remove_project_name(tx, project)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Delete every cached project and the name set of the stage
    pub fn delete_stage(&self) -> MirrorResult<BTreeSet<String>> {
        let (names, _) = self.inner.keyfs.write(|tx| -> MirrorResult<BTreeSet<String>> {
            let names = self.project_names_in(&*tx)?;
            for name in &names {
                self.delete_project_in(tx, name)?;
            }
            let key = self.key_projects();
            if tx.exists(&key)? {
                tx.delete(&key)?;
            }
            Ok(names)
        })?;
        for name in &names {
            self.inner.caches.retrieve_times.expire(name);
        }
        info!("deleted {} projects of stage {}", names.len(), self.inner.stage);
        Ok(names)
    }

    /// Forget the cached links of `project`.
    ///
    /// The record is overwritten with an empty one instead of being
    /// deleted so replicas observe the change.
    pub fn clear_simplelinks_cache(&self, project: &str) -> MirrorResult<()> {
        let project = project_name(project)?;
        self.inner.caches.retrieve_times.expire(&project);
        let key = self.key_projsimplelinks(&project);
        self.inner.keyfs.write(|tx| tx.set(&key, json!({})))?;
        debug!("cleared cache for {:?}", project);
        Ok(())
    }

    /// Keyfs serial of the last links write of `project` at or before
    /// `at_serial` (default: now), `None` if it was never written
    pub fn get_last_project_change_serial(
        &self,
        project: &str,
        at_serial: Option<Serial>,
    ) -> MirrorResult<Option<Serial>> {
        let project = project_name(project)?;
        let rtx = self.inner.keyfs.read_transaction()?;
        let Some(at_serial) = at_serial.or_else(|| rtx.at_serial()) else {
            return Ok(None);
        };
        Ok(rtx
            .last_serial_and_value_at(&self.key_projsimplelinks(&project), at_serial)?
            .map(|(serial, _)| serial))
    }

    /// Check whether the primary already recorded the first load of the
    /// upstream name list
    pub fn names_initialized(&self) -> MirrorResult<bool> {
        let rtx = self.inner.keyfs.read_transaction()?;
        let value = rtx.get(&self.key_names_init())?;
        Ok(value.as_deref().and_then(Value::as_u64).unwrap_or(0) != 0)
    }
}

/// On a replica, changes to simple links arrive through replication;
/// they count as a retrieval of that project.
fn register_replica_listener(keyfs: &KeyFs, stage: &StageName, caches: Arc<MirrorCaches>) {
    let prefix = format!("{stage}/+simple/");
    keyfs.add_change_listener(Arc::new(move |_serial: Serial, entry: &ChangelogEntry| {
        for (relpath, record) in &entry.changes {
            if record.keyname != PROJSIMPLELINKS.name {
                continue;
            }
            let Some(project) = relpath.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let cleared = record
                .value
                .as_deref()
                .is_none_or(|value| value.as_object().is_some_and(serde_json::Map::is_empty));
            if cleared {
                caches.retrieve_times.expire(project);
            } else {
                caches.retrieve_times.refresh(project);
                caches.project_names.add(project);
            }
        }
    }));
}
