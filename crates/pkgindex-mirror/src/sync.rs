//! Upstream synchronization of a mirror stage
//!
//! `get_links` serves cached links while they are fresh and otherwise asks
//! upstream within the request timeout. A fetch that outlives the timeout
//! keeps running detached; on the primary its result is written by a
//! background task once it arrives. Replicas never write mirror data, they
//! ask the primary and wait for the serial it reports.

use crate::error::{MirrorError, MirrorResult};
use crate::http::{H_DEVPI_SERIAL, H_PYPI_LAST_SERIAL, H_REPLICA_UUID, UpstreamRequest};
use crate::links::{Link, parse_index, parse_project_list};
use crate::stage::{
    CachedLinks, MirrorStage, SimpleLink, SimpleLinksRecord, project_name, same_links,
};
use pkgindex_common::Serial;
use pkgindex_keyfs::{KeyRead, Value, WriteTx};
use reqwest::Url;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Release links of one project as returned by upstream
#[derive(Clone, Debug)]
pub struct FetchedLinks {
    /// Upstream serial of the page, `None` if missing or invalid
    pub serial: Option<u64>,
    pub releaselinks: Vec<Link>,
    /// The links as they would be stored
    pub record: SimpleLinksRecord,
    /// Keyfs serial reported by a primary
    pub devpi_serial: Option<Serial>,
}

impl FetchedLinks {
    #[must_use]
    pub fn simple_links(&self) -> Vec<SimpleLink> {
        self.record.simple_links()
    }
}

fn parse_serial(value: Option<&str>) -> Option<u64> {
    value.and_then(|value| value.trim().parse().ok())
}

impl MirrorStage {
    /// Base URL of the simple pages, always ending in `/`.
    ///
    /// A replica asks the primary's view of this stage.
    #[must_use]
    pub fn mirror_url(&self) -> String {
        let mut url = match (&self.inner.primary_url, self.is_replica()) {
            (Some(primary), true) => format!(
                "{}/{}/+simple/",
                primary.trim_end_matches('/'),
                self.inner.stage
            ),
            _ => self.inner.config.mirror_url.clone(),
        };
        if !url.ends_with('/') {
            url.push('/');
        }
        url
    }

    fn request(&self, url: &str, timeout: Duration) -> UpstreamRequest {
        let request = UpstreamRequest::get(url, timeout);
        match &self.inner.replica_uuid {
            Some(uuid) if self.is_replica() => request.header(H_REPLICA_UUID, uuid.as_str()),
            _ => request,
        }
    }

    /// Fetch the release links of `project` from upstream.
    ///
    /// Fails with [`MirrorError::SerialRegression`] when upstream answers
    /// with an older serial than `cache_serial`.
    pub async fn fetch_release_links(
        &self,
        project: &str,
        cache_serial: Option<u64>,
    ) -> MirrorResult<FetchedLinks> {
        let url = format!("{}{}/", self.mirror_url(), project);
        debug!("reading index {:?}", url);
        let response = self
            .inner
            .client
            .get(self.request(&url, self.timeout()))
            .await?;
        if response.status != 200 {
            if response.status == 404 {
                // remember the miss so repeated lookups stay local
                self.inner.caches.retrieve_times.refresh(project);
                return Err(MirrorError::UpstreamNotFound(format!(
                    "not found on GET {url:?}"
                )));
            }
            return Err(MirrorError::Upstream(format!(
                "{} status on GET {:?}",
                response.status, url
            )));
        }

        let serial = parse_serial(response.header(H_PYPI_LAST_SERIAL));
        if let Some(cached) = cache_serial {
            if serial < Some(cached) {
                return Err(MirrorError::SerialRegression {
                    url,
                    cached,
                    returned: serial,
                });
            }
        }
        debug!("{}: got response with serial {:?}", project, serial);

        let mut base = Url::parse(&response.url)
            .or_else(|_| Url::parse(&url))
            .map_err(|e| MirrorError::Upstream(format!("invalid url {url:?}: {e}")))?;
        // credentials of the mirror url must not end up in stored links
        let _ = base.set_username("");
        let _ = base.set_password(None);
        let releaselinks = parse_index(&base, &response.text, project);

        let mut record = SimpleLinksRecord {
            serial,
            ..SimpleLinksRecord::default()
        };
        for link in &releaselinks {
            let key = self.inner.filestore.key_from_link(link);
            let href = match &link.hash_spec {
                Some(hash_spec) => format!("{}#{}", key.relpath, hash_spec),
                None => key.relpath,
            };
            record.links.push((link.basename.clone(), href));
            record.requires_python.push(link.requires_python.clone());
            record.yanked.push(link.yanked.clone());
        }

        Ok(FetchedLinks {
            serial,
            releaselinks,
            record,
            devpi_serial: parse_serial(response.header(H_DEVPI_SERIAL)),
        })
    }

    /// Release links of `project`, refreshed from upstream when expired
    pub async fn get_links(&self, project: &str) -> MirrorResult<Vec<SimpleLink>> {
        let project = project_name(project)?;
        let CachedLinks {
            is_expired,
            links,
            serial,
        } = self.load_cache_links(&project)?;

        if self.inner.config.offline {
            let Some(links) = links else {
                return Err(MirrorError::Offline(format!(
                    "no cached links for {project:?}"
                )));
            };
            self.note_offline_use(&project);
            return Ok(links);
        }
        if let Some(links) = links.as_ref().filter(|_| !is_expired) {
            return Ok(links.clone());
        }
        let retrieve_times = &self.inner.caches.retrieve_times;
        if links.is_none() && !retrieve_times.is_expired(&project, self.cache_expiry()) {
            return Err(MirrorError::UpstreamNotFound(format!(
                "cached not found for project {project:?}"
            )));
        }

        let mut fetch = {
            let stage = self.clone();
            let project = project.clone();
            tokio::spawn(async move { stage.fetch_release_links(&project, serial).await })
        };
        let timeout = self.timeout();
        let outcome = tokio::time::timeout(timeout, &mut fetch).await;
        let fetched = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(MirrorError::Upstream(format!(
                "fetching {project:?} failed: {join}"
            ))),
            Err(_) => {
                if !self.is_replica() {
                    self.spawn_background_update(project.clone(), fetch);
                }
                retrieve_times.refresh(&project);
                if let Some(links) = links {
                    warn!(
                        "serving stale links for {:?}, getting data timed out after {:?}",
                        project, timeout
                    );
                    return Ok(links);
                }
                return Err(MirrorError::Upstream(format!(
                    "timeout after {timeout:?} while getting data for {project:?}"
                )));
            }
        };

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) if e.is_upstream_error() || matches!(e, MirrorError::UpstreamNotFound(_)) => {
                if let Some(links) = links {
                    warn!("serving stale links for {:?}, because of: {}", project, e);
                    return Ok(links);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let newlinks = fetched.simple_links();
        if let Some(links) = links {
            if same_links(&links, &newlinks) {
                retrieve_times.refresh(&project);
                return Ok(links);
            }
        }
        self.update_simplelinks(&project, &fetched, newlinks).await
    }

    async fn update_simplelinks(
        &self,
        project: &str,
        fetched: &FetchedLinks,
        newlinks: Vec<SimpleLink>,
    ) -> MirrorResult<Vec<SimpleLink>> {
        if !self.is_replica() {
            self.store_links_blocking(project.to_string(), fetched.clone()).await?;
            return Ok(newlinks);
        }

        let Some(devpi_serial) = fetched.devpi_serial else {
            return Err(MirrorError::Upstream(format!(
                "primary sent no serial for {project:?}"
            )));
        };
        debug!("get_links: waiting for devpi serial {}", devpi_serial);
        if self
            .inner
            .replication
            .wait_for_serial(devpi_serial, self.timeout())
            .await
        {
            debug!("get_links: finished waiting for devpi serial {}", devpi_serial);
            if let Some(links) = self.load_cache_links(project)?.links {
                self.inner.caches.retrieve_times.refresh(project);
                return Ok(links);
            }
        }
        Err(MirrorError::Upstream(format!(
            "no cache links from primary for {project:?}"
        )))
    }

    /// Write fetched links unless the stored ones are equal.
    /// Returns whether anything was written.
    fn store_links(&self, project: &str, fetched: &FetchedLinks) -> MirrorResult<bool> {
        let (changed, _) = self.inner.keyfs.write(|tx| -> MirrorResult<bool> {
            let caches = Arc::clone(&self.inner.caches);
            let name = project.to_string();
            tx.on_commit_success(move || {
                debug!("setting projects cache for {:?}", name);
                caches.retrieve_times.refresh(&name);
                caches.project_names.add(&name);
            });
            if let Some(current) = self.load_record(&*tx, project)? {
                if same_links(&current.simple_links(), &fetched.simple_links()) {
                    return Ok(false);
                }
            }
            for link in &fetched.releaselinks {
                self.inner.filestore.maplink(tx, link, project)?;
            }
            self.save_cache_links(tx, project, &fetched.record)
        })?;
        Ok(changed)
    }

    /// Run [`Self::store_links`] on the blocking pool.
    ///
    /// A write waits for the admission of the store, which may take up to
    /// the admission timeout, so it stays off the async workers.
    async fn store_links_blocking(
        &self,
        project: String,
        fetched: FetchedLinks,
    ) -> MirrorResult<bool> {
        let stage = self.clone();
        tokio::task::spawn_blocking(move || stage.store_links(&project, &fetched)).await?
    }

    fn save_cache_links(
        &self,
        tx: &mut WriteTx<'_>,
        project: &str,
        record: &SimpleLinksRecord,
    ) -> MirrorResult<bool> {
        let key = self.key_projsimplelinks(project);
        let value = serde_json::to_value(record)?;
        if tx.get(&key)?.as_deref() == Some(&value) {
            return Ok(false);
        }
        debug!("saving changed simplelinks for {:?}", project);
        tx.set(&key, value)?;
        self.add_project_name(tx, project)?;
        Ok(true)
    }

    fn spawn_background_update(
        &self,
        project: String,
        fetch: JoinHandle<MirrorResult<FetchedLinks>>,
    ) {
        let stage = self.clone();
        tokio::spawn(async move {
            debug!("awaiting simple links for {:?}", project);
            let fetched = match fetch.await {
                Ok(Ok(fetched)) => fetched,
                Ok(Err(e)) => {
                    warn!("background fetch of {:?} failed: {}", project, e);
                    return;
                }
                Err(e) => {
                    warn!("background fetch of {:?} aborted: {}", project, e);
                    return;
                }
            };
            let Ok(_permit) = Arc::clone(&stage.inner.background).acquire_owned().await else {
                return;
            };
            match stage.store_links_blocking(project.clone(), fetched).await {
                Ok(true) => info!("updated simplelinks for {:?} in background", project),
                Ok(false) => debug!("unchanged simplelinks for {:?}", project),
                Err(e) => error!("background update of {:?} failed: {}", project, e),
            }
        });
    }

    /// Project names known upstream, served from memory while fresh.
    ///
    /// Falls back to the names cached in keyfs when upstream fails or the
    /// stage is offline.
    pub async fn list_projects(&self) -> MirrorResult<Arc<BTreeSet<String>>> {
        if self.inner.config.offline {
            return Ok(Arc::new(self.cached_project_names()?));
        }
        let names = &self.inner.caches.project_names;
        if !names.is_expired(self.cache_expiry()) {
            return Ok(names.get());
        }
        let fetched = match self.fetch_remote_projects().await {
            Ok(fetched) => fetched,
            Err(e) if e.is_upstream_error() => {
                warn!("listing projects of {} failed, using cached names: {}", self.inner.stage, e);
                return Ok(Arc::new(self.cached_project_names()?));
            }
            Err(e) => return Err(e),
        };
        if !names.exists() || *names.get() != fetched {
            names.set(fetched);
            if !self.is_replica() {
                self.mark_names_initialized()?;
            }
        } else {
            names.mark_current();
        }
        Ok(names.get())
    }

    async fn fetch_remote_projects(&self) -> MirrorResult<BTreeSet<String>> {
        let floor = Duration::from_secs(if self.is_replica() { 60 } else { 30 });
        let timeout = self.timeout().max(floor);
        let url = self.mirror_url();
        let request = self.request(&url, timeout).header("Accept", "text/html");
        let response = tokio::time::timeout(timeout, self.inner.client.get(request))
            .await
            .map_err(|_| {
                MirrorError::Upstream(format!("timeout after {timeout:?} on GET {url:?}"))
            })??;
        if response.status != 200 {
            return Err(MirrorError::Upstream(format!(
                "URL {:?} returned {}",
                url, response.status
            )));
        }
        let base = Url::parse(&response.url)
            .or_else(|_| Url::parse(&url))
            .map_err(|e| MirrorError::Upstream(format!("invalid url {url:?}: {e}")))?;
        Ok(parse_project_list(&base, &response.text))
    }

    fn mark_names_initialized(&self) -> MirrorResult<()> {
        if self.names_initialized()? {
            return Ok(());
        }
        let key = self.key_names_init();
        self.inner.keyfs.write(|tx| -> MirrorResult<()> {
            let current = tx.get(&key)?;
            if current.as_deref().and_then(Value::as_u64).unwrap_or(0) == 0 {
                tx.set(&key, json!(1))?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial() {
        assert_eq!(parse_serial(Some("42")), Some(42));
        assert_eq!(parse_serial(Some(" 7 ")), Some(7));
        assert_eq!(parse_serial(Some("-1")), None);
        assert_eq!(parse_serial(Some("abc")), None);
        assert_eq!(parse_serial(None), None);
    }
}
