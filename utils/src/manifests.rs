use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::FilesetResult;

/// An immutable deploy snapshot: request paths mapped to blob digests,
/// plus whatever commit metadata the client sent along.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub id: u64,
    pub commit: serde_json::Value,
    pub paths: HashMap<String, String>,
    pub created: i64,
}

/// A scheduled branch-pointer update. Keyed by branch, so at most one can
/// be pending per branch; a newer schedule simply replaces the old one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimedDeploy {
    pub branch: String,
    pub manifest_id: u64,
    pub deploy_timestamp: i64,
    pub created: i64,
    pub deployed: Option<i64>,
}

/// What the cron reports after promoting a timed deploy.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Deployment {
    pub branch: String,
    pub manifest_id: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestData {
    next_id: u64,
    manifests: HashMap<u64, Manifest>,
    branches: HashMap<String, u64>,
    timed_deploys: HashMap<String, TimedDeploy>,
}

/// Persistence for manifests, branch pointers, and timed deploys.
///
/// State lives behind one RwLock and is flushed to a JSON file after every
/// mutation (tmp file + rename, so a crash can't leave a torn file). The
/// lock is held across promote's query+update loop, which is what makes
/// promotion at-most-once per record under concurrent cron runs.
#[derive(Debug)]
pub struct ManifestStore {
    path: Option<PathBuf>,
    inner: RwLock<ManifestData>,
}

impl ManifestStore {
    /// An ephemeral store, for tests and local experiments.
    pub fn in_memory() -> Self {
        ManifestStore {
            path: None,
            inner: RwLock::new(ManifestData::default()),
        }
    }

    /// Open (or create) a store persisted at `path`.
    pub fn open(path: PathBuf) -> FilesetResult<Self> {
        let data = if path.exists() {
            let raw = std::fs::read(&path)?;
            serde_json::from_slice(&raw)?
        } else {
            ManifestData::default()
        };
        Ok(ManifestStore {
            path: Some(path),
            inner: RwLock::new(data),
        })
    }

    /// Allocate the next manifest id and store an immutable manifest.
    pub async fn save(
        &self,
        commit: serde_json::Value,
        paths: HashMap<String, String>,
        now: i64,
    ) -> FilesetResult<u64> {
        let mut data = self.inner.write().await;
        data.next_id += 1;
        let id = data.next_id;
        data.manifests.insert(
            id,
            Manifest {
                id,
                commit,
                paths,
                created: now,
            },
        );
        self.persist(&data)?;
        Ok(id)
    }

    pub async fn get(&self, manifest_id: u64) -> Option<Manifest> {
        self.inner.read().await.manifests.get(&manifest_id).cloned()
    }

    /// Resolve a branch pointer and load its manifest.
    pub async fn get_branch_manifest(&self, branch: &str) -> Option<Manifest> {
        let data = self.inner.read().await;
        let manifest_id = data.branches.get(branch)?;
        data.manifests.get(manifest_id).cloned()
    }

    /// Point `branch` at `manifest_id`. A deploy timestamp in the future
    /// schedules the update instead, leaving the pointer untouched until
    /// the cron promotes it.
    pub async fn set_branch_manifest(
        &self,
        branch: &str,
        manifest_id: u64,
        deploy_timestamp: Option<i64>,
        now: i64,
    ) -> FilesetResult<()> {
        let mut data = self.inner.write().await;
        match deploy_timestamp {
            Some(timestamp) if timestamp > now => {
                data.timed_deploys.insert(
                    branch.to_string(),
                    TimedDeploy {
                        branch: branch.to_string(),
                        manifest_id,
                        deploy_timestamp: timestamp,
                        created: now,
                        deployed: None,
                    },
                );
                log::info!(
                    "saved timed deploy: branch={branch}, manifest={manifest_id}, deploy_timestamp={timestamp}"
                );
            }
            _ => {
                data.branches.insert(branch.to_string(), manifest_id);
                log::info!("saved branch manifest: branch={branch}, manifest={manifest_id}");
            }
        }
        self.persist(&data)
    }

    /// Promote every pending timed deploy whose time has come, oldest
    /// first. Each promoted record is marked deployed, so a second call
    /// (or a concurrent cron) finds nothing to do.
    pub async fn promote_due_deploys(&self, now: i64) -> FilesetResult<Vec<Deployment>> {
        let mut data = self.inner.write().await;

        let mut due: Vec<(String, i64)> = data
            .timed_deploys
            .values()
            .filter(|deploy| deploy.deployed.is_none() && deploy.deploy_timestamp < now + 1)
            .map(|deploy| (deploy.branch.clone(), deploy.deploy_timestamp))
            .collect();
        due.sort_by_key(|(_, timestamp)| *timestamp);

        let mut deployments = Vec::with_capacity(due.len());
        for (branch, _) in due {
            let Some(deploy) = data.timed_deploys.get_mut(&branch) else {
                continue;
            };
            deploy.deployed = Some(now);
            let manifest_id = deploy.manifest_id;
            data.branches.insert(branch.clone(), manifest_id);
            log::info!("saved branch manifest: branch={branch}, manifest={manifest_id}");
            deployments.push(Deployment {
                branch,
                manifest_id,
            });
        }

        if !deployments.is_empty() {
            self.persist(&data)?;
        }
        Ok(deployments)
    }

    fn persist(&self, data: &ManifestData) -> FilesetResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = serde_json::to_vec(data)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
