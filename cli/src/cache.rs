use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;

/// A local record of blobs already uploaded, keyed
/// `<server>::blob::<sha>`, so repeat deploys skip the exists-probe for
/// unchanged files. Flushed to disk before any deploy error propagates,
/// so a failed run still keeps what it managed to upload.
#[derive(Debug)]
pub struct UploadCache {
    path: PathBuf,
    entries: BTreeMap<String, u64>,
}

impl UploadCache {
    pub fn load(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let raw = std::fs::read(&path)?;
            serde_json::from_slice(&raw)?
        } else {
            BTreeMap::new()
        };
        Ok(UploadCache { path, entries })
    }

    pub fn key(server: &str, sha: &str) -> String {
        format!("{server}::blob::{sha}")
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn add(&mut self, key: String) {
        self.entries.insert(key, 1);
    }

    pub fn save(&self) -> Result<()> {
        let raw = serde_json::to_vec_pretty(&self.entries)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}
