use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock as SyncRwLock;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::FilesetResult;

/// Metadata kept alongside an issued deploy token. The token itself is the
/// record key and never appears in the value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthToken {
    pub description: String,
    pub created_by: String,
    pub created: i64,
    pub last_used: Option<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenData {
    tokens: HashMap<String, AuthToken>,
}

/// Issues and validates opaque bearer tokens for the ingest API.
///
/// Validity is membership. A positive-only cache keeps the hot path cheap;
/// negatives are never cached and revocation purges the cache entry, so a
/// revoked token is refused immediately.
#[derive(Debug)]
pub struct TokenStore {
    path: Option<PathBuf>,
    inner: RwLock<TokenData>,
    valid_cache: SyncRwLock<HashSet<String>>,
}

impl TokenStore {
    pub fn in_memory() -> Self {
        TokenStore {
            path: None,
            inner: RwLock::new(TokenData::default()),
            valid_cache: SyncRwLock::new(HashSet::new()),
        }
    }

    pub fn open(path: PathBuf) -> FilesetResult<Self> {
        let data = if path.exists() {
            let raw = std::fs::read(&path)?;
            serde_json::from_slice(&raw)?
        } else {
            TokenData::default()
        };
        Ok(TokenStore {
            path: Some(path),
            inner: RwLock::new(data),
            valid_cache: SyncRwLock::new(HashSet::new()),
        })
    }

    /// Mint a 256-bit random token and return its hex form. Admin checks
    /// happen at the HTTP boundary; the store just records who asked.
    pub async fn create(
        &self,
        description: &str,
        created_by: &str,
        now: i64,
    ) -> FilesetResult<String> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let mut data = self.inner.write().await;
        data.tokens.insert(
            token.clone(),
            AuthToken {
                description: description.to_string(),
                created_by: created_by.to_string(),
                created: now,
                last_used: None,
            },
        );
        self.persist(&data)?;
        Ok(token)
    }

    /// Membership test. Touches `last_used` when the check goes to the
    /// backing store; cache hits skip the write.
    pub async fn is_valid(&self, token: &str, now: i64) -> bool {
        if let Ok(cache) = self.valid_cache.read() {
            if cache.contains(token) {
                return true;
            }
        }

        let mut data = self.inner.write().await;
        let Some(record) = data.tokens.get_mut(token) else {
            return false;
        };
        record.last_used = Some(now);
        // last_used is bookkeeping; losing it on a failed flush is fine.
        let _ = self.persist(&data);

        if let Ok(mut cache) = self.valid_cache.write() {
            cache.insert(token.to_string());
        }
        true
    }

    /// Delete a token and purge it from the validity cache.
    pub async fn revoke(&self, token: &str) -> FilesetResult<()> {
        let mut data = self.inner.write().await;
        data.tokens.remove(token);
        self.persist(&data)?;
        if let Ok(mut cache) = self.valid_cache.write() {
            cache.remove(token);
        }
        Ok(())
    }

    pub async fn get(&self, token: &str) -> Option<AuthToken> {
        self.inner.read().await.tokens.get(token).cloned()
    }

    fn persist(&self, data: &TokenData) -> FilesetResult<()> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_tokens_validate() {
        let store = TokenStore::in_memory();
        let token = store.create("ci deploys", "admin@corp.com", 100).await.unwrap();
        assert_eq!(token.len(), 64);
        assert!(store.is_valid(&token, 101).await);
        assert!(!store.is_valid("feedfacefeedface", 101).await);
    }

    #[tokio::test]
    async fn validation_records_last_used() {
        let store = TokenStore::in_memory();
        let token = store.create("ci", "admin@corp.com", 100).await.unwrap();
        assert!(store.is_valid(&token, 150).await);
        let record = store.get(&token).await.unwrap();
        assert_eq!(record.last_used, Some(150));
    }

    #[tokio::test]
    async fn revocation_is_immediate_even_after_a_cache_hit() {
        let store = TokenStore::in_memory();
        let token = store.create("ci", "admin@corp.com", 100).await.unwrap();
        // Warm the positive cache.
        assert!(store.is_valid(&token, 101).await);
        assert!(store.is_valid(&token, 102).await);

        store.revoke(&token).await.unwrap();
        assert!(!store.is_valid(&token, 103).await);
    }

    #[tokio::test]
    async fn tokens_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = TokenStore::open(path.clone()).unwrap();
        let token = store.create("ci", "admin@corp.com", 100).await.unwrap();
        drop(store);

        let reopened = TokenStore::open(path).unwrap();
        assert!(reopened.is_valid(&token, 101).await);
    }
}
