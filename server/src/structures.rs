use std::sync::Arc;

use utils::blobs::BlobStore;
use utils::config::{FilesetConfig, RedirectCode};
use utils::errors::FilesetResult;
use utils::manifests::ManifestStore;
use utils::routetrie::RouteTrie;
use utils::tokens::TokenStore;

/// What a redirect rule resolves to: the status code and the destination
/// template (absent for no-redirect pins).
pub type RedirectTarget = (RedirectCode, Option<String>);

/// Everything a request handler needs: the immutable config plus the three
/// stores, with the redirect table pre-built into a trie.
#[derive(Debug)]
pub struct ServerState {
    pub config: FilesetConfig,
    pub blobs: BlobStore,
    pub manifests: ManifestStore,
    pub tokens: TokenStore,
    pub redirects: RouteTrie<RedirectTarget>,
}

impl ServerState {
    pub fn new(config: FilesetConfig) -> FilesetResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let blobs = BlobStore::new(config.data_dir.join("blobs"), config.bucket.clone())?;
        let manifests = ManifestStore::open(config.data_dir.join("manifests.json"))?;
        let tokens = TokenStore::open(config.data_dir.join("tokens.json"))?;
        Ok(Self::with_stores(config, blobs, manifests, tokens))
    }

    pub fn with_stores(
        config: FilesetConfig,
        blobs: BlobStore,
        manifests: ManifestStore,
        tokens: TokenStore,
    ) -> Self {
        let mut redirects = RouteTrie::new();
        for rule in &config.redirects {
            redirects.add(&rule.source, (rule.code, rule.dest.clone()));
        }
        ServerState {
            config,
            blobs,
            manifests,
            tokens,
            redirects,
        }
    }
}

pub type AppState = Arc<ServerState>;
pub type FilesetRouter = axum::Router<AppState, hyper::Body>;
