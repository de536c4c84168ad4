#![forbid(unsafe_code)]
#![deny(future_incompatible)]
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    trivial_casts,
    unused_qualifications
)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use utils::errors::{FilesetError, FilesetResult};

const TOKEN_HEADER: &str = "X-Fileset-Token";

/// One entry in a manifest upload: where a file is served from and which
/// blob backs it.
#[derive(Clone, Debug, Serialize)]
pub struct ManifestFile {
    pub sha: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct ManifestUploadResponse {
    manifest_id: u64,
}

#[derive(Debug, Deserialize)]
struct BlobExistsResponse {
    exists: bool,
}

/// A client for the fileset ingest API.
#[derive(Debug, Clone)]
pub struct FilesetApiClient {
    host: String,
    token: String,
}

impl FilesetApiClient {
    /// Create a client for a server host. Bare hosts get a scheme:
    /// localhost speaks plain http, everything else https.
    pub fn new(host: &str, token: &str) -> Self {
        FilesetApiClient {
            host: clean_host(host),
            token: token.to_string(),
        }
    }

    /// Ask whether the server already has a blob with this digest.
    pub async fn blob_exists(&self, sha: &str) -> FilesetResult<bool> {
        let url = format!("{}/_fs/api/blob.exists", self.host);
        let response = self
            .client()?
            .post(&url)
            .header(TOKEN_HEADER, &self.token)
            .json(&serde_json::json!({ "sha": sha }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(remote_error("blob.exists", response).await);
        }
        let body: BlobExistsResponse = response.json().await?;
        Ok(body.exists)
    }

    /// Upload one blob as multipart form data, declaring its digest in the
    /// query string. The server re-hashes and rejects mismatches.
    pub async fn upload_blob(
        &self,
        sha: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> FilesetResult<()> {
        let url = format!("{}/_fs/api/blob.upload?sha={sha}", self.host);
        let mime = mime_guess::from_path(filename).first_or_octet_stream();
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(filename.to_string())
            .mime_str(mime.essence_str())?;
        let form = reqwest::multipart::Form::new().part("blob", part);
        let response = self
            .client()?
            .post(&url)
            .header(TOKEN_HEADER, &self.token)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(remote_error("blob.upload", response).await);
        }
        Ok(())
    }

    /// Upload a manifest; returns the id the server assigned.
    pub async fn upload_manifest(
        &self,
        commit: &serde_json::Value,
        files: &[ManifestFile],
    ) -> FilesetResult<u64> {
        let url = format!("{}/_fs/api/manifest.upload", self.host);
        let response = self
            .client()?
            .post(&url)
            .header(TOKEN_HEADER, &self.token)
            .json(&serde_json::json!({ "commit": commit, "files": files }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(remote_error("manifest.upload", response).await);
        }
        let body: ManifestUploadResponse = response.json().await?;
        Ok(body.manifest_id)
    }

    /// Point a branch at a manifest, optionally scheduling the switch for
    /// a future time.
    pub async fn set_branch_manifest(
        &self,
        branch: &str,
        manifest_id: u64,
        deploy_timestamp: Option<i64>,
    ) -> FilesetResult<()> {
        let url = format!("{}/_fs/api/branch.set_manifest", self.host);
        let mut body = serde_json::json!({
            "branch": branch,
            "manifest_id": manifest_id,
        });
        if let Some(timestamp) = deploy_timestamp {
            body["deploy_timestamp"] = serde_json::json!(timestamp);
        }
        let response = self
            .client()?
            .post(&url)
            .header(TOKEN_HEADER, &self.token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(remote_error("branch.set_manifest", response).await);
        }
        Ok(())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn client(&self) -> FilesetResult<reqwest::Client> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(client)
    }
}

async fn remote_error(call: &str, response: reqwest::Response) -> FilesetError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    FilesetError::RemoteError(format!("{call} failed: {status}\n{body}"))
}

fn clean_host(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        return host.trim_end_matches('/').to_string();
    }
    let host = host.trim_end_matches('/');
    if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        format!("http://{host}")
    } else {
        format!("https://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_get_schemes() {
        assert_eq!(clean_host("localhost:8088"), "http://localhost:8088");
        assert_eq!(clean_host("myapp.appspot.com"), "https://myapp.appspot.com");
        assert_eq!(
            clean_host("https://myapp.appspot.com/"),
            "https://myapp.appspot.com"
        );
    }
}
