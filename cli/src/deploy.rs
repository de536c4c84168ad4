use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, NaiveDateTime};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;

use fileset_client::{FilesetApiClient, ManifestFile};
use utils::blobs::sha1_hex;
use utils::time::unix_now;

use crate::cache::UploadCache;

/// How many blobs upload at once.
const UPLOAD_WORKERS: usize = 20;
/// Per-blob attempts before the deploy fails.
const UPLOAD_ATTEMPTS: u32 = 3;

const CACHE_PATH: &str = ".fileset-cache.json";

#[derive(Debug)]
pub struct DeployOptions {
    pub dir: PathBuf,
    pub server: String,
    pub branch: Option<String>,
    pub config_path: PathBuf,
    pub dry_run: bool,
}

/// The client-side config, `.fileset.json`.
#[derive(Debug, Default, Deserialize)]
pub struct DeployConfig {
    pub token: Option<String>,
    /// Env var consulted for a scheduled deploy time (YYYY-MM-DD HH:MM).
    pub timed_deploy_env: Option<String>,
    /// Fixed UTC offset the deploy time is written in, e.g. "-08:00".
    pub timed_deploy_utc_offset: Option<String>,
}

impl DeployConfig {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(DeployConfig::default());
        }
        let raw = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

/// One rendered file, ready to upload.
#[derive(Debug)]
pub struct SiteFile {
    pub path: String,
    pub sha: String,
    pub bytes: Vec<u8>,
}

pub async fn run(opts: DeployOptions) -> Result<()> {
    let config = DeployConfig::load(&opts.config_path)?;

    let token = config
        .token
        .clone()
        .or_else(|| std::env::var("FILESET_TOKEN").ok())
        .unwrap_or_default();
    if token.is_empty() && !is_localhost(&opts.server) {
        // Localhost servers skip auth; everything else needs a token.
        bail!("\"token\" is required in {}", opts.config_path.display());
    }

    let branch = resolve_branch(&opts);
    let commit = commit_from_env();
    let deploy_timestamp = timed_deploy_timestamp(&config, unix_now())?;

    let files = scan_site(&opts.dir)?;
    if files.is_empty() {
        bail!("no files found under {}", opts.dir.display());
    }
    log::info!(
        "deploying {} files to {} (branch: {branch})",
        files.len(),
        opts.server
    );

    if opts.dry_run {
        for file in &files {
            log::info!("would upload {} {}", file.sha, file.path);
        }
        return Ok(());
    }

    let client = FilesetApiClient::new(&opts.server, &token);
    let cache = Arc::new(Mutex::new(UploadCache::load(PathBuf::from(CACHE_PATH))?));

    if let Err(e) = upload_all(&client, &cache, &files).await {
        // Keep the already-uploaded record so the next attempt doesn't
        // start from zero.
        if let Err(save_err) = cache.lock().await.save() {
            log::warn!("failed to save upload cache: {save_err}");
        }
        return Err(e);
    }

    let manifest_files: Vec<ManifestFile> = files
        .iter()
        .map(|file| ManifestFile {
            sha: file.sha.clone(),
            path: file.path.clone(),
        })
        .collect();
    let manifest_id = client.upload_manifest(&commit, &manifest_files).await?;
    client
        .set_branch_manifest(&branch, manifest_id, deploy_timestamp)
        .await?;
    cache.lock().await.save()?;

    let mut lines = vec![
        String::new(),
        "saved branch manifest:".to_string(),
        format!("  branch: {branch}"),
        format!("  manifest id: {manifest_id}"),
    ];
    if let Some(timestamp) = deploy_timestamp {
        lines.push(format!("  timed deploy at: {timestamp}"));
    }
    lines.push(String::new());
    lines.push("url:".to_string());
    if is_localhost(&opts.server) {
        lines.push(format!("  http://{}", opts.server));
    } else if deploy_timestamp.is_some() {
        lines.push(format!("  https://manifest-{manifest_id}-dot-{}", opts.server));
    } else if branch == "master" {
        lines.push(format!("  https://{}", opts.server));
    } else {
        lines.push(format!("  https://{branch}-dot-{}", opts.server));
    }
    log::info!("{}", lines.join("\n"));
    Ok(())
}

async fn upload_all(
    client: &FilesetApiClient,
    cache: &Arc<Mutex<UploadCache>>,
    files: &[SiteFile],
) -> Result<()> {
    let results: Vec<Result<()>> = stream::iter(files)
        .map(|file| {
            let client = client.clone();
            let cache = cache.clone();
            async move { upload_one(&client, &cache, file).await }
        })
        .buffer_unordered(UPLOAD_WORKERS)
        .collect()
        .await;
    for result in results {
        result?;
    }
    Ok(())
}

async fn upload_one(
    client: &FilesetApiClient,
    cache: &Arc<Mutex<UploadCache>>,
    file: &SiteFile,
) -> Result<()> {
    let key = UploadCache::key(client.host(), &file.sha);
    if cache.lock().await.contains(&key) {
        return Ok(());
    }
    if !client.blob_exists(&file.sha).await? {
        log::info!("uploading blob {} {}", file.sha, file.path);
        let filename = file.path.rsplit('/').next().unwrap_or("blob").to_string();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match client
                .upload_blob(&file.sha, &filename, file.bytes.clone())
                .await
            {
                Ok(()) => break,
                Err(e) if attempt < UPLOAD_ATTEMPTS => {
                    log::warn!(
                        "upload failed (attempt {attempt}/{UPLOAD_ATTEMPTS}): {} {e}",
                        file.path
                    );
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("uploading {}", file.path));
                }
            }
        }
    }
    cache.lock().await.add(key);
    Ok(())
}

/// Walk the rendered site, producing `(path, sha, bytes)` triples. Request
/// paths always use forward slashes and start at the site root. Dotfiles
/// are skipped.
pub fn scan_site(root: &Path) -> Result<Vec<SiteFile>> {
    let mut files = Vec::new();
    collect(root, root, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<SiteFile>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .context("walked outside the site root")?;
            let request_path = format!(
                "/{}",
                rel.components()
                    .map(|part| part.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            );
            let bytes = std::fs::read(&path)?;
            let sha = sha1_hex(&bytes);
            out.push(SiteFile {
                path: request_path,
                sha,
                bytes,
            });
        }
    }
    Ok(())
}

fn resolve_branch(opts: &DeployOptions) -> String {
    if let Some(branch) = &opts.branch {
        return branch.clone();
    }
    // Localhost deploys always land on master.
    if is_localhost(&opts.server) {
        return "master".to_string();
    }
    for var in ["FILESET_BRANCH_NAME", "BRANCH_NAME", "CI_COMMIT_REF_NAME"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return infer_branch(&value);
            }
        }
    }
    "master".to_string()
}

/// Normalize a git branch name into a fileset branch: feature/ prefixes
/// drop, slashes become dashes, everything lowercases.
pub fn infer_branch(name: &str) -> String {
    let name = name.strip_prefix("feature/").unwrap_or(name);
    name.replace('/', "-").to_lowercase()
}

fn commit_from_env() -> serde_json::Value {
    let mut sha = String::new();
    for var in ["FILESET_COMMIT_SHA", "COMMIT_SHA", "CI_COMMIT_SHA"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                sha = value;
                break;
            }
        }
    }
    let message = std::env::var("FILESET_COMMIT_MESSAGE").unwrap_or_default();
    serde_json::json!({ "sha": sha, "message": message })
}

/// A deploy timestamp from the configured env var, if one is set and still
/// in the future. Past times mean "deploy now" and yield None.
fn timed_deploy_timestamp(config: &DeployConfig, now: i64) -> Result<Option<i64>> {
    let env_name = config
        .timed_deploy_env
        .as_deref()
        .unwrap_or("FILESET_TIMED_DEPLOY");
    let Ok(value) = std::env::var(env_name) else {
        return Ok(None);
    };
    if value.is_empty() {
        return Ok(None);
    }
    let offset = parse_utc_offset(
        config
            .timed_deploy_utc_offset
            .as_deref()
            .unwrap_or("+00:00"),
    )?;
    let timestamp = parse_deploy_datetime(&value, offset)?;
    if timestamp <= now {
        return Ok(None);
    }
    Ok(Some(timestamp))
}

fn parse_deploy_datetime(value: &str, offset: FixedOffset) -> Result<i64> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M")
        .with_context(|| format!("expected YYYY-MM-DD HH:MM, got {value:?}"))?;
    let localized = naive
        .and_local_timezone(offset)
        .single()
        .context("deploy time is not representable in the configured offset")?;
    Ok(localized.timestamp())
}

fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let (sign, rest) = match raw.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().context("bad utc offset hours")?;
    let minutes: i32 = minutes.parse().context("bad utc offset minutes")?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .context("utc offset out of range")
}

fn is_localhost(server: &str) -> bool {
    let host = server
        .strip_prefix("http://")
        .or_else(|| server.strip_prefix("https://"))
        .unwrap_or(server);
    host.starts_with("localhost") || host.starts_with("127.0.0.1")
}
