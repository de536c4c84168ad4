use crate::config::FilesetConfig;
use crate::errors::{FilesetError, FilesetResult};

pub const STAGING_SUFFIX: &str = "appspot.com";

/// Which flavor of deployment a request landed on. Dev is the local
/// server, staging is anything under the appspot suffix, prod is the rest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Env {
    Dev,
    Staging,
    Prod,
}

/// The domain portion of a host value, with any port stripped.
pub fn get_domain(host: &str) -> &str {
    match host.split_once(':') {
        Some((domain, _port)) => domain,
        None => host,
    }
}

pub fn get_env(config: &FilesetConfig, host: &str) -> Env {
    if config.dev {
        return Env::Dev;
    }
    if get_domain(host).ends_with(STAGING_SUFFIX) {
        Env::Staging
    } else {
        Env::Prod
    }
}

/// The branch a request should serve from, inferred from the host.
///
/// Staging hosts look like `<branch>-dot-<app_id>.appspot.com`; everything
/// else (dev and prod alike) reads from the default branch.
pub fn get_branch(config: &FilesetConfig, host: &str) -> String {
    if get_env(config, host) != Env::Staging {
        return config.default_branch.clone();
    }

    let domain = get_domain(host);
    let root_domain = format!("{}.{}", config.app_id, STAGING_SUFFIX);
    if domain.len() <= root_domain.len() {
        return config.default_branch.clone();
    }
    let version = &domain[..domain.len() - root_domain.len()];
    if version.is_empty() {
        return config.default_branch.clone();
    }
    match version.split_once("-dot-") {
        Some((branch, _rest)) => branch.to_string(),
        None => version.to_string(),
    }
}

/// A pinned-manifest branch like `manifest-42` bypasses the branch pointer
/// and serves that manifest id directly.
pub fn pinned_manifest_id(branch: &str) -> Option<u64> {
    let digits = branch.strip_prefix("manifest-")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn is_authorized(config: &FilesetConfig, email: &str) -> bool {
    if config.authorized_users.contains(email) {
        return true;
    }
    let org = email.rsplit('@').next().unwrap_or(email);
    config.authorized_orgs.contains(org)
}

/// Join path components, rejecting intermediates that start with a slash
/// so a crafted component cannot escape the base.
pub fn safe_join(base: &str, paths: &[&str]) -> FilesetResult<String> {
    let mut result = base.to_string();
    for path in paths {
        if path.starts_with('/') {
            return Err(FilesetError::InvalidPath(format!(
                "intermediate path cannot start with slash: {path}"
            )));
        }
        if result.is_empty() || result.ends_with('/') {
            result.push_str(path);
        } else {
            result.push('/');
            result.push_str(path);
        }
    }
    Ok(result)
}
