use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::FilesetResult;

pub const DEFAULT_BRANCH: &str = "master";
pub const DEFAULT_INTL_PATH_FORMAT: &str = "/intl/{locale}{path}";

/// Immutable process-wide configuration, loaded once at startup and passed
/// by reference to the components that need it.
///
/// All fields have defaults so an empty config file (or none at all) yields
/// a working local server.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FilesetConfig {
    /// Email domains allowed through the staging auth gate.
    pub authorized_orgs: HashSet<String>,
    /// Individual emails allowed through the staging auth gate.
    pub authorized_users: HashSet<String>,
    /// Emails allowed to mint deploy tokens at /_fs/token.
    pub admins: HashSet<String>,
    /// If set, production requests on any other host 302 here.
    pub canonical_domain: Option<String>,
    /// Branch served when none is inferred from the URL.
    pub default_branch: String,
    /// Server-side redirect table, checked before content is served.
    pub redirects: Vec<RedirectRule>,
    /// Require the auth gate even in production.
    pub require_auth: bool,
    /// Force https for all non-dev requests.
    pub require_https: bool,
    /// Extra response headers, keyed by file extension. Only "html" is
    /// consulted by the serving path.
    pub response_headers: HashMap<String, HashMap<String, String>>,
    /// Template used to build locale-specific path candidates.
    pub intl_path_format: String,
    /// Application id, used to peel the branch out of staging hosts.
    pub app_id: String,
    /// Where unauthenticated users are sent when the auth gate is on.
    pub login_url: Option<String>,
    /// Header carrying the authenticated principal's email, set by the
    /// fronting identity-aware proxy.
    pub user_header: String,
    /// Local development mode: auth is bypassed and env is always Dev.
    pub dev: bool,
    /// Bucket name baked into blob external keys.
    pub bucket: String,
    /// Directory holding the blob cache and metadata files.
    pub data_dir: PathBuf,
    /// How often the in-process cron promotes due timed deploys.
    pub cron_interval_secs: u64,
}

impl Default for FilesetConfig {
    fn default() -> Self {
        let mut response_headers = HashMap::new();
        let mut html = HashMap::new();
        html.insert("X-Frame-Options".to_string(), "deny".to_string());
        response_headers.insert("html".to_string(), html);

        FilesetConfig {
            authorized_orgs: HashSet::new(),
            authorized_users: HashSet::new(),
            admins: HashSet::new(),
            canonical_domain: None,
            default_branch: DEFAULT_BRANCH.to_string(),
            redirects: Vec::new(),
            require_auth: false,
            require_https: false,
            response_headers,
            intl_path_format: DEFAULT_INTL_PATH_FORMAT.to_string(),
            app_id: String::new(),
            login_url: None,
            user_header: "X-Fileset-User".to_string(),
            dev: false,
            bucket: "fileset".to_string(),
            data_dir: PathBuf::from("fileset-data"),
            cron_interval_secs: 60,
        }
    }
}

impl FilesetConfig {
    pub fn load(path: &Path) -> FilesetResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: FilesetConfig = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Load from the path in FILESET_CONFIG, falling back to ./fileset.toml
    /// if present, then to defaults. FILESET_DEV=1 flips dev mode on
    /// regardless of the file.
    pub fn from_env() -> FilesetResult<Self> {
        let mut config = match std::env::var("FILESET_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => {
                let default_path = Path::new("fileset.toml");
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        if let Ok(value) = std::env::var("FILESET_DEV") {
            config.dev = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(dir) = std::env::var("FILESET_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn html_headers(&self) -> Option<&HashMap<String, String>> {
        self.response_headers.get("html")
    }
}

/// One server-side redirect: `source` may contain `:var` and `*wild`
/// segments, `dest` may reference them as `$var`. A code of "no-redirect"
/// pins a specific path so it escapes a broader pattern.
#[derive(Clone, Debug, Deserialize)]
pub struct RedirectRule {
    pub code: RedirectCode,
    pub source: String,
    #[serde(default)]
    pub dest: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RedirectCode {
    Permanent,
    Temporary,
    NoRedirect,
}

impl RedirectCode {
    pub fn status(&self) -> Option<u16> {
        match self {
            RedirectCode::Permanent => Some(301),
            RedirectCode::Temporary => Some(302),
            RedirectCode::NoRedirect => None,
        }
    }
}

impl fmt::Display for RedirectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectCode::Permanent => write!(f, "301"),
            RedirectCode::Temporary => write!(f, "302"),
            RedirectCode::NoRedirect => write!(f, "no-redirect"),
        }
    }
}

// Config files write codes the way the original tuples did: the integers
// 301/302, or the literal string "no-redirect".
impl<'de> Deserialize<'de> for RedirectCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CodeVisitor;

        impl<'de> de::Visitor<'de> for CodeVisitor {
            type Value = RedirectCode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("301, 302, or \"no-redirect\"")
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<RedirectCode, E> {
                match value {
                    301 => Ok(RedirectCode::Permanent),
                    302 => Ok(RedirectCode::Temporary),
                    other => Err(E::custom(format!("unsupported redirect code: {other}"))),
                }
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<RedirectCode, E> {
                self.visit_i64(value as i64)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<RedirectCode, E> {
                match value {
                    "301" => Ok(RedirectCode::Permanent),
                    "302" => Ok(RedirectCode::Temporary),
                    "no-redirect" => Ok(RedirectCode::NoRedirect),
                    other => Err(E::custom(format!("unsupported redirect code: {other}"))),
                }
            }
        }

        deserializer.deserialize_any(CodeVisitor)
    }
}

impl Serialize for RedirectCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.status() {
            Some(code) => serializer.serialize_u16(code),
            None => serializer.serialize_str("no-redirect"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_stock_install() {
        let config = FilesetConfig::default();
        assert_eq!(config.default_branch, "master");
        assert_eq!(config.intl_path_format, "/intl/{locale}{path}");
        assert!(!config.require_https);
        let html = config.html_headers().expect("html headers");
        assert_eq!(html.get("X-Frame-Options").map(String::as_str), Some("deny"));
    }

    #[test]
    fn parses_redirect_codes() {
        let raw = r#"
            default_branch = "prod"
            canonical_domain = "example.com"

            [[redirects]]
            code = 301
            source = "/old/"
            dest = "/new/"

            [[redirects]]
            code = 302
            source = "/old/:slug"
            dest = "/new/$slug/"

            [[redirects]]
            code = "no-redirect"
            source = "/old/keep/"
        "#;
        let config: FilesetConfig = toml::from_str(raw).expect("config should parse");
        assert_eq!(config.default_branch, "prod");
        assert_eq!(config.redirects.len(), 3);
        assert_eq!(config.redirects[0].code, RedirectCode::Permanent);
        assert_eq!(config.redirects[1].code, RedirectCode::Temporary);
        assert_eq!(config.redirects[2].code, RedirectCode::NoRedirect);
        assert_eq!(config.redirects[2].dest, None);
    }

    #[test]
    fn rejects_unknown_codes() {
        let raw = r#"
            [[redirects]]
            code = 307
            source = "/a/"
            dest = "/b/"
        "#;
        assert!(toml::from_str::<FilesetConfig>(raw).is_err());
    }
}
