use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

// Named errors for the fileset libraries. The binaries are free to wrap
// these in anyhow at the top level; the HTTP boundary maps them onto
// status codes via the IntoResponse impl below.

#[derive(Error, Debug)]
pub enum FilesetError {
    /// An uploaded blob's bytes did not hash to the sha the client declared.
    #[error("sha does not match: \"{expected}\" != \"{actual}\"")]
    HashMismatch { expected: String, actual: String },

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid config: {0}")]
    ConfigError(String),

    #[error("remote call failed: {0}")]
    RemoteError(String),

    #[error(transparent)]
    HttpError(#[from] reqwest::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    CacheError(#[from] cacache::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    TomlError(#[from] toml::de::Error),
}

pub type FilesetResult<T> = Result<T, FilesetError>;

impl IntoResponse for FilesetError {
    fn into_response(self) -> Response {
        let status = match &self {
            FilesetError::BlobNotFound(_) | FilesetError::ManifestNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            FilesetError::HashMismatch { .. }
            | FilesetError::MissingField(_)
            | FilesetError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            FilesetError::Unauthorized => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
