use axum::body::{Body, StreamBody};
use axum::extract::State;
use axum::http::header::HeaderMap;
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use utils::errors::{FilesetError, FilesetResult};
use utils::hosts;
use utils::intl;
use utils::manifests::Manifest;

use crate::requests::{header_str, host_of, insert_header, query_param};
use crate::structures::{AppState, ServerState};

/// Fallback handler for everything that isn't the ingest API: resolve the
/// path through a branch manifest and serve the blob.
pub async fn serve_path(State(state): State<AppState>, req: Request<Body>) -> Response {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    match handle(&state, &req).await {
        Ok(response) => response,
        Err(e) => {
            log::error!("serving failed; path={}; error={e}", req.uri().path());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An unexpected error has occurred.",
            )
                .into_response()
        }
    }
}

async fn handle(state: &ServerState, req: &Request<Body>) -> FilesetResult<Response> {
    let is_head = req.method() == Method::HEAD;

    let mut path = unquote_plus(req.uri().path());
    if file_ext(&path).is_none() {
        path = hosts::safe_join(&path, &["index.html"])?;
    }

    let is_html = path.ends_with(".html");
    let mut html_headers: Vec<(String, String)> = Vec::new();
    if is_html {
        // Case-insensitive paths for documents.
        path = path.to_lowercase();
        if let Some(configured) = state.config.html_headers() {
            html_headers = configured
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
        }
    }

    let host = host_of(req);
    let branch = hosts::get_branch(&state.config, &host);
    let manifest = match hosts::pinned_manifest_id(&branch) {
        Some(manifest_id) => state.manifests.get(manifest_id).await,
        None => state.manifests.get_branch_manifest(&branch).await,
    };
    let Some(manifest) = manifest else {
        return serve_error(state, req, 404, None, &html_headers).await;
    };

    let sha = if is_html {
        // Walk the locale fallback chain; first hit wins.
        let hl = query_param(req, "hl").unwrap_or_default().to_lowercase();
        let accept_language = header_str(req, "Accept-Language");
        let country = header_str(req, "X-AppEngine-Country")
            .filter(|value| !value.is_empty())
            .unwrap_or("us")
            .to_lowercase();
        intl::intl_path_candidates(
            &state.config.intl_path_format,
            &path,
            &hl,
            accept_language,
            &country,
        )
        .into_iter()
        .find_map(|candidate| manifest.paths.get(&candidate).cloned())
    } else {
        manifest.paths.get(&path).cloned()
    };
    let Some(sha) = sha else {
        return serve_error(state, req, 404, Some(&manifest), &html_headers).await;
    };

    let etag = format!("\"{sha}\"");
    if header_str(req, "If-None-Match") == Some(etag.as_str()) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "ETag", &etag);
    for (name, value) in &html_headers {
        insert_header(&mut headers, name, value);
    }
    if let Some(content_type) = state.blobs.content_type(&sha).await? {
        insert_header(&mut headers, "Content-Type", &content_type);
    }

    if is_head {
        return Ok((StatusCode::OK, headers).into_response());
    }

    match state.blobs.stream(&sha).await {
        Ok(stream) => Ok((StatusCode::OK, headers, StreamBody::new(stream)).into_response()),
        Err(FilesetError::BlobNotFound(_)) => {
            // The manifest promised a blob the store doesn't have.
            serve_error(state, req, 404, Some(&manifest), &html_headers).await
        }
        Err(e) => {
            // Stream hand-off failed for some other reason; second attempt
            // through a plain in-process read before giving up.
            log::warn!("blob stream failed; sha={sha}; error={e}");
            let bytes = state.blobs.read(&sha).await?;
            Ok((StatusCode::OK, headers, bytes).into_response())
        }
    }
}

/// Serve an error document. HTML-ish requests get the site's custom
/// `/<code>.html` page when one exists in the selected (else default
/// branch) manifest; everything else gets a plain-text status line.
async fn serve_error(
    state: &ServerState,
    req: &Request<Body>,
    code: u16,
    manifest: Option<&Manifest>,
    html_headers: &[(String, String)],
) -> FilesetResult<Response> {
    let is_head = req.method() == Method::HEAD;
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::NOT_FOUND);

    let ext = file_ext(req.uri().path());
    if ext.is_none() || ext == Some("html") {
        let html_path = format!("/{code}.html");
        let default_manifest;
        let manifest = match manifest {
            Some(manifest) => Some(manifest),
            None => {
                default_manifest = state
                    .manifests
                    .get_branch_manifest(&state.config.default_branch)
                    .await;
                default_manifest.as_ref()
            }
        };
        if let Some(sha) = manifest.and_then(|m| m.paths.get(&html_path)) {
            let mut headers = HeaderMap::new();
            insert_header(&mut headers, "Content-Type", "text/html");
            for (name, value) in html_headers {
                insert_header(&mut headers, name, value);
            }
            if is_head {
                return Ok((status, headers).into_response());
            }
            if let Ok(bytes) = state.blobs.read(sha).await {
                return Ok((status, headers, bytes).into_response());
            }
        }
    }

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "Content-Type", "text/plain");
    let body = if is_head {
        String::new()
    } else {
        format!("{code}\n")
    };
    Ok((status, headers, body).into_response())
}

/// Percent-decode a request path, treating `+` as space.
fn unquote_plus(path: &str) -> String {
    let plussed = path.replace('+', " ");
    percent_encoding::percent_decode_str(&plussed)
        .decode_utf8_lossy()
        .into_owned()
}

/// The extension of the path's final segment, if it has one. Leading dots
/// don't count, so `/.well-known` is extensionless.
fn file_ext(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let dot = name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some(&name[dot + 1..])
}
