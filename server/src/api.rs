use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Multipart, Query, State};
use axum::http::header::HeaderMap;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use utils::errors::FilesetError;
use utils::time::unix_now;

use crate::structures::{AppState, FilesetRouter};

pub const TOKEN_HEADER: &str = "X-Fileset-Token";
pub const CRON_HEADER: &str = "X-Appengine-Cron";

/// Mount the ingest API and the token-minting page.
pub fn mount(router: FilesetRouter, state: AppState) -> FilesetRouter {
    let api = axum::Router::new()
        .route("/_fs/api/manifest.upload", post(manifest_upload))
        .route("/_fs/api/blob.upload", post(blob_upload))
        .route("/_fs/api/blob.exists", post(blob_exists))
        .route("/_fs/api/branch.set_manifest", post(branch_set_manifest))
        .route(
            "/_fs/api/cron.timed_deploy",
            post(cron_timed_deploy).get(cron_timed_deploy_via_get),
        )
        .route_layer(axum::middleware::from_fn_with_state(state, rpc_auth));
    router.merge(api).route("/_fs/token", get(token_page))
}

/// Gate for the ingest endpoints: dev mode and the scheduler's cron marker
/// pass, anything else needs a valid deploy token.
pub async fn rpc_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next<Body>,
) -> Response {
    if request_is_authorized(&state, req.headers()).await {
        return next.run(req).await;
    }
    (
        StatusCode::FORBIDDEN,
        Json(json!({"success": false, "error": "unauthorized"})),
    )
        .into_response()
}

async fn request_is_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    if state.config.dev {
        return true;
    }
    if has_cron_marker(headers) {
        return true;
    }
    let Some(token) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    !token.is_empty() && state.tokens.is_valid(token, unix_now()).await
}

fn has_cron_marker(headers: &HeaderMap) -> bool {
    headers
        .get(CRON_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// An rpc error, rendered as `{"success": false, "error": ...}`.
#[derive(Debug)]
struct RpcFailure {
    status: StatusCode,
    message: String,
}

impl RpcFailure {
    fn bad_request(message: impl Into<String>) -> Self {
        RpcFailure {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn missing(field: &str) -> Self {
        Self::bad_request(format!("missing required field: {field}"))
    }
}

impl IntoResponse for RpcFailure {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"success": false, "error": self.message})),
        )
            .into_response()
    }
}

impl From<FilesetError> for RpcFailure {
    fn from(e: FilesetError) -> Self {
        match e {
            FilesetError::HashMismatch { .. } | FilesetError::MissingField(_) => {
                Self::bad_request(e.to_string())
            }
            FilesetError::Unauthorized => RpcFailure {
                status: StatusCode::FORBIDDEN,
                message: "unauthorized".to_string(),
            },
            other => {
                log::error!("request failed: {other}");
                RpcFailure {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "unknown server error".to_string(),
                }
            }
        }
    }
}

type RpcResult = Result<Json<serde_json::Value>, RpcFailure>;

#[derive(Debug, Deserialize)]
struct ManifestUploadRequest {
    commit: Option<serde_json::Value>,
    files: Option<Vec<ManifestFile>>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    sha: String,
    path: String,
}

async fn manifest_upload(
    State(state): State<AppState>,
    Json(body): Json<ManifestUploadRequest>,
) -> RpcResult {
    let commit = body.commit.ok_or_else(|| RpcFailure::missing("commit"))?;
    let files = body.files.ok_or_else(|| RpcFailure::missing("files"))?;

    // Duplicate paths: last occurrence wins.
    let mut paths = HashMap::new();
    for file in files {
        paths.insert(file.path, file.sha);
    }

    let manifest_id = state.manifests.save(commit, paths, unix_now()).await?;
    Ok(Json(json!({"success": true, "manifest_id": manifest_id})))
}

#[derive(Debug, Deserialize)]
struct BlobUploadQuery {
    sha: Option<String>,
}

async fn blob_upload(
    State(state): State<AppState>,
    Query(query): Query<BlobUploadQuery>,
    mut multipart: Multipart,
) -> RpcResult {
    let sha = query.sha.ok_or_else(|| RpcFailure::missing("sha"))?;

    let mut blob: Option<(Option<String>, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RpcFailure::bad_request(e.to_string()))?
    {
        if field.name() != Some("blob") {
            continue;
        }
        let content_type = field.content_type().map(str::to_string).or_else(|| {
            field
                .file_name()
                .and_then(|name| mime_guess::from_path(name).first_raw())
                .map(str::to_string)
        });
        let bytes = field
            .bytes()
            .await
            .map_err(|e| RpcFailure::bad_request(e.to_string()))?;
        blob = Some((content_type, bytes.to_vec()));
        break;
    }
    let Some((content_type, bytes)) = blob else {
        return Err(RpcFailure::bad_request("missing required file: \"blob\""));
    };

    state
        .blobs
        .write(&sha, &bytes, content_type.as_deref())
        .await?;
    Ok(Json(json!({"success": true, "sha": sha})))
}

#[derive(Debug, Deserialize)]
struct BlobExistsRequest {
    sha: Option<String>,
}

async fn blob_exists(
    State(state): State<AppState>,
    Json(body): Json<BlobExistsRequest>,
) -> RpcResult {
    let sha = body.sha.ok_or_else(|| RpcFailure::missing("sha"))?;
    let exists = state.blobs.exists(&sha).await?;
    Ok(Json(json!({"success": true, "sha": sha, "exists": exists})))
}

#[derive(Debug, Deserialize)]
struct BranchSetRequest {
    branch: Option<String>,
    manifest_id: Option<u64>,
    deploy_timestamp: Option<i64>,
}

async fn branch_set_manifest(
    State(state): State<AppState>,
    Json(body): Json<BranchSetRequest>,
) -> RpcResult {
    let branch = body.branch.ok_or_else(|| RpcFailure::missing("branch"))?;
    let manifest_id = body
        .manifest_id
        .ok_or_else(|| RpcFailure::missing("manifest_id"))?;

    state
        .manifests
        .set_branch_manifest(&branch, manifest_id, body.deploy_timestamp, unix_now())
        .await?;
    Ok(Json(json!({
        "success": true,
        "branch": branch,
        "manifest_id": manifest_id,
        "deploy_timestamp": body.deploy_timestamp,
    })))
}

async fn cron_timed_deploy(State(state): State<AppState>) -> RpcResult {
    let deployments = state.manifests.promote_due_deploys(unix_now()).await?;
    if !deployments.is_empty() {
        log::info!(
            "deployed: {}",
            serde_json::to_string(&deployments).unwrap_or_default()
        );
    }
    Ok(Json(json!({"success": true, "deployments": deployments})))
}

/// The scheduler calls cron endpoints with GET; anything else asking with
/// GET is turned away.
async fn cron_timed_deploy_via_get(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if has_cron_marker(&headers) {
        return cron_timed_deploy(State(state)).await.into_response();
    }
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({"success": false, "error": "method not supported"})),
    )
        .into_response()
}

/// Admin-only page that mints a deploy token and prints setup
/// instructions. The principal's email arrives in the configured identity
/// header.
async fn token_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let email = headers
        .get(state.config.user_header.as_str())
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if email.is_empty() || !state.config.admins.contains(&email) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let token = match state.tokens.create(&email, &email, unix_now()).await {
        Ok(token) => token,
        Err(e) => {
            log::error!("token creation failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An unexpected error has occurred.",
            )
                .into_response();
        }
    };

    let body = format!("save the following to .fileset.json:\n\n{{\"token\": \"{token}\"}}\n");
    let mut response_headers = HeaderMap::new();
    crate::requests::insert_header(&mut response_headers, "Content-Type", "text/plain");
    (StatusCode::OK, response_headers, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::testutil::{test_app, test_state};
    use tower::ServiceExt;
    use utils::config::FilesetConfig;

    const HI_SHA: &str = "c22b5f9178342609428d6f51b2c5af4c0bde6a42";

    fn dev_config() -> FilesetConfig {
        FilesetConfig {
            dev: true,
            ..FilesetConfig::default()
        }
    }

    fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Host", "localhost:8088")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_upload(sha: &str, filename: &str, content: &str) -> Request<Body> {
        let boundary = "fsboundary";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"blob\"; filename=\"{filename}\"\r\nContent-Type: text/plain\r\n\r\n{content}\r\n--{boundary}--\r\n"
        );
        Request::builder()
            .method("POST")
            .uri(format!("/_fs/api/blob.upload?sha={sha}"))
            .header("Host", "localhost:8088")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn full_deploy_flow_over_http() {
        let (_dir, state) = test_state(dev_config());
        let app = test_app(state.clone());

        // Upload the blob.
        let response = app
            .clone()
            .oneshot(multipart_upload(HI_SHA, "hello.txt", "hi"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["sha"], HI_SHA);

        // It exists now.
        let response = app
            .clone()
            .oneshot(json_post(
                "/_fs/api/blob.exists",
                serde_json::json!({"sha": HI_SHA}),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["exists"], true);

        // Upload the manifest and point master at it.
        let response = app
            .clone()
            .oneshot(json_post(
                "/_fs/api/manifest.upload",
                serde_json::json!({
                    "commit": {"sha": "x", "message": "m"},
                    "files": [{"sha": HI_SHA, "path": "/hello.txt"}],
                }),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["manifest_id"], 1);

        let response = app
            .clone()
            .oneshot(json_post(
                "/_fs/api/branch.set_manifest",
                serde_json::json!({"branch": "master", "manifest_id": 1}),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["success"], true);

        // And the page serves.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/hello.txt")
                    .header("Host", "localhost:8088")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&bytes[..], b"hi");
    }

    #[tokio::test]
    async fn hash_mismatch_is_a_400_and_nothing_is_stored() {
        let (_dir, state) = test_state(dev_config());
        let app = test_app(state.clone());

        let bogus = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let response = app
            .clone()
            .oneshot(multipart_upload(bogus, "hello.txt", "hi"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);

        let response = app
            .oneshot(json_post(
                "/_fs/api/blob.exists",
                serde_json::json!({"sha": bogus}),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["exists"], false);
    }

    #[tokio::test]
    async fn duplicate_manifest_paths_keep_the_last_sha() {
        let (_dir, state) = test_state(dev_config());
        let app = test_app(state.clone());

        let response = app
            .oneshot(json_post(
                "/_fs/api/manifest.upload",
                serde_json::json!({
                    "commit": {},
                    "files": [
                        {"sha": "older", "path": "/dup.txt"},
                        {"sha": "newer", "path": "/dup.txt"},
                    ],
                }),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        let manifest_id = body["manifest_id"].as_u64().unwrap();
        let manifest = state.manifests.get(manifest_id).await.unwrap();
        assert_eq!(manifest.paths.get("/dup.txt").map(String::as_str), Some("newer"));
    }

    #[tokio::test]
    async fn missing_fields_are_400s() {
        let (_dir, state) = test_state(dev_config());
        let app = test_app(state);

        let response = app
            .clone()
            .oneshot(json_post("/_fs/api/blob.exists", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_post(
                "/_fs/api/branch.set_manifest",
                serde_json::json!({"branch": "master"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tokens_gate_the_api_outside_dev() {
        let (_dir, state) = test_state(FilesetConfig::default());
        let token = state
            .tokens
            .create("ci", "admin@corp.com", 100)
            .await
            .unwrap();
        let app = test_app(state);

        // No token: 403 with the canonical error body.
        let response = app
            .clone()
            .oneshot(json_post(
                "/_fs/api/blob.exists",
                serde_json::json!({"sha": HI_SHA}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert_eq!(body["error"], "unauthorized");

        // Valid token: allowed.
        let mut request = json_post(
            "/_fs/api/blob.exists",
            serde_json::json!({"sha": HI_SHA}),
        );
        request
            .headers_mut()
            .insert(TOKEN_HEADER, token.parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cron_get_requires_the_marker_header() {
        let (_dir, state) = test_state(FilesetConfig::default());
        let app = test_app(state);

        let bare = Request::builder()
            .uri("/_fs/api/cron.timed_deploy")
            .header("Host", "example.com")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(bare).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let marked = Request::builder()
            .uri("/_fs/api/cron.timed_deploy")
            .header("Host", "example.com")
            .header(CRON_HEADER, "true")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(marked).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn timed_deploy_promotes_once() {
        let (_dir, state) = test_state(dev_config());

        let m7 = state
            .manifests
            .save(serde_json::json!({}), HashMap::new(), 100)
            .await
            .unwrap();
        // Scheduled in the past relative to the cron's clock, so the next
        // cron run promotes it.
        state
            .manifests
            .set_branch_manifest("master", m7, Some(unix_now() - 5), unix_now() - 10)
            .await
            .unwrap();

        let app = test_app(state.clone());
        let cron = |_: ()| {
            Request::builder()
                .method("POST")
                .uri("/_fs/api/cron.timed_deploy")
                .header("Host", "localhost:8088")
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(cron(())).await.unwrap();
        let body = json_body(response).await;
        assert_eq!(body["deployments"][0]["branch"], "master");
        assert_eq!(body["deployments"][0]["manifest_id"], m7);
        assert_eq!(state.manifests.get_branch_manifest("master").await.unwrap().id, m7);

        // Second run: nothing left to promote.
        let response = app.oneshot(cron(())).await.unwrap();
        let body = json_body(response).await;
        assert_eq!(body["deployments"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn token_page_is_admin_only() {
        let mut config = dev_config();
        config.admins.insert("admin@corp.com".to_string());
        let (_dir, state) = test_state(config);
        let app = test_app(state);

        let anonymous = Request::builder()
            .uri("/_fs/token")
            .header("Host", "localhost:8088")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(anonymous).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let admin = Request::builder()
            .uri("/_fs/token")
            .header("Host", "localhost:8088")
            .header("X-Fileset-User", "admin@corp.com")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(admin).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(".fileset.json"));
        assert!(text.contains("\"token\": \""));
    }
}
