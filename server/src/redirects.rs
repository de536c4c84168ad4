use std::collections::HashSet;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::HeaderMap;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use utils::hosts::{self, Env};

use crate::requests::{header_str, host_of, insert_header, path_qs, scheme_of};
use crate::structures::{AppState, ServerState};

/// Runs before any content is served: canonicalization, https upgrades,
/// the auth gate, and the configured redirect table. The ingest API is
/// mounted outside this middleware, so `/_fs/` paths pass straight through.
pub async fn redirect_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next<Body>,
) -> Response {
    if req.uri().path().starts_with("/_fs/") {
        return next.run(req).await;
    }
    match check(&state, &req) {
        Some(response) => response,
        None => next.run(req).await,
    }
}

fn check(state: &ServerState, req: &Request<Body>) -> Option<Response> {
    // Scanners request /%FF verbatim, which breaks percent-decoding
    // downstream. Bounce them home.
    if req.uri().path().eq_ignore_ascii_case("/%ff") {
        return Some(redirect("/", 302));
    }

    let host = host_of(req);
    let domain = hosts::get_domain(&host).to_string();
    let env = hosts::get_env(&state.config, &host);
    let scheme = scheme_of(req).to_string();
    let path_qs = path_qs(req).to_string();

    if let Some(canonical) = &state.config.canonical_domain {
        if env == Env::Prod && &domain != canonical {
            let uri = format!("{scheme}://{canonical}{path_qs}");
            log::info!("redirecting: 302 {domain}{path_qs} => {uri}");
            return Some(redirect(&uri, 302));
        }
    }

    let upgrade_requests = header_str(req, "Upgrade-Insecure-Requests") == Some("1");
    if (state.config.require_https || upgrade_requests) && env != Env::Dev && scheme != "https" {
        let uri = format!("https://{domain}{path_qs}");
        log::info!("redirecting: 302 {domain}{path_qs} => {uri}");
        return Some(redirect(&uri, 302));
    }

    if state.config.require_auth || env == Env::Staging {
        match header_str(req, state.config.user_header.as_str()).filter(|e| !e.is_empty()) {
            None => {
                let Some(login_url) = &state.config.login_url else {
                    return Some(forbidden());
                };
                let continue_to: String =
                    form_urlencoded::byte_serialize(path_qs.as_bytes()).collect();
                return Some(redirect(&format!("{login_url}?continue={continue_to}"), 302));
            }
            Some(email) => {
                if !hosts::is_authorized(&state.config, email) {
                    log::info!("{email} is not authorized to access {path_qs}");
                    return Some(forbidden());
                }
            }
        }
    }

    let (code, uri) = redirect_target(state, req)?;
    log::info!("redirecting: {code} {path_qs} => {uri}");
    Some(redirect(&uri, code))
}

/// Resolve the request path against the redirect trie, fill in `$param`
/// placeholders, and carry the query string over for site-relative
/// destinations.
fn redirect_target(state: &ServerState, req: &Request<Body>) -> Option<(u16, String)> {
    let path = req.uri().path().to_lowercase();
    let ((code, dest), params) = state.redirects.get(&path)?;
    let status = code.status()?;
    let mut uri = dest?;

    if uri.contains('$') {
        for (key, value) in &params {
            uri = uri.replace(&format!("${key}"), value);
        }
    }

    if uri.starts_with('/') {
        if let Some(query) = req.uri().query().filter(|q| !q.is_empty()) {
            uri = merge_query(&uri, query);
        }
    }

    Some((status, uri))
}

/// Merge the request's query string into a destination that may already
/// carry one. On a key collision the request's value wins.
fn merge_query(dest: &str, request_query: &str) -> String {
    match dest.split_once('?') {
        Some((path, dest_query)) => {
            let request_keys: HashSet<String> = form_urlencoded::parse(request_query.as_bytes())
                .map(|(key, _)| key.into_owned())
                .collect();
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (key, value) in form_urlencoded::parse(dest_query.as_bytes()) {
                if !request_keys.contains(key.as_ref()) {
                    serializer.append_pair(&key, &value);
                }
            }
            for (key, value) in form_urlencoded::parse(request_query.as_bytes()) {
                serializer.append_pair(&key, &value);
            }
            format!("{path}?{}", serializer.finish())
        }
        None => format!("{dest}?{request_query}"),
    }
}

fn redirect(uri: &str, code: u16) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::FOUND);
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "Location", uri);
    insert_header(&mut headers, "Cache-Control", "no-cache");
    (status, headers).into_response()
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "403 Forbidden").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::testutil::{test_app, test_state};
    use tower::ServiceExt;
    use utils::config::{FilesetConfig, RedirectCode, RedirectRule};

    fn rule(code: RedirectCode, source: &str, dest: Option<&str>) -> RedirectRule {
        RedirectRule {
            code,
            source: source.to_string(),
            dest: dest.map(str::to_string),
        }
    }

    fn get(uri: &str, host: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("Host", host)
            .body(Body::empty())
            .unwrap()
    }

    fn location(response: &Response) -> &str {
        response.headers().get("Location").unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn redirect_substitutes_params_and_preserves_the_query() {
        let mut config = FilesetConfig::default();
        config.redirects = vec![rule(
            RedirectCode::Temporary,
            "/old/:slug",
            Some("/new/$slug/"),
        )];
        let (_dir, state) = test_state(config);
        let app = test_app(state);

        let response = app
            .oneshot(get("/old/42?utm=x", "example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/new/42/?utm=x");
        assert_eq!(response.headers().get("Cache-Control").unwrap(), "no-cache");
    }

    #[tokio::test]
    async fn wildcard_redirect_carries_the_rest() {
        let mut config = FilesetConfig::default();
        config.redirects = vec![rule(
            RedirectCode::Permanent,
            "/docs/*rest",
            Some("https://docs.example.com/$rest"),
        )];
        let (_dir, state) = test_state(config);
        let app = test_app(state);

        let response = app.oneshot(get("/docs/a/b", "example.com")).await.unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(location(&response), "https://docs.example.com/a/b");
    }

    #[tokio::test]
    async fn no_redirect_pins_escape_broader_patterns() {
        let mut config = FilesetConfig::default();
        config.redirects = vec![
            rule(RedirectCode::Temporary, "/foo/:bar/", Some("/new/$bar/")),
            rule(RedirectCode::NoRedirect, "/foo/baz/", None),
        ];
        let (_dir, state) = test_state(config);
        let app = test_app(state);

        let response = app
            .clone()
            .oneshot(get("/foo/hello/", "example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);

        // The pinned path falls through to normal (404) serving.
        let response = app.oneshot(get("/foo/baz/", "example.com")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let mut config = FilesetConfig::default();
        config.redirects = vec![rule(RedirectCode::Temporary, "/old/", Some("/new/"))];
        let (_dir, state) = test_state(config);
        let app = test_app(state);

        let response = app.oneshot(get("/OLD/", "example.com")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[test]
    fn query_merge_lets_the_request_win() {
        assert_eq!(merge_query("/new/?a=1&b=2", "b=9&c=3"), "/new/?a=1&b=9&c=3");
        assert_eq!(merge_query("/new/", "utm=x"), "/new/?utm=x");
    }

    #[tokio::test]
    async fn canonical_domain_redirects_production_hosts() {
        let mut config = FilesetConfig::default();
        config.canonical_domain = Some("example.com".to_string());
        let (_dir, state) = test_state(config);
        let app = test_app(state);

        let response = app
            .clone()
            .oneshot(get("/page/?x=1", "www.example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "http://example.com/page/?x=1");

        // Already canonical: falls through to serving.
        let response = app.oneshot(get("/page/", "example.com")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn https_upgrade_honors_the_browser_hint() {
        let (_dir, state) = test_state(FilesetConfig::default());
        let app = test_app(state);

        let request = Request::builder()
            .uri("/page/")
            .header("Host", "example.com")
            .header("Upgrade-Insecure-Requests", "1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "https://example.com/page/");
    }

    #[tokio::test]
    async fn require_https_skips_requests_already_on_https() {
        let mut config = FilesetConfig::default();
        config.require_https = true;
        let (_dir, state) = test_state(config);
        let app = test_app(state);

        let request = Request::builder()
            .uri("/page.txt")
            .header("Host", "example.com")
            .header("X-Forwarded-Proto", "https")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn auth_gate_sends_strangers_to_login() {
        let mut config = FilesetConfig::default();
        config.require_auth = true;
        config.login_url = Some("https://login.example.com/".to_string());
        config.authorized_users.insert("dev@corp.com".to_string());
        let (_dir, state) = test_state(config);
        let app = test_app(state);

        // No identity header: off to login, with a continue param.
        let response = app
            .clone()
            .oneshot(get("/secret/?x=1", "example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            location(&response),
            "https://login.example.com/?continue=%2Fsecret%2F%3Fx%3D1"
        );

        // Known but unauthorized: 403.
        let request = Request::builder()
            .uri("/secret/")
            .header("Host", "example.com")
            .header("X-Fileset-User", "stranger@elsewhere.com")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Authorized: falls through to serving.
        let request = Request::builder()
            .uri("/secret/")
            .header("Host", "example.com")
            .header("X-Fileset-User", "dev@corp.com")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pathological_percent_ff_goes_home() {
        let (_dir, state) = test_state(FilesetConfig::default());
        let app = test_app(state);

        let response = app.oneshot(get("/%FF", "example.com")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/");
    }
}
