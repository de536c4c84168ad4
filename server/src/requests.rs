use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::Request;

/// The Host header value, or empty when absent.
pub fn host_of(req: &Request<Body>) -> String {
    header_str(req, "Host").unwrap_or_default().to_string()
}

/// The request scheme as the client saw it. Behind a load balancer the
/// original scheme arrives in X-Forwarded-Proto.
pub fn scheme_of(req: &Request<Body>) -> &str {
    header_str(req, "X-Forwarded-Proto")
        .or_else(|| req.uri().scheme_str())
        .unwrap_or("http")
}

/// Path plus query string, as sent.
pub fn path_qs(req: &Request<Body>) -> &str {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}

pub fn header_str<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers().get(name)?.to_str().ok()
}

/// Look up a single query parameter, form-decoded.
pub fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Insert a header, skipping (and logging) values that aren't legal HTTP.
/// Config-sourced header maps go through here so a bad entry can't take
/// the whole response down.
pub fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
        log::warn!("skipping invalid header name: {name}");
        return;
    };
    let Ok(value) = HeaderValue::from_str(value) else {
        log::warn!("skipping invalid header value for {name}");
        return;
    };
    headers.insert(name, value);
}
