//! Axum middleware recording a span, a log line and Prometheus metrics per request.

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info_span, Instrument};

use super::metrics::metrics;

/// Path segments that carry an identifier, per route prefix.
static ID_SEGMENT: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^/(nodes|agents|messages|relay/envelopes)/[^/]+").ok()
});

/// Collapse identifiers in a path to `{id}` to keep label cardinality bounded.
fn normalize_path(path: &str) -> String {
    match ID_SEGMENT.as_ref() {
        Some(re) => re.replace(path, "/$1/{id}").into_owned(),
        None => path.to_string(),
    }
}

pub async fn observability_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let route = normalize_path(&path);

    let span = info_span!(
        "http_request",
        http.method = %method,
        http.target = %path,
        http.route = %route,
    );
    let response = next.run(request).instrument(span).await;

    let duration = start.elapsed();
    let status = response.status();
    if let Some(m) = metrics() {
        m.record_http_request(method.as_str(), &route, status.as_u16(), duration.as_secs_f64());
    }

    tracing::debug!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = duration.as_millis() as u64,
        "Request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_node_paths() {
        assert_eq!(normalize_path("/nodes/htpc"), "/nodes/{id}");
        assert_eq!(normalize_path("/nodes/htpc/start"), "/nodes/{id}/start");
        assert_eq!(normalize_path("/agents/coder-1/role"), "/agents/{id}/role");
    }

    #[test]
    fn test_normalize_hash_paths() {
        assert_eq!(normalize_path("/messages/abc123"), "/messages/{id}");
        assert_eq!(normalize_path("/relay/envelopes/deadbeef"), "/relay/envelopes/{id}");
    }

    #[test]
    fn test_normalize_leaves_collections() {
        assert_eq!(normalize_path("/nodes"), "/nodes");
        assert_eq!(normalize_path("/relay/query"), "/relay/query");
        assert_eq!(normalize_path("/health"), "/health");
    }
}
