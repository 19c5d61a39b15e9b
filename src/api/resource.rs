//! Serving cached resources over HTTP with conditional-request support.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};

use super::ErrorResponse;
use crate::cache::{CachedResource, ResourceCache};

/// Respond with the resource stored under `key`.
///
/// Without `issued_at` this is a plain GET: matching `If-None-Match` or
/// `If-Modified-Since` gives 304. With `issued_at` (the instant the
/// caller's own mutation was sent) the answer is 202 while the resource
/// predates that instant and 200 once it reflects it.
pub async fn serve(
    cache: &ResourceCache,
    key: &str,
    headers: &HeaderMap,
    issued_at: Option<DateTime<Utc>>,
) -> Response {
    let Some(resource) = cache.get(key).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("{} is not available yet", key),
            }),
        )
            .into_response();
    };

    let etag = resource.etag();
    let last_modified = resource.last_modified();

    if issued_at.is_none() && not_modified(headers, &resource, &etag) {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, etag)
            .header(header::LAST_MODIFIED, last_modified)
            .header(header::VARY, "Accept-Encoding")
            .body(Body::empty())
            .unwrap_or_default();
    }

    let status = match issued_at {
        Some(issued) if resource.modified_at < issued => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ETAG, etag)
        .header(header::LAST_MODIFIED, last_modified)
        .header(header::VARY, "Accept-Encoding");

    let body = match (&resource.gzip, accepts_gzip(headers)) {
        (Some(gzip), true) => {
            builder = builder.header(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            gzip.clone()
        }
        _ => resource.bytes.clone(),
    };

    builder.body(Body::from(body)).unwrap_or_default()
}

fn not_modified(headers: &HeaderMap, resource: &CachedResource, etag: &str) -> bool {
    // If-None-Match wins over If-Modified-Since when both are present.
    if let Some(value) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        return value
            .split(',')
            .map(|tag| tag.trim().trim_start_matches("W/"))
            .any(|tag| tag == "*" || tag == etag);
    }
    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
    else {
        return false;
    };
    // HTTP dates carry whole seconds.
    resource.modified_at.timestamp() <= since.timestamp()
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    value.split(',').any(|coding| {
        let mut parts = coding.split(';');
        let name = parts.next().unwrap_or_default().trim();
        let rejected = parts.any(|p| {
            p.trim()
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q == 0.0)
        });
        (name.eq_ignore_ascii_case("gzip") || name == "*") && !rejected
    })
}
