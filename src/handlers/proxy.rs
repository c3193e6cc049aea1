use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cache::make_cache_key;
use crate::client;
use crate::error::Denial;
use crate::metrics::{CACHE_HITS, CACHE_MISSES, UPSTREAM_LATENCY};
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 1024 * 1024;

const FORWARDED_REQUEST_HEADERS: [HeaderName; 8] = [
    header::ACCEPT,
    header::ACCEPT_LANGUAGE,
    header::AUTHORIZATION,
    header::CONTENT_TYPE,
    header::COOKIE,
    header::IF_MODIFIED_SINCE,
    header::IF_NONE_MATCH,
    header::USER_AGENT,
];

// Cache-Control is left out: the security headers replace it on every response
const FORWARDED_RESPONSE_HEADERS: [HeaderName; 8] = [
    header::CONTENT_LANGUAGE,
    header::CONTENT_TYPE,
    header::ETAG,
    header::EXPIRES,
    header::LAST_MODIFIED,
    header::LOCATION,
    header::SET_COOKIE,
    header::VARY,
];

// Upstream answer as stored in the cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    fn into_response_marked(self, cache_state: &'static str) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response = (status, Body::from(self.body)).into_response();
        let headers = response.headers_mut();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
                headers.append(name, value);
            }
        }
        headers.insert("x-cache", HeaderValue::from_static(cache_state));
        response
    }
}

// Requests carrying credentials get answers meant for one user only
fn is_personal(headers: &HeaderMap) -> bool {
    headers.contains_key(header::AUTHORIZATION) || headers.contains_key(header::COOKIE)
}

// Whether a shared cache may keep this upstream response
fn is_shareable(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::SET_COOKIE) {
        return false;
    }
    let mut directives = headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|d| d.trim().to_ascii_lowercase());
    !directives.any(|d| d == "private" || d == "no-store" || d == "no-cache")
}

fn response_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    FORWARDED_RESPONSE_HEADERS
        .iter()
        .flat_map(|name| {
            headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn error_response(status: StatusCode, error: &str) -> Response {
    (status, Json(serde_json::json!({ "error": error }))).into_response()
}

pub async fn not_found_handler() -> Response {
    Denial::not_found().into_response()
}

// Forwards an admitted request to the next healthy upstream.
pub async fn proxy_handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let client_ip = client::request_ip(&req, state.config.trust_proxy);
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();

    let cacheable =
        parts.method == Method::GET && state.config.cache_ttl > 0 && !is_personal(&parts.headers);
    let cache_key = make_cache_key(parts.method.as_str(), &path);
    if cacheable {
        if let Some(hit) = state.cache.get::<CachedResponse>(&cache_key).await {
            CACHE_HITS.inc();
            debug!(path = %path, "response cache hit");
            return hit.into_response_marked("HIT");
        }
        CACHE_MISSES.inc();
    }

    let Some(upstream) = state.load_balancer.as_ref().and_then(|lb| lb.get_upstream()) else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable");
    };

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large"),
    };

    let mut forwarded = HeaderMap::new();
    for name in FORWARDED_REQUEST_HEADERS {
        for value in parts.headers.get_all(&name) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    if let Ok(ip) = HeaderValue::from_str(&client_ip) {
        forwarded.insert("x-forwarded-for", ip);
    }

    let start_time = Instant::now();
    let result = state
        .client
        .request(parts.method.clone(), format!("{}{}", upstream.url, path))
        .headers(forwarded)
        .body(body)
        .send()
        .await;
    UPSTREAM_LATENCY.observe(start_time.elapsed().as_secs_f64());

    // Marking upstream as unhealthy on transport errors
    let res = match result {
        Ok(res) => res,
        Err(e) => {
            upstream.set_healthy(false);
            warn!(url = %upstream.url, error = %e, "upstream failed, marked unhealthy");
            return error_response(StatusCode::BAD_GATEWAY, "Bad gateway");
        }
    };

    let status = res.status().as_u16();
    let shareable = is_shareable(res.headers());
    let headers = response_headers(res.headers());
    let body = match res.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            warn!(url = %upstream.url, error = %e, "upstream body unreadable");
            return error_response(StatusCode::BAD_GATEWAY, "Bad gateway");
        }
    };

    let response = CachedResponse {
        status,
        headers,
        body,
    };
    if cacheable && shareable && (200..300).contains(&status) {
        state.cache.set(&cache_key, &response, state.config.cache_ttl).await;
    }
    response.into_response_marked(if cacheable { "MISS" } else { "BYPASS" })
}
