use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("sweep probability must be within [0, 1], got {0}")]
    SweepProbability(f64),
    #[error("cache url is set but no cache token was given")]
    MissingCacheToken,
    #[error("cache timeout must stay below 500ms, got {0:?}")]
    CacheTimeout(Duration),
    #[error("invalid upstream url '{0}'")]
    Upstream(String),
}

// Failure talking to the remote cache. Never leaves the cache module's public API.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("remote cache request failed: {0}")]
    Transport(String),
    #[error("remote cache timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote cache answered HTTP {0}")]
    Status(u16),
    #[error("malformed remote cache reply: {0}")]
    Malformed(String),
    #[error("remote cache error: {0}")]
    Remote(String),
}

impl CacheError {
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            CacheError::Timeout(timeout)
        } else if err.is_decode() {
            CacheError::Malformed(err.to_string())
        } else {
            CacheError::Transport(err.to_string())
        }
    }
}

// JSON body of every policy denial.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
}

// Terminal response produced by a policy stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    pub status: StatusCode,
    pub body: DenialBody,
}

impl Denial {
    fn new(status: StatusCode, error: &str) -> Self {
        Self {
            status,
            body: DenialBody {
                error: error.to_string(),
                message: None,
                retry_after: None,
                limit: None,
                window_ms: None,
            },
        }
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "Access denied")
            .with_message("Your request has been blocked.")
    }

    // Same shape as an unknown route so scanners learn nothing.
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not found")
    }

    pub fn too_many_requests(retry_after: u64) -> Self {
        let mut denial = Self::new(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
        denial.body.retry_after = Some(retry_after);
        denial
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.body.message = Some(message.into());
        self
    }

    pub fn with_limit(mut self, limit: u64, window_ms: u64) -> Self {
        self.body.limit = Some(limit);
        self.body.window_ms = Some(window_ms);
        self
    }
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        let retry_after = self.body.retry_after;
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert("retry-after", HeaderValue::from(secs));
        }
        response
    }
}
