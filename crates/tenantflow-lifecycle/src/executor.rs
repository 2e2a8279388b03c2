//! Request-executor contract
//!
//! The engine never talks HTTP itself. It hands a [`Request`] to an injected
//! [`RequestExecutor`] (which owns transport and authentication) and only
//! inspects the status code, the poll-locator and retry-hint headers, and
//! the decoded body of the [`Response`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LifecycleError, Result};

pub const HEADER_LOCATION: &str = "location";
pub const HEADER_OPERATION_LOCATION: &str = "operation-location";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Body marker of a 409 caused by another lifecycle operation in flight.
const BUSY_CONFLICT_MARKER: &str = "OperationNotStartable";

/// Longest retry hint honored; larger hints are clamped to it.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Execute one request.
    ///
    /// Transport failures (connect, reset, timeout) must be reported as
    /// [`LifecycleError::TransientNetwork`]; any HTTP status, including
    /// errors, is returned as a [`Response`].
    async fn execute(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl<T: RequestExecutor + ?Sized> RequestExecutor for Arc<T> {
    async fn execute(&self, request: Request) -> Result<Response> {
        (**self).execute(request).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Patch => write!(f, "PATCH"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Whether the URL carries a scheme and authority.
    pub fn is_absolute(&self) -> bool {
        self.url.contains("://")
    }

    /// API family of the request: the URL authority (`host[:port]`).
    pub fn family(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        rest.split(['/', '?']).next().unwrap_or(rest)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub status: u16,
    headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Header names are case-insensitive.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `Location`, falling back to `Operation-Location`.
    pub fn poll_locator(&self) -> Option<&str> {
        self.header(HEADER_LOCATION)
            .or_else(|| self.header(HEADER_OPERATION_LOCATION))
            .filter(|l| !l.trim().is_empty())
    }

    /// A 202 with a poll locator: the work continues asynchronously.
    pub fn is_pending(&self) -> bool {
        self.status == 202 && self.poll_locator().is_some()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.header(HEADER_RETRY_AFTER).and_then(parse_retry_after)
    }

    pub fn body_text(&self) -> String {
        match &self.body {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    /// Map non-2xx statuses onto the error taxonomy.
    pub fn error_for_status(self) -> Result<Response> {
        if self.is_success() {
            return Ok(self);
        }
        let body = self.body_text();
        let err = match self.status {
            404 => LifecycleError::NotFound(body),
            409 if body.contains(BUSY_CONFLICT_MARKER) => LifecycleError::StillProvisioning(body),
            409 => LifecycleError::Conflict(body),
            408 => LifecycleError::TransientNetwork(format!("HTTP 408: {}", body)),
            425 | 429 => LifecycleError::Throttled {
                retry_after: self.retry_after(),
            },
            status @ 500..=599 => LifecycleError::ServerError { status, body },
            status => LifecycleError::Validation {
                status,
                message: body,
            },
        };
        Err(err)
    }
}

/// Parse a retry hint.
///
/// Accepts plain seconds (`"2"`, `"1.5"`) and unit-suffixed values
/// (`"500ms"`, `"2s"`, `"1m"`). Values above [`MAX_RETRY_AFTER`] are clamped.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (number, scale) = if let Some(n) = raw.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = raw.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = raw.strip_suffix('m') {
        (n, 60.0)
    } else {
        (raw, 1.0)
    };
    let value: f64 = number.trim().parse().ok()?;
    if value.is_nan() || value < 0.0 {
        return None;
    }
    let secs = value * scale;
    if secs >= MAX_RETRY_AFTER.as_secs_f64() {
        return Some(MAX_RETRY_AFTER);
    }
    Duration::try_from_secs_f64(secs).ok()
}
