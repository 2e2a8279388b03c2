//! Long-running operation model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LifecycleError, Result};
use crate::executor::Response;

/// Status of a remote long-running operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Running)
    }

    /// Map a remote status string. Unknown non-terminal wording counts as
    /// running.
    pub fn from_remote(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "succeeded" | "success" | "completed" => OperationStatus::Succeeded,
            "failed" | "failure" => OperationStatus::Failed,
            "canceled" | "cancelled" => OperationStatus::Canceled,
            _ => OperationStatus::Running,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Running => write!(f, "running"),
            OperationStatus::Succeeded => write!(f, "succeeded"),
            OperationStatus::Failed => write!(f, "failed"),
            OperationStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// Read the status field of a status-poll body.
///
/// Looked up in order: `status`, `state.id`, `state`,
/// `properties.provisioningState`.
pub fn status_from_body(body: &Value) -> Result<OperationStatus> {
    let raw = ["/status", "/state/id", "/state", "/properties/provisioningState"]
        .iter()
        .find_map(|pointer| body.pointer(pointer).and_then(Value::as_str))
        .ok_or_else(|| {
            LifecycleError::MalformedResponse(format!("no operation status in body: {}", body))
        })?;
    Ok(OperationStatus::from_remote(raw))
}

/// An in-flight remote operation
///
/// Only the poller mutates it; everything needed to resume polling after a
/// restart is the `locator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,

    /// Resource the operation acts on (e.g. "environment/env-1")
    pub target: String,

    pub status: OperationStatus,

    /// URL polled for status
    pub locator: String,

    pub created_at: DateTime<Utc>,

    pub last_polled_at: Option<DateTime<Utc>>,

    /// `result` member of the final status body, when the remote sent one
    pub result: Option<Value>,

    /// Most recent status body
    #[serde(default)]
    pub last_body: Option<Value>,

    /// Remote failure detail, set once failed or canceled
    pub failure: Option<Value>,
}

impl Operation {
    pub fn new(target: impl Into<String>, locator: impl Into<String>, now: DateTime<Utc>) -> Self {
        let locator = locator.into();
        let id = locator
            .split('?')
            .next()
            .and_then(|path| path.trim_end_matches('/').rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .unwrap_or(&locator)
            .to_string();
        Self {
            id,
            target: target.into(),
            status: OperationStatus::Running,
            locator,
            created_at: now,
            last_polled_at: None,
            result: None,
            last_body: None,
            failure: None,
        }
    }

    /// Build an operation from an "accepted" response, if it is one.
    pub fn from_accepted(
        target: impl Into<String>,
        response: &Response,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if !response.is_pending() {
            return None;
        }
        response
            .poll_locator()
            .map(|locator| Self::new(target, locator, now))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply one status-poll body. Terminal states never change again.
    pub fn record_poll(&mut self, body: Value, now: DateTime<Utc>) -> Result<OperationStatus> {
        let next = status_from_body(&body)?;
        if self.status.is_terminal() && next != self.status {
            return Err(LifecycleError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.last_polled_at = Some(now);
        self.status = next;
        match next {
            OperationStatus::Running => {}
            OperationStatus::Succeeded => {
                self.result = body.get("result").filter(|r| !r.is_null()).cloned();
            }
            OperationStatus::Failed | OperationStatus::Canceled => {
                self.failure = Some(match body.get("error") {
                    Some(error) if !error.is_null() => error.clone(),
                    _ => body.clone(),
                });
            }
        }
        self.last_body = Some(body);
        Ok(next)
    }
}
