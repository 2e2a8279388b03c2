//! Lifecycle error types

use std::time::Duration;

use thiserror::Error;

use crate::reconcile::FieldPath;

/// Errors surfaced by the lifecycle engine
///
/// Transient variants are retried by [`crate::RetryPolicy`] and only reach
/// the host wrapped in [`LifecycleError::RetriesExhausted`].
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Transport error: {0}")]
    TransientNetwork(String),

    #[error("Throttled by remote API (retry hint: {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    #[error("Remote server error: HTTP {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Resource is still provisioning: {0}")]
    StillProvisioning(String),

    #[error("Request rejected: HTTP {status}: {message}")]
    Validation { status: u16, message: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Operation failed: {detail}")]
    OperationFailed { detail: serde_json::Value },

    #[error(
        "Timed out after {elapsed:?} waiting for operation {locator}; \
         the resource may exist, read it before retrying"
    )]
    Timeout { locator: String, elapsed: Duration },

    #[error("Canceled while waiting for operation {locator}")]
    Canceled { locator: String },

    #[error("Update partially applied ({} field(s) applied): {source}", .applied.len())]
    PartialUpdate {
        applied: Vec<FieldPath>,
        #[source]
        source: Box<LifecycleError>,
    },

    #[error("Gave up after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<LifecycleError>,
    },

    #[error("Invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Could not determine resource identifier: {0}")]
    MissingIdentifier(String),

    #[error("Invalid desired state: {0}")]
    InvalidDesiredState(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LifecycleError {
    /// Stable, machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::TransientNetwork(_) => "transient_network",
            LifecycleError::Throttled { .. } => "throttled",
            LifecycleError::ServerError { .. } => "server_error",
            LifecycleError::StillProvisioning(_) => "still_provisioning",
            LifecycleError::Validation { .. } => "validation",
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::Conflict(_) => "conflict",
            LifecycleError::MalformedResponse(_) => "malformed_response",
            LifecycleError::OperationFailed { .. } => "operation_failed",
            LifecycleError::Timeout { .. } => "timeout",
            LifecycleError::Canceled { .. } => "canceled",
            LifecycleError::PartialUpdate { .. } => "partial_update",
            LifecycleError::RetriesExhausted { source, .. } => source.kind(),
            LifecycleError::InvalidTransition { .. } => "invalid_transition",
            LifecycleError::MissingIdentifier(_) => "missing_identifier",
            LifecycleError::InvalidDesiredState(_) => "invalid_desired_state",
            LifecycleError::Json(_) => "malformed_response",
        }
    }

    /// Message reported by the remote system, when there is one.
    pub fn remote_detail(&self) -> Option<String> {
        match self {
            LifecycleError::ServerError { body, .. } => Some(body.clone()),
            LifecycleError::StillProvisioning(m)
            | LifecycleError::NotFound(m)
            | LifecycleError::Conflict(m) => Some(m.clone()),
            LifecycleError::Validation { message, .. } => Some(message.clone()),
            LifecycleError::OperationFailed { detail } => Some(detail.to_string()),
            LifecycleError::PartialUpdate { source, .. }
            | LifecycleError::RetriesExhausted { source, .. } => source.remote_detail(),
            _ => None,
        }
    }

    /// Whether this is (or wraps) a remote 404.
    pub fn is_not_found(&self) -> bool {
        match self {
            LifecycleError::NotFound(_) => true,
            LifecycleError::RetriesExhausted { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
