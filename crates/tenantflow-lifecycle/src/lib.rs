//! TenantFlow resource lifecycle engine
//!
//! Drives tenant-platform resources (environments, groups, connections,
//! settings) through create / read / update / delete against REST control
//! planes that answer either synchronously or with a long-running operation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              host (tenantflow CLI, ...)         │
//! │     create / read / update / delete calls       │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               tenantflow-lifecycle              │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │          ResourceController              │   │
//! │  └──────┬──────────────────────────┬────────┘   │
//! │  ┌──────▼───────┐          ┌───────▼────────┐   │
//! │  │    Poller    │          │   Reconciler   │   │
//! │  └──────┬───────┘          └────────────────┘   │
//! │  ┌──────▼───────┐  ┌──────────────┐             │
//! │  │ RetryPolicy  │  │ RateLimiter  │             │
//! │  └──────────────┘  └──────────────┘             │
//! └─────────────────┬───────────────────────────────┘
//!                   │ trait RequestExecutor
//! ┌─────────────────▼───────────────────────────────┐
//! │         tenantflow-http (reqwest + token)       │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod controller;
pub mod desired;
pub mod error;
pub mod executor;
pub mod operation;
pub mod patch;
pub mod poller;
pub mod rate_limit;
pub mod reconcile;
pub mod retry;

// Re-exports
pub use clock::{Clock, ManualClock, TokioClock};
pub use controller::{
    Created, DEFAULT_OPERATION_TIMEOUT, IdentityKey, LifecyclePhase, ResourceController,
    ResourceDescriptor, ResourceRecord, UpdateMode,
};
pub use desired::{Desired, DesiredState};
pub use error::{LifecycleError, Result};
pub use executor::{
    MAX_RETRY_AFTER, Method, Request, RequestExecutor, Response, parse_retry_after,
};
pub use operation::{Operation, OperationStatus};
pub use poller::Poller;
pub use rate_limit::{RateLimitConfig, RateLimitGuard, RateLimitedExecutor, RateLimiter};
pub use reconcile::{FieldPath, Patch, PatchEntry, PathSegment, Reconciler, restrict};
pub use retry::{ErrorClass, RetryPolicy, RetryableKind};
