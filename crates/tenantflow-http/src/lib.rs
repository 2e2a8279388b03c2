//! HTTP transport for TenantFlow
//!
//! Implements [`tenantflow_lifecycle::RequestExecutor`] on top of `reqwest`.
//! The executor owns transport and authentication: it resolves relative
//! URLs against the configured base URL, attaches the bearer token and
//! decodes response bodies. Every HTTP status, errors included, is handed
//! back to the lifecycle engine as a plain response.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tenantflow_http::{ApiSettings, HttpExecutor};
//!
//! let settings = ApiSettings::new("https://api.example.com");
//! let executor = Arc::new(HttpExecutor::from_env(settings)?);
//! ```

pub mod error;
pub mod executor;

pub use error::{HttpError, Result};
pub use executor::{ApiSettings, DEFAULT_TOKEN_ENV, HttpExecutor};
