//! reqwest-backed request executor

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tenantflow_lifecycle::{LifecycleError, Method, Request, RequestExecutor, Response};
use tracing::{debug, trace};

use crate::error::{HttpError, Result};

/// Environment variable holding the bearer token unless configured otherwise
pub const DEFAULT_TOKEN_ENV: &str = "TENANTFLOW_TOKEN";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

/// Remote API connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Prefix for relative request URLs (e.g. `/environments`)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Name of the environment variable that holds the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Per-request transport timeout, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            token_env: default_token_env(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ApiSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::default()
        }
    }

    /// Absolute URL for `url`, joining relative paths onto `base_url`.
    pub fn resolve(&self, url: &str) -> Result<String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(url.to_string());
        }
        let base = self.base_url.as_deref().ok_or_else(|| {
            HttpError::InvalidSettings(format!("relative URL '{}' without api.base_url", url))
        })?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        ))
    }
}

pub struct HttpExecutor {
    client: reqwest::Client,
    settings: ApiSettings,
    token: Option<String>,
}

impl HttpExecutor {
    /// Executor without credentials.
    pub fn new(settings: ApiSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .user_agent(concat!("tenantflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            settings,
            token: None,
        })
    }

    /// Executor authenticated with the token found in `settings.token_env`.
    pub fn from_env(settings: ApiSettings) -> Result<Self> {
        let token = std::env::var(&settings.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| HttpError::MissingToken(settings.token_env.clone()))?;
        Ok(Self::new(settings)?.with_token(token))
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn settings(&self) -> &ApiSettings {
        &self.settings
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn transport_error(err: reqwest::Error) -> LifecycleError {
    if err.is_builder() {
        LifecycleError::Validation {
            status: 0,
            message: format!("invalid request: {}", err),
        }
    } else {
        LifecycleError::TransientNetwork(err.to_string())
    }
}

/// JSON when it parses, the raw text otherwise.
fn decode_body(bytes: &[u8]) -> Option<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(
        serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
    )
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, request: Request) -> tenantflow_lifecycle::Result<Response> {
        let url = self
            .settings
            .resolve(&request.url)
            .map_err(|e| LifecycleError::Validation {
                status: 0,
                message: e.to_string(),
            })?;
        debug!(method = %request.method, url = %url, "Sending request");

        let mut builder = self.client.request(to_reqwest(request.method), &url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let reply = builder.send().await.map_err(transport_error)?;
        let mut response = Response::new(reply.status().as_u16());
        for (name, value) in reply.headers() {
            if let Ok(value) = value.to_str() {
                response = response.with_header(name.as_str(), value);
            }
        }

        let bytes = reply.bytes().await.map_err(transport_error)?;
        if let Some(body) = decode_body(&bytes) {
            response = response.with_body(body);
        }
        trace!(status = response.status, url = %url, "Received response");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let settings = ApiSettings::new("https://api.example.com/v1/");
        assert_eq!(
            settings.resolve("/environments").unwrap(),
            "https://api.example.com/v1/environments"
        );
        assert_eq!(
            settings.resolve("https://ops.example.com/op/1").unwrap(),
            "https://ops.example.com/op/1"
        );
        assert!(matches!(
            ApiSettings::default().resolve("/environments"),
            Err(HttpError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(b""), None);
        assert_eq!(decode_body(b"  \n"), None);
        assert_eq!(
            decode_body(br#"{"id":"env-1"}"#),
            Some(serde_json::json!({"id": "env-1"}))
        );
        assert_eq!(
            decode_body(b"Service Unavailable"),
            Some(Value::String("Service Unavailable".into()))
        );
    }

    #[test]
    fn test_settings_defaults() {
        let settings: ApiSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.token_env, DEFAULT_TOKEN_ENV);
        assert_eq!(settings.request_timeout_secs, 60);
        assert!(settings.base_url.is_none());
    }

    #[test]
    fn test_from_env() {
        temp_env::with_var("TENANTFLOW_TEST_TOKEN", Some("secret"), || {
            let settings = ApiSettings {
                token_env: "TENANTFLOW_TEST_TOKEN".into(),
                ..ApiSettings::default()
            };
            let executor = HttpExecutor::from_env(settings).unwrap();
            assert_eq!(executor.token.as_deref(), Some("secret"));
        });

        temp_env::with_var_unset("TENANTFLOW_TEST_TOKEN", || {
            let settings = ApiSettings {
                token_env: "TENANTFLOW_TEST_TOKEN".into(),
                ..ApiSettings::default()
            };
            assert!(matches!(
                HttpExecutor::from_env(settings),
                Err(HttpError::MissingToken(name)) if name == "TENANTFLOW_TEST_TOKEN"
            ));
        });
    }
}
