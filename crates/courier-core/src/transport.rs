//! HTTP collaborator boundary.
//!
//! Requests are plain data so the interceptor can replay them. The transport
//! only reports transport-level failures; turning a status into an
//! [`AuthError`] is [`classify`]'s job.

use std::time::Duration;

use courier_types::{AuthError, AuthResult};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

/// Standard User-Agent header for courier API requests.
pub const USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

/// Status the server uses for token expiry, paired with `code: "expired"`.
pub const TOKEN_EXPIRED_STATUS: u16 = 419;
pub const TOKEN_EXPIRED_CODE: &str = "expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// A replayable API request. `path` is relative to the configured base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Bearer credential; set by the interceptor, not by callers.
    pub bearer: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            bearer: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

/// Raw response: status plus JSON body (`Null` when empty, a string when the
/// body is not JSON).
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `data` envelope the server wraps payloads in, or the whole body.
    pub fn data(&self) -> &Value {
        self.body.get("data").unwrap_or(&self.body)
    }
}

/// Executes HTTP requests.
pub trait HttpTransport: Send + Sync {
    /// Sends one request. Errors only for transport-level failures
    /// ([`AuthError::TransportFailure`]); HTTP error statuses come back as
    /// responses.
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, AuthResult<ApiResponse>>;
}

/// Maps a raw response onto the tagged outcome.
///
/// # Errors
/// `AccessTokenExpired` for `419 {code: "expired"}`, `Rejected` for any other
/// non-2xx status.
pub fn classify(response: ApiResponse) -> AuthResult<ApiResponse> {
    if response.is_success() {
        return Ok(response);
    }
    if is_token_expired(&response) {
        return Err(AuthError::AccessTokenExpired);
    }
    Err(AuthError::rejected(response.status, &response.body))
}

fn is_token_expired(response: &ApiResponse) -> bool {
    response.status == TOKEN_EXPIRED_STATUS
        && response.body.get("code").and_then(Value::as_str) == Some(TOKEN_EXPIRED_CODE)
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    /// Creates a transport rooted at `base_url` with a per-request timeout.
    ///
    /// # Errors
    /// Returns an error if the underlying client cannot be built (TLS backend
    /// initialisation).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AuthResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(AuthError::transport)?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    async fn execute(&self, request: ApiRequest) -> AuthResult<ApiResponse> {
        let url = self.url_for(&request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.http.request(method, &url);
        if let Some(token) = request.bearer.as_deref() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(AuthError::transport)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(AuthError::transport)?;
        debug!(%url, status, "http exchange finished");

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(ApiResponse { status, body })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, AuthResult<ApiResponse>> {
        self.execute(request).boxed()
    }
}
