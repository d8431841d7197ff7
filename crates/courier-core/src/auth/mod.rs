//! Authentication endpoint calls and the coordinators built on them.
//!
//! Endpoints (relative to `api_url`):
//! - `POST /refreshToken` with `Authorization: Bearer <refreshToken>`
//! - `POST /login` with `{email, password}`
//! - `POST /user` with `{email, name, password}`
//! - `POST /logout` with the access token
//!
//! Successful responses wrap the payload as `{data: {...}}`.

use std::sync::Arc;

use courier_types::{AuthError, AuthResult, Identity};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::RefreshConfig;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, classify};

mod refresh;
mod rehydrate;

pub use refresh::RefreshCoordinator;
pub use rehydrate::{RehydrateOutcome, Rehydrator};

pub const REFRESH_PATH: &str = "/refreshToken";
pub const LOGIN_PATH: &str = "/login";
pub const SIGN_UP_PATH: &str = "/user";
pub const LOGOUT_PATH: &str = "/logout";

/// Credentials issued by a login or refresh exchange.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub access_token: String,
    /// Present only when the server rotates the refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenGrant {
    pub fn identity(&self) -> Identity {
        Identity::new(&self.name, &self.email, &self.access_token)
    }

    fn from_response(response: &ApiResponse) -> AuthResult<Self> {
        let grant: Self = serde_json::from_value(response.data().clone()).map_err(|err| {
            AuthError::transport(format!("malformed token response: {err}"))
        })?;
        if grant.access_token.is_empty() {
            return Err(AuthError::transport("token response without accessToken"));
        }
        Ok(grant)
    }
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("identity", &self.identity())
            .field("rotates_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// A 4xx from the refresh endpoint, except the ones that only say "not now".
fn is_refusal(status: u16) -> bool {
    (400..500).contains(&status) && !matches!(status, 408 | 429)
}

/// Thin client for the authentication endpoints.
#[derive(Clone)]
pub struct AuthApi {
    http: Arc<dyn HttpTransport>,
    retry: RefreshConfig,
}

impl AuthApi {
    pub fn new(http: Arc<dyn HttpTransport>, retry: RefreshConfig) -> Self {
        Self { http, retry }
    }

    /// Exchanges a refresh token for a fresh access token.
    ///
    /// Transport failures, 5xx, 408 and 429 responses are retried with capped
    /// exponential backoff; any other 4xx means the refresh token itself was
    /// refused.
    ///
    /// # Errors
    /// `SessionExpired` when the refresh token is refused, `TransportFailure`
    /// once retries are exhausted.
    pub async fn exchange_refresh_token(&self, refresh_token: &str) -> AuthResult<TokenGrant> {
        let attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            let request = ApiRequest::post(REFRESH_PATH)
                .json(json!({}))
                .bearer(refresh_token);
            let failure = match self.http.send(request).await {
                Ok(response) if response.is_success() => {
                    return TokenGrant::from_response(&response);
                }
                Ok(response) if is_refusal(response.status) => {
                    debug!(status = response.status, "refresh token refused");
                    return Err(AuthError::SessionExpired);
                }
                Ok(response) => AuthError::transport(format!(
                    "refresh endpoint returned HTTP {}",
                    response.status
                )),
                Err(err) => err,
            };

            attempt += 1;
            if attempt >= attempts {
                warn!(attempts, error = %failure, "refresh exchange failed");
                return Err(failure);
            }
            let delay = self.retry.backoff(attempt - 1);
            debug!(attempt, ?delay, error = %failure, "retrying refresh exchange");
            tokio::time::sleep(delay).await;
        }
    }

    /// Signs in with email and password.
    ///
    /// # Errors
    /// `Rejected` with the server's message for bad credentials,
    /// `TransportFailure` if the server cannot be reached.
    pub async fn login(&self, email: &str, password: &str) -> AuthResult<TokenGrant> {
        let request = ApiRequest::post(LOGIN_PATH).json(json!({
            "email": email,
            "password": password,
        }));
        let response = classify(self.http.send(request).await?)?;
        TokenGrant::from_response(&response)
    }

    /// Registers a new account. Does not sign in.
    ///
    /// # Errors
    /// `Rejected` if the server refuses the registration.
    pub async fn sign_up(&self, email: &str, name: &str, password: &str) -> AuthResult<()> {
        let request = ApiRequest::post(SIGN_UP_PATH).json(json!({
            "email": email,
            "name": name,
            "password": password,
        }));
        classify(self.http.send(request).await?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::testing::ScriptedHttp;

    fn fast_retry(max_attempts: u32) -> RefreshConfig {
        RefreshConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_refresh_exchange_parses_grant() {
        let http = Arc::new(ScriptedHttp::new(|request| {
            assert_eq!(request.path, REFRESH_PATH);
            assert_eq!(request.bearer.as_deref(), Some("r1"));
            Ok(ApiResponse::new(
                200,
                json!({"data": {"name": "Kim", "email": "kim@example.com", "accessToken": "a2"}}),
            ))
        }));
        let api = AuthApi::new(http, fast_retry(3));

        let grant = api.exchange_refresh_token("r1").await.unwrap();
        assert_eq!(grant.access_token, "a2");
        assert_eq!(grant.identity().email, "kim@example.com");
        assert!(grant.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_refresh_exchange_4xx_is_session_expired_without_retry() {
        let http = Arc::new(ScriptedHttp::new(|_| {
            Ok(ApiResponse::new(419, json!({"code": "expired"})))
        }));
        let api = AuthApi::new(Arc::clone(&http) as Arc<dyn HttpTransport>, fast_retry(3));

        let err = api.exchange_refresh_token("r1").await.unwrap_err();
        assert_eq!(err, AuthError::SessionExpired);
        assert_eq!(http.count_path(REFRESH_PATH), 1);
    }

    #[tokio::test]
    async fn test_refresh_exchange_retries_transport_failures() {
        let http = Arc::new(ScriptedHttp::new(|_| Err(AuthError::transport("refused"))));
        let api = AuthApi::new(Arc::clone(&http) as Arc<dyn HttpTransport>, fast_retry(3));

        let err = api.exchange_refresh_token("r1").await.unwrap_err();
        assert_eq!(err, AuthError::transport("refused"));
        assert_eq!(http.count_path(REFRESH_PATH), 3);
    }

    #[tokio::test]
    async fn test_refresh_exchange_recovers_after_server_error() {
        let http = Arc::new(ScriptedHttp::sequence(vec![
            Ok(ApiResponse::new(503, json!("unavailable"))),
            Ok(ApiResponse::new(200, json!({"data": {"accessToken": "a2"}}))),
        ]));
        let api = AuthApi::new(Arc::clone(&http) as Arc<dyn HttpTransport>, fast_retry(3));

        let grant = api.exchange_refresh_token("r1").await.unwrap();
        assert_eq!(grant.access_token, "a2");
        assert_eq!(http.count_path(REFRESH_PATH), 2);
    }

    #[tokio::test]
    async fn test_refresh_exchange_retries_throttling_and_timeouts() {
        let http = Arc::new(ScriptedHttp::sequence(vec![
            Ok(ApiResponse::new(429, json!({"message": "slow down"}))),
            Ok(ApiResponse::new(408, json!(null))),
            Ok(ApiResponse::new(200, json!({"data": {"accessToken": "a2"}}))),
        ]));
        let api = AuthApi::new(Arc::clone(&http) as Arc<dyn HttpTransport>, fast_retry(3));

        let grant = api.exchange_refresh_token("r1").await.unwrap();
        assert_eq!(grant.access_token, "a2");
        assert_eq!(http.count_path(REFRESH_PATH), 3);
    }

    #[test]
    fn test_refusal_statuses() {
        for status in [400, 401, 403, 404, 419] {
            assert!(is_refusal(status), "{status}");
        }
        for status in [200, 408, 429, 500, 503] {
            assert!(!is_refusal(status), "{status}");
        }
    }

    #[tokio::test]
    async fn test_refresh_exchange_rejects_malformed_body() {
        let http = Arc::new(ScriptedHttp::new(|_| {
            Ok(ApiResponse::new(200, json!({"data": {"name": "Kim"}})))
        }));
        let api = AuthApi::new(http, fast_retry(1));

        let err = api.exchange_refresh_token("r1").await.unwrap_err();
        assert!(matches!(err, AuthError::TransportFailure(ref msg) if msg.contains("malformed")));
    }

    #[tokio::test]
    async fn test_login_rejected_passes_server_message() {
        let http = Arc::new(
            ScriptedHttp::new(|_| {
                Ok(ApiResponse::new(
                    401,
                    json!({"message": "wrong password"}),
                ))
            })
            .with_delay(Duration::from_millis(1)),
        );
        let api = AuthApi::new(http, fast_retry(1));

        let err = api.login("kim@example.com", "nope").await.unwrap_err();
        assert_eq!(err.to_string(), "request rejected (HTTP 401): wrong password");
    }

    #[test]
    fn test_token_grant_debug_hides_tokens() {
        let grant = TokenGrant {
            name: "Kim".to_string(),
            email: "kim@example.com".to_string(),
            access_token: "access-token-value-long-enough".to_string(),
            refresh_token: Some("refresh-token-secret".to_string()),
        };
        let debug = format!("{grant:?}");
        assert!(!debug.contains("refresh-token-secret"));
        assert!(!debug.contains("value-long-enough"));
    }
}
