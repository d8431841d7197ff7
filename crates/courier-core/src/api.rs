//! Request Interceptor: authenticated API calls with transparent token renewal.

use std::sync::Arc;

use courier_types::{AuthError, AuthResult};
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::RefreshCoordinator;
use crate::notify::{Notifier, SIGN_IN_AGAIN};
use crate::session::SessionStore;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, classify};

/// Sends requests with the current access token attached.
///
/// A response reporting an expired access token is recovered by one refresh
/// exchange and one replay of the original request. Every other failure is
/// returned unchanged.
#[derive(Clone)]
pub struct ApiClient {
    http: Arc<dyn HttpTransport>,
    session: Arc<SessionStore>,
    refresh: RefreshCoordinator,
    notifier: Arc<dyn Notifier>,
}

impl ApiClient {
    pub fn new(
        http: Arc<dyn HttpTransport>,
        session: Arc<SessionStore>,
        refresh: RefreshCoordinator,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            http,
            session,
            refresh,
            notifier,
        }
    }

    /// A request that expired while another caller was already renewing the
    /// token is replayed with the token that renewal produced instead of
    /// starting a second exchange. If the session is signed out or replaced
    /// while the renewal runs, the request is not replayed and the caller
    /// gets `SessionExpired`.
    ///
    /// # Errors
    /// - `SessionExpired` when the token could not be renewed, expired again
    ///   right after renewal, or the session ended before the replay.
    /// - `TransportFailure` if the request or the refresh exchange could not
    ///   reach the server.
    /// - `Rejected` for any other error status, untouched.
    pub async fn send(&self, request: ApiRequest) -> AuthResult<ApiResponse> {
        let epoch = self.session.epoch();
        let sent_with = self.session.access_token();
        match self.dispatch(&request, sent_with.clone()).await {
            Err(AuthError::AccessTokenExpired) => {}
            outcome => return outcome,
        }
        if self.session.epoch() != epoch {
            debug!(path = %request.path, epoch, "session ended while request was outstanding");
            return Err(AuthError::SessionExpired);
        }

        let token = match self.renewed_since(sent_with.as_deref()) {
            Some(token) => {
                debug!(path = %request.path, "access token already renewed; replaying");
                token
            }
            None => {
                debug!(path = %request.path, "access token expired; refreshing");
                match self.refresh.refresh().await {
                    Ok(token) => token,
                    Err(err) if err.ends_session() => return Err(AuthError::SessionExpired),
                    Err(err) => return Err(err),
                }
            }
        };

        if self.session.epoch() != epoch {
            debug!(path = %request.path, epoch, "session ended during renewal; not replaying");
            return Err(AuthError::SessionExpired);
        }

        match self.dispatch(&request, Some(token)).await {
            Err(AuthError::AccessTokenExpired) => {
                warn!(path = %request.path, "token expired again after renewal; ending session");
                if self.session.force_sign_out(epoch) {
                    self.notifier.notify(SIGN_IN_AGAIN);
                }
                Err(AuthError::SessionExpired)
            }
            outcome => outcome,
        }
    }

    /// `GET path`, returning the response payload.
    ///
    /// # Errors
    /// As [`send`](Self::send).
    pub async fn get(&self, path: &str) -> AuthResult<Value> {
        let response = self.send(ApiRequest::get(path)).await?;
        Ok(response.data().clone())
    }

    /// `POST path` with a JSON body, returning the response payload.
    ///
    /// # Errors
    /// As [`send`](Self::send).
    pub async fn post(&self, path: &str, body: Value) -> AuthResult<Value> {
        let response = self.send(ApiRequest::post(path).json(body)).await?;
        Ok(response.data().clone())
    }

    /// The session's current token, if it was renewed after `sent_with` went
    /// out and no exchange is still running.
    fn renewed_since(&self, sent_with: Option<&str>) -> Option<String> {
        if self.refresh.is_refreshing() {
            return None;
        }
        self.session
            .access_token()
            .filter(|current| Some(current.as_str()) != sent_with)
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<String>,
    ) -> AuthResult<ApiResponse> {
        let mut request = request.clone();
        request.bearer = token;
        classify(self.http.send(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use courier_types::Identity;
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use serde_json::json;

    use super::*;
    use crate::auth::{AuthApi, REFRESH_PATH};
    use crate::config::RefreshConfig;
    use crate::storage::{MemoryStorage, REFRESH_TOKEN_KEY, SecureStorage};
    use crate::testing::{RecordingNotifier, ScriptedHttp};

    struct Fixture {
        http: Arc<ScriptedHttp>,
        session: Arc<SessionStore>,
        notifier: Arc<RecordingNotifier>,
        client: ApiClient,
    }

    fn fixture(http: ScriptedHttp) -> Fixture {
        let http = Arc::new(http);
        fixture_over(Arc::clone(&http), Arc::clone(&http) as Arc<dyn HttpTransport>)
    }

    fn fixture_over(http: Arc<ScriptedHttp>, transport: Arc<dyn HttpTransport>) -> Fixture {
        let storage: Arc<dyn SecureStorage> =
            Arc::new(MemoryStorage::new().with_entry(REFRESH_TOKEN_KEY, "r1"));
        let session = Arc::new(SessionStore::new());
        session.set_user(Identity::new("Kim", "kim@example.com", "a1"));
        let notifier = Arc::new(RecordingNotifier::default());
        let refresh = RefreshCoordinator::new(
            AuthApi::new(Arc::clone(&transport), RefreshConfig::default()),
            storage,
            Arc::clone(&session),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
        );
        let client = ApiClient::new(
            transport,
            Arc::clone(&session),
            refresh,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
        );
        Fixture {
            http,
            session,
            notifier,
            client,
        }
    }

    fn expired() -> AuthResult<ApiResponse> {
        Ok(ApiResponse::new(419, json!({"code": "expired"})))
    }

    /// `/orders` accepts only `a2`; `/refreshToken` hands out `a2`.
    fn server(request: &ApiRequest) -> AuthResult<ApiResponse> {
        if request.path == REFRESH_PATH {
            return Ok(ApiResponse::new(200, json!({"data": {"accessToken": "a2"}})));
        }
        match request.bearer.as_deref() {
            Some("a2") => Ok(ApiResponse::new(200, json!({"data": ["o-1"]}))),
            _ => expired(),
        }
    }

    /// Delays each request carrying the stale `a1` token by the next entry of
    /// `stale`, and every refresh exchange by 10ms, before handing it to the
    /// recording script.
    struct StaggeredHttp {
        stale: Mutex<VecDeque<Duration>>,
        script: Arc<ScriptedHttp>,
    }

    impl HttpTransport for StaggeredHttp {
        fn send(&self, request: ApiRequest) -> BoxFuture<'_, AuthResult<ApiResponse>> {
            let delay = if request.path == REFRESH_PATH {
                Duration::from_millis(10)
            } else if request.bearer.as_deref() == Some("a1") {
                self.stale
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_default()
            } else {
                Duration::ZERO
            };
            async move {
                tokio::time::sleep(delay).await;
                self.script.send(request).await
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_success_passes_through_with_bearer() {
        let fx = fixture(ScriptedHttp::new(|request| {
            assert_eq!(request.bearer.as_deref(), Some("a1"));
            Ok(ApiResponse::new(200, json!({"data": {"ok": true}})))
        }));

        let data = fx.client.get("/orders").await.unwrap();
        assert_eq!(data, json!({"ok": true}));
        assert_eq!(fx.http.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_replayed() {
        let fx = fixture(ScriptedHttp::new(server));

        let data = fx.client.get("/orders").await.unwrap();
        assert_eq!(data, json!(["o-1"]));
        assert_eq!(fx.http.count_path(REFRESH_PATH), 1);
        assert_eq!(fx.http.count_path("/orders"), 2);
        assert_eq!(fx.session.access_token().as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn test_concurrent_expiries_share_one_refresh() {
        let fx = fixture(ScriptedHttp::new(server).with_delay(Duration::from_millis(10)));

        let (a, b, c) = tokio::join!(
            fx.client.get("/orders"),
            fx.client.get("/orders"),
            fx.client.get("/orders")
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(fx.http.count_path(REFRESH_PATH), 1);
        let replays = fx
            .http
            .requests()
            .into_iter()
            .filter(|request| request.path == "/orders" && request.bearer.as_deref() == Some("a2"))
            .count();
        assert_eq!(replays, 3);
    }

    #[tokio::test]
    async fn test_late_expiry_replays_with_already_renewed_token() {
        let script = Arc::new(ScriptedHttp::new(server));
        let transport = Arc::new(StaggeredHttp {
            stale: Mutex::new(VecDeque::from([
                Duration::from_millis(5),
                Duration::from_millis(100),
            ])),
            script: Arc::clone(&script),
        });
        let fx = fixture_over(script, transport);

        let (a, b) = tokio::join!(fx.client.get("/orders"), fx.client.get("/orders"));

        assert_eq!(a.unwrap(), json!(["o-1"]));
        assert_eq!(b.unwrap(), json!(["o-1"]));
        assert_eq!(fx.http.count_path(REFRESH_PATH), 1);
        let replays = fx
            .http
            .requests()
            .into_iter()
            .filter(|request| request.path == "/orders" && request.bearer.as_deref() == Some("a2"))
            .count();
        assert_eq!(replays, 2);
        assert!(fx.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_sign_out_during_renewal_skips_replay() {
        let fx = fixture(ScriptedHttp::new(server).with_delay(Duration::from_millis(20)));

        let sign_out = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            fx.session.clear();
        };
        let (result, ()) = tokio::join!(fx.client.get("/orders"), sign_out);

        assert_eq!(result.unwrap_err(), AuthError::SessionExpired);
        assert_eq!(fx.http.count_path(REFRESH_PATH), 1);
        assert_eq!(fx.http.count_path("/orders"), 1);
        assert!(!fx.session.is_logged_in());
        assert_eq!(fx.session.access_token(), None);
        assert!(fx.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_second_expiry_is_session_expired() {
        let fx = fixture(ScriptedHttp::new(|request| {
            if request.path == REFRESH_PATH {
                Ok(ApiResponse::new(200, json!({"data": {"accessToken": "a2"}})))
            } else {
                expired()
            }
        }));

        let err = fx.client.get("/orders").await.unwrap_err();
        assert_eq!(err, AuthError::SessionExpired);
        assert_eq!(fx.http.count_path("/orders"), 2);
        assert_eq!(fx.http.count_path(REFRESH_PATH), 1);
        assert!(!fx.session.is_logged_in());
        assert_eq!(fx.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_pass_through_without_retry() {
        let fx = fixture(ScriptedHttp::new(|_| {
            Ok(ApiResponse::new(419, json!({"code": "forbidden", "message": "nope"})))
        }));

        let err = fx.client.get("/orders").await.unwrap_err();
        assert_eq!(
            err,
            AuthError::Rejected {
                status: 419,
                code: Some("forbidden".to_string()),
                message: "nope".to_string(),
            }
        );
        assert_eq!(fx.http.calls(), 1);
        assert!(fx.session.is_logged_in());
    }

    #[tokio::test]
    async fn test_refused_refresh_surfaces_session_expired() {
        let fx = fixture(ScriptedHttp::new(|request| {
            if request.path == REFRESH_PATH {
                Ok(ApiResponse::new(403, json!({"code": "invalid"})))
            } else {
                expired()
            }
        }));

        let err = fx.client.post("/accept", json!({"orderId": "o-1"})).await.unwrap_err();
        assert_eq!(err, AuthError::SessionExpired);
        assert!(!fx.session.is_logged_in());
        assert_eq!(fx.notifier.messages(), vec![SIGN_IN_AGAIN.to_string()]);
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let fx = fixture(ScriptedHttp::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AuthError::transport("offline"))
        }));

        let err = fx.client.get("/orders").await.unwrap_err();
        assert!(matches!(err, AuthError::TransportFailure(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
