//! Tagged failures at the collaborator boundary.

use serde_json::Value;

/// Failure taxonomy for authenticated traffic.
///
/// `Clone` because a single refresh exchange settles every waiter with the
/// same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Network or server unreachable. Never retried by the interceptor.
    #[error("transport failure: {0}")]
    TransportFailure(String),
    /// The access token expired. Recoverable through a refresh exchange.
    #[error("access token expired")]
    AccessTokenExpired,
    /// The refresh token itself was refused; the session is over.
    #[error("session expired, please sign in again")]
    SessionExpired,
    /// No refresh token is persisted.
    #[error("no refresh token stored")]
    NoRefreshToken,
    /// Any other HTTP failure, passed through to the caller unchanged.
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },
    /// Secure storage could not be read or written.
    #[error("secure storage error: {0}")]
    Storage(String),
}

impl AuthError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::TransportFailure(err.to_string())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Builds a `Rejected` error from an HTTP status and a (possibly JSON) body.
    ///
    /// Picks `code` and `message` out of the body when present, otherwise the
    /// raw body text becomes the message.
    pub fn rejected(status: u16, body: &Value) -> Self {
        let code = body
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string);
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| body.as_str().map(str::to_string))
            .unwrap_or_else(|| {
                if body.is_null() {
                    String::new()
                } else {
                    body.to_string()
                }
            });
        Self::Rejected {
            status,
            code,
            message,
        }
    }

    /// True when the error ends the session (forced transition to logged out).
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::NoRefreshToken)
    }
}

/// Result type for authenticated operations.
pub type AuthResult<T> = std::result::Result<T, AuthError>;
