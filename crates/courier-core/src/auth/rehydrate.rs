//! Silent re-authentication at process start.

use std::sync::Arc;

use courier_types::{AuthError, Identity};
use tracing::{debug, info, warn};

use super::AuthApi;
use crate::notify::{Notifier, SIGN_IN_AGAIN};
use crate::session::SessionStore;
use crate::storage::{
    REFRESH_TOKEN_KEY, SecureStorage, load_refresh_token, store_refresh_token_if_present,
};

/// How a rehydration attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RehydrateOutcome {
    /// Nothing persisted; the session was left untouched.
    NoStoredCredential,
    /// The session is authenticated with the identity the server returned.
    Restored,
    /// The server refused the stored refresh token. It has been removed and
    /// the user notified.
    Rejected,
    /// Transport or storage trouble. The session stays logged out; normal
    /// usage may retry later.
    Failed(AuthError),
    /// The session changed while the exchange was outstanding (sign-in or
    /// sign-out); the result was discarded.
    Superseded,
}

/// Where the session stood when the exchange started.
#[derive(Debug, Clone, Copy)]
enum Start {
    /// Was logged out; moved to `Authenticating` at this epoch.
    Fresh(u64),
    /// Was already authenticated at this epoch.
    Renew(u64),
}

pub struct Rehydrator {
    auth: AuthApi,
    storage: Arc<dyn SecureStorage>,
    session: Arc<SessionStore>,
    notifier: Arc<dyn Notifier>,
}

impl Rehydrator {
    pub fn new(
        auth: AuthApi,
        storage: Arc<dyn SecureStorage>,
        session: Arc<SessionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            auth,
            storage,
            session,
            notifier,
        }
    }

    /// Exchanges the persisted refresh token for a full identity.
    ///
    /// Call before deciding between the signed-in and signed-out routes.
    /// Each call performs at most one exchange.
    pub async fn rehydrate(&self) -> RehydrateOutcome {
        let refresh_token = match load_refresh_token(self.storage.as_ref()).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("no stored refresh token; staying logged out");
                return RehydrateOutcome::NoStoredCredential;
            }
            Err(err) => {
                warn!(error = %err, "could not read stored refresh token");
                return RehydrateOutcome::Failed(err);
            }
        };

        let start = match self.session.begin_authenticating() {
            Some(epoch) => Start::Fresh(epoch),
            None if self.session.is_logged_in() => Start::Renew(self.session.epoch()),
            None => {
                debug!("another authentication is outstanding; skipping rehydrate");
                return RehydrateOutcome::Superseded;
            }
        };

        match self.auth.exchange_refresh_token(&refresh_token).await {
            Ok(grant) => {
                if let Err(err) = store_refresh_token_if_present(
                    self.storage.as_ref(),
                    grant.refresh_token.as_deref(),
                )
                .await
                {
                    warn!(error = %err, "failed to persist rotated refresh token");
                }
                self.apply(start, grant.identity())
            }
            Err(AuthError::SessionExpired) => {
                if let Err(err) = self.storage.remove(REFRESH_TOKEN_KEY).await {
                    warn!(error = %err, "failed to remove refused refresh token");
                }
                let ended = match start {
                    Start::Fresh(epoch) => self.session.abort_authenticating(epoch),
                    Start::Renew(epoch) => self.session.force_sign_out(epoch),
                };
                if ended {
                    self.notifier.notify(SIGN_IN_AGAIN);
                }
                info!("stored refresh token refused");
                RehydrateOutcome::Rejected
            }
            Err(err) => {
                if let Start::Fresh(epoch) = start {
                    self.session.abort_authenticating(epoch);
                }
                warn!(error = %err, "rehydrate failed");
                RehydrateOutcome::Failed(err)
            }
        }
    }

    fn apply(&self, start: Start, identity: Identity) -> RehydrateOutcome {
        let applied = match start {
            Start::Fresh(epoch) => self.session.complete_authentication(epoch, identity),
            Start::Renew(epoch) => {
                let current = self.session.snapshot();
                if current.is_logged_in() && current.epoch() == epoch {
                    self.session.set_user(identity);
                    self.session.is_logged_in()
                } else {
                    false
                }
            }
        };
        if applied {
            RehydrateOutcome::Restored
        } else {
            debug!("rehydrate result discarded; session moved on");
            RehydrateOutcome::Superseded
        }
    }
}
