//! Sign-in, sign-up and sign-out.

use std::sync::Arc;

use courier_types::AuthResult;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::auth::{AuthApi, LOGOUT_PATH};
use crate::session::SessionStore;
use crate::storage::{REFRESH_TOKEN_KEY, SecureStorage, store_refresh_token_if_present};

#[derive(Clone)]
pub struct Account {
    auth: AuthApi,
    api: ApiClient,
    storage: Arc<dyn SecureStorage>,
    session: Arc<SessionStore>,
}

impl Account {
    pub fn new(
        auth: AuthApi,
        api: ApiClient,
        storage: Arc<dyn SecureStorage>,
        session: Arc<SessionStore>,
    ) -> Self {
        Self {
            auth,
            api,
            storage,
            session,
        }
    }

    /// Signs in and persists the issued refresh token.
    ///
    /// A result that arrives after the session moved on (signed out while
    /// the exchange was outstanding) is discarded.
    ///
    /// # Errors
    /// `Rejected` with the server message for bad credentials,
    /// `TransportFailure` if the server is unreachable, `Storage` if the
    /// refresh token could not be saved. The session is logged out on error.
    pub async fn sign_in(&self, email: &str, password: &str) -> AuthResult<()> {
        let pending = self.session.begin_authenticating();

        let grant = match self.auth.login(email, password).await {
            Ok(grant) => grant,
            Err(err) => {
                if let Some(epoch) = pending {
                    self.session.abort_authenticating(epoch);
                }
                info!(error = %err, "sign-in failed");
                return Err(err);
            }
        };

        if pending.is_some_and(|epoch| self.session.epoch() != epoch) {
            debug!("sign-in result discarded; session moved on");
            return Ok(());
        }

        if let Err(err) =
            store_refresh_token_if_present(self.storage.as_ref(), grant.refresh_token.as_deref())
                .await
        {
            if let Some(epoch) = pending {
                self.session.abort_authenticating(epoch);
            }
            warn!(error = %err, "could not persist refresh token");
            return Err(err);
        }

        let identity = grant.identity();
        match pending {
            Some(epoch) => {
                self.session.complete_authentication(epoch, identity);
            }
            None => {
                self.session.set_user(identity);
            }
        }
        Ok(())
    }

    /// Registers a new account. The session is not touched.
    ///
    /// # Errors
    /// `Rejected` if the server refuses the registration.
    pub async fn sign_up(&self, email: &str, name: &str, password: &str) -> AuthResult<()> {
        self.auth.sign_up(email, name, password).await?;
        info!("account registered");
        Ok(())
    }

    /// Signs out locally, telling the server first.
    ///
    /// The server call is best effort. The stored refresh token is removed
    /// and the session cleared regardless of its outcome.
    ///
    /// # Errors
    /// `Storage` if the refresh token could not be removed; the session is
    /// cleared anyway.
    pub async fn sign_out(&self) -> AuthResult<()> {
        if self.session.is_logged_in()
            && let Err(err) = self.api.post(LOGOUT_PATH, json!({})).await
        {
            warn!(error = %err, "server sign-out failed; signing out locally");
        }

        let removed = self.storage.remove(REFRESH_TOKEN_KEY).await;
        self.session.clear();
        if let Err(err) = &removed {
            warn!(error = %err, "could not remove stored refresh token");
        }
        removed
    }
}
