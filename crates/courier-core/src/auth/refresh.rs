//! Single-flight refresh of the access token.
//!
//! The first caller that finds no exchange outstanding spawns one; everyone
//! arriving while it runs awaits a clone of the same shared future. The
//! exchange runs on its own task, so it settles even if every waiter is
//! dropped, and its outcome is applied to the session only if the session
//! still belongs to the epoch it started under.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use courier_types::{AuthError, AuthResult};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use super::AuthApi;
use crate::notify::{Notifier, SIGN_IN_AGAIN};
use crate::session::SessionStore;
use crate::storage::{
    REFRESH_TOKEN_KEY, SecureStorage, load_refresh_token, store_refresh_token_if_present,
};

type SharedRefresh = Shared<BoxFuture<'static, AuthResult<String>>>;

struct InFlight {
    id: u64,
    outcome: SharedRefresh,
}

struct Inner {
    auth: AuthApi,
    storage: Arc<dyn SecureStorage>,
    session: Arc<SessionStore>,
    notifier: Arc<dyn Notifier>,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
    exchanges: AtomicU64,
}

/// Renews the access token, at most one exchange at a time.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        auth: AuthApi,
        storage: Arc<dyn SecureStorage>,
        session: Arc<SessionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                auth,
                storage,
                session,
                notifier,
                in_flight: Mutex::new(None),
                next_id: AtomicU64::new(0),
                exchanges: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a renewed access token, joining the outstanding exchange if
    /// there is one.
    ///
    /// # Errors
    /// - `NoRefreshToken`: nothing persisted; the session is signed out.
    /// - `SessionExpired`: the refresh token was refused; the session is
    ///   signed out and the user notified once.
    /// - `TransportFailure` / `Storage`: the session is left as it was.
    pub async fn refresh(&self) -> AuthResult<String> {
        let outcome = self.join_or_start();
        outcome.await
    }

    /// True while an exchange is outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.inner.slot().is_some()
    }

    /// Number of refresh exchanges issued so far.
    pub fn exchanges_started(&self) -> u64 {
        self.inner.exchanges.load(Ordering::SeqCst)
    }

    fn join_or_start(&self) -> SharedRefresh {
        let mut slot = self.inner.slot();
        if let Some(flight) = slot.as_ref() {
            debug!(flight = flight.id, "joining in-flight refresh");
            return flight.outcome.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let epoch = self.inner.session.epoch();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.exchange(epoch).await;
            inner.finish(id);
            result
        });
        let outcome = async move {
            task.await
                .unwrap_or_else(|err| Err(AuthError::transport(format!("refresh task failed: {err}"))))
        }
        .boxed()
        .shared();

        debug!(flight = id, epoch, "refresh started");
        *slot = Some(InFlight {
            id,
            outcome: outcome.clone(),
        });
        outcome
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, id: u64) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|flight| flight.id == id) {
            *slot = None;
        }
    }

    async fn exchange(&self, epoch: u64) -> AuthResult<String> {
        let Some(refresh_token) = load_refresh_token(self.storage.as_ref()).await? else {
            warn!(epoch, "no refresh token stored; signing out");
            self.session.force_sign_out(epoch);
            return Err(AuthError::NoRefreshToken);
        };

        self.exchanges.fetch_add(1, Ordering::SeqCst);
        match self.auth.exchange_refresh_token(&refresh_token).await {
            Ok(grant) => {
                if let Err(err) =
                    store_refresh_token_if_present(self.storage.as_ref(), grant.refresh_token.as_deref())
                        .await
                {
                    warn!(error = %err, "failed to persist rotated refresh token");
                }
                self.session.set_access_token_for(epoch, &grant.access_token);
                info!(epoch, "access token refreshed");
                Ok(grant.access_token)
            }
            Err(AuthError::SessionExpired) => {
                if let Err(err) = self.storage.remove(REFRESH_TOKEN_KEY).await {
                    warn!(error = %err, "failed to remove refused refresh token");
                }
                if self.session.force_sign_out(epoch) {
                    self.notifier.notify(SIGN_IN_AGAIN);
                }
                Err(AuthError::SessionExpired)
            }
            Err(err) => Err(err),
        }
    }
}
