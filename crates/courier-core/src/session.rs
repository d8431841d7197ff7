//! Session Store: the single owner of authentication state.
//!
//! State lives in a `watch` channel so observers (the realtime coordinator,
//! UI route split) react to transitions. Every transition is one
//! `send_if_modified` call, which makes it atomic with respect to readers.

use courier_types::{Identity, Session, SessionStatus};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug)]
pub struct SessionStore {
    tx: watch::Sender<Session>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Creates a store in the logged-out state.
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(Session::logged_out(0)),
        }
    }

    pub fn snapshot(&self) -> Session {
        self.tx.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.tx.borrow().status()
    }

    pub fn is_logged_in(&self) -> bool {
        self.tx.borrow().is_logged_in()
    }

    pub fn access_token(&self) -> Option<String> {
        self.tx.borrow().access_token().map(str::to_string)
    }

    pub fn epoch(&self) -> u64 {
        self.tx.borrow().epoch()
    }

    /// Subscribes to transitions. The receiver starts at the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }

    /// `LoggedOut -> Authenticating`. Returns the epoch the exchange belongs
    /// to, or `None` when the session is not logged out.
    pub fn begin_authenticating(&self) -> Option<u64> {
        let mut epoch = None;
        self.tx.send_if_modified(|session| {
            if session.status() != SessionStatus::LoggedOut {
                return false;
            }
            epoch = Some(session.epoch());
            *session = Session::authenticating(session.epoch());
            true
        });
        if let Some(epoch) = epoch {
            debug!(epoch, "session authenticating");
        }
        epoch
    }

    /// `Authenticating -> LoggedOut` after a failed sign-in or rehydrate.
    pub fn abort_authenticating(&self, epoch: u64) -> bool {
        let changed = self.tx.send_if_modified(|session| {
            if session.status() != SessionStatus::Authenticating || session.epoch() != epoch {
                return false;
            }
            *session = Session::logged_out(epoch);
            true
        });
        if changed {
            debug!(epoch, "session authentication aborted");
        }
        changed
    }

    /// Finishes a sign-in or rehydrate exchange started with
    /// [`begin_authenticating`](Self::begin_authenticating).
    ///
    /// Discarded (returns false) if the session moved on meanwhile, e.g. the
    /// user signed out while the exchange was outstanding.
    pub fn complete_authentication(&self, epoch: u64, identity: Identity) -> bool {
        let mut applied = None;
        self.tx.send_if_modified(|session| {
            if session.status() != SessionStatus::Authenticating || session.epoch() != epoch {
                return false;
            }
            *session = Session::authenticated(identity, epoch + 1);
            applied = Some(session.is_logged_in());
            true
        });
        match applied {
            Some(true) => {
                info!(epoch = epoch + 1, "session authenticated");
                true
            }
            Some(false) => {
                info!("incomplete identity; session logged out");
                false
            }
            None => {
                debug!(epoch, "stale authentication result discarded");
                false
            }
        }
    }

    /// Transitions to `Authenticated`, replacing any prior identity and token.
    ///
    /// An identity without an email or access token logs the session out.
    /// Re-setting the signed-in user keeps the epoch, so observers keyed on
    /// it (the realtime channel) do not churn. Returns the resulting epoch.
    pub fn set_user(&self, identity: Identity) -> u64 {
        let mut new_epoch = 0;
        self.tx.send_modify(|session| {
            let same_user = session.is_logged_in()
                && identity.is_complete()
                && session.email() == identity.email;
            new_epoch = if same_user {
                session.epoch()
            } else {
                session.epoch() + 1
            };
            *session = Session::authenticated(identity, new_epoch);
        });
        info!(epoch = new_epoch, logged_in = self.is_logged_in(), "session user set");
        new_epoch
    }

    /// Updates the access token in place. No-op unless authenticated.
    pub fn set_access_token(&self, token: &str) -> bool {
        let changed = self
            .tx
            .send_if_modified(|session| session.replace_access_token(token));
        if changed {
            debug!("access token replaced");
        }
        changed
    }

    /// Like [`set_access_token`](Self::set_access_token), but only while the
    /// session still belongs to `epoch`.
    pub fn set_access_token_for(&self, epoch: u64, token: &str) -> bool {
        let changed = self.tx.send_if_modified(|session| {
            session.epoch() == epoch && session.replace_access_token(token)
        });
        if changed {
            debug!(epoch, "access token replaced");
        } else {
            debug!(epoch, "refreshed token not applied; session moved on");
        }
        changed
    }

    /// Transitions to `LoggedOut`, erasing identity and token.
    pub fn clear(&self) -> bool {
        let mut new_epoch = None;
        self.tx.send_if_modified(|session| {
            if session.status() == SessionStatus::LoggedOut {
                return false;
            }
            let epoch = session.epoch() + 1;
            *session = Session::logged_out(epoch);
            new_epoch = Some(epoch);
            true
        });
        if let Some(epoch) = new_epoch {
            info!(epoch, "session cleared");
        }
        new_epoch.is_some()
    }

    /// Clears the session only if it is still the authenticated session of
    /// `epoch`. Returns whether this call ended the session, so callers can
    /// notify the user exactly once.
    pub fn force_sign_out(&self, epoch: u64) -> bool {
        let changed = self.tx.send_if_modified(|session| {
            if !session.is_logged_in() || session.epoch() != epoch {
                return false;
            }
            *session = Session::logged_out(epoch + 1);
            true
        });
        if changed {
            info!(epoch, "session forcibly signed out");
        }
        changed
    }
}
