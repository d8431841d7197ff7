//! Authentication session snapshots.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    LoggedOut,
    /// A sign-in or rehydrate exchange is outstanding.
    Authenticating,
    Authenticated,
}

/// Identity returned by the authentication endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub name: String,
    pub email: String,
    pub access_token: String,
}

impl Identity {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            access_token: access_token.into(),
        }
    }

    /// An identity can only back an authenticated session if it carries both
    /// an email and an access token.
    pub fn is_complete(&self) -> bool {
        !self.email.is_empty() && !self.access_token.is_empty()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("access_token", &mask_token(&self.access_token))
            .finish()
    }
}

/// Immutable snapshot of the authentication state.
///
/// Constructors uphold the invariant: `Authenticated` iff email and access
/// token are both non-empty; any other status carries neither.
/// `epoch` increases whenever a different identity signs in and on every
/// clear, so two snapshots with the same epoch belong to the same session.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Session {
    status: SessionStatus,
    name: String,
    email: String,
    access_token: String,
    epoch: u64,
}

impl Session {
    pub fn logged_out(epoch: u64) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }

    pub fn authenticating(epoch: u64) -> Self {
        Self {
            status: SessionStatus::Authenticating,
            epoch,
            ..Self::default()
        }
    }

    /// Builds an authenticated snapshot, or a logged-out one when the identity
    /// is incomplete.
    pub fn authenticated(identity: Identity, epoch: u64) -> Self {
        if !identity.is_complete() {
            return Self::logged_out(epoch);
        }
        Self {
            status: SessionStatus::Authenticated,
            name: identity.name,
            email: identity.email,
            access_token: identity.access_token,
            epoch,
        }
    }

    /// Swaps the access token in place. Returns false (and changes nothing)
    /// unless the session is authenticated and the token is non-empty.
    pub fn replace_access_token(&mut self, token: &str) -> bool {
        if self.status != SessionStatus::Authenticated || token.is_empty() {
            return false;
        }
        if self.access_token == token {
            return false;
        }
        self.access_token = token.to_string();
        true
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_logged_in(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn access_token(&self) -> Option<&str> {
        self.is_logged_in().then_some(self.access_token.as_str())
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status)
            .field("name", &self.name)
            .field("email", &self.email)
            .field("access_token", &mask_token(&self.access_token))
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Returns a masked version of a token for display (first 12 chars + ...).
pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return String::new();
    }
    if token.len() <= 16 || !token.is_char_boundary(12) {
        return "***".to_string();
    }
    format!("{}...", &token[..12])
}
