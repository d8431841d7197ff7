//! User-facing alerts.

use tracing::warn;

/// Message shown when the session ends because the refresh token was refused.
pub const SIGN_IN_AGAIN: &str = "Please sign in again.";

/// Surfaces a message to the user. Fire-and-forget.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Default notifier for hosts without an alert surface: emits a warning event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        warn!(target: "courier::notice", "{message}");
    }
}
