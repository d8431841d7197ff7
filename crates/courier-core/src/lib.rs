//! Session lifecycle and realtime-connection core for the courier client
//! (session store, token refresh, request interceptor, realtime channel).

pub mod account;
pub mod api;
pub mod auth;
pub mod config;
pub mod courier;
pub mod logging;
pub mod notify;
pub mod orders;
pub mod realtime;
pub mod session;
pub mod storage;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod transport;

pub use courier::Courier;
pub use courier_types::{AuthError, AuthResult, Identity, Order, Session, SessionStatus};
