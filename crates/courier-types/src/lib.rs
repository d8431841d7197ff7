//! Plain data shared across the courier client: session snapshots, identities,
//! inbound orders and the authentication error taxonomy.

pub mod error;
pub mod order;
pub mod session;

pub use error::{AuthError, AuthResult};
pub use order::Order;
pub use session::{Identity, Session, SessionStatus, mask_token};
