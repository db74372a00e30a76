//! Authentication: token claims, session state and the session manager.
//!
//! - `claims`: reads subject and expiry out of an access token
//! - `Session`: token state plus the proactive refresh policy
//! - `SessionManager`: login, logout, refresh and the refresh timer
//!
//! Tokens are kept in memory only.

pub mod claims;
pub mod manager;
pub mod session;

pub use claims::TokenClaims;
pub use manager::{SessionEvent, SessionManager};
pub use session::{refresh_delay, Session, SessionInfo, SessionState, TokenPair};
