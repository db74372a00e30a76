//! authlane-core: client-side authentication for a token-based HTTP API.
//!
//! - `api`: request transport, 401 parking and replay, error classification
//! - `auth`: token claims, session state, the session manager
//! - `services`: profile update and registration
//! - `config`: base address, timeout and user agent
//!
//! A typical client builds a [`SessionManager`] from a [`ClientConfig`],
//! logs in, and shares the manager with any services that need the session.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod services;
pub mod utils;

pub use api::{ApiError, ErrorKind};
pub use auth::{SessionEvent, SessionInfo, SessionManager, SessionState};
pub use config::ClientConfig;
pub use models::{Registration, User, UserUpdate};
pub use services::ProfileService;
