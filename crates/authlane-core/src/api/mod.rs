//! Request transport and error classification for the remote HTTP API.
//!
//! The API uses bearer token authentication. Requests rejected with 401 are
//! parked by the transport until the session layer has refreshed its tokens,
//! then replayed.

pub mod error;
pub mod transport;

pub use error::{ApiError, ErrorKind};
pub use transport::{
    execute, ApiRequest, ApiTransport, Failure, FailureHandler, Reply, ReplyHandler,
    RequestIssuer, TokenSupplier, TransportEvent,
};
