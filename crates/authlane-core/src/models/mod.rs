//! Data models exchanged with the API.
//!
//! - `User`, `UserUpdate`, `Registration`: account records and the bodies
//!   that create or change them
//! - `TokenResponse`: reply of the login and refresh endpoints

pub mod auth;
pub mod user;

pub use auth::TokenResponse;
pub use user::{
    decode_user, encode_registration, encode_user_update, Registration, User, UserUpdate,
};
