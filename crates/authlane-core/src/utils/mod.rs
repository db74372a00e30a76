//! Utility functions shared by the session and profile services.

pub mod validation;

pub use validation::{is_non_empty, is_one_of, is_strong_password, is_valid_email, min_length};
