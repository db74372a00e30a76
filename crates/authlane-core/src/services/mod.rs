//! Services built on top of an authenticated session.

pub mod profile;

pub use profile::ProfileService;
