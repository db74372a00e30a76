//! Local input checks run before any request is sent.

use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
        .expect("EMAIL_REGEX pattern is valid")
});

/// Characters that count as "special" for password strength.
const PASSWORD_SPECIALS: &str = "!@#$%^&*;,.?\"'()-_=+";

pub const MIN_PASSWORD_LENGTH: usize = 8;

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

pub fn is_non_empty(value: &str) -> bool {
    !value.is_empty()
}

/// At least eight characters with an uppercase letter, a lowercase letter,
/// a digit and one of [`PASSWORD_SPECIALS`].
pub fn is_strong_password(password: &str) -> bool {
    min_length(password, MIN_PASSWORD_LENGTH)
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| PASSWORD_SPECIALS.contains(c))
}

/// Length check counted in characters, not bytes.
pub fn min_length(value: &str, length: usize) -> bool {
    value.chars().count() >= length
}

pub fn is_one_of(value: &str, options: &[&str]) -> bool {
    options.contains(&value)
}
