use anyhow::{bail, Context, Result};
use keyring::Entry;
use tracing::debug;

const SERVICE_NAME: &str = "authlane";

/// Where a login password came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordSource {
    Keychain,
    Prompt,
}

/// Login passwords remembered in the OS keychain, keyed by email.
/// Session tokens are never written here.
pub struct CredentialStore;

impl CredentialStore {
    fn entry(email: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, email).context("Failed to create keyring entry")
    }

    pub fn remember(email: &str, password: &str) -> Result<()> {
        Self::entry(email)?
            .set_password(password)
            .context("Failed to store password in keychain")
    }

    /// Stored password for an email, if there is one
    pub fn recall(email: &str) -> Option<String> {
        match Self::entry(email).ok()?.get_password() {
            Ok(password) => Some(password),
            Err(e) => {
                debug!(error = %e, "No remembered password");
                None
            }
        }
    }

    pub fn forget(email: &str) -> Result<()> {
        Self::entry(email)?
            .delete_credential()
            .context("Failed to delete credential from keychain")
    }

    /// Remembered password, or ask for one on the terminal.
    pub fn password_for(email: &str) -> Result<(String, PasswordSource)> {
        if let Some(password) = Self::recall(email) {
            return Ok((password, PasswordSource::Keychain));
        }
        let password = prompt(&format!("Password for {}: ", email))?;
        Ok((password, PasswordSource::Prompt))
    }
}

pub fn prompt(label: &str) -> Result<String> {
    rpassword::prompt_password(label).context("Failed to read password")
}

/// Ask for a new password twice.
pub fn prompt_new_password() -> Result<String> {
    let password = prompt("New password: ")?;
    let confirm = prompt("Confirm password: ")?;
    if password != confirm {
        bail!("Passwords do not match");
    }
    Ok(password)
}
