use anyhow::{bail, Context, Result};
use authlane_core::{
    ClientConfig, ErrorKind, ProfileService, Registration, SessionEvent, SessionInfo,
    SessionManager, UserUpdate,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::credentials::{prompt_new_password, CredentialStore, PasswordSource};

/// Profile fields requested on the command line.
pub struct ProfileChanges {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub new_email: Option<String>,
    pub change_password: bool,
}

/// Connect and log in, using a remembered password when there is one.
async fn sign_in(config: &ClientConfig, email: &str) -> Result<(SessionManager, String)> {
    let manager = SessionManager::connect(config).context("Failed to set up HTTP client")?;

    let (password, source) = CredentialStore::password_for(email)?;

    if let Err(e) = manager.login(email, &password).await {
        if source == PasswordSource::Keychain && e.kind() == ErrorKind::Authentication {
            warn!("Remembered password was rejected; run `authlane forget` to clear it");
        }
        return Err(anyhow::Error::new(e).context("Login failed"));
    }
    Ok((manager, password))
}

/// End the server-side session; failure here is not fatal for the command.
async fn sign_out(manager: &SessionManager) {
    if let Err(e) = manager.logout().await {
        warn!(error = %e, "Logout failed");
    }
}

fn print_session(info: &SessionInfo) {
    println!("State:        {:?}", info.state);
    match info.user_id {
        Some(id) => println!("User ID:      {}", id),
        None => println!("User ID:      (unknown)"),
    }
    if let Some(ref token_type) = info.token_type {
        println!("Token type:   {}", token_type);
    }
    if let Some(secs) = info.expires_in {
        println!("Expires in:   {}s", secs);
    }
    if let Some(delay) = info.refresh_scheduled_in {
        println!("Refresh in:   {}s", delay.as_secs());
    }
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::LoggedIn { user_id } => format!("logged in (user {:?})", user_id),
        SessionEvent::TokensRefreshed => "tokens refreshed".to_string(),
        SessionEvent::RefreshFailed(e) => format!("refresh failed: {}", e),
        SessionEvent::SessionExpired => "session expired".to_string(),
        SessionEvent::LoggedOut => "logged out".to_string(),
        SessionEvent::CurrentUserLoaded(user) => {
            format!("loaded user {} ({})", user.id, user.email)
        }
    }
}

pub async fn login(config: &ClientConfig, email: &str, remember: bool) -> Result<()> {
    let (manager, password) = sign_in(config, email).await?;
    print_session(&manager.info());

    if remember {
        CredentialStore::remember(email, &password)?;
        println!("Password saved to the system keychain");
    }
    Ok(())
}

pub async fn whoami(config: &ClientConfig, email: &str) -> Result<()> {
    let (manager, _) = sign_in(config, email).await?;
    let user = manager.current_user().await.context("Failed to load current user")?;
    println!("{}", serde_json::to_string_pretty(&user)?);
    sign_out(&manager).await;
    Ok(())
}

pub async fn update_profile(
    config: &ClientConfig,
    email: &str,
    changes: ProfileChanges,
) -> Result<()> {
    let mut update = UserUpdate {
        email: changes.new_email,
        first_name: changes.first_name,
        last_name: changes.last_name,
        password: None,
    };
    if changes.change_password {
        update.password = Some(prompt_new_password()?);
    }
    if update.is_empty() {
        bail!(
            "Nothing to update; pass --first-name, --last-name, --new-email or --change-password"
        );
    }

    let (manager, _) = sign_in(config, email).await?;
    // The token may not carry a subject; fall back to asking the server
    if manager.user_id().is_none() {
        manager.current_user().await.context("Failed to load current user")?;
    }

    let profile = ProfileService::new(manager.clone());
    let user = profile.update_profile(&update).await.context("Profile update failed")?;
    println!("{}", serde_json::to_string_pretty(&user)?);

    if update.password.is_some() && CredentialStore::recall(email).is_some() {
        warn!("The remembered password is now out of date; run `authlane login --remember` again");
    }
    sign_out(&manager).await;
    Ok(())
}

pub async fn register(
    config: &ClientConfig,
    email: String,
    first_name: String,
    last_name: String,
) -> Result<()> {
    let password = prompt_new_password()?;
    let manager = SessionManager::connect(config).context("Failed to set up HTTP client")?;
    let profile = ProfileService::new(manager);

    let registration = Registration {
        email,
        password,
        first_name,
        last_name,
    };
    let user = profile.register(&registration).await.context("Registration failed")?;
    info!(user_id = user.id, "Account created");
    println!("{}", serde_json::to_string_pretty(&user)?);
    Ok(())
}

/// Stay signed in and print session events, so the proactive refresh can be
/// observed. Stops on Ctrl-C or when the session expires.
pub async fn watch(config: &ClientConfig, email: &str) -> Result<()> {
    let (manager, _) = sign_in(config, email).await?;
    let mut events = manager.subscribe();
    print_session(&manager.info());
    println!("Watching session events, press Ctrl-C to stop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", describe(&event));
                    if event == SessionEvent::SessionExpired {
                        return Ok(());
                    }
                    if event == SessionEvent::TokensRefreshed {
                        print_session(&manager.info());
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed session events"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                info!("Interrupted");
                break;
            }
        }
    }

    if manager.is_authenticated() {
        sign_out(&manager).await;
    }
    Ok(())
}
