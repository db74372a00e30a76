//! authlane - command-line front-end for authlane sessions.
//!
//! Signs in against the configured API, shows the signed-in user, edits the
//! profile, registers accounts and can watch a session refresh itself.

mod commands;
mod credentials;

use std::io;

use anyhow::{Context, Result};
use authlane_core::ClientConfig;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "authlane", version, about = "Sign in to an authlane API and manage the session")]
struct Cli {
    /// API base address, overriding the config file and AUTHLANE_BASE_URL
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Account {
    /// Account email
    #[arg(long, env = "AUTHLANE_EMAIL")]
    email: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and print the session
    Login {
        #[command(flatten)]
        account: Account,

        /// Remember the password in the system keychain
        #[arg(long)]
        remember: bool,
    },

    /// Sign in and print the current user
    Whoami {
        #[command(flatten)]
        account: Account,
    },

    /// Change fields of the signed-in user's profile
    UpdateProfile {
        #[command(flatten)]
        account: Account,

        #[arg(long)]
        first_name: Option<String>,

        #[arg(long)]
        last_name: Option<String>,

        #[arg(long)]
        new_email: Option<String>,

        /// Prompt for a new password
        #[arg(long)]
        change_password: bool,
    },

    /// Create a new account
    Register {
        #[arg(long)]
        email: String,

        #[arg(long)]
        first_name: String,

        #[arg(long)]
        last_name: String,
    },

    /// Sign in and print session events until interrupted
    Watch {
        #[command(flatten)]
        account: Account,
    },

    /// Remove a remembered password from the keychain
    Forget {
        #[command(flatten)]
        account: Account,
    },

    /// Show or change the stored configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    SetBaseUrl { url: String },
    SetTimeout { ms: u64 },
}

/// Initialize the tracing subscriber for logging.
/// Use RUST_LOG to control the level (e.g. RUST_LOG=authlane_core=debug).
fn init_tracing() -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

/// Config file plus environment, then command-line overrides.
fn effective_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::load().context("Failed to load configuration")?;
    if let Some(ref url) = cli.base_url {
        config.base_url = url.clone();
    }
    if let Some(ms) = cli.timeout_ms {
        config.request_timeout_ms = ms;
    }
    config.base_url().context("Invalid base URL")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing();
    info!("authlane starting");

    if let Command::Config { ref action } = cli.command {
        return run_config(&cli, action);
    }

    let config = effective_config(&cli)?;
    match cli.command {
        Command::Login { account, remember } => {
            commands::login(&config, &account.email, remember).await
        }
        Command::Whoami { account } => commands::whoami(&config, &account.email).await,
        Command::UpdateProfile {
            account,
            first_name,
            last_name,
            new_email,
            change_password,
        } => {
            let changes = commands::ProfileChanges {
                first_name,
                last_name,
                new_email,
                change_password,
            };
            commands::update_profile(&config, &account.email, changes).await
        }
        Command::Register {
            email,
            first_name,
            last_name,
        } => commands::register(&config, email, first_name, last_name).await,
        Command::Watch { account } => commands::watch(&config, &account.email).await,
        Command::Forget { account } => {
            credentials::CredentialStore::forget(&account.email)?;
            println!("Forgot stored password for {}", account.email);
            Ok(())
        }
        Command::Config { .. } => Ok(()),
    }
}

fn run_config(cli: &Cli, action: &ConfigAction) -> Result<()> {
    let path = ClientConfig::config_path()?;
    match action {
        ConfigAction::Show => {
            let config = effective_config(cli)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::SetBaseUrl { url } => {
            let mut config = ClientConfig::load_from(&path)?;
            config.base_url = url.clone();
            config.base_url().context("Invalid base URL")?;
            config.save_to(&path)?;
            println!("Base URL set to {}", url);
        }
        ConfigAction::SetTimeout { ms } => {
            if *ms == 0 {
                anyhow::bail!("Timeout must be greater than zero");
            }
            let mut config = ClientConfig::load_from(&path)?;
            config.request_timeout_ms = *ms;
            config.save_to(&path)?;
            println!("Request timeout set to {}ms", ms);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_update_profile() {
        let cli = Cli::try_parse_from([
            "authlane",
            "--base-url",
            "https://api.example.com",
            "update-profile",
            "--email",
            "ada@example.com",
            "--first-name",
            "Grace",
            "--change-password",
        ])
        .unwrap();

        assert_eq!(cli.base_url.as_deref(), Some("https://api.example.com"));
        match cli.command {
            Command::UpdateProfile {
                account,
                first_name,
                last_name,
                change_password,
                ..
            } => {
                assert_eq!(account.email, "ada@example.com");
                assert_eq!(first_name.as_deref(), Some("Grace"));
                assert_eq!(last_name, None);
                assert!(change_password);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_config_subcommands() {
        let cli = Cli::try_parse_from(["authlane", "config", "set-timeout", "2500"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Config {
                action: ConfigAction::SetTimeout { ms: 2500 }
            }
        ));
    }
}
