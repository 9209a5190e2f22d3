mod cli;
mod error;
mod logging;

use std::io::Write;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use tracing::{debug, info};
use vault_link::{StatusReporter, VaultConnection, VaultEvent};

use crate::cli::{parse_data, Cli, Command};
use crate::error::CliError;

/// Progress lines go to stderr so stdout carries only JSON.
struct StderrStatus;

impl StatusReporter for StderrStatus {
    fn status(&self, message: &str) {
        eprintln!("{message}");
    }

    fn theme(&self, css: &str) {
        debug!(target = "vault_link::cli", bytes = css.len(), "vault theme received");
    }
}

fn event_json(event: &VaultEvent) -> Value {
    match event {
        VaultEvent::Connected => json!({"event": "connected"}),
        VaultEvent::Message(message) => json!({"event": "message", "message": message}),
        VaultEvent::TransportError(reason) => json!({"event": "transport_error", "reason": reason}),
        VaultEvent::Disconnected => json!({"event": "disconnected"}),
    }
}

fn print_json(value: &Value) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{value}");
}

fn read_password(cli: &Cli) -> Result<String, CliError> {
    match &cli.password {
        Some(password) => Ok(password.clone()),
        None => Ok(rpassword::prompt_password("Vault password: ")?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let _log_guard = logging::init(&cli.logging.to_config())
        .map_err(|err| CliError::Logging(err.to_string()))
        .context("setting up logging")?;

    let config = cli.link_config()?;
    let data = match &cli.command {
        Command::Send { data, .. } => parse_data(data.as_deref())?,
        _ => Value::Null,
    };
    let password = read_password(&cli).context("reading vault password")?;

    let connection = VaultConnection::new(config);
    info!(
        target = "vault_link::cli",
        mode = %connection.mode(),
        "connecting to vault"
    );
    if !matches!(cli.command, Command::Send { .. }) {
        connection.set_handler(|event: VaultEvent| print_json(&event_json(&event)));
    }

    connection
        .connect(&password, &StderrStatus)
        .await
        .map_err(CliError::from)
        .context("connecting to vault")?;

    let outcome = match &cli.command {
        Command::Connect => Ok(()),
        Command::Send { cmd, .. } => match connection.send(cmd, data).await {
            Ok(reply) => {
                print_json(&reply);
                Ok(())
            }
            Err(err) => Err(anyhow::Error::from(CliError::from(err)))
                .with_context(|| format!("sending {cmd}")),
        },
        Command::Watch => {
            tokio::signal::ctrl_c()
                .await
                .map_err(CliError::from)
                .context("waiting for interrupt")?;
            Ok(())
        }
    };

    connection.shutdown().await;
    outcome
}
