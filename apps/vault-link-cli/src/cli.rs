use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use vault_link::config::DEFAULT_HOST;
use vault_link::{LinkConfig, VaultIdentity};

use crate::error::CliError;
use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "vault-link",
    about = "Talk to a personal vault over local HTTP or a WebRTC peer channel",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "VAULT_LINK_HOST",
        default_value = DEFAULT_HOST,
        help = "Host this client runs on; loopback selects local HTTP mode"
    )]
    pub host: String,

    #[arg(long, global = true, env = "VAULT_LINK_VAULT_ID", value_name = "ID")]
    pub vault_id: Option<String>,

    #[arg(long, global = true, env = "VAULT_LINK_SIGNAL_ID", value_name = "ID")]
    pub signal_id: Option<String>,

    #[arg(long, global = true, env = "VAULT_LINK_EMAIL")]
    pub email: Option<String>,

    #[arg(
        long,
        global = true,
        env = "VAULT_LINK_PASSWORD",
        hide_env_values = true,
        help = "Vault password; prompted for when omitted"
    )]
    pub password: Option<String>,

    #[arg(
        long,
        global = true,
        env = "VAULT_LINK_SESSION_TOKEN",
        hide_env_values = true,
        help = "Bearer token of the signed-in user, used for connection-event logging"
    )]
    pub session_token: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "VAULT_LINK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "VAULT_LINK_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect and print what the vault sends during login.
    Connect,
    /// Connect, send one command and print the reply.
    Send {
        cmd: String,
        #[arg(long, value_name = "JSON", help = "Extra fields merged into the command")]
        data: Option<String>,
    },
    /// Connect and print every event until interrupted.
    Watch,
}

impl Cli {
    /// Environment defaults with the flags applied on top.
    pub fn link_config(&self) -> Result<LinkConfig, CliError> {
        let mut config = LinkConfig::from_env();
        config.host = self.host.clone();
        if self.session_token.is_some() {
            config.session_token = self.session_token.clone();
        }
        match (&self.vault_id, &self.signal_id) {
            (Some(vault_id), Some(signal_id)) => {
                config.vault = Some(VaultIdentity {
                    vault_id: vault_id.clone(),
                    signal_id: signal_id.clone(),
                    user_email: self.email.clone(),
                });
            }
            (None, None) => {}
            _ => return Err(CliError::IncompleteVault),
        }
        Ok(config)
    }
}

pub fn parse_data(data: Option<&str>) -> Result<Value, CliError> {
    let Some(raw) = data else {
        return Ok(Value::Null);
    };
    let value: Value =
        serde_json::from_str(raw).map_err(|err| CliError::InvalidData(err.to_string()))?;
    if !value.is_object() {
        return Err(CliError::InvalidData(format!("got {value}")));
    }
    Ok(value)
}
