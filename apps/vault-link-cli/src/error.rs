use std::io;

use thiserror::Error;
use vault_link::LinkError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Link(#[from] LinkError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("--data must be a JSON object: {0}")]
    InvalidData(String),
    #[error("remote vaults need both --vault-id and --signal-id")]
    IncompleteVault,
}
