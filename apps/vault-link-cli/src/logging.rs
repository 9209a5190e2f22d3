use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// Peer-connection and HTTP internals that drown out our own trace output.
const NOISY_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "reqwest",
    "hyper",
    "tungstenite",
    "tokio_tungstenite",
];

/// Directive string for `level`. Below debug only the level applies; at debug
/// and trace our crates get the detail and dependencies stay at info unless
/// `include_dependencies` is set.
fn directives(level: LogLevel, include_dependencies: bool) -> String {
    let ours = match level {
        LogLevel::Error => return "error".into(),
        LogLevel::Warn => return "warn".into(),
        LogLevel::Info => return "info".into(),
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };
    if include_dependencies {
        return ours.into();
    }
    let mut parts = vec![
        "info".to_string(),
        format!("vault_link={ours}"),
        format!("vault_link_cli={ours}"),
    ];
    parts.extend(NOISY_DEPENDENCIES.iter().map(|target| format!("{target}=info")));
    parts.join(",")
}

/// Installs the global subscriber, writing to `config.file` or stderr so that
/// stdout carries only command output. Keep the guard alive until exit.
pub fn init(config: &LogConfig) -> Result<WorkerGuard, InitError> {
    let filter = match std::env::var("VAULT_LINK_LOG_FILTER") {
        Ok(custom) if !custom.trim().is_empty() => EnvFilter::new(custom),
        _ => {
            let deps = std::env::var("VAULT_LINK_TRACE_DEPS").is_ok_and(|v| v != "0" && !v.is_empty());
            EnvFilter::new(directives(config.level, deps))
        }
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;
    Ok(guard)
}
