use std::time::Duration;

use tracing::warn;

use crate::peer::chunk::ChunkConfig;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_LOCAL_ENDPOINT: &str = "http://localhost:5474/api/command";
pub const DEFAULT_BOOTSTRAP_URL: &str = "https://noterelay.io/api/plugin-init";
pub const DEFAULT_EVENT_LOG_URL: &str = "https://noterelay.io/api/vaults?route=log-connection";

pub const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RELAY_SETTLE: Duration = Duration::from_millis(1500);
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity of the vault a remote session targets. Supplied by whatever
/// settings store the embedding application uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultIdentity {
    pub vault_id: String,
    pub signal_id: String,
    pub user_email: Option<String>,
}

/// Endpoints and timing for a [`crate::VaultConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Host the client runs on; decides local vs remote mode.
    pub host: String,
    pub local_endpoint: String,
    pub bootstrap_url: String,
    pub event_log_url: String,
    pub direct_timeout: Duration,
    pub relay_settle: Duration,
    pub relay_timeout: Duration,
    pub request_timeout: Duration,
    pub chunk: ChunkConfig,
    pub vault: Option<VaultIdentity>,
    /// Bearer token of the signed-in user, if any. Enables connection-event
    /// logging and is presented to the signaling backend.
    pub session_token: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            local_endpoint: DEFAULT_LOCAL_ENDPOINT.to_string(),
            bootstrap_url: DEFAULT_BOOTSTRAP_URL.to_string(),
            event_log_url: DEFAULT_EVENT_LOG_URL.to_string(),
            direct_timeout: DEFAULT_DIRECT_TIMEOUT,
            relay_settle: DEFAULT_RELAY_SETTLE,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            chunk: ChunkConfig::default(),
            vault: None,
            session_token: None,
        }
    }
}

impl LinkConfig {
    /// Defaults overridden by any `VAULT_LINK_*` variables that are set and valid.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = string_env("VAULT_LINK_HOST") {
            config.host = host;
        }
        if let Some(endpoint) = string_env("VAULT_LINK_LOCAL_ENDPOINT") {
            config.local_endpoint = endpoint;
        }
        if let Some(url) = string_env("VAULT_LINK_BOOTSTRAP_URL") {
            config.bootstrap_url = url;
        }
        if let Some(url) = string_env("VAULT_LINK_EVENT_LOG_URL") {
            config.event_log_url = url;
        }
        config.direct_timeout = millis_env("VAULT_LINK_DIRECT_TIMEOUT_MS", config.direct_timeout);
        config.relay_settle = millis_env("VAULT_LINK_RELAY_SETTLE_MS", config.relay_settle);
        config.relay_timeout = millis_env("VAULT_LINK_RELAY_TIMEOUT_MS", config.relay_timeout);
        config.request_timeout =
            millis_env("VAULT_LINK_REQUEST_TIMEOUT_MS", config.request_timeout);
        config.chunk = ChunkConfig::from_env();
        config.session_token = string_env("VAULT_LINK_SESSION_TOKEN");

        if let (Some(vault_id), Some(signal_id)) = (
            string_env("VAULT_LINK_VAULT_ID"),
            string_env("VAULT_LINK_SIGNAL_ID"),
        ) {
            config.vault = Some(VaultIdentity {
                vault_id,
                signal_id,
                user_email: string_env("VAULT_LINK_EMAIL"),
            });
        }
        config
    }

    pub fn with_vault(mut self, vault: VaultIdentity) -> Self {
        self.vault = Some(vault);
        self
    }
}

fn string_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn millis_env(var: &str, default: Duration) -> Duration {
    parse_u64_env(var, default.as_millis() as u64, 1)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub(crate) fn parse_u64_env(var: &str, default: u64, min: u64) -> Option<u64> {
    let value = std::env::var(var).ok()?;
    match value.trim().parse::<u64>() {
        Ok(parsed) if parsed >= min => Some(parsed),
        Ok(parsed) => {
            warn!(
                target = "vault_link::config",
                var, parsed, min, default, "config value below minimum; using default"
            );
            None
        }
        Err(err) => {
            warn!(
                target = "vault_link::config",
                var,
                error = %err,
                default,
                "failed to parse config value from env; using default"
            );
            None
        }
    }
}
