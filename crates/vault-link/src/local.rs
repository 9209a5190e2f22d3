use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use crate::auth::hash_password;
use crate::command::{command_body, BOOTSTRAP_COMMANDS, PING};
use crate::error::{LinkError, LinkResult};
use crate::notifier::{EventNotifier, StatusReporter, VaultEvent};

/// Request/response against a vault serving HTTP on this machine.
///
/// Every call is one POST, so there is nothing to correlate. Replies are
/// returned and also pushed through the notifier, which keeps the upward
/// contract identical to the event-driven peer channel.
pub struct LocalChannel {
    http: Client,
    endpoint: String,
    auth_hash: RwLock<Option<String>>,
    notifier: EventNotifier,
}

impl LocalChannel {
    pub fn new(endpoint: impl Into<String>, notifier: EventNotifier) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            auth_hash: RwLock::new(None),
            notifier,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_hash.read().is_some()
    }

    /// Logs in with one `PING`, then loads the tree, tags and graph.
    pub async fn connect(&self, password: &str, status: &dyn StatusReporter) -> LinkResult<bool> {
        let auth_hash = hash_password(password);
        status.status("Using Local HTTP Mode");

        let mut body = command_body(PING, Value::Null)?;
        body.insert("authHash".into(), Value::String(auth_hash.clone()));
        let response = self.http.post(&self.endpoint).json(&body).send().await?;
        if !response.status().is_success() {
            debug!(
                target = "vault_link::local",
                status = %response.status(),
                "ping rejected"
            );
            return Err(LinkError::AuthenticationFailed);
        }
        let ping: Value = response.json().await?;
        *self.auth_hash.write() = Some(auth_hash);

        if let Some(css) = ping.pointer("/data/css").and_then(Value::as_str) {
            status.theme(css);
        }
        info!(target = "vault_link::local", endpoint = %self.endpoint, "ping accepted");
        status.status("Authenticated. Fetching Data...");
        self.notifier.notify(VaultEvent::Connected);

        for cmd in BOOTSTRAP_COMMANDS {
            self.send(cmd, Value::Null).await?;
        }
        Ok(true)
    }

    pub async fn send(&self, cmd: &str, extra: Value) -> LinkResult<Value> {
        let auth_hash = self
            .auth_hash
            .read()
            .clone()
            .ok_or(LinkError::NotConnected)?;
        let mut body = command_body(cmd, extra)?;
        body.entry("authHash")
            .or_insert_with(|| Value::String(auth_hash));

        let response = self.http.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LinkError::Transport(format!(
                "HTTP request failed: {}",
                status.as_u16()
            )));
        }
        let result: Value = response.json().await?;
        debug!(target = "vault_link::local", cmd, "command answered");
        if !result.is_null() {
            self.notifier.notify(VaultEvent::Message(result.clone()));
        }
        Ok(result)
    }

    pub fn disconnect(&self) {
        *self.auth_hash.write() = None;
    }
}
