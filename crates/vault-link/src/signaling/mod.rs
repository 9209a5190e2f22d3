//! Offer/answer exchange with the vault through a shared relay table.
//!
//! The client writes its offer as a row addressed to the vault's signal id
//! and listens on a private channel for rows whose `target` is the client's
//! own per-attempt id. Only `answer` rows are acted upon.

pub mod memory;
pub mod supabase;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::LinkResult;

pub use memory::MemoryRelay;
pub use supabase::SupabaseRelay;

const UNSUBSCRIBE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
}

/// An SDP blob as exchanged on the relay, `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

/// One row of the `signaling` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub signal_id: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub payload: Value,
    pub target: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_hash: Option<String>,
}

impl SignalingMessage {
    /// Offer row: addressed to the vault, carrying the reply address.
    pub fn offer(
        signal_id: &str,
        client_id: &str,
        description: &SessionDescription,
        auth_hash: &str,
    ) -> LinkResult<Self> {
        Ok(Self {
            signal_id: signal_id.to_string(),
            kind: SignalKind::Offer,
            payload: serde_json::to_value(description)?,
            target: signal_id.to_string(),
            client_id: client_id.to_string(),
            auth_hash: Some(auth_hash.to_string()),
        })
    }

    pub fn answer(signal_id: &str, client_id: &str, description: &SessionDescription) -> LinkResult<Self> {
        Ok(Self {
            signal_id: signal_id.to_string(),
            kind: SignalKind::Answer,
            payload: serde_json::to_value(description)?,
            target: client_id.to_string(),
            client_id: client_id.to_string(),
            auth_hash: None,
        })
    }

    pub fn description(&self) -> Option<SessionDescription> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn publish(&self, message: &SignalingMessage) -> LinkResult<()>;

    /// Opens `channel` and streams every new row whose `target` is `target`.
    async fn subscribe(&self, channel: &str, target: &str) -> LinkResult<Subscription>;
}

/// A live listener on the relay. Dropping it aborts its tasks without the
/// polite leave that [`Subscription::unsubscribe`] performs.
pub struct Subscription {
    channel: String,
    target: String,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    leave: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        channel: impl Into<String>,
        target: impl Into<String>,
        rx: mpsc::UnboundedReceiver<SignalingMessage>,
        leave: oneshot::Sender<()>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            target: target.into(),
            rx,
            leave: Some(leave),
            tasks,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Next row addressed to this subscription's target.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        while let Some(message) = self.rx.recv().await {
            if message.target == self.target {
                return Some(message);
            }
            trace!(
                target = "vault_link::signaling",
                channel = %self.channel,
                row_target = %message.target,
                "ignoring row for another client"
            );
        }
        None
    }

    pub async fn unsubscribe(mut self) {
        if let Some(leave) = self.leave.take() {
            let _ = leave.send(());
        }
        for handle in self.tasks.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout(UNSUBSCRIBE_GRACE, handle).await.is_err() {
                abort.abort();
            }
        }
        debug!(target = "vault_link::signaling", channel = %self.channel, "unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}
