use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, trace, warn};
use url::Url;

use super::{SignalingMessage, SignalingRelay, Subscription};
use crate::bootstrap::BackendCredentials;
use crate::error::{to_signaling_error, LinkError, LinkResult};

const TABLE: &str = "signaling";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Phoenix channel frame as spoken by the realtime endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, rename = "ref")]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

/// Relay over a Supabase project: rows are inserted through PostgREST and
/// observed through realtime `postgres_changes` on the `signaling` table.
pub struct SupabaseRelay {
    http: Client,
    credentials: BackendCredentials,
    access_token: Option<String>,
    refs: Arc<AtomicU64>,
}

impl SupabaseRelay {
    pub fn new(credentials: BackendCredentials) -> Self {
        Self {
            http: Client::new(),
            credentials,
            access_token: None,
            refs: Arc::new(AtomicU64::new(1)),
        }
    }

    /// User token sent instead of the anon key when present.
    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    fn bearer(&self) -> &str {
        self.access_token
            .as_deref()
            .unwrap_or(&self.credentials.anon_key)
    }

    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

#[async_trait]
impl SignalingRelay for SupabaseRelay {
    async fn publish(&self, message: &SignalingMessage) -> LinkResult<()> {
        let url = rest_url(&self.credentials.url);
        let response = self
            .http
            .post(&url)
            .header("apikey", &self.credentials.anon_key)
            .bearer_auth(self.bearer())
            .header("Prefer", "return=minimal")
            .json(message)
            .send()
            .await
            .map_err(to_signaling_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LinkError::Signaling(format!(
                "insert into {TABLE} failed with {status}: {body}"
            )));
        }
        debug!(
            target = "vault_link::signaling",
            kind = ?message.kind,
            target_id = %message.target,
            "signaling row inserted"
        );
        Ok(())
    }

    async fn subscribe(&self, channel: &str, target: &str) -> LinkResult<Subscription> {
        let url = realtime_url(&self.credentials.url, &self.credentials.anon_key)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| LinkError::Signaling(format!("realtime connect failed: {err}")))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let topic = format!("realtime:{channel}");
        let join_ref = self.next_ref();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<PhoenixMessage>();
        let (rows_tx, rows_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (leave_tx, mut leave_rx) = oneshot::channel::<()>();
        let (joined_tx, joined_rx) = oneshot::channel::<Result<(), String>>();

        let leave_message = PhoenixMessage {
            topic: topic.clone(),
            event: "phx_leave".into(),
            payload: json!({}),
            reference: Some(self.next_ref()),
            join_ref: Some(join_ref.clone()),
        };
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut leave_rx => {
                        if let Ok(text) = serde_json::to_string(&leave_message) {
                            let _ = ws_write.send(Message::Text(text)).await;
                        }
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                    outbound = send_rx.recv() => {
                        let Some(outbound) = outbound else { break };
                        if let Ok(text) = serde_json::to_string(&outbound) {
                            if ws_write.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        let reader_join_ref = join_ref.clone();
        let reader = tokio::spawn(async move {
            let mut joined_tx = Some(joined_tx);
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target = "vault_link::signaling", "realtime socket closed: {err}");
                            }
                            _ => {
                                warn!(target = "vault_link::signaling", "realtime socket error: {err}");
                            }
                        }
                        break;
                    }
                };
                trace!(target = "vault_link::signaling", event = "ws_in", len = text.len());
                let Ok(inbound) = serde_json::from_str::<PhoenixMessage>(&text) else {
                    continue;
                };
                if inbound.event == "phx_reply"
                    && inbound.reference.as_deref() == Some(reader_join_ref.as_str())
                {
                    if let Some(joined) = joined_tx.take() {
                        let _ = joined.send(join_outcome(&inbound.payload));
                    }
                    continue;
                }
                if let Some(row) = inserted_row(&inbound) {
                    if rows_tx.send(row).is_err() {
                        break;
                    }
                }
            }
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_refs = Arc::clone(&self.refs);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_tx.closed() => break,
                    _ = ticker.tick() => {
                        let beat = PhoenixMessage {
                            topic: "phoenix".into(),
                            event: "heartbeat".into(),
                            payload: json!({}),
                            reference: Some(heartbeat_refs.fetch_add(1, Ordering::Relaxed).to_string()),
                            join_ref: None,
                        };
                        if heartbeat_tx.send(beat).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let subscription = Subscription::new(
            channel,
            target,
            rows_rx,
            leave_tx,
            vec![writer, reader, heartbeat],
        );

        send_tx
            .send(PhoenixMessage {
                topic: topic.clone(),
                event: "phx_join".into(),
                payload: join_payload(target, self.bearer()),
                reference: Some(join_ref.clone()),
                join_ref: Some(join_ref),
            })
            .map_err(|_| LinkError::Signaling("realtime writer closed".into()))?;

        match tokio::time::timeout(JOIN_TIMEOUT, joined_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(target = "vault_link::signaling", %topic, "realtime channel joined");
                Ok(subscription)
            }
            Ok(Ok(Err(reason))) => Err(LinkError::Signaling(format!("join rejected: {reason}"))),
            Ok(Err(_)) => Err(LinkError::Signaling("realtime socket closed before join".into())),
            Err(_) => Err(LinkError::Signaling("realtime join timed out".into())),
        }
    }
}

fn rest_url(base: &str) -> String {
    format!("{}/rest/v1/{TABLE}", base.trim_end_matches('/'))
}

fn realtime_url(base: &str, api_key: &str) -> LinkResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|err| LinkError::Config(format!("invalid backend url {base}: {err}")))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| LinkError::Config("invalid websocket scheme".into()))?;
    url.set_path("realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    url.set_fragment(None);
    Ok(url)
}

fn join_payload(target: &str, access_token: &str) -> Value {
    json!({
        "config": {
            "broadcast": {"self": false},
            "presence": {"key": ""},
            "postgres_changes": [{
                "event": "INSERT",
                "schema": "public",
                "table": TABLE,
                "filter": format!("target=eq.{target}"),
            }],
        },
        "access_token": access_token,
    })
}

fn join_outcome(payload: &Value) -> Result<(), String> {
    match payload.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        other => Err(payload
            .pointer("/response/reason")
            .and_then(Value::as_str)
            .or(other)
            .unwrap_or("unknown")
            .to_string()),
    }
}

fn inserted_row(message: &PhoenixMessage) -> Option<SignalingMessage> {
    let record = match message.event.as_str() {
        "postgres_changes" => message.payload.pointer("/data/record"),
        "INSERT" => message.payload.get("record"),
        _ => None,
    }?;
    match serde_json::from_value(record.clone()) {
        Ok(row) => Some(row),
        Err(err) => {
            trace!(target = "vault_link::signaling", error = %err, "skipping unparseable row");
            None
        }
    }
}
