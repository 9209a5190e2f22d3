use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::peer::engine::RouteInfo;

/// Informational label for how a session reaches its vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkClass {
    Lan,
    RelayAssisted,
    Cloud,
}

impl NetworkClass {
    pub fn from_route(route: &RouteInfo) -> Self {
        if route.relayed {
            return NetworkClass::RelayAssisted;
        }
        match route.remote_ip {
            Some(ip) if is_local_network(ip) => NetworkClass::Lan,
            _ => NetworkClass::Cloud,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NetworkClass::Lan => "lan",
            NetworkClass::RelayAssisted => "relay-assisted",
            NetworkClass::Cloud => "cloud",
        }
    }
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_local_network(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            // 100.64.0.0/10 is carrier-grade NAT space.
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || (a == 100 && (64..128).contains(&b))
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionEventKind {
    Connected,
    Failed,
}

/// Body posted to the connection-event endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    /// Signal id of the vault; the log service keys events by it.
    pub vault_id: String,
    pub event_type: ConnectionEventKind,
    pub error_message: Option<String>,
    pub turn_used: bool,
}

impl ConnectionEvent {
    pub fn connected(vault_id: &str, turn_used: bool) -> Self {
        Self {
            vault_id: vault_id.to_string(),
            event_type: ConnectionEventKind::Connected,
            error_message: None,
            turn_used,
        }
    }

    pub fn failed(vault_id: &str, error: &str) -> Self {
        Self {
            vault_id: vault_id.to_string(),
            event_type: ConnectionEventKind::Failed,
            error_message: Some(error.to_string()),
            turn_used: false,
        }
    }
}

/// Fire-and-forget sink for connection outcomes. Implementations swallow
/// their own failures.
#[async_trait]
pub trait ConnectionEventLogger: Send + Sync {
    async fn log(&self, event: ConnectionEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventLogger;

#[async_trait]
impl ConnectionEventLogger for NoopEventLogger {
    async fn log(&self, _event: ConnectionEvent) {}
}

pub const EVENT_LOG_TIMEOUT: Duration = Duration::from_secs(5);

fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Posts events with the user's session token; does nothing without one.
#[derive(Debug, Clone)]
pub struct HttpEventLogger {
    http: Client,
    url: String,
    token: Option<String>,
}

impl HttpEventLogger {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: http_client(EVENT_LOG_TIMEOUT),
            url: url.into(),
            token,
        }
    }

    /// Bounds each post, response body included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = http_client(timeout);
        self
    }
}

#[async_trait]
impl ConnectionEventLogger for HttpEventLogger {
    async fn log(&self, event: ConnectionEvent) {
        let Some(token) = self.token.as_deref() else {
            debug!(target = "vault_link::events", kind = ?event.event_type, "no session token; event skipped");
            return;
        };
        match self.http.post(&self.url).bearer_auth(token).json(&event).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(target = "vault_link::events", kind = ?event.event_type, "connection event logged");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    target = "vault_link::events",
                    status = %status,
                    body = %body,
                    "failed to log connection event"
                );
            }
            Err(err) => {
                warn!(target = "vault_link::events", error = %err, "error logging connection event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn route(relayed: bool, ip: &str) -> RouteInfo {
        RouteInfo {
            relayed,
            remote_ip: ip.parse().ok(),
        }
    }

    #[test]
    fn classifies_routes() {
        assert_eq!(NetworkClass::from_route(&route(true, "192.168.1.5")), NetworkClass::RelayAssisted);
        assert_eq!(NetworkClass::from_route(&route(false, "192.168.1.5")), NetworkClass::Lan);
        assert_eq!(NetworkClass::from_route(&route(false, "10.0.0.2")), NetworkClass::Lan);
        assert_eq!(NetworkClass::from_route(&route(false, "100.100.1.1")), NetworkClass::Lan);
        assert_eq!(NetworkClass::from_route(&route(false, "fd00::1")), NetworkClass::Lan);
        assert_eq!(NetworkClass::from_route(&route(false, "203.0.113.7")), NetworkClass::Cloud);
        assert_eq!(NetworkClass::from_route(&route(false, "")), NetworkClass::Cloud);
    }

    #[tokio::test]
    async fn stalled_endpoint_gives_up_after_timeout() {
        use axum::routing::post;
        use axum::Router;

        let router = Router::new().route(
            "/log",
            post(|| async {
                std::future::pending::<()>().await;
                ""
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let logger = HttpEventLogger::new(format!("http://{addr}/log"), Some("token".into()))
            .with_timeout(Duration::from_millis(100));
        tokio::time::timeout(
            Duration::from_secs(2),
            logger.log(ConnectionEvent::connected("signal-1", false)),
        )
        .await
        .expect("log returns once the request times out");
    }

    #[test]
    fn event_body_uses_camel_case() {
        let body = serde_json::to_value(ConnectionEvent::connected("vault-1", true)).unwrap();
        assert_eq!(
            body,
            json!({"vaultId": "vault-1", "eventType": "connected", "errorMessage": null, "turnUsed": true})
        );
        let failed = serde_json::to_value(ConnectionEvent::failed("vault-1", "timeout")).unwrap();
        assert_eq!(failed["eventType"], "failed");
        assert_eq!(failed["errorMessage"], "timeout");
    }
}
