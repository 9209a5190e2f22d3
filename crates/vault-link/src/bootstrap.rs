use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::config::VaultIdentity;
use crate::error::{LinkError, LinkResult};

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Ephemeral credentials for the backend that hosts the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendCredentials {
    pub url: String,
    #[serde(rename = "anonKey")]
    pub anon_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }

    pub fn is_traversal_url(url: &str) -> bool {
        let url = url.trim_start();
        url.starts_with("stun:") || url.starts_with("stuns:")
    }

    pub fn is_relay_url(url: &str) -> bool {
        let url = url.trim_start();
        url.starts_with("turn:") || url.starts_with("turns:")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// ICE servers handed out for one remote connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IceServerSet {
    servers: Vec<IceServer>,
}

impl IceServerSet {
    pub fn new(servers: Vec<IceServer>) -> Self {
        if servers.is_empty() {
            return Self::default_stun();
        }
        Self { servers }
    }

    pub fn default_stun() -> Self {
        Self {
            servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServer::new(vec![url.to_string()]))
                .collect(),
        }
    }

    /// Only the NAT-traversal URLs of each entry; entries left empty are dropped.
    pub fn traversal_only(&self) -> Vec<IceServer> {
        self.servers
            .iter()
            .filter_map(|server| {
                let urls: Vec<String> = server
                    .urls
                    .iter()
                    .filter(|url| IceServer::is_traversal_url(url))
                    .cloned()
                    .collect();
                (!urls.is_empty()).then(|| IceServer {
                    urls,
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                })
            })
            .collect()
    }

    pub fn all(&self) -> Vec<IceServer> {
        self.servers.clone()
    }

    pub fn has_relay(&self) -> bool {
        self.servers
            .iter()
            .any(|server| server.urls.iter().any(|url| IceServer::is_relay_url(url)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    pub backend: BackendCredentials,
    pub ice_servers: IceServerSet,
}

#[derive(Debug, Deserialize)]
struct BootstrapResponse {
    supabase: BackendCredentials,
    #[serde(default, rename = "iceServers")]
    ice_servers: Option<Vec<IceServer>>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct BootstrapRequest<'a> {
    email: Option<&'a str>,
    #[serde(rename = "vaultId")]
    vault_id: &'a str,
}

/// Client for the service that issues backend credentials and ICE servers.
#[derive(Debug, Clone)]
pub struct BootstrapClient {
    http: Client,
    url: String,
}

impl BootstrapClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
        }
    }

    /// Every failure, including an `{error}` body, is `ServiceUnreachable`.
    pub async fn fetch(&self, vault: &VaultIdentity) -> LinkResult<Bootstrap> {
        let request = BootstrapRequest {
            email: vault.user_email.as_deref(),
            vault_id: &vault.vault_id,
        };
        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|err| LinkError::ServiceUnreachable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let reason = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|body| body.error)
                .unwrap_or_else(|| "Failed to initialize connection".to_string());
            warn!(
                target = "vault_link::bootstrap",
                status = %status,
                reason = %reason,
                "bootstrap request rejected"
            );
            return Err(LinkError::ServiceUnreachable(reason));
        }

        let body: BootstrapResponse = response
            .json()
            .await
            .map_err(|err| LinkError::ServiceUnreachable(format!("invalid bootstrap reply: {err}")))?;
        info!(
            target = "vault_link::bootstrap",
            vault_id = %vault.vault_id,
            ice_servers = body.ice_servers.as_ref().map_or(0, Vec::len),
            "connection credentials obtained"
        );
        Ok(Bootstrap {
            backend: body.supabase,
            ice_servers: IceServerSet::new(body.ice_servers.unwrap_or_default()),
        })
    }
}
