use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bootstrap::IceServer;
use crate::error::LinkResult;
use crate::signaling::SessionDescription;

/// What an engine reports about its data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The data channel is open and usable.
    Connected,
    Data(String),
    /// ICE or the channel failed; the engine is unusable.
    Error(String),
    Closed,
}

/// Candidate pair the engine ended up using.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteInfo {
    pub relayed: bool,
    pub remote_ip: Option<IpAddr>,
}

/// One offering peer connection with a single reliable text channel.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Offer with every local candidate already gathered.
    async fn create_offer(&self) -> LinkResult<SessionDescription>;

    /// Applies the remote answer. Applying a second answer is a no-op.
    async fn apply_answer(&self, answer: SessionDescription) -> LinkResult<()>;

    async fn send_text(&self, text: &str) -> LinkResult<()>;

    fn is_connected(&self) -> bool;

    /// `None` until a pair has been selected.
    async fn route(&self) -> Option<RouteInfo>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerEngineFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> LinkResult<Arc<dyn PeerEngine>>;
}
