use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::LinkConfig;
use crate::error::LinkResult;
use crate::events::{ConnectionEventLogger, NetworkClass};
use crate::local::LocalChannel;
use crate::mode::TransportMode;
use crate::notifier::{EventHandler, EventNotifier, StatusReporter};
use crate::peer::engine::PeerEngineFactory;
use crate::peer::PeerSessionManager;
use crate::signaling::SignalingRelay;
use crate::telemetry::{NoopTelemetry, TelemetrySink};

/// One request/response API over whichever transport reaches the vault.
///
/// The mode is fixed at construction from `config.host`: a loopback host
/// talks HTTP to the local endpoint, anything else goes through the
/// two-phase peer connection.
pub struct VaultConnection {
    mode: TransportMode,
    notifier: EventNotifier,
    local: LocalChannel,
    peer: PeerSessionManager,
    telemetry: Arc<dyn TelemetrySink>,
}

impl VaultConnection {
    pub fn new(config: LinkConfig) -> Self {
        let mode = TransportMode::from_host(&config.host);
        let notifier = EventNotifier::new();
        let local = LocalChannel::new(config.local_endpoint.clone(), notifier.clone());
        let peer = PeerSessionManager::new(config, notifier.clone());
        debug!(target = "vault_link::connection", mode = %mode, "transport selected");
        Self {
            mode,
            notifier,
            local,
            peer,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_engine_factory(mut self, factory: Arc<dyn PeerEngineFactory>) -> Self {
        self.peer = self.peer.with_engine_factory(factory);
        self
    }

    pub fn with_relay(mut self, relay: Arc<dyn SignalingRelay>) -> Self {
        self.peer = self.peer.with_relay(relay);
        self
    }

    pub fn with_event_logger(mut self, logger: Arc<dyn ConnectionEventLogger>) -> Self {
        self.peer = self.peer.with_event_logger(logger);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn set_handler<H: EventHandler + 'static>(&self, handler: H) {
        self.notifier.set_handler(handler);
    }

    pub fn clear_handler(&self) {
        self.notifier.clear_handler();
    }

    pub fn is_connected(&self) -> bool {
        match self.mode {
            TransportMode::Local => self.local.is_authenticated(),
            TransportMode::Remote => self.peer.is_connected(),
        }
    }

    pub fn network(&self) -> Option<NetworkClass> {
        match self.mode {
            TransportMode::Local => self.local.is_authenticated().then_some(NetworkClass::Lan),
            TransportMode::Remote => self.peer.network(),
        }
    }

    /// Reply address of the current remote attempt.
    pub fn client_id(&self) -> Option<String> {
        match self.mode {
            TransportMode::Local => None,
            TransportMode::Remote => self.peer.client_id(),
        }
    }

    pub async fn connect(&self, password: &str, status: &dyn StatusReporter) -> LinkResult<bool> {
        let connected = match self.mode {
            TransportMode::Local => self.local.connect(password, status).await?,
            TransportMode::Remote => self.peer.connect(password, status).await?,
        };
        let network = self.network();
        info!(
            target = "vault_link::connection",
            mode = %self.mode,
            network = ?network,
            "connected to vault"
        );
        self.telemetry.record(
            "vault_connected",
            json!({
                "mode": self.mode.as_str(),
                "network": network.map(NetworkClass::as_str),
            }),
        );
        Ok(connected)
    }

    /// `extra` is merged into the command body and must be an object or null.
    pub async fn send(&self, cmd: &str, extra: Value) -> LinkResult<Value> {
        match self.mode {
            TransportMode::Local => self.local.send(cmd, extra).await,
            TransportMode::Remote => self.peer.send(cmd, extra).await,
        }
    }

    /// Ends the session and drains telemetry.
    pub async fn shutdown(&self) {
        match self.mode {
            TransportMode::Local => self.local.disconnect(),
            TransportMode::Remote => self.peer.shutdown().await,
        }
        self.telemetry.flush_blocking();
        debug!(target = "vault_link::connection", "shutdown complete");
    }
}
