//! Remote sessions: two-phase peer connection, answer handling, framing and
//! request/reply over the data channel.

pub mod chunk;
pub mod engine;
pub mod ingress;
pub mod phase;
pub mod rtc;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::auth::hash_password;
use crate::bootstrap::{BackendCredentials, BootstrapClient, IceServer};
use crate::command::{command_body, REQUEST_ID_FIELD};
use crate::config::{LinkConfig, VaultIdentity};
use crate::correlator::RequestCorrelator;
use crate::error::{LinkError, LinkResult};
use crate::events::{ConnectionEvent, ConnectionEventLogger, HttpEventLogger, NetworkClass};
use crate::notifier::{EventNotifier, StatusReporter, VaultEvent};
use crate::signaling::{SignalKind, SignalingMessage, SignalingRelay, SupabaseRelay, Subscription};

use self::engine::{PeerEngine, PeerEngineFactory, PeerEvent};
use self::ingress::Ingress;
use self::phase::{
    ConnectPhase, PhaseOutcome, PhasePolicy, STATUS_DIRECT, STATUS_FAILED, STATUS_INITIALIZING,
    STATUS_RELAY, STATUS_RELAY_SWITCH, STATUS_SERVICE_UNREACHABLE,
};
use self::rtc::WebRtcEngineFactory;

const CHANNEL_PREFIX: &str = "portal-signaling-";

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}

fn new_client_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("web-{}-{}", unix_millis(), &suffix[..9])
}

/// Engine that reached `Connected` and is serving requests.
#[derive(Clone)]
struct LiveEngine {
    generation: u64,
    engine: Arc<dyn PeerEngine>,
}

/// Answer listener for one attempt; stopping it unsubscribes from the relay.
struct AnswerListener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl AnswerListener {
    fn spawn(mut subscription: Subscription, engine: Arc<dyn PeerEngine>) -> Self {
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    row = subscription.recv() => {
                        let Some(row) = row else { break };
                        if row.kind != SignalKind::Answer {
                            trace!(target = "vault_link::signaling", kind = ?row.kind, "ignoring non-answer row");
                            continue;
                        }
                        let Some(answer) = row.description() else {
                            warn!(target = "vault_link::signaling", "answer row without a session description");
                            continue;
                        };
                        debug!(target = "vault_link::signaling", client_id = %row.client_id, "answer received");
                        if let Err(err) = engine.apply_answer(answer).await {
                            warn!(target = "vault_link::signaling", error = %err, "failed to apply answer");
                        }
                    }
                }
            }
            subscription.unsubscribe().await;
        });
        Self { stop, task }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.task.await {
            if !err.is_cancelled() {
                warn!(target = "vault_link::signaling", error = %err, "answer listener panicked");
            }
        }
    }
}

/// Everything one attempt owns; dropped as a unit by `teardown`.
struct Attempt {
    generation: u64,
    client_id: String,
    engine: Arc<dyn PeerEngine>,
    listener: Option<AnswerListener>,
    pump: Option<JoinHandle<()>>,
}

struct Established {
    events: mpsc::UnboundedReceiver<PeerEvent>,
    early_frames: Vec<String>,
}

enum AttemptFailure {
    TimedOut,
    Failed(LinkError),
}

/// Drives remote sessions to a vault.
pub struct PeerSessionManager {
    config: LinkConfig,
    bootstrap: BootstrapClient,
    factory: Arc<dyn PeerEngineFactory>,
    relay_override: Option<Arc<dyn SignalingRelay>>,
    backend: OnceCell<Arc<dyn SignalingRelay>>,
    event_logger: Arc<dyn ConnectionEventLogger>,
    correlator: RequestCorrelator,
    notifier: EventNotifier,
    live: Arc<RwLock<Option<LiveEngine>>>,
    attempt: Mutex<Option<Attempt>>,
    generation: AtomicU64,
    network: RwLock<Option<NetworkClass>>,
    connect_lock: AsyncMutex<()>,
}

impl PeerSessionManager {
    pub fn new(config: LinkConfig, notifier: EventNotifier) -> Self {
        let bootstrap = BootstrapClient::new(config.bootstrap_url.clone());
        let event_logger = Arc::new(HttpEventLogger::new(
            config.event_log_url.clone(),
            config.session_token.clone(),
        ));
        Self {
            config,
            bootstrap,
            factory: Arc::new(WebRtcEngineFactory),
            relay_override: None,
            backend: OnceCell::new(),
            event_logger,
            correlator: RequestCorrelator::new(),
            notifier,
            live: Arc::new(RwLock::new(None)),
            attempt: Mutex::new(None),
            generation: AtomicU64::new(0),
            network: RwLock::new(None),
            connect_lock: AsyncMutex::new(()),
        }
    }

    pub fn with_engine_factory(mut self, factory: Arc<dyn PeerEngineFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Uses `relay` instead of the backend named by the bootstrap reply.
    pub fn with_relay(mut self, relay: Arc<dyn SignalingRelay>) -> Self {
        self.relay_override = Some(relay);
        self
    }

    pub fn with_event_logger(mut self, logger: Arc<dyn ConnectionEventLogger>) -> Self {
        self.event_logger = logger;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.live
            .read()
            .as_ref()
            .is_some_and(|live| live.engine.is_connected())
    }

    pub fn network(&self) -> Option<NetworkClass> {
        *self.network.read()
    }

    /// Reply address of the current attempt.
    pub fn client_id(&self) -> Option<String> {
        self.attempt.lock().as_ref().map(|attempt| attempt.client_id.clone())
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending()
    }

    /// Created from the first credentials seen and kept for the manager's lifetime.
    async fn relay(&self, credentials: &BackendCredentials) -> Arc<dyn SignalingRelay> {
        self.backend
            .get_or_init(|| async {
                match &self.relay_override {
                    Some(relay) => Arc::clone(relay),
                    None => {
                        debug!(target = "vault_link::peer", url = %credentials.url, "initialising signaling backend");
                        let relay = SupabaseRelay::new(credentials.clone())
                            .with_access_token(self.config.session_token.clone());
                        Arc::new(relay) as Arc<dyn SignalingRelay>
                    }
                }
            })
            .await
            .clone()
    }

    pub async fn connect(&self, password: &str, status: &dyn StatusReporter) -> LinkResult<bool> {
        let _guard = self.connect_lock.lock().await;
        let vault = self.config.vault.clone().ok_or(LinkError::MissingVault)?;
        let auth_hash = hash_password(password);

        let mut phase = ConnectPhase::Init;
        status.status(STATUS_INITIALIZING);
        phase = self.advance(phase, PhaseOutcome::Started)?;

        let bootstrap = match self.bootstrap.fetch(&vault).await {
            Ok(bootstrap) => bootstrap,
            Err(err) => {
                self.advance(phase, PhaseOutcome::CredentialsFailed)?;
                status.status(STATUS_SERVICE_UNREACHABLE);
                return Err(err);
            }
        };
        let relay = self.relay(&bootstrap.backend).await;
        phase = self.advance(phase, PhaseOutcome::CredentialsReady)?;
        status.status(STATUS_DIRECT);

        loop {
            let policy = phase
                .policy(&self.config)
                .ok_or_else(|| LinkError::ConnectionFailed(format!("no attempt policy for {phase}")))?;
            if phase == ConnectPhase::AttemptRelay {
                self.teardown().await;
                status.status(STATUS_RELAY_SWITCH);
                tokio::time::sleep(policy.settle).await;
                status.status(STATUS_RELAY);
            }

            let servers = policy.servers.pick(&bootstrap.ice_servers);
            let outcome = match tokio::time::timeout(
                policy.deadline,
                self.establish(&vault, &auth_hash, servers, Arc::clone(&relay)),
            )
            .await
            {
                Ok(Ok(established)) => Ok(established),
                Ok(Err(err)) => Err(AttemptFailure::Failed(err)),
                Err(_) => Err(AttemptFailure::TimedOut),
            };

            let (trigger, failure) = match outcome {
                Ok(established) => {
                    self.advance(phase, PhaseOutcome::PeerConnected)?;
                    self.on_connected(&vault, established, policy).await?;
                    return Ok(true);
                }
                Err(AttemptFailure::TimedOut) => (
                    PhaseOutcome::TimedOut,
                    LinkError::ConnectionFailed("Connection timeout".into()),
                ),
                Err(AttemptFailure::Failed(err)) => (
                    PhaseOutcome::PeerFailed,
                    LinkError::ConnectionFailed(err.to_string()),
                ),
            };
            debug!(
                target = "vault_link::peer",
                phase = %phase,
                error = %failure,
                "attempt did not connect"
            );
            phase = self.advance(phase, trigger)?;
            if phase == ConnectPhase::Failed {
                self.teardown().await;
                status.status(STATUS_FAILED);
                let message = failure.to_string();
                self.log_event(ConnectionEvent::failed(&vault.signal_id, &message));
                return Err(failure);
            }
        }
    }

    /// Events go out on their own task; a slow logger never holds up `connect`.
    fn log_event(&self, event: ConnectionEvent) {
        let logger = Arc::clone(&self.event_logger);
        tokio::spawn(async move {
            logger.log(event).await;
        });
    }

    fn advance(&self, phase: ConnectPhase, outcome: PhaseOutcome) -> LinkResult<ConnectPhase> {
        let next = phase.next(outcome).ok_or_else(|| {
            LinkError::ConnectionFailed(format!("invalid transition from {phase} on {outcome:?}"))
        })?;
        info!(target = "vault_link::peer", from = %phase, to = %next, "connect phase");
        Ok(next)
    }

    /// One attempt up to the data channel opening. Runs under the phase deadline.
    async fn establish(
        &self,
        vault: &VaultIdentity,
        auth_hash: &str,
        servers: Vec<IceServer>,
        relay: Arc<dyn SignalingRelay>,
    ) -> LinkResult<Established> {
        self.teardown().await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let client_id = new_client_id();
        let channel = format!("{CHANNEL_PREFIX}{}", unix_millis());
        debug!(
            target = "vault_link::peer",
            client_id = %client_id,
            servers = servers.len(),
            "creating peer engine"
        );

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let engine = self.factory.create(servers, events_tx).await?;
        *self.attempt.lock() = Some(Attempt {
            generation,
            client_id: client_id.clone(),
            engine: Arc::clone(&engine),
            listener: None,
            pump: None,
        });

        let subscription = relay.subscribe(&channel, &client_id).await?;
        let listener = AnswerListener::spawn(subscription, Arc::clone(&engine));
        let orphan = {
            let mut attempt = self.attempt.lock();
            match attempt.as_mut() {
                Some(current) if current.generation == generation => {
                    current.listener = Some(listener);
                    None
                }
                _ => Some(listener),
            }
        };
        if let Some(listener) = orphan {
            listener.stop().await;
            return Err(LinkError::NotConnected);
        }

        let offer = engine.create_offer().await?;
        let row = SignalingMessage::offer(&vault.signal_id, &client_id, &offer, auth_hash)?;
        relay.publish(&row).await?;
        debug!(target = "vault_link::peer", client_id = %client_id, "offer published");

        let mut early_frames = Vec::new();
        loop {
            match events.recv().await {
                Some(PeerEvent::Connected) => break,
                Some(PeerEvent::Data(text)) => early_frames.push(text),
                Some(PeerEvent::Error(reason)) => return Err(LinkError::Engine(reason)),
                Some(PeerEvent::Closed) | None => {
                    return Err(LinkError::Engine("peer closed before connecting".into()))
                }
            }
        }
        Ok(Established {
            events,
            early_frames,
        })
    }

    async fn on_connected(
        &self,
        vault: &VaultIdentity,
        established: Established,
        policy: PhasePolicy,
    ) -> LinkResult<()> {
        let (generation, engine, client_id) = {
            let attempt = self.attempt.lock();
            let attempt = attempt.as_ref().ok_or(LinkError::NotConnected)?;
            (attempt.generation, Arc::clone(&attempt.engine), attempt.client_id.clone())
        };

        let route = engine.route().await;
        let turn_used = route.as_ref().is_some_and(|route| route.relayed);
        let network = route
            .as_ref()
            .map(NetworkClass::from_route)
            .unwrap_or(NetworkClass::Cloud);
        *self.network.write() = Some(network);

        *self.live.write() = Some(LiveEngine { generation, engine });
        info!(
            target = "vault_link::peer",
            client_id = %client_id,
            network = %network,
            turn_used,
            relays_offered = policy.servers.uses_relays(),
            "peer channel connected"
        );
        self.log_event(ConnectionEvent::connected(&vault.signal_id, turn_used));
        self.notifier.notify(VaultEvent::Connected);

        // Frames that raced ahead stay queued in `established` until the pump runs.
        let pump = self.spawn_pump(generation, established);
        if let Some(attempt) = self.attempt.lock().as_mut() {
            attempt.pump = Some(pump);
        }
        Ok(())
    }

    fn spawn_pump(&self, generation: u64, established: Established) -> JoinHandle<()> {
        let Established {
            mut events,
            early_frames,
        } = established;
        let mut ingress = Ingress::new(
            self.config.chunk,
            self.correlator.clone(),
            self.notifier.clone(),
        );
        let live = Arc::clone(&self.live);
        let correlator = self.correlator.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            for frame in &early_frames {
                ingress.handle_frame(frame);
            }
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::Data(text) => ingress.handle_frame(&text),
                    PeerEvent::Connected => {}
                    PeerEvent::Error(reason) => {
                        warn!(target = "vault_link::peer", error = %reason, "peer channel failed");
                        break;
                    }
                    PeerEvent::Closed => {
                        info!(target = "vault_link::peer", "peer channel closed");
                        break;
                    }
                }
            }
            let was_live = {
                let mut live = live.write();
                if live.as_ref().map(|current| current.generation) == Some(generation) {
                    live.take();
                    true
                } else {
                    false
                }
            };
            if was_live {
                correlator.fail_all();
                notifier.notify(VaultEvent::Disconnected);
            }
        })
    }

    /// Sends `{cmd, requestId, ...extra}` and waits for the matching reply.
    pub async fn send(&self, cmd: &str, extra: Value) -> LinkResult<Value> {
        let engine = self
            .live
            .read()
            .as_ref()
            .map(|live| Arc::clone(&live.engine))
            .ok_or(LinkError::NotConnected)?;
        if !engine.is_connected() {
            return Err(LinkError::NotConnected);
        }

        let mut body = command_body(cmd, extra)?;
        let pending = self.correlator.register(cmd, self.config.request_timeout);
        body.insert(
            REQUEST_ID_FIELD.into(),
            Value::String(pending.request_id().to_string()),
        );
        let text = serde_json::to_string(&body)?;
        if let Err(err) = engine.send_text(&text).await {
            pending.cancel();
            return Err(err);
        }
        trace!(target = "vault_link::peer", cmd, request_id = %pending.request_id(), "command sent");
        pending.wait().await
    }

    /// Stops answer handling, closes the engine and forgets the session.
    async fn teardown(&self) {
        let attempt = self.attempt.lock().take();
        self.live.write().take();
        self.network.write().take();
        let Some(attempt) = attempt else {
            return;
        };
        if let Some(listener) = attempt.listener {
            listener.stop().await;
        }
        if let Some(pump) = attempt.pump {
            pump.abort();
        }
        attempt.engine.close().await;
        debug!(target = "vault_link::peer", client_id = %attempt.client_id, "attempt torn down");
    }

    pub async fn shutdown(&self) {
        let was_live = self.live.read().is_some();
        self.teardown().await;
        let failed = self.correlator.fail_all();
        if was_live {
            self.notifier.notify(VaultEvent::Disconnected);
        }
        debug!(target = "vault_link::peer", failed, "peer session shut down");
    }
}
