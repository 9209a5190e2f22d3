#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vault_link::{
    ConnectionEvent, ConnectionEventLogger, IceServer, LinkConfig, LinkError, LinkResult,
    MemoryRelay, PeerEngine, PeerEngineFactory, PeerEvent, RouteInfo, SessionDescription,
    SignalKind, SignalingMessage, SignalingRelay, StatusReporter, TelemetrySink, VaultEvent,
    VaultIdentity,
};

pub const SIGNAL_ID: &str = "signal-123";
pub const VAULT_ID: &str = "vault-abc";

pub async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr
}

/// Bootstrap service answering every request with `status` and `body`.
pub async fn spawn_bootstrap(status: StatusCode, body: Value) -> (String, Arc<Mutex<Vec<Value>>>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    let router = Router::new().route(
        "/api/plugin-init",
        post(move |Json(request): Json<Value>| {
            let seen = seen.clone();
            let body = body.clone();
            async move {
                seen.lock().push(request);
                (status, Json(body))
            }
        }),
    );
    let addr = serve(router).await;
    (format!("http://{addr}/api/plugin-init"), requests)
}

pub fn bootstrap_body() -> Value {
    json!({
        "supabase": {"url": "https://backend.invalid", "anonKey": "anon"},
        "iceServers": [
            {"urls": "stun:stun.example.org:3478"},
            {"urls": ["turn:relay.example.org:3478"], "username": "u", "credential": "c"}
        ]
    })
}

pub fn remote_config(bootstrap_url: &str) -> LinkConfig {
    let mut config = LinkConfig::default().with_vault(VaultIdentity {
        vault_id: VAULT_ID.into(),
        signal_id: SIGNAL_ID.into(),
        user_email: Some("owner@example.org".into()),
    });
    config.host = "notes.example.org".into();
    config.bootstrap_url = bootstrap_url.into();
    config.direct_timeout = Duration::from_millis(300);
    config.relay_settle = Duration::from_millis(20);
    config.relay_timeout = Duration::from_millis(600);
    config.request_timeout = Duration::from_millis(300);
    config
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Never connects, even after an answer.
    Silent,
    /// Opens the channel on the first answer.
    ConnectOnAnswer { relayed: bool },
    /// Reports an engine error as soon as the offer is made.
    FailOnOffer,
    /// Opens on the first answer and hangs up straight away.
    ConnectThenHangUp,
}

pub type Responder = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

pub struct FakeEngine {
    pub index: usize,
    pub ice_servers: Vec<IceServer>,
    behavior: Behavior,
    events: mpsc::UnboundedSender<PeerEvent>,
    responder: Option<Responder>,
    connected: AtomicBool,
    closed: AtomicBool,
    answers: Mutex<Vec<String>>,
    sent: Mutex<Vec<Value>>,
}

impl FakeEngine {
    pub fn answers(&self) -> Vec<String> {
        self.answers.lock().clone()
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Frame arriving from the vault.
    pub fn push_frame(&self, text: &str) {
        let _ = self.events.send(PeerEvent::Data(text.to_string()));
    }

    /// The vault side hangs up.
    pub fn drop_remote(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(PeerEvent::Closed);
    }
}

#[async_trait]
impl PeerEngine for FakeEngine {
    async fn create_offer(&self) -> LinkResult<SessionDescription> {
        if let Behavior::FailOnOffer = self.behavior {
            let _ = self.events.send(PeerEvent::Error("ice failed".into()));
        }
        Ok(SessionDescription::offer(format!("offer-{}", self.index)))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> LinkResult<()> {
        let first = {
            let mut answers = self.answers.lock();
            answers.push(answer.sdp);
            answers.len() == 1
        };
        if first {
            match self.behavior {
                Behavior::ConnectOnAnswer { .. } => {
                    self.connected.store(true, Ordering::SeqCst);
                    let _ = self.events.send(PeerEvent::Connected);
                }
                Behavior::ConnectThenHangUp => {
                    let _ = self.events.send(PeerEvent::Connected);
                    let _ = self.events.send(PeerEvent::Closed);
                }
                Behavior::Silent | Behavior::FailOnOffer => {}
            }
        }
        Ok(())
    }

    async fn send_text(&self, text: &str) -> LinkResult<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let message: Value = serde_json::from_str(text)?;
        self.sent.lock().push(message.clone());
        if let Some(responder) = &self.responder {
            for frame in responder(&message) {
                self.push_frame(&frame);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn route(&self) -> Option<RouteInfo> {
        match self.behavior {
            Behavior::ConnectOnAnswer { relayed } => Some(RouteInfo {
                relayed,
                remote_ip: "192.168.1.20".parse().ok(),
            }),
            _ => None,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out engines following a fixed script, one behavior per engine.
pub struct FakeEngineFactory {
    script: Mutex<VecDeque<Behavior>>,
    responder: Option<Responder>,
    created: Mutex<Vec<Arc<FakeEngine>>>,
}

impl FakeEngineFactory {
    pub fn new(script: impl IntoIterator<Item = Behavior>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            responder: None,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn with_responder(script: impl IntoIterator<Item = Behavior>, responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            responder: Some(responder),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> Vec<Arc<FakeEngine>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl PeerEngineFactory for FakeEngineFactory {
    async fn create(
        &self,
        ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> LinkResult<Arc<dyn PeerEngine>> {
        let behavior = self.script.lock().pop_front().unwrap_or(Behavior::Silent);
        let mut created = self.created.lock();
        let engine = Arc::new(FakeEngine {
            index: created.len(),
            ice_servers,
            behavior,
            events,
            responder: self.responder.clone(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            answers: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        });
        created.push(engine.clone());
        Ok(engine)
    }
}

/// Answers every offer on `relay`, addressed to the offering client.
pub fn spawn_vault(relay: &MemoryRelay) -> JoinHandle<()> {
    spawn_vault_with(relay, |_offers| Vec::new())
}

/// Like [`spawn_vault`], plus extra rows produced from the offers seen so far.
pub fn spawn_vault_with<F>(relay: &MemoryRelay, extra: F) -> JoinHandle<()>
where
    F: Fn(&[SignalingMessage]) -> Vec<SignalingMessage> + Send + 'static,
{
    let relay = relay.clone();
    let mut rows = relay.watch();
    tokio::spawn(async move {
        let mut offers = Vec::new();
        while let Ok(row) = rows.recv().await {
            if row.kind != SignalKind::Offer || row.target != SIGNAL_ID {
                continue;
            }
            offers.push(row.clone());
            let mut replies = extra(&offers);
            replies.insert(0, answer_for(&row.client_id));
            for reply in replies {
                let _ = relay.publish(&reply).await;
            }
        }
    })
}

pub fn answer_for(client_id: &str) -> SignalingMessage {
    SignalingMessage::answer(
        SIGNAL_ID,
        client_id,
        &SessionDescription::answer(format!("answer-for-{client_id}")),
    )
    .expect("answer row")
}

#[derive(Default)]
pub struct RecordingLogger {
    events: Mutex<Vec<ConnectionEvent>>,
}

impl RecordingLogger {
    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().clone()
    }

    /// Events are logged off the connect path, so give them a moment to land.
    pub async fn wait_for(&self, count: usize) -> Vec<ConnectionEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while self.events.lock().len() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.events()
    }
}

/// Logger whose calls never complete.
#[derive(Default)]
pub struct StalledLogger {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ConnectionEventLogger for StalledLogger {
    async fn log(&self, _event: ConnectionEvent) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
    }
}

#[async_trait]
impl ConnectionEventLogger for RecordingLogger {
    async fn log(&self, event: ConnectionEvent) {
        self.events.lock().push(event);
    }
}

#[derive(Default)]
pub struct RecordingStatus {
    lines: Mutex<Vec<String>>,
    themes: Mutex<Vec<String>>,
}

impl RecordingStatus {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn themes(&self) -> Vec<String> {
        self.themes.lock().clone()
    }
}

impl StatusReporter for RecordingStatus {
    fn status(&self, message: &str) {
        self.lines.lock().push(message.to_string());
    }

    fn theme(&self, css: &str) {
        self.themes.lock().push(css.to_string());
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    pub flushes: AtomicUsize,
    pub records: Mutex<Vec<String>>,
}

impl TelemetrySink for RecordingTelemetry {
    fn record(&self, event: &str, _properties: Value) {
        self.records.lock().push(event.to_string());
    }

    fn flush_blocking(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn collect_events(connection: &vault_link::VaultConnection) -> Arc<Mutex<Vec<VaultEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    connection.set_handler(move |event: VaultEvent| sink.lock().push(event));
    events
}
