//! Client transport for reaching a personal vault either over HTTP on the
//! local machine or over a WebRTC data channel negotiated through a
//! signaling relay, behind one `connect` / `send` API.

pub mod auth;
pub mod bootstrap;
pub mod command;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod events;
pub mod local;
pub mod mode;
pub mod notifier;
pub mod peer;
pub mod signaling;
pub mod telemetry;

pub use bootstrap::{BackendCredentials, BootstrapClient, IceServer, IceServerSet};
pub use config::{LinkConfig, VaultIdentity};
pub use connection::VaultConnection;
pub use error::{LinkError, LinkResult};
pub use events::{
    ConnectionEvent, ConnectionEventKind, ConnectionEventLogger, HttpEventLogger, NetworkClass,
    NoopEventLogger,
};
pub use mode::TransportMode;
pub use notifier::{EventHandler, LogStatus, StatusReporter, VaultEvent};
pub use peer::chunk::{ChunkConfig, ChunkError, ChunkKind};
pub use peer::engine::{PeerEngine, PeerEngineFactory, PeerEvent, RouteInfo};
pub use peer::rtc::WebRtcEngineFactory;
pub use signaling::{
    MemoryRelay, SessionDescription, SignalKind, SignalingMessage, SignalingRelay, SupabaseRelay,
};
pub use telemetry::{NoopTelemetry, TelemetrySink};
