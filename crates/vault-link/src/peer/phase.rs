//! The remote connect sequence as a pure state machine.
//!
//! ```text
//! Init -> FetchingCredentials -> AttemptDirect -> Connected
//!                 |                    |
//!                 v                    v
//!               Failed <-------- AttemptRelay -> Connected
//! ```

use std::fmt;
use std::time::Duration;

use crate::bootstrap::{IceServer, IceServerSet};
use crate::config::LinkConfig;

pub const STATUS_INITIALIZING: &str = "Initializing connection...";
pub const STATUS_SERVICE_UNREACHABLE: &str =
    "Unable to reach connection service. Check internet connection.";
pub const STATUS_DIRECT: &str = "Establishing secure end-to-end encryption...";
pub const STATUS_RELAY_SWITCH: &str = "Strict firewall detected. Switching to secure relay mode...";
pub const STATUS_RELAY: &str = "Routing through secure private tunnel...";
pub const STATUS_FAILED: &str = "Connection failed. Is the vault online?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectPhase {
    Init,
    FetchingCredentials,
    AttemptDirect,
    AttemptRelay,
    Connected,
    Failed,
}

/// What ended the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Started,
    CredentialsReady,
    CredentialsFailed,
    PeerConnected,
    PeerFailed,
    TimedOut,
}

impl ConnectPhase {
    /// The phase that follows `outcome`, or `None` if `outcome` cannot
    /// happen in this phase.
    pub fn next(self, outcome: PhaseOutcome) -> Option<ConnectPhase> {
        use ConnectPhase::*;
        use PhaseOutcome::*;
        match (self, outcome) {
            (Init, Started) => Some(FetchingCredentials),
            (FetchingCredentials, CredentialsReady) => Some(AttemptDirect),
            (FetchingCredentials, CredentialsFailed) => Some(Failed),
            (AttemptDirect, PeerConnected) | (AttemptRelay, PeerConnected) => Some(Connected),
            (AttemptDirect, PeerFailed | TimedOut) => Some(AttemptRelay),
            (AttemptRelay, PeerFailed | TimedOut) => Some(Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectPhase::Connected | ConnectPhase::Failed)
    }

    /// Server subset and timing for the two attempt phases.
    pub fn policy(self, config: &LinkConfig) -> Option<PhasePolicy> {
        match self {
            ConnectPhase::AttemptDirect => Some(PhasePolicy {
                servers: ServerSelection::TraversalOnly,
                settle: Duration::ZERO,
                deadline: config.direct_timeout,
            }),
            ConnectPhase::AttemptRelay => Some(PhasePolicy {
                servers: ServerSelection::All,
                settle: config.relay_settle,
                deadline: config.relay_timeout,
            }),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectPhase::Init => "init",
            ConnectPhase::FetchingCredentials => "fetching_credentials",
            ConnectPhase::AttemptDirect => "attempt_direct",
            ConnectPhase::AttemptRelay => "attempt_relay",
            ConnectPhase::Connected => "connected",
            ConnectPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSelection {
    TraversalOnly,
    All,
}

impl ServerSelection {
    pub fn pick(self, set: &IceServerSet) -> Vec<IceServer> {
        match self {
            ServerSelection::TraversalOnly => set.traversal_only(),
            ServerSelection::All => set.all(),
        }
    }

    pub fn uses_relays(self) -> bool {
        matches!(self, ServerSelection::All)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePolicy {
    pub servers: ServerSelection,
    /// Pause after tearing down the previous attempt.
    pub settle: Duration,
    pub deadline: Duration,
}
