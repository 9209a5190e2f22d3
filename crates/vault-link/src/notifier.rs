use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, trace};

/// What the application hears from an active session.
#[derive(Debug, Clone, PartialEq)]
pub enum VaultEvent {
    Connected,
    /// A complete inbound message: a reply, an unsolicited push, or a
    /// reassembled chunked payload.
    Message(Value),
    /// Inbound data was lost (malformed or abandoned reassembly). The channel
    /// is still open.
    TransportError(String),
    Disconnected,
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: VaultEvent);
}

impl<F> EventHandler for F
where
    F: Fn(VaultEvent) + Send + Sync,
{
    fn handle(&self, event: VaultEvent) {
        (self)(event)
    }
}

/// Single handler slot shared by every channel of a connection.
#[derive(Clone, Default)]
pub struct EventNotifier {
    slot: Arc<RwLock<Option<Arc<dyn EventHandler>>>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler`, replacing whatever was there.
    pub fn set_handler<H: EventHandler + 'static>(&self, handler: H) {
        *self.slot.write() = Some(Arc::new(handler));
    }

    pub fn clear_handler(&self) {
        *self.slot.write() = None;
    }

    pub fn has_handler(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Delivers `event`; returns false when no handler is installed. The
    /// handler runs outside the lock so it may replace itself.
    pub fn notify(&self, event: VaultEvent) -> bool {
        let handler = self.slot.read().clone();
        match handler {
            Some(handler) => {
                handler.handle(event);
                true
            }
            None => {
                trace!(target = "vault_link::notifier", ?event, "no handler installed; dropping event");
                false
            }
        }
    }
}

/// Progress and styling sink supplied by the UI for the duration of `connect`.
pub trait StatusReporter: Send + Sync {
    fn status(&self, message: &str);

    /// Theme CSS handed over by a local vault on login.
    fn theme(&self, _css: &str) {}
}

impl<F> StatusReporter for F
where
    F: Fn(&str) + Send + Sync,
{
    fn status(&self, message: &str) {
        (self)(message)
    }
}

/// Reporter used when the caller supplies none.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusReporter for LogStatus {
    fn status(&self, message: &str) {
        info!(target = "vault_link::status", "{message}");
    }
}
