use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{SignalingMessage, SignalingRelay, Subscription};
use crate::error::LinkResult;

/// In-process relay for tests and embedding without a backend. Every
/// published row is broadcast to every listener and kept in a log.
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    rows: broadcast::Sender<SignalingMessage>,
    log: Mutex<Vec<SignalingMessage>>,
    channels: Mutex<Vec<String>>,
    active: AtomicUsize,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                rows: broadcast::channel(64).0,
                log: Mutex::new(Vec::new()),
                channels: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Raw feed of every row, the way a vault would watch the table.
    pub fn watch(&self) -> broadcast::Receiver<SignalingMessage> {
        self.inner.rows.subscribe()
    }

    pub fn published(&self) -> Vec<SignalingMessage> {
        self.inner.log.lock().clone()
    }

    /// Channel names in the order they were opened.
    pub fn channels(&self) -> Vec<String> {
        self.inner.channels.lock().clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard(Arc<Inner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn publish(&self, message: &SignalingMessage) -> LinkResult<()> {
        self.inner.log.lock().push(message.clone());
        // No listener is not an error: the row just sits in the table.
        let _ = self.inner.rows.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self, channel: &str, target: &str) -> LinkResult<Subscription> {
        let mut rows = self.inner.rows.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let (leave_tx, mut leave_rx) = oneshot::channel::<()>();
        self.inner.channels.lock().push(channel.to_string());
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.inner));
        let wanted = target.to_string();

        let forwarder = tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::select! {
                    _ = &mut leave_rx => break,
                    row = rows.recv() => match row {
                        Ok(row) if row.target == wanted => {
                            if tx.send(row).is_err() {
                                break;
                            }
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(Subscription::new(channel, target, rx, leave_tx, vec![forwarder]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SessionDescription;

    #[tokio::test]
    async fn delivers_only_matching_targets() {
        let relay = MemoryRelay::new();
        let mut sub = relay.subscribe("portal-signaling-1", "web-a").await.unwrap();
        assert_eq!(relay.active_subscriptions(), 1);

        let desc = SessionDescription::answer("v=0");
        relay
            .publish(&SignalingMessage::answer("sig", "web-b", &desc).unwrap())
            .await
            .unwrap();
        relay
            .publish(&SignalingMessage::answer("sig", "web-a", &desc).unwrap())
            .await
            .unwrap();

        let row = sub.recv().await.unwrap();
        assert_eq!(row.target, "web-a");
        assert_eq!(relay.published().len(), 2);

        sub.unsubscribe().await;
        assert_eq!(relay.active_subscriptions(), 0);
        assert_eq!(relay.channels(), vec!["portal-signaling-1".to_string()]);
    }
}
