//! Matches replies on the peer channel to the requests that caused them.
//!
//! Every request gets its own id, reply slot and deadline, so any number of
//! requests, including several with the same command name, can be in flight.
//! Replies that echo `requestId` resolve exactly that request. Replies without
//! one resolve the oldest pending request whose command name equals the
//! reply's `cmd` or `type`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::command::{reply_tags, REQUEST_ID_FIELD};
use crate::error::{LinkError, LinkResult};

#[derive(Debug)]
struct PendingRequest {
    cmd: String,
    seq: u64,
    issued_at: Instant,
    reply: oneshot::Sender<Value>,
}

#[derive(Debug, Default)]
struct PendingTable {
    next_seq: u64,
    entries: HashMap<String, PendingRequest>,
}

impl PendingTable {
    fn oldest_matching(&self, cmd: Option<&str>, typ: Option<&str>) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, pending)| {
                Some(pending.cmd.as_str()) == cmd || Some(pending.cmd.as_str()) == typ
            })
            .min_by_key(|(_, pending)| pending.seq)
            .map(|(id, _)| id.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestCorrelator {
    table: Arc<Mutex<PendingTable>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a reply slot for `cmd`. The returned handle carries the request
    /// id to put on the wire and fails with `RequestTimeout` after `deadline`.
    pub fn register(&self, cmd: &str, deadline: Duration) -> PendingReply {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.table.lock();
            let seq = table.next_seq;
            table.next_seq = table.next_seq.wrapping_add(1);
            table.entries.insert(
                id.clone(),
                PendingRequest {
                    cmd: cmd.to_string(),
                    seq,
                    issued_at: Instant::now(),
                    reply: tx,
                },
            );
        }
        PendingReply {
            id,
            cmd: cmd.to_string(),
            deadline,
            rx,
            table: Arc::clone(&self.table),
        }
    }

    /// Routes `message` to the request it answers, if any.
    pub fn resolve(&self, message: &Value) -> bool {
        let pending = {
            let mut table = self.table.lock();
            let key = match message.get(REQUEST_ID_FIELD).and_then(Value::as_str) {
                Some(id) => Some(id.to_string()),
                None => {
                    let (cmd, typ) = reply_tags(message);
                    table.oldest_matching(cmd, typ)
                }
            };
            key.and_then(|key| table.entries.remove(&key).map(|pending| (key, pending)))
        };
        let Some((id, pending)) = pending else {
            return false;
        };
        trace!(
            target = "vault_link::correlator",
            request_id = %id,
            cmd = %pending.cmd,
            elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
            "reply matched"
        );
        // The waiter may have given up between the lookup and here.
        pending.reply.send(message.clone()).is_ok()
    }

    /// Fails every outstanding request with `NotConnected`.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.table.lock().entries.drain().collect();
        if !drained.is_empty() {
            debug!(
                target = "vault_link::correlator",
                count = drained.len(),
                "dropping pending requests"
            );
        }
        drained.len()
    }

    pub fn pending(&self) -> usize {
        self.table.lock().entries.len()
    }
}

/// Handle for one in-flight request.
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    cmd: String,
    deadline: Duration,
    rx: oneshot::Receiver<Value>,
    table: Arc<Mutex<PendingTable>>,
}

impl PendingReply {
    pub fn request_id(&self) -> &str {
        &self.id
    }

    /// Withdraws the request without waiting, e.g. when it could not be sent.
    pub fn cancel(self) {
        self.table.lock().entries.remove(&self.id);
    }

    pub async fn wait(mut self) -> LinkResult<Value> {
        match timeout(self.deadline, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(LinkError::NotConnected),
            Err(_) => {
                let still_pending = self.table.lock().entries.remove(&self.id).is_some();
                if !still_pending {
                    // Resolved in the same instant the deadline fired.
                    if let Ok(reply) = self.rx.try_recv() {
                        return Ok(reply);
                    }
                }
                debug!(
                    target = "vault_link::correlator",
                    request_id = %self.id,
                    cmd = %self.cmd,
                    "request timed out"
                );
                Err(LinkError::RequestTimeout { cmd: self.cmd })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reply_with_request_id_resolves_that_request() {
        let correlator = RequestCorrelator::new();
        let first = correlator.register("LOAD_FILE", Duration::from_secs(10));
        let second = correlator.register("LOAD_FILE", Duration::from_secs(10));
        let second_id = second.request_id().to_string();

        assert!(correlator.resolve(&json!({"cmd": "LOAD_FILE", "requestId": second_id, "n": 2})));
        let reply = second.wait().await.unwrap();
        assert_eq!(reply["n"], 2);
        assert_eq!(correlator.pending(), 1);

        assert!(correlator.resolve(&json!({"type": "LOAD_FILE", "n": 1})));
        assert_eq!(first.wait().await.unwrap()["n"], 1);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn untagged_replies_resolve_oldest_first() {
        let correlator = RequestCorrelator::new();
        let first = correlator.register("GET_TREE", Duration::from_secs(10));
        let second = correlator.register("GET_TREE", Duration::from_secs(10));

        assert!(correlator.resolve(&json!({"type": "GET_TREE", "n": 1})));
        assert!(correlator.resolve(&json!({"cmd": "GET_TREE", "n": 2})));
        assert_eq!(first.wait().await.unwrap()["n"], 1);
        assert_eq!(second.wait().await.unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn unrelated_or_stale_replies_are_not_consumed() {
        let correlator = RequestCorrelator::new();
        let _pending = correlator.register("LOAD_TAGS", Duration::from_secs(10));
        assert!(!correlator.resolve(&json!({"type": "FILE_CHANGED"})));
        assert!(!correlator.resolve(&json!({"cmd": "LOAD_TAGS", "requestId": "gone"})));
        assert_eq!(correlator.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_request_times_out_once() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.register("LOAD_GRAPH", Duration::from_secs(10));
        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, LinkError::RequestTimeout { ref cmd } if cmd == "LOAD_GRAPH"));
        assert_eq!(correlator.pending(), 0);
        assert!(!correlator.resolve(&json!({"type": "LOAD_GRAPH"})));
    }

    #[tokio::test]
    async fn fail_all_rejects_waiters() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.register("PING", Duration::from_secs(10));
        assert_eq!(correlator.fail_all(), 1);
        assert!(matches!(pending.wait().await, Err(LinkError::NotConnected)));
    }
}
