use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::chunk::{classify, ChunkConfig, ChunkError, Frame, GcEvent, GcReason, Reassembler};
use crate::correlator::RequestCorrelator;
use crate::notifier::{EventNotifier, VaultEvent};

/// Turns inbound text frames into messages: reassembles chunked payloads,
/// resolves pending requests and notifies the application.
pub struct Ingress {
    reassembler: Reassembler,
    correlator: RequestCorrelator,
    notifier: EventNotifier,
}

impl Ingress {
    pub fn new(config: ChunkConfig, correlator: RequestCorrelator, notifier: EventNotifier) -> Self {
        Self {
            reassembler: Reassembler::new(config),
            correlator,
            notifier,
        }
    }

    pub fn handle_frame(&mut self, text: &str) {
        let now = Instant::now().into_std();
        for dropped in self.reassembler.gc(now) {
            self.discard(dropped);
        }

        match classify(text) {
            Frame::Chunk { kind, part } => {
                trace!(target = "vault_link::chunk", kind = %kind, len = part.len(), "fragment");
                match self.reassembler.push(kind, part, now) {
                    Ok(Some(evicted)) => self.discard(evicted),
                    Ok(None) => {}
                    Err(err) => self.report(err),
                }
            }
            Frame::End { kind } => match self.reassembler.finish(kind) {
                Ok(Some(done)) => {
                    debug!(
                        target = "vault_link::chunk",
                        kind = %done.kind,
                        fragments = done.fragments,
                        elapsed_ms = now.saturating_duration_since(done.started_at).as_millis() as u64,
                        "reassembled message"
                    );
                    self.deliver(done.message);
                }
                Ok(None) => {}
                Err(err) => self.report(err),
            },
            Frame::Message(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(message) => self.deliver(message),
                Err(err) => {
                    warn!(
                        target = "vault_link::peer",
                        error = %err,
                        len = raw.len(),
                        "dropping unparseable frame"
                    );
                }
            },
        }
    }

    fn deliver(&self, message: Value) {
        let matched = self.correlator.resolve(&message);
        trace!(target = "vault_link::peer", matched, "inbound message");
        self.notifier.notify(VaultEvent::Message(message));
    }

    fn discard(&self, dropped: GcEvent) {
        warn!(
            target = "vault_link::chunk",
            kind = %dropped.kind,
            dropped_bytes = dropped.dropped_bytes,
            reason = ?dropped.reason,
            "abandoned reassembly discarded"
        );
        let why = match dropped.reason {
            GcReason::Timeout => "stalled",
            GcReason::Capacity => "too many open transfers",
        };
        self.notifier.notify(VaultEvent::TransportError(format!(
            "incomplete {} transfer discarded ({why})",
            dropped.kind
        )));
    }

    fn report(&self, err: ChunkError) {
        warn!(target = "vault_link::chunk", error = %err, "reassembly failed");
        self.notifier.notify(VaultEvent::TransportError(err.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::chunk::{split_message, ChunkKind};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn harness() -> (Ingress, RequestCorrelator, Arc<Mutex<Vec<VaultEvent>>>) {
        let correlator = RequestCorrelator::new();
        let notifier = EventNotifier::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        notifier.set_handler(move |event: VaultEvent| sink.lock().push(event));
        let config = ChunkConfig {
            max_message_bytes: 1024,
            max_inflight: 2,
            gc_timeout: Duration::from_secs(60),
        };
        (Ingress::new(config, correlator.clone(), notifier), correlator, events)
    }

    #[tokio::test]
    async fn chunked_reply_resolves_request_and_notifies() {
        let (mut ingress, correlator, events) = harness();
        let pending = correlator.register("GET_TREE", Duration::from_secs(10));
        let payload = json!({"type": "TREE", "files": ["a.md", "b.md"]}).to_string();
        for frame in split_message(&ChunkKind::Tree, &payload, 7) {
            ingress.handle_frame(&frame);
        }
        assert_eq!(pending.wait().await.unwrap()["files"][1], "b.md");
        assert_eq!(events.lock().len(), 1);
    }

    #[tokio::test]
    async fn garbage_frames_are_dropped_without_events() {
        let (mut ingress, _correlator, events) = harness();
        ingress.handle_frame("not json");
        assert!(events.lock().is_empty());
        ingress.handle_frame(r#"{"type":"FILE_CHANGED"}"#);
        assert_eq!(
            events.lock().as_slice(),
            [VaultEvent::Message(json!({"type": "FILE_CHANGED"}))]
        );
    }

    #[tokio::test]
    async fn malformed_reassembly_surfaces_transport_error() {
        let (mut ingress, _correlator, events) = harness();
        ingress.handle_frame("CHUNK_FILE:{\"broken\":");
        ingress.handle_frame("END_FILE");
        ingress.handle_frame("END_TREE");
        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| matches!(event, VaultEvent::TransportError(_))));
    }

    #[tokio::test]
    async fn flood_of_new_tags_evicts_and_reports() {
        let (mut ingress, _correlator, events) = harness();
        ingress.handle_frame("CHUNK_TREE:{\"files\":");
        ingress.handle_frame("CHUNK_FILE:{\"content\":");
        ingress.handle_frame("CHUNK_K1:[");
        ingress.handle_frame("CHUNK_K2:[");
        {
            let events = events.lock();
            assert_eq!(events.len(), 2);
            assert!(events.iter().all(|event| matches!(
                event,
                VaultEvent::TransportError(reason) if reason.contains("too many open transfers")
            )));
        }
        ingress.handle_frame("CHUNK_K2:1]");
        ingress.handle_frame("END_K2");
        assert_eq!(events.lock().last(), Some(&VaultEvent::Message(json!([1]))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sequences_are_collected() {
        let (mut ingress, _correlator, events) = harness();
        ingress.handle_frame("CHUNK_TREE:{\"partial\":");
        tokio::time::advance(Duration::from_secs(61)).await;
        ingress.handle_frame(r#"{"type":"PONG"}"#);
        let events = events.lock();
        assert!(matches!(events[0], VaultEvent::TransportError(_)));
        assert_eq!(events[1], VaultEvent::Message(json!({"type": "PONG"})));
    }
}
