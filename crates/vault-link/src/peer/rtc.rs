use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::candidate::{CandidatePairState, CandidateType};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use super::engine::{PeerEngine, PeerEngineFactory, PeerEvent, RouteInfo};
use crate::bootstrap::IceServer;
use crate::error::{to_engine_error, LinkError, LinkResult};
use crate::signaling::SessionDescription;

const CHANNEL_LABEL: &str = "vault";

fn to_rtc_servers(servers: Vec<IceServer>) -> Vec<RTCIceServer> {
    servers
        .into_iter()
        .map(|server| RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

/// Builds [`WebRtcEngine`]s on the `webrtc` stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcEngineFactory;

#[async_trait]
impl PeerEngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> LinkResult<Arc<dyn PeerEngine>> {
        let engine = WebRtcEngine::new(ice_servers, events).await?;
        Ok(Arc::new(engine))
    }
}

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    open: Arc<AtomicBool>,
    answered: AtomicBool,
    closed: AtomicBool,
}

impl WebRtcEngine {
    pub async fn new(
        ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> LinkResult<Self> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: to_rtc_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(to_engine_error)?);
        let open = Arc::new(AtomicBool::new(false));

        let state_events = events.clone();
        let state_open = Arc::clone(&open);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let open = Arc::clone(&state_open);
            Box::pin(async move {
                debug!(target = "vault_link::peer::rtc", state = ?state, "peer connection state changed");
                if let Some(event) = state_event(state, &open) {
                    let _ = events.send(event);
                }
            })
        }));

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(CHANNEL_LABEL, Some(init))
            .await
            .map_err(to_engine_error)?;
        wire_channel(&dc, Arc::clone(&open), events);

        Ok(Self {
            pc,
            dc,
            open,
            answered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// Maps a connection state onto the event that ends the session, if any.
/// `Disconnected` is left alone since ICE may still recover from it.
fn state_event(state: RTCPeerConnectionState, open: &AtomicBool) -> Option<PeerEvent> {
    match state {
        RTCPeerConnectionState::Failed => {
            open.store(false, Ordering::SeqCst);
            Some(PeerEvent::Error("ICE connection failed".into()))
        }
        RTCPeerConnectionState::Closed => open
            .swap(false, Ordering::SeqCst)
            .then_some(PeerEvent::Closed),
        RTCPeerConnectionState::Disconnected => {
            info!(target = "vault_link::peer::rtc", "peer connection interrupted; waiting for ICE to recover");
            None
        }
        _ => None,
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, open: Arc<AtomicBool>, events: mpsc::UnboundedSender<PeerEvent>) {
    let open_events = events.clone();
    let open_flag = Arc::clone(&open);
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        let open = Arc::clone(&open_flag);
        Box::pin(async move {
            info!(target = "vault_link::peer::rtc", channel = CHANNEL_LABEL, "data channel open");
            open.store(true, Ordering::SeqCst);
            let _ = events.send(PeerEvent::Connected);
        })
    }));

    let close_events = events.clone();
    let close_flag = Arc::clone(&open);
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        let open = Arc::clone(&close_flag);
        Box::pin(async move {
            info!(target = "vault_link::peer::rtc", channel = CHANNEL_LABEL, "data channel closed");
            if open.swap(false, Ordering::SeqCst) {
                let _ = events.send(PeerEvent::Closed);
            }
        })
    }));

    let error_events = events.clone();
    dc.on_error(Box::new(move |err| {
        let events = error_events.clone();
        Box::pin(async move {
            warn!(
                target = "vault_link::peer::rtc",
                channel = CHANNEL_LABEL,
                error = %err,
                "data channel error"
            );
            let _ = events.send(PeerEvent::Error(err.to_string()));
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            trace!(
                target = "vault_link::peer::rtc",
                len = msg.data.len(),
                is_string = msg.is_string,
                "data channel message"
            );
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            let _ = events.send(PeerEvent::Data(text));
        })
    }));
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create_offer(&self) -> LinkResult<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(to_engine_error)?;
        let mut gather = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(to_engine_error)?;
        let _ = gather.recv().await;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| LinkError::Engine("local description missing after gathering".into()))?;
        trace!(target = "vault_link::peer::rtc", sdp_len = local.sdp.len(), "offer gathered");
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> LinkResult<()> {
        if self
            .answered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(target = "vault_link::peer::rtc", "ignoring repeated answer");
            return Ok(());
        }
        let result = async {
            let desc = RTCSessionDescription::answer(answer.sdp).map_err(to_engine_error)?;
            self.pc
                .set_remote_description(desc)
                .await
                .map_err(to_engine_error)
        }
        .await;
        if result.is_err() {
            self.answered.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn send_text(&self, text: &str) -> LinkResult<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.dc
            .send_text(text.to_string())
            .await
            .map_err(|err| LinkError::Transport(err.to_string()))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn route(&self) -> Option<RouteInfo> {
        let stats = self.pc.get_stats().await;
        let mut selected = None;
        for report in stats.reports.values() {
            if let StatsReportType::CandidatePair(pair) = report {
                if pair.state != CandidatePairState::Succeeded {
                    continue;
                }
                let better = match &selected {
                    None => true,
                    Some((nominated, _, _)) => pair.nominated && !nominated,
                };
                if better {
                    selected = Some((
                        pair.nominated,
                        pair.local_candidate_id.clone(),
                        pair.remote_candidate_id.clone(),
                    ));
                }
            }
        }
        let (_, local_id, remote_id) = selected?;

        let mut relayed = false;
        let mut remote_ip = None;
        if let Some(StatsReportType::LocalCandidate(local)) = stats.reports.get(&local_id) {
            relayed |= local.candidate_type == CandidateType::Relay;
        }
        if let Some(StatsReportType::RemoteCandidate(remote)) = stats.reports.get(&remote_id) {
            relayed |= remote.candidate_type == CandidateType::Relay;
            remote_ip = remote.ip.parse::<IpAddr>().ok();
        }
        Some(RouteInfo { relayed, remote_ip })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        if let Err(err) = self.dc.close().await {
            trace!(target = "vault_link::peer::rtc", error = %err, "data channel close failed");
        }
        if let Err(err) = self.pc.close().await {
            debug!(target = "vault_link::peer::rtc", error = %err, "peer connection close failed");
        }
    }
}
