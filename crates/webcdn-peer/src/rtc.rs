//! WebRTC transport
//!
//! Wraps the webrtc crate to implement ConnectionFactory for production use.
//! Candidates are trickled through the relay one at a time; the transfer
//! channel is ordered and reliable, which chunk reassembly depends on.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::transport::{
    ChannelState, ConnectionEvent, ConnectionFactory, PeerConnection, SdpKind, TransferChannel,
    TransportError,
};
use crate::types::{IceCandidate, PeerId, DATA_CHANNEL_LABEL};

fn channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => {
            ChannelState::Connecting
        }
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
    }
}

/// Wrapper around RTCDataChannel that implements TransferChannel
struct RtcTransferChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl TransferChannel for RtcTransferChannel {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.dc
            .send(&frame)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn ready_state(&self) -> ChannelState {
        channel_state(self.dc.ready_state())
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), TransportError> {
        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;

        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.pc.close().await;
    }
}

/// Route data channel callbacks into the peer's event stream
fn wire_data_channel(dc: Arc<RTCDataChannel>, tx: mpsc::UnboundedSender<ConnectionEvent>) {
    let open_dc = dc.clone();
    let open_tx = tx.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            debug!("Data channel '{}' open", open_dc.label());
            let channel: Arc<dyn TransferChannel> = Arc::new(RtcTransferChannel { dc: open_dc });
            let _ = open_tx.send(ConnectionEvent::ChannelOpen(channel));
        })
    }));

    let message_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = message_tx.clone();
        Box::pin(async move {
            let _ = tx.send(ConnectionEvent::Message(msg.data));
        })
    }));

    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ConnectionEvent::ChannelClosed);
        })
    }));
}

/// WebRTC connection factory
///
/// Creates actual WebRTC connections using the webrtc crate.
pub struct RtcConnectionFactory {
    stun_servers: Vec<String>,
}

impl RtcConnectionFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }

    async fn new_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(
        &self,
        remote: &PeerId,
        originator: bool,
    ) -> Result<(Box<dyn PeerConnection>, mpsc::UnboundedReceiver<ConnectionEvent>), TransportError>
    {
        let pc = self.new_connection().await?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Work MUST be inside the returned futures
        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(ConnectionEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let state_tx = tx.clone();
        let remote_short = remote.short();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            let remote = remote_short.clone();
            Box::pin(async move {
                debug!("[Peer {}] Connection state: {:?}", remote, state);
                if state == RTCPeerConnectionState::Failed {
                    let _ = tx.send(ConnectionEvent::Failed("connection failed".to_string()));
                }
            })
        }));

        if originator {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            wire_data_channel(dc, tx);
        } else {
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let tx = tx.clone();
                Box::pin(async move {
                    debug!("Received data channel '{}'", dc.label());
                    wire_data_channel(dc, tx);
                })
            }));
        }

        Ok((Box::new(RtcPeerConnection { pc }), rx))
    }
}
