//! Transport abstraction
//!
//! Defines traits for the signaling relay, peer connections and transfer
//! channels so the peer state machine runs unchanged over webrtc-rs or the
//! in-memory mock network.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{IceCandidate, PeerId, RelayKind};

/// Errors from transport operations
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Not connected")]
    NotConnected,
}

/// Ready state of a transfer channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Relay used to reach a peer before a direct link exists
///
/// `to` addresses one node; `None` sends to the coordinator itself.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    async fn send(
        &self,
        kind: RelayKind,
        data: serde_json::Value,
        to: Option<&PeerId>,
    ) -> Result<(), TransportError>;
}

/// Message-oriented, ordered, reliable channel to one peer
#[async_trait]
pub trait TransferChannel: Send + Sync {
    /// Send one frame
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Bytes queued locally and not yet handed to the network
    async fn buffered_amount(&self) -> usize;

    fn ready_state(&self) -> ChannelState;

    async fn close(&self);
}

/// Events a connection reports to its owning peer task
pub enum ConnectionEvent {
    /// Locally gathered candidate, to be relayed to the remote
    LocalCandidate(IceCandidate),
    /// The transfer channel is usable
    ChannelOpen(Arc<dyn TransferChannel>),
    /// One frame from the remote
    Message(Bytes),
    ChannelClosed,
    Failed(String),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            ConnectionEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
            ConnectionEvent::Message(data) => write!(f, "Message({} bytes)", data.len()),
            ConnectionEvent::ChannelClosed => f.write_str("ChannelClosed"),
            ConnectionEvent::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

/// Negotiated connection to one remote node
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer and set it as the local description; returns the sdp
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Create an answer and set it as the local description; returns the sdp
    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), TransportError>;

    /// Only valid once the remote description is set
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Factory for peer connections
///
/// The originator creates the transfer channel; the other side receives it
/// once negotiation completes.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        remote: &PeerId,
        originator: bool,
    ) -> Result<(Box<dyn PeerConnection>, mpsc::UnboundedReceiver<ConnectionEvent>), TransportError>;
}

// Blanket implementations for Arc<T> so shared transports can be passed as trait objects

#[async_trait]
impl<T: SignalChannel + ?Sized> SignalChannel for Arc<T> {
    async fn send(
        &self,
        kind: RelayKind,
        data: serde_json::Value,
        to: Option<&PeerId>,
    ) -> Result<(), TransportError> {
        (**self).send(kind, data, to).await
    }
}

#[async_trait]
impl<T: TransferChannel + ?Sized> TransferChannel for Arc<T> {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn buffered_amount(&self) -> usize {
        (**self).buffered_amount().await
    }

    fn ready_state(&self) -> ChannelState {
        (**self).ready_state()
    }

    async fn close(&self) {
        (**self).close().await
    }
}
