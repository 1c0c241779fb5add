//! Mock implementations for testing and simulation
//!
//! Provides an in-memory relay and connection factory so whole nodes can run
//! against each other without a coordinator or WebRTC stack.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::transport::{
    ChannelState, ConnectionEvent, ConnectionFactory, PeerConnection, SdpKind, SignalChannel,
    TransferChannel, TransportError,
};
use crate::types::{IceCandidate, PeerId, RelayEnvelope, RelayKind};

// ============================================================================
// Mock Relay
// ============================================================================

#[derive(Default)]
struct RelayState {
    inboxes: HashMap<PeerId, mpsc::UnboundedSender<RelayEnvelope>>,
    log: Vec<RelayEnvelope>,
}

/// In-memory coordinator: forwards addressed envelopes, records everything
#[derive(Default)]
pub struct MockRelay {
    state: Mutex<RelayState>,
}

impl MockRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node; returns its signal channel and inbound envelope stream
    pub async fn join(
        self: &Arc<Self>,
        id: PeerId,
    ) -> (Arc<MockSignalChannel>, mpsc::UnboundedReceiver<RelayEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.inboxes.insert(id.clone(), tx);
        let channel = Arc::new(MockSignalChannel {
            relay: self.clone(),
            local: id,
            connected: AtomicBool::new(true),
        });
        (channel, rx)
    }

    /// Every envelope sent through the relay, in order
    pub async fn sent(&self) -> Vec<RelayEnvelope> {
        self.state.lock().await.log.clone()
    }

    pub async fn sent_of(&self, kind: RelayKind) -> Vec<RelayEnvelope> {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|env| env.kind == kind)
            .cloned()
            .collect()
    }
}

/// One node's handle on the mock relay
pub struct MockSignalChannel {
    relay: Arc<MockRelay>,
    local: PeerId,
    connected: AtomicBool,
}

impl MockSignalChannel {
    pub fn peer_id(&self) -> &PeerId {
        &self.local
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl SignalChannel for MockSignalChannel {
    async fn send(
        &self,
        kind: RelayKind,
        data: serde_json::Value,
        to: Option<&PeerId>,
    ) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }

        let env = RelayEnvelope {
            kind,
            from: Some(self.local.clone()),
            to: to.cloned(),
            data,
        };

        let mut state = self.relay.state.lock().await;
        state.log.push(env.clone());
        if let Some(target) = to {
            if let Some(inbox) = state.inboxes.get(target) {
                // Receiver gone means the node shut down; the coordinator drops it too
                let _ = inbox.send(env);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Mock Transfer Channel
// ============================================================================

fn state_to_u8(state: ChannelState) -> u8 {
    match state {
        ChannelState::Connecting => 0,
        ChannelState::Open => 1,
        ChannelState::Closing => 2,
        ChannelState::Closed => 3,
    }
}

fn state_from_u8(value: u8) -> ChannelState {
    match value {
        0 => ChannelState::Connecting,
        1 => ChannelState::Open,
        2 => ChannelState::Closing,
        _ => ChannelState::Closed,
    }
}

/// Transfer channel delivering frames straight into the remote's event stream
///
/// The buffered amount is controlled by the test: either set directly or
/// accumulated from sent frame sizes until [`drain`](Self::drain).
pub struct MockTransferChannel {
    link: Arc<AtomicU8>,
    remote_events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    buffered: AtomicUsize,
    accumulate: AtomicBool,
    sent: Mutex<Vec<Bytes>>,
}

impl MockTransferChannel {
    fn linked(link: Arc<AtomicU8>, remote_events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            link,
            remote_events: Some(remote_events),
            buffered: AtomicUsize::new(0),
            accumulate: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// An open channel with nobody on the other end
    pub fn detached() -> Arc<Self> {
        Arc::new(Self {
            link: Arc::new(AtomicU8::new(state_to_u8(ChannelState::Open))),
            remote_events: None,
            buffered: AtomicUsize::new(0),
            accumulate: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Force the ready state of both ends without notifying anyone
    pub fn set_state(&self, state: ChannelState) {
        self.link.store(state_to_u8(state), Ordering::SeqCst);
    }

    pub fn set_buffered_amount(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    /// Count every sent frame as buffered until drained
    pub fn accumulate_buffered(&self, enabled: bool) {
        self.accumulate.store(enabled, Ordering::SeqCst);
    }

    pub fn drain(&self) {
        self.buffered.store(0, Ordering::SeqCst);
    }

    /// Frames sent so far
    pub async fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl TransferChannel for MockTransferChannel {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.ready_state() != ChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }

        self.sent.lock().await.push(frame.clone());
        if self.accumulate.load(Ordering::SeqCst) {
            self.buffered.fetch_add(frame.len(), Ordering::SeqCst);
        }

        if let Some(remote) = &self.remote_events {
            remote
                .send(ConnectionEvent::Message(frame))
                .map_err(|_| TransportError::ChannelClosed)?;
        }
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn ready_state(&self) -> ChannelState {
        state_from_u8(self.link.load(Ordering::SeqCst))
    }

    async fn close(&self) {
        let previous = self.link.swap(state_to_u8(ChannelState::Closed), Ordering::SeqCst);
        if state_from_u8(previous) != ChannelState::Closed {
            if let Some(remote) = &self.remote_events {
                let _ = remote.send(ConnectionEvent::ChannelClosed);
            }
        }
    }
}

// ============================================================================
// Mock Network (peer connections)
// ============================================================================

struct Endpoint {
    conn_id: u64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    local_set: bool,
    remote_set: bool,
    linked: bool,
}

#[derive(Default)]
struct NetworkState {
    /// Keyed by (local, remote)
    endpoints: HashMap<(PeerId, PeerId), Endpoint>,
    channels: HashMap<(PeerId, PeerId), Arc<MockTransferChannel>>,
    applied_candidates: HashMap<(PeerId, PeerId), Vec<IceCandidate>>,
    failing: HashSet<PeerId>,
    next_conn: u64,
}

impl NetworkState {
    /// Open a channel pair once both sides hold local and remote descriptions
    fn try_link(&mut self, a: &PeerId, b: &PeerId) {
        let ab = (a.clone(), b.clone());
        let ba = (b.clone(), a.clone());

        let ready = |e: Option<&Endpoint>| {
            e.map(|e| e.local_set && e.remote_set && !e.linked)
                .unwrap_or(false)
        };
        if !ready(self.endpoints.get(&ab)) || !ready(self.endpoints.get(&ba)) {
            return;
        }

        let (Some(a_events), Some(b_events)) = (
            self.endpoints.get(&ab).map(|e| e.events.clone()),
            self.endpoints.get(&ba).map(|e| e.events.clone()),
        ) else {
            return;
        };

        let link = Arc::new(AtomicU8::new(state_to_u8(ChannelState::Open)));
        let chan_a = Arc::new(MockTransferChannel::linked(link.clone(), b_events.clone()));
        let chan_b = Arc::new(MockTransferChannel::linked(link, a_events.clone()));

        for key in [&ab, &ba] {
            if let Some(endpoint) = self.endpoints.get_mut(key) {
                endpoint.linked = true;
            }
        }
        self.channels.insert(ab, chan_a.clone());
        self.channels.insert(ba, chan_b.clone());

        let _ = a_events.send(ConnectionEvent::ChannelOpen(chan_a));
        let _ = b_events.send(ConnectionEvent::ChannelOpen(chan_b));
    }
}

/// Shared in-memory network all mock factories connect through
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection factory for one node
    pub fn factory(&self, local: &PeerId) -> Arc<MockConnectionFactory> {
        Arc::new(MockConnectionFactory {
            network: self.clone(),
            local: local.clone(),
        })
    }

    /// Make every offer/answer created by `peer` fail
    pub async fn fail_negotiation(&self, peer: &PeerId) {
        self.state.lock().await.failing.insert(peer.clone());
    }

    pub async fn heal(&self, peer: &PeerId) {
        self.state.lock().await.failing.remove(peer);
    }

    /// Channel `local` uses to talk to `remote`, once linked
    pub async fn channel(&self, local: &PeerId, remote: &PeerId) -> Option<Arc<MockTransferChannel>> {
        self.state
            .lock()
            .await
            .channels
            .get(&(local.clone(), remote.clone()))
            .cloned()
    }

    /// Remote candidates `local` applied for `remote`, in application order
    pub async fn applied_candidates(&self, local: &PeerId, remote: &PeerId) -> Vec<IceCandidate> {
        self.state
            .lock()
            .await
            .applied_candidates
            .get(&(local.clone(), remote.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Id of the live connection `local` holds towards `remote`
    pub async fn connection_id(&self, local: &PeerId, remote: &PeerId) -> Option<u64> {
        self.state
            .lock()
            .await
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .map(|e| e.conn_id)
    }
}

pub struct MockConnectionFactory {
    network: MockNetwork,
    local: PeerId,
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create(
        &self,
        remote: &PeerId,
        _originator: bool,
    ) -> Result<(Box<dyn PeerConnection>, mpsc::UnboundedReceiver<ConnectionEvent>), TransportError>
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.network.state.lock().await;
        state.next_conn += 1;
        let conn_id = state.next_conn;
        state.endpoints.insert(
            (self.local.clone(), remote.clone()),
            Endpoint {
                conn_id,
                events: tx,
                local_set: false,
                remote_set: false,
                linked: false,
            },
        );

        let connection = MockPeerConnection {
            network: self.network.clone(),
            local: self.local.clone(),
            remote: remote.clone(),
            conn_id,
        };
        Ok((Box::new(connection), rx))
    }
}

/// Connection endpoint; operations fail once a newer connection replaced it
pub struct MockPeerConnection {
    network: MockNetwork,
    local: PeerId,
    remote: PeerId,
    conn_id: u64,
}

impl MockPeerConnection {
    fn key(&self) -> (PeerId, PeerId) {
        (self.local.clone(), self.remote.clone())
    }

    async fn set_local(&self, kind: SdpKind) -> Result<String, TransportError> {
        let mut state = self.network.state.lock().await;
        if state.failing.contains(&self.local) {
            return Err(TransportError::NegotiationFailed(format!(
                "injected failure for {}",
                self.local.short()
            )));
        }

        let endpoint = state
            .endpoints
            .get_mut(&self.key())
            .filter(|e| e.conn_id == self.conn_id)
            .ok_or_else(|| TransportError::ConnectionFailed("connection closed".to_string()))?;

        if kind == SdpKind::Answer && !endpoint.remote_set {
            return Err(TransportError::NegotiationFailed(
                "answer without remote offer".to_string(),
            ));
        }
        endpoint.local_set = true;

        let candidate = IceCandidate {
            candidate: format!("candidate:mock {} {}", self.local, self.conn_id),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let _ = endpoint.events.send(ConnectionEvent::LocalCandidate(candidate));

        let (local, remote) = self.key();
        state.try_link(&local, &remote);

        let label = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        Ok(format!("mock-{} {}->{} #{}", label, self.local, self.remote, self.conn_id))
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<String, TransportError> {
        self.set_local(SdpKind::Offer).await
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        self.set_local(SdpKind::Answer).await
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), TransportError> {
        let expected = match kind {
            SdpKind::Offer => "mock-offer ",
            SdpKind::Answer => "mock-answer ",
        };
        if !sdp.starts_with(expected) {
            return Err(TransportError::NegotiationFailed(format!(
                "malformed {:?} sdp",
                kind
            )));
        }

        let mut state = self.network.state.lock().await;
        let endpoint = state
            .endpoints
            .get_mut(&self.key())
            .filter(|e| e.conn_id == self.conn_id)
            .ok_or_else(|| TransportError::ConnectionFailed("connection closed".to_string()))?;
        endpoint.remote_set = true;

        let (local, remote) = self.key();
        state.try_link(&local, &remote);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.network.state.lock().await;
        let remote_set = state
            .endpoints
            .get(&self.key())
            .filter(|e| e.conn_id == self.conn_id)
            .map(|e| e.remote_set)
            .unwrap_or(false);
        if !remote_set {
            return Err(TransportError::NegotiationFailed(
                "remote description not set".to_string(),
            ));
        }
        state
            .applied_candidates
            .entry(self.key())
            .or_default()
            .push(candidate);
        Ok(())
    }

    async fn close(&self) {
        let channel = {
            let mut state = self.network.state.lock().await;
            let key = self.key();
            let current = state
                .endpoints
                .get(&key)
                .map(|e| e.conn_id == self.conn_id)
                .unwrap_or(false);
            if !current {
                return;
            }
            state.endpoints.remove(&key);
            state.channels.remove(&key)
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}
