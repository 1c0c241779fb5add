//! Peer state machine
//!
//! One tokio task per remote node. The task negotiates the connection over the
//! relay, queues frames until the transfer channel opens, streams resources
//! out in chunks with backpressure and reports inbound transfer frames to the
//! registry. Everything for one peer runs inside that task, so no state here
//! is shared or locked.

use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::context::{NodeContext, TransferStats};
use crate::protocol::{ProtocolError, TransferMessage};
use crate::transport::{
    ChannelState, ConnectionEvent, ConnectionFactory, PeerConnection, SdpKind, SignalChannel,
    TransferChannel, TransportError,
};
use crate::types::{
    IceCandidate, PeerId, PeerState, RelayKind, ResourceId, SignalingPayload, TransferSettings,
};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Instructions from the registry
#[derive(Debug)]
pub enum PeerCommand {
    /// Ask the remote to stream a resource
    Fetch { resource_id: ResourceId },
    /// Inbound signaling from the relay
    Signal(SignalingPayload),
    /// Stream a cached resource to the remote
    Serve { resource_id: ResourceId, content: Bytes },
    /// Stop expecting a resource from the remote
    Forget { resource_id: ResourceId },
    /// Say bye and shut down
    Close,
}

/// What a peer reports back to the registry
#[derive(Debug, Clone)]
pub enum PeerEventKind {
    StateChanged(PeerState),
    /// Remote asked us for a resource
    FetchRequested(ResourceId),
    Chunk { resource_id: ResourceId, data: Bytes },
    End(ResourceId),
    /// A resource was fully streamed to the remote
    Served { resource_id: ResourceId, size: u64 },
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer: PeerId,
    /// Distinguishes successive peers created for the same id
    pub session: u64,
    pub kind: PeerEventKind,
}

/// Registry-side handle on a running peer task
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    pub session: u64,
    tx: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    /// Returns false once the peer task has exited
    pub fn send(&self, cmd: PeerCommand) -> bool {
        self.tx.send(cmd).is_ok()
    }
}

/// Everything a peer task needs at spawn time
pub struct PeerSetup {
    pub remote: PeerId,
    pub session: u64,
    /// Originators create the offer and the transfer channel
    pub originator: bool,
    pub ctx: NodeContext,
    pub settings: TransferSettings,
    pub signal: Arc<dyn SignalChannel>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

pub(crate) enum Pump {
    Finished { size: u64 },
    /// Channel buffer is full; try again after the backpressure delay
    Blocked,
}

/// A resource being streamed to the remote
pub(crate) struct OutboundStream {
    resource_id: ResourceId,
    content: Bytes,
    offset: usize,
}

impl OutboundStream {
    pub(crate) fn new(resource_id: ResourceId, content: Bytes) -> Self {
        Self {
            resource_id,
            content,
            offset: 0,
        }
    }

    /// Send chunks until done or the channel buffers too much.
    /// The end frame always follows the last chunk.
    pub(crate) async fn pump(
        &mut self,
        channel: &dyn TransferChannel,
        settings: &TransferSettings,
        stats: &TransferStats,
    ) -> Result<Pump, PeerError> {
        loop {
            if channel.ready_state() != ChannelState::Open {
                return Err(TransportError::ChannelClosed.into());
            }
            if channel.buffered_amount().await >= settings.buffer_threshold {
                return Ok(Pump::Blocked);
            }

            if self.offset < self.content.len() {
                let end = (self.offset + settings.chunk_size).min(self.content.len());
                let frame = TransferMessage::FetchChunk {
                    resource_id: self.resource_id.clone(),
                    data: self.content.slice(self.offset..end),
                }
                .encode()?;
                let len = frame.len();
                channel.send(frame).await?;
                stats.record_sent(len);
                self.offset = end;
            } else {
                let frame = TransferMessage::FetchEnd {
                    resource_id: self.resource_id.clone(),
                }
                .encode()?;
                let len = frame.len();
                channel.send(frame).await?;
                stats.record_sent(len);
                return Ok(Pump::Finished {
                    size: self.content.len() as u64,
                });
            }
        }
    }
}

pub struct Peer {
    remote: PeerId,
    session: u64,
    originator: bool,
    ctx: NodeContext,
    settings: TransferSettings,
    signal: Arc<dyn SignalChannel>,
    factory: Arc<dyn ConnectionFactory>,
    events: mpsc::UnboundedSender<PeerEvent>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,

    state: PeerState,
    connection: Option<Box<dyn PeerConnection>>,
    connection_events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    channel: Option<Arc<dyn TransferChannel>>,
    /// Frames submitted before the channel opened, in submission order
    queued: VecDeque<Bytes>,
    /// Remote candidates that arrived before the remote description
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    /// Our offer is out and unanswered
    making_offer: bool,
    outbound: VecDeque<OutboundStream>,
    /// Resources requested from the remote and not yet ended
    inbound: HashSet<ResourceId>,
    resume_at: Option<Instant>,
}

impl Peer {
    /// Spawn the peer task and return its handle
    pub fn spawn(setup: PeerSetup) -> PeerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = PeerHandle {
            id: setup.remote.clone(),
            session: setup.session,
            tx,
        };

        let peer = Peer {
            remote: setup.remote,
            session: setup.session,
            originator: setup.originator,
            ctx: setup.ctx,
            settings: setup.settings,
            signal: setup.signal,
            factory: setup.factory,
            events: setup.events,
            commands: rx,
            state: PeerState::New,
            connection: None,
            connection_events: None,
            channel: None,
            queued: VecDeque::new(),
            pending_candidates: Vec::new(),
            remote_description_set: false,
            making_offer: false,
            outbound: VecDeque::new(),
            inbound: HashSet::new(),
            resume_at: None,
        };
        tokio::spawn(peer.run());
        handle
    }

    async fn run(mut self) {
        debug!(
            "[Peer {}] Started ({})",
            self.remote.short(),
            if self.originator { "originator" } else { "responder" }
        );
        if self.originator {
            self.start_negotiation().await;
        }

        while !self.state.is_terminal() {
            let resume_at = self.resume_at;
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("[Peer {}] Registry gone, closing", self.remote.short());
                        self.set_state(PeerState::Closed);
                    }
                },
                event = next_event(&mut self.connection_events) => match event {
                    Some(event) => self.handle_connection_event(event).await,
                    None => self.connection_events = None,
                },
                _ = wait_until(resume_at) => {
                    self.resume_at = None;
                    self.pump_outbound().await;
                }
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, cmd: PeerCommand) {
        match cmd {
            PeerCommand::Fetch { resource_id } => {
                debug!(
                    "[Peer {}] Fetch {}",
                    self.remote.short(),
                    resource_id.short()
                );
                if self.state == PeerState::New && self.connection.is_none() {
                    self.start_negotiation().await;
                }
                match (TransferMessage::FetchRequest {
                    resource_id: resource_id.clone(),
                })
                .encode()
                {
                    Ok(frame) => {
                        if self.send_frame(frame).await {
                            self.inbound.insert(resource_id);
                        }
                    }
                    Err(e) => warn!("[Peer {}] Failed to encode fetch: {}", self.remote.short(), e),
                }
                self.refresh_activity();
            }
            PeerCommand::Signal(payload) => self.handle_signal(payload).await,
            PeerCommand::Serve {
                resource_id,
                content,
            } => {
                debug!(
                    "[Peer {}] Serving {} ({} bytes)",
                    self.remote.short(),
                    resource_id.short(),
                    content.len()
                );
                self.outbound
                    .push_back(OutboundStream::new(resource_id, content));
                // While backing off, the resume timer picks the new stream up
                if self.resume_at.is_none() {
                    self.pump_outbound().await;
                }
            }
            PeerCommand::Forget { resource_id } => {
                if self.inbound.remove(&resource_id) {
                    debug!(
                        "[Peer {}] No longer expecting {}",
                        self.remote.short(),
                        resource_id.short()
                    );
                    self.refresh_activity();
                }
            }
            PeerCommand::Close => {
                self.relay(SignalingPayload::Bye).await;
                self.set_state(PeerState::Closed);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------------

    async fn start_negotiation(&mut self) {
        self.set_state(PeerState::Negotiating);
        if let Err(e) = self.send_offer().await {
            self.fail(format!("offer failed: {}", e));
        }
    }

    async fn send_offer(&mut self) -> Result<(), PeerError> {
        self.connect(true).await?;
        let connection = self.connection.as_ref().ok_or(TransportError::NotConnected)?;
        let sdp = connection.create_offer().await?;
        self.making_offer = true;
        self.relay(SignalingPayload::Offer { sdp }).await;
        Ok(())
    }

    /// Replace the connection with a fresh one
    async fn connect(&mut self, originator: bool) -> Result<(), PeerError> {
        if let Some(old) = self.connection.take() {
            old.close().await;
        }
        let (connection, events) = self.factory.create(&self.remote, originator).await?;
        self.connection = Some(connection);
        self.connection_events = Some(events);
        self.channel = None;
        self.remote_description_set = false;
        self.making_offer = false;
        Ok(())
    }

    async fn handle_signal(&mut self, payload: SignalingPayload) {
        trace!("[Peer {}] Signal {}", self.remote.short(), payload.name());
        match payload {
            SignalingPayload::Offer { sdp } => {
                if self.making_offer {
                    if self.ctx.local_id.is_polite_towards(&self.remote) {
                        debug!("[Peer {}] Offer collision, yielding", self.remote.short());
                        if let Err(e) = self.connect(false).await {
                            self.fail(format!("reconnect failed: {}", e));
                            return;
                        }
                    } else {
                        debug!("[Peer {}] Offer collision, ignoring theirs", self.remote.short());
                        return;
                    }
                }
                if let Err(e) = self.accept_offer(&sdp).await {
                    self.fail(format!("answer failed: {}", e));
                }
            }
            SignalingPayload::Answer { sdp } => {
                if !self.making_offer {
                    debug!("[Peer {}] Unexpected answer, ignoring", self.remote.short());
                    return;
                }
                if let Err(e) = self.accept_answer(&sdp).await {
                    self.fail(format!("remote answer rejected: {}", e));
                }
            }
            SignalingPayload::Candidate(candidate) => self.add_remote_candidate(candidate).await,
            SignalingPayload::Bye => {
                info!("[Peer {}] Remote said bye", self.remote.short());
                self.set_state(PeerState::Closed);
            }
        }
    }

    async fn accept_offer(&mut self, sdp: &str) -> Result<(), PeerError> {
        if self.connection.is_none() || self.remote_description_set {
            // Fresh offer from a remote that restarted its side
            self.connect(false).await?;
        }
        self.set_state(PeerState::Negotiating);

        let connection = self.connection.as_ref().ok_or(TransportError::NotConnected)?;
        connection.set_remote_description(SdpKind::Offer, sdp).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let connection = self.connection.as_ref().ok_or(TransportError::NotConnected)?;
        let answer = connection.create_answer().await?;
        self.relay(SignalingPayload::Answer { sdp: answer }).await;
        Ok(())
    }

    async fn accept_answer(&mut self, sdp: &str) -> Result<(), PeerError> {
        let connection = self.connection.as_ref().ok_or(TransportError::NotConnected)?;
        connection.set_remote_description(SdpKind::Answer, sdp).await?;
        self.making_offer = false;
        self.remote_description_set = true;
        self.flush_candidates().await;
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.connection.is_some() && self.remote_description_set {
            self.apply_candidate(candidate).await;
        } else {
            trace!(
                "[Peer {}] Buffering candidate until remote description",
                self.remote.short()
            );
            self.pending_candidates.push(candidate);
        }
    }

    /// Apply buffered candidates in arrival order
    async fn flush_candidates(&mut self) {
        let candidates = std::mem::take(&mut self.pending_candidates);
        for candidate in candidates {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Some(connection) = &self.connection {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("[Peer {}] Candidate rejected: {}", self.remote.short(), e);
            }
        }
    }

    async fn relay(&self, payload: SignalingPayload) {
        let name = payload.name();
        let data = match serde_json::to_value(&payload) {
            Ok(data) => data,
            Err(e) => {
                warn!("[Peer {}] Failed to encode {}: {}", self.remote.short(), name, e);
                return;
            }
        };
        if let Err(e) = self
            .signal
            .send(RelayKind::Relay, data, Some(&self.remote))
            .await
        {
            warn!("[Peer {}] Failed to relay {}: {}", self.remote.short(), name, e);
        }
    }

    // ------------------------------------------------------------------------
    // Transfer channel
    // ------------------------------------------------------------------------

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                self.relay(SignalingPayload::Candidate(candidate)).await
            }
            ConnectionEvent::ChannelOpen(channel) => {
                info!("[Peer {}] Transfer channel open", self.remote.short());
                self.channel = Some(channel);
                self.set_state(PeerState::Connected);
                self.flush_queue().await;
                self.pump_outbound().await;
                self.refresh_activity();
            }
            ConnectionEvent::Message(frame) => self.handle_frame(frame),
            ConnectionEvent::ChannelClosed => {
                info!("[Peer {}] Transfer channel closed", self.remote.short());
                self.set_state(PeerState::Closed);
            }
            ConnectionEvent::Failed(reason) => self.fail(reason),
        }
    }

    /// Send now, queue while connecting, drop silently once closing.
    /// Returns whether the frame was accepted.
    async fn send_frame(&mut self, frame: Bytes) -> bool {
        let Some(channel) = self.channel.clone() else {
            self.queued.push_back(frame);
            return true;
        };

        match channel.ready_state() {
            ChannelState::Connecting => {
                self.queued.push_back(frame);
                true
            }
            ChannelState::Open => {
                let len = frame.len();
                match channel.send(frame).await {
                    Ok(()) => {
                        self.ctx.stats.record_sent(len);
                        true
                    }
                    Err(e) => {
                        warn!("[Peer {}] Send failed: {}", self.remote.short(), e);
                        false
                    }
                }
            }
            state @ (ChannelState::Closing | ChannelState::Closed) => {
                debug!(
                    "[Peer {}] Channel {:?}, dropping frame",
                    self.remote.short(),
                    state
                );
                false
            }
        }
    }

    async fn flush_queue(&mut self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        if !self.queued.is_empty() {
            debug!(
                "[Peer {}] Flushing {} queued frames",
                self.remote.short(),
                self.queued.len()
            );
        }
        while channel.ready_state() == ChannelState::Open {
            let Some(frame) = self.queued.pop_front() else {
                break;
            };
            let len = frame.len();
            if let Err(e) = channel.send(frame).await {
                warn!("[Peer {}] Flush failed: {}", self.remote.short(), e);
                break;
            }
            self.ctx.stats.record_sent(len);
        }
    }

    fn handle_frame(&mut self, frame: Bytes) {
        match TransferMessage::parse(&frame) {
            Ok(TransferMessage::FetchRequest { resource_id }) => {
                debug!(
                    "[Peer {}] Remote requested {}",
                    self.remote.short(),
                    resource_id.short()
                );
                self.emit(PeerEventKind::FetchRequested(resource_id));
            }
            Ok(TransferMessage::FetchChunk { resource_id, data }) => {
                trace!(
                    "[Peer {}] Chunk of {} ({} bytes)",
                    self.remote.short(),
                    resource_id.short(),
                    data.len()
                );
                self.ctx.stats.record_received(data.len());
                self.emit(PeerEventKind::Chunk { resource_id, data });
            }
            Ok(TransferMessage::FetchEnd { resource_id }) => {
                debug!(
                    "[Peer {}] End of {}",
                    self.remote.short(),
                    resource_id.short()
                );
                self.inbound.remove(&resource_id);
                self.emit(PeerEventKind::End(resource_id));
                self.refresh_activity();
            }
            Err(e) => warn!(
                "[Peer {}] Dropping malformed frame ({} bytes): {}",
                self.remote.short(),
                frame.len(),
                e
            ),
        }
    }

    async fn pump_outbound(&mut self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };

        while let Some(stream) = self.outbound.front_mut() {
            match stream
                .pump(channel.as_ref(), &self.settings, &self.ctx.stats)
                .await
            {
                Ok(Pump::Finished { size }) => {
                    let resource_id = stream.resource_id.clone();
                    self.outbound.pop_front();
                    debug!(
                        "[Peer {}] Served {} ({} bytes)",
                        self.remote.short(),
                        resource_id.short(),
                        size
                    );
                    self.emit(PeerEventKind::Served { resource_id, size });
                }
                Ok(Pump::Blocked) => {
                    trace!("[Peer {}] Buffer full, backing off", self.remote.short());
                    self.resume_at = Some(Instant::now() + self.settings.backpressure_delay);
                    break;
                }
                Err(e) => {
                    let resource_id = stream.resource_id.clone();
                    self.outbound.pop_front();
                    warn!(
                        "[Peer {}] Stopped serving {}: {}",
                        self.remote.short(),
                        resource_id.short(),
                        e
                    );
                }
            }
        }
        self.refresh_activity();
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    /// Toggle between Connected and Transferring once the channel is up
    fn refresh_activity(&mut self) {
        if !self.state.is_open() {
            return;
        }
        let busy = !self.outbound.is_empty() || !self.inbound.is_empty();
        self.set_state(if busy {
            PeerState::Transferring
        } else {
            PeerState::Connected
        });
    }

    fn set_state(&mut self, state: PeerState) {
        if self.state == state || self.state.is_terminal() {
            return;
        }
        debug!("[Peer {}] {} -> {}", self.remote.short(), self.state, state);
        self.state = state;
        self.emit(PeerEventKind::StateChanged(state));
    }

    fn fail(&mut self, reason: String) {
        warn!("[Peer {}] Failed: {}", self.remote.short(), reason);
        self.set_state(PeerState::Failed);
    }

    fn emit(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerEvent {
            peer: self.remote.clone(),
            session: self.session,
            kind,
        });
    }

    async fn teardown(&mut self) {
        if !self.queued.is_empty() || !self.outbound.is_empty() {
            debug!(
                "[Peer {}] Dropping {} queued frames and {} outbound streams",
                self.remote.short(),
                self.queued.len(),
                self.outbound.len()
            );
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }
}

async fn next_event(
    rx: &mut Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
) -> Option<ConnectionEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
