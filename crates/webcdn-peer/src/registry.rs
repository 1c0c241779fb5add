//! Peer registry
//!
//! Directory of peer tasks keyed by remote id, plus the node's content caches.
//! All of it is owned by a single actor task; [`PeerRegistry`] is a cheap
//! cloneable handle that talks to it over an unbounded channel, so `fetch`
//! and `route_relay` never block.

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use webcdn_config::PeerConfig;

use crate::context::NodeContext;
use crate::peer::{Peer, PeerCommand, PeerEvent, PeerEventKind, PeerHandle, PeerSetup};
use crate::transport::{ConnectionFactory, SignalChannel};
use crate::types::{
    PeerId, PeerState, RelayEnvelope, RelayKind, ResourceId, ResourceUpdate, SignalingPayload,
    TransferSettings, UploadReport,
};

/// Verified content held by this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResource {
    pub content: Bytes,
    /// Hex content hash the bytes were verified against
    pub content_hash: String,
}

type FinishCallback = Box<dyn FnOnce(Bytes) + Send>;

enum RegistryCommand {
    Fetch {
        peer: PeerId,
        resource_id: ResourceId,
        reply: oneshot::Sender<Bytes>,
    },
    Relay(RelayEnvelope),
    FinishDownload {
        resource_id: ResourceId,
        resource: CachedResource,
        callback: FinishCallback,
    },
    Publish {
        resource_id: ResourceId,
        resource: CachedResource,
    },
    Cached {
        resource_id: ResourceId,
        reply: oneshot::Sender<Option<CachedResource>>,
    },
    ReportMismatch {
        peer: PeerId,
        resource_id: ResourceId,
    },
    IsTrusted {
        peer: PeerId,
        resource_id: ResourceId,
        reply: oneshot::Sender<bool>,
    },
    ReportUpload {
        peer: PeerId,
        resource_id: ResourceId,
        size: u64,
    },
    StateOf {
        peer: PeerId,
        reply: oneshot::Sender<Option<PeerState>>,
    },
    Counts {
        reply: oneshot::Sender<(usize, usize)>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle on the registry actor
#[derive(Clone)]
pub struct PeerRegistry {
    ctx: NodeContext,
    tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl PeerRegistry {
    /// Spawn the registry actor. Must be called inside a tokio runtime.
    pub fn new(
        ctx: NodeContext,
        config: &PeerConfig,
        signal: Arc<dyn SignalChannel>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();

        let actor = RegistryActor {
            ctx: ctx.clone(),
            settings: TransferSettings::from(config),
            pending_ttl: config.pending_ttl(),
            signal,
            factory,
            commands: rx,
            peer_events_tx,
            peer_events_rx,
            peers: HashMap::new(),
            pending: HashMap::new(),
            downloaded: HashMap::new(),
            untrusted: HashSet::new(),
            next_session: 0,
        };
        tokio::spawn(actor.run());

        Self { ctx, tx }
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn local_id(&self) -> &PeerId {
        &self.ctx.local_id
    }

    /// Request `resource_id` from `peer`, creating the peer as originator if needed.
    ///
    /// `on_complete` receives the reassembled bytes when the end sentinel
    /// arrives. It is dropped unsent if the peer fails or closes, if the
    /// partial transfer is evicted, or if the peer sends nothing within the
    /// pending ttl. The caller owns any shorter timeout.
    pub fn fetch(&self, peer: &PeerId, resource_id: &ResourceId, on_complete: oneshot::Sender<Bytes>) {
        let _ = self.tx.send(RegistryCommand::Fetch {
            peer: peer.clone(),
            resource_id: resource_id.clone(),
            reply: on_complete,
        });
    }

    /// Route an inbound `relay` envelope to the peer it came from
    pub fn route_relay(&self, envelope: RelayEnvelope) {
        let _ = self.tx.send(RegistryCommand::Relay(envelope));
    }

    /// Route every envelope from `inbound` until it ends
    pub fn attach(&self, mut inbound: mpsc::UnboundedReceiver<RelayEnvelope>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                registry.route_relay(envelope);
            }
            debug!("Relay subscription ended");
        })
    }

    /// Cache verified content, drop its pending transfer, announce it to the
    /// coordinator and hand the content to `callback`
    pub fn finish_download<F>(
        &self,
        resource_id: &ResourceId,
        content: Bytes,
        content_hash: String,
        callback: F,
    ) where
        F: FnOnce(Bytes) + Send + 'static,
    {
        let _ = self.tx.send(RegistryCommand::FinishDownload {
            resource_id: resource_id.clone(),
            resource: CachedResource {
                content,
                content_hash,
            },
            callback: Box::new(callback),
        });
    }

    /// Seed content this node verified itself
    pub fn publish(&self, resource_id: &ResourceId, content: Bytes, content_hash: String) {
        let _ = self.tx.send(RegistryCommand::Publish {
            resource_id: resource_id.clone(),
            resource: CachedResource {
                content,
                content_hash,
            },
        });
    }

    pub async fn cached(&self, resource_id: &ResourceId) -> Option<CachedResource> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Cached {
                resource_id: resource_id.clone(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Never use `peer` for `resource_id` again
    pub fn report_mismatch(&self, peer: &PeerId, resource_id: &ResourceId) {
        let _ = self.tx.send(RegistryCommand::ReportMismatch {
            peer: peer.clone(),
            resource_id: resource_id.clone(),
        });
    }

    pub async fn is_trusted(&self, peer: &PeerId, resource_id: &ResourceId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RegistryCommand::IsTrusted {
                peer: peer.clone(),
                resource_id: resource_id.clone(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Tell the coordinator `peer` uploaded `size` bytes of `resource_id` to us
    pub fn report_upload(&self, peer: &PeerId, resource_id: &ResourceId, size: u64) {
        let _ = self.tx.send(RegistryCommand::ReportUpload {
            peer: peer.clone(),
            resource_id: resource_id.clone(),
            size,
        });
    }

    pub async fn peer_state(&self, peer: &PeerId) -> Option<PeerState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::StateOf {
                peer: peer.clone(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn peer_count(&self) -> usize {
        self.counts().await.0
    }

    /// Number of partially received transfers
    pub async fn pending_count(&self) -> usize {
        self.counts().await.1
    }

    async fn counts(&self) -> (usize, usize) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryCommand::Counts { reply }).is_err() {
            return (0, 0);
        }
        rx.await.unwrap_or((0, 0))
    }

    /// Say bye to every peer and stop the actor
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// A response stream in progress
struct PendingTransfer {
    buffer: BytesMut,
    last_activity: Instant,
}

/// Callers waiting on one resource from one peer
struct Waiting {
    waiters: Vec<oneshot::Sender<Bytes>>,
    requested_at: Instant,
}

struct PeerSlot {
    handle: PeerHandle,
    state: PeerState,
    /// Completion callbacks waiting on this peer, by resource
    callbacks: HashMap<ResourceId, Waiting>,
}

impl PeerSlot {
    /// Drop the waiters for `resource_id` and tell the peer to stop expecting it
    fn forget(&mut self, resource_id: &ResourceId) {
        self.callbacks.remove(resource_id);
        self.handle.send(PeerCommand::Forget {
            resource_id: resource_id.clone(),
        });
    }
}

struct RegistryActor {
    ctx: NodeContext,
    settings: TransferSettings,
    pending_ttl: Duration,
    signal: Arc<dyn SignalChannel>,
    factory: Arc<dyn ConnectionFactory>,
    commands: mpsc::UnboundedReceiver<RegistryCommand>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_events_rx: mpsc::UnboundedReceiver<PeerEvent>,

    peers: HashMap<PeerId, PeerSlot>,
    /// Keyed per peer so a stalled stream never blocks another peer's
    pending: HashMap<(PeerId, ResourceId), PendingTransfer>,
    downloaded: HashMap<ResourceId, CachedResource>,
    untrusted: HashSet<(PeerId, ResourceId)>,
    next_session: u64,
}

impl RegistryActor {
    async fn run(mut self) {
        let mut sweep = interval((self.pending_ttl / 2).max(Duration::from_millis(10)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        self.close_all();
                        break;
                    }
                },
                Some(event) = self.peer_events_rx.recv() => self.handle_peer_event(event),
                _ = sweep.tick() => self.sweep(),
            }
        }
        debug!("Registry stopped");
    }

    /// Returns false once the registry should stop
    async fn handle_command(&mut self, cmd: RegistryCommand) -> bool {
        match cmd {
            RegistryCommand::Fetch {
                peer,
                resource_id,
                reply,
            } => self.fetch(peer, resource_id, reply),
            RegistryCommand::Relay(envelope) => self.route_relay(envelope),
            RegistryCommand::FinishDownload {
                resource_id,
                resource,
                callback,
            } => {
                let content = resource.content.clone();
                self.pending.retain(|(_, id), _| *id != resource_id);
                self.store(resource_id, resource).await;
                callback(content);
            }
            RegistryCommand::Publish {
                resource_id,
                resource,
            } => self.store(resource_id, resource).await,
            RegistryCommand::Cached { resource_id, reply } => {
                let _ = reply.send(self.downloaded.get(&resource_id).cloned());
            }
            RegistryCommand::ReportMismatch { peer, resource_id } => {
                warn!(
                    "Peer {} sent bad data for {}, not trusting it again",
                    peer.short(),
                    resource_id.short()
                );
                self.untrusted.insert((peer, resource_id));
            }
            RegistryCommand::IsTrusted {
                peer,
                resource_id,
                reply,
            } => {
                let _ = reply.send(!self.untrusted.contains(&(peer, resource_id)));
            }
            RegistryCommand::ReportUpload {
                peer,
                resource_id,
                size,
            } => {
                let report = UploadReport {
                    from: peer,
                    to: self.ctx.local_id.clone(),
                    hash: resource_id,
                    size,
                };
                self.notify(RelayKind::UploadRatio, &report).await;
            }
            RegistryCommand::StateOf { peer, reply } => {
                let _ = reply.send(self.peers.get(&peer).map(|slot| slot.state));
            }
            RegistryCommand::Counts { reply } => {
                let _ = reply.send((self.peers.len(), self.pending.len()));
            }
            RegistryCommand::Shutdown { reply } => {
                self.close_all();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn fetch(&mut self, peer: PeerId, resource_id: ResourceId, reply: oneshot::Sender<Bytes>) {
        if peer == self.ctx.local_id {
            warn!("Refusing to fetch {} from ourselves", resource_id.short());
            return;
        }

        let slot = self.ensure_peer(&peer, true);
        let waiting = slot
            .callbacks
            .entry(resource_id.clone())
            .or_insert_with(|| Waiting {
                waiters: Vec::new(),
                requested_at: Instant::now(),
            });
        waiting.waiters.retain(|tx| !tx.is_closed());
        waiting.waiters.push(reply);
        if waiting.waiters.len() > 1 {
            // Same resource already requested from this peer; share the stream
            trace!(
                "Joining in-flight fetch of {} from {}",
                resource_id.short(),
                peer.short()
            );
            return;
        }
        waiting.requested_at = Instant::now();
        let sent = slot.handle.send(PeerCommand::Fetch {
            resource_id: resource_id.clone(),
        });
        if !sent {
            // Peer task already exited; its removal event is on the way
            slot.callbacks.remove(&resource_id);
        }

        // A fresh request starts a fresh buffer
        self.pending.remove(&(peer, resource_id));
    }

    fn route_relay(&mut self, envelope: RelayEnvelope) {
        if envelope.kind != RelayKind::Relay {
            trace!("Ignoring {} envelope", envelope.kind);
            return;
        }
        let Some(from) = envelope.from else {
            warn!("Relay envelope without sender, dropping");
            return;
        };
        if from == self.ctx.local_id {
            return;
        }

        let payload: SignalingPayload = match serde_json::from_value(envelope.data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad signaling payload from {}: {}", from.short(), e);
                return;
            }
        };

        if payload == SignalingPayload::Bye && !self.peers.contains_key(&from) {
            return;
        }

        let slot = self.ensure_peer(&from, false);
        slot.handle.send(PeerCommand::Signal(payload));
    }

    /// Idempotent: at most one peer per id
    fn ensure_peer(&mut self, peer: &PeerId, originator: bool) -> &mut PeerSlot {
        self.peers.entry(peer.clone()).or_insert_with(|| {
            self.next_session += 1;
            info!(
                "Creating peer {} ({})",
                peer.short(),
                if originator { "originator" } else { "responder" }
            );
            let handle = Peer::spawn(PeerSetup {
                remote: peer.clone(),
                session: self.next_session,
                originator,
                ctx: self.ctx.clone(),
                settings: self.settings.clone(),
                signal: self.signal.clone(),
                factory: self.factory.clone(),
                events: self.peer_events_tx.clone(),
            });
            PeerSlot {
                handle,
                state: PeerState::New,
                callbacks: HashMap::new(),
            }
        })
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        let current = self
            .peers
            .get(&event.peer)
            .map(|slot| slot.handle.session == event.session)
            .unwrap_or(false);
        if !current {
            trace!("Stale event from {} session {}", event.peer.short(), event.session);
            return;
        }

        match event.kind {
            PeerEventKind::StateChanged(state) => {
                if state.is_terminal() {
                    self.remove_peer(&event.peer, state);
                } else if let Some(slot) = self.peers.get_mut(&event.peer) {
                    slot.state = state;
                }
            }
            PeerEventKind::FetchRequested(resource_id) => {
                match self.downloaded.get(&resource_id) {
                    Some(resource) => {
                        if let Some(slot) = self.peers.get(&event.peer) {
                            slot.handle.send(PeerCommand::Serve {
                                resource_id,
                                content: resource.content.clone(),
                            });
                        }
                    }
                    None => debug!(
                        "Peer {} asked for {}, not cached",
                        event.peer.short(),
                        resource_id.short()
                    ),
                }
            }
            PeerEventKind::Chunk { resource_id, data } => {
                let transfer = self
                    .pending
                    .entry((event.peer, resource_id))
                    .or_insert_with(|| PendingTransfer {
                        buffer: BytesMut::new(),
                        last_activity: Instant::now(),
                    });
                transfer.buffer.extend_from_slice(&data);
                transfer.last_activity = Instant::now();
            }
            PeerEventKind::End(resource_id) => {
                // No buffer means an empty resource: end sentinel with no chunks
                let content = self
                    .pending
                    .remove(&(event.peer.clone(), resource_id.clone()))
                    .map(|transfer| transfer.buffer.freeze())
                    .unwrap_or_default();

                let waiters = self
                    .peers
                    .get_mut(&event.peer)
                    .and_then(|slot| slot.callbacks.remove(&resource_id))
                    .map(|waiting| waiting.waiters)
                    .unwrap_or_default();
                if waiters.is_empty() {
                    debug!(
                        "No one waiting for {} from {}, discarding",
                        resource_id.short(),
                        event.peer.short()
                    );
                }
                debug!(
                    "Received {} from {} ({} bytes)",
                    resource_id.short(),
                    event.peer.short(),
                    content.len()
                );
                for waiter in waiters {
                    let _ = waiter.send(content.clone());
                }
            }
            PeerEventKind::Served { resource_id, size } => {
                debug!(
                    "Uploaded {} to {} ({} bytes)",
                    resource_id.short(),
                    event.peer.short(),
                    size
                );
            }
        }
    }

    /// Forget a closed or failed peer; its waiters see their callbacks dropped
    fn remove_peer(&mut self, peer: &PeerId, state: PeerState) {
        if let Some(slot) = self.peers.remove(peer) {
            let waiting: usize = slot.callbacks.values().map(|w| w.waiters.len()).sum();
            info!(
                "Peer {} {} ({} waiting fetches dropped)",
                peer.short(),
                state,
                waiting
            );
        }
        self.pending.retain(|(owner, _), _| owner != peer);
    }

    async fn store(&mut self, resource_id: ResourceId, resource: CachedResource) {
        let size = resource.content.len() as u64;
        debug!("Caching {} ({} bytes)", resource_id.short(), size);
        self.downloaded.insert(resource_id.clone(), resource);
        self.notify(
            RelayKind::Update,
            &[ResourceUpdate {
                hash: resource_id,
                size,
            }],
        )
        .await;
    }

    async fn notify<T: serde::Serialize + ?Sized>(&self, kind: RelayKind, data: &T) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode {}: {}", kind, e);
                return;
            }
        };
        if let Err(e) = self.signal.send(kind, data, None).await {
            warn!("Failed to send {} to coordinator: {}", kind, e);
        }
    }

    /// Evict stale partial transfers, then forget requests that were
    /// abandoned by every caller or never answered within the ttl
    fn sweep(&mut self) {
        let ttl = self.pending_ttl;
        let mut evicted = Vec::new();
        self.pending.retain(|key, transfer| {
            let keep = transfer.last_activity.elapsed() <= ttl;
            if !keep {
                evicted.push(key.clone());
            }
            keep
        });

        for (peer, resource_id) in evicted {
            warn!(
                "Evicting stalled transfer of {} from {}",
                resource_id.short(),
                peer.short()
            );
            self.ctx.stats.record_evicted();
            if let Some(slot) = self.peers.get_mut(&peer) {
                slot.forget(&resource_id);
            }
        }

        let mut forgotten = Vec::new();
        let pending = &self.pending;
        for (peer, slot) in self.peers.iter_mut() {
            let stale: Vec<ResourceId> = slot
                .callbacks
                .iter_mut()
                .filter_map(|(resource_id, waiting)| {
                    waiting.waiters.retain(|tx| !tx.is_closed());
                    let streaming = pending.contains_key(&(peer.clone(), resource_id.clone()));
                    let unanswered = !streaming && waiting.requested_at.elapsed() > ttl;
                    (waiting.waiters.is_empty() || unanswered).then(|| resource_id.clone())
                })
                .collect();
            for resource_id in stale {
                debug!(
                    "Forgetting request for {} from {}",
                    resource_id.short(),
                    peer.short()
                );
                slot.forget(&resource_id);
                forgotten.push((peer.clone(), resource_id));
            }
        }
        for key in forgotten {
            self.pending.remove(&key);
        }
    }

    fn close_all(&mut self) {
        info!("Closing {} peers", self.peers.len());
        for (_, slot) in self.peers.drain() {
            slot.handle.send(PeerCommand::Close);
        }
        self.pending.clear();
    }
}
