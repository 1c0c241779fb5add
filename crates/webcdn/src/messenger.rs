//! Coordinator websocket client
//!
//! JSON envelopes `{type, data, to?}` over one websocket. Inbound `relay`
//! envelopes are handed to the registry through an mpsc stream; answers to
//! `lookup` resolve the waiting lookups for that hash.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};
use url::Url;
use webcdn_peer::{PeerId, RelayEnvelope, RelayKind, ResourceId, SignalChannel, TransportError};

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid coordinator URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Not connected")]
    NotConnected,

    #[error("Lookup for {0} timed out")]
    LookupTimeout(ResourceId),
}

impl From<TransportError> for MessengerError {
    fn from(_: TransportError) -> Self {
        MessengerError::NotConnected
    }
}

/// Coordinator's answer to a lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    pub hash: ResourceId,
    /// A node holding the resource, if any
    #[serde(rename = "peerid", default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerId>,
}

/// Outgoing frame; the coordinator fills in `from`
#[derive(Serialize)]
struct Outgoing<'a> {
    #[serde(rename = "type")]
    kind: RelayKind,
    data: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<&'a PeerId>,
}

type LookupWaiters = Arc<Mutex<HashMap<ResourceId, Vec<oneshot::Sender<LookupResponse>>>>>;

/// Add `?id=` for `local_id` unless the URL already names an id, which wins
pub fn coordinator_url(url: &str, local_id: &PeerId) -> Result<(Url, PeerId), url::ParseError> {
    let mut url = Url::parse(url)?;
    if let Some(id) = query_id(&url) {
        return Ok((url, id));
    }
    url.query_pairs_mut().append_pair("id", local_id.as_str());
    Ok((url, local_id.clone()))
}

fn query_id(url: &Url) -> Option<PeerId> {
    url.query_pairs()
        .find(|(key, value)| key == "id" && !value.is_empty())
        .map(|(_, value)| PeerId::new(value.into_owned()))
}

/// Connected coordinator session
pub struct Messenger {
    local_id: PeerId,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: Arc<AtomicBool>,
    lookups: LookupWaiters,
    lookup_timeout: Duration,
}

impl Messenger {
    /// Open the websocket. Returns the messenger and the stream of inbound
    /// `relay` envelopes.
    pub async fn connect(
        url: &str,
        local_id: &PeerId,
        lookup_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RelayEnvelope>), MessengerError> {
        let (url, local_id) = coordinator_url(url, local_id)?;
        info!("Connecting to coordinator {} as {}", url, local_id.short());

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let lookups: LookupWaiters = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!("Coordinator write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_connected = connected.clone();
        let reader_lookups = lookups.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        handle_text(&text, &relay_tx, &reader_lookups).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Coordinator connection error: {}", e);
                        break;
                    }
                }
            }
            info!("Coordinator connection closed");
            reader_connected.store(false, Ordering::SeqCst);
            // Pending lookups see their senders dropped
            reader_lookups.lock().await.clear();
        });

        let messenger = Arc::new(Self {
            local_id,
            outgoing: Mutex::new(Some(out_tx)),
            connected,
            lookups,
            lookup_timeout,
        });
        Ok((messenger, relay_rx))
    }

    /// Id the coordinator knows this node by
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Ask the coordinator who holds `hash`
    pub async fn lookup(&self, hash: &ResourceId) -> Result<LookupResponse, MessengerError> {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut lookups = self.lookups.lock().await;
            let waiters = lookups.entry(hash.clone()).or_default();
            waiters.retain(|waiter| !waiter.is_closed());
            waiters.push(tx);
            waiters.len() == 1
        };

        if first {
            trace!("Lookup {}", hash.short());
            if let Err(e) = self
                .send(RelayKind::Lookup, serde_json::json!(hash), None)
                .await
            {
                self.lookups.lock().await.remove(hash);
                return Err(e.into());
            }
        }

        let result = tokio::time::timeout(self.lookup_timeout, rx).await;
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MessengerError::NotConnected),
            Err(_) => {
                self.prune_lookup(hash).await;
                Err(MessengerError::LookupTimeout(hash.clone()))
            }
        }
    }

    /// Drop waiters for `hash` that stopped listening
    async fn prune_lookup(&self, hash: &ResourceId) {
        let mut lookups = self.lookups.lock().await;
        if let Some(waiters) = lookups.get_mut(hash) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                lookups.remove(hash);
            }
        }
    }

    /// Close the socket; later sends fail
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.outgoing.lock().await.take() {
            let _ = tx.send(Message::Close(None));
        }
        self.lookups.lock().await.clear();
    }
}

async fn handle_text(
    text: &str,
    relay_tx: &mpsc::UnboundedSender<RelayEnvelope>,
    lookups: &LookupWaiters,
) {
    let envelope: RelayEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Ignoring unparseable coordinator message: {}", e);
            return;
        }
    };

    match envelope.kind {
        RelayKind::Relay if !envelope.data.is_null() => {
            let _ = relay_tx.send(envelope);
        }
        RelayKind::LookupResponse if !envelope.data.is_null() => {
            let response: LookupResponse = match serde_json::from_value(envelope.data) {
                Ok(response) => response,
                Err(e) => {
                    warn!("Bad lookup-response: {}", e);
                    return;
                }
            };
            let waiters = lookups.lock().await.remove(&response.hash).unwrap_or_default();
            trace!(
                "Lookup {} answered ({} waiting)",
                response.hash.short(),
                waiters.len()
            );
            for waiter in waiters {
                let _ = waiter.send(response.clone());
            }
        }
        kind => trace!("Ignoring {} from coordinator", kind),
    }
}

#[async_trait]
impl SignalChannel for Messenger {
    async fn send(
        &self,
        kind: RelayKind,
        data: serde_json::Value,
        to: Option<&PeerId>,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = serde_json::to_string(&Outgoing {
            kind,
            data: &data,
            to,
        })
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let outgoing = self.outgoing.lock().await;
        let tx = outgoing.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }
}
