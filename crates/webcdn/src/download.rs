//! Per-resource download orchestration
//!
//! A [`Download`] makes at most one peer attempt and at most one fallback
//! attempt. Peer data is only delivered after it hashes to the expected
//! content hash; a mismatch marks the peer untrusted for that resource and
//! moves on to the fallback. Whatever happens, the result is delivered
//! exactly once.

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use webcdn_peer::{PeerId, PeerRegistry, ResourceId};

use crate::fallback::{FallbackClient, FallbackError};
use crate::integrity::{self, resource_id_for_url, IntegrityError};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Fallback failed: {0}")]
    Fallback(#[from] FallbackError),

    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("No fallback URL for {0}")]
    NoFallback(ResourceId),
}

/// Resolve one resource, from a peer if possible
pub struct Download {
    resource_id: ResourceId,
    /// Whether the resource id is itself the content hash
    content_addressed: bool,
    peer: Option<PeerId>,
    expected_hash: Option<String>,
    fallback_url: Option<String>,
    peer_timeout: Duration,
    registry: PeerRegistry,
    fallback: FallbackClient,
}

impl Download {
    /// Download of a content-addressed resource
    pub fn new(registry: PeerRegistry, fallback: FallbackClient, resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            content_addressed: true,
            peer: None,
            expected_hash: None,
            fallback_url: None,
            peer_timeout: Duration::from_secs(5),
            registry,
            fallback,
        }
    }

    /// Download of a resource known only by its fallback URL
    pub fn for_url(registry: PeerRegistry, fallback: FallbackClient, url: &str) -> Self {
        let mut download = Self::new(registry, fallback, resource_id_for_url(url));
        download.content_addressed = false;
        download.fallback_url = Some(url.to_string());
        download
    }

    pub fn with_peer(mut self, peer: Option<PeerId>) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_expected_hash(mut self, hash: Option<String>) -> Self {
        self.expected_hash = hash.map(|h| h.to_ascii_lowercase());
        self
    }

    pub fn with_fallback_url(mut self, url: Option<String>) -> Self {
        self.fallback_url = url;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Run in the background; the receiver gets exactly one result
    pub fn start(self) -> oneshot::Receiver<Result<Bytes, DownloadError>> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(self.run().await);
        });
        rx
    }

    pub async fn run(self) -> Result<Bytes, DownloadError> {
        let expected = self.resolve_expected_hash().await;

        match (&self.peer, &expected) {
            (Some(peer), Some(expected)) => {
                if let Some(content) = self.from_peer(peer, expected).await {
                    return Ok(self.finish(content, expected.clone()).await);
                }
            }
            (Some(peer), None) => debug!(
                "No content hash for {}, not asking {}",
                self.resource_id.short(),
                peer.short()
            ),
            (None, _) => {}
        }

        self.from_fallback(expected).await
    }

    /// Explicit hash, then the cached hash, then the id itself if content-addressed
    async fn resolve_expected_hash(&self) -> Option<String> {
        if let Some(hash) = &self.expected_hash {
            return Some(hash.clone());
        }
        if let Some(cached) = self.registry.cached(&self.resource_id).await {
            return Some(cached.content_hash);
        }
        self.content_addressed
            .then(|| self.resource_id.as_str().to_ascii_lowercase())
    }

    /// One peer attempt; None sends the caller to the fallback
    async fn from_peer(&self, peer: &PeerId, expected: &str) -> Option<Bytes> {
        if !self.registry.is_trusted(peer, &self.resource_id).await {
            debug!(
                "Skipping untrusted peer {} for {}",
                peer.short(),
                self.resource_id.short()
            );
            return None;
        }

        debug!(
            "Fetching {} from peer {}",
            self.resource_id.short(),
            peer.short()
        );
        let (tx, rx) = oneshot::channel();
        self.registry.fetch(peer, &self.resource_id, tx);

        let content = match tokio::time::timeout(self.peer_timeout, rx).await {
            Ok(Ok(content)) => content,
            Ok(Err(_)) => {
                debug!(
                    "Peer {} gave up on {}",
                    peer.short(),
                    self.resource_id.short()
                );
                return None;
            }
            Err(_) => {
                debug!(
                    "Peer {} timed out on {}",
                    peer.short(),
                    self.resource_id.short()
                );
                return None;
            }
        };

        let stats = &self.registry.context().stats;
        match integrity::verify(expected, &content) {
            Ok(_) => {
                stats.record_peer_delivery();
                self.registry
                    .report_upload(peer, &self.resource_id, content.len() as u64);
                info!(
                    "Got {} from peer {} ({} bytes)",
                    self.resource_id.short(),
                    peer.short(),
                    content.len()
                );
                Some(content)
            }
            Err(e) => {
                warn!(
                    "Peer {} sent bad data for {}: {}",
                    peer.short(),
                    self.resource_id.short(),
                    e
                );
                stats.record_integrity_failure();
                self.registry.report_mismatch(peer, &self.resource_id);
                None
            }
        }
    }

    async fn from_fallback(&self, expected: Option<String>) -> Result<Bytes, DownloadError> {
        let url = self
            .fallback_url
            .as_deref()
            .ok_or_else(|| DownloadError::NoFallback(self.resource_id.clone()))?;

        let content = self.fallback.fetch(url).await?;
        let stats = &self.registry.context().stats;
        let content_hash = match expected {
            Some(expected) => integrity::verify(&expected, &content).map_err(|e| {
                warn!(
                    "Fallback for {} failed verification: {}",
                    self.resource_id.short(),
                    e
                );
                stats.record_integrity_failure();
                e
            })?,
            None => integrity::content_hash(&content),
        };

        stats.record_fallback_delivery();
        info!(
            "Got {} from fallback ({} bytes)",
            self.resource_id.short(),
            content.len()
        );
        Ok(self.finish(content, content_hash).await)
    }

    /// Cache, announce and hand back verified content
    async fn finish(&self, content: Bytes, content_hash: String) -> Bytes {
        let (tx, rx) = oneshot::channel();
        self.registry
            .finish_download(&self.resource_id, content.clone(), content_hash, move |bytes| {
                let _ = tx.send(bytes);
            });
        // Registry gone only during shutdown; the caller still gets the bytes
        rx.await.unwrap_or(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webcdn_config::PeerConfig;
    use webcdn_peer::mock::{MockNetwork, MockRelay};
    use webcdn_peer::{NodeContext, RelayKind};

    async fn registry(relay: &std::sync::Arc<MockRelay>, id: &str) -> PeerRegistry {
        let id = PeerId::from(id);
        let (signal, inbound) = relay.join(id.clone()).await;
        let registry = PeerRegistry::new(
            NodeContext::new(id.clone()),
            &PeerConfig::default(),
            signal,
            MockNetwork::new().factory(&id),
        );
        registry.attach(inbound);
        registry
    }

    fn client() -> FallbackClient {
        FallbackClient::new(Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_no_peer_and_no_fallback_url_fails_once() {
        let relay = MockRelay::new();
        let registry = registry(&relay, "node").await;
        let rx = Download::new(registry, client(), ResourceId::from("abcd")).start();

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(DownloadError::NoFallback(_))));
        assert!(relay.sent_of(RelayKind::Relay).await.is_empty());
    }

    #[tokio::test]
    async fn test_expected_hash_prefers_explicit_then_cache() {
        let relay = MockRelay::new();
        let registry = registry(&relay, "node").await;
        let rid = ResourceId::from("ABCD");

        let download = Download::new(registry.clone(), client(), rid.clone());
        assert_eq!(download.resolve_expected_hash().await.as_deref(), Some("abcd"));

        registry.publish(&rid, Bytes::from_static(b"x"), "cafe".to_string());
        let download = Download::new(registry.clone(), client(), rid.clone());
        assert_eq!(download.resolve_expected_hash().await.as_deref(), Some("cafe"));

        let download = Download::new(registry, client(), rid).with_expected_hash(Some("BEEF".into()));
        assert_eq!(download.resolve_expected_hash().await.as_deref(), Some("beef"));
    }

    #[tokio::test]
    async fn test_url_download_has_no_implicit_hash() {
        let relay = MockRelay::new();
        let registry = registry(&relay, "node").await;
        let download = Download::for_url(registry, client(), "https://example.com/a.png");

        assert_eq!(
            download.resource_id(),
            &resource_id_for_url("https://example.com/a.png")
        );
        assert!(download.resolve_expected_hash().await.is_none());
    }
}
