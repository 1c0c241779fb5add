//! WebCdn client
//!
//! Wires the coordinator messenger, the peer registry and the fallback client
//! into one node.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webcdn_config::Config;
use webcdn_peer::{
    ConnectionFactory, NodeContext, PeerId, PeerRegistry, ResourceId, RtcConnectionFactory,
    StatsSnapshot,
};

use crate::download::{Download, DownloadError};
use crate::fallback::FallbackClient;
use crate::integrity::{content_hash, resource_id_for_url};
use crate::messenger::Messenger;

/// What to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadRequest {
    /// Known only by its fallback URL; always served by the fallback
    Url(String),
    /// Known by content hash, so peers can serve it
    Content {
        hash: String,
        fallback_url: Option<String>,
    },
}

impl LoadRequest {
    pub fn url(url: impl Into<String>) -> Self {
        LoadRequest::Url(url.into())
    }

    pub fn content(hash: impl Into<String>, fallback_url: Option<String>) -> Self {
        LoadRequest::Content {
            hash: hash.into(),
            fallback_url,
        }
    }

    pub fn resource_id(&self) -> ResourceId {
        match self {
            LoadRequest::Url(url) => resource_id_for_url(url),
            LoadRequest::Content { hash, .. } => ResourceId::new(hash.to_ascii_lowercase()),
        }
    }
}

/// A node connected to a coordinator
pub struct WebCdn {
    config: Config,
    registry: PeerRegistry,
    messenger: Arc<Messenger>,
    fallback: FallbackClient,
    relay_task: JoinHandle<()>,
}

impl WebCdn {
    /// Connect with WebRTC transport
    pub async fn connect(config: Config) -> Result<Self> {
        let factory = Arc::new(RtcConnectionFactory::new(config.peer.stun_servers.clone()));
        Self::connect_with_factory(config, factory).await
    }

    pub async fn connect_with_factory(
        config: Config,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        let proposed = NodeContext::generate().local_id;
        let (messenger, inbound) = Messenger::connect(
            &config.coordinator.url,
            &proposed,
            config.coordinator.lookup_timeout(),
        )
        .await
        .with_context(|| format!("Failed to connect to coordinator {}", config.coordinator.url))?;

        let fallback =
            FallbackClient::from_config(&config.download).context("Failed to build HTTP client")?;

        let ctx = NodeContext::new(messenger.local_id().clone());
        let registry = PeerRegistry::new(ctx, &config.peer, messenger.clone(), factory);
        let relay_task = registry.attach(inbound);

        info!("WebCdn node {} ready", registry.local_id().short());
        Ok(Self {
            config,
            registry,
            messenger,
            fallback,
            relay_task,
        })
    }

    pub fn local_id(&self) -> &PeerId {
        self.registry.local_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Resolve one resource: cache, then a peer the coordinator names, then the fallback
    pub async fn load(&self, request: LoadRequest) -> Result<Bytes, DownloadError> {
        let resource_id = request.resource_id();
        if let Some(cached) = self.registry.cached(&resource_id).await {
            debug!("Serving {} from cache", resource_id.short());
            return Ok(cached.content);
        }

        let download = match request {
            LoadRequest::Url(url) => {
                Download::for_url(self.registry.clone(), self.fallback.clone(), &url)
            }
            LoadRequest::Content { hash, fallback_url } => {
                let peer = self.lookup(&resource_id).await;
                Download::new(self.registry.clone(), self.fallback.clone(), resource_id)
                    .with_expected_hash(Some(hash))
                    .with_fallback_url(fallback_url)
                    .with_peer(peer)
            }
        };

        download
            .with_peer_timeout(self.config.download.peer_timeout())
            .run()
            .await
    }

    async fn lookup(&self, resource_id: &ResourceId) -> Option<PeerId> {
        match self.messenger.lookup(resource_id).await {
            Ok(response) => {
                let peer = response.peer.filter(|peer| peer != self.local_id());
                debug!(
                    "Lookup {}: {}",
                    resource_id.short(),
                    peer.as_ref().map(|p| p.short()).unwrap_or_else(|| "no peer".to_string())
                );
                peer
            }
            Err(e) => {
                warn!("Lookup of {} failed: {}", resource_id.short(), e);
                None
            }
        }
    }

    /// Seed local content; returns its resource id
    pub fn publish(&self, content: Bytes) -> ResourceId {
        let hash = content_hash(&content);
        let resource_id = ResourceId::new(hash.clone());
        self.registry.publish(&resource_id, content, hash);
        resource_id
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.registry.context().stats.snapshot()
    }

    /// Say bye to peers and leave the coordinator
    pub async fn shutdown(self) {
        self.registry.shutdown().await;
        self.messenger.disconnect().await;
        self.relay_task.abort();
        info!("WebCdn node {} stopped", self.registry.local_id().short());
    }
}
