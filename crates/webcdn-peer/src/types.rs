//! Identifiers, relay envelopes and signaling payloads
//!
//! Everything that crosses the coordinator websocket is JSON; the shapes here
//! match what browser nodes put on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use webcdn_config::PeerConfig;

/// Data channel label
pub const DATA_CHANNEL_LABEL: &str = "webcdn";

/// Session-scoped identifier of a node, assigned by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }

    /// The polite side of an offer collision drops its own offer.
    /// Lower id is polite.
    pub fn is_polite_towards(&self, remote: &PeerId) -> bool {
        self.0 < remote.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Content hash (lowercase hex) identifying a resource's bytes
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> String {
        self.0.chars().take(12).collect()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Envelope types understood by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayKind {
    #[serde(rename = "lookup")]
    Lookup,
    #[serde(rename = "lookup-response")]
    LookupResponse,
    #[serde(rename = "relay")]
    Relay,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "upload_ratio")]
    UploadRatio,
    #[serde(rename = "geolocation")]
    Geolocation,
    #[serde(rename = "host:add")]
    HostAdd,
    #[serde(rename = "host:remove")]
    HostRemove,
}

impl RelayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayKind::Lookup => "lookup",
            RelayKind::LookupResponse => "lookup-response",
            RelayKind::Relay => "relay",
            RelayKind::Update => "update",
            RelayKind::UploadRatio => "upload_ratio",
            RelayKind::Geolocation => "geolocation",
            RelayKind::HostAdd => "host:add",
            RelayKind::HostRemove => "host:remove",
        }
    }
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message forwarded verbatim by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "type")]
    pub kind: RelayKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RelayEnvelope {
    pub fn new(kind: RelayKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            from: None,
            to: None,
            data,
        }
    }

    pub fn from_peer(mut self, from: PeerId) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to_peer(mut self, to: PeerId) -> Self {
        self.to = Some(to);
        self
    }

    /// A `relay` envelope carrying a signaling payload
    pub fn signaling(from: PeerId, to: PeerId, payload: &SignalingPayload) -> serde_json::Result<Self> {
        Ok(Self::new(RelayKind::Relay, serde_json::to_value(payload)?)
            .from_peer(from)
            .to_peer(to))
    }
}

/// Network path candidate, in the browser's relay shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    /// Media stream id (`sdpMid`)
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index (`sdpMLineIndex`)
    #[serde(rename = "label", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Negotiation sub-message carried inside `relay` envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
    Bye,
}

impl SignalingPayload {
    pub fn name(&self) -> &'static str {
        match self {
            SignalingPayload::Offer { .. } => "offer",
            SignalingPayload::Answer { .. } => "answer",
            SignalingPayload::Candidate(_) => "candidate",
            SignalingPayload::Bye => "bye",
        }
    }
}

/// Entry of an `update` notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUpdate {
    pub hash: ResourceId,
    pub size: u64,
}

/// Body of an `upload_ratio` report: `from` uploaded `size` bytes of `hash` to `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReport {
    pub from: PeerId,
    pub to: PeerId,
    pub hash: ResourceId,
    pub size: u64,
}

/// Lifecycle of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Created, nothing negotiated yet
    New,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Transfer channel open and idle
    Connected,
    /// Streaming in or out
    Transferring,
    Closed,
    Failed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, PeerState::Connected | PeerState::Transferring)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::Negotiating => "negotiating",
            PeerState::Connected => "connected",
            PeerState::Transferring => "transferring",
            PeerState::Closed => "closed",
            PeerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Chunking and backpressure parameters of the sender
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    /// Sending pauses while the channel buffers this many bytes or more
    pub buffer_threshold: usize,
    pub backpressure_delay: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&PeerConfig::default())
    }
}

impl From<&PeerConfig> for TransferSettings {
    fn from(config: &PeerConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            buffer_threshold: config.buffer_threshold(),
            backpressure_delay: config.backpressure_delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let payload = SignalingPayload::Candidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".to_string(),
            sdp_mid: Some("data".to_string()),
            sdp_m_line_index: Some(0),
        });
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "candidate");
        assert_eq!(value["id"], "data");
        assert_eq!(value["label"], 0);
        assert!(value["candidate"].as_str().unwrap().starts_with("candidate:1"));
    }

    #[test]
    fn test_parse_browser_offer() {
        let value = json!({"type": "offer", "sdp": "v=0\r\n"});
        let payload: SignalingPayload = serde_json::from_value(value).unwrap();
        assert_eq!(payload, SignalingPayload::Offer { sdp: "v=0\r\n".to_string() });
    }

    #[test]
    fn test_relay_envelope_shape() {
        let env = RelayEnvelope::signaling(
            PeerId::from("alice"),
            PeerId::from("bob"),
            &SignalingPayload::Bye,
        )
        .unwrap();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({"type": "relay", "from": "alice", "to": "bob", "data": {"type": "bye"}}));
    }

    #[test]
    fn test_relay_kind_wire_names() {
        for kind in [
            RelayKind::Lookup,
            RelayKind::LookupResponse,
            RelayKind::Relay,
            RelayKind::Update,
            RelayKind::UploadRatio,
            RelayKind::Geolocation,
            RelayKind::HostAdd,
            RelayKind::HostRemove,
        ] {
            let value = serde_json::to_value(kind).unwrap();
            assert_eq!(value, json!(kind.as_str()));
        }
    }

    #[test]
    fn test_envelope_without_data() {
        let env: RelayEnvelope = serde_json::from_str(r#"{"type":"host:add"}"#).unwrap();
        assert_eq!(env.kind, RelayKind::HostAdd);
        assert!(env.data.is_null());
        assert!(env.from.is_none());
    }

    #[test]
    fn test_polite_peer_is_lower_id() {
        let a = PeerId::from("aaaa");
        let b = PeerId::from("bbbb");
        assert!(a.is_polite_towards(&b));
        assert!(!b.is_polite_towards(&a));
    }

    #[test]
    fn test_transfer_settings_from_config() {
        let settings = TransferSettings::default();
        assert_eq!(settings.chunk_size, 25 * 1024);
        assert_eq!(settings.buffer_threshold, 5 * 25 * 1024);
        assert_eq!(settings.backpressure_delay, Duration::from_millis(250));
    }
}
