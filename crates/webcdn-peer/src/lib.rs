//! Peer-to-peer content transfer for webcdn
//!
//! One [`Peer`] state machine per remote node negotiates a connection through
//! the coordinator relay and streams resources over an ordered data channel.
//! [`PeerRegistry`] owns the peer directory and the content caches.
//!
//! # Overview
//!
//! - **Signaling**: offers, answers and candidates travel as `relay` envelopes
//! - **Transfer**: `[type byte][msgpack]` frames, 25 KiB chunks, end sentinel
//! - **Backpressure**: senders pause while the channel buffers 5 chunks or more
//!
//! Transports are trait objects ([`ConnectionFactory`], [`SignalChannel`]) so
//! the same state machines run over webrtc-rs or the in-memory [`mock`] network.

pub mod context;
pub mod mock;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod rtc;
pub mod transport;
pub mod types;

pub use context::{NodeContext, StatsSnapshot, TransferStats};
pub use peer::{PeerCommand, PeerError, PeerEvent, PeerEventKind, PeerHandle};
pub use protocol::{ProtocolError, TransferMessage, MSG_TYPE_CHUNK, MSG_TYPE_END, MSG_TYPE_FETCH};
pub use registry::{CachedResource, PeerRegistry};
pub use rtc::RtcConnectionFactory;
pub use transport::{
    ChannelState, ConnectionEvent, ConnectionFactory, PeerConnection, SdpKind, SignalChannel,
    TransferChannel, TransportError,
};
pub use types::{
    IceCandidate, PeerId, PeerState, RelayEnvelope, RelayKind, ResourceId, ResourceUpdate,
    SignalingPayload, TransferSettings, UploadReport, DATA_CHANNEL_LABEL,
};
