//! Wire protocol for the transfer channel
//!
//! Every frame is a type byte followed by a MessagePack map:
//! - Fetch:  [0x00][msgpack: {h: hash}]
//! - Chunk:  [0x01][msgpack: {h: hash, d: bin}]
//! - End:    [0x02][msgpack: {h: hash}]
//!
//! Chunks of one resource arrive in order on a single channel; the end frame
//! closes the stream for that hash.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ResourceId;

/// Message type bytes (prefix before MessagePack body)
pub const MSG_TYPE_FETCH: u8 = 0x00;
pub const MSG_TYPE_CHUNK: u8 = 0x01;
pub const MSG_TYPE_END: u8 = 0x02;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,
    #[error("Unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("Encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

#[derive(Serialize, Deserialize)]
struct HashBody {
    h: String,
}

#[derive(Serialize)]
struct ChunkBodyRef<'a> {
    h: &'a str,
    #[serde(with = "serde_bytes")]
    d: &'a [u8],
}

#[derive(Deserialize)]
struct ChunkBody {
    h: String,
    #[serde(with = "serde_bytes")]
    d: Vec<u8>,
}

/// A decoded transfer-channel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMessage {
    /// Ask the holder to stream a resource
    FetchRequest { resource_id: ResourceId },
    /// One chunk of a resource
    FetchChunk { resource_id: ResourceId, data: Bytes },
    /// End of stream for a resource
    FetchEnd { resource_id: ResourceId },
}

impl TransferMessage {
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            TransferMessage::FetchRequest { resource_id }
            | TransferMessage::FetchChunk { resource_id, .. }
            | TransferMessage::FetchEnd { resource_id } => resource_id,
        }
    }

    /// Encode to wire format
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let (msg_type, body) = match self {
            TransferMessage::FetchRequest { resource_id } => (
                MSG_TYPE_FETCH,
                rmp_serde::to_vec_named(&HashBody {
                    h: resource_id.to_string(),
                })?,
            ),
            TransferMessage::FetchChunk { resource_id, data } => (
                MSG_TYPE_CHUNK,
                rmp_serde::to_vec_named(&ChunkBodyRef {
                    h: resource_id.as_str(),
                    d: data,
                })?,
            ),
            TransferMessage::FetchEnd { resource_id } => (
                MSG_TYPE_END,
                rmp_serde::to_vec_named(&HashBody {
                    h: resource_id.to_string(),
                })?,
            ),
        };

        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(msg_type);
        frame.extend(body);
        Ok(Bytes::from(frame))
    }

    /// Parse a wire format frame
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&msg_type, body) = frame.split_first().ok_or(ProtocolError::Empty)?;

        match msg_type {
            MSG_TYPE_FETCH => {
                let body: HashBody = rmp_serde::from_slice(body)?;
                Ok(TransferMessage::FetchRequest {
                    resource_id: ResourceId::new(body.h),
                })
            }
            MSG_TYPE_CHUNK => {
                let body: ChunkBody = rmp_serde::from_slice(body)?;
                Ok(TransferMessage::FetchChunk {
                    resource_id: ResourceId::new(body.h),
                    data: Bytes::from(body.d),
                })
            }
            MSG_TYPE_END => {
                let body: HashBody = rmp_serde::from_slice(body)?;
                Ok(TransferMessage::FetchEnd {
                    resource_id: ResourceId::new(body.h),
                })
            }
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}
