//! Framed wire protocol: newline-delimited JSON messages over a TCP stream.
//!
//! `Message` is the outer envelope every peer exchange uses. `Payload` is a
//! tagged union over the exact set of recognized message types; decoding an
//! unrecognized `type` is a protocol error rather than an opaque pass-through
//! map (see DESIGN.md's note on dynamic message payloads).

use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::event_bus::ConflictInfo;
use crate::hash::Hash;
use crate::mesh::{MeshMessage, TopologySnapshot};
use crate::model::Seal;
use crate::sync::messages::{SyncRequest, SyncResponse};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
    #[error("message of {0} bytes exceeds the {1}-byte limit")]
    TooLarge(usize, usize),
}

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub node_id: String,
    pub listen_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerDiscoveryPayload {
    pub peers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimelineUpdatePayload {
    pub timeline: String,
    pub new_head: Hash,
    pub seal: Option<Seal>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealBroadcastPayload {
    pub timeline: String,
    pub seal: Seal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: DateTime<Utc>,
}

/// The full set of recognized wire message kinds. One variant per type,
/// matching exactly the payload it carries.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Handshake(HandshakePayload),
    PeerDiscovery(PeerDiscoveryPayload),
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
    TimelineUpdate(TimelineUpdatePayload),
    SealBroadcast(SealBroadcastPayload),
    Heartbeat(HeartbeatPayload),
    ConflictResolve(ConflictInfo),
    MeshTopology(TopologySnapshot),
    MeshTopologyRequest(MeshMessage),
}

/// The envelope every message travels in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
    pub id: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    pub fn new(from: String, to: String, payload: Payload) -> Self {
        Self {
            from,
            to,
            timestamp: Utc::now(),
            id: generate_message_id(),
            payload,
        }
    }
}

/// 8 random bytes, hex-encoded, per the wire-format section.
pub fn generate_message_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

/// 16 random bytes, hex-encoded.
pub fn generate_node_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// Read half of a peer connection: one newline-delimited JSON message at a
/// time, with a hard ceiling on message size.
pub struct MessageReader {
    reader: BufReader<OwnedReadHalf>,
    max_message_size: usize,
}

impl MessageReader {
    pub fn new(read_half: OwnedReadHalf, max_message_size: usize) -> Self {
        Self {
            reader: BufReader::new(read_half),
            max_message_size,
        }
    }

    /// Reads the next message, or `Ok(None)` on a clean EOF.
    pub async fn read_message(&mut self) -> CodecResult<Option<(Message, usize)>> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(None);
        }
        if bytes_read > self.max_message_size {
            return Err(CodecError::TooLarge(bytes_read, self.max_message_size));
        }
        let message: Message = serde_json::from_str(line.trim_end())?;
        Ok(Some((message, bytes_read)))
    }
}

/// Write half of a peer connection. Callers serialize one message at a time;
/// [`crate::p2p::peer::Peer`] is what actually serializes writer access
/// across tasks, this type just owns the socket half.
pub struct MessageWriter {
    writer: OwnedWriteHalf,
}

impl MessageWriter {
    pub fn new(write_half: OwnedWriteHalf) -> Self {
        Self { writer: write_half }
    }

    /// Returns the exact number of bytes written, for `bytes_sent` counters.
    pub async fn write_message(&mut self, message: &Message) -> CodecResult<usize> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(line.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips_through_json() {
        let msg = Message::new(
            "node-a".into(),
            "node-b".into(),
            Payload::Handshake(HandshakePayload {
                node_id: "node-a".into(),
                listen_port: 9090,
            }),
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"handshake\""));
        let decoded: Message = serde_json::from_str(&json).unwrap();
        match decoded.payload {
            Payload::Handshake(h) => assert_eq!(h.listen_port, 9090),
            _ => panic!("expected handshake payload"),
        }
    }

    #[test]
    fn unrecognized_type_fails_to_decode() {
        let json = r#"{"from":"a","to":"b","timestamp":"2024-01-01T00:00:00Z","id":"x","type":"not_a_real_type","data":{}}"#;
        let result: Result<Message, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn message_id_is_16_hex_chars() {
        let id = generate_message_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn node_id_is_32_hex_chars() {
        let id = generate_node_id();
        assert_eq!(id.len(), 32);
    }
}
