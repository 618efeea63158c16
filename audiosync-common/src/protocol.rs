//! Wire protocol between coordinator and receivers
//!
//! Messages are JSON objects internally tagged by a snake_case `"type"` field.
//! Inbound text is decoded once at the connection boundary into one of the closed
//! enums below; anything that does not fit is classified as [`ProtocolError`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::chunk::{AudioFormat, Chunk};
use crate::device::{Device, DeviceInfo};

/// Decode/encode failures at the message boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Payload is not valid JSON or does not match the tagged shape
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Well-formed message with a `type` this side does not understand
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Outbound message could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Receiver → Coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Sent once upon connecting
    DeviceInfo(DeviceInfo),

    /// Request to begin a stream
    StartStreaming {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_file: Option<String>,
    },

    /// Request to end the current stream
    StopStreaming,

    /// Receipt acknowledgement; `timestamp` is the receiver's local clock
    AudioChunkAck { chunk_id: u64, timestamp: f64 },

    /// Request a fresh latency probe
    SyncRequest,
}

impl ClientMessage {
    pub const KINDS: &'static [&'static str] = &[
        "device_info",
        "start_streaming",
        "stop_streaming",
        "audio_chunk_ack",
        "sync_request",
    ];

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        decode_tagged(raw, Self::KINDS)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::DeviceInfo(_) => "device_info",
            ClientMessage::StartStreaming { .. } => "start_streaming",
            ClientMessage::StopStreaming => "stop_streaming",
            ClientMessage::AudioChunkAck { .. } => "audio_chunk_ack",
            ClientMessage::SyncRequest => "sync_request",
        }
    }
}

/// Coordinator → Receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Assigns a session identity
    Connection { client_id: String, message: String },

    /// Current roster snapshot
    DeviceList { devices: Vec<Device> },

    /// Announces the common sync instant and stream format
    PrepareStreaming {
        sync_timestamp: f64,
        /// Coordinator clock when the message was produced
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_timestamp: Option<f64>,
        sample_rate: u32,
        channels: u16,
        audio_file: String,
    },

    /// One streamed unit
    AudioChunk {
        chunk_id: u64,
        timestamp: f64,
        data: Vec<f32>,
        is_final: bool,
    },

    /// Stream ended
    StopStreaming,

    /// Latency-probe reply
    SyncResponse {
        server_timestamp: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
}

impl ServerMessage {
    pub const KINDS: &'static [&'static str] = &[
        "connection",
        "device_list",
        "prepare_streaming",
        "audio_chunk",
        "stop_streaming",
        "sync_response",
    ];

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        decode_tagged(raw, Self::KINDS)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connection { .. } => "connection",
            ServerMessage::DeviceList { .. } => "device_list",
            ServerMessage::PrepareStreaming { .. } => "prepare_streaming",
            ServerMessage::AudioChunk { .. } => "audio_chunk",
            ServerMessage::StopStreaming => "stop_streaming",
            ServerMessage::SyncResponse { .. } => "sync_response",
        }
    }

    /// Build an `audio_chunk` message from a chunk
    pub fn from_chunk(chunk: &Chunk) -> Self {
        ServerMessage::AudioChunk {
            chunk_id: chunk.sequence_id(),
            timestamp: chunk.target_timestamp(),
            data: chunk.payload().to_vec(),
            is_final: chunk.is_final(),
        }
    }

    /// Format carried by a `prepare_streaming` message
    pub fn stream_format(&self) -> Option<AudioFormat> {
        match self {
            ServerMessage::PrepareStreaming {
                sample_rate,
                channels,
                ..
            } => Some(AudioFormat::new(*sample_rate, *channels)),
            _ => None,
        }
    }
}

fn decode_tagged<T: DeserializeOwned>(raw: &str, kinds: &[&str]) -> Result<T, ProtocolError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing \"type\" field".to_string()))?;

    if !kinds.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_audio_chunk() {
        let raw = json!({
            "type": "audio_chunk",
            "chunk_id": 7,
            "timestamp": 102.0,
            "data": [0.5, -0.5],
            "is_final": false
        })
        .to_string();

        let msg = ServerMessage::decode(&raw).unwrap();
        assert_eq!(
            msg,
            ServerMessage::AudioChunk {
                chunk_id: 7,
                timestamp: 102.0,
                data: vec![0.5, -0.5],
                is_final: false,
            }
        );
    }

    #[test]
    fn test_decode_prepare_without_server_timestamp() {
        let raw = r#"{"type":"prepare_streaming","sync_timestamp":5.0,"sample_rate":48000,"channels":1,"audio_file":"a.wav"}"#;
        let msg = ServerMessage::decode(raw).unwrap();
        assert_eq!(msg.stream_format(), Some(AudioFormat::new(48_000, 1)));
        match msg {
            ServerMessage::PrepareStreaming {
                server_timestamp, ..
            } => assert!(server_timestamp.is_none()),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unit_variants_use_bare_tag() {
        assert_eq!(
            ServerMessage::StopStreaming.encode().unwrap(),
            r#"{"type":"stop_streaming"}"#
        );
        assert_eq!(
            ClientMessage::SyncRequest.encode().unwrap(),
            r#"{"type":"sync_request"}"#
        );
        assert_eq!(
            ClientMessage::decode(r#"{"type":"stop_streaming"}"#).unwrap(),
            ClientMessage::StopStreaming
        );
    }

    #[test]
    fn test_device_info_is_flattened_into_tagged_object() {
        let msg = ClientMessage::DeviceInfo(DeviceInfo {
            name: "Den".to_string(),
            platform: "linux".to_string(),
            capabilities: vec!["stereo".to_string()],
            latency: 0.02,
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "device_info");
        assert_eq!(value["name"], "Den");
        assert_eq!(value["capabilities"][0], "stereo");
    }

    #[test]
    fn test_unknown_type_is_classified() {
        let err = ClientMessage::decode(r#"{"type":"volume_up"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("volume_up".to_string()));
    }

    #[test]
    fn test_malformed_payloads_are_classified() {
        assert!(matches!(
            ClientMessage::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::decode(r#"{"chunk_id":1}"#),
            Err(ProtocolError::Malformed(_))
        ));
        // Known type, wrong field types
        assert!(matches!(
            ClientMessage::decode(r#"{"type":"audio_chunk_ack","chunk_id":"x","timestamp":1.0}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_from_chunk_carries_all_fields() {
        let chunk = Chunk::new(9, 3.5, vec![0.1, 0.2], true);
        match ServerMessage::from_chunk(&chunk) {
            ServerMessage::AudioChunk {
                chunk_id,
                timestamp,
                data,
                is_final,
            } => {
                assert_eq!(chunk_id, 9);
                assert_eq!(timestamp, 3.5);
                assert_eq!(data, vec![0.1, 0.2]);
                assert!(is_final);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
