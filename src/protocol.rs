//! Wire structures: the protobuf envelope and the JSON payloads carried in it.

use crate::types::PlayerState;
use serde::{Deserialize, Serialize};

pub const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
pub const NS_MEDIA: &str = "urn:x-cast:com.google.cast.media";

/// Platform receiver endpoint
pub const RECEIVER_ID: &str = "receiver-0";

/// Destination used by the receiver for broadcasts
pub const BROADCAST_ID: &str = "*";

/// Envelope framed on the socket
#[derive(Clone, PartialEq, prost::Message)]
pub struct CastMessage {
    #[prost(enumeration = "ProtocolVersion", required, tag = "1")]
    pub protocol_version: i32,
    #[prost(string, required, tag = "2")]
    pub source_id: String,
    #[prost(string, required, tag = "3")]
    pub destination_id: String,
    #[prost(string, required, tag = "4")]
    pub namespace: String,
    #[prost(enumeration = "PayloadType", required, tag = "5")]
    pub payload_type: i32,
    #[prost(string, optional, tag = "6")]
    pub payload_utf8: Option<String>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub payload_binary: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolVersion {
    Castv210 = 0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PayloadType {
    Utf8 = 0,
    Binary = 1,
}

impl CastMessage {
    /// Create a text message
    pub fn text(
        source: impl Into<String>,
        destination: impl Into<String>,
        namespace: impl Into<String>,
        payload: String,
    ) -> Self {
        Self {
            protocol_version: ProtocolVersion::Castv210 as i32,
            source_id: source.into(),
            destination_id: destination.into(),
            namespace: namespace.into(),
            payload_type: PayloadType::Utf8 as i32,
            payload_utf8: Some(payload),
            payload_binary: None,
        }
    }
}

/// Virtual connection messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionMessage {
    Connect,
    Close,
}

/// Keep-alive messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartbeatMessage {
    Ping,
    Pong,
}

/// Requests on the receiver namespace
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiverRequest {
    #[serde(rename_all = "camelCase")]
    GetStatus { request_id: i64 },
    #[serde(rename_all = "camelCase")]
    Launch { request_id: i64, app_id: String },
    #[serde(rename_all = "camelCase")]
    SetVolume { request_id: i64, volume: Volume },
}

/// Replies and notifications on the receiver namespace
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiverResponse {
    #[serde(rename_all = "camelCase")]
    ReceiverStatus {
        #[serde(default)]
        request_id: i64,
        status: ReceiverStatus,
    },
    #[serde(rename_all = "camelCase")]
    LaunchError {
        #[serde(default)]
        request_id: i64,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    InvalidRequest {
        #[serde(default)]
        request_id: i64,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatus {
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    pub volume: Option<Volume>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub app_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub transport_id: String,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
}

/// Requests on the media namespace
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaRequest {
    #[serde(rename_all = "camelCase")]
    Load {
        request_id: i64,
        media: MediaInformation,
        autoplay: bool,
        current_time: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInformation {
    pub content_id: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default = "default_stream_type")]
    pub stream_type: String,
}

fn default_stream_type() -> String {
    "BUFFERED".to_string()
}

/// Replies and notifications on the media namespace
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaResponse {
    #[serde(rename_all = "camelCase")]
    MediaStatus {
        #[serde(default)]
        request_id: i64,
        #[serde(default)]
        status: Vec<MediaStatus>,
    },
    #[serde(rename_all = "camelCase")]
    LoadFailed {
        #[serde(default)]
        request_id: i64,
    },
    #[serde(rename_all = "camelCase")]
    LoadCancelled {
        #[serde(default)]
        request_id: i64,
    },
    #[serde(rename_all = "camelCase")]
    InvalidPlayerState {
        #[serde(default)]
        request_id: i64,
    },
    #[serde(rename_all = "camelCase")]
    InvalidRequest {
        #[serde(default)]
        request_id: i64,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatus {
    pub media_session_id: i64,
    #[serde(default)]
    pub player_state: PlayerState,
    #[serde(default)]
    pub current_time: f64,
    #[serde(default)]
    pub media: Option<MediaInformation>,
}
