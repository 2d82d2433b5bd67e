use crate::error::{CastError, Result};
use crate::protocol::{
    CastMessage, ConnectionMessage, HeartbeatMessage, MediaInformation, MediaRequest,
    MediaResponse, PayloadType, ReceiverRequest, ReceiverResponse, ReceiverStatus, Volume,
    BROADCAST_ID, NS_CONNECTION, NS_HEARTBEAT, NS_MEDIA, NS_RECEIVER, RECEIVER_ID,
};
use crate::types::{AppState, MediaState, VolumeState};
use bytes::Bytes;
use prost::Message;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Correlation identifier carried as `requestId`
pub type RequestId = i64;

/// Oldest outstanding requests are forgotten past this many
const MAX_PENDING: usize = 256;

/// What an outbound request asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    GetStatus,
    LaunchApp,
    SetVolume,
    SetMuted,
    ConnectMedia,
    LoadUrl,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Intent::GetStatus => "get-status",
            Intent::LaunchApp => "launch-app",
            Intent::SetVolume => "set-volume",
            Intent::SetMuted => "set-muted",
            Intent::ConnectMedia => "connect-media",
            Intent::LoadUrl => "load-url",
        };
        f.write_str(name)
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ping,
    Pong,

    /// A virtual connection was closed by `source`
    Closed { source: String },

    /// Receiver status; `app` is `None` when nothing is running
    ReceiverStatus {
        request_id: RequestId,
        intent: Option<Intent>,
        volume: Option<VolumeState>,
        app: Option<AppState>,
    },

    /// Media status of the running app; `media` is `None` when there is no session
    MediaStatus {
        request_id: RequestId,
        intent: Option<Intent>,
        media: Option<MediaState>,
    },

    /// Receiver rejected a request
    Failure {
        request_id: RequestId,
        intent: Option<Intent>,
        reason: String,
    },

    /// Frame for a namespace or message type this client does not handle
    Ignored { namespace: String },
}

/// Protocol codec for one sender
///
/// Encoders return the correlation identifier alongside the framed payload and
/// remember the intent so that replies can be attributed when they arrive.
pub struct Channel {
    sender_id: String,
    next_id: AtomicI64,
    pending: Mutex<BTreeMap<RequestId, Intent>>,
}

impl Channel {
    /// Create a channel speaking as `sender_id`
    pub fn new(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            next_id: AtomicI64::new(1),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Get the sender identifier
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Forget all outstanding requests
    pub fn reset(&self) {
        self.pending().clear();
    }

    /// Number of requests awaiting a reply
    pub fn outstanding(&self) -> usize {
        self.pending().len()
    }

    // ========== Platform messages ==========

    /// Open a virtual connection to `destination`
    pub fn connect(&self, destination: &str) -> Result<Bytes> {
        self.frame(destination, NS_CONNECTION, &ConnectionMessage::Connect)
    }

    /// Close the virtual connection to `destination`
    pub fn close(&self, destination: &str) -> Result<Bytes> {
        self.frame(destination, NS_CONNECTION, &ConnectionMessage::Close)
    }

    pub fn ping(&self) -> Result<Bytes> {
        self.frame(RECEIVER_ID, NS_HEARTBEAT, &HeartbeatMessage::Ping)
    }

    pub fn pong(&self) -> Result<Bytes> {
        self.frame(RECEIVER_ID, NS_HEARTBEAT, &HeartbeatMessage::Pong)
    }

    // ========== Requests ==========

    /// Ask the receiver for its status
    pub fn get_status(&self) -> Result<(RequestId, Bytes)> {
        let request_id = self.track(Intent::GetStatus);
        let data = self.frame(RECEIVER_ID, NS_RECEIVER, &ReceiverRequest::GetStatus { request_id })?;
        Ok((request_id, data))
    }

    /// Launch an application by id
    pub fn launch_app(&self, app_id: &str) -> Result<(RequestId, Bytes)> {
        let request_id = self.track(Intent::LaunchApp);
        let request = ReceiverRequest::Launch {
            request_id,
            app_id: app_id.to_string(),
        };
        let data = self.frame(RECEIVER_ID, NS_RECEIVER, &request)?;
        Ok((request_id, data))
    }

    /// Set level and mute together
    pub fn set_volume(&self, volume: VolumeState) -> Result<(RequestId, Bytes)> {
        let request_id = self.track(Intent::SetVolume);
        let request = ReceiverRequest::SetVolume {
            request_id,
            volume: Volume {
                level: Some(volume.level),
                muted: Some(volume.muted),
            },
        };
        let data = self.frame(RECEIVER_ID, NS_RECEIVER, &request)?;
        Ok((request_id, data))
    }

    /// Toggle mute without touching the level
    pub fn set_muted(&self, muted: bool) -> Result<(RequestId, Bytes)> {
        let request_id = self.track(Intent::SetMuted);
        let request = ReceiverRequest::SetVolume {
            request_id,
            volume: Volume {
                level: None,
                muted: Some(muted),
            },
        };
        let data = self.frame(RECEIVER_ID, NS_RECEIVER, &request)?;
        Ok((request_id, data))
    }

    /// Bind to an application's media endpoint
    ///
    /// The receiver never answers a virtual CONNECT, so the identifier is not
    /// tracked.
    pub fn connect_media(&self, transport_id: &str) -> Result<(RequestId, Bytes)> {
        let request_id = self.next_id();
        let data = self.connect(transport_id)?;
        Ok((request_id, data))
    }

    /// Load a URL into the application bound at `transport_id`
    pub fn load_url(
        &self,
        transport_id: &str,
        url: &str,
        mime_type: &str,
        autoplay: bool,
    ) -> Result<(RequestId, Bytes)> {
        let request_id = self.track(Intent::LoadUrl);
        let request = MediaRequest::Load {
            request_id,
            media: MediaInformation {
                content_id: url.to_string(),
                content_type: mime_type.to_string(),
                stream_type: "BUFFERED".to_string(),
            },
            autoplay,
            current_time: 0.0,
        };
        let data = self.frame(transport_id, NS_MEDIA, &request)?;
        Ok((request_id, data))
    }

    // ========== Decoding ==========

    /// Decode one inbound frame
    pub fn decode(&self, frame: &[u8]) -> Result<Inbound> {
        let CastMessage {
            source_id,
            destination_id,
            namespace,
            payload_type,
            payload_utf8,
            ..
        } = CastMessage::decode(frame)?;

        if destination_id != self.sender_id && destination_id != BROADCAST_ID {
            tracing::trace!("Ignoring frame for {}", destination_id);
            return Ok(ignored(&namespace));
        }
        if payload_type != PayloadType::Utf8 as i32 {
            return Ok(ignored(&namespace));
        }

        let payload = payload_utf8
            .ok_or_else(|| CastError::Decode(format!("{}: missing payload", namespace)))?;

        tracing::debug!("Received on {}: {}", namespace, payload);

        match namespace.as_str() {
            NS_HEARTBEAT => match serde_json::from_str(&payload)? {
                HeartbeatMessage::Ping => Ok(Inbound::Ping),
                HeartbeatMessage::Pong => Ok(Inbound::Pong),
            },
            NS_CONNECTION => match serde_json::from_str(&payload)? {
                ConnectionMessage::Close => Ok(Inbound::Closed { source: source_id }),
                ConnectionMessage::Connect => Ok(ignored(&namespace)),
            },
            NS_RECEIVER => Ok(self.decode_receiver(serde_json::from_str(&payload)?)),
            NS_MEDIA => Ok(self.decode_media(serde_json::from_str(&payload)?)),
            _ => Ok(ignored(&namespace)),
        }
    }

    fn decode_receiver(&self, response: ReceiverResponse) -> Inbound {
        match response {
            ReceiverResponse::ReceiverStatus { request_id, status } => {
                let (volume, app) = split_status(status);
                Inbound::ReceiverStatus {
                    request_id,
                    intent: self.complete(request_id),
                    volume,
                    app,
                }
            }
            ReceiverResponse::LaunchError { request_id, reason } => Inbound::Failure {
                request_id,
                intent: self.complete(request_id),
                reason: reason.unwrap_or_else(|| "launch error".to_string()),
            },
            ReceiverResponse::InvalidRequest { request_id, reason } => Inbound::Failure {
                request_id,
                intent: self.complete(request_id),
                reason: reason.unwrap_or_else(|| "invalid request".to_string()),
            },
            ReceiverResponse::Other => ignored(NS_RECEIVER),
        }
    }

    fn decode_media(&self, response: MediaResponse) -> Inbound {
        let failure = |request_id: RequestId, reason: &str| Inbound::Failure {
            request_id,
            intent: self.complete(request_id),
            reason: reason.to_string(),
        };

        match response {
            MediaResponse::MediaStatus { request_id, status } => {
                let media = status.into_iter().next().map(|entry| MediaState {
                    session_id: entry.media_session_id,
                    player_state: entry.player_state,
                    current_time: entry.current_time,
                    content_id: entry.media.map(|m| m.content_id),
                });
                Inbound::MediaStatus {
                    request_id,
                    intent: self.complete(request_id),
                    media,
                }
            }
            MediaResponse::LoadFailed { request_id } => failure(request_id, "load failed"),
            MediaResponse::LoadCancelled { request_id } => failure(request_id, "load cancelled"),
            MediaResponse::InvalidPlayerState { request_id } => {
                failure(request_id, "invalid player state")
            }
            MediaResponse::InvalidRequest { request_id, reason } => {
                failure(request_id, reason.as_deref().unwrap_or("invalid request"))
            }
            MediaResponse::Other => ignored(NS_MEDIA),
        }
    }

    // ========== Helpers ==========

    fn frame<T: Serialize>(&self, destination: &str, namespace: &str, payload: &T) -> Result<Bytes> {
        let json = serde_json::to_string(payload)?;
        tracing::debug!("Encoding for {} on {}: {}", destination, namespace, json);

        let message = CastMessage::text(self.sender_id.as_str(), destination, namespace, json);
        Ok(Bytes::from(message.encode_to_vec()))
    }

    fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn track(&self, intent: Intent) -> RequestId {
        let request_id = self.next_id();
        let mut pending = self.pending();
        if pending.len() >= MAX_PENDING {
            pending.pop_first();
        }
        pending.insert(request_id, intent);
        request_id
    }

    /// Unsolicited messages carry request id 0 and match nothing
    fn complete(&self, request_id: RequestId) -> Option<Intent> {
        if request_id == 0 {
            return None;
        }
        self.pending().remove(&request_id)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, BTreeMap<RequestId, Intent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ignored(namespace: &str) -> Inbound {
    Inbound::Ignored {
        namespace: namespace.to_string(),
    }
}

fn split_status(status: ReceiverStatus) -> (Option<VolumeState>, Option<AppState>) {
    let volume = status.volume.and_then(|v| match (v.level, v.muted) {
        (None, None) => None,
        (level, muted) => Some(VolumeState {
            level: level.unwrap_or(0.0),
            muted: muted.unwrap_or(false),
        }),
    });

    let app = status.applications.into_iter().next().map(|a| AppState {
        app_id: a.app_id,
        display_name: a.display_name,
        transport_id: a.transport_id,
        status_text: a.status_text,
        session_id: a.session_id,
    });

    (volume, app)
}
