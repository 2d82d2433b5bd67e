use crate::channel::{Intent, RequestId};
use thiserror::Error;
use tokio_native_tls::native_tls;

/// Result type for Cast operations
pub type Result<T> = std::result::Result<T, CastError>;

/// Errors that can occur when talking to a Cast receiver
#[derive(Error, Debug)]
pub enum CastError {
    /// Device record is missing a required field
    #[error("Invalid device record: {0}")]
    InvalidRecord(String),

    /// No usable address for the device
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not valid for the current connection or app state
    #[error("Out of order: {0}")]
    OutOfOrder(String),

    /// I/O error on the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or configuration error
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Deadline elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection is not established or was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Inbound frame could not be interpreted
    #[error("Decode error: {0}")]
    Decode(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope could not be decoded
    #[error("Protobuf error: {0}")]
    Protobuf(#[from] prost::DecodeError),

    /// Receiver answered a request with a failure
    #[error("Receiver rejected request {request_id}: {reason}")]
    Receiver {
        request_id: RequestId,
        /// Intent of the request, if it was still tracked
        intent: Option<Intent>,
        reason: String,
    },

    /// Background task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(String),

    /// Several errors collected while tearing down
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<CastError>),
}

impl CastError {
    /// True for failures of the underlying connection
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CastError::Io(_) | CastError::Tls(_) | CastError::Timeout(_) | CastError::ConnectionClosed
        )
    }

    /// True for malformed inbound frames
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            CastError::Decode(_) | CastError::Json(_) | CastError::Protobuf(_)
        )
    }

    /// Fold teardown errors into a single result
    pub(crate) fn combine(mut errors: Vec<CastError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CastError::Aggregate(errors)),
        }
    }
}

fn join_errors(errors: &[CastError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
