use crate::error::{CastError, Result};
use crate::types::{Change, ConnectionState, DeviceId};
use tokio::sync::mpsc;

/// Sink for lifecycle transitions and cache changes
pub type StateSink = mpsc::UnboundedSender<StateUpdate>;

/// Sink for transport and protocol errors
pub type ErrorSink = mpsc::UnboundedSender<DeviceError>;

/// State update from a device
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    /// Connection moved to a new lifecycle state
    Connection { id: DeviceId, state: ConnectionState },

    /// Cached device state changed after a merge
    Changed { id: DeviceId, change: Change },
}

/// Error raised outside of a caller's request
#[derive(Debug)]
pub struct DeviceError {
    pub id: DeviceId,
    pub error: CastError,
}

/// Receiver for state updates
pub struct StateReceiver {
    rx: mpsc::UnboundedReceiver<StateUpdate>,
}

impl StateReceiver {
    /// Create a sink and the receiver draining it
    pub fn channel() -> (StateSink, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Receive the next state update
    ///
    /// Fails once every device holding the sink has been dropped.
    pub async fn recv(&mut self) -> Result<StateUpdate> {
        self.rx.recv().await.ok_or(CastError::ConnectionClosed)
    }

    /// Try to receive a state update without blocking
    ///
    /// Returns `None` if no update is available.
    pub fn try_recv(&mut self) -> Result<Option<StateUpdate>> {
        match self.rx.try_recv() {
            Ok(update) => Ok(Some(update)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(CastError::ConnectionClosed),
        }
    }
}

/// Receiver for device errors
pub struct ErrorReceiver {
    rx: mpsc::UnboundedReceiver<DeviceError>,
}

impl ErrorReceiver {
    /// Create a sink and the receiver draining it
    pub fn channel() -> (ErrorSink, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Receive the next error
    pub async fn recv(&mut self) -> Result<DeviceError> {
        self.rx.recv().await.ok_or(CastError::ConnectionClosed)
    }

    /// Try to receive an error without blocking
    pub fn try_recv(&mut self) -> Result<Option<DeviceError>> {
        match self.rx.try_recv() {
            Ok(error) => Ok(Some(error)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(CastError::ConnectionClosed),
        }
    }
}
