//! Rust library for controlling Google Cast media receivers
//!
//! This library keeps a persistent TLS connection to a single Cast receiver and
//! provides an async API for controlling it. It supports:
//!
//! - Launching applications by id
//! - Volume and mute control
//! - Loading media by URL into the running application
//! - A cache of the receiver's volume, application and media session, kept
//!   current by a background dispatch loop
//! - Error and lifecycle sinks for an external supervisor
//!
//! Discovery is not part of this crate: build a [`DeviceRecord`] from whatever
//! mDNS browser you use, for example with [`DeviceRecord::from_txt`].
//!
//! # Quick Start
//!
//! ```no_run
//! use googlecast::{Device, DeviceRecord, ErrorReceiver, StateReceiver};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let record = DeviceRecord::from_txt(
//!         vec!["192.168.1.50".parse()?],
//!         8009,
//!         &["id=4c3f9a8e", "fn=Living Room", "md=Chromecast"],
//!     );
//!     let device = Device::new(record)?;
//!
//!     let (states, mut state_rx) = StateReceiver::channel();
//!     let (errors, _error_rx) = ErrorReceiver::channel();
//!     device.connect_with_timeout(Duration::from_secs(2), errors, states).await?;
//!
//!     // Populate the cache, then wait for it to change
//!     device.update_status().await?;
//!     let update = state_rx.recv().await?;
//!     println!("{:?}: {}", update, device);
//!
//!     device.launch_app("CC1AD845").await?;
//!     device.set_volume_level(0.3).await?;
//!
//!     device.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Device**: State cache and request API for one receiver
//! - **Connection**: Transport lifecycle, writer task and dispatch loop
//! - **Channel**: Encoding of requests and decoding of inbound frames
//! - **Protocol**: Protobuf envelope and JSON message structures
//! - **Types**: Domain types and data structures

mod channel;
mod config;
mod connection;
mod device;
mod error;
pub mod protocol;
mod subscription;
mod types;

// Public exports
pub use channel::{Channel, Inbound, Intent, RequestId};
pub use config::{AddressPolicy, CastConfig, DEFAULT_PORT};
pub use device::Device;
pub use error::{CastError, Result};
pub use subscription::{
    DeviceError, ErrorReceiver, ErrorSink, StateReceiver, StateSink, StateUpdate,
};
pub use types::{
    AppState, Change, ConnectionState, DeviceId, DeviceRecord, MediaState, PlayerState,
    VolumeState,
};
