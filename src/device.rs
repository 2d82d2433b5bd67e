use crate::channel::{Channel, RequestId};
use crate::config::{AddressPolicy, CastConfig};
use crate::connection::{Connection, StatusTarget};
use crate::error::{CastError, Result};
use crate::subscription::{ErrorSink, StateSink, StateUpdate};
use crate::types::{
    AppState, Change, ConnectionState, DeviceId, DeviceRecord, MediaState, VolumeState,
};
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Mutex;

/// A Google Cast receiver
///
/// `Device` caches the receiver's volume, running application and media
/// session. Control requests are fire-and-forget: their effect becomes visible
/// once the receiver's reply has been merged by the background dispatch loop,
/// or as an error on the error sink passed to [`Device::connect_with_timeout`].
///
/// # Example
///
/// ```no_run
/// use googlecast::{Device, DeviceRecord, ErrorReceiver, StateReceiver};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let record = DeviceRecord {
///         id: "abc123".into(),
///         addresses: vec!["192.168.1.50".parse()?],
///         port: 8009,
///         ..Default::default()
///     };
///     let device = Device::new(record)?;
///
///     let (states, _state_rx) = StateReceiver::channel();
///     let (errors, _error_rx) = ErrorReceiver::channel();
///     device.connect_with_timeout(Duration::from_secs(2), errors, states).await?;
///     device.set_volume_level(0.25).await?;
///     device.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct Device {
    id: DeviceId,
    name: String,
    model: String,
    status_text: String,
    status_flag: u32,
    addresses: Vec<IpAddr>,
    port: u16,
    config: CastConfig,
    channel: Arc<Channel>,
    shared: Arc<Shared>,
    connection: Mutex<Connection>,
}

/// State shared with the dispatch loop
struct Shared {
    cache: RwLock<Cache>,
}

#[derive(Default)]
struct Cache {
    state: ConnectionState,
    volume: Option<VolumeState>,
    app: Option<AppState>,
    media: Option<MediaState>,

    /// Outstanding status request that concurrent callers join
    status_in_flight: Option<RequestId>,

    states: Option<StateSink>,
}

impl Cache {
    fn reset(&mut self) {
        self.volume = None;
        self.app = None;
        self.media = None;
        self.status_in_flight = None;
    }
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, Cache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Cache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_in_flight(&self, request_id: RequestId) {
        let mut cache = self.write();
        if cache.status_in_flight == Some(request_id) {
            cache.status_in_flight = None;
        }
    }
}

impl StatusTarget for Shared {
    fn set_volume(&self, volume: VolumeState) -> Change {
        let mut cache = self.write();
        if cache.volume == Some(volume) {
            Change::None
        } else {
            tracing::debug!("Volume changed to {}", volume);
            cache.volume = Some(volume);
            Change::Volume
        }
    }

    fn set_app(&self, app: Option<AppState>) -> Change {
        let mut cache = self.write();
        if cache.app == app {
            Change::None
        } else {
            tracing::debug!("Application changed to {:?}", app.as_ref().map(|a| &a.app_id));
            cache.app = app;
            Change::App
        }
    }

    fn set_media(&self, media: Option<MediaState>) -> Change {
        let mut cache = self.write();
        if cache.media == media {
            Change::None
        } else {
            cache.media = media;
            Change::Media
        }
    }

    fn reply_received(&self, request_id: RequestId) {
        self.clear_in_flight(request_id);
    }

    fn connection_lost(&self) {
        let mut cache = self.write();
        cache.state = ConnectionState::Disconnected;
        cache.status_in_flight = None;
    }
}

impl Device {
    /// Create a device from a discovery record
    ///
    /// Fails with [`CastError::InvalidRecord`] when the record has no id, no
    /// addresses or a zero port.
    pub fn new(record: DeviceRecord) -> Result<Self> {
        Self::with_config(record, CastConfig::default())
    }

    /// Create a device with explicit connection settings
    pub fn with_config(record: DeviceRecord, config: CastConfig) -> Result<Self> {
        record.validate()?;

        let name = if record.friendly_name.is_empty() {
            record.id.clone()
        } else {
            record.friendly_name
        };
        let channel = Arc::new(Channel::new(config.sender_id.clone()));

        Ok(Self {
            id: record.id,
            name,
            model: record.model,
            status_text: record.status_text,
            status_flag: record.status_flag,
            addresses: record.addresses,
            port: record.port,
            connection: Mutex::new(Connection::new(channel.clone())),
            channel,
            config,
            shared: Arc::new(Shared {
                cache: RwLock::new(Cache::default()),
            }),
        })
    }

    // ========== Properties ==========

    /// Get the device identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the friendly name, or the id when none was advertised
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the running service: the active app's name, else the advertised status text
    pub fn service(&self) -> String {
        match self.shared.read().app.as_ref() {
            Some(app) if !app.display_name.is_empty() => app.display_name.clone(),
            _ => self.status_text.clone(),
        }
    }

    /// Get the connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.read().state
    }

    /// Get the advertised status flag (0 when idle on the backdrop)
    pub fn status_flag(&self) -> u32 {
        self.status_flag
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the last known volume
    pub fn volume(&self) -> Option<VolumeState> {
        self.shared.read().volume
    }

    /// Get the last known running application
    pub fn app(&self) -> Option<AppState> {
        self.shared.read().app.clone()
    }

    /// Get the last known media session
    pub fn media(&self) -> Option<MediaState> {
        self.shared.read().media.clone()
    }

    // ========== Connection ==========

    /// Connect using the configured address policy
    ///
    /// Errors and lifecycle transitions that happen after this call returns are
    /// delivered on `errors` and `states`. No retry is attempted.
    pub async fn connect_with_timeout(
        &self,
        timeout: Duration,
        errors: ErrorSink,
        states: StateSink,
    ) -> Result<()> {
        self.connect_with_policy(timeout, self.config.address_policy, errors, states)
            .await
    }

    /// Connect trying candidate addresses in the order `policy` gives
    ///
    /// `timeout` bounds the whole call, not each attempt.
    pub async fn connect_with_policy(
        &self,
        timeout: Duration,
        policy: AddressPolicy,
        errors: ErrorSink,
        states: StateSink,
    ) -> Result<()> {
        let candidates = policy.candidates(&self.addresses);
        if candidates.is_empty() {
            return Err(CastError::NotFound(format!("{}: no address", self.id)));
        }

        {
            let mut cache = self.shared.write();
            if cache.state != ConnectionState::Disconnected {
                return Err(CastError::OutOfOrder(format!(
                    "{} is already {}",
                    self.id, cache.state
                )));
            }
            cache.reset();
            cache.state = ConnectionState::Connecting;
            cache.states = Some(states.clone());
        }
        self.emit(&states, ConnectionState::Connecting);
        let mut attempt = Attempt {
            device: self,
            states: states.clone(),
            settled: false,
        };

        // too far out to represent means no deadline of our own
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        let mut last_error = None;
        {
            let mut connection = self.connection.lock().await;
            for ip in candidates {
                let remaining = deadline.map_or(timeout, |deadline| {
                    deadline.saturating_duration_since(tokio::time::Instant::now())
                });
                let target: Arc<dyn StatusTarget> = self.shared.clone();
                match connection
                    .connect(
                        &self.id,
                        SocketAddr::new(ip, self.port),
                        remaining,
                        &self.config,
                        target,
                        errors.clone(),
                        states.clone(),
                    )
                    .await
                {
                    Ok(()) => {
                        last_error = None;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to connect to {} at {}: {}", self.id, ip, e);
                        last_error = Some(e);
                    }
                }
            }
        }

        attempt.settle(last_error.is_none());

        match last_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Tear down the connection and forget cached state
    ///
    /// The cache is reset even when teardown reports errors.
    pub async fn disconnect(&self) -> Result<()> {
        let result = {
            let mut connection = self.connection.lock().await;
            connection.disconnect(self.config.shutdown_timeout).await
        };

        let (previous, states) = {
            let mut cache = self.shared.write();
            let previous = cache.state;
            cache.reset();
            cache.state = ConnectionState::Disconnected;
            (previous, cache.states.take())
        };

        if previous != ConnectionState::Disconnected {
            if let Some(states) = states {
                self.emit(&states, ConnectionState::Disconnected);
            }
        }

        if let Err(e) = &result {
            tracing::warn!("Disconnect from {} reported: {}", self.id, e);
        }
        result
    }

    // ========== State ==========

    /// Ask the receiver for its status unless it is already known
    ///
    /// At most one status request is outstanding; callers arriving while it is
    /// in flight return immediately.
    pub async fn update_status(&self) -> Result<()> {
        let (request_id, data) = {
            let mut cache = self.shared.write();
            ensure_connected(&self.id, &cache)?;
            if cache.volume.is_some() && cache.app.is_some() {
                return Ok(());
            }
            if let Some(in_flight) = cache.status_in_flight {
                tracing::debug!("Status request {} already in flight", in_flight);
                return Ok(());
            }
            let (request_id, data) = self.channel.get_status()?;
            cache.status_in_flight = Some(request_id);
            (request_id, data)
        };

        if let Err(e) = self.send(data).await {
            self.shared.clear_in_flight(request_id);
            return Err(e);
        }
        Ok(())
    }

    // ========== Requests ==========

    /// Launch an application by id
    pub async fn launch_app(&self, app_id: &str) -> Result<()> {
        self.ensure_connected()?;
        let (_, data) = self.channel.launch_app(app_id)?;
        self.send(data).await
    }

    /// Set the volume level, clamped to [0, 1]
    ///
    /// A level of zero (or below) is sent as muted silence.
    pub async fn set_volume_level(&self, level: f32) -> Result<()> {
        self.ensure_connected()?;
        let (_, data) = self.channel.set_volume(VolumeState::from_level(level))?;
        self.send(data).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.ensure_connected()?;
        let (_, data) = self.channel.set_muted(muted)?;
        self.send(data).await
    }

    /// Load a URL into the running application
    ///
    /// Requires an application with a media endpoint; binds to that endpoint
    /// first and only then issues the load.
    pub async fn load_media(&self, url: &str, mime_type: &str, autoplay: bool) -> Result<()> {
        let transport_id = {
            let cache = self.shared.read();
            ensure_connected(&self.id, &cache)?;
            match cache.app.as_ref() {
                Some(app) if !app.transport_id.is_empty() => app.transport_id.clone(),
                _ => {
                    return Err(CastError::OutOfOrder(format!(
                        "{}: no application to load media into",
                        self.id
                    )))
                }
            }
        };

        let (_, data) = self.channel.connect_media(&transport_id)?;
        self.send(data).await?;

        let (_, data) = self
            .channel
            .load_url(&transport_id, url, mime_type, autoplay)?;
        self.send(data).await
    }

    // ========== Helpers ==========

    fn ensure_connected(&self) -> Result<()> {
        ensure_connected(&self.id, &self.shared.read())
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.connection.lock().await.send(data)
    }

    fn emit(&self, states: &StateSink, state: ConnectionState) {
        tracing::debug!("{} is {}", self.id, state);
        let _ = states.send(StateUpdate::Connection {
            id: self.id.clone(),
            state,
        });
    }
}

/// Settles a connect that was started, including one whose future was dropped
struct Attempt<'a> {
    device: &'a Device,
    states: StateSink,
    settled: bool,
}

impl Attempt<'_> {
    fn settle(&mut self, connected: bool) {
        if self.settled {
            return;
        }
        self.settled = true;

        let state = {
            let mut cache = self.device.shared.write();
            // the dispatch loop may already have seen the transport drop
            if connected && cache.state == ConnectionState::Connecting {
                cache.state = ConnectionState::Connected;
            } else {
                cache.state = ConnectionState::Disconnected;
                cache.status_in_flight = None;
            }
            cache.state
        };
        self.device.emit(&self.states, state);
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!("Connect to {} was cancelled", self.device.id);
            self.settle(false);
        }
    }
}

fn ensure_connected(id: &str, cache: &Cache) -> Result<()> {
    if cache.state == ConnectionState::Connected {
        Ok(())
    } else {
        Err(CastError::OutOfOrder(format!("{} is {}", id, cache.state)))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.shared.read();

        write!(f, "<cast.device id={}", self.id)?;
        if !self.name.is_empty() {
            write!(f, " name={:?}", self.name)?;
        }
        if !self.model.is_empty() {
            write!(f, " model={:?}", self.model)?;
        }
        let service = match cache.app.as_ref() {
            Some(app) if !app.display_name.is_empty() => app.display_name.as_str(),
            _ => self.status_text.as_str(),
        };
        if !service.is_empty() {
            write!(f, " service={:?}", service)?;
        }
        write!(f, " state={}", cache.state)?;
        if let Some(volume) = &cache.volume {
            write!(f, " volume={}", volume)?;
        }
        if let Some(app) = &cache.app {
            write!(f, " app={}", app)?;
        }
        write!(f, ">")
    }
}
