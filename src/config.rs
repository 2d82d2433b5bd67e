use rand::seq::SliceRandom;
use std::net::IpAddr;
use std::time::Duration;
use uuid::Uuid;

/// Default Cast control port
pub const DEFAULT_PORT: u16 = 8009;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receivers cap messages at 64 KiB
const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// How candidate addresses are tried when connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressPolicy {
    /// Only the first advertised address
    #[default]
    First,
    /// Every address in advertised order until one connects
    Ordered,
    /// Every address in random order until one connects
    Random,
}

impl AddressPolicy {
    /// Addresses to attempt, in attempt order
    pub fn candidates(&self, addresses: &[IpAddr]) -> Vec<IpAddr> {
        match self {
            AddressPolicy::First => addresses.iter().take(1).copied().collect(),
            AddressPolicy::Ordered => addresses.to_vec(),
            AddressPolicy::Random => {
                let mut shuffled = addresses.to_vec();
                shuffled.shuffle(&mut rand::rng());
                shuffled
            }
        }
    }
}

/// Connection settings for a device
#[derive(Debug, Clone)]
pub struct CastConfig {
    /// Wrap the socket in TLS; plain TCP is only useful against local test receivers
    pub tls: bool,
    pub sender_id: String,
    pub heartbeat_interval: Duration,

    /// Upper bound on flushing the writer during disconnect
    pub shutdown_timeout: Duration,

    pub max_frame_length: usize,
    pub address_policy: AddressPolicy,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            tls: true,
            sender_id: format!("sender-{}", Uuid::new_v4().simple()),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            max_frame_length: MAX_FRAME_LENGTH,
            address_policy: AddressPolicy::default(),
        }
    }
}

impl CastConfig {
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_sender_id(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_address_policy(mut self, policy: AddressPolicy) -> Self {
        self.address_policy = policy;
        self
    }
}
