use crate::error::{CastError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Device identifier as advertised in the `id` TXT entry
pub type DeviceId = String;

/// Device record produced by service discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,

    /// Friendly name (`fn`), empty if not advertised
    #[serde(default)]
    pub friendly_name: String,

    /// Model name (`md`)
    #[serde(default)]
    pub model: String,

    /// Status text (`rs`), usually the running service
    #[serde(default)]
    pub status_text: String,

    /// Status flag (`st`): 0 when idle on the backdrop
    #[serde(default)]
    pub status_flag: u32,

    /// Candidate addresses in discovery order
    pub addresses: Vec<IpAddr>,

    pub port: u16,
}

impl DeviceRecord {
    /// Build a record from mDNS TXT entries (`key=value`)
    ///
    /// Entries without `=` are kept with an empty value. The status flag
    /// accepts decimal or `0x` prefixed hex and falls back to zero.
    pub fn from_txt<S: AsRef<str>>(addresses: Vec<IpAddr>, port: u16, txt: &[S]) -> Self {
        let tuples = txt_to_map(txt);
        let get = |key: &str| tuples.get(key).cloned().unwrap_or_default();

        Self {
            id: get("id"),
            friendly_name: get("fn"),
            model: get("md"),
            status_text: get("rs"),
            status_flag: tuples.get("st").map(|s| parse_flag(s)).unwrap_or(0),
            addresses,
            port,
        }
    }

    /// Check the fields a device cannot work without
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(CastError::InvalidRecord("missing id".to_string()));
        }
        if self.port == 0 {
            return Err(CastError::InvalidRecord(format!("{}: port is zero", self.id)));
        }
        if self.addresses.is_empty() {
            return Err(CastError::InvalidRecord(format!("{}: no addresses", self.id)));
        }
        Ok(())
    }
}

fn txt_to_map<S: AsRef<str>>(txt: &[S]) -> BTreeMap<String, String> {
    txt.iter()
        .map(|entry| match entry.as_ref().split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.as_ref().to_string(), String::new()),
        })
        .collect()
}

fn parse_flag(value: &str) -> u32 {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.unwrap_or(0)
}

/// Receiver volume
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VolumeState {
    /// Level between 0.0 and 1.0
    pub level: f32,
    pub muted: bool,
}

impl VolumeState {
    /// Volume request for a level, clamped to [0, 1]
    ///
    /// Zero is expressed as the canonical silence form: level 0, muted.
    pub fn from_level(level: f32) -> Self {
        let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
        if level == 0.0 {
            Self { level: 0.0, muted: true }
        } else {
            Self { level, muted: false }
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.muted {
            write!(f, "{:.2} (muted)", self.level)
        } else {
            write!(f, "{:.2}", self.level)
        }
    }
}

/// Application running on the receiver
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppState {
    pub app_id: String,
    pub display_name: String,

    /// Receiver-assigned endpoint for the app's media channel
    pub transport_id: String,

    pub status_text: String,
    pub session_id: String,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self.display_name, self.app_id)
    }
}

/// Player state of a media session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    #[default]
    Idle,
    Buffering,
    Playing,
    Paused,
    #[serde(other)]
    Unknown,
}

/// Media session reported by the running app
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaState {
    pub session_id: i64,
    pub player_state: PlayerState,

    /// Playback position in seconds
    pub current_time: f64,

    pub content_id: Option<String>,
}

/// Lifecycle of the connection to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Cached aspect that changed after merging an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    None,
    Volume,
    App,
    Media,
}

impl Change {
    pub fn is_changed(self) -> bool {
        self != Change::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))
    }

    #[test]
    fn parses_txt_entries() {
        let record = DeviceRecord::from_txt(
            vec![addr()],
            8009,
            &["id=abc123", "fn=Living Room", "md=Chromecast", "rs=Backdrop", "st=0x1", "ve"],
        );

        assert_eq!(record.id, "abc123");
        assert_eq!(record.friendly_name, "Living Room");
        assert_eq!(record.model, "Chromecast");
        assert_eq!(record.status_text, "Backdrop");
        assert_eq!(record.status_flag, 1);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn txt_values_may_contain_equals() {
        let record = DeviceRecord::from_txt(vec![addr()], 8009, &["id=a=b", "st=junk"]);
        assert_eq!(record.id, "a=b");
        assert_eq!(record.status_flag, 0);
    }

    #[test]
    fn rejects_incomplete_records() {
        let valid = DeviceRecord {
            id: "abc123".into(),
            addresses: vec![addr()],
            port: 8009,
            ..Default::default()
        };
        assert!(valid.validate().is_ok());

        let no_id = DeviceRecord { id: String::new(), ..valid.clone() };
        let no_port = DeviceRecord { port: 0, ..valid.clone() };
        let no_addr = DeviceRecord { addresses: Vec::new(), ..valid.clone() };
        for record in [no_id, no_port, no_addr] {
            assert!(matches!(record.validate(), Err(CastError::InvalidRecord(_))));
        }
    }

    #[test]
    fn volume_level_is_clamped() {
        assert_eq!(VolumeState::from_level(1.7), VolumeState { level: 1.0, muted: false });
        assert_eq!(VolumeState::from_level(0.4), VolumeState { level: 0.4, muted: false });
        assert_eq!(VolumeState::from_level(-0.3), VolumeState::from_level(0.0));
        assert_eq!(VolumeState::from_level(0.0), VolumeState { level: 0.0, muted: true });
    }
}
