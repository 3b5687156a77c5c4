//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use keypad_core::{Capabilities, Identity, DEFAULT_IMAGE_PORT, DEFAULT_PORT};
use serde::Deserialize;

/// Node configuration. File: $KEYPAD_CONFIG, ~/.config/keypad/config.toml or
/// /etc/keypad/config.toml.
/// Env overrides: KEYPAD_NAME, KEYPAD_PORT, KEYPAD_IMAGE_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Node name. Empty: derived from the hardware address.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub oled: bool,
    #[serde(default)]
    pub siren: bool,
    #[serde(default)]
    pub radio: bool,
    #[serde(default)]
    pub rfid: bool,
    #[serde(default)]
    pub weather: bool,
    #[serde(default)]
    pub secure: bool,
    /// Discovery (UDP) and messaging (TCP) port (default 23456).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Image transfer TCP port (default 23457).
    #[serde(default = "default_image_port")]
    pub image_port: u16,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: String,
    /// Host put in image announcements. Empty: the outbound interface address.
    #[serde(default)]
    pub advertise_host: String,
    /// Bound on a whole CallPeer exchange.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Gap between the two copies of an announce.
    #[serde(default = "default_announce_gap_ms")]
    pub announce_gap_ms: u64,
    /// Wait per image read before it counts as a stall.
    #[serde(default = "default_image_stall_ms")]
    pub image_stall_ms: u64,
    /// Stalled reads tolerated before an image pull is abandoned.
    #[serde(default = "default_image_max_stalls")]
    pub image_max_stalls: u32,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Evict peers silent this long. 0 = never.
    #[serde(default)]
    pub peer_ttl_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_image_port() -> u16 {
    DEFAULT_IMAGE_PORT
}
fn default_multicast_group() -> String {
    keypad_core::protocol::MULTICAST_GROUP.to_string()
}
fn default_call_timeout_ms() -> u64 {
    5000
}
fn default_announce_gap_ms() -> u64 {
    200
}
fn default_image_stall_ms() -> u64 {
    50
}
fn default_image_max_stalls() -> u32 {
    100
}
fn default_tick_ms() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            oled: false,
            siren: false,
            radio: false,
            rfid: false,
            weather: false,
            secure: false,
            port: default_port(),
            image_port: default_image_port(),
            multicast_group: default_multicast_group(),
            advertise_host: String::new(),
            call_timeout_ms: default_call_timeout_ms(),
            announce_gap_ms: default_announce_gap_ms(),
            image_stall_ms: default_image_stall_ms(),
            image_max_stalls: default_image_max_stalls(),
            tick_ms: default_tick_ms(),
            peer_ttl_secs: 0,
        }
    }
}

impl Config {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            display: self.oled,
            siren: self.siren,
            radio_sensors: self.radio,
            rfid: self.rfid,
            weather_feed: self.weather,
            secure_zone: self.secure,
        }
    }

    pub fn identity(&self) -> Identity {
        let name = if self.name.is_empty() {
            default_name()
        } else {
            self.name.clone()
        };
        Identity {
            name,
            capabilities: self.capabilities(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn announce_gap(&self) -> Duration {
        Duration::from_millis(self.announce_gap_ms)
    }

    pub fn image_stall(&self) -> Duration {
        Duration::from_millis(self.image_stall_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn peer_ttl(&self) -> Option<Duration> {
        (self.peer_ttl_secs > 0).then(|| Duration::from_secs(self.peer_ttl_secs))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("KEYPAD_NAME") {
        c.name = s;
    }
    if let Ok(s) = std::env::var("KEYPAD_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(e) => tracing::warn!(value = %s, error = %e, "ignoring KEYPAD_PORT"),
        }
    }
    if let Ok(s) = std::env::var("KEYPAD_IMAGE_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.image_port = p,
            Err(e) => tracing::warn!(value = %s, error = %e, "ignoring KEYPAD_IMAGE_PORT"),
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("KEYPAD_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/keypad/config.toml"));
    }
    out.push(PathBuf::from("/etc/keypad/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&path) {
        Ok(c) => {
            tracing::info!(path = %path.display(), "config loaded");
            Some(c)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config, using defaults"
            );
            None
        }
    }
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<Config>(&s)?)
}

/// `keypad-xxxxxx` from the last three octets of the first non-loopback
/// hardware address, falling back to the host name.
fn default_name() -> String {
    hardware_address()
        .and_then(|mac| name_from_mac(&mac))
        .or_else(|| {
            hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "keypad".to_string())
}

fn hardware_address() -> Option<String> {
    let mut ifaces: Vec<PathBuf> = std::fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.file_name().is_some_and(|n| n != "lo"))
        .collect();
    ifaces.sort();
    ifaces
        .iter()
        .filter_map(|p| std::fs::read_to_string(p.join("address")).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty() && s != "00:00:00:00:00:00")
}

fn name_from_mac(mac: &str) -> Option<String> {
    let octets: Vec<&str> = mac.split(':').collect();
    if octets.len() != 6 || octets.iter().any(|o| u8::from_str_radix(o, 16).is_err()) {
        return None;
    }
    Some(format!("keypad-{}", octets[3..].concat().to_ascii_lowercase()))
}
