//! Keypad wire protocol: control message types and ports.
//!
//! Every message is one flat JSON object. The variant is identified by which
//! key is present, not by an explicit tag (see `wire::decode_message`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Shared port number: UDP multicast discovery and TCP request/response.
pub const DEFAULT_PORT: u16 = 23456;
/// TCP port serving the most recently rendered image.
pub const DEFAULT_IMAGE_PORT: u16 = 23457;
/// Multicast group joined by every node.
pub const MULTICAST_GROUP: &str = "224.0.0.251";

/// Optional hardware a node reports in Announce/Acknowledge.
/// Absent keys mean `false`; `false` flags are not written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(rename = "oled", default, skip_serializing_if = "is_false")]
    pub display: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub siren: bool,
    #[serde(rename = "radio", default, skip_serializing_if = "is_false")]
    pub radio_sensors: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub rfid: bool,
    #[serde(rename = "weather", default, skip_serializing_if = "is_false")]
    pub weather_feed: bool,
    #[serde(rename = "secure", default, skip_serializing_if = "is_false")]
    pub secure_zone: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Value of the `status` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Armed,
    Disarmed,
    Night,
    Alarm,
    Reset,
}

/// Discovery probe: `{"announce":"keypad02","oled":true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    #[serde(rename = "announce")]
    pub name: String,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

/// Discovery reply: `{"acknowledge":"keypad03","weather":true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledge {
    #[serde(rename = "acknowledge")]
    pub name: String,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

/// Alarm-state propagation: `{"status":"alarm","name":"keypad02","sensor":"Kitchen"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub status: StatusKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<String>,
}

/// Announces a freshly rendered image that can be pulled from `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReady {
    /// Frame marker; receivers only check that the key is present.
    #[serde(rename = "image")]
    pub frame: u32,
    #[serde(rename = "w")]
    pub width: u16,
    #[serde(rename = "h")]
    pub height: u16,
    pub host: String,
    pub port: u16,
}

/// Synchronous request for the weather/image status blob. Any non-null
/// `query` value selects it; the value itself is not interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageQuery {
    pub query: Value,
}

impl Default for ImageQuery {
    fn default() -> Self {
        Self {
            query: Value::from("weather"),
        }
    }
}

/// Debug hook: `{"pin":17,"state":1}` drives a hardware output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSet {
    pub pin: u8,
    pub state: u8,
}

/// One node-to-node control message.
///
/// Serialized untagged: the body's own keys make up the whole object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ControlMessage {
    Status(Status),
    Announce(Announce),
    ImageReady(ImageReady),
    Acknowledge(Acknowledge),
    ImageQuery(ImageQuery),
    /// Cached weather fields; the object always carries a `weather` key.
    WeatherShare(Map<String, Value>),
    PinSet(PinSet),
}

impl ControlMessage {
    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Status(_) => "status",
            ControlMessage::Announce(_) => "announce",
            ControlMessage::ImageReady(_) => "image",
            ControlMessage::Acknowledge(_) => "acknowledge",
            ControlMessage::ImageQuery(_) => "query",
            ControlMessage::WeatherShare(_) => "weather",
            ControlMessage::PinSet(_) => "pin",
        }
    }
}

/// Outcome written back on the message channel when there is no typed answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyKind {
    Success,
    Error,
}

/// `{"reply":"success","message":"Ok"}` / `{"reply":"error","message":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub reply: ReplyKind,
    pub message: String,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            reply: ReplyKind::Success,
            message: "Ok".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            reply: ReplyKind::Error,
            message: message.into(),
        }
    }
}
