//! Framing: one JSON object per datagram or per TCP write, bounded in size.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::protocol::{ControlMessage, Reply};

/// Largest message accepted or produced. One TCP read must hold a whole message.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Keys that select a variant, checked in this order.
const VARIANT_KEYS: [&str; 7] = [
    "status",
    "announce",
    "image",
    "acknowledge",
    "query",
    "weather",
    "pin",
];

/// Encode a message as compact JSON.
///
/// A weather blob must decode back as WeatherShare: it needs a `weather` key
/// and no key that outranks it.
pub fn encode_message(msg: &ControlMessage) -> Result<Vec<u8>, EncodeError> {
    if let ControlMessage::WeatherShare(blob) = msg {
        match selecting_key(blob) {
            Some("weather") => {}
            Some(key) => return Err(EncodeError::WeatherShadowed(key)),
            None => return Err(EncodeError::NotWeather),
        }
    }
    encode_value(msg)
}

/// Encode a generic reply object.
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>, EncodeError> {
    encode_value(reply)
}

fn encode_value<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let out = serde_json::to_vec(value)?;
    if out.len() > MAX_MESSAGE_LEN {
        return Err(EncodeError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Error encoding a message (serde failure or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message too large ({0} bytes)")]
    TooLarge(usize),
    #[error("weather share without weather key")]
    NotWeather,
    #[error("weather share carries {0:?}, which would decode as another message")]
    WeatherShadowed(&'static str),
}

/// Decode one message from raw bytes.
///
/// Trailing NULs and whitespace are tolerated; some firmware sends the C
/// string terminator along with the datagram.
pub fn decode_message(bytes: &[u8]) -> Result<ControlMessage, DecodeError> {
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(DecodeError::TooLarge(bytes.len()));
    }
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    let text = text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Object(map) => decode_object(map),
        _ => Err(DecodeError::NotAnObject),
    }
}

/// Pick the variant by the first known key present, then require that body
/// to be well formed. A malformed body never falls through to a later variant.
pub fn decode_object(map: Map<String, Value>) -> Result<ControlMessage, DecodeError> {
    let key = selecting_key(&map).ok_or(DecodeError::UnknownVariant)?;

    let msg = match key {
        "status" => ControlMessage::Status(body(key, map)?),
        "announce" => ControlMessage::Announce(body(key, map)?),
        "image" => ControlMessage::ImageReady(body(key, map)?),
        "acknowledge" => ControlMessage::Acknowledge(body(key, map)?),
        "query" => ControlMessage::ImageQuery(body(key, map)?),
        "weather" => ControlMessage::WeatherShare(map),
        _ => ControlMessage::PinSet(body(key, map)?),
    };
    Ok(msg)
}

/// First variant key present with a non-null value.
fn selecting_key(map: &Map<String, Value>) -> Option<&'static str> {
    VARIANT_KEYS
        .iter()
        .copied()
        .find(|k| map.get(*k).is_some_and(|v| !v.is_null()))
}

fn body<T: DeserializeOwned>(key: &'static str, map: Map<String, Value>) -> Result<T, DecodeError> {
    serde_json::from_value(Value::Object(map)).map_err(|source| DecodeError::Body { key, source })
}

/// Error decoding a message. Every case means "unparseable"; callers drop it.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message too large ({0} bytes)")]
    TooLarge(usize),
    #[error("message is not UTF-8")]
    NotUtf8,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("no known message key")]
    UnknownVariant,
    #[error("invalid {key} message: {source}")]
    Body {
        key: &'static str,
        source: serde_json::Error,
    },
}
