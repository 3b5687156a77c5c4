//! Stand-in collaborators for a headless node: they keep the last state they
//! were given and log it. A controller with real hardware supplies its own.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use keypad_core::{Alarm, ArmState, Collaborators, Display, PinOutput, Weather};
use serde_json::{Map, Value};

#[derive(Debug)]
pub struct LogAlarm {
    state: Mutex<ArmState>,
}

impl LogAlarm {
    #[cfg(test)]
    fn state(&self) -> ArmState {
        self.state.lock().map(|s| *s).unwrap_or(ArmState::Disarmed)
    }
}

impl Default for LogAlarm {
    fn default() -> Self {
        Self {
            state: Mutex::new(ArmState::Disarmed),
        }
    }
}

impl Alarm for LogAlarm {
    fn set_armed_from_peer(&self, state: ArmState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
        tracing::info!(?state, "arm state from peer");
    }

    fn signal_from_peer(&self, sensor: &str) {
        tracing::warn!(sensor, "alarm raised by peer");
    }

    fn reset_from_peer(&self, user: &str) {
        tracing::info!(user, "alarm reset by peer");
    }
}

/// Holds the most recent blob; serves it back to queries.
#[derive(Debug, Default)]
pub struct LogWeather {
    cached: Mutex<Map<String, Value>>,
}

impl Weather for LogWeather {
    fn build_status_blob(&self) -> Value {
        let cached = self.cached.lock().map(|m| m.clone()).unwrap_or_default();
        Value::Object(cached)
    }

    fn apply_status_blob(&self, blob: &Map<String, Value>) {
        tracing::debug!(keys = blob.len(), "weather from peer");
        if let Ok(mut cached) = self.cached.lock() {
            *cached = blob.clone();
        }
    }
}

#[derive(Debug, Default)]
pub struct LogDisplay {
    last: Mutex<Option<(u16, u16, Bytes)>>,
}

impl LogDisplay {
    #[cfg(test)]
    fn last_frame(&self) -> Option<(u16, u16, Bytes)> {
        self.last.lock().ok().and_then(|l| l.clone())
    }
}

impl Display for LogDisplay {
    fn show_image(&self, pixels: &[u8], width: u16, height: u16) {
        tracing::info!(width, height, "image received");
        if let Ok(mut last) = self.last.lock() {
            *last = Some((width, height, Bytes::copy_from_slice(pixels)));
        }
    }
}

#[derive(Debug, Default)]
pub struct LogPins;

impl PinOutput for LogPins {
    fn set_pin(&self, pin: u8, high: bool) {
        tracing::info!(pin, high, "pin set by peer");
    }
}

pub fn collaborators() -> Collaborators {
    Collaborators {
        alarm: Arc::new(LogAlarm::default()),
        weather: Arc::new(LogWeather::default()),
        display: Arc::new(LogDisplay::default()),
        pins: Arc::new(LogPins),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn alarm_tracks_state() {
        let alarm = LogAlarm::default();
        assert_eq!(alarm.state(), ArmState::Disarmed);
        alarm.set_armed_from_peer(ArmState::Night);
        assert_eq!(alarm.state(), ArmState::Night);
    }

    #[test]
    fn weather_serves_applied_blob() {
        let weather = LogWeather::default();
        assert_eq!(weather.build_status_blob(), json!({}));
        let Value::Object(blob) = json!({"weather": "Rain", "temp": 9}) else {
            unreachable!()
        };
        weather.apply_status_blob(&blob);
        assert_eq!(weather.build_status_blob()["weather"], "Rain");
    }

    #[test]
    fn display_keeps_last_frame() {
        let display = LogDisplay::default();
        assert!(display.last_frame().is_none());
        display.show_image(&[1, 2, 3, 4], 1, 2);
        let (w, h, px) = display.last_frame().unwrap();
        assert_eq!((w, h), (1, 2));
        assert_eq!(&px[..], &[1, 2, 3, 4]);
    }
}
