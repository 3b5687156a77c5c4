//! Collaborators the peer core talks to. Implemented by the host application.
//!
//! Every `*_from_peer` call marks the event as peer-originated: implementations
//! must not broadcast it again, which is what breaks forwarding loops.

use std::sync::Arc;

use serde_json::{Map, Value};

/// Arm state shared across all nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Disarmed,
    Armed,
    Night,
}

/// Alarm state machine.
pub trait Alarm: Send + Sync {
    fn set_armed_from_peer(&self, state: ArmState);
    /// A peer already evaluated this trigger; sound the alarm.
    fn signal_from_peer(&self, sensor: &str);
    fn reset_from_peer(&self, user: &str);
}

/// Weather cache.
pub trait Weather: Send + Sync {
    /// Compact status blob returned verbatim to ImageQuery.
    fn build_status_blob(&self) -> Value;
    fn apply_status_blob(&self, blob: &Map<String, Value>);
}

/// Display that renders pulled images.
pub trait Display: Send + Sync {
    fn show_image(&self, pixels: &[u8], width: u16, height: u16);
}

/// Raw hardware outputs (PinSet test hook).
pub trait PinOutput: Send + Sync {
    fn set_pin(&self, pin: u8, high: bool);
}

/// Constructor-injected collaborator set.
#[derive(Clone)]
pub struct Collaborators {
    pub alarm: Arc<dyn Alarm>,
    pub weather: Arc<dyn Weather>,
    pub display: Arc<dyn Display>,
    pub pins: Arc<dyn PinOutput>,
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! Recording fakes shared by unit tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        SetArmed(ArmState),
        Signal(String),
        Reset(String),
        ApplyWeather(Map<String, Value>),
        ShowImage(usize, u16, u16),
        SetPin(u8, bool),
    }

    #[derive(Default)]
    pub struct Recorder {
        pub calls: Mutex<Vec<Call>>,
    }

    impl Recorder {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, c: Call) {
            self.calls.lock().unwrap().push(c);
        }
    }

    impl Alarm for Recorder {
        fn set_armed_from_peer(&self, state: ArmState) {
            self.push(Call::SetArmed(state));
        }
        fn signal_from_peer(&self, sensor: &str) {
            self.push(Call::Signal(sensor.to_string()));
        }
        fn reset_from_peer(&self, user: &str) {
            self.push(Call::Reset(user.to_string()));
        }
    }

    impl Weather for Recorder {
        fn build_status_blob(&self) -> Value {
            serde_json::json!({"weather": "Clear", "temp": 12})
        }
        fn apply_status_blob(&self, blob: &Map<String, Value>) {
            self.push(Call::ApplyWeather(blob.clone()));
        }
    }

    impl Display for Recorder {
        fn show_image(&self, pixels: &[u8], width: u16, height: u16) {
            self.push(Call::ShowImage(pixels.len(), width, height));
        }
    }

    impl PinOutput for Recorder {
        fn set_pin(&self, pin: u8, high: bool) {
            self.push(Call::SetPin(pin, high));
        }
    }

    pub fn recorder() -> (Arc<Recorder>, Collaborators) {
        let r = Arc::new(Recorder::default());
        let c = Collaborators {
            alarm: r.clone(),
            weather: r.clone(),
            display: r.clone(),
            pins: r.clone(),
        };
        (r, c)
    }
}
