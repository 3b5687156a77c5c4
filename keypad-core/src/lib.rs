//! Keypad peer protocol core.
//! Host-driven: no I/O; host passes received bytes and ticks, and performs the
//! sends and pulls the core asks for.

pub mod core;
pub mod host;
pub mod image;
pub mod protocol;
pub mod roster;
pub mod wire;

pub use crate::core::{Action, Coordinator, Event, Fanout, Identity, NodeState, Response};
pub use host::{Alarm, ArmState, Collaborators, Display, PinOutput, Weather};
pub use image::{Image, ImageError, ImageTicket};
pub use protocol::{
    Capabilities, ControlMessage, Reply, StatusKind, DEFAULT_IMAGE_PORT, DEFAULT_PORT,
};
pub use roster::{Peer, Roster};
pub use wire::{decode_message, encode_message, DecodeError, EncodeError};
