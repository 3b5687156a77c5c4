//! Keypad node services: the tokio side of the peer protocol. The core in
//! `keypad-core` decides; these modules own the sockets.

pub mod config;
pub mod discovery;
pub mod host;
pub mod messaging;
pub mod node;
pub mod transfer;

pub use node::{Peers, SharedCore};
