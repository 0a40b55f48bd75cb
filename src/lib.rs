//! Client for ELM327/STN-style OBD-II adapters reached over Bluetooth LE.
//!
//! The adapter exposes a notify characteristic for its output and a write
//! characteristic for commands. This crate turns that pair into a byte stream,
//! frames `>`-terminated responses, runs the dialect detection handshake and
//! then polls a list of diagnostic requests continuously.
//!
//! # Layers
//!
//! 1. [`transport`]: chunked, acknowledged writes and a queue of notifications.
//! 2. [`framer`]: reassembles characters and reads up to a terminator under a deadline.
//! 3. [`protocol`]: `send_command` / `send_command_with_response` with echo and trailer stripping.
//! 4. [`connection`]: scan, connect, GATT setup, handshake, cancellation.
//! 5. [`poller`]: the poll loop over the target list.
//!
//! [`client::Client`] ties them together. The platform Bluetooth stack is
//! abstracted by [`platform::BlePlatform`]; [`sim::SimulatedAdapter`] implements
//! it in-process and `bluez::BluezPlatform` (feature `bluez`) on Linux.

pub mod client;
pub mod config;
pub mod connection;
pub mod device;
pub mod errors;
pub mod framer;
pub mod logging;
pub mod platform;
pub mod poller;
pub mod protocol;
pub mod scope;
pub mod sim;
pub mod transport;

#[cfg(feature = "bluez")]
pub mod bluez;

pub use client::Client;
pub use config::{ClientConfig, TargetSeed};
pub use connection::{ConnectionManager, ConnectionStatus, LinkEvent};
pub use device::Device;
pub use errors::*;
pub use platform::{BlePlatform, DeviceId, PlatformEvent};
pub use poller::{TargetConfig, NO_DATA};
pub use protocol::{CommandProtocol, Commander};
pub use scope::Scope;
