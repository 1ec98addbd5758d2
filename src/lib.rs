//! Film Light Bridge
//!
//! This is the core of a network-attached gateway that accepts a single client over a duplex
//! text-message channel and translates high-level lighting commands into encrypted Bluetooth
//! Mesh PDUs delivered to provisioned Telink-based luminaires over a GATT proxy link.
//!
//! The crate is split along the data path:
//!
//! * [`mesh`] wraps access messages into encrypted, obfuscated proxy PDUs (see Mesh Profile
//!   v1.0 | Section 3.8 for the key-derivation and nonce constructions implemented here).
//! * [`sidus`] packs the application-level control payloads (CCT, HSI, sleep and the hardware
//!   effects) into their 10-byte bit-exact wire form.
//! * [`effects`] runs the software-synthesised lighting effects as timer-chained state
//!   machines, one per light.
//! * [`proxy`] drives the single GATT proxy session and defines the [`proxy::BleController`]
//!   contract the host's BLE stack must fulfill.
//! * [`registry`] is the fixed-capacity light table keyed by unicast address.
//! * [`channel`] is the client-facing command/event frame schema.
//! * [`bridge`] glues everything together and owns the two task contexts (command dispatch
//!   and timer dispatch).
//!
//! The bridge only *originates* mesh messages. There is no provisioning, no segmentation and
//! no replay cache here; keys and unicast addresses arrive pre-provisioned from the client.

pub mod bridge;
pub mod channel;
pub mod effects;
pub mod mesh;
pub mod proxy;
pub mod registry;
pub mod sidus;
pub mod timer;

/// Firmware version reported in the `ready` event.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the light registry and of the effect instance pool.
pub const MAX_LIGHTS: usize = 9;

/// A 48-bit Bluetooth device address, little endian byte order.
pub type BluetoothDeviceAddress = [u8; 6];

/// A 16-bit mesh unicast (or group) address identifying a light.
pub type UnicastAddress = u16;

pub use bridge::{Bridge, BridgeHandle, BridgeInput};
pub use channel::{Command, Event};
pub use proxy::{BleController, ControllerEvent};
