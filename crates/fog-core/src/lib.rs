//! # fog-core
//!
//! Shared library for the fog gateway: the wire codec spoken between the
//! gateway and the platforms, the domain records (platforms, nodes, links)
//! and the persistence contract the gateway core consumes.
//!
//! It has no dependencies on sockets, TLS or an async runtime.
//!
//! # Architecture overview (for beginners)
//!
//! The gateway sits in the fog layer between heterogeneous IoT access
//! networks.  Devices never talk to each other directly: each device belongs
//! to a *platform*, and platforms ask the gateway to broker a *link* between
//! a requesting device and a providing device.  Once a link exists, the
//! gateway relays application payloads between the two devices.
//!
//! This crate (`fog-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel between the gateway and platforms.
//!   Every frame has an 8-byte header whose `fport` byte selects one of five
//!   payload kinds (admin command, link request, relay, commit, response).
//!
//! - **`domain`** – The Platform/Node/Link records, the uniform
//!   [`DeviceMessage`] produced by device adapters, and the [`Store`] trait
//!   with an in-memory implementation.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `fog_core::Store` instead of `fog_core::domain::store::Store`.
pub use domain::{
    DeviceId, DeviceMessage, InterfaceType, Link, LinkId, LinkSpec, MemoryStore, NewNode, Node,
    NodeId, NodeSpec, Platform, PlatformId, PlatformSpec, Store, StoreError,
};
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::{FogMessage, LinkContract};
