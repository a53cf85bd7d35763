//! Domain entities for the fog gateway.
//!
//! This module contains the records the gateway reasons about and the
//! contract it expects from the persistence layer.  Nothing here opens a
//! socket or spawns a task.
//!
//! # The three durable records (for beginners)
//!
//! - A **Platform** is an external system (a LoRaWAN application server, a
//!   6LoWPAN border router, ...) that hosts devices on one access network.
//!   Platforms are also the peers the gateway negotiates with.
//! - A **Node** is one device the gateway knows about.  It belongs to a
//!   platform and is marked either as a data *provider* or a *requester*.
//! - A **Link** says that two nodes are allowed to exchange data.  Links are
//!   created by a successful negotiation and consulted every time a device
//!   message has to be routed.
//!
//! The core never caches these records: every decision goes through the
//! [`store::Store`] trait, so a relational backend and the in-memory
//! [`memory_store::MemoryStore`] are interchangeable.

pub mod device_id;
pub mod entities;
pub mod memory_store;
pub mod message;
pub mod store;

pub use device_id::DeviceId;
pub use entities::{
    InterfaceType, Link, LinkId, LinkSpec, NewNode, Node, NodeId, NodeSpec, Platform, PlatformId,
    PlatformSpec,
};
pub use memory_store::MemoryStore;
pub use message::DeviceMessage;
pub use store::{Store, StoreError};
