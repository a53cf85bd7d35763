//! Infrastructure layer of the gateway.
//!
//! Contains the I/O-facing pieces: the TLS listener and negotiation session
//! driver, the device-network adapters, and configuration storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `fog_core`, but MUST NOT be imported by `fog_core`.

pub mod adapters;
pub mod network;
pub mod storage;
