//! Storage infrastructure: the TOML configuration file.
//!
//! Platform, Node and Link records are not stored here; they live behind the
//! `fog_core::Store` trait.

pub mod config;
