//! fog-gateway library entry point.
//!
//! Exposes the module tree so that integration tests in `tests/` and the
//! binary in `main.rs` share it.

pub mod application;
pub mod infrastructure;
