//! Application layer of the gateway.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The use cases live here: they orchestrate `fog_core` types and reach the
//! outside world only through traits (`Store`, `DeviceAdapter`,
//! `AdapterFactory`).  Sockets, TLS and files belong to `infrastructure`.
//!
//! # Sub-modules
//!
//! - **`negotiation`**  – the sans-I/O link negotiation state machine.
//! - **`interfaces`**   – starts, replaces and stops device-network adapters.
//! - **`control_loop`** – the single task that executes admin commands and
//!   routes device traffic between linked nodes.
//! - **`admin_shell`**  – line-oriented operator console.

pub mod admin_shell;
pub mod control_loop;
pub mod interfaces;
pub mod negotiation;
