//! Platform-facing network layer: TLS, framing, the acceptor, and the
//! negotiation session driver.

pub mod acceptor;
pub mod framed;
pub mod session;
pub mod tls;
