//! Protocol module containing frame types and the binary codec.

pub mod codec;
pub mod messages;

pub use codec::{decode_envelope, decode_message, encode_envelope, encode_message, ProtocolError};
pub use messages::*;
