//! Binary codec for gateway frames.
//!
//! Wire format:
//! ```text
//! [version:1][fport:1][reserved:2][payload_len:4][payload:N]
//! ```
//! Header size: 8 bytes. All multi-byte integers are big-endian.
//!
//! Payload layouts:
//! ```text
//! AdminCommand  [insert:1][entity:1][data_len:4][data:N]
//! LinkRequest   [interface:1][req_len:2][req:N][prov_len:2][prov:M][linked:1]
//! LinkCommit    same as LinkRequest
//! LinkRelay     opaque bytes
//! Response      [ok:1]
//! ```

use thiserror::Error;

use crate::domain::{DeviceId, InterfaceType};
use crate::protocol::messages::{
    AdminCommand, EntityType, Envelope, FPort, FogMessage, LinkContract, Response, HEADER_SIZE,
    MAX_PAYLOAD_LEN, PROTOCOL_VERSION,
};

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer does not yet hold a complete frame.  Stream readers treat
    /// this as "read more", never as a failure.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The port byte in the header is not one of the known ports.
    #[error("unknown fport: {0}")]
    UnknownFPort(u8),

    /// The protocol version in the header is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The declared payload is larger than [`MAX_PAYLOAD_LEN`].
    #[error("payload too large: {declared} bytes (max {max})")]
    PayloadTooLarge { declared: usize, max: usize },

    /// The entity byte of an admin command is not recognised.
    #[error("unknown entity type: 0x{0:02X}")]
    UnknownEntityType(u8),

    /// The interface byte of a link contract is not recognised.
    #[error("unknown interface type: 0x{0:02X}")]
    UnknownInterfaceType(u8),

    /// A variable-length field does not fit its length prefix.
    #[error("{field} too long: {len} bytes")]
    FieldTooLong { field: &'static str, len: usize },

    /// The payload could not be parsed.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

// ── Envelope framing ──────────────────────────────────────────────────────────

/// Encodes an [`Envelope`] into header + payload bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_LEN`].
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let len = envelope.data.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            declared: len,
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + len);
    buf.push(PROTOCOL_VERSION);
    buf.push(envelope.fport as u8);
    buf.push(0x00); // reserved
    buf.push(0x00); // reserved
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.extend_from_slice(&envelope.data);
    Ok(buf)
}

/// Decodes one [`Envelope`] from the beginning of `bytes`.
///
/// Returns the envelope and the number of bytes it occupied.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] while the frame is still
/// incomplete, and another variant if the header is invalid.
pub fn decode_envelope(bytes: &[u8]) -> Result<(Envelope, usize), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let fport = FPort::try_from(bytes[1]).map_err(|_| ProtocolError::UnknownFPort(bytes[1]))?;

    // bytes[2..4] are reserved – ignored on decode

    let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            declared: payload_len,
            max: MAX_PAYLOAD_LEN,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let data = bytes[HEADER_SIZE..total].to_vec();
    Ok((Envelope { fport, data }, total))
}

// ── Typed messages ────────────────────────────────────────────────────────────

/// Encodes a [`FogMessage`] into a complete frame.
///
/// # Errors
///
/// Returns [`ProtocolError`] if a field does not fit the wire format.
///
/// # Examples
///
/// ```rust
/// use fog_core::protocol::{decode_message, encode_message, FogMessage};
///
/// let msg = FogMessage::ok();
/// let bytes = encode_message(&msg).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(msg: &FogMessage) -> Result<Vec<u8>, ProtocolError> {
    encode_envelope(&msg.to_envelope()?)
}

/// Decodes one [`FogMessage`] from the beginning of `bytes`.
///
/// Returns the message and the number of bytes consumed, so callers reading
/// from a stream can advance their buffer.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are incomplete or malformed.
pub fn decode_message(bytes: &[u8]) -> Result<(FogMessage, usize), ProtocolError> {
    let (envelope, consumed) = decode_envelope(bytes)?;
    Ok((FogMessage::try_from(envelope)?, consumed))
}

impl FogMessage {
    /// Encodes the payload and wraps it with its port.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FieldTooLong`] if a device id does not fit
    /// its 2-byte length prefix.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let mut data = Vec::new();
        match self {
            FogMessage::AdminCommand(cmd) => encode_admin_command(&mut data, cmd)?,
            FogMessage::LinkRequest(c) | FogMessage::LinkCommit(c) => {
                encode_contract(&mut data, c)?
            }
            FogMessage::LinkRelay(bytes) => data.extend_from_slice(bytes),
            FogMessage::Response(r) => data.push(if r.ok { 0x01 } else { 0x00 }),
        }
        Ok(Envelope::new(self.fport(), data))
    }
}

impl TryFrom<Envelope> for FogMessage {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let p = envelope.data;
        match envelope.fport {
            FPort::AdminCommand => decode_admin_command(&p).map(FogMessage::AdminCommand),
            FPort::LinkRequest => decode_contract(&p).map(FogMessage::LinkRequest),
            FPort::LinkCommit => decode_contract(&p).map(FogMessage::LinkCommit),
            FPort::LinkRelay => Ok(FogMessage::LinkRelay(p)),
            FPort::Response => {
                if p.len() != 1 {
                    return Err(ProtocolError::MalformedPayload(format!(
                        "Response: expected 1 byte, got {}",
                        p.len()
                    )));
                }
                Ok(FogMessage::Response(Response { ok: p[0] != 0 }))
            }
        }
    }
}

// ── Payload helpers ───────────────────────────────────────────────────────────

fn encode_admin_command(buf: &mut Vec<u8>, cmd: &AdminCommand) -> Result<(), ProtocolError> {
    if cmd.data.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::FieldTooLong {
            field: "AdminCommand.data",
            len: cmd.data.len(),
        });
    }
    buf.push(if cmd.insert { 0x01 } else { 0x00 });
    buf.push(cmd.entity as u8);
    buf.extend_from_slice(&(cmd.data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&cmd.data);
    Ok(())
}

fn decode_admin_command(p: &[u8]) -> Result<AdminCommand, ProtocolError> {
    require_len(p, 6, "AdminCommand")?;
    let insert = p[0] != 0;
    let entity = EntityType::try_from(p[1]).map_err(|_| ProtocolError::UnknownEntityType(p[1]))?;
    let data_len = u32::from_be_bytes([p[2], p[3], p[4], p[5]]) as usize;
    let end = 6usize.saturating_add(data_len);
    if p.len() != end {
        return Err(ProtocolError::MalformedPayload(format!(
            "AdminCommand: data_len {data_len} does not match {} payload bytes",
            p.len() - 6
        )));
    }
    Ok(AdminCommand {
        insert,
        entity,
        data: p[6..end].to_vec(),
    })
}

fn encode_contract(buf: &mut Vec<u8>, c: &LinkContract) -> Result<(), ProtocolError> {
    buf.push(c.interface_type as u8);
    write_length_prefixed_bytes(buf, c.requester_device_id.as_bytes(), "requester_device_id")?;
    write_length_prefixed_bytes(buf, c.provider_device_id.as_bytes(), "provider_device_id")?;
    buf.push(if c.linked { 0x01 } else { 0x00 });
    Ok(())
}

fn decode_contract(p: &[u8]) -> Result<LinkContract, ProtocolError> {
    // 1 (interface) + 2 (req_len) + 2 (prov_len) + 1 (linked)
    require_len(p, 6, "LinkContract")?;
    let interface_type =
        InterfaceType::try_from(p[0]).map_err(|_| ProtocolError::UnknownInterfaceType(p[0]))?;
    let (requester, req_end) = read_length_prefixed_bytes(p, 1, "LinkContract.requester")?;
    let (provider, prov_end) = read_length_prefixed_bytes(p, req_end, "LinkContract.provider")?;
    if p.len() != prov_end + 1 {
        return Err(ProtocolError::MalformedPayload(format!(
            "LinkContract: expected {} bytes, got {}",
            prov_end + 1,
            p.len()
        )));
    }
    Ok(LinkContract {
        interface_type,
        requester_device_id: DeviceId::from(requester),
        provider_device_id: DeviceId::from(provider),
        linked: p[prov_end] != 0,
    })
}

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

/// Writes a 2-byte length prefix followed by the bytes.
fn write_length_prefixed_bytes(
    buf: &mut Vec<u8>,
    bytes: &[u8],
    field: &'static str,
) -> Result<(), ProtocolError> {
    let len = u16::try_from(bytes.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: bytes.len(),
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Reads a 2-byte length prefix and that many bytes starting at `offset`.
///
/// Returns the bytes and the offset just past them.
fn read_length_prefixed_bytes<'a>(
    buf: &'a [u8],
    offset: usize,
    context: &str,
) -> Result<(&'a [u8], usize), ProtocolError> {
    require_len(buf, offset + 2, context)?;
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    require_len(buf, start + len, context)?;
    Ok((&buf[start..start + len], start + len))
}

// ── Unit tests ────────────────────────────────────────────────────────────────
