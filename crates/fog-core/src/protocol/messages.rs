//! Envelope kinds and typed payloads of the gateway protocol.
//!
//! Every frame carries an `FPort` byte that selects how its payload is read.
//! The values match the ports used by the platforms in the field, so they are
//! sparse on purpose.

use serde::{Deserialize, Serialize};

use crate::domain::{DeviceId, InterfaceType};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest payload a peer may declare.  Anything bigger is refused before
/// the gateway buffers it.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

// ── Frame kinds ───────────────────────────────────────────────────────────────

/// Discriminant of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FPort {
    /// Insert or delete a platform/node.
    AdminCommand = 0,
    /// Start of a link negotiation; also used to forward the contract.
    LinkRequest = 10,
    /// Opaque payload tunnelled between the two negotiating platforms.
    LinkRelay = 50,
    /// Requester confirms the contract (`linked = true`).
    LinkCommit = 100,
    /// Acknowledgement of a command or negotiation phase.
    Response = 200,
}

impl TryFrom<u8> for FPort {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FPort::AdminCommand),
            10 => Ok(FPort::LinkRequest),
            50 => Ok(FPort::LinkRelay),
            100 => Ok(FPort::LinkCommit),
            200 => Ok(FPort::Response),
            _ => Err(()),
        }
    }
}

/// A raw frame: the port plus its still-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub fport: FPort,
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn new(fport: FPort, data: Vec<u8>) -> Self {
        Self { fport, data }
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Which record an [`AdminCommand`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntityType {
    Node = 0x01,
    Platform = 0x02,
    Link = 0x03,
}

impl TryFrom<u8> for EntityType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(EntityType::Node),
            0x02 => Ok(EntityType::Platform),
            0x03 => Ok(EntityType::Link),
            _ => Err(()),
        }
    }
}

/// Insert or delete one record.
///
/// `data` is the JSON encoding of a `PlatformSpec` or `NodeSpec`, depending
/// on `entity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommand {
    pub insert: bool,
    pub entity: EntityType,
    pub data: Vec<u8>,
}

impl AdminCommand {
    /// Builds a command whose body is `body` serialised as JSON.
    pub fn with_json<T: Serialize>(
        insert: bool,
        entity: EntityType,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            insert,
            entity,
            data: serde_json::to_vec(body)?,
        })
    }
}

/// The agreement being negotiated between a requester and a provider.
///
/// `provider_device_id` stays empty until the gateway has picked a provider;
/// `linked` is set by the requester when it commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkContract {
    pub interface_type: InterfaceType,
    pub requester_device_id: DeviceId,
    pub provider_device_id: DeviceId,
    pub linked: bool,
}

impl LinkContract {
    /// A fresh request from `requester` for any provider of `interface_type`.
    pub fn request(interface_type: InterfaceType, requester: DeviceId) -> Self {
        Self {
            interface_type,
            requester_device_id: requester,
            provider_device_id: DeviceId::default(),
            linked: false,
        }
    }

    /// Returns `true` if both contracts name the same pair of devices over
    /// the same interface type, ignoring `linked`.
    pub fn same_parties(&self, other: &LinkContract) -> bool {
        self.interface_type == other.interface_type
            && self.requester_device_id == other.requester_device_id
            && self.provider_device_id == other.provider_device_id
    }
}

/// Terminal acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub ok: bool,
}

impl Response {
    pub const OK: Response = Response { ok: true };
    pub const REJECTED: Response = Response { ok: false };
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// Typed view of every frame the gateway sends or receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FogMessage {
    AdminCommand(AdminCommand),
    LinkRequest(LinkContract),
    LinkRelay(Vec<u8>),
    LinkCommit(LinkContract),
    Response(Response),
}

impl FogMessage {
    /// Returns the port this message travels on.
    pub fn fport(&self) -> FPort {
        match self {
            FogMessage::AdminCommand(_) => FPort::AdminCommand,
            FogMessage::LinkRequest(_) => FPort::LinkRequest,
            FogMessage::LinkRelay(_) => FPort::LinkRelay,
            FogMessage::LinkCommit(_) => FPort::LinkCommit,
            FogMessage::Response(_) => FPort::Response,
        }
    }

    pub fn ok() -> Self {
        FogMessage::Response(Response::OK)
    }

    pub fn rejected() -> Self {
        FogMessage::Response(Response::REJECTED)
    }
}
