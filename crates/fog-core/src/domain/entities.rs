//! Platform, Node and Link records plus the admin payloads that create them.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::device_id::DeviceId;

// ── Interface types ───────────────────────────────────────────────────────────

/// The access-network kind a platform or node lives on.
///
/// The byte values are the ones used on the wire inside a `LinkContract`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum InterfaceType {
    /// Long-range radio network reached through a LoRaWAN network server.
    Lorawan = 0x01,
    /// Low-power IPv6 mesh reached through a border router.
    Sixlowpan = 0x02,
}

impl TryFrom<u8> for InterfaceType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(InterfaceType::Lorawan),
            0x02 => Ok(InterfaceType::Sixlowpan),
            _ => Err(()),
        }
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceType::Lorawan => f.write_str("lorawan"),
            InterfaceType::Sixlowpan => f.write_str("sixlowpan"),
        }
    }
}

// ── Identifiers ───────────────────────────────────────────────────────────────

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Primary key of a [`Platform`] row.
    PlatformId
);
record_id!(
    /// Primary key of a [`Node`] row.
    NodeId
);
record_id!(
    /// Primary key of a [`Link`] row.
    LinkId
);

// ── Durable records ───────────────────────────────────────────────────────────

/// A platform the gateway negotiates with and runs one adapter for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: PlatformId,
    /// `host:port` of the platform's negotiation endpoint.
    pub address: String,
    pub interface_type: InterfaceType,
}

/// A device known to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub device_id: DeviceId,
    pub platform_id: PlatformId,
    pub is_provider: bool,
    pub interface_type: InterfaceType,
}

/// Fields of a node that does not have an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub device_id: DeviceId,
    pub platform_id: PlatformId,
    pub is_provider: bool,
    pub interface_type: InterfaceType,
}

/// Authorisation for two nodes to exchange data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub provider_node: NodeId,
    pub requester_node: NodeId,
}

impl Link {
    /// Returns the node on the other end of the link, or `None` when `node`
    /// is not part of it.
    pub fn peer_of(&self, node: NodeId) -> Option<NodeId> {
        if node == self.provider_node {
            Some(self.requester_node)
        } else if node == self.requester_node {
            Some(self.provider_node)
        } else {
            None
        }
    }
}

// ── Admin payloads ────────────────────────────────────────────────────────────

/// JSON body of a platform insert/delete command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformSpec {
    pub address: String,
    pub interface_type: InterfaceType,
}

impl From<&Platform> for PlatformSpec {
    fn from(platform: &Platform) -> Self {
        Self {
            address: platform.address.clone(),
            interface_type: platform.interface_type,
        }
    }
}

/// JSON body of a node insert/delete command.
///
/// The owning platform is named by its address and interface type rather
/// than by id, since ids are local to this gateway's store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub device_id: DeviceId,
    pub platform_address: String,
    pub platform_type: InterfaceType,
    pub interface_type: InterfaceType,
    #[serde(default)]
    pub is_provider: bool,
}

/// JSON body of a manual link insert from the admin shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkSpec {
    pub provider_device_id: DeviceId,
    pub requester_device_id: DeviceId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_type_try_from_known_values() {
        assert_eq!(InterfaceType::try_from(1), Ok(InterfaceType::Lorawan));
        assert_eq!(InterfaceType::try_from(2), Ok(InterfaceType::Sixlowpan));
        assert_eq!(InterfaceType::try_from(0), Err(()));
    }

    #[test]
    fn test_link_peer_of_returns_other_side() {
        let link = Link {
            id: LinkId(1),
            provider_node: NodeId(10),
            requester_node: NodeId(20),
        };
        assert_eq!(link.peer_of(NodeId(10)), Some(NodeId(20)));
        assert_eq!(link.peer_of(NodeId(20)), Some(NodeId(10)));
        assert_eq!(link.peer_of(NodeId(30)), None);
    }

    #[test]
    fn test_node_spec_parses_from_json() {
        // Arrange
        let json = r#"{
            "device_id": "0004a30b001c0530",
            "platform_address": "10.0.0.7:2000",
            "platform_type": "lorawan",
            "interface_type": "lorawan",
            "is_provider": true
        }"#;

        // Act
        let spec: NodeSpec = serde_json::from_str(json).unwrap();

        // Assert
        assert_eq!(spec.device_id.len(), 8);
        assert_eq!(spec.platform_type, InterfaceType::Lorawan);
        assert!(spec.is_provider);
    }

    #[test]
    fn test_platform_spec_rejects_unknown_field() {
        let json = r#"{"address": "a:1", "interface_type": "sixlowpan", "ci_args": {}}"#;
        assert!(serde_json::from_str::<PlatformSpec>(json).is_err());
    }
}
