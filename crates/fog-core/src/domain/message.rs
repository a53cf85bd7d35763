//! The uniform message adapters put on the gateway's inbound queue.

use std::time::SystemTime;

use super::device_id::DeviceId;
use super::entities::InterfaceType;

/// One application payload received from, or destined for, an end device.
///
/// Adapters fill in `origin` on ingress and leave `destination` empty; the
/// control loop writes the resolved peer into `destination` before handing
/// the message to the egress adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMessage {
    pub interface_type: InterfaceType,
    pub origin: DeviceId,
    pub destination: DeviceId,
    pub received_at: SystemTime,
    pub payload: Vec<u8>,
}

impl DeviceMessage {
    /// Builds an ingress message stamped with the current time.
    pub fn received(interface_type: InterfaceType, origin: DeviceId, payload: Vec<u8>) -> Self {
        Self {
            interface_type,
            origin,
            destination: DeviceId::default(),
            received_at: SystemTime::now(),
            payload,
        }
    }
}
