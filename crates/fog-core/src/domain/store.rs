//! The persistence contract consumed by the gateway core.
//!
//! The core treats the store as a reliable single-call service: it never
//! retries, and it assumes concurrent calls from several negotiation
//! sessions are safe.  Implementations provide their own locking.

use thiserror::Error;

use super::device_id::DeviceId;
use super::entities::{
    InterfaceType, Link, LinkId, NewNode, Node, NodeId, Platform, PlatformId, PlatformSpec,
};

/// Errors returned by a [`Store`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No row matches the given key.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// The write would violate a uniqueness or reference constraint.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend itself failed (connection lost, lock poisoned, ...).
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

/// CRUD access to Platform, Node and Link records.
///
/// `find_*` methods return `Ok(None)` for a missing row; `get_*` methods
/// treat a missing row as [`StoreError::NotFound`].
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Store: Send + Sync {
    fn find_node(&self, device_id: &DeviceId) -> Result<Option<Node>, StoreError>;

    fn get_node(&self, id: NodeId) -> Result<Node, StoreError>;

    fn get_nodes(&self) -> Result<Vec<Node>, StoreError>;

    /// Returns a provider node of the given interface type that no existing
    /// link references as provider, skipping `requester` itself.
    fn find_available_provider_node(
        &self,
        interface_type: InterfaceType,
        requester: NodeId,
    ) -> Result<Option<Node>, StoreError>;

    fn insert_node(&self, node: NewNode) -> Result<Node, StoreError>;

    fn delete_node(&self, id: NodeId) -> Result<(), StoreError>;

    fn get_platform(&self, id: PlatformId) -> Result<Platform, StoreError>;

    fn get_platforms(&self) -> Result<Vec<Platform>, StoreError>;

    fn find_platform(
        &self,
        address: &str,
        interface_type: InterfaceType,
    ) -> Result<Option<Platform>, StoreError>;

    fn insert_platform(&self, spec: &PlatformSpec) -> Result<Platform, StoreError>;

    fn update_platform(&self, platform: &Platform) -> Result<(), StoreError>;

    fn delete_platform(&self, id: PlatformId) -> Result<(), StoreError>;

    fn insert_link(&self, provider: NodeId, requester: NodeId) -> Result<LinkId, StoreError>;

    fn delete_link(&self, id: LinkId) -> Result<(), StoreError>;

    fn get_links(&self) -> Result<Vec<Link>, StoreError>;

    /// Returns the link in which `node` takes part, as provider or requester.
    fn find_link_for_node(&self, node: NodeId) -> Result<Option<Link>, StoreError>;
}
