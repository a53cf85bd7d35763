//! In-memory [`Store`] implementation.
//!
//! Used by the gateway binary when no external database is configured and by
//! tests throughout the workspace.  All tables live behind one mutex, so each
//! call is atomic with respect to every other call.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use super::device_id::DeviceId;
use super::entities::{
    InterfaceType, Link, LinkId, NewNode, Node, NodeId, NodeSpec, Platform, PlatformId,
    PlatformSpec,
};
use super::store::{Store, StoreError};

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    platforms: BTreeMap<PlatformId, Platform>,
    nodes: BTreeMap<NodeId, Node>,
    links: BTreeMap<LinkId, Link>,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn provider_is_linked(&self, node: NodeId) -> bool {
        self.links.values().any(|l| l.provider_node == node)
    }
}

/// Mutex-guarded tables of platforms, nodes and links.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with the given platforms and nodes.
    ///
    /// Nodes name their platform by address and type, exactly as an admin
    /// command would.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a node names an unknown platform or a row
    /// violates a uniqueness constraint.
    pub fn seeded(platforms: &[PlatformSpec], nodes: &[NodeSpec]) -> Result<Self, StoreError> {
        let store = Self::new();
        for spec in platforms {
            store.insert_platform(spec)?;
        }
        for spec in nodes {
            let platform = store
                .find_platform(&spec.platform_address, spec.platform_type)?
                .ok_or_else(|| StoreError::not_found("platform", &spec.platform_address))?;
            store.insert_node(NewNode {
                device_id: spec.device_id.clone(),
                platform_id: platform.id,
                is_provider: spec.is_provider,
                interface_type: spec.interface_type,
            })?;
        }
        Ok(store)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn find_node(&self, device_id: &DeviceId) -> Result<Option<Node>, StoreError> {
        let t = self.tables()?;
        Ok(t.nodes.values().find(|n| &n.device_id == device_id).cloned())
    }

    fn get_node(&self, id: NodeId) -> Result<Node, StoreError> {
        let t = self.tables()?;
        t.nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("node", id))
    }

    fn get_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.tables()?.nodes.values().cloned().collect())
    }

    fn find_available_provider_node(
        &self,
        interface_type: InterfaceType,
        requester: NodeId,
    ) -> Result<Option<Node>, StoreError> {
        let t = self.tables()?;
        Ok(t.nodes
            .values()
            .find(|n| {
                n.is_provider
                    && n.id != requester
                    && n.interface_type == interface_type
                    && !t.provider_is_linked(n.id)
            })
            .cloned())
    }

    fn insert_node(&self, node: NewNode) -> Result<Node, StoreError> {
        let mut t = self.tables()?;
        if !t.platforms.contains_key(&node.platform_id) {
            return Err(StoreError::not_found("platform", node.platform_id));
        }
        if t.nodes.values().any(|n| n.device_id == node.device_id) {
            return Err(StoreError::Conflict(format!(
                "device {} already registered",
                node.device_id
            )));
        }
        let id = NodeId(t.allocate_id());
        let row = Node {
            id,
            device_id: node.device_id,
            platform_id: node.platform_id,
            is_provider: node.is_provider,
            interface_type: node.interface_type,
        };
        t.nodes.insert(id, row.clone());
        debug!("store: inserted node {} ({})", id, row.device_id);
        Ok(row)
    }

    fn delete_node(&self, id: NodeId) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if t.links.values().any(|l| l.peer_of(id).is_some()) {
            return Err(StoreError::Conflict(format!("node {id} is part of a link")));
        }
        t.nodes
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("node", id))
    }

    fn get_platform(&self, id: PlatformId) -> Result<Platform, StoreError> {
        let t = self.tables()?;
        t.platforms
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("platform", id))
    }

    fn get_platforms(&self) -> Result<Vec<Platform>, StoreError> {
        Ok(self.tables()?.platforms.values().cloned().collect())
    }

    fn find_platform(
        &self,
        address: &str,
        interface_type: InterfaceType,
    ) -> Result<Option<Platform>, StoreError> {
        let t = self.tables()?;
        Ok(t.platforms
            .values()
            .find(|p| p.address == address && p.interface_type == interface_type)
            .cloned())
    }

    fn insert_platform(&self, spec: &PlatformSpec) -> Result<Platform, StoreError> {
        let mut t = self.tables()?;
        if t
            .platforms
            .values()
            .any(|p| p.address == spec.address && p.interface_type == spec.interface_type)
        {
            return Err(StoreError::Conflict(format!(
                "platform {} ({}) already registered",
                spec.address, spec.interface_type
            )));
        }
        let id = PlatformId(t.allocate_id());
        let row = Platform {
            id,
            address: spec.address.clone(),
            interface_type: spec.interface_type,
        };
        t.platforms.insert(id, row.clone());
        debug!("store: inserted platform {} at {}", id, row.address);
        Ok(row)
    }

    fn update_platform(&self, platform: &Platform) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        match t.platforms.get_mut(&platform.id) {
            Some(row) => {
                *row = platform.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("platform", platform.id)),
        }
    }

    fn delete_platform(&self, id: PlatformId) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if t.nodes.values().any(|n| n.platform_id == id) {
            return Err(StoreError::Conflict(format!(
                "platform {id} still owns nodes"
            )));
        }
        t.platforms
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("platform", id))
    }

    fn insert_link(&self, provider: NodeId, requester: NodeId) -> Result<LinkId, StoreError> {
        let mut t = self.tables()?;
        if provider == requester {
            return Err(StoreError::Conflict("a node cannot link to itself".to_string()));
        }
        for id in [provider, requester] {
            if !t.nodes.contains_key(&id) {
                return Err(StoreError::not_found("node", id));
            }
        }
        if t.provider_is_linked(provider) {
            return Err(StoreError::Conflict(format!(
                "provider node {provider} is already linked"
            )));
        }
        let id = LinkId(t.allocate_id());
        t.links.insert(
            id,
            Link {
                id,
                provider_node: provider,
                requester_node: requester,
            },
        );
        debug!("store: inserted link {} ({} -> {})", id, provider, requester);
        Ok(id)
    }

    fn delete_link(&self, id: LinkId) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        t.links
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("link", id))
    }

    fn get_links(&self) -> Result<Vec<Link>, StoreError> {
        Ok(self.tables()?.links.values().cloned().collect())
    }

    fn find_link_for_node(&self, node: NodeId) -> Result<Option<Link>, StoreError> {
        let t = self.tables()?;
        Ok(t.links.values().find(|l| l.peer_of(node).is_some()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform_spec(address: &str, interface_type: InterfaceType) -> PlatformSpec {
        PlatformSpec {
            address: address.to_string(),
            interface_type,
        }
    }

    fn node_spec(device: &str, address: &str, is_provider: bool) -> NodeSpec {
        NodeSpec {
            device_id: DeviceId::new(device),
            platform_address: address.to_string(),
            platform_type: InterfaceType::Lorawan,
            interface_type: InterfaceType::Lorawan,
            is_provider,
        }
    }

    fn seeded_pair() -> MemoryStore {
        MemoryStore::seeded(
            &[platform_spec("10.0.0.1:2000", InterfaceType::Lorawan)],
            &[
                node_spec("AA", "10.0.0.1:2000", false),
                node_spec("BB", "10.0.0.1:2000", true),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_seeded_store_resolves_node_platforms() {
        let store = seeded_pair();
        let platform = store
            .find_platform("10.0.0.1:2000", InterfaceType::Lorawan)
            .unwrap()
            .unwrap();
        let node = store.find_node(&DeviceId::new("BB")).unwrap().unwrap();
        assert_eq!(node.platform_id, platform.id);
        assert!(node.is_provider);
    }

    #[test]
    fn test_seed_with_unknown_platform_fails() {
        let result = MemoryStore::seeded(&[], &[node_spec("AA", "nowhere:1", false)]);
        assert!(matches!(result, Err(StoreError::NotFound { entity: "platform", .. })));
    }

    #[test]
    fn test_available_provider_excludes_linked_providers() {
        // Arrange
        let store = seeded_pair();
        let requester = store.find_node(&DeviceId::new("AA")).unwrap().unwrap();
        let provider = store
            .find_available_provider_node(InterfaceType::Lorawan, requester.id)
            .unwrap()
            .unwrap();

        // Act
        store.insert_link(provider.id, requester.id).unwrap();

        // Assert
        assert_eq!(
            store
                .find_available_provider_node(InterfaceType::Lorawan, requester.id)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_available_provider_respects_interface_type() {
        let store = seeded_pair();
        let requester = store.find_node(&DeviceId::new("AA")).unwrap().unwrap();
        assert_eq!(
            store
                .find_available_provider_node(InterfaceType::Sixlowpan, requester.id)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_available_provider_skips_the_requester_itself() {
        // Arrange: AA is a provider too and has the lower id
        let store = MemoryStore::seeded(
            &[platform_spec("10.0.0.1:2000", InterfaceType::Lorawan)],
            &[
                node_spec("AA", "10.0.0.1:2000", true),
                node_spec("BB", "10.0.0.1:2000", true),
            ],
        )
        .unwrap();
        let aa = store.find_node(&DeviceId::new("AA")).unwrap().unwrap();

        // Act
        let provider = store
            .find_available_provider_node(InterfaceType::Lorawan, aa.id)
            .unwrap();

        // Assert
        assert_eq!(provider.map(|n| n.device_id), Some(DeviceId::new("BB")));
    }

    #[test]
    fn test_linking_same_provider_twice_is_a_conflict() {
        let store = seeded_pair();
        let a = store.find_node(&DeviceId::new("AA")).unwrap().unwrap();
        let b = store.find_node(&DeviceId::new("BB")).unwrap().unwrap();
        store.insert_link(b.id, a.id).unwrap();
        assert!(matches!(store.insert_link(b.id, a.id), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_find_link_for_node_matches_either_side() {
        let store = seeded_pair();
        let a = store.find_node(&DeviceId::new("AA")).unwrap().unwrap();
        let b = store.find_node(&DeviceId::new("BB")).unwrap().unwrap();
        let link_id = store.insert_link(b.id, a.id).unwrap();

        assert_eq!(store.find_link_for_node(a.id).unwrap().unwrap().id, link_id);
        assert_eq!(store.find_link_for_node(b.id).unwrap().unwrap().id, link_id);
    }

    #[test]
    fn test_duplicate_platform_is_a_conflict() {
        let store = MemoryStore::new();
        let spec = platform_spec("10.0.0.1:2000", InterfaceType::Sixlowpan);
        store.insert_platform(&spec).unwrap();
        assert!(matches!(store.insert_platform(&spec), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_delete_platform_with_nodes_is_refused() {
        let store = seeded_pair();
        let platform = store.get_platforms().unwrap().remove(0);
        assert!(matches!(
            store.delete_platform(platform.id),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_update_platform_replaces_address() {
        // Arrange
        let store = MemoryStore::new();
        let mut platform = store
            .insert_platform(&platform_spec("old:1", InterfaceType::Lorawan))
            .unwrap();

        // Act
        platform.address = "new:2".to_string();
        store.update_platform(&platform).unwrap();

        // Assert
        assert_eq!(store.get_platform(platform.id).unwrap().address, "new:2");
    }

    #[test]
    fn test_delete_linked_node_is_refused() {
        let store = seeded_pair();
        let a = store.find_node(&DeviceId::new("AA")).unwrap().unwrap();
        let b = store.find_node(&DeviceId::new("BB")).unwrap().unwrap();
        let link_id = store.insert_link(b.id, a.id).unwrap();

        assert!(matches!(store.delete_node(a.id), Err(StoreError::Conflict(_))));
        store.delete_link(link_id).unwrap();
        store.delete_node(a.id).unwrap();
        assert_eq!(store.find_node(&DeviceId::new("AA")).unwrap(), None);
    }
}
