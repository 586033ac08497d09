//! The node's local resource graph.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use shared::protocol::ResourceKind;
use shared::types::{Node, Resource};
use shared::version::tai_now;
use crate::error::{Error, Result};

/// Node plus child resources, with per-kind version counters.
#[derive(Debug, Default)]
pub struct ResourceStore {
    node: Option<Node>,
    /// Children in insertion order
    children: Vec<Resource>,
    versions: [u8; 6],
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node.as_ref().map(|n| n.core.id.as_str())
    }

    pub fn set_node(&mut self, mut node: Node) {
        node.core.version = tai_now();
        self.node = Some(node);
        self.bump(ResourceKind::Node);
    }

    /// Add or replace a resource, stamping a fresh version.
    pub fn add(&mut self, resource: Resource) {
        let mut resource = match resource {
            Resource::Node(node) => {
                self.set_node(node);
                return;
            }
            other => other,
        };

        resource.core_mut().version = tai_now();
        let kind = resource.kind();
        match self.children.iter_mut().find(|r| r.id() == resource.id()) {
            Some(existing) => *existing = resource,
            None => self.children.push(resource),
        }
        self.bump(kind);
    }

    /// Replace an existing resource. The id must already be present.
    pub fn update(&mut self, resource: Resource) -> Result<()> {
        let known = match &resource {
            Resource::Node(node) => self.node_id() == Some(node.core.id.as_str()),
            other => self.children.iter().any(|r| r.id() == other.id()),
        };
        if !known {
            return Err(Error::UnknownResource(resource.id().to_string()));
        }
        self.add(resource);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Resource> {
        if self.node_id() == Some(id) {
            return self.node.clone().map(Resource::Node);
        }
        self.children.iter().find(|r| r.id() == id).cloned()
    }

    pub fn kind_of(&self, id: &str) -> Option<ResourceKind> {
        if self.node_id() == Some(id) {
            return Some(ResourceKind::Node);
        }
        self.children.iter().find(|r| r.id() == id).map(Resource::kind)
    }

    pub fn list(&self, kind: ResourceKind) -> Vec<Resource> {
        if kind == ResourceKind::Node {
            return self.node.clone().map(Resource::Node).into_iter().collect();
        }
        self.children.iter().filter(|r| r.kind() == kind).cloned().collect()
    }

    pub fn versions(&self) -> [u8; 6] {
        self.versions
    }

    pub fn version(&self, kind: ResourceKind) -> u8 {
        self.versions[kind.index()]
    }

    fn bump(&mut self, kind: ResourceKind) {
        let counter = &mut self.versions[kind.index()];
        *counter = counter.wrapping_add(1);
    }

    /// Children in the order they must be registered: by kind
    /// (device, source, flow, sender, receiver), except that a resource
    /// always follows every local resource it references.
    ///
    /// Reference cycles cannot be satisfied; the remainder is appended in
    /// kind order.
    pub fn registration_order(&self) -> Vec<Resource> {
        let ids: HashSet<&str> = self.children.iter().map(Resource::id).collect();

        let mut pending: HashMap<usize, HashSet<&str>> = self
            .children
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let deps = r
                    .references()
                    .into_iter()
                    .filter(|dep| *dep != r.id() && ids.contains(dep))
                    .collect();
                (i, deps)
            })
            .collect();

        let rank = |i: usize| (self.children[i].kind(), i);
        let mut order = Vec::with_capacity(self.children.len());

        while !pending.is_empty() {
            let next = pending
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(i, _)| *i)
                .min_by_key(|i| rank(*i));

            let Some(next) = next else {
                let mut rest: Vec<usize> = pending.keys().copied().collect();
                rest.sort_by_key(|i| rank(*i));
                tracing::warn!("Resource references form a cycle; registering {} resources by kind", rest.len());
                order.extend(rest);
                break;
            };

            pending.remove(&next);
            let id = self.children[next].id();
            for deps in pending.values_mut() {
                deps.remove(id);
            }
            order.push(next);
        }

        order.into_iter().map(|i| self.children[i].clone()).collect()
    }
}

/// A resource store shared between the controller, its handles and the Node API.
#[derive(Debug, Clone, Default)]
pub struct SharedResources(Arc<RwLock<ResourceStore>>);

impl SharedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ResourceStore> {
        self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ResourceStore> {
        self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{device, flow, node, receiver, sender, source};

    fn ids(resources: &[Resource]) -> Vec<&str> {
        resources.iter().map(Resource::id).collect()
    }

    #[test]
    fn test_kind_order_without_cross_references() {
        let mut store = ResourceStore::new();
        store.set_node(node("n"));
        store.add(receiver("r", "d").into());
        store.add(sender("s", "d", Some("f")).into());
        store.add(flow("f", "src", "d").into());
        store.add(source("src", "d").into());
        store.add(device("d", "n").into());

        assert_eq!(ids(&store.registration_order()), vec!["d", "src", "f", "s", "r"]);
    }

    #[test]
    fn test_parent_source_precedes_child_source() {
        let mut store = ResourceStore::new();
        let mut child = source("child", "d");
        child.parents.push("parent".to_string());
        store.add(child.into());
        store.add(source("parent", "d").into());
        store.add(device("d", "n").into());

        assert_eq!(ids(&store.registration_order()), vec!["d", "parent", "child"]);
    }

    #[test]
    fn test_device_referencing_source_registers_after_it() {
        let mut store = ResourceStore::new();
        let mut dev = device("d", "n");
        dev.node_id = "src".to_string();
        store.add(dev.into());
        store.add(source("src", "elsewhere").into());

        assert_eq!(ids(&store.registration_order()), vec!["src", "d"]);
    }

    #[test]
    fn test_cycle_falls_back_to_kind_order() {
        let mut store = ResourceStore::new();
        store.add(source("a", "b").into());
        let mut dev = device("b", "a");
        dev.node_id = "a".to_string();
        store.add(dev.into());

        assert_eq!(ids(&store.registration_order()), vec!["b", "a"]);
    }

    #[test]
    fn test_version_counters_wrap() {
        let mut store = ResourceStore::new();
        for i in 0..257 {
            store.add(device(&format!("d{}", i % 2), "n").into());
        }
        assert_eq!(store.version(ResourceKind::Device), 1);
        assert_eq!(store.version(ResourceKind::Source), 0);
        assert_eq!(store.list(ResourceKind::Device).len(), 2);
    }

    #[test]
    fn test_update_requires_existing_id() {
        let mut store = ResourceStore::new();
        let err = store.update(device("d", "n").into()).unwrap_err();
        assert!(matches!(err, Error::UnknownResource(id) if id == "d"));

        store.add(device("d", "n").into());
        let mut changed = device("d", "n");
        changed.core.label = "renamed".to_string();
        store.update(changed.into()).unwrap();
        assert_eq!(store.get("d").unwrap().core().label, "renamed");
        assert_eq!(store.version(ResourceKind::Device), 2);
    }

    #[test]
    fn test_add_stamps_version() {
        let mut store = ResourceStore::new();
        store.set_node(node("n"));
        store.add(device("d", "n").into());
        assert!(!store.node().unwrap().core.version.is_empty());
        assert!(store.get("d").unwrap().core().version.contains(':'));
        assert_eq!(store.kind_of("n"), Some(ResourceKind::Node));
        assert_eq!(store.kind_of("d"), Some(ResourceKind::Device));
    }
}
