//! Aggregated resources of directly discovered nodes.

use std::collections::BTreeMap;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::protocol::ResourceKind;
use crate::query::node_client::NodeSnapshot;
use crate::service::ServiceRecord;

/// What is known about one advertised node.
#[derive(Debug, Clone)]
pub struct NodeState {
    /// Node id, known once the node has been polled
    pub id: Option<String>,
    pub record: ServiceRecord,
    pub url: String,
    pub node: Option<Value>,
    pub children: BTreeMap<ResourceKind, Vec<Value>>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl NodeState {
    fn new(record: ServiceRecord) -> Self {
        Self {
            id: None,
            url: record.base_url(),
            record,
            node: None,
            children: BTreeMap::new(),
            fetched_at: None,
            last_updated: Utc::now(),
        }
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        let freshness = chrono::Duration::from_std(freshness).unwrap_or_default();
        self.fetched_at.map_or(true, |at| now - at > freshness)
    }

    fn resources(&self, kind: ResourceKind) -> Box<dyn Iterator<Item = &Value> + '_> {
        match kind {
            ResourceKind::Node => Box::new(self.node.iter()),
            kind => Box::new(self.children.get(&kind).into_iter().flatten()),
        }
    }
}

/// Merge `incoming` into `existing` by id: known ids are overwritten field
/// by field, new ids appended.
fn upsert_by_id(existing: &mut Vec<Value>, incoming: Vec<Value>) {
    for item in incoming {
        let Some(id) = item.get("id").and_then(Value::as_str) else {
            tracing::debug!("Dropping resource without id");
            continue;
        };
        match existing.iter_mut().find(|e| e.get("id").and_then(Value::as_str) == Some(id)) {
            Some(current) => overwrite(current, item),
            None => existing.push(item),
        }
    }
}

fn overwrite(current: &mut Value, incoming: Value) {
    match (current, incoming) {
        (Value::Object(current), Value::Object(incoming)) => {
            for (key, value) in incoming {
                current.insert(key, value);
            }
        }
        (current, incoming) => *current = incoming,
    }
}

/// Per-node state keyed by advertised service name.
#[derive(Debug, Default)]
pub struct NodeCache {
    entries: BTreeMap<String, NodeState>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&NodeState> {
        self.entries.get(name)
    }

    /// Record an announcement. Returns true if the node should be polled.
    pub fn observe(&mut self, record: ServiceRecord, now: DateTime<Utc>, freshness: Duration) -> bool {
        match self.entries.get_mut(&record.name) {
            Some(state) => {
                if state.record != record {
                    state.url = record.base_url();
                    state.record = record;
                }
                state.is_stale_at(now, freshness)
            }
            None => {
                self.entries.insert(record.name.clone(), NodeState::new(record));
                true
            }
        }
    }

    /// Merge a poll result. Returns false if the node went away meanwhile.
    pub fn apply(&mut self, name: &str, snapshot: NodeSnapshot, now: DateTime<Utc>) -> bool {
        if !self.entries.contains_key(name) {
            return false;
        }
        let node_id = snapshot.node.get("id").and_then(Value::as_str).map(str::to_string);

        // One entry per node id, whichever service name it is advertised under
        if let Some(id) = &node_id {
            self.entries
                .retain(|key, state| key == name || state.id.as_deref() != Some(id.as_str()));
        }

        let Some(state) = self.entries.get_mut(name) else {
            return false;
        };

        match &mut state.node {
            Some(current) => overwrite(current, snapshot.node),
            None => state.node = Some(snapshot.node),
        }
        for (kind, items) in snapshot.children {
            upsert_by_id(state.children.entry(kind).or_default(), items);
        }
        state.id = node_id;
        state.fetched_at = Some(now);
        state.last_updated = now;
        true
    }

    pub fn evict(&mut self, name: &str) -> Option<NodeState> {
        self.entries.remove(name)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stale(&self, now: DateTime<Utc>, freshness: Duration) -> Vec<ServiceRecord> {
        self.entries
            .values()
            .filter(|s| s.is_stale_at(now, freshness))
            .map(|s| s.record.clone())
            .collect()
    }

    /// Resources of `kind` across all nodes matching every filter.
    pub fn query(&self, kind: ResourceKind, params: &[(String, String)]) -> Vec<Value> {
        self.entries
            .values()
            .flat_map(|s| s.resources(kind))
            .filter(|r| matches_filters(r, params))
            .cloned()
            .collect()
    }

    pub fn find(&self, kind: ResourceKind, id: &str) -> Option<Value> {
        self.entries
            .values()
            .flat_map(|s| s.resources(kind))
            .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
            .cloned()
    }
}

/// Equality on dotted attribute paths; paging and query-control parameters
/// are not filters.
fn matches_filters(resource: &Value, params: &[(String, String)]) -> bool {
    params
        .iter()
        .filter(|(key, _)| !key.starts_with("paging.") && !key.starts_with("query."))
        .all(|(key, expected)| {
            let pointer = format!("/{}", key.replace('.', "/"));
            match resource.pointer(&pointer) {
                Some(Value::String(s)) => s == expected,
                Some(Value::Null) | None => false,
                Some(Value::Array(items)) => items.iter().any(|item| match item {
                    Value::String(s) => s == expected,
                    other => other.to_string() == *expected,
                }),
                Some(other) => other.to_string() == *expected,
            }
        })
}
