use super::QueryKey;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeSet;

/// Bidirectional index between entity ids and the cache keys whose values
/// embed a copy of that entity.
#[derive(Debug, Default)]
pub struct EntityIndex {
    entity_to_keys: DashMap<String, BTreeSet<QueryKey>>,
    key_to_entities: DashMap<QueryKey, BTreeSet<String>>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set of entities recorded for `key`
    pub fn update(&self, key: &QueryKey, entities: BTreeSet<String>) {
        self.remove_key(key);
        if entities.is_empty() {
            return;
        }

        for entity in &entities {
            self.entity_to_keys
                .entry(entity.clone())
                .or_default()
                .insert(key.clone());
        }
        self.key_to_entities.insert(key.clone(), entities);
    }

    /// Forget everything recorded for `key`
    pub fn remove_key(&self, key: &QueryKey) {
        if let Some((_, entities)) = self.key_to_entities.remove(key) {
            for entity in entities {
                if let Some(mut keys) = self.entity_to_keys.get_mut(&entity) {
                    keys.remove(key);
                    if keys.is_empty() {
                        drop(keys);
                        self.entity_to_keys.remove(&entity);
                    }
                }
            }
        }
    }

    /// Keys whose value contains the entity, in key order
    pub fn keys_for(&self, entity_id: &str) -> Vec<QueryKey> {
        self.entity_to_keys
            .get(entity_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entities_for(&self, key: &QueryKey) -> BTreeSet<String> {
        self.key_to_entities
            .get(key)
            .map(|entities| entities.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.entity_to_keys.clear();
        self.key_to_entities.clear();
    }

    /// `(indexed entities, indexed keys)`
    pub fn stats(&self) -> (usize, usize) {
        (self.entity_to_keys.len(), self.key_to_entities.len())
    }
}

/// Ids of every JSON object with an `"id"` field, at any depth
pub fn collect_entity_ids(value: &Value) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    walk(value, &mut ids);
    ids
}

fn walk(value: &Value, ids: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            match map.get("id") {
                Some(Value::String(id)) => {
                    ids.insert(id.clone());
                }
                Some(Value::Number(id)) => {
                    ids.insert(id.to_string());
                }
                _ => {}
            }
            for child in map.values() {
                walk(child, ids);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, ids);
            }
        }
        _ => {}
    }
}
