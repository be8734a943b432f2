use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type Object = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Field {field} of {key} is not an integer")]
    NotAnInteger { key: String, field: String },
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Shared key-value store. No transactions: the only atomic primitives the
/// rest of the crate relies on are [`RecordStore::increment_object_field_by`]
/// and [`RecordStore::decrement_object_field_and_prune`].
///
/// Implementations must hand out owned copies so that a caller mutating a
/// returned object never alters stored state.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_object(&self, key: &str) -> Result<Option<Object>, StoreError>;
    async fn set_object(&self, key: &str, object: Object) -> Result<(), StoreError>;
    async fn get_object_field(&self, key: &str, field: &str) -> Result<Option<Value>, StoreError>;
    async fn set_object_field(&self, key: &str, field: &str, value: Value)
        -> Result<(), StoreError>;
    async fn delete_object_field(&self, key: &str, field: &str) -> Result<(), StoreError>;
    /// Atomically add `delta` to an integer field (missing counts as 0) and
    /// return the new value.
    async fn increment_object_field_by(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError>;
    /// Atomically subtract one from an integer field and remove the field
    /// once it is no longer positive. Returns the remaining count (never
    /// below zero).
    async fn decrement_object_field_and_prune(
        &self,
        key: &str,
        field: &str,
    ) -> Result<i64, StoreError>;
    async fn increment_object_fields_bulk(
        &self,
        updates: Vec<(String, Vec<(String, i64)>)>,
    ) -> Result<(), StoreError> {
        for (key, fields) in updates {
            for (field, delta) in fields {
                self.increment_object_field_by(&key, &field, delta).await?;
            }
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_add_many(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        for member in members {
            self.set_add(key, member).await?;
        }
        Ok(())
    }
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn is_set_member(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError>;
    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<String, Object>,
    sets: HashMap<String, HashSet<String>>,
    sorted_sets: HashMap<String, BTreeMap<String, i64>>,
}

/// In-process store used by the CLI and the test-suite.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_members(&self, key: &str) -> Vec<String> {
        let state = self.state.read().await;
        let mut members: Vec<String> = state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_object(&self, key: &str) -> Result<Option<Object>, StoreError> {
        Ok(self.state.read().await.objects.get(key).cloned())
    }

    async fn set_object(&self, key: &str, object: Object) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let entry = state.objects.entry(key.to_string()).or_default();
        for (field, value) in object {
            entry.insert(field, value);
        }
        Ok(())
    }

    async fn get_object_field(&self, key: &str, field: &str) -> Result<Option<Value>, StoreError> {
        let state = self.state.read().await;
        Ok(state.objects.get(key).and_then(|o| o.get(field)).cloned())
    }

    async fn set_object_field(
        &self,
        key: &str,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .objects
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn delete_object_field(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(object) = state.objects.get_mut(key) {
            object.remove(field);
        }
        Ok(())
    }

    async fn increment_object_field_by(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.write().await;
        let object = state.objects.entry(key.to_string()).or_default();
        let current = integer_field(object, key, field)?;
        let updated = current + delta;
        object.insert(field.to_string(), Value::from(updated));
        Ok(updated)
    }

    async fn decrement_object_field_and_prune(
        &self,
        key: &str,
        field: &str,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.write().await;
        let Some(object) = state.objects.get_mut(key) else {
            return Ok(0);
        };
        let updated = integer_field(object, key, field)? - 1;
        if updated > 0 {
            object.insert(field.to_string(), Value::from(updated));
            Ok(updated)
        } else {
            object.remove(field);
            Ok(0)
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn is_set_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let state = self.state.read().await;
        Ok(state.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .sorted_sets
            .get(key)
            .and_then(|s| s.get(member))
            .copied())
    }
}

fn integer_field(object: &Object, key: &str, field: &str) -> Result<i64, StoreError> {
    let not_an_integer = || StoreError::NotAnInteger {
        key: key.to_string(),
        field: field.to_string(),
    };
    match object.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(not_an_integer),
        Some(Value::String(s)) => s.parse().map_err(|_| not_an_integer()),
        Some(_) => Err(not_an_integer()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_increment_creates_and_counts() {
        let store = MemoryStore::new();
        assert_eq!(store.increment_object_field_by("k", "f", 1).await.unwrap(), 1);
        assert_eq!(store.increment_object_field_by("k", "f", 1).await.unwrap(), 2);
        assert_eq!(store.increment_object_field_by("k", "f", -3).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_increment_rejects_non_integer() {
        let store = MemoryStore::new();
        store.set_object_field("k", "f", json!("abc")).await.unwrap();
        assert!(matches!(
            store.increment_object_field_by("k", "f", 1).await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test]
    async fn test_decrement_and_prune() {
        let store = MemoryStore::new();
        assert_eq!(store.decrement_object_field_and_prune("k", "f").await.unwrap(), 0);
        store.increment_object_field_by("k", "f", 2).await.unwrap();
        assert_eq!(store.decrement_object_field_and_prune("k", "f").await.unwrap(), 1);
        assert_eq!(store.decrement_object_field_and_prune("k", "f").await.unwrap(), 0);
        assert!(store.get_object_field("k", "f").await.unwrap().is_none());

        store.set_object_field("k", "f", json!(-4)).await.unwrap();
        assert_eq!(store.decrement_object_field_and_prune("k", "f").await.unwrap(), 0);
        assert!(store.get_object_field("k", "f").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_returned_objects_are_copies() {
        let store = MemoryStore::new();
        let mut object = Object::new();
        object.insert("toArray".into(), json!([{ "to": "a@b.c" }]));
        store.set_object("rec", object).await.unwrap();

        let mut copy = store.get_object("rec").await.unwrap().unwrap();
        copy["toArray"][0]["to"] = json!("mutated");

        let fresh = store.get_object("rec").await.unwrap().unwrap();
        assert_eq!(fresh["toArray"][0]["to"], json!("a@b.c"));
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        store.set_add("s", "a").await.unwrap();
        assert!(store.is_set_member("s", "a").await.unwrap());
        store.set_remove("s", "a").await.unwrap();
        assert!(!store.is_set_member("s", "a").await.unwrap());
        store
            .set_add_many("s", &["x".to_string(), "y".to_string()])
            .await
            .unwrap();
        assert_eq!(store.set_members("s").await, vec!["x", "y"]);
    }
}
