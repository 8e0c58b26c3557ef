use crate::core::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Attribute name to value, ordered by attribute name.
pub type Fields = BTreeMap<String, Value>;

/// Hierarchy link of a category-shaped entity.
pub const PARENT_FIELD: &str = "parent_category_id";
/// Position among siblings.
pub const ORDER_FIELD: &str = "display_order";
pub const ACTIVE_FIELD: &str = "is_active";

/// Opaque, stable identity of an entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh temporary id for an optimistic create.
    pub fn temporary(prefix: &str) -> Self {
        Self(format!("{}{}", prefix, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Key used by the view layer to identify a rendered row.
///
/// Equal to the entity id, except for rows born from an optimistic create:
/// those keep the temporary id as their render key after the server id
/// replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderKey(String);

impl RenderKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&EntityId> for RenderKey {
    fn from(id: &EntityId) -> Self {
        Self(id.0.clone())
    }
}

impl fmt::Display for RenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One record of the managed collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub fields: Fields,
    /// Logical version: the backend's `updated_at`, or the submission time
    /// for an optimistic local value.
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, fields: Fields, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            fields,
            updated_at,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Partial update: every given field replaces the current one, the rest
    /// is kept.
    pub fn merged(&self, patch: &Fields, updated_at: DateTime<Utc>) -> Entity {
        let mut fields = self.fields.clone();
        for (name, value) in patch {
            fields.insert(name.clone(), value.clone());
        }
        Entity {
            id: self.id.clone(),
            fields,
            updated_at,
        }
    }
}

/// Builder for the field map of a category-shaped entity.
#[derive(Debug, Clone, Default)]
pub struct EntityDraft {
    fields: Fields,
}

impl EntityDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: &str) -> Self {
        Self::new().name(name)
    }

    pub fn name(self, name: &str) -> Self {
        self.set("name", name)
    }

    pub fn description(self, description: Option<&str>) -> Self {
        self.set("description", description)
    }

    pub fn parent(self, parent: Option<&EntityId>) -> Self {
        self.set(PARENT_FIELD, parent.map(EntityId::as_str))
    }

    pub fn icon(self, icon: &str) -> Self {
        self.set("icon", icon)
    }

    pub fn color(self, color: &str) -> Self {
        self.set("color", color)
    }

    pub fn display_order(self, order: i64) -> Self {
        self.set(ORDER_FIELD, order)
    }

    pub fn active(self, active: bool) -> Self {
        self.set(ACTIVE_FIELD, active)
    }

    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn build(self) -> Fields {
        self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_partial() {
        let now = Utc::now();
        let entity = Entity::new(
            "a",
            EntityDraft::named("Tools").description(Some("hand tools")).build(),
            now,
        );
        let patch = EntityDraft::named("Hardware").build();
        let merged = entity.merged(&patch, now);

        assert_eq!(merged.text("name"), Some("Hardware"));
        assert_eq!(merged.text("description"), Some("hand tools"));
        assert_eq!(merged.id, entity.id);
    }

    #[test]
    fn test_temporary_ids_are_unique() {
        let a = EntityId::temporary("tmp-");
        let b = EntityId::temporary("tmp-");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("tmp-"));
    }

    #[test]
    fn test_draft_null_parent() {
        let fields = EntityDraft::named("Root").parent(None).build();
        assert!(fields["parent_category_id"].is_null());
    }
}
