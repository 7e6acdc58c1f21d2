use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::LoadError;
use crate::model::{unique_id, AttrMap, EntityType, Handle, ModelFlags};

/// Position of an entity in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Pending,
    Persisted,
    /// Create rejected by the store. Terminal.
    Failed,
    /// Terminal.
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub unique_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, unique_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            unique_id: unique_id.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} `{}`", self.entity_type, self.unique_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub entity_type: String,
    /// Identifier values in schema order.
    pub identifiers: Vec<(String, Value)>,
    pub attributes: AttrMap,
    pub handle: Option<Handle>,
    pub parent: Option<EntityId>,
    pub children: BTreeMap<String, Vec<EntityId>>,
    pub model_flags: ModelFlags,
    pub state: EntityState,
}

impl Entity {
    /// Builds an entity from a flat field map. Fields the type does not
    /// declare are dropped; attributes that are absent stay absent.
    pub fn from_values(entity_type: &EntityType, values: &AttrMap) -> Result<Self, LoadError> {
        let identifiers = entity_type
            .identifiers
            .iter()
            .map(|field| match values.get(field) {
                Some(value) if !value.is_null() => Ok((field.clone(), value.clone())),
                _ => Err(LoadError::MissingIdentifier {
                    entity_type: entity_type.name.clone(),
                    field: field.clone(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let attributes = entity_type
            .attributes
            .iter()
            .filter_map(|field| values.get(field).map(|v| (field.clone(), v.clone())))
            .collect();

        Ok(Self {
            entity_type: entity_type.name.clone(),
            identifiers,
            attributes,
            handle: None,
            parent: None,
            children: BTreeMap::new(),
            model_flags: ModelFlags::NONE,
            state: EntityState::Pending,
        })
    }

    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self.state = EntityState::Persisted;
        self
    }

    pub fn unique_id(&self) -> String {
        unique_id(self.identifiers.iter().map(|(_, value)| value))
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.unique_id())
    }

    pub fn identifier_map(&self) -> AttrMap {
        self.identifiers.iter().cloned().collect()
    }

    /// Identifiers and attributes in one map.
    pub fn values(&self) -> AttrMap {
        let mut values = self.identifier_map();
        values.extend(self.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        values
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.identifiers
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
            .or_else(|| self.attributes.get(field))
    }

    pub fn is_live(&self) -> bool {
        self.state != EntityState::Deleted
    }

    pub fn mark_persisted(&mut self, handle: Handle) {
        self.handle = Some(handle);
        self.state = EntityState::Persisted;
    }

    pub fn mark_failed(&mut self) {
        self.state = EntityState::Failed;
    }

    pub fn mark_deleted(&mut self) {
        self.state = EntityState::Deleted;
    }

    pub fn apply_attributes(&mut self, attributes: &AttrMap) {
        for (field, value) in attributes {
            self.attributes.insert(field.clone(), value.clone());
        }
    }
}
