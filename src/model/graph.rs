use log::{debug, warn};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DuplicateEntityError, SchemaError};
use crate::model::{value_key, Entity, EntityId, EntityKey, SchemaRegistry};

/// Outcome of resolving a reference string against one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found(EntityId),
    NotFound,
    /// A short label shared by several entities.
    Ambiguous,
}

impl Lookup {
    pub fn found(self) -> Option<EntityId> {
        match self {
            Lookup::Found(id) => Some(id),
            _ => None,
        }
    }
}

/// Typed entity arena with the indexes adapters and resolution rely on.
/// Every adapter owns its graph; nothing is shared between graphs.
#[derive(Debug, Clone)]
pub struct EntityGraph {
    name: String,
    schema: Arc<SchemaRegistry>,
    entities: Vec<Entity>,
    primary: HashMap<(String, String), EntityId>,
    by_type: HashMap<String, Vec<EntityId>>,
    unique: HashMap<(String, String, String), EntityId>,
    short_labels: HashMap<(String, String), Vec<EntityId>>,
    roots: Vec<EntityId>,
}

impl EntityGraph {
    pub fn new(name: impl Into<String>, schema: Arc<SchemaRegistry>) -> Self {
        Self {
            name: name.into(),
            schema,
            entities: Vec::new(),
            primary: HashMap::new(),
            by_type: HashMap::new(),
            unique: HashMap::new(),
            short_labels: HashMap::new(),
            roots: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    /// Registers an entity and indexes it. Never overwrites.
    pub fn add(&mut self, entity: Entity) -> Result<EntityId, DuplicateEntityError> {
        let key = (entity.entity_type.clone(), entity.unique_id());
        if self.primary.contains_key(&key) {
            return Err(DuplicateEntityError {
                entity_type: key.0,
                unique_id: key.1,
            });
        }

        let id = EntityId(self.entities.len());
        if let Some(entity_type) = self.schema.get(&entity.entity_type) {
            for field in &entity_type.unique_fields {
                let Some(value) = entity.get(field).filter(|v| !v.is_null()) else {
                    continue;
                };
                let index_key = (entity.entity_type.clone(), field.clone(), value_key(value));
                if let Some(existing) = self.unique.get(&index_key) {
                    warn!(
                        "[{}] {} `{}` shares {}={} with {}; keeping the first",
                        self.name,
                        entity.entity_type,
                        key.1,
                        field,
                        index_key.2,
                        self.entities[existing.0].key()
                    );
                    continue;
                }
                self.unique.insert(index_key, id);
            }
            if let Some(label) = entity_type
                .short_label
                .as_ref()
                .and_then(|field| entity.get(field))
                .filter(|v| !v.is_null())
            {
                self.short_labels
                    .entry((entity.entity_type.clone(), value_key(label)))
                    .or_default()
                    .push(id);
            }
        }

        self.by_type.entry(entity.entity_type.clone()).or_default().push(id);
        self.primary.insert(key, id);
        self.roots.push(id);
        self.entities.push(entity);
        Ok(id)
    }

    /// Links `child` under `parent`, using the parent type's `children`
    /// mapping.
    pub fn add_child(&mut self, parent: EntityId, child: EntityId) -> Result<(), SchemaError> {
        let parent_type = self.entities[parent.0].entity_type.clone();
        let child_type = self.entities[child.0].entity_type.clone();
        let declared = self
            .schema
            .get(&parent_type)
            .is_some_and(|t| t.child_field(&child_type).is_some());
        if !declared {
            return Err(SchemaError::UndeclaredChild {
                parent: parent_type,
                child: child_type,
            });
        }

        self.entities[child.0].parent = Some(parent);
        self.roots.retain(|root| *root != child);
        self.entities[parent.0]
            .children
            .entry(child_type)
            .or_default()
            .push(child);
        Ok(())
    }

    pub fn get(&self, entity_type: &str, unique_id: &str) -> Option<EntityId> {
        self.primary
            .get(&(entity_type.to_string(), unique_id.to_string()))
            .copied()
    }

    pub fn get_key(&self, key: &EntityKey) -> Option<EntityId> {
        self.get(&key.entity_type, &key.unique_id)
    }

    pub fn entity(&self, id: EntityId) -> &Entity {
        &self.entities[id.0]
    }

    pub fn entity_mut(&mut self, id: EntityId) -> &mut Entity {
        &mut self.entities[id.0]
    }

    /// Resolves a reference: unique id first, then the type's unique
    /// fields, then its short label.
    pub fn lookup(&self, entity_type: &str, reference: &str) -> Lookup {
        if let Some(id) = self.get(entity_type, reference) {
            return Lookup::Found(id);
        }

        if let Some(schema_type) = self.schema.get(entity_type) {
            for field in &schema_type.unique_fields {
                if let Some(id) = self.by_unique_field(entity_type, field, reference) {
                    return Lookup::Found(id);
                }
            }
        }

        match self
            .short_labels
            .get(&(entity_type.to_string(), reference.to_string()))
            .map(Vec::as_slice)
        {
            Some([id]) => Lookup::Found(*id),
            Some([]) | None => Lookup::NotFound,
            Some(_) => Lookup::Ambiguous,
        }
    }

    pub fn by_unique_field(&self, entity_type: &str, field: &str, value: &str) -> Option<EntityId> {
        self.unique
            .get(&(entity_type.to_string(), field.to_string(), value.to_string()))
            .copied()
    }

    /// Live entities of a type, in registration order.
    pub fn entities_of<'a>(&'a self, entity_type: &str) -> impl Iterator<Item = (EntityId, &'a Entity)> + 'a {
        self.by_type
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|id| (*id, &self.entities[id.0]))
            .filter(|(_, entity)| entity.is_live())
    }

    /// All live entities, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities
            .iter()
            .enumerate()
            .filter(|(_, entity)| entity.is_live())
            .map(|(index, entity)| (EntityId(index), entity))
    }

    /// True when `ancestor` is `id` or one of its structural parents.
    pub fn is_descendant_of(&self, id: EntityId, ancestor: EntityId) -> bool {
        let mut current = Some(id);
        while let Some(next) = current {
            if next == ancestor {
                return true;
            }
            current = self.entities[next.0].parent;
        }
        false
    }

    /// Marks the entity deleted and drops it from every index.
    pub fn remove(&mut self, id: EntityId) {
        let entity = &self.entities[id.0];
        if !entity.is_live() {
            return;
        }
        let entity_type = entity.entity_type.clone();
        let unique_id = entity.unique_id();
        let parent = entity.parent;

        self.primary.remove(&(entity_type.clone(), unique_id.clone()));
        let released: Vec<(String, String, String)> = self
            .unique
            .iter()
            .filter(|(_, indexed)| **indexed == id)
            .map(|(index_key, _)| index_key.clone())
            .collect();
        for index_key in released {
            self.unique.remove(&index_key);
            self.reindex_unique(index_key, id);
        }
        for ids in self.short_labels.values_mut() {
            ids.retain(|indexed| *indexed != id);
        }
        self.roots.retain(|root| *root != id);
        if let Some(parent) = parent {
            for children in self.entities[parent.0].children.values_mut() {
                children.retain(|child| *child != id);
            }
        }
        self.entities[id.0].mark_deleted();
        debug!("[{}] removed {} `{}`", self.name, entity_type, unique_id);
    }

    /// Hands a released unique-field value to the next live entity of the
    /// type that carries it, in registration order.
    fn reindex_unique(&mut self, index_key: (String, String, String), released_by: EntityId) {
        let (entity_type, field, value) = &index_key;
        let successor = self.by_type.get(entity_type).and_then(|ids| {
            ids.iter().copied().find(|candidate| {
                let entity = &self.entities[candidate.0];
                *candidate != released_by
                    && entity.is_live()
                    && entity.get(field).is_some_and(|v| value_key(v) == *value)
            })
        });
        if let Some(successor) = successor {
            debug!(
                "[{}] {}={} now resolves to {}",
                self.name,
                field,
                value,
                self.entities[successor.0].key()
            );
            self.unique.insert(index_key, successor);
        }
    }

    /// SHA-256 over the canonical serialization of every live entity's
    /// identifiers and non-skipped attributes.
    pub fn fingerprint(&self) -> String {
        let mut rows: Vec<(EntityKey, Value)> = self
            .iter()
            .map(|(_, entity)| {
                let schema_type = self.schema.get(&entity.entity_type);
                let attributes: Map<String, Value> = entity
                    .attributes
                    .iter()
                    .filter(|(field, _)| !schema_type.is_some_and(|t| t.is_skipped(field)))
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect();
                let row = serde_json::json!({
                    "type": entity.entity_type,
                    "identifiers": entity.identifier_map(),
                    "attributes": attributes,
                });
                (entity.key(), row)
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        for (_, row) in rows {
            hasher.update(row.to_string().as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Nested document of the graph, loadable by `DocumentAdapter`.
    pub fn export(&self) -> Value {
        let mut document = Map::new();
        for root in &self.roots {
            let entity = &self.entities[root.0];
            if !entity.is_live() {
                continue;
            }
            let records = document
                .entry(entity.entity_type.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(records) = records {
                records.push(self.export_entity(*root));
            }
        }
        Value::Object(document)
    }

    fn export_entity(&self, id: EntityId) -> Value {
        let entity = &self.entities[id.0];
        let mut record: Map<String, Value> = entity.values().into_iter().collect();
        if let Some(schema_type) = self.schema.get(&entity.entity_type) {
            for (child_type, children) in &entity.children {
                let Some(field) = schema_type.child_field(child_type) else {
                    continue;
                };
                let nested = children
                    .iter()
                    .filter(|child| self.entities[child.0].is_live())
                    .map(|child| self.export_entity(*child))
                    .collect();
                record.insert(field.to_string(), Value::Array(nested));
            }
        }
        Value::Object(record)
    }
}
