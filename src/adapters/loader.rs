use log::debug;
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::LoadError;
use crate::logic::flags::FlagController;
use crate::model::{unique_id, AttrMap, Entity, EntityGraph, EntityId, EntityType, FieldKind, SchemaRegistry};

/// Record field carrying per-instance model-flag tags.
pub const TAGS_FIELD: &str = "tags";

/// Walks a nested document `{type: [record, ...]}` into an entity graph.
/// Records may nest their children under the parent type's child fields.
pub struct GraphLoader<'g> {
    graph: &'g mut EntityGraph,
    schema: Arc<SchemaRegistry>,
    handle_field: Option<String>,
}

impl<'g> GraphLoader<'g> {
    pub fn new(graph: &'g mut EntityGraph) -> Self {
        let schema = graph.schema().clone();
        Self {
            graph,
            schema,
            handle_field: None,
        }
    }

    /// Read primary keys from `field` of every record.
    pub fn with_handles(mut self, field: &str) -> Self {
        self.handle_field = Some(field.to_string());
        self
    }

    pub fn load_document(&mut self, document: &Value) -> Result<usize, LoadError> {
        let Value::Object(types) = document else {
            return Err(LoadError::Malformed {
                entity_type: "document".to_string(),
                reason: "expected an object keyed by entity type".to_string(),
            });
        };

        let schema = Arc::clone(&self.schema);
        let mut loaded = 0;
        for (type_name, records) in types {
            let entity_type = schema
                .get(type_name)
                .ok_or_else(|| LoadError::UnknownType(type_name.clone()))?;
            for record in as_records(entity_type, records)? {
                self.load_record(&schema, entity_type, record, None)?;
                loaded += 1;
            }
        }
        debug!("[{}] loaded {} top-level records", self.graph.name(), loaded);
        Ok(loaded)
    }

    fn load_record(
        &mut self,
        schema: &SchemaRegistry,
        entity_type: &EntityType,
        record: &Value,
        parent: Option<EntityId>,
    ) -> Result<EntityId, LoadError> {
        let Value::Object(fields) = record else {
            return Err(malformed(entity_type, "record is not an object"));
        };

        let mut values = AttrMap::new();
        for field in entity_type.fields() {
            let Some(value) = fields.get(field) else {
                continue;
            };
            let mut value = flatten_references(schema, entity_type, field, value)?;
            if let Some(normalizer) = entity_type.normalizer(field) {
                value = normalizer.apply(value);
            }
            values.insert(field.to_string(), value);
        }

        if let Some(parent) = parent {
            let parent_entity = self.graph.entity(parent);
            if let Some(field) = entity_type.field_referencing(&parent_entity.entity_type) {
                if values.get(field).map_or(true, Value::is_null) {
                    values.insert(field.to_string(), Value::String(parent_entity.unique_id()));
                }
            }
        }

        let mut entity = Entity::from_values(entity_type, &values)?;
        if let Some(handle) = self.read_handle(entity_type, fields)? {
            entity = entity.with_handle(handle);
        }
        if let Some(tags) = fields.get(TAGS_FIELD) {
            FlagController::apply_tags(&mut entity, tags);
        }

        let id = self.graph.add(entity)?;
        if let Some(parent) = parent {
            self.graph
                .add_child(parent, id)
                .map_err(|e| malformed(entity_type, &e.to_string()))?;
        }

        for child in &entity_type.children {
            let Some(nested) = fields.get(&child.field) else {
                continue;
            };
            let child_type = schema
                .get(&child.child_type)
                .ok_or_else(|| LoadError::UnknownType(child.child_type.clone()))?;
            for child_record in as_records(child_type, nested)? {
                self.load_record(schema, child_type, child_record, Some(id))?;
            }
        }

        Ok(id)
    }

    fn read_handle(&self, entity_type: &EntityType, fields: &Map<String, Value>) -> Result<Option<Uuid>, LoadError> {
        let Some(field) = &self.handle_field else {
            return Ok(None);
        };
        match fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(raw)) => Uuid::parse_str(raw)
                .map(Some)
                .map_err(|e| malformed(entity_type, &format!("invalid handle `{raw}`: {e}"))),
            Some(other) => Err(malformed(entity_type, &format!("invalid handle {other}"))),
        }
    }
}

fn as_records<'v>(entity_type: &EntityType, value: &'v Value) -> Result<&'v [Value], LoadError> {
    match value {
        Value::Array(records) => Ok(records),
        Value::Null => Ok(&[]),
        _ => Err(malformed(entity_type, "expected a list of records")),
    }
}

fn malformed(entity_type: &EntityType, reason: &str) -> LoadError {
    LoadError::Malformed {
        entity_type: entity_type.name.clone(),
        reason: reason.to_string(),
    }
}

/// Nested reference objects become the referenced entity's unique id, or
/// its short label when the object does not carry every identifier.
fn flatten_references(
    schema: &SchemaRegistry,
    entity_type: &EntityType,
    field: &str,
    value: &Value,
) -> Result<Value, LoadError> {
    let kind = entity_type.kind(field);
    let Some(target) = kind.referenced_type().and_then(|t| schema.get(t)) else {
        return Ok(value.clone());
    };
    match (kind, value) {
        (FieldKind::ManyToMany { .. }, Value::Array(items)) => items
            .iter()
            .map(|item| flatten_one(entity_type, field, target, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        _ => flatten_one(entity_type, field, target, value),
    }
}

fn flatten_one(entity_type: &EntityType, field: &str, target: &EntityType, value: &Value) -> Result<Value, LoadError> {
    let Value::Object(reference) = value else {
        return Ok(value.clone());
    };
    let identifiers: Option<Vec<&Value>> = target.identifiers.iter().map(|f| reference.get(f)).collect();
    if let Some(identifiers) = identifiers {
        return Ok(Value::String(unique_id(identifiers)));
    }
    target
        .short_label
        .as_ref()
        .and_then(|label| reference.get(label))
        .cloned()
        .ok_or_else(|| malformed(entity_type, &format!("cannot read a {} reference from `{field}`", target.name)))
}
