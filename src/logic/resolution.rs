use itertools::Itertools;
use log::debug;
use serde_json::Value;

use crate::error::{
    DependencyFailedError, StaleReferenceError, StoreError, SyncError, UnresolvedReason, UnresolvedReferenceError,
    ValidationError,
};
use crate::model::{
    is_falsy, value_key, AttrMap, ColumnValue, Entity, EntityGraph, EntityId, EntityKey, EntityState, EntityType,
    FieldKind, Handle, Lookup, PersistedRecord, RecordFilter, SchemaRegistry, UNIQUE_ID_SEPARATOR,
};
use crate::store::RecordStore;

/// Applies create, update and delete instructions to a record store.
///
/// Relation fields arrive as references (unique ids, unique field values
/// or short labels) and are resolved through the target graph, which holds
/// the handles of everything already persisted. A successful create
/// registers the new entity in that graph, so later instructions can point
/// at it.
pub struct RelationalResolver<'a, S: RecordStore + ?Sized> {
    schema: &'a SchemaRegistry,
    store: &'a S,
}

/// Who is asking, for error reporting.
struct Subject<'e> {
    entity_type: &'e EntityType,
    unique_id: &'e str,
}

impl<'a, S: RecordStore + ?Sized> RelationalResolver<'a, S> {
    pub fn new(schema: &'a SchemaRegistry, store: &'a S) -> Self {
        Self { schema, store }
    }

    pub async fn create(
        &self,
        graph: &mut EntityGraph,
        entity_type: &str,
        identifiers: &AttrMap,
        attributes: &AttrMap,
        parent: Option<&EntityKey>,
    ) -> Result<Handle, SyncError> {
        let entity_type = self.schema.require(entity_type)?;
        let table = entity_type.table()?;

        let mut values = identifiers.clone();
        values.extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut entity = Entity::from_values(entity_type, &values)?;
        let unique_id = entity.unique_id();
        let subject = Subject {
            entity_type,
            unique_id: &unique_id,
        };

        let mut record = PersistedRecord::new();
        let outcome = match self.assign(graph, &subject, &mut record, &values, &values, false) {
            Ok(()) => match self.store.save(table, record).await {
                Ok(saved) => Ok(saved.handle.ok_or_else(|| missing_handle(table))?),
                Err(StoreError::Validation { message, .. }) => Err(SyncError::from(ValidationError {
                    entity_type: entity_type.name.clone(),
                    unique_id: unique_id.clone(),
                    table: table.to_string(),
                    message,
                })),
                Err(err) => return Err(SyncError::Store(err)),
            },
            // registered as failed too, so its own dependents fail the same way
            Err(err @ SyncError::DependencyFailed(_)) => Err(err),
            Err(err) => return Err(err),
        };

        match outcome {
            Ok(handle) => entity.mark_persisted(handle),
            Err(_) => entity.mark_failed(),
        }
        let id = graph.add(entity)?;
        if let Some(parent_id) = parent.and_then(|key| graph.get_key(key)) {
            let parent_type = &graph.entity(parent_id).entity_type;
            let declared = self
                .schema
                .get(parent_type)
                .is_some_and(|t| t.child_field(&entity_type.name).is_some());
            if declared {
                graph.add_child(parent_id, id)?;
            }
        }

        let handle = outcome?;
        debug!("created {} `{}` as {}", entity_type.name, unique_id, handle);
        Ok(handle)
    }

    /// Applies a partial attribute map. Collections are replaced, so a
    /// repeated update converges.
    pub async fn update(
        &self,
        graph: &mut EntityGraph,
        entity_type: &str,
        unique_id: &str,
        attributes: &AttrMap,
    ) -> Result<Handle, SyncError> {
        let entity_type = self.schema.require(entity_type)?;
        let table = entity_type.table()?;
        let subject = Subject {
            entity_type,
            unique_id,
        };

        let id = graph
            .get(&entity_type.name, unique_id)
            .ok_or_else(|| stale(&subject, "not present in the target graph".to_string()))?;
        let current = graph.entity(id).values();

        let filter = self.identifier_filter(graph, &subject, &current)?;
        let mut record = self
            .store
            .find_one(table, &filter)
            .await
            .map_err(SyncError::Store)?
            .ok_or_else(|| stale(&subject, format!("no matching record in `{table}`")))?;

        let mut siblings = current;
        siblings.extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.assign(graph, &subject, &mut record, attributes, &siblings, true)?;

        let saved = match self.store.save(table, record).await {
            Ok(saved) => saved,
            Err(StoreError::Validation { message, .. }) => {
                return Err(ValidationError {
                    entity_type: entity_type.name.clone(),
                    unique_id: unique_id.to_string(),
                    table: table.to_string(),
                    message,
                }
                .into())
            }
            Err(err) => return Err(SyncError::Store(err)),
        };
        let handle = saved.handle.ok_or_else(|| missing_handle(table))?;

        let entity = graph.entity_mut(id);
        entity.apply_attributes(attributes);
        entity.mark_persisted(handle);
        debug!("updated {} `{}`", entity_type.name, unique_id);
        Ok(handle)
    }

    /// Deletes by recorded handle only.
    pub async fn delete(&self, graph: &mut EntityGraph, entity_type: &str, unique_id: &str) -> Result<Handle, SyncError> {
        let entity_type = self.schema.require(entity_type)?;
        let table = entity_type.table()?;
        let subject = Subject {
            entity_type,
            unique_id,
        };

        let id = graph
            .get(&entity_type.name, unique_id)
            .ok_or_else(|| stale(&subject, "not present in the target graph".to_string()))?;
        let handle = graph
            .entity(id)
            .handle
            .ok_or_else(|| stale(&subject, "no primary key was recorded".to_string()))?;

        let deleted = self.store.delete(table, handle).await.map_err(SyncError::Store)?;
        if !deleted {
            return Err(stale(&subject, format!("record {handle} is already gone from `{table}`")).into());
        }
        graph.remove(id);
        debug!("deleted {} `{}`", entity_type.name, unique_id);
        Ok(handle)
    }

    /// Deletes the entity after the records nested under it that still
    /// point at it through their parent field. A child re-parented by an
    /// earlier update keeps its record.
    pub async fn delete_with_children(
        &self,
        graph: &mut EntityGraph,
        entity_type: &str,
        unique_id: &str,
    ) -> Result<Handle, SyncError> {
        if let Some(id) = graph.get(entity_type, unique_id) {
            let attached = self.attached_descendants(graph, id).await?;
            // deepest first
            for child_id in attached.into_iter().rev() {
                let child = graph.entity(child_id);
                let child_type = self.schema.require(&child.entity_type)?;
                let table = child_type.table()?;
                let Some(handle) = child.handle else {
                    continue;
                };
                let key = child.key();
                self.store.delete(table, handle).await.map_err(SyncError::Store)?;
                graph.remove(child_id);
                debug!("deleted {} along with {} `{}`", key, entity_type, unique_id);
            }
        }
        self.delete(graph, entity_type, unique_id).await
    }

    /// Persisted descendants of `root` whose stored parent field still
    /// holds their graph parent's handle, parents before their children.
    async fn attached_descendants(&self, graph: &EntityGraph, root: EntityId) -> Result<Vec<EntityId>, SyncError> {
        let mut attached = Vec::new();
        let mut pending = vec![root];
        while let Some(parent_id) = pending.pop() {
            let parent = graph.entity(parent_id);
            let Some(parent_handle) = parent.handle else {
                continue;
            };
            for &child_id in parent.children.values().flatten() {
                let child = graph.entity(child_id);
                let Some(handle) = child.handle.filter(|_| child.is_live()) else {
                    continue;
                };
                let child_type = self.schema.require(&child.entity_type)?;
                let Some(field) = child_type.field_referencing(&parent.entity_type) else {
                    continue;
                };
                let record = self
                    .store
                    .get(child_type.table()?, handle)
                    .await
                    .map_err(SyncError::Store)?;
                let points_at_parent = record
                    .as_ref()
                    .and_then(|r| r.field(&child_type.column(field)))
                    .and_then(ColumnValue::handle)
                    == Some(parent_handle);
                if points_at_parent {
                    attached.push(child_id);
                    pending.push(child_id);
                }
            }
        }
        Ok(attached)
    }

    fn assign(
        &self,
        graph: &EntityGraph,
        subject: &Subject<'_>,
        record: &mut PersistedRecord,
        fields: &AttrMap,
        siblings: &AttrMap,
        replace_collections: bool,
    ) -> Result<(), SyncError> {
        let entity_type = subject.entity_type;
        for (field, value) in fields {
            if entity_type.is_skipped(field) || !entity_type.declares(field) {
                continue;
            }
            match entity_type.kind(field) {
                FieldKind::Plain => record.set_scalar(field, value.clone()),
                _ if is_falsy(value) => {
                    // relation left unset; it can never be cleared this way
                    debug!(
                        "{} `{}`: `{}` is empty, leaving the relation unset",
                        entity_type.name, subject.unique_id, field
                    );
                }
                FieldKind::ForeignKey { target } => {
                    let handle = self.resolve(graph, subject, field, target, value)?;
                    record.set_foreign_key(field, handle);
                }
                FieldKind::ManyToMany { target } => match value {
                    Value::Array(items) => {
                        let handles = items
                            .iter()
                            .map(|item| self.resolve(graph, subject, field, target, item))
                            .collect::<Result<Vec<_>, _>>()?;
                        if replace_collections {
                            record.set_links(field, handles);
                        } else {
                            for handle in handles {
                                record.add_link(field, handle);
                            }
                        }
                    }
                    scalar => {
                        let handle = self.resolve(graph, subject, field, target, scalar)?;
                        record.set_links(field, [handle]);
                    }
                },
                FieldKind::GenericRelation {
                    parent,
                    identifiers,
                    attr,
                } => {
                    let key = self.generic_key(subject, field, parent, identifiers, siblings)?;
                    let handle = self.resolve(graph, subject, field, parent, &Value::String(key))?;
                    record.set_generic(attr, parent, handle);
                }
            }
        }
        Ok(())
    }

    fn generic_key(
        &self,
        subject: &Subject<'_>,
        field: &str,
        parent: &str,
        identifiers: &[String],
        siblings: &AttrMap,
    ) -> Result<String, SyncError> {
        let mut parts = Vec::with_capacity(identifiers.len());
        for sibling in identifiers {
            match siblings.get(sibling) {
                Some(value) if !value.is_null() => parts.push(value_key(value)),
                _ => {
                    return Err(unresolved(
                        subject,
                        field,
                        parent,
                        format!("<missing `{sibling}`>"),
                        UnresolvedReason::NotFound,
                    ))
                }
            }
        }
        Ok(parts.iter().join(UNIQUE_ID_SEPARATOR))
    }

    /// Identifier values as a record filter; relation identifiers are
    /// resolved to handles first.
    fn identifier_filter(
        &self,
        graph: &EntityGraph,
        subject: &Subject<'_>,
        values: &AttrMap,
    ) -> Result<RecordFilter, SyncError> {
        let entity_type = subject.entity_type;
        let mut filter = RecordFilter::new();
        for field in &entity_type.identifiers {
            let Some(value) = values.get(field) else {
                continue;
            };
            filter = match entity_type.kind(field) {
                FieldKind::Plain => filter.eq(field, ColumnValue::Scalar(value.clone())),
                FieldKind::ForeignKey { target } => {
                    let handle = self.resolve(graph, subject, field, target, value)?;
                    filter.eq(field, ColumnValue::ForeignKey(handle))
                }
                FieldKind::ManyToMany { target } => {
                    let handle = self.resolve(graph, subject, field, target, value)?;
                    filter.linked(field, handle)
                }
                FieldKind::GenericRelation {
                    parent,
                    identifiers,
                    attr,
                } => {
                    let key = self.generic_key(subject, field, parent, identifiers, values)?;
                    let handle = self.resolve(graph, subject, field, parent, &Value::String(key))?;
                    filter.eq(
                        attr,
                        ColumnValue::Generic {
                            entity_type: parent.clone(),
                            handle,
                        },
                    )
                }
            };
        }
        Ok(filter)
    }

    fn resolve(
        &self,
        graph: &EntityGraph,
        subject: &Subject<'_>,
        field: &str,
        target_type: &str,
        value: &Value,
    ) -> Result<Handle, SyncError> {
        let reference = value_key(value);
        let id = match graph.lookup(target_type, &reference) {
            Lookup::Found(id) => id,
            Lookup::NotFound => {
                return Err(unresolved(subject, field, target_type, reference, UnresolvedReason::NotFound))
            }
            Lookup::Ambiguous => {
                return Err(unresolved(subject, field, target_type, reference, UnresolvedReason::Ambiguous))
            }
        };

        let target = graph.entity(id);
        if target.state == EntityState::Failed {
            return Err(DependencyFailedError {
                entity_type: subject.entity_type.name.clone(),
                unique_id: subject.unique_id.to_string(),
                dependency_type: target_type.to_string(),
                dependency: target.unique_id(),
            }
            .into());
        }
        target
            .handle
            .ok_or_else(|| unresolved(subject, field, target_type, reference, UnresolvedReason::NotPersisted))
    }
}

fn unresolved(subject: &Subject<'_>, field: &str, target_type: &str, value: String, reason: UnresolvedReason) -> SyncError {
    UnresolvedReferenceError {
        entity_type: subject.entity_type.name.clone(),
        unique_id: subject.unique_id.to_string(),
        field: field.to_string(),
        target_type: target_type.to_string(),
        value,
        reason,
    }
    .into()
}

fn stale(subject: &Subject<'_>, reason: String) -> StaleReferenceError {
    StaleReferenceError {
        entity_type: subject.entity_type.name.clone(),
        unique_id: subject.unique_id.to_string(),
        reason,
    }
}

fn missing_handle(table: &str) -> SyncError {
    SyncError::Store(StoreError::Backend(anyhow::anyhow!(
        "`{table}` returned a saved record without a handle"
    )))
}
