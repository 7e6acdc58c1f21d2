use log::debug;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::error::SchemaError;
use crate::logic::flags::FlagController;
use crate::model::{
    is_falsy, value_key, AttrMap, Diff, Entity, EntityGraph, EntityId, EntityType, FieldKind, GlobalFlags,
    Instruction, ModelFlags, SchemaRegistry, SyncAction,
};

/// Computes the ordered instruction stream that turns `target` into
/// `source`.
///
/// Creates and updates are emitted type by type in dependency order, so a
/// referenced or enclosing entity always comes before the entities that
/// point at it. Instances of self-referencing types are ordered by depth.
/// Deletes follow in reverse dependency order.
pub struct Differ<'a> {
    schema: &'a SchemaRegistry,
    flags: &'a FlagController,
}

impl<'a> Differ<'a> {
    pub fn new(schema: &'a SchemaRegistry, flags: &'a FlagController) -> Self {
        Self { schema, flags }
    }

    pub fn diff(&self, source: &EntityGraph, target: &EntityGraph) -> Result<Diff, SchemaError> {
        let order = self.schema.dependency_order()?;
        let mut diff = Diff::new();

        for type_name in &order {
            let entity_type = self.schema.require(type_name)?;
            for id in self.ordered(source, entity_type) {
                if self.is_ignored(source, id) {
                    continue;
                }
                let entity = source.entity(id);
                match target.get(type_name, &entity.unique_id()) {
                    None if self.flags.skips_creates(entity) => {
                        debug!("not creating {} (unmatched source)", entity.key());
                    }
                    None => diff.push(create(source, id)),
                    Some(target_id) if self.is_ignored(target, target_id) => {}
                    Some(target_id) => {
                        if let Some(instruction) = self.update(entity_type, source, id, target, target_id) {
                            diff.push(instruction);
                        }
                    }
                }
            }
        }

        for type_name in order.iter().rev() {
            let entity_type = self.schema.require(type_name)?;
            let mut ids = self.ordered(target, entity_type);
            if !self.flags.type_flags(type_name).contains(ModelFlags::NATURAL_DELETION_ORDER) {
                ids.reverse();
            }
            for id in ids {
                let entity = target.entity(id);
                if source.get(type_name, &entity.unique_id()).is_some() || self.is_ignored(target, id) {
                    continue;
                }
                if self.flags.skips_deletes(entity) {
                    debug!("not deleting {} (unmatched target)", entity.key());
                    continue;
                }
                if self.removed_with_parent(source, target, id) {
                    debug!("{} goes with its parent", entity.key());
                    continue;
                }
                diff.push(Instruction {
                    action: SyncAction::Delete,
                    entity_type: entity.entity_type.clone(),
                    unique_id: entity.unique_id(),
                    identifiers: entity.identifier_map(),
                    attributes: AttrMap::new(),
                    before: entity.attributes.clone(),
                    parent: entity.parent.map(|p| target.entity(p).key()),
                });
            }
        }

        Ok(diff)
    }

    /// Live entities of a type, parents of the same type first.
    fn ordered(&self, graph: &EntityGraph, entity_type: &EntityType) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = graph.entities_of(&entity_type.name).map(|(id, _)| id).collect();
        let self_fields: Vec<&str> = entity_type
            .relations()
            .filter(|(_, kind)| kind.referenced_type() == Some(entity_type.name.as_str()))
            .map(|(field, _)| field)
            .collect();
        if !self_fields.is_empty() {
            ids.sort_by_cached_key(|id| depth(graph, *id, &entity_type.name, &self_fields));
        }
        ids
    }

    fn is_ignored(&self, graph: &EntityGraph, id: EntityId) -> bool {
        let mut current = Some(id);
        while let Some(next) = current {
            let entity = graph.entity(next);
            if self.flags.effective(entity).contains(ModelFlags::IGNORE) {
                return true;
            }
            current = entity.parent;
        }
        false
    }

    /// True when an ancestor is deleted too and carries
    /// `SKIP_CHILDREN_ON_DELETE`.
    fn removed_with_parent(&self, source: &EntityGraph, target: &EntityGraph, id: EntityId) -> bool {
        let mut current = target.entity(id).parent;
        while let Some(parent_id) = current {
            let parent = target.entity(parent_id);
            let deleted = source.get(&parent.entity_type, &parent.unique_id()).is_none();
            if deleted
                && !self.flags.skips_deletes(parent)
                && self.flags.effective(parent).contains(ModelFlags::SKIP_CHILDREN_ON_DELETE)
            {
                return true;
            }
            current = parent.parent;
        }
        false
    }

    fn update(
        &self,
        entity_type: &EntityType,
        source: &EntityGraph,
        source_id: EntityId,
        target: &EntityGraph,
        target_id: EntityId,
    ) -> Option<Instruction> {
        let entity = source.entity(source_id);
        let existing = target.entity(target_id);

        let mut attributes = AttrMap::new();
        let mut before = AttrMap::new();
        for field in entity_type.diffed_attributes() {
            let kind = entity_type.kind(field);
            let wanted = comparable(source, kind, entity.attributes.get(field));
            let current = comparable(target, kind, existing.attributes.get(field));
            if wanted == current {
                continue;
            }
            attributes.insert(field.to_string(), entity.attributes.get(field).cloned().unwrap_or(Value::Null));
            before.insert(field.to_string(), existing.attributes.get(field).cloned().unwrap_or(Value::Null));
            if let FieldKind::GenericRelation { identifiers, .. } = kind {
                for sibling in identifiers {
                    if let Some(value) = entity.get(sibling) {
                        attributes.entry(sibling.clone()).or_insert_with(|| value.clone());
                    }
                }
            }
        }

        let action = if !attributes.is_empty() {
            SyncAction::Update
        } else if self.flags.has_global(GlobalFlags::LOG_UNCHANGED_RECORDS) {
            SyncAction::NoChange
        } else {
            return None;
        };

        Some(Instruction {
            action,
            entity_type: entity.entity_type.clone(),
            unique_id: entity.unique_id(),
            identifiers: entity.identifier_map(),
            attributes,
            before,
            parent: entity.parent.map(|p| source.entity(p).key()),
        })
    }
}

fn create(source: &EntityGraph, id: EntityId) -> Instruction {
    let entity: &Entity = source.entity(id);
    Instruction {
        action: SyncAction::Create,
        entity_type: entity.entity_type.clone(),
        unique_id: entity.unique_id(),
        identifiers: entity.identifier_map(),
        attributes: entity.attributes.clone(),
        before: AttrMap::new(),
        parent: entity.parent.map(|p| source.entity(p).key()),
    }
}

/// Number of same-type references between an entity and its root.
fn depth(graph: &EntityGraph, id: EntityId, type_name: &str, self_fields: &[&str]) -> usize {
    let mut depth = 0;
    let mut current = id;
    while depth < graph.len() {
        let next = self_fields.iter().find_map(|field| {
            let value = graph.entity(current).attributes.get(*field)?;
            if is_falsy(value) {
                return None;
            }
            graph.lookup(type_name, &value_key(value)).found()
        });
        match next {
            Some(parent) if parent != current => {
                depth += 1;
                current = parent;
            }
            _ => break,
        }
    }
    depth
}

/// A field value in a form that compares equal across graphs: relations
/// become the unique ids they resolve to, falsy relations become null.
fn comparable(graph: &EntityGraph, kind: &FieldKind, value: Option<&Value>) -> Value {
    let value = match value {
        None => return Value::Null,
        Some(value) => value,
    };
    let target = match kind {
        FieldKind::Plain => return value.clone(),
        _ if is_falsy(value) => return Value::Null,
        FieldKind::ForeignKey { target } => target,
        FieldKind::GenericRelation { parent, .. } => parent,
        FieldKind::ManyToMany { target } => {
            let items = match value {
                Value::Array(items) => items.iter().collect::<Vec<_>>(),
                scalar => vec![scalar],
            };
            let resolved: BTreeSet<String> = items.into_iter().map(|v| resolve_key(graph, target, v)).collect();
            return Value::Array(resolved.into_iter().map(Value::String).collect());
        }
    };
    Value::String(resolve_key(graph, target, value))
}

fn resolve_key(graph: &EntityGraph, entity_type: &str, value: &Value) -> String {
    let reference = value_key(value);
    match graph.lookup(entity_type, &reference).found() {
        Some(id) => graph.entity(id).unique_id(),
        None => reference,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::GraphLoader;
    use crate::model::network_inventory;
    use serde_json::json;
    use std::sync::Arc;

    fn graph(schema: &Arc<SchemaRegistry>, name: &str, document: Value) -> EntityGraph {
        let mut graph = EntityGraph::new(name, schema.clone());
        GraphLoader::new(&mut graph).load_document(&document).unwrap();
        graph
    }

    fn no_flags(schema: &SchemaRegistry) -> FlagController {
        FlagController::new(Vec::<String>::new(), Vec::<(String, Vec<String>)>::new(), schema).unwrap()
    }

    fn actions(diff: &Diff) -> Vec<(SyncAction, String, String)> {
        diff.iter()
            .map(|i| (i.action, i.entity_type.clone(), i.unique_id.clone()))
            .collect()
    }

    fn site_document() -> Value {
        json!({
            "status": [{"slug": "active", "name": "Active"}],
            "site": [{
                "slug": "ams1",
                "name": "Amsterdam",
                "status": "active",
                "devices": [{"name": "edge-1", "status": "active"}]
            }]
        })
    }

    #[test]
    fn test_creates_follow_dependency_order() {
        let schema = Arc::new(network_inventory().unwrap());
        let source = graph(&schema, "source", site_document());
        let target = EntityGraph::new("target", schema.clone());

        let diff = Differ::new(&schema, &no_flags(&schema)).diff(&source, &target).unwrap();
        assert_eq!(
            actions(&diff),
            vec![
                (SyncAction::Create, "status".to_string(), "active".to_string()),
                (SyncAction::Create, "site".to_string(), "ams1".to_string()),
                (SyncAction::Create, "device".to_string(), "edge-1".to_string()),
            ]
        );
        let device = diff.iter().last().unwrap();
        assert_eq!(device.parent.as_ref().unwrap().unique_id, "ams1");
        assert_eq!(device.attributes["site"], json!("ams1"));
    }

    #[test]
    fn test_unchanged_graphs_produce_no_instructions() {
        let schema = Arc::new(network_inventory().unwrap());
        let source = graph(&schema, "source", site_document());
        let target = graph(&schema, "target", site_document());

        let differ_flags = no_flags(&schema);
        let diff = Differ::new(&schema, &differ_flags).diff(&source, &target).unwrap();
        assert!(diff.is_empty());

        let log_flags =
            FlagController::new(["LOG_UNCHANGED_RECORDS"], Vec::<(String, Vec<String>)>::new(), &schema).unwrap();
        let diff = Differ::new(&schema, &log_flags).diff(&source, &target).unwrap();
        assert_eq!(diff.len(), 3);
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_update_carries_changed_attributes_only() {
        let schema = Arc::new(network_inventory().unwrap());
        let source = graph(&schema, "source", site_document());
        let mut changed = site_document();
        changed["site"][0]["name"] = json!("AMS");
        let target = graph(&schema, "target", changed);

        let diff = Differ::new(&schema, &no_flags(&schema)).diff(&source, &target).unwrap();
        let update = diff.iter().next().unwrap();
        assert_eq!(update.action, SyncAction::Update);
        assert_eq!(update.attributes, [("name".to_string(), json!("Amsterdam"))].into_iter().collect());
        assert_eq!(update.before["name"], json!("AMS"));
    }

    #[test]
    fn test_relations_compare_by_resolved_entity() {
        let schema = Arc::new(network_inventory().unwrap());
        // the source names the status, the target stores its slug
        let mut by_name = site_document();
        by_name["site"][0]["status"] = json!("Active");
        let source = graph(&schema, "source", by_name);
        let target = graph(&schema, "target", site_document());

        let diff = Differ::new(&schema, &no_flags(&schema)).diff(&source, &target).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_deletes_run_after_creates_in_reverse_order() {
        let schema = Arc::new(network_inventory().unwrap());
        let source = graph(&schema, "source", json!({"status": [{"slug": "planned"}]}));
        let target = graph(&schema, "target", site_document());

        let diff = Differ::new(&schema, &no_flags(&schema)).diff(&source, &target).unwrap();
        assert_eq!(
            actions(&diff),
            vec![
                (SyncAction::Create, "status".to_string(), "planned".to_string()),
                (SyncAction::Delete, "device".to_string(), "edge-1".to_string()),
                (SyncAction::Delete, "site".to_string(), "ams1".to_string()),
                (SyncAction::Delete, "status".to_string(), "active".to_string()),
            ]
        );
    }

    #[test]
    fn test_skip_children_on_delete() {
        let schema = Arc::new(network_inventory().unwrap());
        let source = EntityGraph::new("source", schema.clone());
        let flags = FlagController::new(
            Vec::<String>::new(),
            [("site".to_string(), vec!["SKIP_CHILDREN_ON_DELETE".to_string()])],
            &schema,
        )
        .unwrap();
        let target = graph(&schema, "target", site_document());

        let diff = Differ::new(&schema, &flags).diff(&source, &target).unwrap();
        assert_eq!(
            actions(&diff),
            vec![
                (SyncAction::Delete, "site".to_string(), "ams1".to_string()),
                (SyncAction::Delete, "status".to_string(), "active".to_string()),
            ]
        );
    }

    #[test]
    fn test_ignore_tag_removes_subtree() {
        let schema = Arc::new(network_inventory().unwrap());
        let mut tagged = site_document();
        tagged["site"][0]["tags"] = json!(["IGNORE"]);
        let source = graph(&schema, "source", tagged);
        let target = EntityGraph::new("target", schema.clone());

        let diff = Differ::new(&schema, &no_flags(&schema)).diff(&source, &target).unwrap();
        assert_eq!(actions(&diff), vec![(SyncAction::Create, "status".to_string(), "active".to_string())]);
    }

    #[test]
    fn test_skip_unmatched_flags() {
        let schema = Arc::new(network_inventory().unwrap());
        let source = graph(&schema, "source", json!({"status": [{"slug": "planned"}]}));
        let target = graph(&schema, "target", json!({"status": [{"slug": "active"}]}));

        let flags = FlagController::new(["SKIP_UNMATCHED_DST"], Vec::<(String, Vec<String>)>::new(), &schema).unwrap();
        let diff = Differ::new(&schema, &flags).diff(&source, &target).unwrap();
        assert_eq!(actions(&diff), vec![(SyncAction::Create, "status".to_string(), "planned".to_string())]);

        let flags = FlagController::new(["SKIP_UNMATCHED_SRC"], Vec::<(String, Vec<String>)>::new(), &schema).unwrap();
        let diff = Differ::new(&schema, &flags).diff(&source, &target).unwrap();
        assert_eq!(actions(&diff), vec![(SyncAction::Delete, "status".to_string(), "active".to_string())]);
    }

    #[test]
    fn test_self_referencing_types_create_parents_first() {
        let schema = Arc::new(network_inventory().unwrap());
        // child listed before its parent
        let source = graph(
            &schema,
            "source",
            json!({"region": [
                {"slug": "nl", "parent": "eu"},
                {"slug": "eu"}
            ]}),
        );
        let target = EntityGraph::new("target", schema.clone());

        let diff = Differ::new(&schema, &no_flags(&schema)).diff(&source, &target).unwrap();
        assert_eq!(
            actions(&diff),
            vec![
                (SyncAction::Create, "region".to_string(), "eu".to_string()),
                (SyncAction::Create, "region".to_string(), "nl".to_string()),
            ]
        );
    }
}
