use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::SchemaError;
use crate::model::TableDef;

/// Value clean-up applied by adapters before a field is stored on an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalizer {
    /// `"ACCESS"` -> `"access"`
    Lowercase,
    /// `"A_1000BASE_T"` -> `"1000base-t"` with `strip_prefix = "A_"`
    Slug {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strip_prefix: Option<String>,
    },
}

impl Normalizer {
    pub fn apply(&self, value: Value) -> Value {
        let Value::String(text) = value else {
            return value;
        };
        match self {
            Normalizer::Lowercase => Value::String(text.to_lowercase()),
            Normalizer::Slug { strip_prefix } => {
                let stripped = strip_prefix
                    .as_deref()
                    .and_then(|prefix| text.strip_prefix(prefix))
                    .unwrap_or(&text);
                Value::String(stripped.to_lowercase().replace('_', "-"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericRelationDef {
    /// Entity type the relation points at
    pub parent: String,
    /// Sibling fields whose values, joined, form the target's unique id
    pub identifiers: Vec<String>,
    /// Record attribute that receives the resolved object
    pub attr: String,
}

/// Declarative form of an entity type, as written in schema files.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityTypeDef {
    pub name: String,
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Child type name -> attribute holding the children
    #[serde(default)]
    pub children: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_label: Option<String>,
    #[serde(default)]
    pub unique_fields: Vec<String>,
    #[serde(default)]
    pub skip: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub foreign_key: BTreeMap<String, String>,
    #[serde(default)]
    pub many_to_many: BTreeMap<String, String>,
    #[serde(default)]
    pub generic_relation: BTreeMap<String, GenericRelationDef>,
    #[serde(default)]
    pub normalize: BTreeMap<String, Normalizer>,
}

impl EntityTypeDef {
    pub fn new(name: &str, identifiers: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn attributes(mut self, attributes: &[&str]) -> Self {
        self.attributes = attributes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn child(mut self, child_type: &str, field: &str) -> Self {
        self.children.insert(child_type.to_string(), field.to_string());
        self
    }

    pub fn short_label(mut self, field: &str) -> Self {
        self.short_label = Some(field.to_string());
        self
    }

    pub fn unique_fields(mut self, fields: &[&str]) -> Self {
        self.unique_fields = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn skip(mut self, fields: &[&str]) -> Self {
        self.skip = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn foreign_key(mut self, field: &str, target: &str) -> Self {
        self.foreign_key.insert(field.to_string(), target.to_string());
        self
    }

    pub fn many_to_many(mut self, field: &str, target: &str) -> Self {
        self.many_to_many.insert(field.to_string(), target.to_string());
        self
    }

    pub fn generic_relation(mut self, field: &str, parent: &str, identifiers: &[&str], attr: &str) -> Self {
        self.generic_relation.insert(
            field.to_string(),
            GenericRelationDef {
                parent: parent.to_string(),
                identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
                attr: attr.to_string(),
            },
        );
        self
    }

    pub fn normalize(mut self, field: &str, normalizer: Normalizer) -> Self {
        self.normalize.insert(field.to_string(), normalizer);
        self
    }
}

/// How a field maps onto the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Plain,
    ForeignKey { target: String },
    ManyToMany { target: String },
    GenericRelation {
        parent: String,
        identifiers: Vec<String>,
        attr: String,
    },
}

static PLAIN: FieldKind = FieldKind::Plain;

impl FieldKind {
    pub fn is_relation(&self) -> bool {
        !matches!(self, FieldKind::Plain)
    }

    /// Entity type this field points at, if any.
    pub fn referenced_type(&self) -> Option<&str> {
        match self {
            FieldKind::Plain => None,
            FieldKind::ForeignKey { target } | FieldKind::ManyToMany { target } => Some(target),
            FieldKind::GenericRelation { parent, .. } => Some(parent),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Plain => "plain",
            FieldKind::ForeignKey { .. } => "foreign_key",
            FieldKind::ManyToMany { .. } => "many_to_many",
            FieldKind::GenericRelation { .. } => "generic_relation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildDef {
    pub child_type: String,
    pub field: String,
}

/// Compiled entity type. Every declared field carries exactly one
/// `FieldKind`, so the relation maps cannot overlap once compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    pub name: String,
    pub identifiers: Vec<String>,
    pub attributes: Vec<String>,
    pub children: Vec<ChildDef>,
    pub short_label: Option<String>,
    pub unique_fields: Vec<String>,
    skip: HashSet<String>,
    table: Option<String>,
    fields: BTreeMap<String, FieldKind>,
    normalize: BTreeMap<String, Normalizer>,
}

impl EntityType {
    pub fn compile(def: EntityTypeDef) -> Result<Self, SchemaError> {
        let name = def.name;
        if def.identifiers.is_empty() {
            return Err(SchemaError::NoIdentifiers(name));
        }
        if let Some(field) = def.identifiers.iter().find(|f| def.attributes.contains(f)) {
            return Err(SchemaError::IdentifierAttributeOverlap {
                entity_type: name,
                field: field.clone(),
            });
        }

        let declared: HashSet<&String> = def.identifiers.iter().chain(def.attributes.iter()).collect();
        let undeclared = |field: &String| SchemaError::UndeclaredField {
            entity_type: name.clone(),
            field: field.clone(),
        };

        let declarations = def
            .foreign_key
            .into_iter()
            .map(|(field, target)| (field, FieldKind::ForeignKey { target }))
            .chain(
                def.many_to_many
                    .into_iter()
                    .map(|(field, target)| (field, FieldKind::ManyToMany { target })),
            )
            .chain(def.generic_relation.into_iter().map(|(field, generic)| {
                (
                    field,
                    FieldKind::GenericRelation {
                        parent: generic.parent,
                        identifiers: generic.identifiers,
                        attr: generic.attr,
                    },
                )
            }));

        let mut fields: BTreeMap<String, FieldKind> = BTreeMap::new();
        for (field, kind) in declarations {
            if let Some(existing) = fields.get(&field) {
                return Err(SchemaError::OverlappingRelation {
                    entity_type: name.clone(),
                    field,
                    first: existing.label(),
                    second: kind.label(),
                });
            }
            if !declared.contains(&field) {
                return Err(undeclared(&field));
            }
            if let FieldKind::GenericRelation { identifiers, .. } = &kind {
                if let Some(missing) = identifiers.iter().find(|f| !declared.contains(f)) {
                    return Err(undeclared(missing));
                }
            }
            fields.insert(field, kind);
        }

        let mentioned = def
            .short_label
            .iter()
            .chain(def.unique_fields.iter())
            .chain(def.skip.iter())
            .chain(def.normalize.keys());
        for field in mentioned {
            if !declared.contains(field) {
                return Err(undeclared(field));
            }
        }

        for field in def.identifiers.iter().chain(def.attributes.iter()) {
            fields.entry(field.clone()).or_insert(FieldKind::Plain);
        }

        Ok(Self {
            identifiers: def.identifiers,
            attributes: def.attributes,
            children: def
                .children
                .into_iter()
                .map(|(child_type, field)| ChildDef { child_type, field })
                .collect(),
            short_label: def.short_label,
            unique_fields: def.unique_fields,
            skip: def.skip.into_iter().collect(),
            table: def.table,
            fields,
            normalize: def.normalize,
            name,
        })
    }

    /// Relation descriptor of a field; undeclared fields are plain.
    pub fn kind(&self, field: &str) -> &FieldKind {
        self.fields.get(field).unwrap_or(&PLAIN)
    }

    pub fn declares(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn is_skipped(&self, field: &str) -> bool {
        self.skip.contains(field)
    }

    pub fn normalizer(&self, field: &str) -> Option<&Normalizer> {
        self.normalize.get(field)
    }

    /// Persistence target; every mutation needs one.
    pub fn table(&self) -> Result<&str, SchemaError> {
        self.table
            .as_deref()
            .ok_or_else(|| SchemaError::NoPersistenceTarget(self.name.clone()))
    }

    pub fn has_table(&self) -> bool {
        self.table.is_some()
    }

    pub fn relations(&self) -> impl Iterator<Item = (&str, &FieldKind)> {
        self.fields
            .iter()
            .filter(|(_, kind)| kind.is_relation())
            .map(|(field, kind)| (field.as_str(), kind))
    }

    /// Identifiers followed by attributes, in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.identifiers.iter().chain(self.attributes.iter()).map(|f| f.as_str())
    }

    /// Attributes compared by the differ.
    pub fn diffed_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .map(|f| f.as_str())
            .filter(|f| !self.skip.contains(*f))
    }

    pub fn child_field(&self, child_type: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|c| c.child_type == child_type)
            .map(|c| c.field.as_str())
    }

    /// First field that is a foreign key to `parent_type`.
    pub fn field_referencing(&self, parent_type: &str) -> Option<&str> {
        self.fields().find(|field| {
            matches!(self.kind(field), FieldKind::ForeignKey { target } if target == parent_type)
        })
    }

    /// Record column a field is stored under.
    pub fn column(&self, field: &str) -> String {
        match self.kind(field) {
            FieldKind::GenericRelation { attr, .. } => attr.clone(),
            _ => field.to_string(),
        }
    }

    /// Backend constraints: identifiers are required and unique together.
    pub fn table_def(&self) -> Option<TableDef> {
        let table = self.table.as_ref()?;
        let columns: Vec<String> = self
            .identifiers
            .iter()
            .filter(|f| !self.skip.contains(*f))
            .map(|f| self.column(f))
            .collect();
        Some(TableDef {
            name: table.clone(),
            required: columns.clone(),
            unique_together: vec![columns],
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: Vec<EntityType>,
    by_name: HashMap<String, usize>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and validate a complete set of definitions.
    pub fn from_defs(defs: impl IntoIterator<Item = EntityTypeDef>) -> Result<Self, SchemaError> {
        let mut registry = Self::new();
        for def in defs {
            registry.register(def)?;
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn register(&mut self, def: EntityTypeDef) -> Result<&EntityType, SchemaError> {
        if self.by_name.contains_key(&def.name) {
            return Err(SchemaError::DuplicateType(def.name));
        }
        let entity_type = EntityType::compile(def)?;
        let index = self.types.len();
        self.by_name.insert(entity_type.name.clone(), index);
        self.types.push(entity_type);
        Ok(&self.types[index])
    }

    /// Cross-type checks: every referenced type exists and the dependency
    /// graph between types is acyclic.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for entity_type in &self.types {
            let referenced = entity_type
                .relations()
                .filter_map(|(_, kind)| kind.referenced_type())
                .chain(entity_type.children.iter().map(|c| c.child_type.as_str()));
            for target in referenced {
                if !self.by_name.contains_key(target) {
                    return Err(SchemaError::UnknownReference {
                        entity_type: entity_type.name.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }
        self.dependency_order().map(|_| ())
    }

    pub fn get(&self, name: &str) -> Option<&EntityType> {
        self.by_name.get(name).map(|&index| &self.types[index])
    }

    pub fn require(&self, name: &str) -> Result<&EntityType, SchemaError> {
        self.get(name)
            .ok_or_else(|| SchemaError::UnknownType(name.to_string()))
    }

    /// Types in registration order.
    pub fn types(&self) -> impl Iterator<Item = &EntityType> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn is_child_type(&self, name: &str) -> bool {
        self.types
            .iter()
            .any(|t| t.children.iter().any(|c| c.child_type == name))
    }

    /// Types that no other type declares as a child.
    pub fn top_level(&self) -> Vec<&str> {
        self.types
            .iter()
            .map(|t| t.name.as_str())
            .filter(|name| !self.is_child_type(name))
            .collect()
    }

    /// Types declaring `child_type` as a child, in registration order.
    pub fn parents_of<'a>(&'a self, child_type: &'a str) -> impl Iterator<Item = &'a EntityType> + 'a {
        self.types
            .iter()
            .filter(move |t| t.child_field(child_type).is_some())
    }

    /// Types ordered so that everything a type references, or is nested
    /// under, comes first. Ties keep registration order.
    pub fn dependency_order(&self) -> Result<Vec<String>, SchemaError> {
        let count = self.types.len();
        let mut depends_on: Vec<HashSet<usize>> = vec![HashSet::new(); count];
        for (index, entity_type) in self.types.iter().enumerate() {
            for (_, kind) in entity_type.relations() {
                if let Some(&target) = kind.referenced_type().and_then(|t| self.by_name.get(t)) {
                    if target != index {
                        depends_on[index].insert(target);
                    }
                }
            }
            for child in &entity_type.children {
                if let Some(&child_index) = self.by_name.get(&child.child_type) {
                    if child_index != index {
                        depends_on[child_index].insert(index);
                    }
                }
            }
        }

        let mut placed = vec![false; count];
        let mut order = Vec::with_capacity(count);
        while order.len() < count {
            let next = (0..count).find(|&candidate| {
                !placed[candidate] && depends_on[candidate].iter().all(|&dep| placed[dep])
            });
            match next {
                Some(index) => {
                    placed[index] = true;
                    order.push(self.types[index].name.clone());
                }
                None => {
                    let remaining: Vec<&str> = (0..count)
                        .filter(|&i| !placed[i])
                        .map(|i| self.types[i].name.as_str())
                        .collect();
                    return Err(SchemaError::DependencyCycle(remaining.join(", ")));
                }
            }
        }
        Ok(order)
    }

    pub fn table_defs(&self) -> Vec<TableDef> {
        self.types.iter().filter_map(|t| t.table_def()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status() -> EntityTypeDef {
        EntityTypeDef::new("status", &["slug"])
            .attributes(&["name"])
            .unique_fields(&["name"])
            .table("extras_status")
    }

    #[test]
    fn test_overlapping_relation_maps_are_rejected() {
        let def = EntityTypeDef::new("interface", &["device", "name"])
            .attributes(&["untagged_vlan"])
            .foreign_key("untagged_vlan", "vlan")
            .many_to_many("untagged_vlan", "vlan");

        let err = SchemaRegistry::new().register(def).unwrap_err();
        assert_eq!(
            err,
            SchemaError::OverlappingRelation {
                entity_type: "interface".to_string(),
                field: "untagged_vlan".to_string(),
                first: "foreign_key",
                second: "many_to_many",
            }
        );
    }

    #[test]
    fn test_relation_on_undeclared_field_is_rejected() {
        let def = EntityTypeDef::new("site", &["slug"]).foreign_key("status", "status");
        let err = EntityType::compile(def).unwrap_err();
        assert!(matches!(err, SchemaError::UndeclaredField { field, .. } if field == "status"));
    }

    #[test]
    fn test_missing_identifiers_are_rejected() {
        let err = EntityType::compile(EntityTypeDef::new("site", &[])).unwrap_err();
        assert_eq!(err, SchemaError::NoIdentifiers("site".to_string()));
    }

    #[test]
    fn test_unknown_reference_is_rejected() {
        let site = EntityTypeDef::new("site", &["slug"])
            .attributes(&["status"])
            .foreign_key("status", "status");
        let err = SchemaRegistry::from_defs([site]).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownReference { target, .. } if target == "status"));
    }

    #[test]
    fn test_field_kinds_are_compiled() {
        let interface = EntityType::compile(
            EntityTypeDef::new("interface", &["device", "name"])
                .attributes(&["tagged_vlans", "mode"])
                .foreign_key("device", "device")
                .many_to_many("tagged_vlans", "vlan"),
        )
        .unwrap();

        assert_eq!(interface.kind("device"), &FieldKind::ForeignKey { target: "device".into() });
        assert_eq!(interface.kind("tagged_vlans"), &FieldKind::ManyToMany { target: "vlan".into() });
        assert_eq!(interface.kind("mode"), &FieldKind::Plain);
        assert_eq!(interface.kind("unknown"), &FieldKind::Plain);
        assert_eq!(interface.field_referencing("device"), Some("device"));
    }

    #[test]
    fn test_dependency_order_puts_referenced_and_parent_types_first() {
        let site = EntityTypeDef::new("site", &["slug"])
            .attributes(&["status"])
            .child("device", "devices")
            .foreign_key("status", "status");
        let device = EntityTypeDef::new("device", &["name"])
            .attributes(&["site", "status"])
            .foreign_key("site", "site")
            .foreign_key("status", "status");
        // registered out of order on purpose
        let registry = SchemaRegistry::from_defs([device, site, status()]).unwrap();

        assert_eq!(registry.dependency_order().unwrap(), vec!["status", "site", "device"]);
        assert_eq!(registry.top_level(), vec!["site", "status"]);
    }

    #[test]
    fn test_self_reference_is_not_a_cycle() {
        let region = EntityTypeDef::new("region", &["slug"])
            .attributes(&["parent"])
            .child("region", "children")
            .foreign_key("parent", "region");
        let registry = SchemaRegistry::from_defs([region]).unwrap();
        assert_eq!(registry.dependency_order().unwrap(), vec!["region"]);
    }

    #[test]
    fn test_cycle_between_types_is_rejected() {
        let a = EntityTypeDef::new("a", &["id"]).attributes(&["b"]).foreign_key("b", "b");
        let b = EntityTypeDef::new("b", &["id"]).attributes(&["a"]).foreign_key("a", "a");
        let err = SchemaRegistry::from_defs([a, b]).unwrap_err();
        assert!(matches!(err, SchemaError::DependencyCycle(_)));
    }

    #[test]
    fn test_table_def_uses_generic_relation_column() {
        let entity_type = EntityType::compile(
            EntityTypeDef::new("ip_address", &["address"])
                .attributes(&["device", "interface", "assigned_interface"])
                .generic_relation("assigned_interface", "interface", &["device", "interface"], "assigned_object")
                .table("ipam_ipaddress"),
        )
        .unwrap();
        assert_eq!(entity_type.column("assigned_interface"), "assigned_object");

        let table = entity_type.table_def().unwrap();
        assert_eq!(table.required, vec!["address"]);
        assert_eq!(table.unique_together, vec![vec!["address".to_string()]]);
    }

    #[test]
    fn test_missing_table_is_a_schema_error() {
        let entity_type = EntityType::compile(EntityTypeDef::new("status", &["slug"])).unwrap();
        assert_eq!(
            entity_type.table().unwrap_err(),
            SchemaError::NoPersistenceTarget("status".to_string())
        );
    }

    #[test]
    fn test_normalizers() {
        let slug = Normalizer::Slug { strip_prefix: Some("A_".to_string()) };
        assert_eq!(slug.apply(json!("A_1000BASE_T")), json!("1000base-t"));
        assert_eq!(slug.apply(json!("VIRTUAL")), json!("virtual"));
        assert_eq!(Normalizer::Lowercase.apply(json!("TAGGED")), json!("tagged"));
        assert_eq!(Normalizer::Lowercase.apply(json!(12)), json!(12));
    }

    #[test]
    fn test_type_def_deserializes_from_relation_maps() {
        let def: EntityTypeDef = serde_json::from_value(json!({
            "name": "vlan",
            "identifiers": ["site", "vid"],
            "attributes": ["name", "status"],
            "short_label": "vid",
            "table": "ipam_vlan",
            "foreign_key": {"site": "site", "status": "status"}
        }))
        .unwrap();
        let vlan = EntityType::compile(def).unwrap();
        assert_eq!(vlan.short_label.as_deref(), Some("vid"));
        assert_eq!(vlan.relations().count(), 2);
    }
}
