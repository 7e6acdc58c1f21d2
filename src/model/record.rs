use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::model::Handle;

/// One column of a persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    Scalar(Value),
    ForeignKey(Handle),
    /// Relation whose target type is stored next to the key.
    Generic { entity_type: String, handle: Handle },
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Scalar(Value::Null))
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ColumnValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            ColumnValue::Scalar(_) => None,
            ColumnValue::ForeignKey(handle) | ColumnValue::Generic { handle, .. } => Some(*handle),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Assigned by the store on first save.
    pub handle: Option<Handle>,
    #[serde(default)]
    pub fields: BTreeMap<String, ColumnValue>,
    /// Many-to-many collections.
    #[serde(default)]
    pub links: BTreeMap<String, BTreeSet<Handle>>,
}

impl PersistedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_scalar(&mut self, field: &str, value: Value) {
        self.fields.insert(field.to_string(), ColumnValue::Scalar(value));
    }

    pub fn set_foreign_key(&mut self, field: &str, handle: Handle) {
        self.fields.insert(field.to_string(), ColumnValue::ForeignKey(handle));
    }

    pub fn set_generic(&mut self, field: &str, entity_type: &str, handle: Handle) {
        self.fields.insert(
            field.to_string(),
            ColumnValue::Generic {
                entity_type: entity_type.to_string(),
                handle,
            },
        );
    }

    pub fn add_link(&mut self, field: &str, handle: Handle) {
        self.links.entry(field.to_string()).or_default().insert(handle);
    }

    /// Replaces the whole collection.
    pub fn set_links(&mut self, field: &str, handles: impl IntoIterator<Item = Handle>) {
        self.links.insert(field.to_string(), handles.into_iter().collect());
    }

    pub fn field(&self, field: &str) -> Option<&ColumnValue> {
        self.fields.get(field)
    }

    pub fn has_value(&self, field: &str) -> bool {
        self.fields.get(field).is_some_and(|value| !value.is_null())
            || self.links.get(field).is_some_and(|links| !links.is_empty())
    }

    pub fn matches(&self, filter: &RecordFilter) -> bool {
        filter.conditions.iter().all(|(field, expected)| match expected {
            FilterValue::Column(column) => self.fields.get(field) == Some(column),
            FilterValue::Linked(handle) => self
                .links
                .get(field)
                .is_some_and(|links| links.contains(handle)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FilterValue {
    Column(ColumnValue),
    Linked(Handle),
}

/// Conjunction of column equalities.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub conditions: Vec<(String, FilterValue)>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: ColumnValue) -> Self {
        self.conditions.push((field.to_string(), FilterValue::Column(value)));
        self
    }

    pub fn linked(mut self, field: &str, handle: Handle) -> Self {
        self.conditions.push((field.to_string(), FilterValue::Linked(handle)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// Constraints a store enforces on save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub unique_together: Vec<Vec<String>>,
}

impl TableDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: Vec::new(),
            unique_together: Vec::new(),
        }
    }

    pub fn check_required(&self, record: &PersistedRecord) -> Result<(), String> {
        match self.required.iter().find(|field| !record.has_value(field)) {
            Some(field) => Err(format!("field `{field}` is required")),
            None => Ok(()),
        }
    }

    /// One filter per unique group the record fully populates.
    pub fn unique_filters(&self, record: &PersistedRecord) -> Vec<(String, RecordFilter)> {
        self.unique_together
            .iter()
            .filter_map(|group| {
                let mut filter = RecordFilter::new();
                for field in group {
                    let value = record.fields.get(field).filter(|v| !v.is_null())?;
                    filter = filter.eq(field, value.clone());
                }
                Some((group.join(", "), filter))
            })
            .collect()
    }
}
