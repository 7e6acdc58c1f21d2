use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::adapters::{GraphAdapter, GraphLoader};
use crate::error::LoadError;
use crate::model::{unique_id, AttrMap, ColumnValue, EntityGraph, FieldKind, Handle, PersistedRecord, SchemaRegistry};
use crate::store::RecordStore;

/// What to fetch from a source query interface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDocument {
    /// Entity types to return; all of them when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    /// Return the primary key of every record under `id`.
    #[serde(default)]
    pub include_handles: bool,
}

impl QueryDocument {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_handles(mut self) -> Self {
        self.include_handles = true;
        self
    }

    pub fn wants(&self, entity_type: &str) -> bool {
        self.types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == entity_type))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    #[serde(default)]
    pub variables: AttrMap,
}

/// Source query interface: answers a query document with a nested
/// `{type: [record, ...]}` document, optionally wrapped in `{"data": ...}`.
#[async_trait::async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &QueryDocument, context: &QueryContext) -> anyhow::Result<Value>;
}

/// Executor returning a fixed answer, filtered to the requested types.
#[derive(Debug, Clone)]
pub struct StaticQueryExecutor {
    response: Value,
}

impl StaticQueryExecutor {
    pub fn new(response: Value) -> Self {
        Self { response }
    }
}

#[async_trait::async_trait]
impl QueryExecutor for StaticQueryExecutor {
    async fn execute(&self, query: &QueryDocument, _context: &QueryContext) -> anyhow::Result<Value> {
        let Value::Object(types) = &self.response else {
            return Ok(self.response.clone());
        };
        Ok(Value::Object(
            types
                .iter()
                .filter(|(name, _)| query.wants(name))
                .map(|(name, records)| (name.clone(), records.clone()))
                .collect(),
        ))
    }
}

/// Adapter loading whatever its executor answers to `query`.
pub struct QueryAdapter<Q: QueryExecutor> {
    executor: Q,
    query: QueryDocument,
    context: QueryContext,
    graph: EntityGraph,
    handle_field: String,
    loaded: bool,
}

impl<Q: QueryExecutor> QueryAdapter<Q> {
    pub fn new(name: &str, schema: Arc<SchemaRegistry>, executor: Q, query: QueryDocument) -> Self {
        Self {
            executor,
            query,
            context: QueryContext::default(),
            graph: EntityGraph::new(name, schema),
            handle_field: "id".to_string(),
            loaded: false,
        }
    }

    pub fn with_context(mut self, context: QueryContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_handle_field(mut self, field: &str) -> Self {
        self.handle_field = field.to_string();
        self
    }
}

#[async_trait::async_trait]
impl<Q: QueryExecutor> GraphAdapter for QueryAdapter<Q> {
    fn name(&self) -> &str {
        self.graph.name()
    }

    fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    fn graph_mut(&mut self) -> &mut EntityGraph {
        &mut self.graph
    }

    async fn load(&mut self) -> Result<(), LoadError> {
        if self.loaded {
            return Err(LoadError::AlreadyLoaded(self.graph.name().to_string()));
        }
        self.loaded = true;

        let mut answer = self
            .executor
            .execute(&self.query, &self.context)
            .await
            .map_err(LoadError::Fetch)?;
        if let Some(data) = answer.get_mut("data").map(Value::take) {
            answer = data;
        }

        let mut loader = GraphLoader::new(&mut self.graph);
        if self.query.include_handles {
            loader = loader.with_handles(&self.handle_field);
        }
        if let Err(err) = loader.load_document(&answer) {
            self.graph = EntityGraph::new(self.graph.name(), self.graph.schema().clone());
            return Err(err);
        }
        info!("[{}] loaded {} entities", self.graph.name(), self.graph.len());
        Ok(())
    }
}

/// Answers query documents from a record store, so the relational side can
/// be loaded as a graph. References are rendered as the unique id of the
/// record they point at, and records are nested under their structural
/// parent when it is part of the answer.
pub struct StoreQueryExecutor<S: RecordStore + ?Sized> {
    store: Arc<S>,
    schema: Arc<SchemaRegistry>,
}

impl<S: RecordStore + ?Sized> StoreQueryExecutor<S> {
    pub fn new(store: Arc<S>, schema: Arc<SchemaRegistry>) -> Self {
        Self { store, schema }
    }
}

struct Snapshot<'a> {
    schema: &'a SchemaRegistry,
    /// Entity type and record for every handle.
    records: HashMap<Handle, (&'a str, PersistedRecord)>,
    /// Handles per type, in store order.
    order: Vec<(&'a str, Vec<Handle>)>,
    unique_ids: HashMap<Handle, Option<String>>,
}

impl<'a> Snapshot<'a> {
    fn unique_id(&mut self, handle: Handle) -> Option<String> {
        if let Some(known) = self.unique_ids.get(&handle) {
            return known.clone();
        }
        // guards against identifier cycles
        self.unique_ids.insert(handle, None);

        let schema = self.schema;
        let (type_name, record) = self.records.get(&handle)?.clone();
        let entity_type = schema.get(type_name)?;
        let mut parts = Vec::with_capacity(entity_type.identifiers.len());
        for field in &entity_type.identifiers {
            parts.push(self.render(entity_type.kind(field), &entity_type.column(field), field, &record)?);
        }
        let rendered = unique_id(parts.iter());
        self.unique_ids.insert(handle, Some(rendered.clone()));
        Some(rendered)
    }

    fn render(&mut self, kind: &FieldKind, column: &str, field: &str, record: &PersistedRecord) -> Option<Value> {
        match kind {
            FieldKind::ManyToMany { .. } => {
                let handles = record.links.get(field)?;
                let mut rendered: Vec<String> = handles.iter().filter_map(|h| self.unique_id(*h)).collect();
                rendered.sort();
                Some(Value::Array(rendered.into_iter().map(Value::String).collect()))
            }
            _ => match record.field(column)? {
                ColumnValue::Scalar(value) => Some(value.clone()),
                ColumnValue::ForeignKey(handle) | ColumnValue::Generic { handle, .. } => {
                    let handle = *handle;
                    match self.unique_id(handle) {
                        Some(rendered) => Some(Value::String(rendered)),
                        None => {
                            warn!("`{field}` points at unknown record {handle}");
                            Some(Value::Null)
                        }
                    }
                }
            },
        }
    }

    /// Structural parent: a record of a type declaring this one as child,
    /// referenced through this record's foreign key.
    fn parent_of(&self, type_name: &str, record: &PersistedRecord, included: &HashSet<&str>) -> Option<Handle> {
        let entity_type = self.schema.get(type_name)?;
        self.schema.parents_of(type_name).find_map(|parent_type| {
            if !included.contains(parent_type.name.as_str()) {
                return None;
            }
            let field = entity_type.field_referencing(&parent_type.name)?;
            let handle = record.field(field)?.handle()?;
            match self.records.get(&handle) {
                Some((found_type, _)) if *found_type == parent_type.name => Some(handle),
                _ => None,
            }
        })
    }

    fn build(
        &mut self,
        handle: Handle,
        children: &HashMap<Handle, Vec<Handle>>,
        visited: &mut HashSet<Handle>,
        include_handles: bool,
    ) -> Option<Value> {
        if !visited.insert(handle) {
            return None;
        }
        let schema = self.schema;
        let (type_name, record) = self.records.get(&handle)?.clone();
        let entity_type = schema.get(type_name)?;

        let mut object = Map::new();
        if include_handles {
            object.insert("id".to_string(), Value::String(handle.to_string()));
        }
        for field in entity_type.fields() {
            if entity_type.is_skipped(field) {
                continue;
            }
            if let Some(value) = self.render(entity_type.kind(field), &entity_type.column(field), field, &record) {
                object.insert(field.to_string(), value);
            }
        }

        for child_handle in children.get(&handle).map(Vec::as_slice).unwrap_or_default() {
            let Some(child_type) = self.records.get(child_handle).map(|(t, _)| *t) else {
                continue;
            };
            let Some(field) = entity_type.child_field(child_type) else {
                continue;
            };
            if let Some(nested) = self.build(*child_handle, children, visited, include_handles) {
                let list = object
                    .entry(field.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(list) = list {
                    list.push(nested);
                }
            }
        }
        Some(Value::Object(object))
    }
}

#[async_trait::async_trait]
impl<S: RecordStore + ?Sized> QueryExecutor for StoreQueryExecutor<S> {
    async fn execute(&self, query: &QueryDocument, _context: &QueryContext) -> anyhow::Result<Value> {
        let mut snapshot = Snapshot {
            schema: &self.schema,
            records: HashMap::new(),
            order: Vec::new(),
            unique_ids: HashMap::new(),
        };
        // every table is read so references into unrequested types render
        for entity_type in self.schema.types() {
            let Ok(table) = entity_type.table() else {
                continue;
            };
            let records = self
                .store
                .list(table)
                .await
                .with_context(|| format!("Failed to list `{table}`"))?;
            let mut handles = Vec::with_capacity(records.len());
            for record in records {
                let Some(handle) = record.handle else {
                    continue;
                };
                handles.push(handle);
                snapshot.records.insert(handle, (entity_type.name.as_str(), record));
            }
            snapshot.order.push((entity_type.name.as_str(), handles));
        }

        let included: HashSet<&str> = self
            .schema
            .types()
            .map(|t| t.name.as_str())
            .filter(|name| query.wants(name))
            .collect();

        let mut roots: Vec<(&str, Handle)> = Vec::new();
        let mut children: HashMap<Handle, Vec<Handle>> = HashMap::new();
        for (type_name, handles) in &snapshot.order {
            if !included.contains(type_name) {
                continue;
            }
            for handle in handles {
                let record = &snapshot.records[handle].1;
                match snapshot.parent_of(type_name, record, &included) {
                    Some(parent) => children.entry(parent).or_default().push(*handle),
                    None => roots.push((*type_name, *handle)),
                }
            }
        }

        let all: Vec<(&str, Handle)> = snapshot
            .order
            .iter()
            .filter(|(type_name, _)| included.contains(type_name))
            .flat_map(|(type_name, handles)| handles.iter().map(move |h| (*type_name, *h)))
            .collect();

        let mut document = Map::new();
        let mut visited = HashSet::new();
        // records caught in a parent cycle are never reached from a root
        for (type_name, handle) in roots.into_iter().chain(all) {
            if let Some(record) = snapshot.build(handle, &children, &mut visited, query.include_handles) {
                let list = document
                    .entry(type_name.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(list) = list {
                    list.push(record);
                }
            }
        }
        Ok(Value::Object(document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::network_inventory;
    use crate::store::{MemoryStore, RecordStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_query_adapter_unwraps_data_and_reads_handles() {
        let schema = Arc::new(network_inventory().unwrap());
        let handle = uuid::Uuid::new_v4();
        let executor = StaticQueryExecutor::new(json!({
            "data": {"status": [{"slug": "active", "id": handle.to_string()}]}
        }));
        let mut adapter = QueryAdapter::new("nautobot", schema, executor, QueryDocument::all().with_handles());

        adapter.load().await.unwrap();
        let status = adapter.graph().get("status", "active").unwrap();
        assert_eq!(adapter.graph().entity(status).handle, Some(handle));
        assert!(matches!(adapter.load().await.unwrap_err(), LoadError::AlreadyLoaded(_)));
    }

    #[tokio::test]
    async fn test_static_executor_filters_types() {
        let executor = StaticQueryExecutor::new(json!({"status": [], "site": []}));
        let query = QueryDocument {
            types: Some(vec!["site".to_string()]),
            include_handles: false,
        };
        let answer = executor.execute(&query, &QueryContext::default()).await.unwrap();
        assert_eq!(answer, json!({"site": []}));
    }

    struct FailingExecutor;

    #[async_trait::async_trait]
    impl QueryExecutor for FailingExecutor {
        async fn execute(&self, _query: &QueryDocument, _context: &QueryContext) -> anyhow::Result<Value> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn test_executor_failure_is_a_fetch_error() {
        let schema = Arc::new(network_inventory().unwrap());
        let mut adapter = QueryAdapter::new("nautobot", schema, FailingExecutor, QueryDocument::all());
        assert!(matches!(adapter.load().await.unwrap_err(), LoadError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_store_executor_renders_references_and_nesting() {
        let schema = Arc::new(network_inventory().unwrap());
        let store = Arc::new(MemoryStore::with_schema(&schema));

        let mut site = PersistedRecord::new();
        site.set_scalar("slug", json!("ams1"));
        let site = store.save("dcim_site", site).await.unwrap();

        let mut device = PersistedRecord::new();
        device.set_scalar("name", json!("edge-1"));
        device.set_foreign_key("site", site.handle.unwrap());
        let device = store.save("dcim_device", device).await.unwrap();

        let mut vlan = PersistedRecord::new();
        vlan.set_foreign_key("site", site.handle.unwrap());
        vlan.set_scalar("vid", json!(100));
        let vlan = store.save("ipam_vlan", vlan).await.unwrap();

        let mut interface = PersistedRecord::new();
        interface.set_foreign_key("device", device.handle.unwrap());
        interface.set_scalar("name", json!("eth0"));
        interface.add_link("tagged_vlans", vlan.handle.unwrap());
        store.save("dcim_interface", interface).await.unwrap();

        let executor = StoreQueryExecutor::new(store, schema);
        let answer = executor
            .execute(&QueryDocument::all(), &QueryContext::default())
            .await
            .unwrap();

        assert_eq!(
            answer,
            json!({"site": [{
                "slug": "ams1",
                "vlans": [{"site": "ams1", "vid": 100}],
                "devices": [{
                    "name": "edge-1",
                    "site": "ams1",
                    "interfaces": [{"device": "edge-1", "name": "eth0", "tagged_vlans": ["ams1__100"]}]
                }]
            }]})
        );
    }

    #[tokio::test]
    async fn test_store_executor_without_parent_type_keeps_children_top_level() {
        let schema = Arc::new(network_inventory().unwrap());
        let store = Arc::new(MemoryStore::with_schema(&schema));
        let mut site = PersistedRecord::new();
        site.set_scalar("slug", json!("ams1"));
        let site = store.save("dcim_site", site).await.unwrap();
        let mut device = PersistedRecord::new();
        device.set_scalar("name", json!("edge-1"));
        device.set_foreign_key("site", site.handle.unwrap());
        store.save("dcim_device", device).await.unwrap();

        let executor = StoreQueryExecutor::new(store, schema);
        let query = QueryDocument {
            types: Some(vec!["device".to_string()]),
            include_handles: false,
        };
        let answer = executor.execute(&query, &QueryContext::default()).await.unwrap();
        assert_eq!(answer, json!({"device": [{"name": "edge-1", "site": "ams1"}]}));
    }
}
