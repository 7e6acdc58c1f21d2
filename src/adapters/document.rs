use anyhow::Context;
use log::info;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::adapters::{GraphAdapter, GraphLoader};
use crate::error::LoadError;
use crate::model::{EntityGraph, SchemaRegistry};

/// Adapter over an in-memory JSON document.
pub struct DocumentAdapter {
    graph: EntityGraph,
    document: Option<Value>,
}

impl DocumentAdapter {
    pub fn new(name: &str, schema: Arc<SchemaRegistry>, document: Value) -> Self {
        Self {
            graph: EntityGraph::new(name, schema),
            document: Some(document),
        }
    }

    pub fn from_path(name: &str, schema: Arc<SchemaRegistry>, path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))
            .and_then(|raw| {
                serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
            })
            .map_err(LoadError::Fetch)?;
        Ok(Self::new(name, schema, document))
    }
}

#[async_trait::async_trait]
impl GraphAdapter for DocumentAdapter {
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
        let document = self
            .document
            .take()
            .ok_or_else(|| LoadError::AlreadyLoaded(self.graph.name().to_string()))?;

        if let Err(err) = GraphLoader::new(&mut self.graph).load_document(&document) {
            self.graph = EntityGraph::new(self.graph.name(), self.graph.schema().clone());
            return Err(err);
        }
        info!("[{}] loaded {} entities", self.graph.name(), self.graph.len());
        Ok(())
    }
}
