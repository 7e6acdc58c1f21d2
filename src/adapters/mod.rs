pub mod document;
pub mod loader;
pub mod query;

pub use document::*;
pub use loader::*;
pub use query::*;

use crate::error::LoadError;
use crate::model::EntityGraph;

/// Loads one side of a sync into its own entity graph.
///
/// An adapter is single use: `load` fills the graph once and fails with
/// `LoadError::AlreadyLoaded` when called again. When loading fails the
/// graph is left empty.
#[async_trait::async_trait]
pub trait GraphAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn graph(&self) -> &EntityGraph;

    fn graph_mut(&mut self) -> &mut EntityGraph;

    async fn load(&mut self) -> Result<(), LoadError>;
}
