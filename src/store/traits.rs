use crate::error::StoreError;
use crate::model::{Handle, PersistedRecord, RecordFilter, SchemaRegistry, TableDef};

pub type StoreResult<T> = Result<T, StoreError>;

/// Relational persistence target of a sync.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Declares a table and the constraints `save` enforces on it.
    /// Registering the same table again replaces its constraints.
    async fn register_table(&self, table: TableDef) -> StoreResult<()>;

    async fn get(&self, table: &str, handle: Handle) -> StoreResult<Option<PersistedRecord>>;

    /// At most one match; more than one is `StoreError::MultipleMatches`.
    async fn find_one(&self, table: &str, filter: &RecordFilter) -> StoreResult<Option<PersistedRecord>>;

    /// Records of a table in insertion order.
    async fn list(&self, table: &str) -> StoreResult<Vec<PersistedRecord>>;

    /// Validating save. Assigns a handle to new records and returns the
    /// stored record.
    async fn save(&self, table: &str, record: PersistedRecord) -> StoreResult<PersistedRecord>;

    /// Returns false when nothing was deleted.
    async fn delete(&self, table: &str, handle: Handle) -> StoreResult<bool>;
}

/// Registers a table for every schema type that has one.
pub async fn register_schema<S>(store: &S, schema: &SchemaRegistry) -> StoreResult<()>
where
    S: RecordStore + ?Sized,
{
    for table in schema.table_defs() {
        store.register_table(table).await?;
    }
    Ok(())
}
