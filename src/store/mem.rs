use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StoreError;
use crate::model::{generate_handle, Handle, PersistedRecord, RecordFilter, SchemaRegistry, TableDef};
use crate::store::traits::{RecordStore, StoreResult};

#[derive(Debug)]
struct Table {
    def: TableDef,
    records: HashMap<Handle, PersistedRecord>,
    order: Vec<Handle>,
}

impl Table {
    fn new(def: TableDef) -> Self {
        Self {
            def,
            records: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn matching<'a>(&'a self, filter: &'a RecordFilter) -> impl Iterator<Item = &'a PersistedRecord> + 'a {
        self.order
            .iter()
            .filter_map(|handle| self.records.get(handle))
            .filter(move |record| record.matches(filter))
    }
}

/// Store keeping every table in process memory. Used by tests and dry
/// runs against a scratch target.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
    mutations: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with a table registered for every schema type.
    pub fn with_schema(schema: &SchemaRegistry) -> Self {
        let store = Self::new();
        {
            let mut tables = store.tables.write();
            for def in schema.table_defs() {
                tables.insert(def.name.clone(), Table::new(def));
            }
        }
        store
    }

    /// Number of successful saves and deletes so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn count(&self, table: &str) -> usize {
        self.tables
            .read()
            .get(table)
            .map(|t| t.records.len())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn register_table(&self, def: TableDef) -> StoreResult<()> {
        let mut tables = self.tables.write();
        match tables.get_mut(&def.name) {
            Some(table) => table.def = def,
            None => {
                tables.insert(def.name.clone(), Table::new(def));
            }
        }
        Ok(())
    }

    async fn get(&self, table: &str, handle: Handle) -> StoreResult<Option<PersistedRecord>> {
        let tables = self.tables.read();
        let table = tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(table.records.get(&handle).cloned())
    }

    async fn find_one(&self, table: &str, filter: &RecordFilter) -> StoreResult<Option<PersistedRecord>> {
        let tables = self.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let mut matches = data.matching(filter);
        let first = matches.next().cloned();
        if matches.next().is_some() {
            return Err(StoreError::MultipleMatches {
                table: table.to_string(),
            });
        }
        Ok(first)
    }

    async fn list(&self, table: &str) -> StoreResult<Vec<PersistedRecord>> {
        let tables = self.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(data
            .order
            .iter()
            .filter_map(|handle| data.records.get(handle).cloned())
            .collect())
    }

    async fn save(&self, table: &str, mut record: PersistedRecord) -> StoreResult<PersistedRecord> {
        let mut tables = self.tables.write();
        let data = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        let invalid = |message: String| StoreError::Validation {
            table: table.to_string(),
            message,
        };
        data.def.check_required(&record).map_err(invalid)?;
        for (columns, filter) in data.def.unique_filters(&record) {
            let clash = data
                .matching(&filter)
                .any(|existing| existing.handle != record.handle);
            if clash {
                return Err(invalid(format!("a record with the same ({columns}) already exists")));
            }
        }

        let handle = *record.handle.get_or_insert_with(generate_handle);
        if data.records.insert(handle, record.clone()).is_none() {
            data.order.push(handle);
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn delete(&self, table: &str, handle: Handle) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        let data = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        if data.records.remove(&handle).is_none() {
            return Ok(false);
        }
        data.order.retain(|h| *h != handle);
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}
