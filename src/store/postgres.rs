use anyhow::Context;
use log::info;
use serde_json::{json, Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::StoreError;
use crate::model::{generate_handle, ColumnValue, FilterValue, Handle, PersistedRecord, RecordFilter, TableDef};
use crate::store::traits::{RecordStore, StoreResult};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ssot_tables (
        name TEXT PRIMARY KEY,
        definition JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ssot_records (
        handle UUID PRIMARY KEY,
        table_name TEXT NOT NULL REFERENCES ssot_tables (name),
        fields JSONB NOT NULL DEFAULT '{}',
        links JSONB NOT NULL DEFAULT '{}',
        seq BIGSERIAL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ssot_records_table_idx ON ssot_records (table_name, seq)",
    "CREATE INDEX IF NOT EXISTS ssot_records_fields_idx ON ssot_records USING GIN (fields)",
];

/// Record store on PostgreSQL. Every table shares one JSONB-backed record
/// table; constraints live in `ssot_tables`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create the record tables if they do not exist yet
    pub async fn migrate(&self) -> anyhow::Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to run database migrations")?;
        }
        info!("Record store schema is up to date");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn table_def(tx: &mut Transaction<'_, Postgres>, table: &str) -> StoreResult<TableDef> {
        let row = sqlx::query("SELECT definition FROM ssot_tables WHERE name = $1")
            .bind(table)
            .fetch_optional(&mut **tx)
            .await?;
        let Some(row) = row else {
            return Err(StoreError::UnknownTable(table.to_string()));
        };
        let Json(def): Json<TableDef> = row.try_get("definition")?;
        Ok(def)
    }

    async fn candidates(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        filter: &RecordFilter,
    ) -> StoreResult<Vec<PersistedRecord>> {
        let (fields, links) = containment(filter);
        let rows = sqlx::query(
            r#"
            SELECT handle, fields, links
            FROM ssot_records
            WHERE table_name = $1 AND fields @> $2 AND links @> $3
            ORDER BY seq
            "#,
        )
        .bind(table)
        .bind(Json(fields))
        .bind(Json(links))
        .fetch_all(&mut **tx)
        .await?;

        // containment is looser than equality for nested values
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = record_from_row(&row)?;
            if record.matches(filter) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn containment(filter: &RecordFilter) -> (Value, Value) {
    let mut fields = Map::new();
    let mut links = Map::new();
    for (field, expected) in &filter.conditions {
        match expected {
            FilterValue::Column(column) => {
                fields.insert(field.clone(), json!(column));
            }
            FilterValue::Linked(handle) => {
                links.insert(field.clone(), json!([handle]));
            }
        }
    }
    (Value::Object(fields), Value::Object(links))
}

fn record_from_row(row: &PgRow) -> StoreResult<PersistedRecord> {
    let handle: Handle = row.try_get("handle")?;
    let Json(fields): Json<BTreeMap<String, ColumnValue>> = row.try_get("fields")?;
    let Json(links): Json<BTreeMap<String, BTreeSet<Handle>>> = row.try_get("links")?;
    Ok(PersistedRecord {
        handle: Some(handle),
        fields,
        links,
    })
}

#[async_trait::async_trait]
impl RecordStore for PostgresStore {
    async fn register_table(&self, table: TableDef) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ssot_tables (name, definition)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET
                definition = EXCLUDED.definition,
                updated_at = NOW()
            "#,
        )
        .bind(&table.name)
        .bind(Json(&table))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, table: &str, handle: Handle) -> StoreResult<Option<PersistedRecord>> {
        let mut tx = self.pool.begin().await?;
        Self::table_def(&mut tx, table).await?;
        let row = sqlx::query("SELECT handle, fields, links FROM ssot_records WHERE table_name = $1 AND handle = $2")
            .bind(table)
            .bind(handle)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_one(&self, table: &str, filter: &RecordFilter) -> StoreResult<Option<PersistedRecord>> {
        let mut tx = self.pool.begin().await?;
        Self::table_def(&mut tx, table).await?;
        let mut matches = Self::candidates(&mut tx, table, filter).await?;
        tx.commit().await?;
        if matches.len() > 1 {
            return Err(StoreError::MultipleMatches {
                table: table.to_string(),
            });
        }
        Ok(matches.pop())
    }

    async fn list(&self, table: &str) -> StoreResult<Vec<PersistedRecord>> {
        let mut tx = self.pool.begin().await?;
        Self::table_def(&mut tx, table).await?;
        let rows = sqlx::query("SELECT handle, fields, links FROM ssot_records WHERE table_name = $1 ORDER BY seq")
            .bind(table)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn save(&self, table: &str, mut record: PersistedRecord) -> StoreResult<PersistedRecord> {
        let mut tx = self.pool.begin().await?;
        let def = Self::table_def(&mut tx, table).await?;

        let invalid = |message: String| StoreError::Validation {
            table: table.to_string(),
            message,
        };
        def.check_required(&record).map_err(invalid)?;
        for (columns, filter) in def.unique_filters(&record) {
            let clash = Self::candidates(&mut tx, table, &filter)
                .await?
                .iter()
                .any(|existing| existing.handle != record.handle);
            if clash {
                return Err(invalid(format!("a record with the same ({columns}) already exists")));
            }
        }

        let handle = *record.handle.get_or_insert_with(generate_handle);
        sqlx::query(
            r#"
            INSERT INTO ssot_records (handle, table_name, fields, links)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (handle) DO UPDATE SET
                fields = EXCLUDED.fields,
                links = EXCLUDED.links,
                updated_at = NOW()
            "#,
        )
        .bind(handle)
        .bind(table)
        .bind(Json(&record.fields))
        .bind(Json(&record.links))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn delete(&self, table: &str, handle: Handle) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM ssot_records WHERE table_name = $1 AND handle = $2")
            .bind(table)
            .bind(handle)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containment_splits_columns_and_links() {
        let vlan = generate_handle();
        let filter = RecordFilter::new()
            .eq("name", ColumnValue::Scalar(json!("eth0")))
            .linked("tagged_vlans", vlan);

        let (fields, links) = containment(&filter);
        assert_eq!(fields, json!({"name": {"kind": "scalar", "value": "eth0"}}));
        assert_eq!(links, json!({"tagged_vlans": [vlan]}));
    }

    #[test]
    fn test_empty_filter_contains_everything() {
        let (fields, links) = containment(&RecordFilter::new());
        assert_eq!(fields, json!({}));
        assert_eq!(links, json!({}));
    }
}
