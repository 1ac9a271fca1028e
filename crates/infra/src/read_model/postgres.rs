//! Postgres-backed tenant store implementation.
//!
//! One table per projection, each row keyed by `(tenant_id, entity_id)` with the
//! row body stored as JSONB. Tables are created by the event store migration.
//!
//! ## Tenant Isolation
//!
//! Every query includes `tenant_id` in the WHERE clause or as part of the primary key.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};

use folio_core::{AggregateId, TenantId};

use super::{ReadModelError, TenantStore};

/// Read-model table for one row type `V`.
pub struct PostgresTenantStore<V> {
    pool: Arc<PgPool>,
    table: String,
    _value: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for PostgresTenantStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTenantStore")
            .field("table", &self.table)
            .finish()
    }
}

impl<V> PostgresTenantStore<V> {
    /// `table` is interpolated into SQL, so only `[a-z0-9_]` names are accepted.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, ReadModelError> {
        let table = table.into();
        let valid = !table.is_empty()
            && table.len() <= 63
            && table
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && !table.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            return Err(ReadModelError::InvalidTable(table));
        }
        Ok(Self {
            pool: Arc::new(pool),
            table,
            _value: PhantomData,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

fn backend(operation: &str, err: sqlx::Error) -> ReadModelError {
    ReadModelError::Backend(format!("sqlx error in {operation}: {err}"))
}

fn decode<V: DeserializeOwned>(row: &sqlx::postgres::PgRow) -> Result<V, ReadModelError> {
    let body: JsonValue = row
        .try_get("row_data")
        .map_err(|e| backend("decode_row", e))?;
    serde_json::from_value(body).map_err(|e| ReadModelError::Serialization(e.to_string()))
}

#[async_trait]
impl<V> TenantStore<V> for PostgresTenantStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(
        &self,
        tenant_id: &TenantId,
        key: AggregateId,
    ) -> Result<Option<V>, ReadModelError> {
        let row = sqlx::query(&format!(
            "SELECT row_data FROM {} WHERE tenant_id = $1 AND entity_id = $2",
            self.table
        ))
        .bind(tenant_id.as_str())
        .bind(key.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| backend("get", e))?;

        row.as_ref().map(decode::<V>).transpose()
    }

    async fn upsert(
        &self,
        tenant_id: &TenantId,
        key: AggregateId,
        value: V,
    ) -> Result<(), ReadModelError> {
        let body =
            serde_json::to_value(&value).map_err(|e| ReadModelError::Serialization(e.to_string()))?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (tenant_id, entity_id, row_data)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, entity_id)
            DO UPDATE SET
                row_data = EXCLUDED.row_data,
                updated_at = NOW()
            "#,
            self.table
        ))
        .bind(tenant_id.as_str())
        .bind(key.as_uuid())
        .bind(&body)
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("upsert", e))?;

        Ok(())
    }

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<V>, ReadModelError> {
        let rows = sqlx::query(&format!(
            "SELECT row_data FROM {} WHERE tenant_id = $1 ORDER BY entity_id",
            self.table
        ))
        .bind(tenant_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| backend("list", e))?;

        rows.iter().map(decode::<V>).collect()
    }

    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), ReadModelError> {
        sqlx::query(&format!("DELETE FROM {} WHERE tenant_id = $1", self.table))
            .bind(tenant_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| backend("clear_tenant", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn table_names_are_restricted() {
        // connect_lazy never touches the network.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/folio")
            .unwrap();

        assert!(PostgresTenantStore::<JsonValue>::new(pool.clone(), "rm_book_search").is_ok());
        for bad in ["", "rm;drop table events", "Rm_Books", "1books", "rm books"] {
            assert!(matches!(
                PostgresTenantStore::<JsonValue>::new(pool.clone(), bad),
                Err(ReadModelError::InvalidTable(_))
            ));
        }
    }
}
