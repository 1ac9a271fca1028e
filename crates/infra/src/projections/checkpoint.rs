//! Projection checkpoint persistence.
//!
//! A checkpoint is the last global position a projection has applied for one
//! tenant. Checkpoints let a projection:
//! - resume after a restart without reprocessing or skipping events
//! - be rebuilt for one tenant (clear its checkpoint and rows, replay)

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use folio_core::TenantId;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, tenant_id: &TenantId, projection: &str)
    -> Result<Option<u64>, CheckpointError>;

    async fn save(
        &self,
        tenant_id: &TenantId,
        projection: &str,
        position: u64,
    ) -> Result<(), CheckpointError>;

    async fn clear(&self, tenant_id: &TenantId, projection: &str) -> Result<(), CheckpointError>;

    /// Highest checkpoint of `projection` across all tenants (0 when none).
    ///
    /// The engine processes the global log in order, so this is where a
    /// restarted worker resumes.
    async fn max_position(&self, projection: &str) -> Result<u64, CheckpointError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn load(
        &self,
        tenant_id: &TenantId,
        projection: &str,
    ) -> Result<Option<u64>, CheckpointError> {
        (**self).load(tenant_id, projection).await
    }

    async fn save(
        &self,
        tenant_id: &TenantId,
        projection: &str,
        position: u64,
    ) -> Result<(), CheckpointError> {
        (**self).save(tenant_id, projection, position).await
    }

    async fn clear(&self, tenant_id: &TenantId, projection: &str) -> Result<(), CheckpointError> {
        (**self).clear(tenant_id, projection).await
    }

    async fn max_position(&self, projection: &str) -> Result<u64, CheckpointError> {
        (**self).max_position(projection).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<HashMap<(TenantId, String), u64>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> CheckpointError {
    CheckpointError::Backend("checkpoint lock poisoned".to_string())
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(
        &self,
        tenant_id: &TenantId,
        projection: &str,
    ) -> Result<Option<u64>, CheckpointError> {
        let map = self.inner.read().map_err(poisoned)?;
        Ok(map.get(&(tenant_id.clone(), projection.to_string())).copied())
    }

    async fn save(
        &self,
        tenant_id: &TenantId,
        projection: &str,
        position: u64,
    ) -> Result<(), CheckpointError> {
        let mut map = self.inner.write().map_err(poisoned)?;
        map.insert((tenant_id.clone(), projection.to_string()), position);
        Ok(())
    }

    async fn clear(&self, tenant_id: &TenantId, projection: &str) -> Result<(), CheckpointError> {
        let mut map = self.inner.write().map_err(poisoned)?;
        map.remove(&(tenant_id.clone(), projection.to_string()));
        Ok(())
    }

    async fn max_position(&self, projection: &str) -> Result<u64, CheckpointError> {
        let map = self.inner.read().map_err(poisoned)?;
        Ok(map
            .iter()
            .filter(|((_, p), _)| p == projection)
            .map(|(_, position)| *position)
            .max()
            .unwrap_or(0))
    }
}

/// Postgres-backed checkpoint store (`projection_checkpoints` table).
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn backend(operation: &str, err: sqlx::Error) -> CheckpointError {
    CheckpointError::Backend(format!("sqlx error in {operation}: {err}"))
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(
        &self,
        tenant_id: &TenantId,
        projection: &str,
    ) -> Result<Option<u64>, CheckpointError> {
        let position: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT position
            FROM projection_checkpoints
            WHERE tenant_id = $1 AND projection = $2
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(projection)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| backend("load_checkpoint", e))?;

        Ok(position.map(|p| p as u64))
    }

    async fn save(
        &self,
        tenant_id: &TenantId,
        projection: &str,
        position: u64,
    ) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            INSERT INTO projection_checkpoints (tenant_id, projection, position)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, projection)
            DO UPDATE SET
                position = EXCLUDED.position,
                updated_at = NOW()
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(projection)
        .bind(position as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("save_checkpoint", e))?;

        Ok(())
    }

    async fn clear(&self, tenant_id: &TenantId, projection: &str) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM projection_checkpoints WHERE tenant_id = $1 AND projection = $2")
            .bind(tenant_id.as_str())
            .bind(projection)
            .execute(&*self.pool)
            .await
            .map_err(|e| backend("clear_checkpoint", e))?;
        Ok(())
    }

    async fn max_position(&self, projection: &str) -> Result<u64, CheckpointError> {
        let position: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(position) FROM projection_checkpoints WHERE projection = $1",
        )
        .bind(projection)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| backend("max_checkpoint", e))?;

        Ok(position.unwrap_or(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn max_position_spans_tenants_of_one_projection() {
        let store = InMemoryCheckpointStore::new();
        let acme = TenantId::parse("acme").unwrap();
        let globex = TenantId::parse("globex").unwrap();

        assert_eq!(store.max_position("catalog.book_search").await.unwrap(), 0);

        store.save(&acme, "catalog.book_search", 7).await.unwrap();
        store.save(&globex, "catalog.book_search", 12).await.unwrap();
        store.save(&acme, "tenancy.accounts", 40).await.unwrap();

        assert_eq!(store.max_position("catalog.book_search").await.unwrap(), 12);
        assert_eq!(store.load(&acme, "catalog.book_search").await.unwrap(), Some(7));

        store.clear(&globex, "catalog.book_search").await.unwrap();
        assert_eq!(store.load(&globex, "catalog.book_search").await.unwrap(), None);
        assert_eq!(store.max_position("catalog.book_search").await.unwrap(), 7);
    }
}
