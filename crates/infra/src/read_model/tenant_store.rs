use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use folio_core::{AggregateId, TenantId};

#[derive(Debug, Error)]
pub enum ReadModelError {
    #[error("read model backend failure: {0}")]
    Backend(String),

    #[error("read model row is not valid JSON for its type: {0}")]
    Serialization(String),

    #[error("invalid read model table name: {0:?}")]
    InvalidTable(String),
}

/// Tenant-isolated row store for disposable read models, keyed by entity id.
///
/// Every call names its tenant; there is no cross-tenant read.
#[async_trait]
pub trait TenantStore<V>: Send + Sync {
    async fn get(&self, tenant_id: &TenantId, key: AggregateId)
    -> Result<Option<V>, ReadModelError>;

    async fn upsert(
        &self,
        tenant_id: &TenantId,
        key: AggregateId,
        value: V,
    ) -> Result<(), ReadModelError>;

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<V>, ReadModelError>;

    /// Remove every row of one tenant (rebuild support).
    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), ReadModelError>;
}

#[async_trait]
impl<V, S> TenantStore<V> for Arc<S>
where
    V: Send + 'static,
    S: TenantStore<V> + ?Sized,
{
    async fn get(
        &self,
        tenant_id: &TenantId,
        key: AggregateId,
    ) -> Result<Option<V>, ReadModelError> {
        (**self).get(tenant_id, key).await
    }

    async fn upsert(
        &self,
        tenant_id: &TenantId,
        key: AggregateId,
        value: V,
    ) -> Result<(), ReadModelError> {
        (**self).upsert(tenant_id, key, value).await
    }

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<V>, ReadModelError> {
        (**self).list(tenant_id).await
    }

    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), ReadModelError> {
        (**self).clear_tenant(tenant_id).await
    }
}

/// In-memory tenant-isolated store for tests/dev.
#[derive(Debug)]
pub struct InMemoryTenantStore<V> {
    inner: RwLock<HashMap<(TenantId, AggregateId), V>>,
}

impl<V> InMemoryTenantStore<V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> Default for InMemoryTenantStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> ReadModelError {
    ReadModelError::Backend("read model lock poisoned".to_string())
}

#[async_trait]
impl<V> TenantStore<V> for InMemoryTenantStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(
        &self,
        tenant_id: &TenantId,
        key: AggregateId,
    ) -> Result<Option<V>, ReadModelError> {
        let map = self.inner.read().map_err(poisoned)?;
        Ok(map.get(&(tenant_id.clone(), key)).cloned())
    }

    async fn upsert(
        &self,
        tenant_id: &TenantId,
        key: AggregateId,
        value: V,
    ) -> Result<(), ReadModelError> {
        let mut map = self.inner.write().map_err(poisoned)?;
        map.insert((tenant_id.clone(), key), value);
        Ok(())
    }

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<V>, ReadModelError> {
        let map = self.inner.read().map_err(poisoned)?;
        Ok(map
            .iter()
            .filter_map(|((t, _k), v)| if t == tenant_id { Some(v.clone()) } else { None })
            .collect())
    }

    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), ReadModelError> {
        let mut map = self.inner.write().map_err(poisoned)?;
        map.retain(|(t, _k), _v| t != tenant_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rows_are_partitioned_by_tenant() {
        let store = InMemoryTenantStore::<String>::new();
        let acme = TenantId::parse("acme").unwrap();
        let globex = TenantId::parse("globex").unwrap();
        let id = AggregateId::new();

        store.upsert(&acme, id, "acme row".to_string()).await.unwrap();
        store.upsert(&globex, AggregateId::new(), "globex row".to_string()).await.unwrap();

        assert_eq!(store.get(&acme, id).await.unwrap().as_deref(), Some("acme row"));
        assert_eq!(store.get(&globex, id).await.unwrap(), None);

        store.clear_tenant(&acme).await.unwrap();
        assert!(store.list(&acme).await.unwrap().is_empty());
        assert_eq!(store.list(&globex).await.unwrap().len(), 1);
    }
}
