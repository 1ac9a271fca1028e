//! `tenancy.directory`: which tenants exist.
//!
//! Backs the guard's [`TenantDirectory`], so requests naming a tenant that was
//! never created are rejected before they reach any store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use folio_auth::{GuardError, TenantDirectory};
use folio_core::TenantId;
use folio_events::StreamAggregate;
use folio_tenancy::{Tenant, TenantEvent};

use crate::event_store::RecordedEvent;
use crate::read_model::{ReadModelError, TenantStore};

use super::{Projection, ProjectionError, already_applied, decode_scoped};

pub const DIRECTORY: &str = "tenancy.directory";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRow {
    pub tenant_id: TenantId,
    pub name: String,
    pub administrator_count: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub last_position: u64,
}

impl TenantRow {
    pub fn fold(row: Option<Self>, event: &RecordedEvent) -> Result<Option<Self>, ProjectionError> {
        if already_applied(row.as_ref().map(|r| r.last_position), event) {
            return Ok(None);
        }
        let payload: TenantEvent = decode_scoped(event)?;
        let mut row = row.unwrap_or_else(|| TenantRow {
            tenant_id: event.tenant_id.clone(),
            name: String::new(),
            administrator_count: 0,
            created_at: None,
            version: 0,
            last_position: 0,
        });

        match payload {
            TenantEvent::TenantCreated(e) => {
                row.name = e.name;
                row.administrator_count = 1;
                row.created_at = Some(e.occurred_at);
            }
            TenantEvent::AdministratorGranted(_) => row.administrator_count += 1,
            TenantEvent::AdministratorRevoked(_) => {
                row.administrator_count = row.administrator_count.saturating_sub(1)
            }
        }

        row.version = event.sequence_number;
        row.last_position = event.global_position;
        Ok(Some(row))
    }

    /// A row only counts once the creation event has been folded.
    pub fn is_created(&self) -> bool {
        self.created_at.is_some()
    }
}

#[derive(Debug)]
pub struct DirectoryProjection<S> {
    store: S,
}

impl<S> DirectoryProjection<S>
where
    S: TenantStore<TenantRow>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn get(&self, tenant_id: &TenantId) -> Result<Option<TenantRow>, ReadModelError> {
        Ok(self
            .store
            .get(tenant_id, Tenant::stream_id(tenant_id))
            .await?
            .filter(TenantRow::is_created))
    }
}

#[async_trait]
impl<S> Projection for DirectoryProjection<S>
where
    S: TenantStore<TenantRow>,
{
    fn name(&self) -> &'static str {
        DIRECTORY
    }

    fn handles(&self, event: &RecordedEvent) -> bool {
        event.aggregate_type == <Tenant as StreamAggregate>::AGGREGATE_TYPE
    }

    async fn apply(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let existing = self.store.get(&event.tenant_id, event.aggregate_id).await?;
        if let Some(row) = TenantRow::fold(existing, event)? {
            self.store
                .upsert(&event.tenant_id, event.aggregate_id, row)
                .await?;
        }
        Ok(())
    }

    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), ProjectionError> {
        self.store.clear_tenant(tenant_id).await?;
        Ok(())
    }
}

#[async_trait]
impl<S> TenantDirectory for DirectoryProjection<S>
where
    S: TenantStore<TenantRow>,
{
    async fn tenant_exists(&self, tenant_id: &TenantId) -> Result<bool, GuardError> {
        match self.get(tenant_id).await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => {
                error!(tenant = %tenant_id, error = %e, "tenant directory lookup failed");
                Err(GuardError::DirectoryUnavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_model::InMemoryTenantStore;
    use folio_core::AccountId;
    use folio_events::Event;
    use folio_tenancy::TenantCreated;
    use uuid::Uuid;

    #[tokio::test]
    async fn created_tenant_is_listed_in_directory() {
        let directory = DirectoryProjection::new(InMemoryTenantStore::new());
        let acme = TenantId::parse("acme").unwrap();
        assert!(!directory.tenant_exists(&acme).await.unwrap());

        let payload = TenantEvent::TenantCreated(TenantCreated {
            tenant_id: acme.clone(),
            name: "Acme".to_string(),
            founding_admin: AccountId::new(),
            occurred_at: Utc::now(),
        });
        let event = RecordedEvent {
            global_position: 1,
            event_id: Uuid::now_v7(),
            tenant_id: acme.clone(),
            aggregate_id: Tenant::stream_id(&acme),
            aggregate_type: "tenancy.tenant".to_string(),
            sequence_number: 1,
            event_type: payload.event_type().to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            committed_at: Utc::now(),
            payload: serde_json::to_value(&payload).unwrap(),
        };
        directory.apply(&event).await.unwrap();

        assert!(directory.tenant_exists(&acme).await.unwrap());
        assert!(!directory
            .tenant_exists(&TenantId::parse("globex").unwrap())
            .await
            .unwrap());
        let row = directory.get(&acme).await.unwrap().unwrap();
        assert_eq!(row.name, "Acme");
        assert_eq!(row.administrator_count, 1);
    }
}
