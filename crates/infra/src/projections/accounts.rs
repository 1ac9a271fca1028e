//! `tenancy.accounts`: one row per account, including whether it administers
//! its tenant.
//!
//! The row is fed by two aggregate types: account streams (registration,
//! renames) and the tenant stream (administrator roster). Folding in global
//! order keeps it convergent regardless of which stream moved last.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use folio_core::{AccountId, TenantId};
use folio_events::StreamAggregate;
use folio_tenancy::{Account, AccountEvent, Tenant, TenantEvent};

use crate::event_store::RecordedEvent;
use crate::read_model::{ReadModelError, TenantStore};

use super::{Projection, ProjectionError, already_applied, decode_scoped};

pub const ACCOUNTS: &str = "tenancy.accounts";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRow {
    pub account_id: AccountId,
    pub tenant_id: TenantId,
    pub email: String,
    pub display_name: String,
    pub is_admin: bool,
    /// Version of the account's own stream.
    pub version: u64,
    pub last_position: u64,
}

enum Change {
    Registered { email: String, display_name: String },
    Renamed { display_name: String },
    Administrator(bool),
}

fn decode_change(event: &RecordedEvent) -> Result<Option<(AccountId, Change)>, ProjectionError> {
    if event.aggregate_type == <Account as StreamAggregate>::AGGREGATE_TYPE {
        let change = match decode_scoped::<AccountEvent>(event)? {
            AccountEvent::AccountRegistered(e) => (
                e.account_id,
                Change::Registered {
                    email: e.email,
                    display_name: e.display_name,
                },
            ),
            AccountEvent::AccountRenamed(e) => (
                e.account_id,
                Change::Renamed {
                    display_name: e.display_name,
                },
            ),
        };
        return Ok(Some(change));
    }

    if event.aggregate_type == <Tenant as StreamAggregate>::AGGREGATE_TYPE {
        let change = match decode_scoped::<TenantEvent>(event)? {
            TenantEvent::TenantCreated(e) => (e.founding_admin, Change::Administrator(true)),
            TenantEvent::AdministratorGranted(e) => (e.account_id, Change::Administrator(true)),
            TenantEvent::AdministratorRevoked(e) => (e.account_id, Change::Administrator(false)),
        };
        return Ok(Some(change));
    }

    Ok(None)
}

impl AccountRow {
    fn blank(tenant_id: &TenantId, account_id: AccountId) -> Self {
        Self {
            account_id,
            tenant_id: tenant_id.clone(),
            email: String::new(),
            display_name: String::new(),
            is_admin: false,
            version: 0,
            last_position: 0,
        }
    }

    /// Whether the account's own registration has been folded in. Rows created
    /// by an administrator grant alone are not.
    pub fn is_registered(&self) -> bool {
        self.version > 0
    }

    /// Fold an account or tenant event into the row it addresses.
    ///
    /// Returns `None` for events that do not concern accounts and for events
    /// the row already reflects.
    pub fn fold(row: Option<Self>, event: &RecordedEvent) -> Result<Option<Self>, ProjectionError> {
        match decode_change(event)? {
            Some((account_id, change)) => Ok(Self::fold_change(row, event, account_id, change)),
            None => Ok(None),
        }
    }

    fn fold_change(
        row: Option<Self>,
        event: &RecordedEvent,
        account_id: AccountId,
        change: Change,
    ) -> Option<Self> {
        if already_applied(row.as_ref().map(|r| r.last_position), event) {
            return None;
        }
        let mut row = row.unwrap_or_else(|| Self::blank(&event.tenant_id, account_id));

        match change {
            Change::Registered {
                email,
                display_name,
            } => {
                row.email = email;
                row.display_name = display_name;
                row.version = event.sequence_number;
            }
            Change::Renamed { display_name } => {
                row.display_name = display_name;
                row.version = event.sequence_number;
            }
            Change::Administrator(is_admin) => row.is_admin = is_admin,
        }

        row.last_position = event.global_position;
        Some(row)
    }
}

#[derive(Debug)]
pub struct AccountsProjection<S> {
    store: S,
}

impl<S> AccountsProjection<S>
where
    S: TenantStore<AccountRow>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn get(
        &self,
        tenant_id: &TenantId,
        account_id: AccountId,
    ) -> Result<Option<AccountRow>, ReadModelError> {
        self.store.get(tenant_id, account_id.into()).await
    }

    /// Registered accounts of one tenant ordered by e-mail.
    pub async fn list(&self, tenant_id: &TenantId) -> Result<Vec<AccountRow>, ReadModelError> {
        let mut rows = self.store.list(tenant_id).await?;
        rows.retain(AccountRow::is_registered);
        rows.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(rows)
    }

    /// The tenant's administrator roster, including grants whose account
    /// registration has not been projected yet.
    pub async fn administrators(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<AccountRow>, ReadModelError> {
        let mut rows = self.store.list(tenant_id).await?;
        rows.retain(|row| row.is_admin);
        rows.sort_by(|a, b| a.email.cmp(&b.email).then(a.account_id.cmp(&b.account_id)));
        Ok(rows)
    }
}

#[async_trait]
impl<S> Projection for AccountsProjection<S>
where
    S: TenantStore<AccountRow>,
{
    fn name(&self) -> &'static str {
        ACCOUNTS
    }

    fn handles(&self, event: &RecordedEvent) -> bool {
        event.aggregate_type == <Account as StreamAggregate>::AGGREGATE_TYPE
            || event.aggregate_type == <Tenant as StreamAggregate>::AGGREGATE_TYPE
    }

    async fn apply(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let Some((account_id, change)) = decode_change(event)? else {
            return Ok(());
        };
        let existing = self.store.get(&event.tenant_id, account_id.into()).await?;
        if let Some(row) = AccountRow::fold_change(existing, event, account_id, change) {
            self.store
                .upsert(&event.tenant_id, account_id.into(), row)
                .await?;
        }
        Ok(())
    }

    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), ProjectionError> {
        self.store.clear_tenant(tenant_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_model::InMemoryTenantStore;
    use chrono::Utc;
    use folio_core::AggregateId;
    use folio_events::Event;
    use folio_tenancy::{AccountRegistered, AdministratorGranted, AdministratorRevoked, TenantCreated};
    use serde::Serialize;
    use uuid::Uuid;

    fn acme() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    fn recorded<E: Event + Serialize>(
        position: u64,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        sequence_number: u64,
        payload: &E,
    ) -> RecordedEvent {
        RecordedEvent {
            global_position: position,
            event_id: Uuid::now_v7(),
            tenant_id: acme(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            sequence_number,
            event_type: payload.event_type().to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            committed_at: Utc::now(),
            payload: serde_json::to_value(payload).unwrap(),
        }
    }

    #[tokio::test]
    async fn admin_flag_follows_tenant_roster() {
        let projection = AccountsProjection::new(InMemoryTenantStore::new());
        let founder = AccountId::new();
        let helper = AccountId::new();
        let tenant_stream = Tenant::stream_id(&acme());

        let register = |position, account: AccountId, email: &str| {
            recorded(
                position,
                account.into(),
                "tenancy.account",
                1,
                &AccountEvent::AccountRegistered(AccountRegistered {
                    tenant_id: acme(),
                    account_id: account,
                    email: email.to_string(),
                    display_name: email.to_string(),
                    occurred_at: Utc::now(),
                }),
            )
        };

        let events = vec![
            register(1, founder, "founder@example.com"),
            recorded(
                2,
                tenant_stream,
                "tenancy.tenant",
                1,
                &TenantEvent::TenantCreated(TenantCreated {
                    tenant_id: acme(),
                    name: "Acme".to_string(),
                    founding_admin: founder,
                    occurred_at: Utc::now(),
                }),
            ),
            // Granted before the account's own registration is projected.
            recorded(
                3,
                tenant_stream,
                "tenancy.tenant",
                2,
                &TenantEvent::AdministratorGranted(AdministratorGranted {
                    tenant_id: acme(),
                    account_id: helper,
                    occurred_at: Utc::now(),
                }),
            ),
            register(4, helper, "helper@example.com"),
            recorded(
                5,
                tenant_stream,
                "tenancy.tenant",
                3,
                &TenantEvent::AdministratorRevoked(AdministratorRevoked {
                    tenant_id: acme(),
                    account_id: founder,
                    occurred_at: Utc::now(),
                }),
            ),
        ];
        for event in &events[..3] {
            assert!(projection.handles(event));
            projection.apply(event).await.unwrap();
        }
        // Helper is on the roster but not yet a listed account.
        let listed = projection.list(&acme()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].account_id, founder);
        assert_eq!(projection.administrators(&acme()).await.unwrap().len(), 2);

        for event in &events[3..] {
            assert!(projection.handles(event));
            projection.apply(event).await.unwrap();
        }
        assert_eq!(projection.list(&acme()).await.unwrap().len(), 2);
        // Replay is a no-op.
        for event in &events {
            projection.apply(event).await.unwrap();
        }

        let founder_row = projection.get(&acme(), founder).await.unwrap().unwrap();
        assert!(!founder_row.is_admin);
        assert_eq!(founder_row.email, "founder@example.com");

        let helper_row = projection.get(&acme(), helper).await.unwrap().unwrap();
        assert!(helper_row.is_admin);
        assert_eq!(helper_row.version, 1);
        assert_eq!(helper_row.last_position, 4);

        let admins = projection.administrators(&acme()).await.unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].account_id, helper);
    }
}
