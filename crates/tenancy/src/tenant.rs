//! Tenant aggregate: one stream per tenant partition.
//!
//! Creating a tenant is an ordinary command against a brand new partition; the
//! stream id is derived from the tenant key so every tenant has exactly one.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use folio_core::{AccountId, Aggregate, AggregateId, AggregateRoot, DomainError, TenantId};
use folio_events::{Event, StreamAggregate, TenantScoped};

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate
// ─────────────────────────────────────────────────────────────────────────────

/// Tenant aggregate.
///
/// # Invariants
/// - A tenant is created exactly once.
/// - A tenant always has at least one administrator once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    id: AggregateId,
    tenant_id: TenantId,
    name: String,
    administrators: BTreeSet<AccountId>,
    version: u64,
    created: bool,
}

impl Tenant {
    /// The stream id of a tenant's own aggregate.
    pub fn stream_id(tenant_id: &TenantId) -> AggregateId {
        AggregateId::derived(<Self as StreamAggregate>::AGGREGATE_TYPE, tenant_id.as_str())
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn administrators(&self) -> &BTreeSet<AccountId> {
        &self.administrators
    }

    pub fn is_administrator(&self, account_id: AccountId) -> bool {
        self.administrators.contains(&account_id)
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for Tenant {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTenant {
    pub name: String,
    pub founding_admin: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantAdministrator {
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeAdministrator {
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantCommand {
    CreateTenant(CreateTenant),
    GrantAdministrator(GrantAdministrator),
    RevokeAdministrator(RevokeAdministrator),
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantCreated {
    pub tenant_id: TenantId,
    pub name: String,
    pub founding_admin: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdministratorGranted {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdministratorRevoked {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantEvent {
    TenantCreated(TenantCreated),
    AdministratorGranted(AdministratorGranted),
    AdministratorRevoked(AdministratorRevoked),
}

impl TenantEvent {
    pub const CREATED: &'static str = "tenancy.tenant.created";
    pub const ADMINISTRATOR_GRANTED: &'static str = "tenancy.tenant.administrator_granted";
    pub const ADMINISTRATOR_REVOKED: &'static str = "tenancy.tenant.administrator_revoked";
}

impl Event for TenantEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TenantEvent::TenantCreated(_) => Self::CREATED,
            TenantEvent::AdministratorGranted(_) => Self::ADMINISTRATOR_GRANTED,
            TenantEvent::AdministratorRevoked(_) => Self::ADMINISTRATOR_REVOKED,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TenantEvent::TenantCreated(e) => e.occurred_at,
            TenantEvent::AdministratorGranted(e) => e.occurred_at,
            TenantEvent::AdministratorRevoked(e) => e.occurred_at,
        }
    }
}

impl TenantScoped for TenantEvent {
    fn tenant_id(&self) -> &TenantId {
        match self {
            TenantEvent::TenantCreated(e) => &e.tenant_id,
            TenantEvent::AdministratorGranted(e) => &e.tenant_id,
            TenantEvent::AdministratorRevoked(e) => &e.tenant_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Behaviour
// ─────────────────────────────────────────────────────────────────────────────

impl Aggregate for Tenant {
    type Command = TenantCommand;
    type Event = TenantEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TenantEvent::TenantCreated(e) => {
                self.name = e.name.clone();
                self.administrators.clear();
                self.administrators.insert(e.founding_admin);
                self.created = true;
            }
            TenantEvent::AdministratorGranted(e) => {
                self.administrators.insert(e.account_id);
            }
            TenantEvent::AdministratorRevoked(e) => {
                self.administrators.remove(&e.account_id);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            TenantCommand::CreateTenant(cmd) => self.handle_create(cmd),
            TenantCommand::GrantAdministrator(cmd) => self.handle_grant(cmd),
            TenantCommand::RevokeAdministrator(cmd) => self.handle_revoke(cmd),
        }
    }
}

impl StreamAggregate for Tenant {
    const AGGREGATE_TYPE: &'static str = "tenancy.tenant";

    fn empty(tenant_id: &TenantId, aggregate_id: AggregateId) -> Self {
        Self {
            id: aggregate_id,
            tenant_id: tenant_id.clone(),
            name: String::new(),
            administrators: BTreeSet::new(),
            version: 0,
            created: false,
        }
    }

    fn is_creation(command: &Self::Command) -> bool {
        matches!(command, TenantCommand::CreateTenant(_))
    }
}

impl Tenant {
    fn ensure_created(&self) -> Result<(), DomainError> {
        if self.created {
            Ok(())
        } else {
            Err(DomainError::not_found())
        }
    }

    fn handle_create(&self, cmd: &CreateTenant) -> Result<Vec<TenantEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("tenant already exists"));
        }
        if self.id != Self::stream_id(&self.tenant_id) {
            return Err(DomainError::invariant(
                "tenant stream id does not derive from the tenant key",
            ));
        }
        let name = cmd.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("tenant name cannot be empty"));
        }

        Ok(vec![TenantEvent::TenantCreated(TenantCreated {
            tenant_id: self.tenant_id.clone(),
            name: name.to_string(),
            founding_admin: cmd.founding_admin,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_grant(&self, cmd: &GrantAdministrator) -> Result<Vec<TenantEvent>, DomainError> {
        self.ensure_created()?;
        if self.is_administrator(cmd.account_id) {
            return Err(DomainError::conflict("account is already an administrator"));
        }

        Ok(vec![TenantEvent::AdministratorGranted(AdministratorGranted {
            tenant_id: self.tenant_id.clone(),
            account_id: cmd.account_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_revoke(&self, cmd: &RevokeAdministrator) -> Result<Vec<TenantEvent>, DomainError> {
        self.ensure_created()?;
        if !self.is_administrator(cmd.account_id) {
            return Err(DomainError::validation("account is not an administrator"));
        }
        if self.administrators.len() == 1 {
            return Err(DomainError::invariant(
                "cannot revoke the last remaining administrator",
            ));
        }

        Ok(vec![TenantEvent::AdministratorRevoked(AdministratorRevoked {
            tenant_id: self.tenant_id.clone(),
            account_id: cmd.account_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_events::execute;

    fn acme() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    fn created(founder: AccountId) -> Tenant {
        let tenant_id = acme();
        let mut tenant = Tenant::empty(&tenant_id, Tenant::stream_id(&tenant_id));
        execute(
            &mut tenant,
            &TenantCommand::CreateTenant(CreateTenant {
                name: "Acme Books".into(),
                founding_admin: founder,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        tenant
    }

    #[test]
    fn create_emits_tenant_created_with_founder_as_admin() {
        let founder = AccountId::new();
        let tenant = created(founder);
        assert!(tenant.is_created());
        assert_eq!(tenant.name(), "Acme Books");
        assert!(tenant.is_administrator(founder));
        assert_eq!(tenant.version(), 1);
    }

    #[test]
    fn create_twice_conflicts() {
        let tenant = created(AccountId::new());
        let err = tenant
            .handle(&TenantCommand::CreateTenant(CreateTenant {
                name: "Again".into(),
                founding_admin: AccountId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn create_rejects_foreign_stream_id() {
        let tenant = Tenant::empty(&acme(), AggregateId::new());
        let err = tenant
            .handle(&TenantCommand::CreateTenant(CreateTenant {
                name: "Acme".into(),
                founding_admin: AccountId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn cannot_revoke_last_administrator() {
        let founder = AccountId::new();
        let tenant = created(founder);
        let err = tenant
            .handle(&TenantCommand::RevokeAdministrator(RevokeAdministrator {
                account_id: founder,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn revoke_allowed_while_another_admin_remains() {
        let founder = AccountId::new();
        let second = AccountId::new();
        let mut tenant = created(founder);
        execute(
            &mut tenant,
            &TenantCommand::GrantAdministrator(GrantAdministrator {
                account_id: second,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        execute(
            &mut tenant,
            &TenantCommand::RevokeAdministrator(RevokeAdministrator {
                account_id: founder,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();

        assert!(!tenant.is_administrator(founder));
        assert!(tenant.is_administrator(second));
        assert_eq!(tenant.version(), 3);

        // `second` is now the last one standing.
        let err = tenant
            .handle(&TenantCommand::RevokeAdministrator(RevokeAdministrator {
                account_id: second,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn commands_on_missing_tenant_are_not_found() {
        let tenant_id = acme();
        let tenant = Tenant::empty(&tenant_id, Tenant::stream_id(&tenant_id));
        let err = tenant
            .handle(&TenantCommand::GrantAdministrator(GrantAdministrator {
                account_id: AccountId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }
}
