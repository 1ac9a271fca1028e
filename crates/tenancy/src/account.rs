//! Account aggregate: an identity that can administer a tenant.
//!
//! E-mail uniqueness within a tenant is not checked here. The registration
//! event claims the normalized address and the event store arbitrates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use folio_core::{AccountId, Aggregate, AggregateId, AggregateRoot, DomainError, TenantId};
use folio_events::{Event, StreamAggregate, TenantScoped, UniqueClaim};

/// Unique-claim scope for account e-mail addresses.
pub const ACCOUNT_EMAIL_SCOPE: &str = "account-email";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    id: AccountId,
    tenant_id: TenantId,
    email: String,
    display_name: String,
    version: u64,
    created: bool,
}

impl Account {
    pub fn account_id(&self) -> AccountId {
        self.id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for Account {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAccount {
    pub email: String,
    pub display_name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameAccount {
    pub display_name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountCommand {
    RegisterAccount(RegisterAccount),
    RenameAccount(RenameAccount),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRegistered {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub email: String,
    pub display_name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRenamed {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub display_name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEvent {
    AccountRegistered(AccountRegistered),
    AccountRenamed(AccountRenamed),
}

impl AccountEvent {
    pub const REGISTERED: &'static str = "tenancy.account.registered";
    pub const RENAMED: &'static str = "tenancy.account.renamed";
}

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountRegistered(_) => Self::REGISTERED,
            AccountEvent::AccountRenamed(_) => Self::RENAMED,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AccountEvent::AccountRegistered(e) => e.occurred_at,
            AccountEvent::AccountRenamed(e) => e.occurred_at,
        }
    }
}

impl TenantScoped for AccountEvent {
    fn tenant_id(&self) -> &TenantId {
        match self {
            AccountEvent::AccountRegistered(e) => &e.tenant_id,
            AccountEvent::AccountRenamed(e) => &e.tenant_id,
        }
    }
}

impl Aggregate for Account {
    type Command = AccountCommand;
    type Event = AccountEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AccountEvent::AccountRegistered(e) => {
                self.email = e.email.clone();
                self.display_name = e.display_name.clone();
                self.created = true;
            }
            AccountEvent::AccountRenamed(e) => {
                self.display_name = e.display_name.clone();
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AccountCommand::RegisterAccount(cmd) => {
                if self.created {
                    return Err(DomainError::conflict("account already exists"));
                }
                let email = normalize_email(&cmd.email)?;
                let display_name = validate_display_name(&cmd.display_name)?;
                Ok(vec![AccountEvent::AccountRegistered(AccountRegistered {
                    tenant_id: self.tenant_id.clone(),
                    account_id: self.id,
                    email,
                    display_name,
                    occurred_at: cmd.occurred_at,
                })])
            }
            AccountCommand::RenameAccount(cmd) => {
                if !self.created {
                    return Err(DomainError::not_found());
                }
                let display_name = validate_display_name(&cmd.display_name)?;
                if display_name == self.display_name {
                    return Err(DomainError::validation("display name is unchanged"));
                }
                Ok(vec![AccountEvent::AccountRenamed(AccountRenamed {
                    tenant_id: self.tenant_id.clone(),
                    account_id: self.id,
                    display_name,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

impl StreamAggregate for Account {
    const AGGREGATE_TYPE: &'static str = "tenancy.account";

    fn empty(tenant_id: &TenantId, aggregate_id: AggregateId) -> Self {
        Self {
            id: AccountId::from(aggregate_id),
            tenant_id: tenant_id.clone(),
            email: String::new(),
            display_name: String::new(),
            version: 0,
            created: false,
        }
    }

    fn is_creation(command: &Self::Command) -> bool {
        matches!(command, AccountCommand::RegisterAccount(_))
    }

    fn unique_claims(event: &Self::Event) -> Vec<UniqueClaim> {
        match event {
            AccountEvent::AccountRegistered(e) => {
                vec![UniqueClaim::new(ACCOUNT_EMAIL_SCOPE, e.email.clone())]
            }
            AccountEvent::AccountRenamed(_) => Vec::new(),
        }
    }
}

/// Lowercase + trim, with a shape check (`local@domain.tld`).
pub fn normalize_email(raw: &str) -> Result<String, DomainError> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(DomainError::validation("invalid e-mail address"))
    }
}

fn validate_display_name(raw: &str) -> Result<String, DomainError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(DomainError::validation("display name cannot be empty"));
    }
    if name.chars().count() > 120 {
        return Err(DomainError::validation("display name is too long"));
    }
    Ok(name.to_string())
}
