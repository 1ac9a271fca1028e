//! Tenancy domain module (event-sourced).
//!
//! Tenant partitions with their administrator roster, and the accounts that
//! administer them. Pure deterministic domain logic (no IO, no storage).

pub mod account;
pub mod tenant;

pub use account::{
    Account, AccountCommand, AccountEvent, AccountRegistered, AccountRenamed, RegisterAccount,
    RenameAccount, ACCOUNT_EMAIL_SCOPE,
};
pub use tenant::{
    AdministratorGranted, AdministratorRevoked, CreateTenant, GrantAdministrator,
    RevokeAdministrator, Tenant, TenantCommand, TenantCreated, TenantEvent,
};
