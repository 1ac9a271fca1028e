//! `folio-auth`: tenant resolution and isolation boundary.
//!
//! Decoupled from HTTP and storage: the transport fills a [`RequestContext`],
//! the guard turns it into a [`TenantContext`] or a typed rejection.

pub mod claims;
pub mod guard;
pub mod roles;

pub use claims::{ClaimsError, CredentialClaims, validate_claims};
pub use guard::{
    GuardError, RequestContext, TENANT_HEADER, TenantContext, TenantDirectory, TenantGuard,
};
pub use roles::Role;
