//! Tenant resolution and isolation guard.
//!
//! Every request is turned into a [`TenantContext`] before it may touch the
//! store, runtime or read models. The order of checks matters: a credential
//! bound to another tenant is rejected before the directory is consulted, so a
//! mismatched caller learns nothing about which tenants exist.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use folio_core::{AccountId, TenantId};

use crate::claims::{ClaimsError, CredentialClaims, validate_claims};

/// Header an HTTP adapter reads the declared tenant from.
pub const TENANT_HEADER: &str = "X-Tenant-Id";

/// What the transport layer knows about a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Raw declared tenant (e.g. the `X-Tenant-Id` header value).
    pub declared_tenant: Option<String>,

    /// Verified credential claims, if the caller is authenticated.
    pub claims: Option<CredentialClaims>,
}

impl RequestContext {
    pub fn anonymous(declared_tenant: impl Into<String>) -> Self {
        Self {
            declared_tenant: Some(declared_tenant.into()),
            claims: None,
        }
    }

    pub fn authenticated(declared_tenant: impl Into<String>, claims: CredentialClaims) -> Self {
        Self {
            declared_tenant: Some(declared_tenant.into()),
            claims: Some(claims),
        }
    }
}

/// Tenant context for a request.
///
/// Only the guard constructs it, so holding one means the tenant was resolved,
/// exists, and agrees with the caller's credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
    subject: Option<AccountId>,
    privileged: bool,
}

impl TenantContext {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn subject(&self) -> Option<AccountId> {
        self.subject
    }

    /// Whether the caller may see soft-deleted rows.
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(#[from] ClaimsError),

    /// Declared tenant differs from the credential's tenant.
    #[error("forbidden")]
    Forbidden,

    #[error("unknown tenant")]
    UnknownTenant,

    #[error("tenant directory unavailable: {0}")]
    DirectoryUnavailable(String),
}

/// Source of truth for which tenants exist.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn tenant_exists(&self, tenant_id: &TenantId) -> Result<bool, GuardError>;
}

#[derive(Clone)]
pub struct TenantGuard {
    directory: Arc<dyn TenantDirectory>,
}

impl TenantGuard {
    pub fn new(directory: Arc<dyn TenantDirectory>) -> Self {
        Self { directory }
    }

    /// Parse the declared tenant. Missing or malformed is a bad request.
    pub fn resolve_tenant(ctx: &RequestContext) -> Result<TenantId, GuardError> {
        let raw = ctx
            .declared_tenant
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| GuardError::BadRequest(format!("missing {TENANT_HEADER}")))?;

        TenantId::parse(raw).map_err(|e| GuardError::BadRequest(e.to_string()))
    }

    /// The declared tenant and the credential's tenant must match exactly.
    pub fn validate_tenant_matches_credential(
        tenant_id: &TenantId,
        claims: &CredentialClaims,
    ) -> Result<(), GuardError> {
        if &claims.tenant_id == tenant_id {
            return Ok(());
        }
        warn!(
            security = true,
            declared_tenant = %tenant_id,
            credential_tenant = %claims.tenant_id,
            subject = %claims.subject,
            "tenant mismatch between request and credential"
        );
        Err(GuardError::Forbidden)
    }

    pub async fn authorize(&self, ctx: &RequestContext) -> Result<TenantContext, GuardError> {
        self.authorize_at(ctx, Utc::now()).await
    }

    /// [`TenantGuard::authorize`] against an explicit clock.
    pub async fn authorize_at(
        &self,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<TenantContext, GuardError> {
        let tenant_id = Self::resolve_tenant(ctx)?;

        if let Some(claims) = &ctx.claims {
            validate_claims(claims, now).inspect_err(|e| {
                warn!(
                    security = true,
                    tenant = %tenant_id,
                    subject = %claims.subject,
                    error = %e,
                    "credential rejected"
                );
            })?;
            Self::validate_tenant_matches_credential(&tenant_id, claims)?;
        }

        if !self.directory.tenant_exists(&tenant_id).await? {
            warn!(security = true, tenant = %tenant_id, "request for unknown tenant");
            return Err(GuardError::UnknownTenant);
        }

        debug!(tenant = %tenant_id, authenticated = ctx.claims.is_some(), "tenant resolved");

        Ok(TenantContext {
            tenant_id,
            subject: ctx.claims.as_ref().map(|c| c.subject),
            privileged: ctx.claims.as_ref().is_some_and(CredentialClaims::is_admin),
        })
    }
}
