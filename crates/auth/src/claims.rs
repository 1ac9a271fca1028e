use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use folio_core::{AccountId, TenantId};

use crate::Role;

/// Credential claims (transport-agnostic).
///
/// The set of claims the core expects once a credential has been decoded and
/// its signature verified by whatever authentication layer is in use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    /// Account the credential was issued to.
    pub subject: AccountId,

    /// Tenant the credential is bound to.
    pub tenant_id: TenantId,

    pub roles: Vec<Role>,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CredentialClaims {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(Role::is_admin)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClaimsError {
    #[error("credential has expired")]
    Expired,

    #[error("credential not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid credential time window (expires_at <= issued_at)")]
    InvalidTimeWindow,
}

/// Validate the claims' time window.
///
/// Signature verification and decoding happen outside this crate.
pub fn validate_claims(claims: &CredentialClaims, now: DateTime<Utc>) -> Result<(), ClaimsError> {
    if claims.expires_at <= claims.issued_at {
        return Err(ClaimsError::InvalidTimeWindow);
    }
    if now < claims.issued_at {
        return Err(ClaimsError::NotYetValid);
    }
    if now >= claims.expires_at {
        return Err(ClaimsError::Expired);
    }
    Ok(())
}
