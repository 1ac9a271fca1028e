//! Outward error classification.
//!
//! Every failure the service surfaces maps onto one [`ErrorClass`], which fixes
//! the transport status. Messages for the rejected and not-found classes stay
//! generic so they leak nothing about other tenants or taken keys.

use serde::{Deserialize, Serialize};

use folio_auth::GuardError;

use crate::notifications::ProjectionLagTimeout;
use crate::stream_runtime::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    PreconditionFailed,
    Timeout,
    Internal,
}

impl ErrorClass {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorClass::Validation => 400,
            ErrorClass::Unauthenticated => 401,
            ErrorClass::Forbidden => 403,
            ErrorClass::NotFound => 404,
            ErrorClass::Conflict => 409,
            ErrorClass::PreconditionFailed => 412,
            ErrorClass::Timeout => 504,
            ErrorClass::Internal => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Unauthenticated => "unauthenticated",
            ErrorClass::Forbidden => "forbidden",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Conflict => "conflict",
            ErrorClass::PreconditionFailed => "precondition_failed",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that know their outward class.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for RuntimeError {
    fn class(&self) -> ErrorClass {
        match self {
            RuntimeError::PreconditionFailed { .. } => ErrorClass::PreconditionFailed,
            RuntimeError::NotFound => ErrorClass::NotFound,
            RuntimeError::Validation(_) | RuntimeError::InvariantViolation(_) => {
                ErrorClass::Validation
            }
            RuntimeError::AlreadyExists | RuntimeError::Conflict(_) | RuntimeError::Rejected => {
                ErrorClass::Conflict
            }
            RuntimeError::TenantMismatch(_) => ErrorClass::Forbidden,
            RuntimeError::Deserialize(_) | RuntimeError::Store(_) => ErrorClass::Internal,
        }
    }
}

impl Classify for GuardError {
    fn class(&self) -> ErrorClass {
        match self {
            GuardError::BadRequest(_) => ErrorClass::Validation,
            GuardError::InvalidCredential(_) => ErrorClass::Unauthenticated,
            GuardError::Forbidden => ErrorClass::Forbidden,
            GuardError::UnknownTenant => ErrorClass::NotFound,
            GuardError::DirectoryUnavailable(_) => ErrorClass::Internal,
        }
    }
}

impl Classify for ProjectionLagTimeout {
    fn class(&self) -> ErrorClass {
        ErrorClass::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::EventStoreError;
    use folio_core::ExpectedVersion;
    use std::time::Duration;

    #[test]
    fn runtime_errors_map_to_transport_status() {
        let stale = RuntimeError::PreconditionFailed {
            expected: ExpectedVersion::Exact(1),
            actual: 2,
        };
        assert_eq!(stale.class().http_status(), 412);
        assert_eq!(RuntimeError::NotFound.class().http_status(), 404);
        assert_eq!(RuntimeError::Validation("title".into()).class().http_status(), 400);
        assert_eq!(RuntimeError::Rejected.class().http_status(), 409);
        assert_eq!(RuntimeError::AlreadyExists.class(), ErrorClass::Conflict);
        assert_eq!(
            RuntimeError::Store(EventStoreError::Backend("down".into())).class(),
            ErrorClass::Internal
        );
    }

    #[test]
    fn guard_and_lag_errors_are_classified() {
        assert_eq!(GuardError::UnknownTenant.class().http_status(), 404);
        assert_eq!(GuardError::Forbidden.class().http_status(), 403);
        assert_eq!(GuardError::BadRequest("header".into()).class().http_status(), 400);
        assert_eq!(
            GuardError::DirectoryUnavailable("db".into()).class().http_status(),
            500
        );
        let lag = ProjectionLagTimeout {
            waited: Duration::from_millis(5),
        };
        assert_eq!(lag.class().http_status(), 504);
        assert_eq!(lag.class().to_string(), "timeout");
    }
}
