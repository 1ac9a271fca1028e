//! Opaque concurrency token (ETag) for stream versions.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::aggregate::ExpectedVersion;
use crate::error::DomainError;

/// The externally visible form of a stream version.
///
/// Callers receive it after every read or write and must present it unchanged
/// as the precondition of their next mutation. Parsing accepts the ETag-quoted
/// form (`"3"`) as well as the bare form (`3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConcurrencyToken(u64);

impl ConcurrencyToken {
    pub fn from_version(version: u64) -> Self {
        Self(version)
    }

    pub fn version(self) -> u64 {
        self.0
    }

    pub fn expected_version(self) -> ExpectedVersion {
        ExpectedVersion::from(self.0)
    }

    /// Render as a quoted HTTP entity tag.
    pub fn to_etag(self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl core::fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConcurrencyToken {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let unquoted = trimmed
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap_or(trimmed);
        unquoted
            .parse::<u64>()
            .map(Self)
            .map_err(|_| DomainError::validation(format!("malformed concurrency token: {s:?}")))
    }
}

impl TryFrom<String> for ConcurrencyToken {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConcurrencyToken> for String {
    fn from(value: ConcurrencyToken) -> Self {
        value.to_string()
    }
}
