//! Contract between domain aggregates and the stream runtime.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use folio_core::{Aggregate, AggregateId, DomainError, TenantId};

use crate::Event;

/// A business key that must be unique within a tenant (e.g. an e-mail address).
///
/// Claims travel with an append and are checked atomically by the event store;
/// the store, not an application-level pre-check, decides who wins a race.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueClaim {
    pub scope: String,
    pub key: String,
}

impl UniqueClaim {
    pub fn new(scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
        }
    }
}

/// An aggregate that lives in its own event stream.
pub trait StreamAggregate:
    Aggregate<
        Error = DomainError,
        Command: Send + Sync,
        Event: Event + Serialize + DeserializeOwned,
    > + Send
    + Sync
{
    /// Stable aggregate type identifier (e.g. "catalog.book").
    const AGGREGATE_TYPE: &'static str;

    /// Fresh, not-yet-created instance for rehydration.
    fn empty(tenant_id: &TenantId, aggregate_id: AggregateId) -> Self;

    /// Whether the command may start a new stream.
    fn is_creation(command: &Self::Command) -> bool;

    /// Unique business keys an event claims. Most events claim none.
    fn unique_claims(_event: &Self::Event) -> Vec<UniqueClaim> {
        Vec::new()
    }
}
