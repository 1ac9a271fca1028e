//! Projections (read model builders) and the engine that drives them.
//!
//! Projections consume the global event log and build query-optimized read
//! models. All projections are:
//! - **Rebuildable**: can be reconstructed from the event log, per tenant
//! - **Tenant-isolated**: rows are partitioned by tenant
//! - **Idempotent**: every row remembers the last global position folded into it

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use folio_core::TenantId;
use folio_events::{DecodeError, TenantScoped};

use crate::event_store::{EventStoreError, RecordedEvent};
use crate::read_model::ReadModelError;

pub mod accounts;
pub mod book_search;
pub mod checkpoint;
pub mod directory;
pub mod engine;

pub use accounts::{ACCOUNTS, AccountRow, AccountsProjection};
pub use book_search::{
    BOOK_SEARCH, BookQuery, BookSearchProjection, BookSearchRow, BookSort, Visibility,
};
pub use checkpoint::{
    CheckpointError, CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore,
};
pub use directory::{DIRECTORY, DirectoryProjection, TenantRow};
pub use engine::{EngineConfig, EngineHandle, ProjectionEngine, ProjectionState, ProjectionStatus};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    ReadModel(#[from] ReadModelError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("unknown projection: {0}")]
    UnknownProjection(String),

    #[error("projection failed: {0}")]
    Failed(String),
}

/// A read model fed by the global event log.
///
/// `apply` must be an upsert that tolerates seeing an event twice: rows skip
/// events at or below their recorded `last_position`.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Stable name; also the checkpoint key.
    fn name(&self) -> &'static str;

    /// Whether this projection folds the event at all.
    fn handles(&self, event: &RecordedEvent) -> bool;

    async fn apply(&self, event: &RecordedEvent) -> Result<(), ProjectionError>;

    /// Drop every row of one tenant (rebuild support).
    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), ProjectionError>;
}

/// Rows keep the position of the last event folded into them.
pub(crate) fn already_applied(last_position: Option<u64>, event: &RecordedEvent) -> bool {
    last_position.is_some_and(|last| event.global_position <= last)
}

/// Decode a payload and check it names the same tenant as its envelope.
pub(crate) fn decode_scoped<E>(event: &RecordedEvent) -> Result<E, ProjectionError>
where
    E: DeserializeOwned + TenantScoped,
{
    let payload: E = event.decode()?;
    if !payload.belongs_to(&event.tenant_id) {
        return Err(ProjectionError::TenantIsolation(format!(
            "event at position {} carries a payload for another tenant",
            event.global_position
        )));
    }
    Ok(payload)
}
