use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use async_trait::async_trait;
use folio_core::{AggregateId, ExpectedVersion, TenantId};
use folio_events::{DecodeError, UniqueClaim};
use std::sync::Arc;

/// An event ready to be appended to a stream (no sequence number or position yet).
///
/// Stream metadata (tenant, aggregate id and type) travels once on the
/// [`AppendRequest`] rather than on every event, so a batch cannot mix streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl NewEvent {
    /// Serialize a typed domain event, capturing the metadata needed to
    /// deserialize it again.
    pub fn from_typed<E>(event: &E) -> Result<Self, EventStoreError>
    where
        E: folio_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id: Uuid::now_v7(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}

/// One atomic append to one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub expected_version: ExpectedVersion,
    pub events: Vec<NewEvent>,

    /// Business keys reserved by this append, checked in the same atomic step.
    pub unique_claims: Vec<UniqueClaim>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub new_version: u64,
    pub events: Vec<RecordedEvent>,
}

/// A committed event.
///
/// - `sequence_number` is the stream version this event produced (1-based).
/// - `global_position` is the tenant-spanning commit-order position (1-based,
///   strictly increasing, no gaps).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub global_position: u64,
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub sequence_number: u64,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl RecordedEvent {
    /// Deserialize the payload into the aggregate's event type.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, DecodeError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| DecodeError {
            event_type: self.event_type.clone(),
            source,
        })
    }
}

/// Event store operation error.
///
/// Infrastructure failures (storage, concurrency, isolation) as opposed to
/// domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed (expected {expected:?}, actual {actual})")]
    ConcurrencyConflict {
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("stream not found")]
    StreamNotFound,

    #[error("tenant isolation violation: {0}")]
    TenantMismatch(String),

    #[error("aggregate type mismatch: stream is '{stream}', append used '{attempted}'")]
    AggregateTypeMismatch { stream: String, attempted: String },

    /// A unique business key is already held by another stream.
    #[error("unique key already claimed in scope '{scope}'")]
    UniqueViolation { scope: String },

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Append-only, tenant-partitioned event store.
///
/// Streams are keyed by `(tenant_id, aggregate_id)`; an aggregate id belongs to
/// exactly one tenant for its whole life.
///
/// Implementations must:
/// - serialize appends per stream while letting distinct streams proceed
/// - commit a batch atomically (all events and claims, or nothing)
/// - assign sequence numbers `current + 1 ..` and global positions in commit order
/// - never return another tenant's events from a tenant-scoped read
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(
        &self,
        tenant_id: &TenantId,
        request: AppendRequest,
    ) -> Result<AppendOutcome, EventStoreError>;

    /// Events of one stream in sequence order; `StreamNotFound` when the
    /// stream has no events under this tenant.
    async fn read_stream(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<RecordedEvent>, EventStoreError>;

    async fn stream_version(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<u64>, EventStoreError>;

    /// Up to `limit` events with `global_position > from_position`, across all
    /// tenants, in commit order.
    async fn read_all(
        &self,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, EventStoreError>;

    async fn head_position(&self) -> Result<u64, EventStoreError>;

    /// Receiver of the head position, bumped after every local commit.
    ///
    /// Lets tailing readers wake on appends instead of waiting for their poll
    /// interval. `None` when the backend cannot signal.
    fn watch_head(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        tenant_id: &TenantId,
        request: AppendRequest,
    ) -> Result<AppendOutcome, EventStoreError> {
        (**self).append(tenant_id, request).await
    }

    async fn read_stream(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        (**self).read_stream(tenant_id, aggregate_id).await
    }

    async fn stream_version(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<u64>, EventStoreError> {
        (**self).stream_version(tenant_id, aggregate_id).await
    }

    async fn read_all(
        &self,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        (**self).read_all(from_position, limit).await
    }

    async fn head_position(&self) -> Result<u64, EventStoreError> {
        (**self).head_position().await
    }

    fn watch_head(&self) -> Option<watch::Receiver<u64>> {
        (**self).watch_head()
    }
}

/// Reject malformed requests before touching storage.
pub(crate) fn validate_request(request: &AppendRequest) -> Result<(), EventStoreError> {
    if request.events.is_empty() {
        return Err(EventStoreError::InvalidAppend("empty batch".to_string()));
    }
    if request.aggregate_type.trim().is_empty() {
        return Err(EventStoreError::InvalidAppend(
            "aggregate_type cannot be empty".to_string(),
        ));
    }
    if let Some(idx) = request.events.iter().position(|e| e.event_type.is_empty()) {
        return Err(EventStoreError::InvalidAppend(format!(
            "event at index {idx} has no event_type"
        )));
    }
    Ok(())
}
