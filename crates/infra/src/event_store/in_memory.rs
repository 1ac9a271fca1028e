use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex as StreamLock};
use tracing::{instrument, warn};

use folio_core::{AggregateId, TenantId};

use super::r#trait::{
    validate_request, AppendOutcome, AppendRequest, EventStore, EventStoreError, RecordedEvent,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClaimKey {
    tenant_id: TenantId,
    scope: String,
    key: String,
}

type Stream = Arc<StreamLock<Vec<RecordedEvent>>>;

/// In-memory append-only event store.
///
/// Appends to one stream are serialized by that stream's async lock; distinct
/// streams only meet briefly on the global log lock, where positions are
/// assigned, so position order is commit order.
///
/// Lock order is always stream, then claims, then log.
#[derive(Debug)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Stream>>,
    owners: RwLock<HashMap<AggregateId, TenantId>>,
    claims: Mutex<HashMap<ClaimKey, AggregateId>>,
    log: RwLock<Vec<RecordedEvent>>,
    head: watch::Sender<u64>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        let (head, _) = watch::channel(0);
        Self {
            streams: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            log: RwLock::new(Vec::new()),
            head,
        }
    }

    fn stream(&self, key: &StreamKey, create: bool) -> Result<Option<Stream>, EventStoreError> {
        if let Some(stream) = self.streams.read().map_err(poisoned)?.get(key) {
            return Ok(Some(stream.clone()));
        }
        if !create {
            return Ok(None);
        }
        let mut streams = self.streams.write().map_err(poisoned)?;
        Ok(Some(streams.entry(key.clone()).or_default().clone()))
    }

    fn owner_of(&self, aggregate_id: AggregateId) -> Result<Option<TenantId>, EventStoreError> {
        Ok(self.owners.read().map_err(poisoned)?.get(&aggregate_id).cloned())
    }

    /// Checks and writes under the stream lock. Nothing is written on error.
    fn commit(
        &self,
        tenant_id: &TenantId,
        request: AppendRequest,
        stream: &mut Vec<RecordedEvent>,
    ) -> Result<AppendOutcome, EventStoreError> {
        let current = stream.last().map(|e| e.sequence_number).unwrap_or(0);
        if !request.expected_version.matches(current) {
            return Err(EventStoreError::ConcurrencyConflict {
                expected: request.expected_version,
                actual: current,
            });
        }
        if let Some(first) = stream.first() {
            if first.aggregate_type != request.aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch {
                    stream: first.aggregate_type.clone(),
                    attempted: request.aggregate_type,
                });
            }
        }

        // Held until the log is written: serializes ownership and claim checks.
        let mut claims = self.claims.lock().map_err(poisoned)?;
        if let Some(owner) = self.owner_of(request.aggregate_id)? {
            if &owner != tenant_id {
                warn!(
                    security = true,
                    tenant = %tenant_id,
                    aggregate_id = %request.aggregate_id,
                    "append to a stream owned by another tenant"
                );
                return Err(EventStoreError::TenantMismatch(
                    "stream belongs to another tenant".to_string(),
                ));
            }
        }
        for claim in &request.unique_claims {
            let claim_key = ClaimKey {
                tenant_id: tenant_id.clone(),
                scope: claim.scope.clone(),
                key: claim.key.clone(),
            };
            if let Some(holder) = claims.get(&claim_key) {
                if *holder != request.aggregate_id {
                    return Err(EventStoreError::UniqueViolation {
                        scope: claim.scope.clone(),
                    });
                }
            }
        }

        let mut log = self.log.write().map_err(poisoned)?;
        let committed_at = Utc::now();
        let mut committed = Vec::with_capacity(request.events.len());
        for (offset, event) in request.events.into_iter().enumerate() {
            let recorded = RecordedEvent {
                global_position: log.len() as u64 + 1,
                event_id: event.event_id,
                tenant_id: tenant_id.clone(),
                aggregate_id: request.aggregate_id,
                aggregate_type: request.aggregate_type.clone(),
                sequence_number: current + offset as u64 + 1,
                event_type: event.event_type,
                event_version: event.event_version,
                occurred_at: event.occurred_at,
                committed_at,
                payload: event.payload,
            };
            log.push(recorded.clone());
            committed.push(recorded);
        }
        for claim in request.unique_claims {
            claims.insert(
                ClaimKey {
                    tenant_id: tenant_id.clone(),
                    scope: claim.scope,
                    key: claim.key,
                },
                request.aggregate_id,
            );
        }
        if current == 0 {
            self.owners
                .write()
                .map_err(poisoned)?
                .insert(request.aggregate_id, tenant_id.clone());
        }
        stream.extend(committed.iter().cloned());

        let head = log.len() as u64;
        drop(log);
        drop(claims);
        self.head.send_replace(head);

        Ok(AppendOutcome {
            new_version: current + committed.len() as u64,
            events: committed,
        })
    }

    /// Drop a stream entry a failed creation left behind, unless another
    /// append already holds it.
    fn discard_unused(&self, key: &StreamKey, handle: &Stream) -> Result<(), EventStoreError> {
        let mut streams = self.streams.write().map_err(poisoned)?;
        // One reference in the map, one in `handle`.
        if Arc::strong_count(handle) == 2 {
            streams.remove(key);
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> EventStoreError {
    EventStoreError::Backend("lock poisoned".to_string())
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[instrument(
        skip(self, request),
        fields(
            tenant_id = %tenant_id,
            aggregate_id = %request.aggregate_id,
            expected = ?request.expected_version,
            events = request.events.len()
        ),
        err
    )]
    async fn append(
        &self,
        tenant_id: &TenantId,
        request: AppendRequest,
    ) -> Result<AppendOutcome, EventStoreError> {
        validate_request(&request)?;

        let key = StreamKey {
            tenant_id: tenant_id.clone(),
            aggregate_id: request.aggregate_id,
        };
        let Some(handle) = self.stream(&key, true)? else {
            return Err(EventStoreError::Backend("stream vanished".to_string()));
        };
        let mut stream = handle.lock().await;

        let result = self.commit(tenant_id, request, &mut stream);
        if result.is_err() && stream.is_empty() {
            self.discard_unused(&key, &handle)?;
        }
        result
    }

    async fn read_stream(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let key = StreamKey {
            tenant_id: tenant_id.clone(),
            aggregate_id,
        };
        let Some(stream) = self.stream(&key, false)? else {
            return Err(EventStoreError::StreamNotFound);
        };
        let events = stream.lock().await.clone();
        if events.is_empty() {
            return Err(EventStoreError::StreamNotFound);
        }
        Ok(events)
    }

    async fn stream_version(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<u64>, EventStoreError> {
        let key = StreamKey {
            tenant_id: tenant_id.clone(),
            aggregate_id,
        };
        let Some(stream) = self.stream(&key, false)? else {
            return Ok(None);
        };
        let version = stream.lock().await.last().map(|e| e.sequence_number);
        Ok(version)
    }

    async fn read_all(
        &self,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let log = self.log.read().map_err(poisoned)?;
        let start = usize::try_from(from_position).unwrap_or(usize::MAX).min(log.len());
        Ok(log[start..].iter().take(limit).cloned().collect())
    }

    async fn head_position(&self) -> Result<u64, EventStoreError> {
        Ok(self.log.read().map_err(poisoned)?.len() as u64)
    }

    fn watch_head(&self) -> Option<watch::Receiver<u64>> {
        Some(self.head.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::NewEvent;
    use folio_core::ExpectedVersion;
    use folio_events::UniqueClaim;
    use serde_json::json;
    use uuid::Uuid;

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).unwrap()
    }

    fn event(n: u32) -> NewEvent {
        NewEvent {
            event_id: Uuid::now_v7(),
            event_type: "test.thing.happened".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({ "n": n }),
        }
    }

    fn request(id: AggregateId, expected: ExpectedVersion, count: u32) -> AppendRequest {
        AppendRequest {
            aggregate_id: id,
            aggregate_type: "test.thing".to_string(),
            expected_version: expected,
            events: (0..count).map(event).collect(),
            unique_claims: vec![],
        }
    }

    #[tokio::test]
    async fn append_assigns_sequence_and_positions() {
        let store = InMemoryEventStore::new();
        let acme = tenant("acme");
        let id = AggregateId::new();

        let first = store
            .append(&acme, request(id, ExpectedVersion::NoStream, 2))
            .await
            .unwrap();
        assert_eq!(first.new_version, 2);
        let second = store
            .append(&acme, request(id, ExpectedVersion::Exact(2), 1))
            .await
            .unwrap();
        assert_eq!(second.new_version, 3);
        assert_eq!(second.events[0].sequence_number, 3);
        assert_eq!(second.events[0].global_position, 3);

        let stream = store.read_stream(&acme, id).await.unwrap();
        let seqs: Vec<u64> = stream.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(store.head_position().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn stale_expected_version_changes_nothing() {
        let store = InMemoryEventStore::new();
        let acme = tenant("acme");
        let id = AggregateId::new();
        store
            .append(&acme, request(id, ExpectedVersion::NoStream, 1))
            .await
            .unwrap();

        let err = store
            .append(&acme, request(id, ExpectedVersion::NoStream, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::ConcurrencyConflict { actual: 1, .. }
        ));
        assert_eq!(store.stream_version(&acme, id).await.unwrap(), Some(1));
        assert_eq!(store.head_position().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn streams_are_invisible_to_other_tenants() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(&tenant("acme"), request(id, ExpectedVersion::NoStream, 1))
            .await
            .unwrap();

        let err = store.read_stream(&tenant("globex"), id).await.unwrap_err();
        assert!(matches!(err, EventStoreError::StreamNotFound));
        assert_eq!(store.stream_version(&tenant("globex"), id).await.unwrap(), None);

        let err = store
            .append(&tenant("globex"), request(id, ExpectedVersion::NoStream, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::TenantMismatch(_)));
    }

    #[tokio::test]
    async fn failed_creations_leave_no_stream_entries() {
        let store = InMemoryEventStore::new();
        let acme = tenant("acme");
        let id = AggregateId::new();
        store
            .append(&acme, request(id, ExpectedVersion::NoStream, 1))
            .await
            .unwrap();

        for _ in 0..3 {
            store
                .append(&tenant("globex"), request(id, ExpectedVersion::NoStream, 1))
                .await
                .unwrap_err();
            store
                .append(&acme, request(AggregateId::new(), ExpectedVersion::Exact(4), 1))
                .await
                .unwrap_err();
        }

        assert_eq!(store.streams.read().unwrap().len(), 1);
        assert_eq!(store.stream_version(&acme, id).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn aggregate_type_is_fixed_by_first_event() {
        let store = InMemoryEventStore::new();
        let acme = tenant("acme");
        let id = AggregateId::new();
        store
            .append(&acme, request(id, ExpectedVersion::NoStream, 1))
            .await
            .unwrap();

        let mut other = request(id, ExpectedVersion::Exact(1), 1);
        other.aggregate_type = "test.other".to_string();
        let err = store.append(&acme, other).await.unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch { .. }));
    }

    #[tokio::test]
    async fn unique_claims_are_per_tenant_and_atomic() {
        let store = InMemoryEventStore::new();
        let acme = tenant("acme");
        let claim = UniqueClaim::new("account-email", "ada@example.com");

        let mut first = request(AggregateId::new(), ExpectedVersion::NoStream, 1);
        first.unique_claims = vec![claim.clone()];
        store.append(&acme, first).await.unwrap();

        let loser_id = AggregateId::new();
        let mut second = request(loser_id, ExpectedVersion::NoStream, 1);
        second.unique_claims = vec![claim.clone()];
        let err = store.append(&acme, second).await.unwrap_err();
        assert!(matches!(err, EventStoreError::UniqueViolation { .. }));
        assert_eq!(store.stream_version(&acme, loser_id).await.unwrap(), None);
        assert_eq!(store.head_position().await.unwrap(), 1);

        let mut elsewhere = request(AggregateId::new(), ExpectedVersion::NoStream, 1);
        elsewhere.unique_claims = vec![claim];
        store.append(&tenant("globex"), elsewhere).await.unwrap();
    }

    #[tokio::test]
    async fn read_all_pages_in_commit_order() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        store
            .append(&tenant("acme"), request(a, ExpectedVersion::NoStream, 2))
            .await
            .unwrap();
        store
            .append(&tenant("globex"), request(b, ExpectedVersion::NoStream, 2))
            .await
            .unwrap();

        let page = store.read_all(1, 2).await.unwrap();
        let positions: Vec<u64> = page.iter().map(|e| e.global_position).collect();
        assert_eq!(positions, vec![2, 3]);
        assert!(store.read_all(4, 10).await.unwrap().is_empty());
        assert!(store.read_all(99, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn head_watch_sees_appends() {
        let store = InMemoryEventStore::new();
        let mut head = store.watch_head().unwrap();
        store
            .append(&tenant("acme"), request(AggregateId::new(), ExpectedVersion::NoStream, 3))
            .await
            .unwrap();
        head.changed().await.unwrap();
        assert_eq!(*head.borrow(), 3);
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_stream_have_one_winner() {
        let store = Arc::new(InMemoryEventStore::new());
        let acme = tenant("acme");
        let id = AggregateId::new();
        store
            .append(&acme, request(id, ExpectedVersion::NoStream, 1))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let acme = acme.clone();
            tasks.push(tokio::spawn(async move {
                store.append(&acme, request(id, ExpectedVersion::Exact(1), 1)).await
            }));
        }
        let mut wins = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.stream_version(&acme, id).await.unwrap(), Some(2));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// Property: successful appends advance the version by exactly the batch
            /// length; rejected appends leave it untouched.
            #[test]
            fn versions_advance_by_batch_length(
                batches in proptest::collection::vec((1u32..4, any::<bool>()), 1..20)
            ) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    let store = InMemoryEventStore::new();
                    let acme = tenant("acme");
                    let id = AggregateId::new();
                    let mut version = 0u64;

                    for (len, stale) in batches {
                        let expected = if stale && version > 0 {
                            ExpectedVersion::Exact(version - 1)
                        } else {
                            ExpectedVersion::from(version)
                        };
                        match store.append(&acme, request(id, expected, len)).await {
                            Ok(outcome) => {
                                prop_assert!(!stale || version == 0);
                                prop_assert_eq!(outcome.new_version, version + len as u64);
                                version = outcome.new_version;
                            }
                            Err(EventStoreError::ConcurrencyConflict { actual, .. }) => {
                                prop_assert!(stale);
                                prop_assert_eq!(actual, version);
                            }
                            Err(other) => prop_assert!(false, "unexpected error {other}"),
                        }
                        let seqs: Vec<u64> = match store.read_stream(&acme, id).await {
                            Ok(events) => events.iter().map(|e| e.sequence_number).collect(),
                            Err(_) => Vec::new(),
                        };
                        prop_assert_eq!(seqs, (1..=version).collect::<Vec<_>>());
                    }
                    Ok::<(), TestCaseError>(())
                })?;
            }
        }
    }
}
