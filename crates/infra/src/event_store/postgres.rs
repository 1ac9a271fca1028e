//! Postgres-backed event store implementation.
//!
//! Schema lives in `migrations/0001_event_store.sql`. The contract of
//! [`EventStore`] is enforced explicitly in SQL:
//!
//! | Concern | Mechanism |
//! |---|---|
//! | Per-stream serialization | `UPDATE streams SET version = $new WHERE version = $expected` (compare-and-set) |
//! | Stream creation race | primary key on `streams (tenant_id, aggregate_id)` |
//! | Tenant ownership | unique index on `streams (aggregate_id)` |
//! | Business-key uniqueness | primary key on `unique_claims (tenant_id, scope, claim_key)` |
//! | Commit-order positions | single-row `event_log_head` counter bumped inside the append transaction |
//!
//! The head counter row lock is held until commit, so appends serialize on it
//! for the last step of their transaction and positions are handed out in
//! commit order. This trades append throughput for gap-free positions.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL code | EventStoreError |
//! |---|---|---|
//! | unique violation on `unique_claims` | `23505` | `UniqueViolation` |
//! | unique violation on `streams` | `23505` | `ConcurrencyConflict` |
//! | anything else | any | `Backend` |

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{instrument, warn};

use async_trait::async_trait;
use folio_core::{AggregateId, ExpectedVersion, TenantId};

use super::r#trait::{
    validate_request, AppendOutcome, AppendRequest, EventStore, EventStoreError, RecordedEvent,
};

const MIGRATION: &str = include_str!("../../migrations/0001_event_store.sql");

/// Apply the event store, checkpoint and read-model schema (idempotent).
pub async fn migrate(pool: &PgPool) -> Result<(), EventStoreError> {
    sqlx::raw_sql(MIGRATION)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    Ok(())
}

/// Postgres-backed append-only event store.
///
/// Every stream query carries `tenant_id` in its WHERE clause, so a read under
/// the wrong tenant is indistinguishable from a missing stream.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    head: Arc<watch::Sender<u64>>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        let (head, _) = watch::channel(0);
        Self {
            pool: Arc::new(pool),
            head: Arc::new(head),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn append_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &TenantId,
        request: AppendRequest,
    ) -> Result<AppendOutcome, EventStoreError> {
        let existing = sqlx::query(
            "SELECT tenant_id, aggregate_type, version FROM streams WHERE aggregate_id = $1",
        )
        .bind(request.aggregate_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("load_stream_head", e))?;

        let current = match &existing {
            None => 0,
            Some(row) => {
                let owner: String = row.try_get("tenant_id").map_err(decode_err)?;
                if owner != tenant_id.as_str() {
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
                let stream_type: String = row.try_get("aggregate_type").map_err(decode_err)?;
                if stream_type != request.aggregate_type {
                    return Err(EventStoreError::AggregateTypeMismatch {
                        stream: stream_type,
                        attempted: request.aggregate_type,
                    });
                }
                let version: i64 = row.try_get("version").map_err(decode_err)?;
                version as u64
            }
        };

        if !request.expected_version.matches(current) {
            return Err(EventStoreError::ConcurrencyConflict {
                expected: request.expected_version,
                actual: current,
            });
        }

        let new_version = current + request.events.len() as u64;

        if existing.is_none() {
            sqlx::query(
                r#"
                INSERT INTO streams (tenant_id, aggregate_id, aggregate_type, version)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(tenant_id.as_str())
            .bind(request.aggregate_id.as_uuid())
            .bind(&request.aggregate_type)
            .bind(new_version as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    // Another creator committed first.
                    EventStoreError::ConcurrencyConflict {
                        expected: request.expected_version,
                        actual: current + 1,
                    }
                } else {
                    map_sqlx_error("create_stream", e)
                }
            })?;
        } else {
            let updated = sqlx::query(
                r#"
                UPDATE streams
                SET version = $4
                WHERE tenant_id = $1 AND aggregate_id = $2 AND version = $3
                "#,
            )
            .bind(tenant_id.as_str())
            .bind(request.aggregate_id.as_uuid())
            .bind(current as i64)
            .bind(new_version as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("advance_stream", e))?;

            if updated.rows_affected() != 1 {
                return Err(EventStoreError::ConcurrencyConflict {
                    expected: request.expected_version,
                    actual: current + 1,
                });
            }
        }

        for claim in &request.unique_claims {
            sqlx::query(
                r#"
                INSERT INTO unique_claims (tenant_id, scope, claim_key, aggregate_id)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (tenant_id, scope, claim_key)
                DO UPDATE SET aggregate_id = EXCLUDED.aggregate_id
                WHERE unique_claims.aggregate_id = EXCLUDED.aggregate_id
                "#,
            )
            .bind(tenant_id.as_str())
            .bind(&claim.scope)
            .bind(&claim.key)
            .bind(request.aggregate_id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("claim_unique_key", e))
            .and_then(|done| {
                if done.rows_affected() == 1 {
                    Ok(())
                } else {
                    Err(EventStoreError::UniqueViolation {
                        scope: claim.scope.clone(),
                    })
                }
            })?;
        }

        let count = request.events.len() as i64;
        let head: i64 = sqlx::query_scalar(
            "UPDATE event_log_head SET position = position + $1 WHERE id = 1 RETURNING position",
        )
        .bind(count)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("advance_head", e))?;
        let first_position = (head - count + 1) as u64;

        let committed_at = Utc::now();
        let mut committed = Vec::with_capacity(request.events.len());
        for (offset, event) in request.events.into_iter().enumerate() {
            let recorded = RecordedEvent {
                global_position: first_position + offset as u64,
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

            sqlx::query(
                r#"
                INSERT INTO events (
                    position,
                    event_id,
                    tenant_id,
                    aggregate_id,
                    aggregate_type,
                    sequence_number,
                    event_type,
                    event_version,
                    occurred_at,
                    committed_at,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(recorded.global_position as i64)
            .bind(recorded.event_id)
            .bind(tenant_id.as_str())
            .bind(recorded.aggregate_id.as_uuid())
            .bind(&recorded.aggregate_type)
            .bind(recorded.sequence_number as i64)
            .bind(&recorded.event_type)
            .bind(recorded.event_version as i32)
            .bind(recorded.occurred_at)
            .bind(recorded.committed_at)
            .bind(&recorded.payload)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_event", e))?;

            committed.push(recorded);
        }

        Ok(AppendOutcome {
            new_version,
            events: committed,
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        match self.append_tx(&mut tx, tenant_id, request).await {
            Ok(outcome) => {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                if let Some(last) = outcome.events.last() {
                    self.head.send_if_modified(|head| {
                        let advanced = last.global_position > *head;
                        if advanced {
                            *head = last.global_position;
                        }
                        advanced
                    });
                }
                Ok(outcome)
            }
            Err(err) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                Err(err)
            }
        }
    }

    async fn read_stream(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE tenant_id = $1 AND aggregate_id = $2 \
             ORDER BY sequence_number ASC"
        ))
        .bind(tenant_id.as_str())
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_stream", e))?;

        if rows.is_empty() {
            return Err(EventStoreError::StreamNotFound);
        }
        rows.iter().map(recorded_from_row).collect()
    }

    async fn stream_version(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<u64>, EventStoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM streams WHERE tenant_id = $1 AND aggregate_id = $2",
        )
        .bind(tenant_id.as_str())
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stream_version", e))?;

        Ok(version.map(|v| v as u64))
    }

    async fn read_all(
        &self,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE position > $1 \
             ORDER BY position ASC \
             LIMIT $2"
        ))
        .bind(from_position as i64)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_all", e))?;

        rows.iter().map(recorded_from_row).collect()
    }

    async fn head_position(&self) -> Result<u64, EventStoreError> {
        let head: i64 = sqlx::query_scalar("SELECT position FROM event_log_head WHERE id = 1")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("head_position", e))?;
        Ok(head as u64)
    }

    /// Only sees appends made through this handle; other writers are picked up
    /// by the reader's poll interval.
    fn watch_head(&self) -> Option<watch::Receiver<u64>> {
        Some(self.head.subscribe())
    }
}

const EVENT_COLUMNS: &str = "position, event_id, tenant_id, aggregate_id, aggregate_type, \
     sequence_number, event_type, event_version, occurred_at, committed_at, payload";

fn recorded_from_row(row: &PgRow) -> Result<RecordedEvent, EventStoreError> {
    let tenant: String = row.try_get("tenant_id").map_err(decode_err)?;
    let tenant_id = TenantId::parse(&tenant)
        .map_err(|e| EventStoreError::Backend(format!("stored tenant_id is invalid: {e}")))?;
    let aggregate_id: uuid::Uuid = row.try_get("aggregate_id").map_err(decode_err)?;
    let position: i64 = row.try_get("position").map_err(decode_err)?;
    let sequence_number: i64 = row.try_get("sequence_number").map_err(decode_err)?;
    let event_version: i32 = row.try_get("event_version").map_err(decode_err)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(decode_err)?;
    let committed_at: DateTime<Utc> = row.try_get("committed_at").map_err(decode_err)?;

    Ok(RecordedEvent {
        global_position: position as u64,
        event_id: row.try_get("event_id").map_err(decode_err)?,
        tenant_id,
        aggregate_id: AggregateId::from_uuid(aggregate_id),
        aggregate_type: row.try_get("aggregate_type").map_err(decode_err)?,
        sequence_number: sequence_number as u64,
        event_type: row.try_get("event_type").map_err(decode_err)?,
        event_version: event_version as u32,
        occurred_at,
        committed_at,
        payload: row.try_get("payload").map_err(decode_err)?,
    })
}

fn decode_err(err: sqlx::Error) -> EventStoreError {
    EventStoreError::Backend(format!("failed to decode event row: {err}"))
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            EventStoreError::Backend(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Backend(format!("connection pool closed in {operation}"))
        }
        other => EventStoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// Needs a live database; runs only when FOLIO_TEST_DATABASE_URL is set.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::NewEvent;
    use folio_events::UniqueClaim;
    use serde_json::json;
    use uuid::Uuid;

    async fn store() -> Option<PostgresEventStore> {
        let url = std::env::var("FOLIO_TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        migrate(&pool).await.ok()?;
        Some(PostgresEventStore::new(pool))
    }

    fn request(id: AggregateId, expected: ExpectedVersion) -> AppendRequest {
        AppendRequest {
            aggregate_id: id,
            aggregate_type: "test.thing".to_string(),
            expected_version: expected,
            events: vec![NewEvent {
                event_id: Uuid::now_v7(),
                event_type: "test.thing.happened".to_string(),
                event_version: 1,
                occurred_at: Utc::now(),
                payload: json!({ "ok": true }),
            }],
            unique_claims: vec![],
        }
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_version() {
        let Some(store) = store().await else { return };
        let tenant = TenantId::parse("pg-acme").unwrap();
        let id = AggregateId::new();

        let first = store
            .append(&tenant, request(id, ExpectedVersion::NoStream))
            .await
            .unwrap();
        assert_eq!(first.new_version, 1);
        store
            .append(&tenant, request(id, ExpectedVersion::Exact(1)))
            .await
            .unwrap();

        let err = store
            .append(&tenant, request(id, ExpectedVersion::Exact(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::ConcurrencyConflict { actual: 2, .. }));

        let events = store.read_stream(&tenant, id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].global_position < events[1].global_position);

        let other = TenantId::parse("pg-globex").unwrap();
        assert!(matches!(
            store.read_stream(&other, id).await,
            Err(EventStoreError::StreamNotFound)
        ));
    }

    #[tokio::test]
    async fn unique_claim_rejects_second_stream() {
        let Some(store) = store().await else { return };
        let tenant = TenantId::parse("pg-acme").unwrap();
        let claim = UniqueClaim::new("account-email", format!("{}@example.com", Uuid::now_v7()));

        let mut first = request(AggregateId::new(), ExpectedVersion::NoStream);
        first.unique_claims = vec![claim.clone()];
        store.append(&tenant, first).await.unwrap();

        let loser = AggregateId::new();
        let mut second = request(loser, ExpectedVersion::NoStream);
        second.unique_claims = vec![claim];
        assert!(matches!(
            store.append(&tenant, second).await,
            Err(EventStoreError::UniqueViolation { .. })
        ));
        assert_eq!(store.stream_version(&tenant, loser).await.unwrap(), None);
    }
}
