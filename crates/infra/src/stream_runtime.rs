//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! Command (+ expected version)
//!   ↓
//! 1. Load the stream (tenant-scoped)
//!   ↓
//! 2. Check the precondition against the loaded version
//!   ↓
//! 3. Rehydrate (fold history into a fresh aggregate)
//!   ↓
//! 4. Handle the command (pure decision, produces events)
//!   ↓
//! 5. Append with the version used for the decision
//! ```
//!
//! The runtime never retries a failed append on its own. A stale precondition
//! goes back to the caller as [`RuntimeError::PreconditionFailed`]; only
//! [`StreamRuntime::execute_latest`], used for commands that carry no caller
//! precondition, re-runs the whole cycle against fresh state.

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use folio_core::{
    Aggregate, AggregateId, ConcurrencyToken, DomainError, ExpectedVersion, TenantId,
};
use folio_events::StreamAggregate;

use crate::event_store::{
    AppendRequest, EventStore, EventStoreError, NewEvent, RecordedEvent,
};

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The presented token does not match the stream's current version.
    #[error("precondition failed (expected {expected:?}, actual {actual})")]
    PreconditionFailed {
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("aggregate already exists")]
    AlreadyExists,

    /// Absent, or owned by another tenant. The two are indistinguishable.
    #[error("not found")]
    NotFound,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The command conflicts with current state (e.g. liking twice).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A unique business key is taken, or the target id belongs to another
    /// tenant. Says nothing about which.
    #[error("request rejected")]
    Rejected,

    /// A loaded stream carried another tenant's events.
    #[error("tenant isolation violation: {0}")]
    TenantMismatch(String),

    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Store(EventStoreError),
}

impl RuntimeError {
    /// Whether re-reading and re-submitting may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::PreconditionFailed { .. })
    }
}

impl From<EventStoreError> for RuntimeError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::ConcurrencyConflict { expected, actual } => {
                RuntimeError::PreconditionFailed { expected, actual }
            }
            EventStoreError::UniqueViolation { scope } => {
                warn!(scope = %scope, "append rejected by unique claim");
                RuntimeError::Rejected
            }
            // The store already logged the clash; the caller must not learn the id exists.
            EventStoreError::TenantMismatch(_) => RuntimeError::Rejected,
            EventStoreError::StreamNotFound => RuntimeError::NotFound,
            other => RuntimeError::Store(other),
        }
    }
}

impl From<DomainError> for RuntimeError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                RuntimeError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) => RuntimeError::InvariantViolation(msg),
            DomainError::NotFound => RuntimeError::NotFound,
            DomainError::Conflict(msg) => RuntimeError::Conflict(msg),
        }
    }
}

/// Result of a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub new_version: u64,
    pub token: ConcurrencyToken,
    pub events: Vec<RecordedEvent>,
}

/// Aggregate state folded for a read.
#[derive(Debug, Clone)]
pub struct Loaded<A> {
    pub state: A,
    pub version: u64,
    pub token: ConcurrencyToken,
}

/// Reusable command execution engine.
///
/// Generic over the store so tests run against [`crate::event_store::InMemoryEventStore`]
/// and production against the Postgres store with the same code.
#[derive(Debug, Clone)]
pub struct StreamRuntime<S> {
    store: S,
}

impl<S> StreamRuntime<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: EventStore> StreamRuntime<S> {
    /// Run a command under an explicit precondition.
    ///
    /// - creation commands on an existing stream fail with `AlreadyExists`
    /// - other commands on a missing stream fail with `NotFound`
    /// - a stale `expected` fails with `PreconditionFailed` before the command is handled
    #[instrument(
        skip(self, command),
        fields(tenant_id = %tenant_id, aggregate_id = %aggregate_id, aggregate_type = A::AGGREGATE_TYPE),
        err
    )]
    pub async fn execute<A: StreamAggregate>(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        expected: ExpectedVersion,
        command: A::Command,
    ) -> Result<Executed, RuntimeError> {
        self.run::<A>(tenant_id, aggregate_id, Some(expected), &command)
            .await
    }

    /// Run a command against whatever version is current, re-running the
    /// full read-validate-append cycle when a concurrent writer wins the append.
    #[instrument(
        skip(self, command),
        fields(tenant_id = %tenant_id, aggregate_id = %aggregate_id, aggregate_type = A::AGGREGATE_TYPE),
        err
    )]
    pub async fn execute_latest<A: StreamAggregate>(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        command: A::Command,
        max_attempts: u32,
    ) -> Result<Executed, RuntimeError> {
        let attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.run::<A>(tenant_id, aggregate_id, None, &command).await {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    debug!(attempt, error = %err, "append lost a race, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Fold a stream for reading.
    pub async fn load<A: StreamAggregate>(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Loaded<A>, RuntimeError> {
        let history = self.store.read_stream(tenant_id, aggregate_id).await?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;

        let mut state = A::empty(tenant_id, aggregate_id);
        apply_history(&mut state, &history)?;
        let version = stream_version(&history);

        Ok(Loaded {
            state,
            version,
            token: ConcurrencyToken::from_version(version),
        })
    }

    async fn run<A: StreamAggregate>(
        &self,
        tenant_id: &TenantId,
        aggregate_id: AggregateId,
        expected: Option<ExpectedVersion>,
        command: &A::Command,
    ) -> Result<Executed, RuntimeError> {
        // 1) Load history (tenant-scoped)
        let history = match self.store.read_stream(tenant_id, aggregate_id).await {
            Ok(history) => history,
            Err(EventStoreError::StreamNotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;
        let current = stream_version(&history);

        // 2) Preconditions
        if A::is_creation(command) {
            if current > 0 {
                return Err(RuntimeError::AlreadyExists);
            }
        } else if current == 0 {
            return Err(RuntimeError::NotFound);
        }
        if let Some(expected) = expected {
            if !expected.matches(current) {
                return Err(RuntimeError::PreconditionFailed {
                    expected,
                    actual: current,
                });
            }
        }

        // 3) Rehydrate
        let mut aggregate = A::empty(tenant_id, aggregate_id);
        apply_history(&mut aggregate, &history)?;

        // 4) Decide events (no mutation)
        let decided = aggregate.handle(command)?;
        if decided.is_empty() {
            return Ok(Executed {
                new_version: current,
                token: ConcurrencyToken::from_version(current),
                events: Vec::new(),
            });
        }

        // 5) Persist under the version the decision was made on
        let unique_claims = decided.iter().flat_map(A::unique_claims).collect();
        let events = decided
            .iter()
            .map(NewEvent::from_typed)
            .collect::<Result<Vec<_>, _>>()?;

        let outcome = self
            .store
            .append(
                tenant_id,
                AppendRequest {
                    aggregate_id,
                    aggregate_type: A::AGGREGATE_TYPE.to_string(),
                    expected_version: ExpectedVersion::from(current),
                    events,
                    unique_claims,
                },
            )
            .await?;

        debug!(new_version = outcome.new_version, "command committed");

        Ok(Executed {
            new_version: outcome.new_version,
            token: ConcurrencyToken::from_version(outcome.new_version),
            events: outcome.events,
        })
    }
}

fn stream_version(stream: &[RecordedEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    tenant_id: &TenantId,
    aggregate_id: AggregateId,
    stream: &[RecordedEvent],
) -> Result<(), RuntimeError> {
    // Enforce tenant isolation even if a buggy backend returns cross-tenant data.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if &e.tenant_id != tenant_id {
            return Err(RuntimeError::TenantMismatch(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(RuntimeError::TenantMismatch(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number != last + 1 {
            return Err(RuntimeError::Store(EventStoreError::Backend(format!(
                "gap in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[RecordedEvent]) -> Result<(), RuntimeError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = stored
            .decode()
            .map_err(|e| RuntimeError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use chrono::Utc;
    use folio_catalog::{Book, BookCommand, CreateBook, DeleteBook, LikeBook, ReviseBook};
    use folio_core::{AccountId, Translations};
    use folio_tenancy::{Account, AccountCommand, RegisterAccount};
    use std::sync::Arc;

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).unwrap()
    }

    fn create_book() -> BookCommand {
        BookCommand::CreateBook(CreateBook {
            default_language: "en".to_string(),
            title: Translations::single("en", "Dune").unwrap(),
            description: Translations::new(),
            author: "Frank Herbert".to_string(),
            tags: vec!["sci-fi".to_string()],
            occurred_at: Utc::now(),
        })
    }

    fn retitle(title: &str) -> BookCommand {
        BookCommand::ReviseBook(ReviseBook {
            title: Some(Translations::single("en", title).unwrap()),
            description: None,
            author: None,
            tags: None,
            replace_translations: false,
            occurred_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn stale_token_is_rejected_after_update() {
        let runtime = StreamRuntime::new(InMemoryEventStore::new());
        let acme = tenant("acme");
        let id = AggregateId::new();

        let created = runtime
            .execute::<Book>(&acme, id, ExpectedVersion::NoStream, create_book())
            .await
            .unwrap();
        assert_eq!(created.new_version, 1);
        assert_eq!(created.token.to_string(), "1");

        let token: ConcurrencyToken = "\"1\"".parse().unwrap();
        let updated = runtime
            .execute::<Book>(&acme, id, token.expected_version(), retitle("Dune Messiah"))
            .await
            .unwrap();
        assert_eq!(updated.new_version, 2);

        let err = runtime
            .execute::<Book>(&acme, id, token.expected_version(), retitle("Children of Dune"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::PreconditionFailed { actual: 2, .. }
        ));

        let loaded = runtime.load::<Book>(&acme, id).await.unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.state.title().get("en"), Some("Dune Messiah"));
    }

    #[tokio::test]
    async fn creation_and_existence_preconditions() {
        let runtime = StreamRuntime::new(InMemoryEventStore::new());
        let acme = tenant("acme");
        let id = AggregateId::new();

        let err = runtime
            .execute::<Book>(&acme, id, ExpectedVersion::Exact(1), retitle("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound));

        runtime
            .execute::<Book>(&acme, id, ExpectedVersion::NoStream, create_book())
            .await
            .unwrap();
        let err = runtime
            .execute::<Book>(&acme, id, ExpectedVersion::NoStream, create_book())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyExists));
    }

    #[tokio::test]
    async fn other_tenant_sees_not_found() {
        let runtime = StreamRuntime::new(InMemoryEventStore::new());
        let id = AggregateId::new();
        runtime
            .execute::<Book>(&tenant("acme"), id, ExpectedVersion::NoStream, create_book())
            .await
            .unwrap();

        let globex = tenant("globex");
        assert!(matches!(
            runtime.load::<Book>(&globex, id).await,
            Err(RuntimeError::NotFound)
        ));
        assert!(matches!(
            runtime
                .execute::<Book>(&globex, id, ExpectedVersion::Exact(1), retitle("stolen"))
                .await,
            Err(RuntimeError::NotFound)
        ));
    }

    #[tokio::test]
    async fn domain_errors_keep_their_class() {
        let runtime = StreamRuntime::new(InMemoryEventStore::new());
        let acme = tenant("acme");
        let id = AggregateId::new();
        runtime
            .execute::<Book>(&acme, id, ExpectedVersion::NoStream, create_book())
            .await
            .unwrap();

        let empty = BookCommand::ReviseBook(ReviseBook {
            title: None,
            description: None,
            author: None,
            tags: None,
            replace_translations: false,
            occurred_at: Utc::now(),
        });
        assert!(matches!(
            runtime
                .execute::<Book>(&acme, id, ExpectedVersion::Exact(1), empty)
                .await,
            Err(RuntimeError::Validation(_))
        ));

        let delete = BookCommand::DeleteBook(DeleteBook {
            occurred_at: Utc::now(),
        });
        runtime
            .execute::<Book>(&acme, id, ExpectedVersion::Exact(1), delete.clone())
            .await
            .unwrap();
        assert!(matches!(
            runtime
                .execute::<Book>(&acme, id, ExpectedVersion::Exact(2), delete)
                .await,
            Err(RuntimeError::Conflict(_))
        ));
        assert!(matches!(
            runtime
                .execute::<Book>(&acme, id, ExpectedVersion::Exact(2), retitle("x"))
                .await,
            Err(RuntimeError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_likes_all_land() {
        let runtime = Arc::new(StreamRuntime::new(InMemoryEventStore::new()));
        let acme = tenant("acme");
        let id = AggregateId::new();
        runtime
            .execute::<Book>(&acme, id, ExpectedVersion::NoStream, create_book())
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let runtime = runtime.clone();
            let acme = acme.clone();
            tasks.push(tokio::spawn(async move {
                let like = BookCommand::LikeBook(LikeBook {
                    account_id: AccountId::new(),
                    occurred_at: Utc::now(),
                });
                runtime.execute_latest::<Book>(&acme, id, like, 64).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let loaded = runtime.load::<Book>(&acme, id).await.unwrap();
        assert_eq!(loaded.state.like_count(), 16);
        assert_eq!(loaded.version, 17);
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_generically() {
        let runtime = StreamRuntime::new(InMemoryEventStore::new());
        let acme = tenant("acme");
        let register = |email: &str| {
            AccountCommand::RegisterAccount(RegisterAccount {
                email: email.to_string(),
                display_name: "Ada".to_string(),
                occurred_at: Utc::now(),
            })
        };

        runtime
            .execute::<Account>(
                &acme,
                AggregateId::new(),
                ExpectedVersion::NoStream,
                register("ada@example.com"),
            )
            .await
            .unwrap();
        let err = runtime
            .execute::<Account>(
                &acme,
                AggregateId::new(),
                ExpectedVersion::NoStream,
                register("ADA@example.com"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Rejected));
        assert_eq!(err.to_string(), "request rejected");

        // Same address is free in another tenant.
        runtime
            .execute::<Account>(
                &tenant("globex"),
                AggregateId::new(),
                ExpectedVersion::NoStream,
                register("ada@example.com"),
            )
            .await
            .unwrap();
    }
}
