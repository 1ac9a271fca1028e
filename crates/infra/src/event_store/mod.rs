//! Append-only, tenant-partitioned event store boundary.
//!
//! The trait lives in [`r#trait`]; two backends implement it:
//! - [`InMemoryEventStore`] for tests and single-process use
//! - [`PostgresEventStore`] for durable storage (compare-and-set on `streams.version`)

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::{PostgresEventStore, migrate};
pub use r#trait::{
    AppendOutcome, AppendRequest, EventStore, EventStoreError, NewEvent, RecordedEvent,
};
