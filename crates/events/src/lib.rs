//! Domain event abstractions shared by aggregates, the event store and projections.

pub mod event;
pub mod handler;
pub mod stream;
pub mod tenant;

pub use event::{DecodeError, Event};
pub use handler::execute;
pub use stream::{StreamAggregate, UniqueClaim};
pub use tenant::TenantScoped;
