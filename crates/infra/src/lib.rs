//! Infrastructure layer: event store, stream runtime, projections, notifications, config.

pub mod config;
pub mod error;
pub mod event_store;
pub mod notifications;
pub mod projections;
pub mod read_model;
pub mod stream_runtime;

/// Background workers driven by the projection engine.
pub(crate) mod workers {
    pub(crate) mod projection_worker;
}

pub use config::{ConfigError, FolioConfig};
pub use error::{Classify, ErrorClass};
pub use stream_runtime::{Executed, Loaded, RuntimeError, StreamRuntime};
