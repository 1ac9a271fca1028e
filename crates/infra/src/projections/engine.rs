//! Projection engine: one long-lived worker per registered projection.
//!
//! Each worker tails the global log in commit order from its checkpoint,
//! applies the events its projection handles, checkpoints after the row write,
//! and then publishes to the [`NotificationBus`]. A projection that keeps
//! failing on an event is halted on its own; the others keep running.
//!
//! Rebuilds take the projection's lane (the same gate the worker holds while
//! applying a batch), so a rebuild and the live worker never interleave writes.
//! Appends are never blocked by either.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use folio_core::TenantId;

use crate::event_store::EventStore;
use crate::notifications::NotificationBus;
use crate::workers::projection_worker::{self, WorkerContext};

use super::{CheckpointStore, Projection, ProjectionError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Events fetched per `read_all` call.
    pub batch_size: usize,
    /// Fallback poll when no append signal arrives.
    pub poll_interval_ms: u64,
    /// Retries of a failing event before the projection halts.
    pub max_fold_retries: u32,
    /// Backoff unit; attempt `n` sleeps `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            poll_interval_ms: 250,
            max_fold_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProjectionState {
    Running,
    /// Stopped advancing after exhausting retries on the event after `position`.
    Halted { position: u64, error: String },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionStatus {
    pub name: String,
    /// Last global position this projection has applied or skipped.
    pub position: u64,
    pub state: ProjectionState,
}

/// Per-projection coordination shared by the worker and the handle.
pub(crate) struct Lane {
    pub(crate) projection: Arc<dyn Projection>,
    /// Held while applying a batch or rebuilding.
    pub(crate) gate: Mutex<()>,
    position: AtomicU64,
    state: RwLock<ProjectionState>,
    pub(crate) wake: Notify,
}

impl Lane {
    fn new(projection: Arc<dyn Projection>) -> Self {
        Self {
            projection,
            gate: Mutex::new(()),
            position: AtomicU64::new(0),
            state: RwLock::new(ProjectionState::Running),
            wake: Notify::new(),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.projection.name()
    }

    pub(crate) fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub(crate) fn advance(&self, position: u64) {
        self.position.fetch_max(position, Ordering::AcqRel);
    }

    pub(crate) fn state(&self) -> ProjectionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_state(&self, state: ProjectionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn is_halted(&self) -> bool {
        matches!(self.state(), ProjectionState::Halted { .. })
    }

    fn status(&self) -> ProjectionStatus {
        ProjectionStatus {
            name: self.name().to_string(),
            position: self.position(),
            state: self.state(),
        }
    }
}

/// Registers projections, then [`start`](ProjectionEngine::start)s their workers.
pub struct ProjectionEngine {
    store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    bus: NotificationBus,
    config: EngineConfig,
    projections: Vec<Arc<dyn Projection>>,
}

impl ProjectionEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        bus: NotificationBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            checkpoints,
            bus,
            config,
            projections: Vec::new(),
        }
    }

    /// Names double as checkpoint keys, so they must be unique.
    pub fn register(&mut self, projection: Arc<dyn Projection>) -> Result<(), ProjectionError> {
        if self.projections.iter().any(|p| p.name() == projection.name()) {
            return Err(ProjectionError::Failed(format!(
                "projection {} registered twice",
                projection.name()
            )));
        }
        self.projections.push(projection);
        Ok(())
    }

    /// Spawn one worker task per projection on the current tokio runtime.
    pub fn start(self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut lanes = HashMap::new();
        let mut tasks = Vec::new();

        for projection in self.projections {
            let lane = Arc::new(Lane::new(projection));
            let ctx = WorkerContext {
                lane: lane.clone(),
                store: self.store.clone(),
                checkpoints: self.checkpoints.clone(),
                bus: self.bus.clone(),
                config: self.config.clone(),
            };
            tasks.push(tokio::spawn(projection_worker::run(ctx, shutdown_rx.clone())));
            lanes.insert(lane.name(), lane);
        }

        info!(projections = lanes.len(), "projection engine started");

        EngineHandle {
            lanes,
            store: self.store,
            checkpoints: self.checkpoints,
            config: self.config,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Control surface of a running engine.
pub struct EngineHandle {
    lanes: HashMap<&'static str, Arc<Lane>>,
    store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: EngineConfig,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("projections", &self.lanes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EngineHandle {
    fn lane(&self, name: &str) -> Result<&Arc<Lane>, ProjectionError> {
        self.lanes
            .get(name)
            .ok_or_else(|| ProjectionError::UnknownProjection(name.to_string()))
    }

    pub fn status(&self, name: &str) -> Option<ProjectionStatus> {
        self.lanes.get(name).map(|lane| lane.status())
    }

    pub fn statuses(&self) -> Vec<ProjectionStatus> {
        let mut all: Vec<_> = self.lanes.values().map(|lane| lane.status()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Clear a halt so the worker retries the failing event. Returns whether
    /// the projection was halted.
    pub fn resume(&self, name: &str) -> Result<bool, ProjectionError> {
        let lane = self.lane(name)?;
        if !lane.is_halted() {
            return Ok(false);
        }
        lane.set_state(ProjectionState::Running);
        lane.wake.notify_one();
        info!(projection = name, position = lane.position(), "projection resumed");
        Ok(true)
    }

    /// Rebuild one tenant's rows of one projection from the event log.
    ///
    /// Replays up to the worker's current position only; later events are the
    /// worker's to apply. Returns the number of events replayed.
    ///
    /// The tenant's rows and checkpoint are cleared before replaying. If the
    /// replay fails partway they stay partial until a rebuild succeeds.
    pub async fn rebuild(&self, name: &str, tenant_id: &TenantId) -> Result<u64, ProjectionError> {
        let lane = self.lane(name)?;
        let _gate = lane.gate.lock().await;
        let upto = lane.position();

        lane.projection.clear_tenant(tenant_id).await?;
        self.checkpoints.clear(tenant_id, name).await?;

        let mut from = 0;
        let mut last_applied = None;
        let mut replayed = 0;
        'replay: while from < upto {
            let batch = self.store.read_all(from, self.config.batch_size.max(1)).await?;
            if batch.is_empty() {
                break;
            }
            for event in batch {
                if event.global_position > upto {
                    break 'replay;
                }
                from = event.global_position;
                if &event.tenant_id != tenant_id || !lane.projection.handles(&event) {
                    continue;
                }
                if let Err(e) = lane.projection.apply(&event).await {
                    error!(
                        projection = name,
                        tenant = %tenant_id,
                        position = event.global_position,
                        error = %e,
                        "rebuild failed; tenant rows are partial until rebuilt again"
                    );
                    return Err(e);
                }
                last_applied = Some(event.global_position);
                replayed += 1;
            }
        }

        if let Some(position) = last_applied {
            self.checkpoints.save(tenant_id, name, position).await?;
        }

        info!(projection = name, tenant = %tenant_id, replayed, upto, "projection rebuilt");
        Ok(replayed)
    }

    /// Signal every worker to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("projection engine stopped");
    }
}
