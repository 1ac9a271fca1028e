use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::event_store::{EventStore, RecordedEvent};
use crate::notifications::{Notification, NotificationBus};
use crate::projections::{CheckpointStore, EngineConfig, ProjectionError, ProjectionState};
use crate::projections::engine::Lane;

/// Everything one projection worker needs, cloned out of the engine.
pub(crate) struct WorkerContext {
    pub(crate) lane: Arc<Lane>,
    pub(crate) store: Arc<dyn EventStore>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) bus: NotificationBus,
    pub(crate) config: EngineConfig,
}

/// Projection worker loop.
///
/// - Resumes from the highest checkpoint any tenant holds for the projection
/// - Tails `read_all` in batches, waking on appends or the poll interval
/// - Writes the row, then the checkpoint, then notifies waiters
/// - Retries a failing event with backoff, then halts until resumed
/// - Retries failed log and checkpoint reads indefinitely without halting
/// - Exits when shutdown is signalled or the engine handle is dropped
pub(crate) async fn run(ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    let name = ctx.lane.name();
    let mut head = ctx.store.watch_head();
    let mut started = false;
    let mut read_failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if ctx.lane.is_halted() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ctx.lane.wake.notified() => {}
            }
            continue;
        }

        if !started {
            match ctx.checkpoints.max_position(name).await {
                Ok(position) => {
                    ctx.lane.advance(position);
                    started = true;
                    info!(projection = name, position, "projection worker started");
                }
                Err(e) => {
                    read_failures = read_failures.saturating_add(1);
                    if !pause_after_read_failure(&ctx, &mut shutdown, read_failures, e.into()).await {
                        break;
                    }
                    continue;
                }
            }
        }

        match step(&ctx).await {
            Ok(more) => {
                read_failures = 0;
                if more {
                    continue;
                }
            }
            Err(StepError::Read(e)) => {
                read_failures = read_failures.saturating_add(1);
                if !pause_after_read_failure(&ctx, &mut shutdown, read_failures, e).await {
                    break;
                }
                continue;
            }
            Err(StepError::Apply(e)) => {
                halt(&ctx, e);
                continue;
            }
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = next_append(&mut head) => {}
            _ = tokio::time::sleep(ctx.config.poll_interval()) => {}
            _ = ctx.lane.wake.notified() => {}
        }
    }

    ctx.lane.set_state(ProjectionState::Stopped);
    info!(projection = name, position = ctx.lane.position(), "projection worker stopped");
}

/// Why a batch stopped short.
enum StepError {
    /// The shared log could not be read; every projection sees this one.
    Read(ProjectionError),
    /// This projection could not apply an event within its retries.
    Apply(ProjectionError),
}

/// Apply one batch. `Ok(true)` when events were consumed and more may follow.
async fn step(ctx: &WorkerContext) -> Result<bool, StepError> {
    let _gate = ctx.lane.gate.lock().await;
    let from = ctx.lane.position();
    let batch = ctx
        .store
        .read_all(from, ctx.config.batch_size.max(1))
        .await
        .map_err(|e| StepError::Read(e.into()))?;
    if batch.is_empty() {
        return Ok(false);
    }

    for event in &batch {
        if !ctx.lane.projection.handles(event) {
            ctx.lane.advance(event.global_position);
            continue;
        }
        apply_with_retry(ctx, event).await.map_err(StepError::Apply)?;
        ctx.lane.advance(event.global_position);
        ctx.bus.publish(Notification {
            tenant_id: event.tenant_id.clone(),
            projection: ctx.lane.name().to_string(),
            aggregate_id: event.aggregate_id,
            event_kind: event.event_type.clone(),
            version: event.sequence_number,
        });
    }

    debug!(
        projection = ctx.lane.name(),
        from,
        to = ctx.lane.position(),
        "projection batch applied"
    );
    Ok(true)
}

async fn apply_with_retry(ctx: &WorkerContext, event: &RecordedEvent) -> Result<(), ProjectionError> {
    let mut attempt: u32 = 0;
    loop {
        match apply_one(ctx, event).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < ctx.config.max_fold_retries => {
                attempt += 1;
                warn!(
                    projection = ctx.lane.name(),
                    position = event.global_position,
                    event_type = %event.event_type,
                    attempt,
                    error = %e,
                    "projection apply failed; retrying"
                );
                tokio::time::sleep(backoff(&ctx.config, attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Row first, checkpoint second: a crash in between replays an event the row
/// already skips.
async fn apply_one(ctx: &WorkerContext, event: &RecordedEvent) -> Result<(), ProjectionError> {
    ctx.lane.projection.apply(event).await?;
    ctx.checkpoints
        .save(&event.tenant_id, ctx.lane.name(), event.global_position)
        .await?;
    Ok(())
}

fn backoff(config: &EngineConfig, attempt: u32) -> Duration {
    config.retry_backoff().saturating_mul(attempt)
}

/// Log a failed read and sleep before the next attempt, staying `Running`.
/// Returns `false` when shutdown arrived while waiting.
async fn pause_after_read_failure(
    ctx: &WorkerContext,
    shutdown: &mut watch::Receiver<bool>,
    failures: u32,
    e: ProjectionError,
) -> bool {
    warn!(
        projection = ctx.lane.name(),
        position = ctx.lane.position(),
        failures,
        error = %e,
        "event log read failed; retrying"
    );
    let ceiling = ctx.config.poll_interval().max(ctx.config.retry_backoff());
    let delay = backoff(&ctx.config, failures).min(ceiling);
    tokio::select! {
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}

fn halt(ctx: &WorkerContext, e: ProjectionError) {
    let position = ctx.lane.position();
    error!(
        projection = ctx.lane.name(),
        position,
        error = %e,
        "projection halted"
    );
    ctx.lane.set_state(ProjectionState::Halted {
        position,
        error: e.to_string(),
    });
}

/// Resolves on the next local append; never resolves without a head watch.
async fn next_append(head: &mut Option<watch::Receiver<u64>>) {
    let closed = match head.as_mut() {
        Some(rx) => rx.changed().await.is_err(),
        None => return std::future::pending().await,
    };
    if closed {
        *head = None;
    }
}
