//! In-process change notification bus.
//!
//! The projection engine publishes after each durable row write; callers that
//! want read-after-write consistency subscribe first and then wait with a
//! bounded timeout. The bus is a liveness aid only: a lost notification leaves
//! the read model correct and the caller falls back to polling on timeout.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use folio_core::{AggregateId, TenantId};

/// Default number of (tenant, aggregate) addresses remembered for late subscribers.
pub const DEFAULT_SEEN_CAPACITY: usize = 65_536;

/// "Projection `projection` has applied event `event_kind` at stream `version`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub tenant_id: TenantId,
    pub projection: String,
    pub aggregate_id: AggregateId,
    pub event_kind: String,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFilter {
    Id(AggregateId),
    /// Any aggregate; the first matching publish wins.
    Any,
}

/// What a waiter is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub tenant_id: TenantId,
    pub aggregate: AggregateFilter,
    /// Empty means any kind.
    pub kinds: BTreeSet<String>,
    pub min_version: u64,
    pub projection: Option<String>,
}

impl Subscription {
    pub fn new(tenant_id: TenantId, aggregate: AggregateFilter) -> Self {
        Self {
            tenant_id,
            aggregate,
            kinds: BTreeSet::new(),
            min_version: 0,
            projection: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kinds.insert(kind.into());
        self
    }

    pub fn min_version(mut self, version: u64) -> Self {
        self.min_version = version;
        self
    }

    pub fn projection(mut self, projection: impl Into<String>) -> Self {
        self.projection = Some(projection.into());
        self
    }

    pub fn matches(&self, n: &Notification) -> bool {
        self.tenant_id == n.tenant_id
            && match self.aggregate {
                AggregateFilter::Id(id) => id == n.aggregate_id,
                AggregateFilter::Any => true,
            }
            && (self.kinds.is_empty() || self.kinds.contains(&n.event_kind))
            && n.version >= self.min_version
            && self
                .projection
                .as_deref()
                .is_none_or(|p| p == n.projection)
    }
}

/// A bounded wait ran out before a matching publish.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("projection did not catch up within {waited:?}")]
pub struct ProjectionLagTimeout {
    pub waited: Duration,
}

struct Waiter {
    subscription: Subscription,
    tx: oneshot::Sender<Notification>,
}

type Address = (TenantId, AggregateId);

#[derive(Default)]
struct BusState {
    waiters: HashMap<u64, Waiter>,
    /// Highest version published per (projection, kind) for each address.
    seen: HashMap<Address, HashMap<(String, String), u64>>,
    seen_order: VecDeque<Address>,
}

struct BusInner {
    state: Mutex<BusState>,
    next_id: AtomicU64,
    seen_capacity: usize,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Publish/subscribe hub keyed by (tenant, aggregate id, event kind).
///
/// Cheap to clone; clones share registrations.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("pending", &self.pending())
            .finish()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::with_seen_capacity(DEFAULT_SEEN_CAPACITY)
    }

    pub fn with_seen_capacity(seen_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState::default()),
                next_id: AtomicU64::new(1),
                seen_capacity: seen_capacity.max(1),
            }),
        }
    }

    pub fn subscribe(
        &self,
        tenant_id: TenantId,
        aggregate: AggregateFilter,
        kinds: impl IntoIterator<Item = impl Into<String>>,
        min_version: u64,
    ) -> WaitHandle {
        let mut subscription = Subscription::new(tenant_id, aggregate).min_version(min_version);
        subscription.kinds = kinds.into_iter().map(Into::into).collect();
        self.subscribe_filter(subscription)
    }

    /// Register a waiter.
    ///
    /// An exact-id subscription whose condition was already published is
    /// satisfied at once, so subscribing after the write cannot miss a fast
    /// projection. Wildcards only match future publishes.
    pub fn subscribe_filter(&self, subscription: Subscription) -> WaitHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut state = self.inner.lock();
        if let Some(hit) = already_seen(&state, &subscription) {
            let _ = tx.send(hit);
        } else {
            state.waiters.insert(id, Waiter { subscription, tx });
        }
        drop(state);

        WaitHandle {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Release every waiter the notification satisfies. Never blocks on waiters.
    pub fn publish(&self, notification: Notification) {
        let mut state = self.inner.lock();
        remember(&mut state, &notification, self.inner.seen_capacity);

        let satisfied: Vec<u64> = state
            .waiters
            .iter()
            .filter(|(_, w)| w.subscription.matches(&notification))
            .map(|(id, _)| *id)
            .collect();

        for id in &satisfied {
            if let Some(waiter) = state.waiters.remove(id) {
                // The receiver may have timed out concurrently; nothing to do then.
                let _ = waiter.tx.send(notification.clone());
            }
        }
        drop(state);

        if !satisfied.is_empty() {
            debug!(
                tenant = %notification.tenant_id,
                aggregate_id = %notification.aggregate_id,
                projection = %notification.projection,
                released = satisfied.len(),
                "notification released waiters"
            );
        }
    }

    /// Registered, unsatisfied waiters.
    pub fn pending(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

fn already_seen(state: &BusState, subscription: &Subscription) -> Option<Notification> {
    let AggregateFilter::Id(aggregate_id) = subscription.aggregate else {
        return None;
    };
    let seen = state.seen.get(&(subscription.tenant_id.clone(), aggregate_id))?;
    seen.iter()
        .map(|((projection, kind), version)| Notification {
            tenant_id: subscription.tenant_id.clone(),
            projection: projection.clone(),
            aggregate_id,
            event_kind: kind.clone(),
            version: *version,
        })
        .find(|n| subscription.matches(n))
}

fn remember(state: &mut BusState, n: &Notification, capacity: usize) {
    let address = (n.tenant_id.clone(), n.aggregate_id);
    if !state.seen.contains_key(&address) {
        state.seen_order.push_back(address.clone());
        while state.seen_order.len() > capacity {
            if let Some(evicted) = state.seen_order.pop_front() {
                state.seen.remove(&evicted);
            }
        }
    }
    let version = state
        .seen
        .entry(address)
        .or_default()
        .entry((n.projection.clone(), n.event_kind.clone()))
        .or_insert(0);
    *version = (*version).max(n.version);
}

/// One registration; dropping it (or timing out) removes it from the bus.
pub struct WaitHandle {
    id: u64,
    rx: oneshot::Receiver<Notification>,
    bus: std::sync::Weak<BusInner>,
}

impl WaitHandle {
    pub async fn wait(mut self, timeout: Duration) -> Result<Notification, ProjectionLagTimeout> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(notification)) => Ok(notification),
            // Sender dropped without a publish: the bus went away.
            Ok(Err(_)) | Err(_) => Err(ProjectionLagTimeout { waited: timeout }),
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.lock().waiters.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle").field("id", &self.id).finish()
    }
}
