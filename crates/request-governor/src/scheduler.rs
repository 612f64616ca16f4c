//! Per-domain scheduler.
//!
//! Owns one concurrency gate and one dispatch watermark per domain and hands
//! out leases that allow exactly one request to be in flight.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::error::GovernorError;
use crate::policy::{DomainKey, DomainPolicy, PolicyRegistry};
use crate::snapshot::{millis, DomainSnapshot, Snapshot};

/// Default floor between two dispatches to the same domain
pub const DEFAULT_MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);

/// Mutable state for one domain, created on first use
#[derive(Debug)]
struct DomainState {
    policy: DomainPolicy,
    gate: Arc<Semaphore>,
    /// Issue time of the latest dispatch, possibly reserved in the future
    last_dispatch: Mutex<Option<Instant>>,
    active: AtomicUsize,
    waiting: AtomicUsize,
}

impl DomainState {
    fn new(policy: DomainPolicy) -> Self {
        Self {
            policy,
            gate: Arc::new(Semaphore::new(policy.max_concurrency)),
            last_dispatch: Mutex::new(None),
            active: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Claim the next dispatch instant at least `interval` after the previous one
    fn reserve_dispatch(&self, interval: Duration) -> Instant {
        let mut last = self
            .last_dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let at = match *last {
            Some(previous) => now.max(previous + interval),
            None => now,
        };
        *last = Some(at);
        at
    }

    fn last_dispatch(&self) -> Option<Instant> {
        *self
            .last_dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts a caller as waiting until dropped
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Permission to have one request in flight to a domain.
///
/// The concurrency slot is returned when the lease is dropped, whichever way
/// the wrapped call ends.
#[derive(Debug)]
pub struct Lease {
    dispatched_at: Instant,
    state: Arc<DomainState>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// When this lease was allowed to dispatch
    pub fn dispatched_at(&self) -> Instant {
        self.dispatched_at
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Hands out per-domain leases, enforcing concurrency caps and dispatch spacing
#[derive(Debug, Clone)]
pub struct Scheduler {
    registry: Arc<PolicyRegistry>,
    domains: Arc<DashMap<DomainKey, Arc<DomainState>>>,
    min_request_interval: Duration,
}

impl Scheduler {
    /// Create a scheduler over the given policies
    pub fn new(registry: Arc<PolicyRegistry>, min_request_interval: Duration) -> Self {
        Self {
            registry,
            domains: Arc::new(DashMap::new()),
            min_request_interval,
        }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn min_request_interval(&self) -> Duration {
        self.min_request_interval
    }

    /// Wait for a concurrency slot and a dispatch instant for `domain`.
    ///
    /// The slot is taken first; the caller then sleeps until its reserved
    /// dispatch instant, which is at least `min_request_interval` after the
    /// previous dispatch to the same domain.
    pub async fn acquire(&self, domain: &DomainKey) -> Result<Lease, GovernorError> {
        let state = self.state_for(domain);

        let (permit, dispatched_at) = {
            let _waiting = Waiting::enter(&state.waiting);

            let permit = state
                .gate
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| GovernorError::GateClosed {
                    domain: domain.clone(),
                })?;

            let dispatch_at = state.reserve_dispatch(self.min_request_interval);
            let now = Instant::now();
            if dispatch_at > now {
                debug!(
                    domain = %domain,
                    wait_ms = (dispatch_at - now).as_millis(),
                    "Spacing dispatch"
                );
                sleep_until(dispatch_at).await;
            }

            (permit, dispatch_at)
        };

        state.active.fetch_add(1, Ordering::SeqCst);

        Ok(Lease {
            dispatched_at,
            state,
            _permit: permit,
        })
    }

    /// Get or lazily create the state for a domain
    fn state_for(&self, domain: &DomainKey) -> Arc<DomainState> {
        if let Some(state) = self.domains.get(domain) {
            return state.clone();
        }

        self.domains
            .entry(domain.clone())
            .or_insert_with(|| {
                let policy = *self.registry.resolve(domain);
                debug!(
                    domain = %domain,
                    max_concurrency = policy.max_concurrency,
                    "Tracking new domain"
                );
                Arc::new(DomainState::new(policy))
            })
            .clone()
    }

    /// Point-in-time view of every domain seen so far.
    ///
    /// Each domain's counters are read independently.
    pub fn snapshot(&self) -> Snapshot {
        let now = Instant::now();
        let domains = self
            .domains
            .iter()
            .map(|entry| {
                let state = entry.value();
                let snapshot = DomainSnapshot {
                    active_leases: state.active.load(Ordering::SeqCst),
                    waiting: state.waiting.load(Ordering::SeqCst),
                    available_slots: state.gate.available_permits(),
                    since_last_dispatch_ms: state
                        .last_dispatch()
                        .map(|at| millis(now.saturating_duration_since(at))),
                    policy: state.policy,
                };
                (entry.key().to_string(), snapshot)
            })
            .collect();

        Snapshot::new(self.min_request_interval, domains)
    }
}
