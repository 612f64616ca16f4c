//! Observability surface: point-in-time scheduler counters per domain.
//!
//! Meant for external monitoring. Nothing inside the governor reads it back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::policy::DomainPolicy;

/// Counters and policy for one domain.
///
/// A caller takes its slot before waiting out the dispatch spacing, so it is
/// counted in `waiting` while already holding a slot. `active_leases +
/// available_slots` can therefore be less than the policy's concurrency cap.
#[derive(Debug, Clone, Serialize)]
pub struct DomainSnapshot {
    /// Leases currently held, i.e. requests in flight
    pub active_leases: usize,
    /// Callers blocked waiting for a slot or for their dispatch instant
    pub waiting: usize,
    /// Free concurrency slots
    pub available_slots: usize,
    /// Milliseconds since the latest dispatch; zero if one is reserved ahead
    pub since_last_dispatch_ms: Option<u64>,
    /// Policy applied to the domain
    pub policy: DomainPolicy,
}

/// Snapshot of all domains the scheduler has seen
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub min_request_interval_ms: u64,
    pub domains: BTreeMap<String, DomainSnapshot>,
}

impl Snapshot {
    pub(crate) fn new(
        min_request_interval: Duration,
        domains: BTreeMap<String, DomainSnapshot>,
    ) -> Self {
        Self {
            taken_at: Utc::now(),
            min_request_interval_ms: millis(min_request_interval),
            domains,
        }
    }

    /// Requests in flight across all domains
    pub fn total_active(&self) -> usize {
        self.domains.values().map(|d| d.active_leases).sum()
    }

    /// Callers waiting across all domains
    pub fn total_waiting(&self) -> usize {
        self.domains.values().map(|d| d.waiting).sum()
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
