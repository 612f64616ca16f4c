//! Outbound request governor for the anime cross-reference utility.
//!
//! Every HTTP call to a third-party provider goes through a [`Governor`], which
//! enforces per-domain concurrency caps, a global minimum spacing between
//! dispatches, and retries with exponential backoff, jitter and
//! server-directed `Retry-After` delays.

pub mod error;
pub mod governor;
pub mod policy;
pub mod request;
pub mod retry;
pub mod scheduler;
pub mod snapshot;

pub use error::GovernorError;
pub use governor::Governor;
pub use policy::{DomainKey, DomainPolicy, PolicyRegistry, PolicySource};
pub use request::RequestSpec;
pub use retry::{Attempt, Decision, Failure, StopReason};
pub use scheduler::{Lease, Scheduler, DEFAULT_MIN_REQUEST_INTERVAL};
pub use snapshot::{DomainSnapshot, Snapshot};
