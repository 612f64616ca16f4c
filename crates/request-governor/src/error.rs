//! Errors surfaced by the request governor to its callers.

use thiserror::Error;

use crate::policy::DomainKey;
use crate::retry::Failure;

/// Terminal outcome of a governed request that did not succeed.
///
/// Transient failures never appear here unless retries ran out.
#[derive(Error, Debug)]
pub enum GovernorError {
    /// The request URL has no host to rate limit on
    #[error("URL has no host: {url}")]
    InvalidUrl {
        /// The offending URL
        url: String,
    },

    /// Every permitted attempt failed with a retryable condition
    #[error("Request to {domain} failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Destination domain
        domain: DomainKey,
        /// Total attempts made, including the first
        attempts: u32,
        /// Condition observed on the final attempt
        #[source]
        last: Failure,
    },

    /// The destination rejected the request itself; retrying cannot help
    #[error("Request to {domain} failed permanently: {last}")]
    NonRetryable {
        /// Destination domain
        domain: DomainKey,
        /// Total attempts made, including the first
        attempts: u32,
        /// The rejecting condition
        #[source]
        last: Failure,
    },

    /// The domain's concurrency gate was closed
    #[error("Concurrency gate for {domain} is closed")]
    GateClosed {
        /// Destination domain
        domain: DomainKey,
    },

    /// A successful response body could not be decoded
    #[error("Failed to decode response from {url}: {source}")]
    Decode {
        /// Request URL
        url: String,
        /// Underlying decode error
        #[source]
        source: serde_json::Error,
    },
}

impl GovernorError {
    /// The last classified failure, for exhausted and non-retryable requests
    pub fn last_failure(&self) -> Option<&Failure> {
        match self {
            GovernorError::Exhausted { last, .. } | GovernorError::NonRetryable { last, .. } => {
                Some(last)
            }
            _ => None,
        }
    }

    /// Number of attempts made before giving up, if any were made
    pub fn attempts(&self) -> Option<u32> {
        match self {
            GovernorError::Exhausted { attempts, .. }
            | GovernorError::NonRetryable { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
