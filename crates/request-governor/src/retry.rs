//! Retry decision engine.
//!
//! Classifies the outcome of a failed attempt and decides whether the
//! governor should try again, and after how long.

use rand::Rng;
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::policy::DomainPolicy;

/// Classified outcome of one failed attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// No response was received: connection refused, DNS failure, reset
    #[error("no response: {reason}")]
    NoResponse { reason: String },

    /// The attempt exceeded its timeout
    #[error("timed out after {}ms", .after.as_millis())]
    TimedOut { after: Duration },

    /// A response arrived with a non-success status
    #[error("HTTP {status}")]
    Status {
        status: StatusCode,
        /// Server-directed minimum wait before retrying
        retry_after: Option<Duration>,
    },

    /// The request could not be sent as described (bad header, bad body)
    #[error("invalid request: {reason}")]
    Request { reason: String },
}

impl Failure {
    /// Classify a received response; `None` for success statuses
    pub fn from_response(response: &Response) -> Option<Self> {
        let status = response.status();
        if status.is_success() {
            return None;
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| parse_retry_after(value).ok());

        Some(Failure::Status {
            status,
            retry_after,
        })
    }

    /// Classify a transport error raised while sending a request
    pub fn from_reqwest(error: &reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            Failure::TimedOut { after: timeout }
        } else if let Some(status) = error.status() {
            Failure::Status {
                status,
                retry_after: None,
            }
        } else if error.is_builder() || error.is_redirect() {
            Failure::Request {
                reason: error.to_string(),
            }
        } else {
            Failure::NoResponse {
                reason: error.to_string(),
            }
        }
    }

    /// The HTTP status, if a response was received
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Failure::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Retry bookkeeping for one logical request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attempt {
    /// Retries already made; 0 during the initial attempt
    pub retry_count: u32,
}

impl Attempt {
    /// Total attempts made so far, counting the current one
    pub fn number(&self) -> u32 {
        self.retry_count + 1
    }

    /// Advance to the next retry
    pub fn next(self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
        }
    }
}

/// Why the retry loop stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The retry budget is used up
    Exhausted,
    /// The failure will not go away by retrying
    NonRetryable,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { after: Duration },
    Stop(StopReason),
}

/// Decide whether to retry a failed attempt
///
/// Rules are checked in order: exhausted budget, missing response,
/// rate-limit and gateway statuses, timeouts, other client errors,
/// other server errors. Anything else stops the loop.
pub fn classify(failure: &Failure, attempt: &Attempt, policy: &DomainPolicy) -> Decision {
    if attempt.retry_count >= policy.max_retries {
        return Decision::Stop(StopReason::Exhausted);
    }

    if !is_retryable(failure) {
        return Decision::Stop(StopReason::NonRetryable);
    }

    Decision::Retry {
        after: retry_delay(failure, attempt.retry_count, policy),
    }
}

fn is_retryable(failure: &Failure) -> bool {
    match failure {
        Failure::NoResponse { .. } => true,
        Failure::Status { status, .. }
            if matches!(
                *status,
                StatusCode::TOO_MANY_REQUESTS
                    | StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT
            ) =>
        {
            true
        }
        Failure::TimedOut { .. } => true,
        Failure::Status { status, .. } if status.is_client_error() => false,
        Failure::Status { status, .. } if status.is_server_error() => true,
        _ => false,
    }
}

/// Delay before the next attempt; server directives win over backoff
fn retry_delay(failure: &Failure, retry_count: u32, policy: &DomainPolicy) -> Duration {
    match failure {
        Failure::Status {
            retry_after: Some(directed),
            ..
        } => (*directed).min(policy.max_delay),
        _ => backoff_delay(retry_count, policy, jitter(policy)),
    }
}

/// Exponential backoff: `base * 2^retry_count + jitter`, capped at `max_delay`.
///
/// The exponent is the pre-increment retry count, so the first retry waits
/// roughly `base_delay`.
pub fn backoff_delay(retry_count: u32, policy: &DomainPolicy, jitter: Duration) -> Duration {
    let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
    policy
        .base_delay
        .saturating_mul(factor)
        .saturating_add(jitter)
        .min(policy.max_delay)
}

/// Random jitter drawn uniformly from `[0, base_delay / 2]`
pub fn jitter(policy: &DomainPolicy) -> Duration {
    let upper = u64::try_from((policy.base_delay / 2).as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rand::thread_rng().gen_range(0..=upper))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryAfterParseError {
    #[error("Unable to parse value '{0}'")]
    ValueError(String),

    #[error("Header value contains invalid chars")]
    HeaderValueError,
}

/// Parse a `Retry-After` header (RFC 7231 section 7.1.3).
///
/// Accepts delay-seconds or an HTTP-date; dates in the past yield zero.
pub fn parse_retry_after(value: &HeaderValue) -> Result<Duration, RetryAfterParseError> {
    let value = value
        .to_str()
        .map_err(|_| RetryAfterParseError::HeaderValueError)?
        .trim();

    value.parse::<u64>().map(Duration::from_secs).or_else(|_| {
        httpdate::parse_http_date(value)
            .map(|at| at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
            .map_err(|_| RetryAfterParseError::ValueError(value.into()))
    })
}
