//! Request governor: the single path to the network for rate-limited targets.
//!
//! Every call resolves its domain policy, takes a scheduler lease, runs with a
//! timeout, and on failure consults the retry engine until it succeeds, runs
//! out of retries, or hits a non-retryable condition.

use anyhow::Context;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use shared::GovernorConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::GovernorError;
use crate::policy::{DomainKey, DomainPolicy, PolicyRegistry, PolicySource};
use crate::request::RequestSpec;
use crate::retry::{self, Attempt, Decision, Failure, StopReason};
use crate::scheduler::Scheduler;
use crate::snapshot::{millis, Snapshot};

/// Retry loop states for one logical request
enum State<T> {
    Attempting(Attempt),
    BackingOff { attempt: Attempt, delay: Duration },
    Succeeded(T),
    Exhausted { attempt: Attempt, failure: Failure },
    FailedNonRetryable { attempt: Attempt, failure: Failure },
}

/// Mediates outbound HTTP calls per destination domain.
///
/// Cheap to clone; clones share scheduler state and the HTTP client.
#[derive(Debug, Clone)]
pub struct Governor {
    scheduler: Scheduler,
    client: Client,
}

impl Governor {
    /// Create a governor over the given policies
    pub fn new(registry: PolicyRegistry, min_request_interval: Duration, client: Client) -> Self {
        Self {
            scheduler: Scheduler::new(Arc::new(registry), min_request_interval),
            client,
        }
    }

    /// Create a governor, and the HTTP client it owns, from configuration
    pub fn from_config(config: &GovernorConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::new(
            PolicyRegistry::from_config(config),
            Duration::from_millis(config.min_request_interval_ms),
            client,
        ))
    }

    pub fn registry(&self) -> &PolicyRegistry {
        self.scheduler.registry()
    }

    /// Current per-domain counters, for monitoring
    pub fn snapshot(&self) -> Snapshot {
        self.scheduler.snapshot()
    }

    /// Execute an HTTP request under its domain's policy.
    ///
    /// Returns the first response with a success status. Any other outcome
    /// ends as [`GovernorError::Exhausted`] or [`GovernorError::NonRetryable`].
    pub async fn execute(&self, spec: &RequestSpec) -> Result<Response, GovernorError> {
        let domain = spec.domain()?;
        let policy = self.policy_for(&domain);
        let spec = spec.with_resolved_timeout(&policy);
        let limit = spec.timeout.unwrap_or(policy.timeout);

        self.run(&domain, policy, limit, || send(spec.build(&self.client), limit))
            .await
    }

    /// GET a URL and decode the JSON body.
    ///
    /// The body is read inside the attempt, under the lease and timeout, so a
    /// connection dropped mid-body is retried like any other lost response.
    /// A body that is not valid JSON for `T` is terminal.
    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, GovernorError> {
        let spec = RequestSpec::get(url);
        let domain = spec.domain()?;
        let policy = self.policy_for(&domain);
        let spec = spec.with_resolved_timeout(&policy);
        let limit = spec.timeout.unwrap_or(policy.timeout);

        let body = self
            .run(&domain, policy, limit, || {
                let request = spec.build(&self.client);
                async move {
                    let response = send(request, limit).await?;
                    response
                        .bytes()
                        .await
                        .map_err(|e| Failure::from_reqwest(&e, limit))
                }
            })
            .await?;

        serde_json::from_slice(&body).map_err(|source| GovernorError::Decode {
            url: spec.url.to_string(),
            source,
        })
    }

    /// Govern an arbitrary async operation against `url`'s domain.
    ///
    /// `op` is invoked once per attempt and must classify its own failures.
    /// Each attempt is cut off after `timeout`, or the policy timeout if `None`.
    pub async fn call<T, F, Fut>(
        &self,
        url: &Url,
        timeout: Option<Duration>,
        op: F,
    ) -> Result<T, GovernorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let domain = DomainKey::try_from(url)?;
        let policy = self.policy_for(&domain);
        let limit = timeout.unwrap_or(policy.timeout);

        self.run(&domain, policy, limit, op).await
    }

    fn policy_for(&self, domain: &DomainKey) -> DomainPolicy {
        let (policy, source) = self.registry().resolve_with_source(domain);
        if source == PolicySource::Default {
            debug!(domain = %domain, "No policy for domain, using default");
        }
        *policy
    }

    async fn run<T, F, Fut>(
        &self,
        domain: &DomainKey,
        policy: DomainPolicy,
        limit: Duration,
        mut op: F,
    ) -> Result<T, GovernorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let mut state = State::Attempting(Attempt::default());

        loop {
            state = match state {
                State::Attempting(attempt) => {
                    let outcome = {
                        let _lease = self.scheduler.acquire(domain).await?;
                        debug!(domain = %domain, attempt = attempt.number(), "Dispatching request");

                        timeout(limit, op())
                            .await
                            .unwrap_or(Err(Failure::TimedOut { after: limit }))
                    };

                    match outcome {
                        Ok(value) => State::Succeeded(value),
                        Err(failure) => match retry::classify(&failure, &attempt, &policy) {
                            Decision::Retry { after } => {
                                warn!(
                                    domain = %domain,
                                    failure = %failure,
                                    attempt = attempt.number(),
                                    delay_ms = millis(after),
                                    "Request failed, retrying"
                                );
                                State::BackingOff {
                                    attempt,
                                    delay: after,
                                }
                            }
                            Decision::Stop(StopReason::Exhausted) => {
                                State::Exhausted { attempt, failure }
                            }
                            Decision::Stop(StopReason::NonRetryable) => {
                                State::FailedNonRetryable { attempt, failure }
                            }
                        },
                    }
                }
                State::BackingOff { attempt, delay } => {
                    // No lease is held here
                    sleep(delay).await;
                    State::Attempting(attempt.next())
                }
                State::Succeeded(value) => return Ok(value),
                State::Exhausted { attempt, failure } => {
                    return Err(GovernorError::Exhausted {
                        domain: domain.clone(),
                        attempts: attempt.number(),
                        last: failure,
                    })
                }
                State::FailedNonRetryable { attempt, failure } => {
                    return Err(GovernorError::NonRetryable {
                        domain: domain.clone(),
                        attempts: attempt.number(),
                        last: failure,
                    })
                }
            };
        }
    }
}

/// Send one attempt and classify anything but a success status as a failure
async fn send(request: RequestBuilder, limit: Duration) -> Result<Response, Failure> {
    let response = request
        .send()
        .await
        .map_err(|e| Failure::from_reqwest(&e, limit))?;

    match Failure::from_response(&response) {
        Some(failure) => Err(failure),
        None => Ok(response),
    }
}
