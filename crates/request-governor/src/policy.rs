//! Domain policy registry.
//!
//! Maps a destination hostname to the rate-limit policy that governs it.
//! The registry is built once at startup and is read-only afterwards.

use reqwest::Url;
use serde::{Serialize, Serializer};
use shared::{GovernorConfig, PolicyConfig, PolicyOverride};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::GovernorError;
use crate::snapshot::millis;

/// Providers known to enforce server-side limits, plus local destinations.
///
/// Entries from the configuration file are layered over these by exact hostname.
const KNOWN_DOMAINS: &[(&str, PolicyConfig)] = &[
    // Jikan: 3 req/s and 60 req/min per client
    (
        "api.jikan.moe",
        PolicyConfig {
            max_retries: 5,
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
            timeout_ms: 30_000,
            max_concurrency: 2,
        },
    ),
    // AniList: 90 req/min, answers bursts with 429 and a Retry-After header
    (
        "graphql.anilist.co",
        PolicyConfig {
            max_retries: 5,
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
            timeout_ms: 30_000,
            max_concurrency: 2,
        },
    ),
    (
        "api.myanimelist.net",
        PolicyConfig {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            timeout_ms: 30_000,
            max_concurrency: 3,
        },
    ),
    (
        "kitsu.io",
        PolicyConfig {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            timeout_ms: 30_000,
            max_concurrency: 4,
        },
    ),
    // AniDB bans clients that send more than one request every few seconds
    (
        "api.anidb.net",
        PolicyConfig {
            max_retries: 3,
            base_delay_ms: 4000,
            max_delay_ms: 120_000,
            timeout_ms: 30_000,
            max_concurrency: 1,
        },
    ),
    (
        "localhost",
        PolicyConfig {
            max_retries: 2,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            timeout_ms: 10_000,
            max_concurrency: 16,
        },
    ),
    (
        "127.0.0.1",
        PolicyConfig {
            max_retries: 2,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            timeout_ms: 10_000,
            max_concurrency: 16,
        },
    ),
];

/// A normalized hostname used as the key for policies and scheduler state.
///
/// Scheme, port and path are ignored; the host is lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainKey(String);

impl DomainKey {
    /// Get the hostname as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&Url> for DomainKey {
    type Error = GovernorError;

    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        let host = url.host_str().ok_or_else(|| GovernorError::InvalidUrl {
            url: url.to_string(),
        })?;
        Ok(Self::from(host))
    }
}

impl From<&str> for DomainKey {
    fn from(host: &str) -> Self {
        DomainKey(host.to_lowercase())
    }
}

impl From<String> for DomainKey {
    fn from(host: String) -> Self {
        Self::from(host.as_str())
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable rate-limit policy for one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DomainPolicy {
    /// Retries permitted after the initial attempt
    pub max_retries: u32,
    /// Base delay for exponential backoff
    #[serde(rename = "base_delay_ms", serialize_with = "serialize_millis")]
    pub base_delay: Duration,
    /// Ceiling for any single backoff delay, including server-directed ones
    #[serde(rename = "max_delay_ms", serialize_with = "serialize_millis")]
    pub max_delay: Duration,
    /// Timeout applied to an attempt that does not carry its own
    #[serde(rename = "timeout_ms", serialize_with = "serialize_millis")]
    pub timeout: Duration,
    /// Maximum simultaneous in-flight requests
    pub max_concurrency: usize,
}

impl From<PolicyConfig> for DomainPolicy {
    fn from(config: PolicyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            timeout: Duration::from_millis(config.timeout_ms),
            // A zero-permit gate would block forever
            max_concurrency: config.max_concurrency.max(1),
        }
    }
}

impl Default for DomainPolicy {
    fn default() -> Self {
        PolicyConfig::default().into()
    }
}

fn seeded_policy(domain: &DomainKey) -> Option<PolicyConfig> {
    KNOWN_DOMAINS
        .iter()
        .find(|(host, _)| *host == domain.as_str())
        .map(|(_, policy)| *policy)
}

fn layered(overrides: &PolicyOverride, base: PolicyConfig) -> DomainPolicy {
    overrides.apply_to(base).into()
}

fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(millis(*duration))
}

/// Where a resolved policy came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicySource {
    /// The domain has its own entry
    Configured,
    /// The domain is unknown and uses the default policy. Not a fault.
    Default,
}

/// Lookup table from domain to policy
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    default: DomainPolicy,
    domains: HashMap<DomainKey, DomainPolicy>,
}

impl PolicyRegistry {
    /// Create a registry that knows no domains
    pub fn new(default: DomainPolicy) -> Self {
        Self {
            default,
            domains: HashMap::new(),
        }
    }

    /// Create a registry seeded with the built-in provider table
    pub fn seeded(default: DomainPolicy) -> Self {
        KNOWN_DOMAINS
            .iter()
            .fold(Self::new(default), |registry, (domain, policy)| {
                registry.with_domain(*domain, (*policy).into())
            })
    }

    /// Build the registry from configuration: seeded table, then file overrides.
    ///
    /// Fields an override leaves out come from the seeded entry for that host,
    /// or from the default policy for hosts without one.
    pub fn from_config(config: &GovernorConfig) -> Self {
        config
            .domains
            .iter()
            .fold(Self::seeded(config.default.into()), |registry, (domain, overrides)| {
                let key = DomainKey::from(domain.as_str());
                let base = seeded_policy(&key).unwrap_or(config.default);
                registry.with_domain(key, layered(overrides, base))
            })
    }

    /// Add or replace the policy for one domain
    pub fn with_domain(mut self, domain: impl Into<DomainKey>, policy: DomainPolicy) -> Self {
        self.domains.insert(domain.into(), policy);
        self
    }

    /// Resolve the policy for a domain, falling back to the default policy
    pub fn resolve(&self, domain: &DomainKey) -> &DomainPolicy {
        self.resolve_with_source(domain).0
    }

    /// Resolve the policy and report whether the default was used
    pub fn resolve_with_source(&self, domain: &DomainKey) -> (&DomainPolicy, PolicySource) {
        match self.domains.get(domain) {
            Some(policy) => (policy, PolicySource::Configured),
            None => (&self.default, PolicySource::Default),
        }
    }

    /// The policy used for unknown domains
    pub fn default_policy(&self) -> &DomainPolicy {
        &self.default
    }

    /// Number of domains with their own entry
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_domain_key_ignores_scheme_port_and_path() {
        let a = DomainKey::try_from(&url("https://API.Jikan.moe/v4/anime/1")).unwrap();
        let b = DomainKey::try_from(&url("http://api.jikan.moe:8080/")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "api.jikan.moe");
    }

    #[test]
    fn test_domain_key_requires_host() {
        let result = DomainKey::try_from(&url("data:text/plain,hello"));
        assert!(matches!(result, Err(GovernorError::InvalidUrl { .. })));
    }

    #[test]
    fn test_resolve_known_domain() {
        let registry = PolicyRegistry::seeded(DomainPolicy::default());
        let (policy, source) = registry.resolve_with_source(&DomainKey::from("api.anidb.net"));
        assert_eq!(source, PolicySource::Configured);
        assert_eq!(policy.max_concurrency, 1);
        assert_eq!(policy.base_delay, Duration::from_secs(4));
    }

    #[test]
    fn test_unknown_domain_uses_default() {
        let default = DomainPolicy {
            max_retries: 1,
            ..DomainPolicy::default()
        };
        let registry = PolicyRegistry::seeded(default);
        let (policy, source) = registry.resolve_with_source(&DomainKey::from("notify.moe"));
        assert_eq!(source, PolicySource::Default);
        assert_eq!(*policy, default);
    }

    #[test]
    fn test_lookup_is_exact_match() {
        let registry = PolicyRegistry::seeded(DomainPolicy::default());
        // Subdomains do not inherit the parent's policy
        let (_, source) = registry.resolve_with_source(&DomainKey::from("cdn.kitsu.io"));
        assert_eq!(source, PolicySource::Default);
    }

    #[test]
    fn test_strict_providers_are_tighter_than_local() {
        let registry = PolicyRegistry::seeded(DomainPolicy::default());
        let jikan = registry.resolve(&DomainKey::from("api.jikan.moe"));
        let local = registry.resolve(&DomainKey::from("localhost"));
        assert!(jikan.max_concurrency < local.max_concurrency);
        assert!(jikan.base_delay > local.base_delay);
        assert!(jikan.max_delay > local.max_delay);
    }

    #[test]
    fn test_config_overrides_seeded_entry() {
        let mut config = GovernorConfig::default();
        config.default.max_retries = 9;
        config.domains.insert(
            "API.JIKAN.MOE".to_string(),
            PolicyOverride {
                max_concurrency: Some(1),
                ..PolicyOverride::default()
            },
        );

        let registry = PolicyRegistry::from_config(&config);
        let jikan = registry.resolve(&DomainKey::from("api.jikan.moe"));
        assert_eq!(jikan.max_concurrency, 1);
        // Unset fields keep the seeded values
        assert_eq!(jikan.max_retries, 5);
        assert_eq!(jikan.base_delay, Duration::from_secs(2));
        assert_eq!(registry.default_policy().max_retries, 9);
        assert_eq!(registry.len(), KNOWN_DOMAINS.len());
    }

    #[test]
    fn test_partial_override_for_unseeded_host_inherits_default() {
        let mut config = GovernorConfig::default();
        config.default.max_retries = 7;
        config.domains.insert(
            "notify.moe".to_string(),
            PolicyOverride {
                timeout_ms: Some(5000),
                ..PolicyOverride::default()
            },
        );

        let registry = PolicyRegistry::from_config(&config);
        let (policy, source) = registry.resolve_with_source(&DomainKey::from("notify.moe"));
        assert_eq!(source, PolicySource::Configured);
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.max_concurrency, 5);
    }

    #[test]
    fn test_policy_serializes_as_millis() {
        let json = serde_json::to_value(DomainPolicy::default()).unwrap();
        assert_eq!(json["base_delay_ms"], 1000);
        assert_eq!(json["max_delay_ms"], 30_000);
        assert_eq!(json["max_concurrency"], 5);
    }
}
