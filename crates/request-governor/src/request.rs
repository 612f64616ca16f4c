//! Caller-supplied description of one HTTP call.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Url};
use std::time::Duration;

use crate::error::GovernorError;
use crate::policy::{DomainKey, DomainPolicy};

/// One outbound HTTP request, as described by the caller.
///
/// The governor only reads it; every attempt builds a fresh request from it.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    /// Per-attempt timeout; the domain policy's timeout applies when unset
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The domain this request is rate limited under
    pub fn domain(&self) -> Result<DomainKey, GovernorError> {
        DomainKey::try_from(&self.url)
    }

    /// Copy of this spec with the policy timeout filled in if none was given
    pub fn with_resolved_timeout(&self, policy: &DomainPolicy) -> Self {
        Self {
            timeout: Some(self.timeout.unwrap_or(policy.timeout)),
            ..self.clone()
        }
    }

    /// Build a request for one attempt
    pub(crate) fn build(&self, client: &Client) -> RequestBuilder {
        let mut builder = client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }

        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::CONTENT_TYPE;

    fn url() -> Url {
        Url::parse("https://graphql.anilist.co/").unwrap()
    }

    #[test]
    fn test_resolved_timeout_prefers_explicit() {
        let policy = DomainPolicy::default();

        let spec = RequestSpec::get(url()).timeout(Duration::from_secs(2));
        assert_eq!(
            spec.with_resolved_timeout(&policy).timeout,
            Some(Duration::from_secs(2))
        );

        let spec = RequestSpec::get(url());
        assert_eq!(spec.with_resolved_timeout(&policy).timeout, Some(policy.timeout));
        // The caller's spec is left untouched
        assert_eq!(spec.timeout, None);
    }

    #[test]
    fn test_build_carries_method_headers_and_body() {
        let spec = RequestSpec::post(url())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(r#"{"query":"{ Media(id: 1) { id } }"}"#)
            .timeout(Duration::from_secs(5));

        let request = spec.build(&Client::new()).build().unwrap();
        assert_eq!(request.method(), &Method::POST);
        assert_eq!(request.url().as_str(), "https://graphql.anilist.co/");
        assert_eq!(request.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(request.timeout(), Some(&Duration::from_secs(5)));
        assert!(request.body().is_some());
    }

    #[test]
    fn test_domain() {
        let spec = RequestSpec::get(Url::parse("https://Kitsu.io:443/api/edge/anime/1").unwrap());
        assert_eq!(spec.domain().unwrap().as_str(), "kitsu.io");
    }
}
