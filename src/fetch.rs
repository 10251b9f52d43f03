// src/fetch.rs
//
// Source resolution and the bounded outbound fetch.
//
// Admission: a process-wide semaphore with `max_requests` permits. Requests
// beyond the bound wait for a permit instead of failing. The deadline starts
// once a permit is held, and the permit is released on every exit path
// including cancellation of the request future.

use crate::error::{PixboxError, Result};
use crate::security::HostPolicy;
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, CACHE_CONTROL, CONTENT_TYPE, EXPIRES, LAST_MODIFIED};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

/// Origin headers copied onto successful responses.
pub const FORWARDED_HEADERS: [HeaderName; 3] = [CACHE_CONTROL, EXPIRES, LAST_MODIFIED];

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// Path segment between bucket and file for bucket-relative sources.
const BUCKET_PREFIX: &str = "product-pictures";

/// Where a request says its source lives, before resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceResolution {
    /// `/a|b/{bucket}/{file}`: base64 file key under a configured bucket root
    FixedBucketRoute { bucket: String, file: String },
    /// `/c|d/{url}`: base64 absolute URL
    FixedExternalRoute { encoded: String },
    /// `/?url=...`: absolute URL, or a path joined to the implicit base URL
    QueryParamRoute { url: Option<String> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    External,
    BucketRelative,
    ImplicitBase,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::External => "external",
            Provenance::BucketRelative => "bucket-relative",
            Provenance::ImplicitBase => "implicit-base",
        }
    }
}

/// Resolved absolute source URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub url: Url,
    pub provenance: Provenance,
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.url.fmt(f)
    }
}

impl SourceResolution {
    pub fn resolve(
        &self,
        bucket_root: Option<&Url>,
        implicit_base: Option<&Url>,
    ) -> Result<SourceDescriptor> {
        let (url, provenance) = match self {
            SourceResolution::FixedExternalRoute { encoded } => {
                let decoded = decode_segment("url", encoded)?;
                (parse_http_url(&decoded)?, Provenance::External)
            }
            SourceResolution::FixedBucketRoute { bucket, file } => {
                if bucket.is_empty()
                    || !bucket
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
                {
                    return Err(PixboxError::invalid_option(
                        "bucket",
                        bucket.clone(),
                        "Expected letters, digits, '_' or '-'",
                    ));
                }
                let root = bucket_root
                    .ok_or_else(|| PixboxError::internal("bucket_root is not configured"))?;
                let file = decode_segment("file", file)?;
                let joined = format!(
                    "{}/{bucket}/{BUCKET_PREFIX}/{file}",
                    root.as_str().trim_end_matches('/')
                );
                (parse_http_url(&joined)?, Provenance::BucketRelative)
            }
            SourceResolution::QueryParamRoute { url } => {
                let raw = url
                    .as_deref()
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        PixboxError::invalid_option("url", "", "Missing required url parameter")
                    })?;
                match Url::parse(raw) {
                    Ok(_) => (parse_http_url(raw)?, Provenance::External),
                    Err(url::ParseError::RelativeUrlWithoutBase) => {
                        let base = implicit_base.ok_or_else(|| {
                            PixboxError::invalid_option(
                                "url",
                                raw.to_string(),
                                "Relative url given but no implicit_base_url is configured",
                            )
                        })?;
                        let joined = base.join(&raw.replace(' ', "%20")).map_err(|e| {
                            PixboxError::invalid_option("url", raw.to_string(), e.to_string())
                        })?;
                        (joined, Provenance::ImplicitBase)
                    }
                    Err(e) => {
                        return Err(PixboxError::invalid_option(
                            "url",
                            raw.to_string(),
                            e.to_string(),
                        ))
                    }
                }
            }
        };
        Ok(SourceDescriptor { url, provenance })
    }
}

/// Base64 path segment, standard alphabet first, then URL-safe.
fn decode_segment(field: &'static str, segment: &str) -> Result<String> {
    let invalid = |reason: &str| {
        PixboxError::invalid_option(field, segment.to_string(), reason.to_string())
    };
    let bytes = STANDARD
        .decode(segment)
        .or_else(|_| URL_SAFE.decode(segment))
        .map_err(|_| invalid("Expected base64"))?;
    let decoded = String::from_utf8(bytes).map_err(|_| invalid("Decoded value is not UTF-8"))?;
    Ok(decoded.replace(' ', "%20"))
}

fn parse_http_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| PixboxError::invalid_option("url", raw.to_string(), e.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(PixboxError::invalid_option(
            "url",
            raw.to_string(),
            "Only absolute http and https URLs can be fetched",
        )),
    }
}

/// Raw origin response.
#[derive(Clone, Debug, Default)]
pub struct FetchResult {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    /// Subset of origin headers eligible for forwarding
    pub headers: HeaderMap,
}

impl FetchResult {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            ..Self::default()
        }
    }

    /// Keep content-type and the forwardable subset of `origin`.
    pub fn from_origin(bytes: Bytes, origin: &HeaderMap) -> Self {
        let content_type = origin
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut headers = HeaderMap::new();
        for name in FORWARDED_HEADERS {
            if let Some(value) = origin.get(&name) {
                headers.insert(name, value.clone());
            }
        }
        Self {
            bytes,
            content_type,
            headers,
        }
    }
}

/// Retrieves source bytes. One call per request, never retried.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchResult>;
}

/// reqwest-backed fetcher.
///
/// Redirects are followed only while every hop lands on a host the policy
/// allows. A hop to any other host stops the chain and the 3xx is returned
/// as an upstream failure.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    validate_cert: bool,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, validate_cert: bool, hosts: Arc<dyn HostPolicy>) -> Result<Self> {
        let redirects = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            let allowed = attempt
                .url()
                .host_str()
                .is_some_and(|host| hosts.is_host_allowed(host));
            if allowed {
                attempt.follow()
            } else {
                warn!(target_url = %attempt.url(), "redirect to disallowed host not followed");
                attempt.stop()
            }
        });
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!validate_cert)
            .redirect(redirects)
            .user_agent(concat!("pixbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PixboxError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout,
            validate_cert,
        })
    }

    /// Whether upstream TLS certificates are verified.
    pub fn validates_certs(&self) -> bool {
        self.validate_cert
    }

    fn classify(&self, url: &Url, err: reqwest::Error) -> PixboxError {
        if err.is_timeout() {
            PixboxError::fetch_timeout(url.to_string(), self.timeout)
        } else {
            PixboxError::fetch_failed(
                url.to_string(),
                err.status().map(|s| s.as_u16()),
                err.to_string(),
            )
        }
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchResult> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PixboxError::fetch_failed(
                url.to_string(),
                Some(status.as_u16()),
                format!("upstream returned {status}"),
            ));
        }

        let headers = response.headers().clone();
        let bytes = response.bytes().await.map_err(|e| self.classify(url, e))?;
        Ok(FetchResult::from_origin(bytes, &headers))
    }
}

/// Admission control plus deadline around a `SourceFetcher`.
#[derive(Clone)]
pub struct FetchOrchestrator {
    fetcher: Arc<dyn SourceFetcher>,
    slots: Arc<Semaphore>,
    max_requests: usize,
    timeout: Duration,
}

impl FetchOrchestrator {
    pub fn new(fetcher: Arc<dyn SourceFetcher>, max_requests: usize, timeout: Duration) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            fetcher,
            slots: Arc::new(Semaphore::new(max_requests)),
            max_requests,
            timeout,
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Slots not currently held by an in-flight fetch.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub async fn fetch(&self, source: &SourceDescriptor) -> Result<FetchResult> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| PixboxError::internal("fetch slot pool is closed"))?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.fetcher.fetch(&source.url)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(result)) => {
                debug!(url = %source.url, provenance = source.provenance.as_str(), bytes = result.bytes.len(), elapsed_ms, "fetched source");
                Ok(result)
            }
            Ok(Err(err)) => {
                warn!(url = %source.url, error = %err, elapsed_ms, "fetch failed");
                Err(err)
            }
            Err(_) => {
                warn!(url = %source.url, timeout_ms = self.timeout.as_millis() as u64, "fetch timed out");
                Err(PixboxError::fetch_timeout(source.url.to_string(), self.timeout))
            }
        }
    }
}

impl fmt::Debug for FetchOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOrchestrator")
            .field("max_requests", &self.max_requests)
            .field("available", &self.available_slots())
            .field("timeout", &self.timeout)
            .finish()
    }
}
