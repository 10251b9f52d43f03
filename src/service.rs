// src/service.rs
//
// The per-request pipeline:
// source resolution -> security gate -> option resolution -> fetch -> transform.
//
// Everything that can be rejected without network access is rejected before
// a fetch slot is taken.

use crate::config::ProxyConfig;
use crate::engine::{execute, run_blocking, TransformOutput};
use crate::error::{ErrorKind, Result};
use crate::fetch::{FetchOrchestrator, HttpFetcher, SourceDescriptor, SourceFetcher, SourceResolution};
use crate::options::{resolve, RawParams};
use crate::ops::TransformSpec;
use crate::security::{AllowList, HmacVerifier, HostPolicy, SecurityGate};
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};
use url::Url;

/// One inbound request, already split by the router.
#[derive(Clone, Debug)]
pub struct ImageRequest {
    pub source: SourceResolution,
    /// Transform parameters, route-forced values included
    pub params: RawParams,
    /// Raw query string, used for signature checks
    pub query: String,
}

/// A transformed image plus the origin headers to forward.
#[derive(Clone, Debug)]
pub struct ProcessedImage {
    pub output: TransformOutput,
    pub origin_headers: HeaderMap,
}

/// What a request had resolved to when it finished, for the outcome log.
#[derive(Default)]
struct RequestTrace {
    url: Option<Url>,
    spec: Option<TransformSpec>,
}

#[derive(Clone, Debug)]
pub struct ImageService {
    defaults: TransformSpec,
    gate: SecurityGate,
    fetcher: FetchOrchestrator,
    bucket_root: Option<Url>,
    implicit_base_url: Option<Url>,
}

impl ImageService {
    /// Service backed by the real HTTP fetcher. The fetcher follows
    /// redirects only onto hosts the allow-list admits.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let hosts: Arc<dyn HostPolicy> = Arc::new(AllowList::new(&config.allowed_hosts));
        let fetcher = HttpFetcher::new(config.timeout, config.validate_cert, hosts.clone())?;
        Ok(Self::build(config, hosts, Arc::new(fetcher)))
    }

    pub fn with_fetcher(config: &ProxyConfig, fetcher: Arc<dyn SourceFetcher>) -> Self {
        let hosts = Arc::new(AllowList::new(&config.allowed_hosts));
        Self::build(config, hosts, fetcher)
    }

    fn build(
        config: &ProxyConfig,
        hosts: Arc<dyn HostPolicy>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        let gate = SecurityGate::new(
            hosts,
            Arc::new(HmacVerifier::new(
                config.client_name.clone(),
                config.client_key.clone(),
            )),
        );
        Self {
            defaults: config.defaults.clone(),
            gate,
            fetcher: FetchOrchestrator::new(fetcher, config.max_requests, config.timeout),
            bucket_root: config.bucket_root.clone(),
            implicit_base_url: config.implicit_base_url.clone(),
        }
    }

    pub fn orchestrator(&self) -> &FetchOrchestrator {
        &self.fetcher
    }

    pub fn resolve_source(&self, source: &SourceResolution) -> Result<SourceDescriptor> {
        source.resolve(self.bucket_root.as_ref(), self.implicit_base_url.as_ref())
    }

    pub async fn process(&self, request: ImageRequest) -> Result<ProcessedImage> {
        let started = Instant::now();
        let mut trace = RequestTrace::default();
        let result = self.run(&request, &mut trace).await;
        let url = trace.url.as_ref().map_or("-", Url::as_str);
        match &result {
            Ok(image) => info!(
                url,
                mode = ?trace.spec.as_ref().map(|s| s.mode),
                format = %image.output.format,
                width = image.output.width,
                height = image.output.height,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "served image"
            ),
            Err(err) if err.kind() == ErrorKind::Internal => error!(
                url,
                source = ?request.source,
                spec = ?trace.spec,
                error = %err,
                "internal failure"
            ),
            Err(err) => debug!(url, error = %err, "request rejected"),
        }
        result
    }

    async fn run(&self, request: &ImageRequest, trace: &mut RequestTrace) -> Result<ProcessedImage> {
        let source = self.resolve_source(&request.source)?;
        trace.url = Some(source.url.clone());
        self.gate.authorize(&source.url, &request.query)?;
        let spec = resolve(&request.params, &self.defaults)?;
        trace.spec = Some(spec.clone());
        self.fetch_and_transform(&source, spec).await
    }

    async fn fetch_and_transform(
        &self,
        source: &SourceDescriptor,
        spec: TransformSpec,
    ) -> Result<ProcessedImage> {
        let fetched = self.fetcher.fetch(source).await?;
        let origin_headers = fetched.headers;
        let bytes = fetched.bytes;
        let output = run_blocking(move || execute(bytes, &spec)).await?;
        Ok(ProcessedImage {
            output,
            origin_headers,
        })
    }
}
