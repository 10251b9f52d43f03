// src/security.rs
//
// Security gate: host allow-list and request signatures.
//
// Both checks run before any fetch, so rejected requests never take a
// fetch slot. Each check is off unless configured.

use crate::error::{PixboxError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Query parameter carrying the hex signature.
pub const PARAM_SIGNATURE: &str = "sig";
/// Query parameter naming the calling client.
pub const PARAM_CLIENT: &str = "client";

/// Decides whether a source host may be fetched.
pub trait HostPolicy: Send + Sync {
    fn is_host_allowed(&self, host: &str) -> bool;
}

/// Validates the signature carried in a raw query string.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, query: &str) -> Result<()>;
}

/// Host allow-list. An empty list allows every host.
///
/// `example.com` matches only that host; `*.example.com` and `.example.com`
/// match `example.com` and every subdomain of it.
#[derive(Clone, Debug, Default)]
pub struct AllowList {
    patterns: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl HostPolicy for AllowList {
    fn is_host_allowed(&self, host: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.patterns.iter().any(|pattern| {
            match pattern
                .strip_prefix("*.")
                .or_else(|| pattern.strip_prefix('.'))
            {
                Some(domain) => {
                    host == domain
                        || host
                            .strip_suffix(domain)
                            .is_some_and(|prefix| prefix.ends_with('.'))
                }
                None => host == *pattern,
            }
        })
    }
}

/// HMAC-SHA256 query signing.
///
/// With `client_name` set, requests must carry `client=<name>`. With
/// `client_key` set, `sig` must be the hex HMAC of the query string minus
/// its `sig` pair.
#[derive(Clone, Default)]
pub struct HmacVerifier {
    client_name: Option<String>,
    client_key: Option<String>,
}

impl HmacVerifier {
    pub fn new(client_name: Option<String>, client_key: Option<String>) -> Self {
        Self {
            client_name,
            client_key,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client_name.is_some() || self.client_key.is_some()
    }
}

impl std::fmt::Debug for HmacVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacVerifier")
            .field("client_name", &self.client_name)
            .field("client_key", &self.client_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SignatureVerifier for HmacVerifier {
    fn verify(&self, query: &str) -> Result<()> {
        if let Some(expected) = &self.client_name {
            let client = url::form_urlencoded::parse(query.as_bytes())
                .find(|(k, _)| k == PARAM_CLIENT)
                .map(|(_, v)| v.into_owned());
            match client {
                Some(client) if client == *expected => {}
                Some(client) => {
                    return Err(PixboxError::signature(format!("unknown client '{client}'")))
                }
                None => return Err(PixboxError::signature("missing client parameter")),
            }
        }

        let Some(key) = &self.client_key else {
            return Ok(());
        };
        let provided = url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == PARAM_SIGNATURE)
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| PixboxError::signature("missing sig parameter"))?;
        let provided = hex::decode(provided.trim())
            .map_err(|_| PixboxError::signature("sig is not valid hex"))?;

        let mut mac = new_mac(key)?;
        mac.update(strip_signature(query).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| PixboxError::signature("signature mismatch"))
    }
}

fn new_mac(key: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| PixboxError::internal(format!("invalid HMAC key: {e}")))
}

/// The raw query string with every `sig` pair removed, other pairs in order.
pub fn strip_signature(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split('=').next() != Some(PARAM_SIGNATURE))
        .collect::<Vec<_>>()
        .join("&")
}

/// Append a `sig` parameter signing `query` with `key`.
pub fn sign_query(query: &str, key: &str) -> Result<String> {
    let unsigned = strip_signature(query);
    let mut mac = new_mac(key)?;
    mac.update(unsigned.as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());
    if unsigned.is_empty() {
        Ok(format!("{PARAM_SIGNATURE}={sig}"))
    } else {
        Ok(format!("{unsigned}&{PARAM_SIGNATURE}={sig}"))
    }
}

/// Runs the configured checks for one request.
#[derive(Clone)]
pub struct SecurityGate {
    hosts: Arc<dyn HostPolicy>,
    signatures: Arc<dyn SignatureVerifier>,
}

impl SecurityGate {
    pub fn new(hosts: Arc<dyn HostPolicy>, signatures: Arc<dyn SignatureVerifier>) -> Self {
        Self { hosts, signatures }
    }

    /// Gate that allows everything.
    pub fn open() -> Self {
        Self::new(
            Arc::new(AllowList::default()),
            Arc::new(HmacVerifier::default()),
        )
    }

    /// Check the source host, then the query signature.
    pub fn authorize(&self, source: &Url, query: &str) -> Result<()> {
        let host = source.host_str().unwrap_or_default();
        if !self.hosts.is_host_allowed(host) {
            return Err(PixboxError::host_not_allowed(host.to_string()));
        }
        self.signatures.verify(query)
    }
}

impl std::fmt::Debug for SecurityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGate").finish_non_exhaustive()
    }
}
