// src/config.rs
//
// Process configuration, read once at startup and immutable afterwards.
//
// Sources, highest precedence first: command-line flags, PIXBOX_* environment
// variables (clap resolves these two), the TOML file named by --config, and
// built-in defaults.

use crate::ops::{Anchor, Background, Filter, Mode, OutputFormat, TransformSpec, DEFAULT_QUALITY};
use crate::telemetry::{LogFormat, LoggingConfig};
use clap::builder::BoolishValueParser;
use clap::Parser;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_MAX_REQUESTS: usize = 40;
pub const DEFAULT_TIMEOUT_SECS: f64 = 10.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl fmt::Display) -> Self {
        Self::Invalid {
            field,
            reason: reason.to_string(),
        }
    }
}

/// Command-line flags. Every flag can also come from a PIXBOX_* variable.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "pixbox", version, about = "On-demand image transformation proxy")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, env = "PIXBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long, env = "PIXBOX_PORT")]
    pub port: Option<u16>,

    /// Verbose logging
    #[arg(long, env = "PIXBOX_DEBUG", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub debug: Option<bool>,

    /// Maximum concurrent outbound fetches
    #[arg(long, env = "PIXBOX_MAX_REQUESTS")]
    pub max_requests: Option<usize>,

    /// Fetch timeout in seconds
    #[arg(long, env = "PIXBOX_TIMEOUT")]
    pub timeout: Option<f64>,

    /// Validate upstream TLS certificates
    #[arg(long, env = "PIXBOX_VALIDATE_CERT", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub validate_cert: Option<bool>,

    /// Scheme and host prepended to path-only `url` values
    #[arg(long, env = "PIXBOX_IMPLICIT_BASE_URL")]
    pub implicit_base_url: Option<String>,

    /// HTTP root of the bucket store used by the /a and /b routes
    #[arg(long, env = "PIXBOX_BUCKET_ROOT")]
    pub bucket_root: Option<String>,

    /// Client name required in the `client` parameter
    #[arg(long, env = "PIXBOX_CLIENT_NAME")]
    pub client_name: Option<String>,

    /// Key for HMAC-SHA256 request signatures
    #[arg(long, env = "PIXBOX_CLIENT_KEY", hide_env_values = true)]
    pub client_key: Option<String>,

    /// Comma-separated host allow-list (`*.example.com` for subdomains)
    #[arg(long, env = "PIXBOX_ALLOWED_HOSTS", value_delimiter = ',')]
    pub allowed_hosts: Option<Vec<String>>,

    /// Log output: pretty or json
    #[arg(long, env = "PIXBOX_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Default resampling filter
    #[arg(long, env = "PIXBOX_FILTER")]
    pub filter: Option<String>,

    /// Default output format (unset keeps the source format)
    #[arg(long, env = "PIXBOX_FORMAT")]
    pub format: Option<String>,

    /// Optimize encoded output by default
    #[arg(long, env = "PIXBOX_OPTIMIZE", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub optimize: Option<bool>,

    /// Default encoder quality (1-100)
    #[arg(long, env = "PIXBOX_QUALITY")]
    pub quality: Option<u32>,

    /// Default sizing mode
    #[arg(long, env = "PIXBOX_MODE")]
    pub mode: Option<String>,

    /// Default background color
    #[arg(long, env = "PIXBOX_BACKGROUND")]
    pub background: Option<String>,

    /// Default crop position
    #[arg(long, env = "PIXBOX_POSITION")]
    pub position: Option<String>,

    /// Grow the canvas on arbitrary-angle rotation by default
    #[arg(long, env = "PIXBOX_EXPAND", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub expand: Option<bool>,
}

/// Contents of the TOML file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub debug: Option<bool>,
    pub max_requests: Option<usize>,
    pub timeout: Option<f64>,
    pub validate_cert: Option<bool>,
    pub implicit_base_url: Option<String>,
    pub bucket_root: Option<String>,
    pub client_name: Option<String>,
    pub client_key: Option<String>,
    pub allowed_hosts: Option<Vec<String>>,
    pub log_format: Option<LogFormat>,
    pub filter: Option<String>,
    pub format: Option<String>,
    pub optimize: Option<bool>,
    pub quality: Option<u32>,
    pub mode: Option<String>,
    pub background: Option<String>,
    pub position: Option<String>,
    pub expand: Option<bool>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }
}

/// Validated process configuration.
#[derive(Clone, PartialEq)]
pub struct ProxyConfig {
    pub port: u16,
    pub debug: bool,
    pub max_requests: usize,
    pub timeout: Duration,
    pub validate_cert: bool,
    pub implicit_base_url: Option<Url>,
    pub bucket_root: Option<Url>,
    pub client_name: Option<String>,
    pub client_key: Option<String>,
    pub allowed_hosts: Vec<String>,
    pub log_format: LogFormat,
    /// Defaults every request's options are merged onto
    pub defaults: TransformSpec,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            debug: false,
            max_requests: DEFAULT_MAX_REQUESTS,
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            validate_cert: true,
            implicit_base_url: None,
            bucket_root: None,
            client_name: None,
            client_key: None,
            allowed_hosts: Vec::new(),
            log_format: LogFormat::default(),
            defaults: TransformSpec {
                mode: Mode::Crop,
                filter: Filter::Antialias,
                format: None,
                quality: DEFAULT_QUALITY,
                optimize: false,
                background: Background::WHITE,
                position: Some(Anchor::CENTER),
                expand: false,
                ..TransformSpec::default()
            },
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("port", &self.port)
            .field("debug", &self.debug)
            .field("max_requests", &self.max_requests)
            .field("timeout", &self.timeout)
            .field("validate_cert", &self.validate_cert)
            .field("implicit_base_url", &self.implicit_base_url.as_ref().map(Url::as_str))
            .field("bucket_root", &self.bucket_root.as_ref().map(Url::as_str))
            .field("client_name", &self.client_name)
            .field("client_key", &self.client_key.as_ref().map(|_| "<redacted>"))
            .field("allowed_hosts", &self.allowed_hosts)
            .field("log_format", &self.log_format)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl ProxyConfig {
    /// Read the optional file named by `cli.config` and merge everything.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::from_path(path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(cli, file)
    }

    /// Merge CLI/env over `file` over defaults, then validate.
    pub fn from_sources(cli: &Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let base = ProxyConfig::default();

        let max_requests = cli.max_requests.or(file.max_requests).unwrap_or(base.max_requests);
        if max_requests == 0 {
            return Err(ConfigError::invalid("max_requests", "must be at least 1"));
        }

        let timeout_secs = cli.timeout.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT_SECS);
        if !timeout_secs.is_finite() || timeout_secs <= 0.0 {
            return Err(ConfigError::invalid("timeout", "must be a positive number of seconds"));
        }
        let timeout = Duration::try_from_secs_f64(timeout_secs)
            .map_err(|e| ConfigError::invalid("timeout", e))?;

        let implicit_base_url = pick(&cli.implicit_base_url, &file.implicit_base_url)
            .map(|raw| parse_base_url("implicit_base_url", raw))
            .transpose()?;
        let bucket_root = pick(&cli.bucket_root, &file.bucket_root)
            .map(|raw| parse_base_url("bucket_root", raw))
            .transpose()?;

        let cli_log_format = cli.log_format.as_deref().map(str::trim).filter(|v| !v.is_empty());
        let log_format = match cli_log_format {
            Some(raw) => LogFormat::from_str(raw).map_err(|e| ConfigError::invalid("log_format", e))?,
            None => file.log_format.unwrap_or(base.log_format),
        };

        let defaults = build_defaults(cli, &file, base.defaults)?;

        Ok(Self {
            port: cli.port.or(file.port).unwrap_or(base.port),
            debug: cli.debug.or(file.debug).unwrap_or(base.debug),
            max_requests,
            timeout,
            validate_cert: cli.validate_cert.or(file.validate_cert).unwrap_or(base.validate_cert),
            implicit_base_url,
            bucket_root,
            client_name: pick(&cli.client_name, &file.client_name).map(str::to_string),
            client_key: pick(&cli.client_key, &file.client_key).map(str::to_string),
            allowed_hosts: cli
                .allowed_hosts
                .clone()
                .or_else(|| file.allowed_hosts.clone())
                .unwrap_or_default()
                .into_iter()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect(),
            log_format,
            defaults,
        })
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig::new(self.debug, self.log_format)
    }
}

/// First non-empty value, CLI before file.
fn pick<'a>(cli: &'a Option<String>, file: &'a Option<String>) -> Option<&'a str> {
    cli.as_deref()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| file.as_deref().filter(|v| !v.trim().is_empty()))
        .map(str::trim)
}

fn parse_base_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::invalid(field, e))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(ConfigError::invalid(field, "expected an absolute http(s) URL")),
    }
}

fn build_defaults(
    cli: &Cli,
    file: &FileConfig,
    mut defaults: TransformSpec,
) -> Result<TransformSpec, ConfigError> {
    if let Some(raw) = pick(&cli.filter, &file.filter) {
        defaults.filter = Filter::from_str(raw).map_err(|e| ConfigError::invalid("filter", e))?;
    }
    if let Some(raw) = pick(&cli.format, &file.format) {
        defaults.format = Some(OutputFormat::from_str(raw).map_err(|e| ConfigError::invalid("format", e))?);
    }
    if let Some(raw) = pick(&cli.mode, &file.mode) {
        defaults.mode = Mode::from_str(raw).map_err(|e| ConfigError::invalid("mode", e))?;
    }
    if let Some(raw) = pick(&cli.background, &file.background) {
        defaults.background =
            Background::from_str(raw).map_err(|e| ConfigError::invalid("background", e))?;
    }
    if let Some(raw) = pick(&cli.position, &file.position) {
        defaults.position =
            Some(Anchor::from_str(raw).map_err(|e| ConfigError::invalid("position", e))?);
    }
    if let Some(quality) = cli.quality.or(file.quality) {
        defaults.quality = u8::try_from(quality)
            .ok()
            .filter(|q| (1..=100).contains(q))
            .ok_or_else(|| ConfigError::invalid("quality", "must be between 1 and 100"))?;
    }
    defaults.optimize = cli.optimize.or(file.optimize).unwrap_or(defaults.optimize);
    defaults.expand = cli.expand.or(file.expand).unwrap_or(defaults.expand);
    Ok(defaults)
}
