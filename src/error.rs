// src/error.rs
//
// Unified error handling for pixbox
// Uses thiserror for simple, type-safe error handling
//
// Every stage of the request pipeline returns `Result<T, PixboxError>`.
// The response assembler is the only place that turns an error into bytes
// on the wire, so the mapping to HTTP status and machine code lives here.

use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

/// Stable error kind. This is what clients see in `error_code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidOption,
    MissingDimension,
    InvalidGeometry,
    HostNotAllowed,
    Signature,
    ImageFormat,
    FetchTimeout,
    Fetch,
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::InvalidOption | ErrorKind::MissingDimension | ErrorKind::InvalidGeometry => {
                400
            }
            ErrorKind::HostNotAllowed | ErrorKind::Signature => 403,
            ErrorKind::ImageFormat => 415,
            ErrorKind::Fetch => 502,
            ErrorKind::FetchTimeout => 504,
            ErrorKind::Internal => 500,
        }
    }

    /// Machine-readable code emitted as `error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidOption => "PIXBOX_INVALID_OPTION",
            ErrorKind::MissingDimension => "PIXBOX_MISSING_DIMENSION",
            ErrorKind::InvalidGeometry => "PIXBOX_INVALID_GEOMETRY",
            ErrorKind::HostNotAllowed => "PIXBOX_HOST_NOT_ALLOWED",
            ErrorKind::Signature => "PIXBOX_SIGNATURE_ERROR",
            ErrorKind::ImageFormat => "PIXBOX_IMAGE_FORMAT",
            ErrorKind::FetchTimeout => "PIXBOX_FETCH_TIMEOUT",
            ErrorKind::Fetch => "PIXBOX_FETCH_ERROR",
            ErrorKind::Internal => "PIXBOX_INTERNAL",
        }
    }
}

/// Coarse grouping used for logging and alerting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller sent something we cannot serve; fix the request
    UserError,
    /// Signature or host policy rejected the request
    AccessDenied,
    /// Source image is not something we can decode
    CodecError,
    /// The origin server misbehaved or was too slow
    UpstreamError,
    /// Bugs and encoder failures (should not happen)
    InternalBug,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UserError => "UserError",
            ErrorCategory::AccessDenied => "AccessDenied",
            ErrorCategory::CodecError => "CodecError",
            ErrorCategory::UpstreamError => "UpstreamError",
            ErrorCategory::InternalBug => "InternalBug",
        }
    }
}

/// pixbox error types
///
/// Constructed at the failing stage and carried unchanged to the response
/// assembler. Never retried automatically.
#[derive(Debug, Error)]
pub enum PixboxError {
    // Request validation
    #[error("Invalid value for {field}: '{value}'. {reason}")]
    InvalidOption {
        field: Cow<'static, str>,
        value: Cow<'static, str>,
        reason: Cow<'static, str>,
    },

    #[error("Mode '{mode}' requires at least one of width or height")]
    MissingDimension { mode: Cow<'static, str> },

    #[error("Invalid geometry: {reason}")]
    InvalidGeometry { reason: Cow<'static, str> },

    // Security gate
    #[error("Host not allowed: {host}")]
    HostNotAllowed { host: Cow<'static, str> },

    #[error("Signature check failed: {reason}")]
    Signature { reason: Cow<'static, str> },

    // Codec
    #[error("Unsupported image format: {format}")]
    ImageFormat { format: Cow<'static, str> },

    #[error("Failed to decode image: {message}")]
    Decode { message: Cow<'static, str> },

    #[error("Failed to encode as {format}: {message}")]
    Encode {
        format: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Upstream
    #[error("Timed out after {timeout:?} fetching {url}")]
    FetchTimeout {
        url: Cow<'static, str>,
        timeout: Duration,
    },

    #[error("Failed to fetch {url}{}: {message}", upstream_suffix(.status))]
    Fetch {
        url: Cow<'static, str>,
        status: Option<u16>,
        message: Cow<'static, str>,
    },

    // Internal Errors
    #[error("Internal error: {message}")]
    Internal { message: Cow<'static, str> },
}

fn upstream_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" (upstream status {s})"))
        .unwrap_or_default()
}

// Constructor Helpers
impl PixboxError {
    pub fn invalid_option(
        field: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidOption {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_dimension(mode: impl Into<Cow<'static, str>>) -> Self {
        Self::MissingDimension { mode: mode.into() }
    }

    pub fn invalid_geometry(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidGeometry {
            reason: reason.into(),
        }
    }

    pub fn host_not_allowed(host: impl Into<Cow<'static, str>>) -> Self {
        Self::HostNotAllowed { host: host.into() }
    }

    pub fn signature(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Signature {
            reason: reason.into(),
        }
    }

    pub fn image_format(format: impl Into<Cow<'static, str>>) -> Self {
        Self::ImageFormat {
            format: format.into(),
        }
    }

    pub fn decode_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn encode_failed(
        format: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::Encode {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn fetch_timeout(url: impl Into<Cow<'static, str>>, timeout: Duration) -> Self {
        Self::FetchTimeout {
            url: url.into(),
            timeout,
        }
    }

    pub fn fetch_failed(
        url: impl Into<Cow<'static, str>>,
        status: Option<u16>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::Fetch {
            url: url.into(),
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable kind used for status and code mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidOption { .. } => ErrorKind::InvalidOption,
            Self::MissingDimension { .. } => ErrorKind::MissingDimension,
            Self::InvalidGeometry { .. } => ErrorKind::InvalidGeometry,
            Self::HostNotAllowed { .. } => ErrorKind::HostNotAllowed,
            Self::Signature { .. } => ErrorKind::Signature,
            // A recognised container that fails to decode is still a format problem
            Self::ImageFormat { .. } | Self::Decode { .. } => ErrorKind::ImageFormat,
            Self::FetchTimeout { .. } => ErrorKind::FetchTimeout,
            Self::Fetch { .. } => ErrorKind::Fetch,
            Self::Encode { .. } | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Only timeouts are worth retrying, and only by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::FetchTimeout)
    }

    /// Upstream HTTP status, if the failure came from a non-2xx response.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Fetch { status, .. } => *status,
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.kind() {
            ErrorKind::InvalidOption | ErrorKind::MissingDimension | ErrorKind::InvalidGeometry => {
                ErrorCategory::UserError
            }
            ErrorKind::HostNotAllowed | ErrorKind::Signature => ErrorCategory::AccessDenied,
            ErrorKind::ImageFormat => ErrorCategory::CodecError,
            ErrorKind::FetchTimeout | ErrorKind::Fetch => ErrorCategory::UpstreamError,
            ErrorKind::Internal => ErrorCategory::InternalBug,
        }
    }

    /// Message safe to show the client. Internal failures never leak detail.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

// Result type alias
pub type Result<T> = std::result::Result<T, PixboxError>;
