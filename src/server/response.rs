// src/server/response.rs
//
// Response assembly: every success and failure leaves through here.
//
// Success bodies are streamed in fixed 64KiB slices of the encoded buffer.
// Error bodies are JSON and never cacheable.

use crate::error::PixboxError;
use crate::service::ProcessedImage;
use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream;
use serde::Serialize;
use std::convert::Infallible;

/// Size of each streamed body chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Cache policy of every successful response. Replaces any origin value.
pub const DEFAULT_CACHE_CONTROL: &str = "public, max-age=31536000";

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status_code: u16,
    pub error_code: &'static str,
    pub error: String,
}

impl From<&PixboxError> for ErrorBody {
    fn from(err: &PixboxError) -> Self {
        Self {
            status_code: err.status_code(),
            error_code: err.code(),
            error: err.public_message(),
        }
    }
}

/// Split `bytes` into `CHUNK_SIZE` slices without copying.
pub fn chunk(bytes: Bytes) -> Vec<Bytes> {
    let len = bytes.len();
    (0..len)
        .step_by(CHUNK_SIZE)
        .map(|start| bytes.slice(start..(start + CHUNK_SIZE).min(len)))
        .collect()
}

pub fn image_response(image: ProcessedImage) -> Response {
    let ProcessedImage {
        output,
        origin_headers,
    } = image;
    let len = output.bytes.len();
    let chunks = chunk(output.bytes);
    let body = Body::from_stream(stream::iter(chunks.into_iter().map(Ok::<_, Infallible>)));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.extend(origin_headers);
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(output.format.mime_type()),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(DEFAULT_CACHE_CONTROL));
    response
}

pub fn error_response(err: &PixboxError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_vec(&ErrorBody::from(err)).unwrap_or_default();

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

impl IntoResponse for PixboxError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}
