// src/server/routes.rs
//
// Handlers. Each one only decides which `SourceResolution` variant applies
// and which parameters the route forces; the service does the rest.

use super::response::image_response;
use super::AppState;
use crate::fetch::SourceResolution;
use crate::options::{RawParams, PARAM_HEIGHT, PARAM_MODE, PARAM_WIDTH};
use crate::service::ImageRequest;
use axum::extract::{Path, RawQuery, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// Query parameter naming the source on the query route.
pub const PARAM_URL: &str = "url";

/// Edge of the small fixed box (`/a`, `/c`).
pub const SMALL_BOX: u32 = 100;
/// Edge of the large fixed box (`/b`, `/d`).
pub const LARGE_BOX: u32 = 500;

/// The fixed box wins over `w`/`h`; mode falls back to clip.
fn fixed_box_params(query: &str, edge: u32) -> RawParams {
    let mut params = RawParams::from_query(query);
    params
        .insert(PARAM_WIDTH, edge.to_string())
        .insert(PARAM_HEIGHT, edge.to_string())
        .insert_default(PARAM_MODE, "clip");
    params
}

async fn serve(state: AppState, request: ImageRequest) -> Response {
    match state.service.process(request).await {
        Ok(image) => image_response(image),
        Err(err) => err.into_response(),
    }
}

async fn bucket(state: AppState, bucket: String, file: String, query: String, edge: u32) -> Response {
    let request = ImageRequest {
        source: SourceResolution::FixedBucketRoute { bucket, file },
        params: fixed_box_params(&query, edge),
        query,
    };
    serve(state, request).await
}

async fn external(state: AppState, encoded: String, query: String, edge: u32) -> Response {
    let request = ImageRequest {
        source: SourceResolution::FixedExternalRoute { encoded },
        params: fixed_box_params(&query, edge),
        query,
    };
    serve(state, request).await
}

pub async fn bucket_small(
    State(state): State<AppState>,
    Path((name, file)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Response {
    bucket(state, name, file, query.unwrap_or_default(), SMALL_BOX).await
}

pub async fn bucket_large(
    State(state): State<AppState>,
    Path((name, file)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Response {
    bucket(state, name, file, query.unwrap_or_default(), LARGE_BOX).await
}

pub async fn external_small(
    State(state): State<AppState>,
    Path(encoded): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    external(state, encoded, query.unwrap_or_default(), SMALL_BOX).await
}

pub async fn external_large(
    State(state): State<AppState>,
    Path(encoded): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    external(state, encoded, query.unwrap_or_default(), LARGE_BOX).await
}

pub async fn query_route(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let query = query.unwrap_or_default();
    let params = RawParams::from_query(&query);
    let request = ImageRequest {
        source: SourceResolution::QueryParamRoute {
            url: params.get(PARAM_URL).map(str::to_owned),
        },
        params,
        query,
    };
    serve(state, request).await
}

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_box_overrides_dimensions() {
        let params = fixed_box_params("w=5&h=7&mode=crop", SMALL_BOX);
        assert_eq!(params.get(PARAM_WIDTH), Some("100"));
        assert_eq!(params.get(PARAM_HEIGHT), Some("100"));
        assert_eq!(params.get(PARAM_MODE), Some("crop"));
    }

    #[test]
    fn test_fixed_box_defaults_to_clip() {
        let params = fixed_box_params("", LARGE_BOX);
        assert_eq!(params.get(PARAM_WIDTH), Some("500"));
        assert_eq!(params.get(PARAM_MODE), Some("clip"));
    }
}
