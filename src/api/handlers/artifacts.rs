use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use http_body_util::Limited;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::response::ApiError;
use crate::object_store::{ByteStream, Item, ObjectStoreError};
use crate::tenant;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreArtifactResponse {
    pub urls: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /v8/artifacts/:artifact_id?teamID=
pub async fn fetch_artifact(
    State(state): State<Arc<AppState>>,
    artifact_id: Option<Path<String>>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let artifact_id = require_artifact_id(artifact_id)?;
    let team_id = require_team_id(query.as_deref())?;
    let container_name = tenant::container_name(&team_id);
    tracing::debug!(%artifact_id, %team_id, %container_name, "Fetching artifact");

    let item = lookup_artifact(&state, &container_name, &artifact_id)
        .await
        .map_err(|e| artifact_not_found(&artifact_id, e))?;
    let reader = item
        .open()
        .await
        .map_err(|e| artifact_not_found(&artifact_id, e))?;

    Ok(artifact_response(reader.size, reader.stream))
}

/// POST|PUT /v8/artifacts/:artifact_id?teamID=
pub async fn store_artifact(
    State(state): State<Arc<AppState>>,
    artifact_id: Option<Path<String>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<StoreArtifactResponse>), ApiError> {
    let artifact_id = require_artifact_id(artifact_id)?;
    let team_id = require_team_id(query.as_deref())?;

    let max_upload_size = state.config.max_upload_size;
    let length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if length.is_some_and(|len| len > max_upload_size) {
        return Err(ApiError::payload_too_large(format!(
            "artifact exceeds maximum upload size of {max_upload_size} bytes"
        )));
    }

    let container_name = tenant::container_name(&team_id);
    tracing::debug!(%artifact_id, %team_id, %container_name, ?length, "Storing artifact");

    // Undeclared lengths are still capped while streaming
    let limit = usize::try_from(max_upload_size).unwrap_or(usize::MAX);
    let stream: ByteStream = Box::pin(
        Body::new(Limited::new(body, limit))
            .into_data_stream()
            .map_err(std::io::Error::other),
    );

    let item = async {
        let container = state.object_store.container(&container_name).await?;
        container.put(&artifact_id, stream, length).await
    }
    .await
    .map_err(|e| {
        tracing::warn!(%artifact_id, %container_name, error = %e, "Failed to store artifact");
        ApiError::internal(format!("failed to save cache item with id {artifact_id}"))
    })?;

    tracing::debug!(
        %artifact_id,
        size = ?item.size(),
        metadata = ?item.metadata(),
        "Stored artifact"
    );

    let url = item.url();
    let object_path = url.path().trim_start_matches('/');

    Ok((
        StatusCode::ACCEPTED,
        Json(StoreArtifactResponse {
            urls: vec![format!("{team_id}/{object_path}")],
        }),
    ))
}

// ============================================================================
// Helpers
// ============================================================================

fn require_artifact_id(path: Option<Path<String>>) -> Result<String, ApiError> {
    match path {
        Some(Path(id)) if !id.is_empty() => Ok(id),
        _ => Err(ApiError::required(
            StatusCode::NOT_FOUND,
            "artificateID is missing",
        )),
    }
}

fn require_team_id(query: Option<&str>) -> Result<String, ApiError> {
    team_id_from_query(query)
        .ok_or_else(|| ApiError::required(StatusCode::PRECONDITION_FAILED, "teamID is missing"))
}

/// First non-empty `teamID` in the query string. The Turborepo client sends
/// `teamId`, so both spellings count; repeats are not an error.
fn team_id_from_query(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, value)| (key == "teamID" || key == "teamId") && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

async fn lookup_artifact(
    state: &AppState,
    container_name: &str,
    artifact_id: &str,
) -> Result<Box<dyn Item>, ObjectStoreError> {
    let container = state.object_store.container(container_name).await?;
    container.item(artifact_id).await
}

/// Every fetch failure is reported to the client as the same 412.
fn artifact_not_found(artifact_id: &str, e: ObjectStoreError) -> ApiError {
    match e {
        ObjectStoreError::NotFound(_) => {
            tracing::debug!(%artifact_id, "Artifact not found");
        }
        e => {
            tracing::warn!(%artifact_id, error = %e, "Failed to read artifact");
        }
    }
    ApiError::not_found("Artifact not found")
}

fn artifact_response(size: Option<u64>, stream: ByteStream) -> Response {
    let mut response = (StatusCode::OK, Body::from_stream(stream)).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Some(size) = size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Accept, Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("OPTIONS, GET, POST, PUT, PATCH, DELETE"),
    );

    response
}
