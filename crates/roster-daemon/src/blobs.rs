use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use roster_blob::{ObjectKey, UploadTicket};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::server::{ApiError, AppState};

/// Query string of a presigned upload URL.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct UploadQuery {
    /// Unix timestamp after which the credential is rejected.
    expires: Option<i64>,
    signature: Option<String>,
}

impl UploadQuery {
    fn into_ticket(self) -> Result<UploadTicket, ApiError> {
        match (self.expires, self.signature) {
            (Some(expires), Some(signature)) => Ok(UploadTicket { expires, signature }),
            _ => Err(ApiError::new(
                StatusCode::FORBIDDEN,
                "upload requires the expires and signature parameters of a presigned URL",
            )),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadedBlobResponse {
    key: String,
    content_type: String,
    size: u64,
}

#[utoipa::path(
    put,
    path = "/blobs/{key}",
    params(("key" = String, Path, description = "Object key"), UploadQuery),
    request_body(
        content = String,
        description = "Raw object bytes; Content-Type must match the presigned one",
        content_type = "application/octet-stream"
    ),
    responses(
        (status = 200, description = "Object stored", body = UploadedBlobResponse),
        (status = 400, description = "Invalid key or content type", body = crate::server::ErrorBody),
        (status = 403, description = "Missing, invalid or expired credential", body = crate::server::ErrorBody),
        (status = 409, description = "Object already uploaded", body = crate::server::ErrorBody),
        (status = 413, description = "Object too large", body = crate::server::ErrorBody)
    )
)]
pub(crate) async fn upload_blob(
    State(state): State<Arc<AppState>>,
    Path(raw_key): Path<String>,
    query: Result<Query<UploadQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<UploadedBlobResponse>, ApiError> {
    let key = ObjectKey::parse(&raw_key)?;
    let Query(query) =
        query.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let ticket = query.into_ticket()?;
    let data =
        body.map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text()))?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("Content-Type header is required"))?;

    let metadata = state
        .blobs
        .complete_upload(&key, &ticket, content_type, data.to_vec())
        .await?;

    info!(key = %key, size = metadata.size, "blob uploaded");
    Ok(Json(UploadedBlobResponse {
        key: key.to_string(),
        content_type: metadata.content_type,
        size: metadata.size,
    }))
}

#[utoipa::path(
    get,
    path = "/blobs/{key}",
    params(("key" = String, Path, description = "Object key")),
    responses(
        (status = 200, description = "Stored object bytes with their uploaded Content-Type"),
        (status = 400, description = "Invalid key", body = crate::server::ErrorBody),
        (status = 404, description = "Object not found", body = crate::server::ErrorBody)
    )
)]
pub(crate) async fn fetch_blob(
    State(state): State<Arc<AppState>>,
    Path(raw_key): Path<String>,
) -> Result<Response, ApiError> {
    let key = ObjectKey::parse(&raw_key)?;
    let object = state.blobs.fetch_object(&key).await?;

    let content_type =
        HeaderValue::from_str(&object.metadata.content_type).map_err(ApiError::internal)?;
    Ok(([(header::CONTENT_TYPE, content_type)], object.data).into_response())
}
