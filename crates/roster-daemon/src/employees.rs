use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use roster_blob::{BlobStore, ObjectKey, DEFAULT_FILE_NAME};
use roster_db::{EmployeeChanges, EmployeeRecord, NewEmployee};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::server::{ApiError, AppState};

/// `action` value that turns a create request into an upload credential request.
const UPLOAD_URL_ACTION: &str = "getUploadUrl";

/// Body of a create request after the `action` discriminator has been checked.
#[derive(Debug)]
enum CreateRequest {
    UploadUrl(UploadUrlBody),
    Employee(EmployeeBody),
}

impl CreateRequest {
    /// `action` absent or `null` selects a record insert, `"getUploadUrl"`
    /// an upload credential; any other value is rejected.
    fn parse(body: &[u8]) -> Result<Self, ApiError> {
        let value: Value = parse_json(body)?;
        let action = match value.get("action") {
            None | Some(Value::Null) => None,
            Some(Value::String(action)) => Some(action.clone()),
            Some(other) => {
                return Err(ApiError::bad_request(format!(
                    "action must be a string, got {other}"
                )))
            }
        };

        match action.as_deref() {
            None => from_value(value).map(CreateRequest::Employee),
            Some(UPLOAD_URL_ACTION) => from_value(value).map(CreateRequest::UploadUrl),
            Some(other) => Err(ApiError::bad_request(format!(
                "unsupported action '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadUrlBody {
    content_type: String,
    #[serde(default)]
    file_name: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EmployeeBody {
    name: String,
    role: String,
    email: String,
    /// Absolute `http(s)` address of the photo. Empty means no photo.
    #[serde(default)]
    photo_url: Option<String>,
}

impl EmployeeBody {
    fn photo_url(&self) -> Result<Option<&str>, ApiError> {
        let Some(raw) = self.photo_url.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }

        let rest = raw
            .strip_prefix("https://")
            .or_else(|| raw.strip_prefix("http://"));
        match rest {
            Some(rest) if !rest.is_empty() && !rest.starts_with('/') => Ok(Some(raw)),
            _ => Err(ApiError::bad_request(format!(
                "photoUrl '{raw}' is not an absolute http(s) address"
            ))),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EmployeeResponse {
    id: Uuid,
    name: String,
    role: String,
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    photo_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<EmployeeRecord> for EmployeeResponse {
    fn from(record: EmployeeRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            role: record.role,
            email: record.email,
            photo_url: record.photo_url,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub(crate) struct EmployeeListResponse {
    #[serde(rename = "Items")]
    items: Vec<EmployeeResponse>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadUrlResponse {
    upload_url: String,
    key: String,
    public_url: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub(crate) struct MessageBody {
    message: String,
}

#[utoipa::path(
    get,
    path = "/employees",
    responses(
        (status = 200, description = "Every employee record", body = EmployeeListResponse),
        (status = 500, description = "Record store failure", body = crate::server::ErrorBody)
    )
)]
pub(crate) async fn list_employees(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EmployeeListResponse>, ApiError> {
    let records = state
        .db
        .list_employees()
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(EmployeeListResponse {
        items: records.into_iter().map(EmployeeResponse::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/employees",
    request_body(
        content = EmployeeBody,
        description = "An employee record, or `{\"action\": \"getUploadUrl\", \"contentType\", \"fileName\"}` for an upload credential"
    ),
    responses(
        (status = 200, description = "Upload credential issued", body = UploadUrlResponse),
        (status = 201, description = "Employee created", body = EmployeeResponse),
        (status = 400, description = "Invalid request", body = crate::server::ErrorBody),
        (status = 500, description = "Store failure", body = crate::server::ErrorBody)
    )
)]
pub(crate) async fn create_employee(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    match CreateRequest::parse(&body)? {
        CreateRequest::UploadUrl(request) => {
            let response = issue_upload_url(&state, request).await?;
            Ok(Json(response).into_response())
        }
        CreateRequest::Employee(request) => {
            let record = state
                .db
                .insert_employee(NewEmployee {
                    name: &request.name,
                    role: &request.role,
                    email: &request.email,
                    photo_url: request.photo_url()?,
                })
                .await
                .map_err(ApiError::internal)?;

            info!(employee = %record.id, "employee created");
            Ok((StatusCode::CREATED, Json(EmployeeResponse::from(record))).into_response())
        }
    }
}

#[instrument(skip(state, request), fields(content_type = %request.content_type))]
async fn issue_upload_url(
    state: &AppState,
    request: UploadUrlBody,
) -> Result<UploadUrlResponse, ApiError> {
    let file_name = request
        .file_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_FILE_NAME);
    let key = ObjectKey::generate(file_name);

    let grant = state
        .blobs
        .presign_upload(&key, &request.content_type, state.settings.upload_ttl)
        .await?;

    debug!(key = %grant.key, expires_at = %grant.expires_at, "upload credential issued");
    Ok(UploadUrlResponse {
        upload_url: grant.upload_url,
        key: grant.key.to_string(),
        public_url: grant.public_url,
        expires_at: grant.expires_at,
    })
}

#[utoipa::path(
    put,
    path = "/employees/{id}",
    params(("id" = Uuid, Path, description = "Employee identifier")),
    request_body = EmployeeBody,
    responses(
        (status = 200, description = "Updated employee", body = EmployeeResponse),
        (status = 400, description = "Invalid request", body = crate::server::ErrorBody),
        (status = 404, description = "Employee not found", body = crate::server::ErrorBody),
        (status = 500, description = "Store failure", body = crate::server::ErrorBody)
    )
)]
pub(crate) async fn update_employee(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
    body: Bytes,
) -> Result<Json<EmployeeResponse>, ApiError> {
    let id = parse_employee_id(&raw_id)?;
    let request: EmployeeBody = parse_json(&body)?;

    let record = state
        .db
        .update_employee(
            id,
            EmployeeChanges {
                name: &request.name,
                role: &request.role,
                email: &request.email,
                photo_url: request.photo_url()?,
            },
        )
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| employee_not_found(&raw_id))?;

    info!(employee = %record.id, "employee updated");
    Ok(Json(EmployeeResponse::from(record)))
}

#[utoipa::path(
    delete,
    path = "/employees/{id}",
    params(("id" = Uuid, Path, description = "Employee identifier")),
    responses(
        (status = 200, description = "Employee deleted", body = MessageBody),
        (status = 404, description = "Employee not found", body = crate::server::ErrorBody),
        (status = 500, description = "Store failure", body = crate::server::ErrorBody)
    )
)]
pub(crate) async fn delete_employee(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<MessageBody>, ApiError> {
    let id = parse_employee_id(&raw_id)?;
    let record = state
        .db
        .fetch_employee(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| employee_not_found(&raw_id))?;

    if let Some(photo_url) = record.photo_url.as_deref() {
        remove_photo(state.blobs.as_ref(), id, photo_url).await;
    }

    // A concurrent delete may have won the race since the lookup.
    let deleted = state
        .db
        .delete_employee(id)
        .await
        .map_err(ApiError::internal)?;
    if !deleted {
        return Err(employee_not_found(&raw_id));
    }

    info!(employee = %id, "employee deleted");
    Ok(Json(MessageBody {
        message: "Employee deleted successfully".to_string(),
    }))
}

/// Best-effort removal of the photo behind `photo_url`. Failures are logged and
/// never block the record delete.
async fn remove_photo(blobs: &dyn BlobStore, employee: Uuid, photo_url: &str) {
    let Some(key) = blobs.namespace().key_from_url(photo_url) else {
        debug!(%employee, photo_url, "photo is outside the blob namespace; skipping cleanup");
        return;
    };

    match blobs.delete_object(&key).await {
        Ok(()) => debug!(%employee, key = %key, "employee photo deleted"),
        Err(error) => warn!(
            %employee,
            key = %key,
            %error,
            "failed to delete employee photo; continuing with record delete"
        ),
    }
}

fn parse_employee_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| employee_not_found(raw))
}

fn employee_not_found(raw: &str) -> ApiError {
    ApiError::not_found(format!("employee {raw} not found"))
}

/// Bodies are JSON whatever `Content-Type` the client claims.
fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value)
        .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))
}
