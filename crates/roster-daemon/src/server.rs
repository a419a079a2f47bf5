use std::{convert::Infallible, env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use crate::middleware::timeout::request_timeout_layer;
use crate::{blobs, employees};
use anyhow::{bail, Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use roster_blob::{BlobError, BlobNamespace, BlobStore, LocalBlobStore, UploadSigner};
use roster_db::Database;
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use utoipa::{OpenApi, ToSchema};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_DB_URL: &str = "sqlite://roster.db";
const DEFAULT_BLOB_ROOT: &str = "./.roster_blobs";
const DEFAULT_MAX_UPLOAD_MIB: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SIGNING_KEY_LEN: usize = 32;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;

    let namespace = BlobNamespace::new(format!("{}/blobs", config.public_base_url))
        .context("invalid ROSTER_PUBLIC_BASE_URL")?;
    let signing_key = match config.signing_key.clone() {
        Some(key) => key,
        None => {
            warn!(
                "ROSTER_UPLOAD_SIGNING_KEY is not set; using an ephemeral key, \
                 outstanding upload URLs stop working on restart"
            );
            random_signing_key()
        }
    };
    let signer = UploadSigner::new(signing_key).context("invalid upload signing key")?;
    let blobs = LocalBlobStore::open(&config.blob_root, namespace, signer)
        .await
        .with_context(|| {
            format!(
                "failed to open blob store at {}",
                config.blob_root.display()
            )
        })?;

    let state = Arc::new(AppState {
        db,
        blobs: Arc::new(blobs),
        settings: config.settings.clone(),
    });

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(
        addr = %config.listen_addr,
        public_base_url = %config.public_base_url,
        blob_root = %config.blob_root.display(),
        "roster-daemon listening"
    );
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let settings = state.settings.clone();
    let timeout = settings.request_timeout;

    // Timeouts sit inside CORS: timed-out responses carry the CORS headers too.
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/employees",
            get(employees::list_employees)
                .post(employees::create_employee)
                .layer::<_, Infallible>(request_timeout_layer(timeout))
                .layer(cors_layer([Method::GET, Method::POST])),
        )
        .route(
            "/employees/:id",
            put(employees::update_employee)
                .delete(employees::delete_employee)
                .layer::<_, Infallible>(request_timeout_layer(timeout))
                .layer(cors_layer([Method::PUT, Method::DELETE])),
        )
        .route(
            "/blobs/:key",
            get(blobs::fetch_blob)
                .put(blobs::upload_blob)
                .layer::<_, Infallible>(DefaultBodyLimit::max(settings.max_upload_bytes))
                .layer::<_, Infallible>(request_timeout_layer(timeout))
                .layer(cors_layer([Method::GET, Method::PUT])),
        )
        .with_state(state)
}

/// Permissive CORS for one route: any origin, `Content-Type`, and the route's
/// methods plus `OPTIONS`.
fn cors_layer<const N: usize>(methods: [Method; N]) -> CorsLayer {
    let mut allowed = methods.to_vec();
    allowed.push(Method::OPTIONS);

    CorsLayer::new()
        .allow_origin(Any)
        .allow_headers([header::CONTENT_TYPE])
        .allow_methods(allowed)
}

pub(crate) struct AppState {
    pub(crate) db: Database,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) settings: ServiceSettings,
}

/// Per-request limits shared by the handlers.
#[derive(Debug, Clone)]
pub(crate) struct ServiceSettings {
    pub(crate) upload_ttl: Duration,
    pub(crate) max_upload_bytes: usize,
    pub(crate) request_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            upload_ttl: roster_blob::DEFAULT_UPLOAD_TTL,
            max_upload_bytes: mi_bytes(DEFAULT_MAX_UPLOAD_MIB) as usize,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    blob_root: PathBuf,
    public_base_url: String,
    signing_key: Option<Vec<u8>>,
    settings: ServiceSettings,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = env::var("ROSTER_API_ADDR")
            .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("invalid ROSTER_API_ADDR")?;

        let db_url = env::var("ROSTER_DB_DSN")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| DEFAULT_DB_URL.to_string());

        let blob_root = env::var("ROSTER_BLOB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_BLOB_ROOT));

        let public_base_url = match non_empty_env("ROSTER_PUBLIC_BASE_URL") {
            Some(value) => value.trim_end_matches('/').to_string(),
            None => format!("http://{listen_addr}"),
        };

        let signing_key = match non_empty_env("ROSTER_UPLOAD_SIGNING_KEY") {
            Some(value) => Some(
                STANDARD
                    .decode(value)
                    .context("invalid base64 in ROSTER_UPLOAD_SIGNING_KEY")?,
            ),
            None => None,
        };

        let mut settings = ServiceSettings::default();
        if let Some(seconds) = positive_u64_env("ROSTER_UPLOAD_TTL_SECONDS")? {
            settings.upload_ttl = Duration::from_secs(seconds);
        }
        if let Some(mib) = positive_u64_env("ROSTER_MAX_UPLOAD_MIB")? {
            settings.max_upload_bytes = usize::try_from(mi_bytes(mib))
                .context("ROSTER_MAX_UPLOAD_MIB is too large")?;
        }
        if let Some(seconds) = positive_u64_env("ROSTER_REQUEST_TIMEOUT_SECONDS")? {
            settings.request_timeout = Duration::from_secs(seconds);
        }

        Ok(Self {
            listen_addr,
            db_url,
            blob_root,
            public_base_url,
            signing_key,
            settings,
        })
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
    detail: Option<String>,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> StatusCode {
        self.status
    }

    /// 500 with a fixed message; the cause travels in the `error` field.
    pub(crate) fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal Server Error".to_string(),
            detail: Some(format!("{err:#}")),
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(err: BlobError) -> Self {
        match &err {
            BlobError::InvalidKey(_) | BlobError::InvalidContentType(_) => {
                ApiError::bad_request(err.to_string())
            }
            BlobError::NotFound(_) => ApiError::not_found(err.to_string()),
            BlobError::SignatureMismatch | BlobError::Expired => {
                ApiError::new(StatusCode::FORBIDDEN, err.to_string())
            }
            BlobError::AlreadyExists(_) => ApiError::new(StatusCode::CONFLICT, err.to_string()),
            BlobError::InvalidNamespace(_)
            | BlobError::SigningKey(_)
            | BlobError::Metadata(_)
            | BlobError::Io(_) => ApiError::internal(&err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, detail = ?self.detail, "api error");
        } else {
            warn!(status = %self.status, message = %self.message, "api error");
        }
        let body = Json(ErrorBody {
            message: self.message,
            error: self.detail,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub(crate) struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn mi_bytes(value: u64) -> u64 {
    value.saturating_mul(1024 * 1024)
}

fn random_signing_key() -> Vec<u8> {
    let mut key = vec![0u8; SIGNING_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub mod docs {
    use super::*;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Roster Daemon API", version = "0.1.0"),
        paths(
            healthz,
            employees::list_employees,
            employees::create_employee,
            employees::update_employee,
            employees::delete_employee,
            blobs::upload_blob,
            blobs::fetch_blob
        ),
        components(schemas(
            ErrorBody,
            employees::EmployeeBody,
            employees::UploadUrlBody,
            employees::EmployeeResponse,
            employees::EmployeeListResponse,
            employees::UploadUrlResponse,
            employees::MessageBody,
            blobs::UploadedBlobResponse
        ))
    )]
    pub struct ApiDoc;
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn positive_u64_env(key: &str) -> Result<Option<u64>> {
    let Some(raw) = non_empty_env(key) else {
        return Ok(None);
    };
    let value: u64 = raw
        .parse()
        .with_context(|| format!("invalid {key}: '{raw}'"))?;
    if value == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(Some(value))
}
