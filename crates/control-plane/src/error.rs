use axum::http::{HeaderMap, StatusCode};
use sqlx::{error::DatabaseError, Error as SqlxError};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::peers::PeerApiError;

/// Failures of the fleet operations: selection, peer lifecycle and failover.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("no server available")]
    NoServerAvailable,
    #[error("no backup server available for {server_id}")]
    NoBackupAvailable { server_id: Uuid },
    #[error("server {server_id} has no free capacity")]
    CapacityExhausted { server_id: Uuid },
    #[error("overlay address pool exhausted")]
    AddressPoolExhausted,
    #[error("failover already running for server {server_id}")]
    FailoverInProgress { server_id: Uuid },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Peer(#[from] PeerApiError),
    #[error("provisioning failed: {source}")]
    ProvisionFailed {
        #[source]
        source: Box<FleetError>,
    },
    #[error("migration of device {device_id} failed: {source}")]
    MigrationFailed {
        device_id: Uuid,
        #[source]
        source: Box<FleetError>,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;

impl FleetError {
    pub fn server_not_found(id: Uuid) -> Self {
        FleetError::NotFound {
            kind: "server",
            id: id.to_string(),
        }
    }

    pub fn device_not_found(id: Uuid) -> Self {
        FleetError::NotFound {
            kind: "device",
            id: id.to_string(),
        }
    }

    pub fn provision_failed(source: FleetError) -> Self {
        FleetError::ProvisionFailed {
            source: Box::new(source),
        }
    }

    pub fn migration_failed(device_id: Uuid, source: FleetError) -> Self {
        FleetError::MigrationFailed {
            device_id,
            source: Box::new(source),
        }
    }

    /// Innermost fleet error, unwrapping provisioning and migration wrappers.
    pub fn root(&self) -> &FleetError {
        match self {
            FleetError::ProvisionFailed { source } | FleetError::MigrationFailed { source, .. } => {
                source.root()
            }
            other => other,
        }
    }
}

/// Application error type for HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub headers: Option<Box<HeaderMap>>,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

const DB_UNAVAILABLE_MESSAGE: &str = "database temporarily unavailable";

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
            headers: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
    }

    pub fn internal(msg: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(Box::new(headers));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    CheckViolation,
    Busy,
}

fn map_anyhow_error(err: &anyhow::Error) -> Option<AppError> {
    let sqlx_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())?;
    map_sqlx_error(sqlx_err)
}

fn map_sqlx_error(err: &SqlxError) -> Option<AppError> {
    match err {
        SqlxError::RowNotFound => Some(AppError::not_found("resource not found")),
        SqlxError::Database(db_err) => map_database_error(db_err.as_ref()),
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
            Some(AppError::service_unavailable(DB_UNAVAILABLE_MESSAGE))
        }
        _ => None,
    }
}

fn map_database_error(err: &dyn DatabaseError) -> Option<AppError> {
    let kind = classify_db_error(err.code().as_deref(), err.message())?;
    match kind {
        DbErrorKind::UniqueViolation => Some(AppError::new(
            StatusCode::CONFLICT,
            "conflict",
            "resource already exists",
        )),
        DbErrorKind::ForeignKeyViolation => Some(AppError::bad_request("invalid reference")),
        DbErrorKind::NotNullViolation => Some(AppError::bad_request("missing required field")),
        DbErrorKind::CheckViolation => Some(AppError::bad_request("invalid request")),
        DbErrorKind::Busy => Some(AppError::service_unavailable(DB_UNAVAILABLE_MESSAGE)),
    }
}

fn classify_db_error(code: Option<&str>, message: &str) -> Option<DbErrorKind> {
    let code = code.unwrap_or_default();
    let message = message.to_ascii_lowercase();

    if matches!(code, "2067" | "1555") || message.contains("unique constraint") {
        return Some(DbErrorKind::UniqueViolation);
    }
    if code == "787" || message.contains("foreign key constraint") {
        return Some(DbErrorKind::ForeignKeyViolation);
    }
    if code == "1299" || message.contains("not null constraint") {
        return Some(DbErrorKind::NotNullViolation);
    }
    if code == "275" || message.contains("check constraint") {
        return Some(DbErrorKind::CheckViolation);
    }
    if message.contains("database is locked") || message.contains("database is busy") {
        return Some(DbErrorKind::Busy);
    }

    None
}

pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    let Some(SqlxError::Database(db_err)) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
    else {
        return false;
    };
    matches!(
        classify_db_error(db_err.code().as_deref(), db_err.message()),
        Some(DbErrorKind::UniqueViolation)
    )
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(mapped) = map_anyhow_error(&err) {
            if mapped.status.is_server_error() {
                crate::metrics::record_internal_error(&err);
                error!(?err, "internal error");
            }
            return mapped;
        }

        crate::metrics::record_internal_error(&err);
        error!(?err, "internal error");
        AppError::internal("internal server error")
    }
}

impl From<PeerApiError> for AppError {
    fn from(err: PeerApiError) -> Self {
        let message = err.to_string();
        match err {
            PeerApiError::RemoteUnreachable { .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, "remote_unreachable", message)
            }
            PeerApiError::RemoteRejected { .. } | PeerApiError::InvalidResponse { .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, "remote_rejected", message)
            }
            PeerApiError::ConfigMissing { .. } => {
                error!(%message, "server credential missing");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "config_missing", message)
            }
        }
    }
}

impl From<FleetError> for AppError {
    fn from(err: FleetError) -> Self {
        let message = err.to_string();
        match err {
            FleetError::NotFound { .. } => AppError::not_found(message),
            FleetError::NoServerAvailable => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "no_server_available", message)
            }
            FleetError::NoBackupAvailable { .. } => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "no_backup_available", message)
            }
            FleetError::CapacityExhausted { .. } => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "capacity_exhausted", message)
            }
            FleetError::AddressPoolExhausted => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "address_pool_exhausted", message)
            }
            FleetError::FailoverInProgress { .. } => {
                AppError::new(StatusCode::CONFLICT, "failover_in_progress", message)
            }
            FleetError::InvalidInput(msg) => AppError::bad_request(msg),
            FleetError::Peer(peer) => peer.into(),
            FleetError::ProvisionFailed { source } => {
                let mut mapped = AppError::from(*source);
                if mapped.status.is_server_error() {
                    mapped.code = "provision_failed";
                    mapped.message = message;
                }
                mapped
            }
            FleetError::MigrationFailed { source, .. } => {
                let mut mapped = AppError::from(*source);
                if mapped.status.is_server_error() {
                    mapped.code = "migration_failed";
                    mapped.message = message;
                }
                mapped
            }
            FleetError::Storage(err) => err.into(),
        }
    }
}
