//! Error taxonomy shared across the sync core. HTTP mapping lives here as a
//! plain u16 so this crate stays framework-free; the daemon converts to an
//! axum response.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // auth
    Unauthenticated,
    Forbidden,
    InvalidToken,
    // validation
    InvalidRequest,
    InvalidSubscription,
    TooManyOperations,
    InvalidFederatedId,
    AmbiguousEventId,
    AmbiguousCommitId,
    AmbiguousOperationId,
    InstanceRequired,
    NoInstancesSelected,
    // resource
    NotFound,
    ChunkExpired,
    BlobStorageNotConfigured,
    BlobNotFound,
    // quota
    RateLimited,
    WebsocketConnectionLimitTotal,
    WebsocketConnectionLimitClient,
    // upstream
    DownstreamUnavailable,
    InvalidDownstreamResponse,
    // fatal
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidSubscription => "INVALID_SUBSCRIPTION",
            ErrorCode::TooManyOperations => "TOO_MANY_OPERATIONS",
            ErrorCode::InvalidFederatedId => "INVALID_FEDERATED_ID",
            ErrorCode::AmbiguousEventId => "AMBIGUOUS_EVENT_ID",
            ErrorCode::AmbiguousCommitId => "AMBIGUOUS_COMMIT_ID",
            ErrorCode::AmbiguousOperationId => "AMBIGUOUS_OPERATION_ID",
            ErrorCode::InstanceRequired => "INSTANCE_REQUIRED",
            ErrorCode::NoInstancesSelected => "NO_INSTANCES_SELECTED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ChunkExpired => "CHUNK_EXPIRED",
            ErrorCode::BlobStorageNotConfigured => "BLOB_STORAGE_NOT_CONFIGURED",
            ErrorCode::BlobNotFound => "BLOB_NOT_FOUND",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::WebsocketConnectionLimitTotal => "WEBSOCKET_CONNECTION_LIMIT_TOTAL",
            ErrorCode::WebsocketConnectionLimitClient => "WEBSOCKET_CONNECTION_LIMIT_CLIENT",
            ErrorCode::DownstreamUnavailable => "DOWNSTREAM_UNAVAILABLE",
            ErrorCode::InvalidDownstreamResponse => "INVALID_DOWNSTREAM_RESPONSE",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Unauthenticated | ErrorCode::InvalidToken => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::InvalidRequest
            | ErrorCode::InvalidSubscription
            | ErrorCode::TooManyOperations
            | ErrorCode::InvalidFederatedId
            | ErrorCode::AmbiguousEventId
            | ErrorCode::AmbiguousCommitId
            | ErrorCode::AmbiguousOperationId
            | ErrorCode::InstanceRequired
            | ErrorCode::NoInstancesSelected => 400,
            ErrorCode::NotFound | ErrorCode::ChunkExpired | ErrorCode::BlobNotFound => 404,
            ErrorCode::BlobStorageNotConfigured => 501,
            ErrorCode::RateLimited
            | ErrorCode::WebsocketConnectionLimitTotal
            | ErrorCode::WebsocketConnectionLimitClient => 429,
            ErrorCode::DownstreamUnavailable => 502,
            ErrorCode::InvalidDownstreamResponse => 502,
            ErrorCode::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sync-core error: taxonomy code plus a human message. Storage and
/// config layers use `anyhow`; this type is for everything that reaches a
/// caller over the wire.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct SyncError {
    pub code: ErrorCode,
    pub message: String,
}

impl SyncError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn invalid_subscription(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSubscription, message)
    }

    pub fn unauthenticated() -> Self {
        Self::new(ErrorCode::Unauthenticated, "authentication required")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

/// Wire shape for every error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
}

impl From<&SyncError> for ErrorBody {
    fn from(e: &SyncError) -> Self {
        Self {
            error: e.code,
            message: e.message.clone(),
        }
    }
}
