//! Gateway runtime state and error plumbing.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use syncular_config::GatewayConfig;
use syncular_schemas::{ErrorBody, SyncError};

use crate::fetch::DownstreamFetch;

#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

pub struct GatewayState {
    pub cfg: GatewayConfig,
    pub fetcher: Arc<dyn DownstreamFetch>,
    pub build: BuildInfo,
}

impl GatewayState {
    pub fn new(cfg: GatewayConfig, fetcher: Arc<dyn DownstreamFetch>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            fetcher,
            build: BuildInfo {
                service: "syncular-gateway",
                version: env!("CARGO_PKG_VERSION"),
            },
        })
    }
}

/// Bearer propagated to downstream instances that have no configured token.
pub fn upstream_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

pub struct GatewayError(pub SyncError);

impl From<SyncError> for GatewayError {
    fn from(e: SyncError) -> Self {
        Self(e)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
