//! Downstream fetch boundary.
//!
//! This module defines **only** the request trait and the reqwest-backed
//! implementation, so the merge logic in `routes.rs` tests against canned
//! responses instead of sockets.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use syncular_config::InstanceConfig;

/// A downstream HTTP exchange that produced a status code. Transport-level
/// failures (connect, timeout) surface as the `Err(String)` of
/// [`DownstreamFetch::request_json`].
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: u16,
    pub body: Value,
}

#[async_trait]
pub trait DownstreamFetch: Send + Sync {
    /// Issue `method` against `instance.base_url + path_and_query`. The
    /// instance token wins over the upstream bearer when both exist.
    async fn request_json(
        &self,
        instance: &InstanceConfig,
        method: &str,
        path_and_query: &str,
        upstream_bearer: Option<&str>,
        body: Option<&Value>,
    ) -> Result<FetchResult, String>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout_ms: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DownstreamFetch for HttpFetcher {
    async fn request_json(
        &self,
        instance: &InstanceConfig,
        method: &str,
        path_and_query: &str,
        upstream_bearer: Option<&str>,
        body: Option<&Value>,
    ) -> Result<FetchResult, String> {
        let url = format!(
            "{}{}",
            instance.base_url.trim_end_matches('/'),
            path_and_query
        );
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| format!("invalid method: {e}"))?;

        let mut request = self.client.request(method, &url);
        if let Some(token) = instance.token.as_deref().or(upstream_bearer) {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response
            .json::<Value>()
            .await
            .unwrap_or(Value::Null);
        Ok(FetchResult { status, body })
    }
}
