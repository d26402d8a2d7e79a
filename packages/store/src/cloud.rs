//! # Cloud-API adapter
//!
//! Persists the dataset through the sync gateway's REST surface:
//! `GET /api/sync/download`, `POST /api/sync/upload` and
//! `GET /api/sync/metadata`, all behind a bearer credential. The credential
//! comes from a [`TokenProvider`] the embedding application supplies; the
//! OAuth exchange that produces it lives outside this crate.
//!
//! The gateway stores the whole dataset as one value, so this adapter never
//! uploads partial entities. An account that has never synced downloads the
//! empty-shape dataset rather than an error.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::{InitOutcome, StorageAdapter};
use crate::error::{error_for_status, Result, StorageError};
use crate::models::{Dataset, StorageMode};

/// Supplies the bearer credential for gateway calls. The OAuth flow behind
/// it is an external collaborator.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;
    async fn bearer_token(&self) -> Result<String>;
}

/// Sync bookkeeping returned by the gateway after an upload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meters_count: usize,
    #[serde(default)]
    pub readings_count: usize,
    #[serde(default)]
    pub size: u64,
}

/// The gateway operations the adapter needs, object-safe so tests can
/// substitute an in-memory gateway.
#[async_trait]
pub trait CloudGateway: Send + Sync {
    fn is_authenticated(&self) -> bool;
    async fn download(&self) -> Result<Dataset>;
    async fn upload(&self, data: &Dataset) -> Result<SyncMetadata>;
    /// `Ok(None)` when the account has never uploaded.
    async fn metadata(&self) -> Result<Option<SyncMetadata>>;
}

#[derive(Deserialize)]
struct UploadResponse {
    #[allow(dead_code)]
    success: bool,
    metadata: SyncMetadata,
}

/// reqwest-backed [`CloudGateway`].
pub struct HttpCloudGateway {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpCloudGateway {
    pub fn new(base_url: &str, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    async fn authed(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.bearer_token().await?;
        Ok(self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token))
    }
}

#[async_trait]
impl CloudGateway for HttpCloudGateway {
    fn is_authenticated(&self) -> bool {
        self.tokens.is_authenticated()
    }

    async fn download(&self) -> Result<Dataset> {
        let response = self
            .authed("/api/sync/download")
            .await?
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        if !(200..=299).contains(&status) {
            return Err(error_for_status(status));
        }
        response
            .json::<Dataset>()
            .await
            .map_err(|_| StorageError::InvalidFormat)
    }

    async fn upload(&self, data: &Dataset) -> Result<SyncMetadata> {
        let token = self.tokens.bearer_token().await?;
        let response = self
            .http
            .post(format!("{}/api/sync/upload", self.base_url))
            .bearer_auth(token)
            .json(data)
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        if !(200..=299).contains(&status) {
            return Err(error_for_status(status));
        }
        let body: UploadResponse = response
            .json()
            .await
            .map_err(|_| StorageError::InvalidFormat)?;
        Ok(body.metadata)
    }

    async fn metadata(&self) -> Result<Option<SyncMetadata>> {
        let response = self
            .authed("/api/sync/metadata")
            .await?
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;
        match response.status().as_u16() {
            200..=299 => {
                let meta: SyncMetadata = response
                    .json()
                    .await
                    .map_err(|_| StorageError::InvalidFormat)?;
                Ok(if meta.last_updated.is_some() {
                    Some(meta)
                } else {
                    None
                })
            }
            404 => Ok(None),
            status => Err(error_for_status(status)),
        }
    }
}

pub struct CloudAdapter {
    gateway: Box<dyn CloudGateway>,
}

impl CloudAdapter {
    pub fn new(gateway: Box<dyn CloudGateway>) -> Self {
        Self { gateway }
    }

    /// Whether the cloud holds a copy newer than `local_last_modified`.
    pub async fn has_newer_data(&self, local_last_modified: DateTime<Utc>) -> Result<bool> {
        let Some(meta) = self.gateway.metadata().await? else {
            return Ok(false);
        };
        Ok(meta
            .last_updated
            .map_or(false, |remote| remote > local_last_modified))
    }

    pub async fn sync_metadata(&self) -> Result<Option<SyncMetadata>> {
        self.gateway.metadata().await
    }
}

impl StorageAdapter for CloudAdapter {
    fn mode(&self) -> StorageMode {
        StorageMode::Cloud
    }

    fn name(&self) -> String {
        "Cloud sync".to_string()
    }

    async fn can_use(&self) -> bool {
        self.gateway.is_authenticated()
    }

    async fn init(&mut self) -> Result<InitOutcome> {
        if !self.gateway.is_authenticated() {
            return Ok(InitOutcome::NeedsConfiguration);
        }
        Ok(InitOutcome::Ready)
    }

    async fn load(&self) -> Result<Dataset> {
        let data = self.gateway.download().await?;
        debug!(
            meters = data.meters.len(),
            readings = data.readings.len(),
            "cloud download completed"
        );
        Ok(data)
    }

    async fn save(&self, data: &mut Dataset) -> Result<()> {
        data.last_modified = Utc::now();
        let meta = self.gateway.upload(data).await?;
        debug!(
            meters = meta.meters_count,
            readings = meta.readings_count,
            size = meta.size,
            "cloud upload completed"
        );
        Ok(())
    }
}
