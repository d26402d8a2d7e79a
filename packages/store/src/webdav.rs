//! # WebDAV adapter
//!
//! Remote document store over the WebDAV verbs the protocol gives us:
//! EXISTS, GET, PUT and MKCOL, expressed as the object-safe [`DavTransport`]
//! trait. Production uses [`HttpDavClient`] on reqwest with basic auth;
//! tests script the transport to inject failures.
//!
//! `save` retries transient failures (no response, 5xx) with exponential
//! backoff, `base * 2^attempt`, for at most [`RetryPolicy::max_retries`]
//! retries. 401/403 surface as `AuthenticationFailed` and 507 as
//! `StorageExhausted`; neither is retried. Before every write the parent
//! collection is ensured with an idempotent MKCOL. A missing document on
//! `load` is an empty dataset, not an error.
//!
//! [`WebDavAdapter::check_for_conflicts`] is a last-writer-wins detector: it
//! loads the remote copy and reports a conflict iff the remote
//! `last_modified` is strictly newer than the caller's. It merges nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use tracing::{debug, warn};

use crate::adapter::{InitOutcome, StorageAdapter};
use crate::credentials::{CredentialManager, WebdavCredentials};
use crate::error::{error_for_status, Result, StorageError};
use crate::models::{Dataset, StorageMode};

/// Default document path on the server.
pub const DEFAULT_FILE_PATH: &str = "/meterbook/meterbook-data.json";

/// Known WebDAV server flavors, each with its own document root layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerFlavor {
    Nextcloud,
    Owncloud,
    Generic,
}

/// Normalize and validate a user-entered server URL: default to https,
/// reject non-HTTP schemes, strip the trailing slash.
pub fn validate_server_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(StorageError::NotConfigured("server URL is required".into()));
    }
    let mut clean = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    if !clean.starts_with("http://") && !clean.starts_with("https://") {
        return Err(StorageError::NotConfigured(
            "only http and https server URLs are supported".into(),
        ));
    }
    while clean.ends_with('/') {
        clean.pop();
    }
    Ok(clean)
}

/// Build the DAV root URL for a server flavor. The result is what gets
/// persisted as the credential `server_url`, so restored sessions need no
/// flavor knowledge.
pub fn dav_root(server_url: &str, username: &str, flavor: ServerFlavor) -> String {
    let base = server_url.trim_end_matches('/');
    match flavor {
        ServerFlavor::Nextcloud => format!("{base}/remote.php/dav/files/{username}"),
        ServerFlavor::Owncloud => format!("{base}/remote.php/webdav"),
        ServerFlavor::Generic => base.to_string(),
    }
}

/// The transport verbs the adapter needs from a WebDAV server.
#[async_trait]
pub trait DavTransport: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;
    /// `Ok(None)` on 404.
    async fn get(&self, path: &str) -> Result<Option<String>>;
    async fn put(&self, path: &str, body: String) -> Result<()>;
    /// Idempotent: an already-existing collection is not an error.
    async fn mkcol(&self, path: &str) -> Result<()>;
}

/// reqwest-backed [`DavTransport`] with basic authentication.
pub struct HttpDavClient {
    http: reqwest::Client,
    root: String,
    username: String,
    password: String,
}

impl HttpDavClient {
    pub fn new(credentials: &WebdavCredentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            root: credentials.server_url.trim_end_matches('/').to_string(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.root)
        } else {
            format!("{}/{path}", self.root)
        }
    }

    async fn send(&self, method: Method, path: &str, body: Option<String>) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method, self.url_for(path))
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.body(body);
        }
        request
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))
    }
}

#[async_trait]
impl DavTransport for HttpDavClient {
    async fn exists(&self, path: &str) -> Result<bool> {
        let response = self.send(Method::HEAD, path, None).await?;
        match response.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            status => Err(error_for_status(status)),
        }
    }

    async fn get(&self, path: &str) -> Result<Option<String>> {
        let response = self.send(Method::GET, path, None).await?;
        match response.status().as_u16() {
            200..=299 => {
                let text = response
                    .text()
                    .await
                    .map_err(|e| StorageError::Network(e.to_string()))?;
                Ok(Some(text))
            }
            404 => Ok(None),
            status => Err(error_for_status(status)),
        }
    }

    async fn put(&self, path: &str, body: String) -> Result<()> {
        let response = self.send(Method::PUT, path, Some(body)).await?;
        match response.status().as_u16() {
            200..=299 => Ok(()),
            status => Err(error_for_status(status)),
        }
    }

    async fn mkcol(&self, path: &str) -> Result<()> {
        let mkcol = Method::from_bytes(b"MKCOL").expect("static method name");
        let response = self.send(mkcol, path, None).await?;
        match response.status().as_u16() {
            200..=299 => Ok(()),
            // 405: the collection already exists.
            405 => Ok(()),
            status => Err(error_for_status(status)),
        }
    }
}

/// Bounded exponential backoff for transient save failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub base_delay: std::time::Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: std::time::Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

/// Result of a conflict probe against the remote copy.
#[derive(Debug)]
pub struct ConflictCheck {
    pub has_conflict: bool,
    pub remote_modified: Option<DateTime<Utc>>,
    /// The remote dataset, carried along only when it is the newer copy.
    pub remote: Option<Dataset>,
}

pub struct WebDavAdapter {
    credentials: CredentialManager,
    config: Option<WebdavCredentials>,
    transport: Option<Box<dyn DavTransport>>,
    retry: RetryPolicy,
}

impl WebDavAdapter {
    pub fn new(credentials: CredentialManager) -> Self {
        Self {
            credentials,
            config: None,
            transport: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Test seam: a preconfigured adapter over an arbitrary transport.
    pub fn with_transport(
        credentials: CredentialManager,
        config: WebdavCredentials,
        transport: Box<dyn DavTransport>,
    ) -> Self {
        Self {
            credentials,
            config: Some(config),
            transport: Some(transport),
            retry: RetryPolicy::default(),
        }
    }

    /// Validate, persist and activate a connection configuration. The stored
    /// `server_url` already embeds the flavor-specific DAV root.
    pub async fn configure(
        &mut self,
        server_url: &str,
        username: &str,
        password: &str,
        file_path: Option<&str>,
        flavor: ServerFlavor,
    ) -> Result<()> {
        let clean = validate_server_url(server_url)?;
        let config = WebdavCredentials {
            server_url: dav_root(&clean, username.trim(), flavor),
            username: username.trim().to_string(),
            password: password.to_string(),
            file_path: file_path.unwrap_or(DEFAULT_FILE_PATH).trim().to_string(),
        };
        self.credentials.store(&config)?;
        self.transport = Some(Box::new(HttpDavClient::new(&config)));
        self.config = Some(config);
        Ok(())
    }

    /// Forget the stored configuration and credentials.
    pub fn clear_configuration(&mut self) -> Result<()> {
        self.credentials.clear()?;
        self.config = None;
        self.transport = None;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.transport.is_some()
    }

    fn transport(&self) -> Result<&dyn DavTransport> {
        self.transport
            .as_deref()
            .ok_or_else(|| StorageError::NotConfigured("WebDAV is not configured".into()))
    }

    fn file_path(&self) -> Result<&str> {
        self.config
            .as_ref()
            .map(|c| c.file_path.as_str())
            .ok_or_else(|| StorageError::NotConfigured("WebDAV is not configured".into()))
    }

    /// Create the document's parent collections, outermost first. Failures
    /// are logged and swallowed; the following PUT carries the real error.
    async fn ensure_collections(&self) -> Result<()> {
        let transport = self.transport()?;
        let file_path = self.file_path()?;
        let Some(parent) = file_path.rfind('/').map(|at| &file_path[..at]) else {
            return Ok(());
        };

        let mut prefix = String::new();
        for segment in parent.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            match transport.exists(&prefix).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(collection = %prefix, "creating WebDAV collection");
                    if let Err(e) = transport.mkcol(&prefix).await {
                        warn!("could not create collection {prefix}: {e}");
                    }
                }
                Err(e) => warn!("could not probe collection {prefix}: {e}"),
            }
        }
        Ok(())
    }

    async fn save_with_retry(&self, document: String) -> Result<()> {
        let transport = self.transport()?;
        let file_path = self.file_path()?;

        let mut attempt: u32 = 0;
        loop {
            self.ensure_collections().await?;
            match transport.put(file_path, document.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.base_delay * 2u32.pow(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "WebDAV save failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Load the remote copy and report whether it is strictly newer than
    /// `local_last_modified`. Mutates nothing on either side; a probe
    /// failure counts as "no conflict" and is logged.
    pub async fn check_for_conflicts(
        &self,
        local_last_modified: DateTime<Utc>,
    ) -> ConflictCheck {
        let remote = match self.load().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("conflict probe failed: {e}");
                return ConflictCheck {
                    has_conflict: false,
                    remote_modified: None,
                    remote: None,
                };
            }
        };

        let has_conflict = remote.last_modified > local_last_modified;
        ConflictCheck {
            has_conflict,
            remote_modified: Some(remote.last_modified),
            remote: has_conflict.then_some(remote),
        }
    }
}

impl StorageAdapter for WebDavAdapter {
    fn mode(&self) -> StorageMode {
        StorageMode::Webdav
    }

    fn name(&self) -> String {
        match &self.config {
            Some(config) => {
                let host = config
                    .server_url
                    .split("://")
                    .nth(1)
                    .unwrap_or(&config.server_url)
                    .split('/')
                    .next()
                    .unwrap_or_default();
                format!("WebDAV: {host}{}", config.file_path)
            }
            None => "WebDAV sync (not configured)".to_string(),
        }
    }

    async fn can_use(&self) -> bool {
        // HTTP is always available; configuration is a separate concern.
        true
    }

    async fn init(&mut self) -> Result<InitOutcome> {
        if self.transport.is_none() {
            let Some(stored) = self.credentials.retrieve()? else {
                return Ok(InitOutcome::NeedsConfiguration);
            };
            self.transport = Some(Box::new(HttpDavClient::new(&stored)));
            self.config = Some(stored);
        }

        // Probing the document tests both reachability and authentication.
        let file_path = self.file_path()?.to_string();
        match self.transport()?.exists(&file_path).await {
            Ok(_) => Ok(InitOutcome::Ready),
            Err(e @ StorageError::AuthenticationFailed) => Err(e),
            Err(e) => Ok(InitOutcome::ConnectionError {
                message: e.to_string(),
            }),
        }
    }

    async fn load(&self) -> Result<Dataset> {
        let content = self.transport()?.get(self.file_path()?).await?;
        match content {
            None => {
                debug!("remote document does not exist yet, starting empty");
                Ok(Dataset::empty())
            }
            Some(text) => serde_json::from_str(&text).map_err(|_| StorageError::InvalidFormat),
        }
    }

    async fn save(&self, data: &mut Dataset) -> Result<()> {
        data.last_modified = Utc::now();
        let document = data.to_document().map_err(|_| StorageError::InvalidFormat)?;
        self.save_with_retry(document).await?;
        debug!(
            meters = data.meters.len(),
            readings = data.readings.len(),
            "WebDAV save completed"
        );
        Ok(())
    }
}
