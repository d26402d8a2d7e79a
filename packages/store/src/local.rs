//! Local database adapter backed by sled.
//!
//! The native analog of the browser-local database: an embedded KV store at a
//! configured directory, holding the whole dataset as one JSON value under a
//! fixed key. This backend doubles as the fallback target when another
//! backend loses its permissions, and it is the only one that supports a
//! synchronous flush on shutdown.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use crate::adapter::{InitOutcome, StorageAdapter};
use crate::error::{Result, StorageError};
use crate::models::{Dataset, StorageMode};

const DATA_KEY: &str = "data";

pub struct LocalDbAdapter {
    path: PathBuf,
    db: Option<sled::Db>,
}

impl LocalDbAdapter {
    /// An adapter over the database directory at `path`. Nothing is opened
    /// until `init`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn db(&self) -> Result<&sled::Db> {
        self.db
            .as_ref()
            .ok_or_else(|| StorageError::NotConfigured("local database not opened".into()))
    }

    fn read(&self) -> Result<Dataset> {
        let db = self.db()?;
        match db.get(DATA_KEY)? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|_| StorageError::InvalidFormat)
            }
            None => Ok(Dataset::empty()),
        }
    }

    fn write(&self, data: &mut Dataset) -> Result<()> {
        let db = self.db()?;
        data.last_modified = Utc::now();
        let bytes = serde_json::to_vec(data).map_err(|_| StorageError::InvalidFormat)?;
        db.insert(DATA_KEY, bytes)?;
        db.flush()?;
        debug!(
            meters = data.meters.len(),
            readings = data.readings.len(),
            "local database save completed"
        );
        Ok(())
    }

    /// Synchronous save used by the shutdown flush path.
    pub fn save_blocking(&self, data: &mut Dataset) -> Result<()> {
        self.write(data)
    }

    /// Drop all stored data. Only invoked by an explicit user reset.
    pub fn clear(&self) -> Result<()> {
        let db = self.db()?;
        db.remove(DATA_KEY)?;
        db.flush()?;
        Ok(())
    }

    /// Release the database handle. A later `init` reopens it.
    pub fn close(&mut self) {
        self.db = None;
    }
}

impl StorageAdapter for LocalDbAdapter {
    fn mode(&self) -> StorageMode {
        StorageMode::Local
    }

    fn name(&self) -> String {
        "Local database".to_string()
    }

    async fn can_use(&self) -> bool {
        true
    }

    async fn init(&mut self) -> Result<InitOutcome> {
        if self.db.is_some() {
            return Ok(InitOutcome::Ready);
        }
        self.db = Some(sled::open(&self.path)?);
        Ok(InitOutcome::Ready)
    }

    async fn load(&self) -> Result<Dataset> {
        self.read()
    }

    async fn save(&self, data: &mut Dataset) -> Result<()> {
        self.write(data)
    }
}
