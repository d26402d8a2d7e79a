//! In-memory adapter for tests and ephemeral sessions.
//!
//! Clones share the same slot, so a test can keep a handle on the adapter it
//! hands to a manager and inspect what was persisted. The mode tag is
//! configurable so the adapter can stand in for any backend, and saves can be
//! scripted to fail for exercising the recovery paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::adapter::{InitOutcome, StorageAdapter};
use crate::error::{Result, StorageError};
use crate::models::{Dataset, StorageMode};

#[derive(Clone, Default)]
pub struct MemoryAdapter {
    mode: Option<StorageMode>,
    slot: Arc<Mutex<Option<Dataset>>>,
    save_failures: Arc<Mutex<VecDeque<StorageError>>>,
    save_count: Arc<AtomicUsize>,
    save_delay: Option<Duration>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter that reports the given mode tag, standing in for that
    /// backend in tests.
    pub fn with_mode(mode: StorageMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    /// An adapter whose store already holds `data`.
    pub fn preloaded(mode: StorageMode, data: Dataset) -> Self {
        let adapter = Self::with_mode(mode);
        *adapter.slot.lock().unwrap() = Some(data);
        adapter
    }

    /// What the store currently holds, if anything was ever saved.
    pub fn contents(&self) -> Option<Dataset> {
        self.slot.lock().unwrap().clone()
    }

    /// How many saves reached the store, including failed ones.
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Queue an error for the next save attempt.
    pub fn inject_save_error(&self, error: StorageError) {
        self.save_failures.lock().unwrap().push_back(error);
    }

    /// Hold each save open for `delay`, so tests can overlap saves.
    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = Some(delay);
        self
    }
}

impl StorageAdapter for MemoryAdapter {
    fn mode(&self) -> StorageMode {
        self.mode.unwrap_or(StorageMode::Local)
    }

    fn name(&self) -> String {
        format!("In-memory store ({})", self.mode())
    }

    async fn can_use(&self) -> bool {
        true
    }

    async fn init(&mut self) -> Result<InitOutcome> {
        Ok(InitOutcome::Ready)
    }

    async fn load(&self) -> Result<Dataset> {
        Ok(self
            .slot
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(Dataset::empty))
    }

    async fn save(&self, data: &mut Dataset) -> Result<()> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.save_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.save_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        data.last_modified = Utc::now();
        *self.slot.lock().unwrap() = Some(data.clone());
        Ok(())
    }
}
