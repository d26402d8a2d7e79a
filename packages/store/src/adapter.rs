//! # Storage adapter contract
//!
//! Every backend implements [`StorageAdapter`]: the uniform persistence
//! contract the rest of the system relies on. All operations are async and
//! whole-dataset; there is no partial-entity persistence anywhere.
//!
//! | Method | Contract |
//! |--------|----------|
//! | `mode` | The explicit [`StorageMode`] tag this adapter carries. Consumers dispatch on this field only, never on the concrete type. |
//! | `name` | Human-readable identity, for display only. |
//! | `can_use` | Capability probe. Must not fail and must not mutate state. |
//! | `init` | Idempotent readiness setup. Never destroys existing stored data. |
//! | `load` | Returns the stored dataset, or the empty template when the store has never been written. "Empty" is not an error. |
//! | `save` | Stamps `last_modified`, then fully overwrites the stored copy. |
//!
//! [`Backend`] is the tagged union of the concrete adapters. Holding the enum
//! rather than a trait object lets the manager hot-swap heterogeneous
//! backends while keeping dispatch explicit.

use serde::{Deserialize, Serialize};

use crate::cloud::CloudAdapter;
use crate::error::Result;
use crate::fs::FileSystemAdapter;
use crate::local::LocalDbAdapter;
use crate::memory::MemoryAdapter;
use crate::models::{Dataset, StorageMode};
use crate::webdav::WebDavAdapter;

/// Which access a permission decision covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    Read,
    ReadWrite,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionMode::Read => f.write_str("read"),
            PermissionMode::ReadWrite => f.write_str("readwrite"),
        }
    }
}

/// State of a capability permission, mirroring the three-valued model of
/// handle-based file access. `Prompt` can only be resolved through an
/// explicit user-gesture entry point, never from `load`/`save`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
}

/// Typed readiness descriptor returned by [`StorageAdapter::init`].
#[derive(Clone, Debug, PartialEq)]
pub enum InitOutcome {
    /// The adapter can serve `load`/`save` right away.
    Ready,
    /// Nothing is configured yet; the caller must run the setup flow.
    NeedsConfiguration,
    /// A handle was restored but access needs a user decision first.
    PermissionRequired {
        read: PermissionState,
        write: PermissionState,
        file_name: Option<String>,
    },
    /// Configuration was restored but the remote store is unreachable.
    ConnectionError { message: String },
}

/// The uniform persistence contract implemented by every backend.
pub trait StorageAdapter {
    /// The explicit mode tag this adapter carries.
    fn mode(&self) -> StorageMode;

    /// Human-readable backend identity, used for UI only.
    fn name(&self) -> String;

    /// Capability probe: is this backend usable in the current environment.
    fn can_use(&self) -> impl std::future::Future<Output = bool>;

    /// Prepare the adapter. Idempotent: repeated calls short-circuit once
    /// ready. Must never destroy existing stored data.
    fn init(&mut self) -> impl std::future::Future<Output = Result<InitOutcome>>;

    /// Read the stored dataset, or the empty template if never written.
    fn load(&self) -> impl std::future::Future<Output = Result<Dataset>>;

    /// Stamp `last_modified` and fully overwrite the stored copy.
    fn save(&self, data: &mut Dataset) -> impl std::future::Future<Output = Result<()>>;
}

/// Tagged union of the concrete storage backends.
pub enum Backend {
    Local(LocalDbAdapter),
    File(FileSystemAdapter),
    Webdav(WebDavAdapter),
    Cloud(CloudAdapter),
    /// In-memory backend for tests and ephemeral sessions.
    Memory(MemoryAdapter),
}

impl StorageAdapter for Backend {
    fn mode(&self) -> StorageMode {
        match self {
            Backend::Local(a) => a.mode(),
            Backend::File(a) => a.mode(),
            Backend::Webdav(a) => a.mode(),
            Backend::Cloud(a) => a.mode(),
            Backend::Memory(a) => a.mode(),
        }
    }

    fn name(&self) -> String {
        match self {
            Backend::Local(a) => a.name(),
            Backend::File(a) => a.name(),
            Backend::Webdav(a) => a.name(),
            Backend::Cloud(a) => a.name(),
            Backend::Memory(a) => a.name(),
        }
    }

    async fn can_use(&self) -> bool {
        match self {
            Backend::Local(a) => a.can_use().await,
            Backend::File(a) => a.can_use().await,
            Backend::Webdav(a) => a.can_use().await,
            Backend::Cloud(a) => a.can_use().await,
            Backend::Memory(a) => a.can_use().await,
        }
    }

    async fn init(&mut self) -> Result<InitOutcome> {
        match self {
            Backend::Local(a) => a.init().await,
            Backend::File(a) => a.init().await,
            Backend::Webdav(a) => a.init().await,
            Backend::Cloud(a) => a.init().await,
            Backend::Memory(a) => a.init().await,
        }
    }

    async fn load(&self) -> Result<Dataset> {
        match self {
            Backend::Local(a) => a.load().await,
            Backend::File(a) => a.load().await,
            Backend::Webdav(a) => a.load().await,
            Backend::Cloud(a) => a.load().await,
            Backend::Memory(a) => a.load().await,
        }
    }

    async fn save(&self, data: &mut Dataset) -> Result<()> {
        match self {
            Backend::Local(a) => a.save(data).await,
            Backend::File(a) => a.save(data).await,
            Backend::Webdav(a) => a.save(data).await,
            Backend::Cloud(a) => a.save(data).await,
            Backend::Memory(a) => a.save(data).await,
        }
    }
}

impl Backend {
    /// Best-effort synchronous flush, available on the local database only.
    /// Returns `None` for backends that cannot be written synchronously;
    /// those are skipped on shutdown.
    pub fn flush_blocking(&self, data: &mut Dataset) -> Option<Result<()>> {
        match self {
            Backend::Local(a) => Some(a.save_blocking(data)),
            _ => None,
        }
    }
}
