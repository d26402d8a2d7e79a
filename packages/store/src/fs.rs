//! # Filesystem adapter with a persisted capability handle
//!
//! Holds a handle to a single data file, persisted as a small TOML record in
//! a side file so the handle survives restarts without asking the user to
//! pick the file again. Access is gated by a three-valued permission state
//! per mode (`granted | denied | prompt`).
//!
//! Two rules keep the permission model honest:
//!
//! - `load` and `save` never request permission. A non-granted state surfaces
//!   [`StorageError::PermissionDenied`] and the coordination layer falls back
//!   to the local database.
//! - The only way to resolve `prompt` is
//!   [`FileSystemAdapter::request_permission_from_gesture`], which callers
//!   must invoke from a user-initiated input event. The decision itself comes
//!   from a pluggable [`PermissionAuthority`]; the default probes the
//!   filesystem, tests script it.
//!
//! A file that vanished underneath a persisted handle is reported as
//! [`StorageError::NotFound`] so the recovery flow can offer a replacement
//! instead of crashing.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapter::{InitOutcome, PermissionMode, PermissionState, StorageAdapter};
use crate::error::{Result, StorageError};
use crate::models::{Dataset, StorageMode};

/// Name of the side file holding the persisted handle record.
const HANDLE_RECORD_FILE: &str = "file-handle.toml";

/// Decides permission requests for a file handle.
///
/// `probe` answers without user interaction and may return `Prompt`;
/// `request` is the interactive path and must only be reached from a
/// user-gesture entry point.
#[async_trait]
pub trait PermissionAuthority: Send + Sync {
    async fn probe(&self, path: &Path, mode: PermissionMode) -> PermissionState;
    async fn request(&self, path: &Path, mode: PermissionMode) -> PermissionState;
}

/// Default authority: derives permission from filesystem metadata.
pub struct ProbeAuthority;

#[async_trait]
impl PermissionAuthority for ProbeAuthority {
    async fn probe(&self, path: &Path, mode: PermissionMode) -> PermissionState {
        match std::fs::metadata(path) {
            Ok(meta) => match mode {
                PermissionMode::Read => PermissionState::Granted,
                PermissionMode::ReadWrite => {
                    if meta.permissions().readonly() {
                        PermissionState::Denied
                    } else {
                        PermissionState::Granted
                    }
                }
            },
            // A missing file is a NotFound problem, not a permission problem.
            Err(e) if e.kind() == ErrorKind::NotFound => PermissionState::Granted,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => PermissionState::Denied,
            Err(_) => PermissionState::Prompt,
        }
    }

    async fn request(&self, path: &Path, mode: PermissionMode) -> PermissionState {
        self.probe(path, mode).await
    }
}

/// The capability handle: the file it grants access to plus the recorded
/// permission state per mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileHandle {
    pub path: PathBuf,
    pub read: PermissionState,
    pub write: PermissionState,
}

impl FileHandle {
    fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// Side store persisting the handle record under a constant file name.
struct HandleStore {
    record_path: PathBuf,
}

impl HandleStore {
    fn new(state_dir: &Path) -> Self {
        Self {
            record_path: state_dir.join(HANDLE_RECORD_FILE),
        }
    }

    fn load(&self) -> Option<FileHandle> {
        let text = match std::fs::read_to_string(&self.record_path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("could not read persisted file handle: {e}");
                return None;
            }
        };
        match toml::from_str(&text) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("persisted file handle record is unreadable: {e}");
                None
            }
        }
    }

    fn store(&self, handle: &FileHandle) -> Result<()> {
        if let Some(parent) = self.record_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(handle)
            .map_err(|e| StorageError::Credential(format!("handle record: {e}")))?;
        std::fs::write(&self.record_path, text)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.record_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct FileSystemAdapter {
    handles: HandleStore,
    authority: Box<dyn PermissionAuthority>,
    handle: Option<FileHandle>,
}

impl FileSystemAdapter {
    /// An adapter persisting its handle record under `state_dir`, using the
    /// filesystem-probing authority.
    pub fn new(state_dir: &Path) -> Self {
        Self::with_authority(state_dir, Box::new(ProbeAuthority))
    }

    pub fn with_authority(state_dir: &Path, authority: Box<dyn PermissionAuthority>) -> Self {
        Self {
            handles: HandleStore::new(state_dir),
            authority,
            handle: None,
        }
    }

    pub fn has_file_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn file_name(&self) -> Option<String> {
        self.handle.as_ref().and_then(FileHandle::file_name)
    }

    /// Current permission states without prompting anyone.
    pub fn permission_state(&self) -> Option<(PermissionState, PermissionState)> {
        self.handle.as_ref().map(|h| (h.read, h.write))
    }

    /// Install a handle to a file that is about to be created. No data is
    /// written here; the adapter switch performs the first save so the
    /// dataset is written exactly once.
    pub fn create_new_file(&mut self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let handle = FileHandle {
            path,
            read: PermissionState::Granted,
            write: PermissionState::Granted,
        };
        self.handles.store(&handle)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Install a handle to an existing file the user picked.
    pub async fn open_existing_file(&mut self, path: PathBuf) -> Result<()> {
        if !path.exists() {
            return Err(StorageError::NotFound);
        }
        let write = self.authority.probe(&path, PermissionMode::ReadWrite).await;
        let handle = FileHandle {
            path,
            // Picking the file is itself the read grant.
            read: PermissionState::Granted,
            write,
        };
        self.handles.store(&handle)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Resolve a `prompt` permission state. MUST be called from a
    /// user-initiated input event; `load`/`save` never come here on their own.
    pub async fn request_permission_from_gesture(
        &mut self,
        mode: PermissionMode,
    ) -> Result<PermissionState> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| StorageError::NotConfigured("no file selected".into()))?;
        let state = self.authority.request(&handle.path, mode).await;
        match mode {
            PermissionMode::Read => handle.read = state,
            PermissionMode::ReadWrite => {
                handle.write = state;
                // A readwrite grant covers reading as well.
                if state == PermissionState::Granted {
                    handle.read = PermissionState::Granted;
                }
            }
        }
        self.handles.store(handle)?;
        Ok(state)
    }

    /// Drop the handle and its persisted record.
    pub fn close_file(&mut self) -> Result<()> {
        self.handle = None;
        self.handles.clear()
    }

    fn handle(&self) -> Result<&FileHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| StorageError::NotConfigured("no file selected".into()))
    }
}

impl StorageAdapter for FileSystemAdapter {
    fn mode(&self) -> StorageMode {
        StorageMode::Filesystem
    }

    fn name(&self) -> String {
        match self.file_name() {
            Some(name) => format!("File: {name}"),
            None => "Filesystem (not configured)".to_string(),
        }
    }

    async fn can_use(&self) -> bool {
        true
    }

    async fn init(&mut self) -> Result<InitOutcome> {
        if self.handle.is_none() {
            let Some(mut restored) = self.handles.load() else {
                return Ok(InitOutcome::NeedsConfiguration);
            };
            // Re-probe: permissions may have changed since the record was
            // written.
            restored.read = self
                .authority
                .probe(&restored.path, PermissionMode::Read)
                .await;
            restored.write = self
                .authority
                .probe(&restored.path, PermissionMode::ReadWrite)
                .await;

            if restored.read == PermissionState::Denied {
                // Keep the record so a later grant can revive it, but do not
                // install a handle we are forbidden to read.
                return Ok(InitOutcome::PermissionRequired {
                    read: restored.read,
                    write: restored.write,
                    file_name: restored.file_name(),
                });
            }
            self.handle = Some(restored);
        }

        let handle = self.handle()?;
        if handle.read == PermissionState::Granted && handle.write == PermissionState::Granted {
            Ok(InitOutcome::Ready)
        } else {
            Ok(InitOutcome::PermissionRequired {
                read: handle.read,
                write: handle.write,
                file_name: handle.file_name(),
            })
        }
    }

    async fn load(&self) -> Result<Dataset> {
        let handle = self.handle()?;
        if handle.read != PermissionState::Granted {
            return Err(StorageError::PermissionDenied {
                mode: PermissionMode::Read,
            });
        }

        let content = match std::fs::read_to_string(&handle.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(StorageError::PermissionDenied {
                    mode: PermissionMode::Read,
                })
            }
            Err(e) => return Err(e.into()),
        };

        // A zero-byte file was created but never written: that is "empty",
        // not "corrupt".
        if content.trim().is_empty() {
            return Ok(Dataset::empty());
        }

        debug!(bytes = content.len(), "loaded data file");
        serde_json::from_str(&content).map_err(|_| StorageError::InvalidFormat)
    }

    async fn save(&self, data: &mut Dataset) -> Result<()> {
        let handle = self.handle()?;
        if handle.write != PermissionState::Granted {
            return Err(StorageError::PermissionDenied {
                mode: PermissionMode::ReadWrite,
            });
        }

        data.last_modified = Utc::now();
        let document = data.to_document().map_err(|_| StorageError::InvalidFormat)?;
        match std::fs::write(&handle.path, document) {
            Ok(()) => {
                debug!(
                    meters = data.meters.len(),
                    readings = data.readings.len(),
                    "data file save completed"
                );
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                Err(StorageError::PermissionDenied {
                    mode: PermissionMode::ReadWrite,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Authority answering from a script instead of the filesystem.
    struct Scripted {
        probe: Mutex<Vec<(PermissionMode, PermissionState)>>,
        request: Mutex<Vec<(PermissionMode, PermissionState)>>,
    }

    impl Scripted {
        fn new(
            probe: Vec<(PermissionMode, PermissionState)>,
            request: Vec<(PermissionMode, PermissionState)>,
        ) -> Self {
            Self {
                probe: Mutex::new(probe),
                request: Mutex::new(request),
            }
        }
    }

    #[async_trait]
    impl PermissionAuthority for Scripted {
        async fn probe(&self, _path: &Path, mode: PermissionMode) -> PermissionState {
            let mut script = self.probe.lock().unwrap();
            let at = script
                .iter()
                .position(|(m, _)| *m == mode)
                .expect("unscripted probe");
            script.remove(at).1
        }

        async fn request(&self, _path: &Path, mode: PermissionMode) -> PermissionState {
            let mut script = self.request.lock().unwrap();
            let at = script
                .iter()
                .position(|(m, _)| *m == mode)
                .expect("unscripted request");
            script.remove(at).1
        }
    }

    #[tokio::test]
    async fn test_unconfigured_adapter_reports_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter = FileSystemAdapter::new(dir.path());

        assert_eq!(
            adapter.init().await.unwrap(),
            InitOutcome::NeedsConfiguration
        );
        assert!(matches!(
            adapter.load().await,
            Err(StorageError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_survives_adapter_restart() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.json");

        let mut adapter = FileSystemAdapter::new(dir.path());
        adapter.create_new_file(file.clone()).unwrap();
        let mut data = Dataset::empty();
        adapter.save(&mut data).await.unwrap();

        // New instance, same state dir: the handle is restored from the record.
        let mut restarted = FileSystemAdapter::new(dir.path());
        assert_eq!(restarted.init().await.unwrap(), InitOutcome::Ready);
        assert_eq!(restarted.load().await.unwrap(), data);
        assert_eq!(restarted.name(), "File: data.json");
    }

    #[tokio::test]
    async fn test_load_translates_deleted_file_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.json");

        let mut adapter = FileSystemAdapter::new(dir.path());
        adapter.create_new_file(file.clone()).unwrap();
        let mut data = Dataset::empty();
        adapter.save(&mut data).await.unwrap();

        std::fs::remove_file(&file).unwrap();
        assert!(matches!(adapter.load().await, Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn test_never_written_file_loads_empty_template() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.json");
        std::fs::write(&file, "").unwrap();

        let mut adapter = FileSystemAdapter::new(dir.path());
        adapter.open_existing_file(file).await.unwrap();
        assert!(!adapter.load().await.unwrap().has_user_data());
    }

    #[tokio::test]
    async fn test_save_without_write_grant_is_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.json");
        std::fs::write(&file, "").unwrap();

        let authority = Scripted::new(
            vec![(PermissionMode::ReadWrite, PermissionState::Prompt)],
            vec![],
        );
        let mut adapter = FileSystemAdapter::with_authority(dir.path(), Box::new(authority));
        adapter.open_existing_file(file).await.unwrap();

        let mut data = Dataset::empty();
        assert!(matches!(
            adapter.save(&mut data).await,
            Err(StorageError::PermissionDenied {
                mode: PermissionMode::ReadWrite
            })
        ));
        // load is still fine: picking the file granted read.
        adapter.load().await.unwrap();
    }

    #[tokio::test]
    async fn test_gesture_request_resolves_prompt_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.json");
        std::fs::write(&file, "").unwrap();

        let authority = Scripted::new(
            vec![(PermissionMode::ReadWrite, PermissionState::Prompt)],
            vec![(PermissionMode::ReadWrite, PermissionState::Granted)],
        );
        let mut adapter = FileSystemAdapter::with_authority(dir.path(), Box::new(authority));
        adapter.open_existing_file(file).await.unwrap();

        let state = adapter
            .request_permission_from_gesture(PermissionMode::ReadWrite)
            .await
            .unwrap();
        assert_eq!(state, PermissionState::Granted);

        let mut data = Dataset::empty();
        adapter.save(&mut data).await.unwrap();

        // The grant was persisted into the record.
        let record = adapter.handles.load().unwrap();
        assert_eq!(record.write, PermissionState::Granted);
    }

    #[tokio::test]
    async fn test_denied_read_on_restore_withholds_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.json");
        std::fs::write(&file, "").unwrap();

        {
            let mut adapter = FileSystemAdapter::new(dir.path());
            adapter.open_existing_file(file).await.unwrap();
        }

        let authority = Scripted::new(
            vec![
                (PermissionMode::Read, PermissionState::Denied),
                (PermissionMode::ReadWrite, PermissionState::Denied),
            ],
            vec![],
        );
        let mut adapter = FileSystemAdapter::with_authority(dir.path(), Box::new(authority));
        match adapter.init().await.unwrap() {
            InitOutcome::PermissionRequired { read, .. } => {
                assert_eq!(read, PermissionState::Denied)
            }
            other => panic!("expected PermissionRequired, got {other:?}"),
        }
        assert!(!adapter.has_file_handle());
    }

    #[tokio::test]
    async fn test_close_file_clears_handle_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.json");

        let mut adapter = FileSystemAdapter::new(dir.path());
        adapter.create_new_file(file).unwrap();
        adapter.close_file().unwrap();

        assert!(!adapter.has_file_handle());
        let mut restarted = FileSystemAdapter::new(dir.path());
        assert_eq!(
            restarted.init().await.unwrap(),
            InitOutcome::NeedsConfiguration
        );
    }
}
