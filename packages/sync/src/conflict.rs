//! # Conflict and recovery orchestration
//!
//! Two situations suspend normal flow until a user decides:
//!
//! - **Cross-backend divergence**: switching to a backend that already holds
//!   a non-empty dataset while the in-memory copy is non-empty too. The
//!   resolution is coarse, whole-dataset: keep local (migrate over the
//!   remote) or keep remote (reload over local). No field-level merge.
//! - **Missing file**: a persisted filesystem handle whose file no longer
//!   exists. The user picks a replacement file, creates a new one at a fresh
//!   location, or abandons the file backend and stays on the local fallback.
//!
//! A pending decision is an explicit request/response pair: the coordinator
//! sends the payload with a `oneshot` responder over its decision channel
//! and awaits the answer. Dropping the responder cancels the flow, so an
//! abandoned dialog leaves the system exactly where it was. Either way the
//! flow ends in a single consistent state: one active backend, the mode
//! stamp matching it, and the unchosen side's store untouched.

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use store::{Backend, Dataset, FileSystemAdapter, Result, StorageAdapter};

use crate::manager::DataManager;

/// Answer to a cross-backend divergence prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Push the local dataset, overwriting the remote copy.
    KeepLocal,
    /// Pull the remote dataset, overwriting the local copy.
    KeepRemote,
    Cancel,
}

/// Answer to a missing-file prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryChoice {
    /// Reload from an existing replacement file.
    PickReplacement(PathBuf),
    /// Create a new file there and push the current in-memory data into it.
    CreateNew(PathBuf),
    /// Stay on the local-database fallback.
    Abandon,
}

/// A divergence prompt: both copies, plus the responder the UI resolves.
pub struct CloudConflict {
    pub local: Dataset,
    pub remote: Dataset,
    respond: oneshot::Sender<ConflictChoice>,
}

impl CloudConflict {
    pub fn resolve(self, choice: ConflictChoice) {
        let _ = self.respond.send(choice);
    }
}

/// A missing-file prompt.
pub struct MissingFile {
    pub file_name: Option<String>,
    respond: oneshot::Sender<RecoveryChoice>,
}

impl MissingFile {
    pub fn resolve(self, choice: RecoveryChoice) {
        let _ = self.respond.send(choice);
    }
}

/// Decisions the coordinator is waiting on. The UI owns the receiving end
/// of the channel and resolves each prompt exactly once.
pub enum PendingDecision {
    CloudConflict(CloudConflict),
    MissingFile(MissingFile),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Local data won and was pushed to the new backend.
    MigratedLocal,
    /// The remote copy won and was adopted locally.
    AdoptedRemote,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    ReplacementLoaded,
    NewFileCreated,
    Abandoned,
}

pub struct SyncCoordinator {
    manager: DataManager,
    decisions: mpsc::Sender<PendingDecision>,
}

impl SyncCoordinator {
    pub fn new(manager: DataManager, decisions: mpsc::Sender<PendingDecision>) -> Self {
        Self { manager, decisions }
    }

    pub fn manager(&self) -> &DataManager {
        &self.manager
    }

    /// Switch to a remote backend that may already hold data.
    ///
    /// Both sides non-empty raises a [`CloudConflict`] and blocks on the
    /// answer. Remote-only data is adopted; otherwise the local dataset is
    /// migrated over. The adapter is initialized here, so the switch runs
    /// with `skip_init`.
    pub async fn switch_to_cloud(&self, mut target: Backend) -> Result<SwitchOutcome> {
        target.init().await?;
        let remote = target.load().await?;
        let local = self.manager.snapshot();

        match (local.has_user_data(), remote.has_user_data()) {
            (true, true) => {
                debug!("both local and remote datasets hold data, asking the user");
                let (respond, answer) = oneshot::channel();
                let prompt = CloudConflict {
                    local,
                    remote,
                    respond,
                };
                if self
                    .decisions
                    .send(PendingDecision::CloudConflict(prompt))
                    .await
                    .is_err()
                {
                    warn!("nobody listens for pending decisions, cancelling switch");
                    return Ok(SwitchOutcome::Cancelled);
                }
                match answer.await {
                    Ok(ConflictChoice::KeepLocal) => {
                        self.manager.switch_adapter(target, false, true).await?;
                        Ok(SwitchOutcome::MigratedLocal)
                    }
                    Ok(ConflictChoice::KeepRemote) => {
                        self.manager.switch_adapter(target, true, true).await?;
                        Ok(SwitchOutcome::AdoptedRemote)
                    }
                    Ok(ConflictChoice::Cancel) | Err(_) => Ok(SwitchOutcome::Cancelled),
                }
            }
            (false, true) => {
                // Remote has data, local is empty: adopt the remote copy.
                self.manager.switch_adapter(target, true, true).await?;
                Ok(SwitchOutcome::AdoptedRemote)
            }
            _ => {
                // Local has data, or both are empty: push local over.
                self.manager.switch_adapter(target, false, true).await?;
                Ok(SwitchOutcome::MigratedLocal)
            }
        }
    }

    /// Run the missing-file protocol after a filesystem backend reported its
    /// file gone. The manager is expected to be on the local fallback
    /// already; whatever the user decides, exactly one backend is active
    /// afterwards and the mode stamp matches it.
    pub async fn recover_missing_file(
        &self,
        mut adapter: FileSystemAdapter,
    ) -> Result<RecoveryOutcome> {
        let (respond, answer) = oneshot::channel();
        let prompt = MissingFile {
            file_name: adapter.file_name(),
            respond,
        };
        if self
            .decisions
            .send(PendingDecision::MissingFile(prompt))
            .await
            .is_err()
        {
            warn!("nobody listens for pending decisions, abandoning file backend");
            adapter.close_file()?;
            return Ok(RecoveryOutcome::Abandoned);
        }

        match answer.await {
            Ok(RecoveryChoice::PickReplacement(path)) => {
                adapter.open_existing_file(path).await?;
                self.manager
                    .switch_adapter(Backend::File(adapter), true, true)
                    .await?;
                Ok(RecoveryOutcome::ReplacementLoaded)
            }
            Ok(RecoveryChoice::CreateNew(path)) => {
                adapter.create_new_file(path)?;
                self.manager
                    .switch_adapter(Backend::File(adapter), false, true)
                    .await?;
                Ok(RecoveryOutcome::NewFileCreated)
            }
            Ok(RecoveryChoice::Abandon) | Err(_) => {
                adapter.close_file()?;
                Ok(RecoveryOutcome::Abandoned)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::NewMeter;
    use store::{MemoryAdapter, StorageMode};

    fn dataset_with_meter(name: &str) -> Dataset {
        let mut data = Dataset::empty();
        let type_id = uuid::Uuid::new_v4();
        data.meter_types.push(store::MeterType {
            id: type_id,
            name: "Water".into(),
            unit: "m³".into(),
            icon: "💧".into(),
            created_at: chrono::Utc::now(),
        });
        data.meters.push(store::Meter {
            id: uuid::Uuid::new_v4(),
            name: name.into(),
            type_id,
            meter_number: String::new(),
            location: String::new(),
            is_continuous: true,
            group_id: None,
            tariff_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        });
        data
    }

    async fn manager_with_local_data() -> (DataManager, MemoryAdapter) {
        let local = MemoryAdapter::preloaded(StorageMode::Local, dataset_with_meter("Local meter"));
        let manager = DataManager::new(Backend::Memory(local.clone()));
        manager.init().await.unwrap();
        (manager, local)
    }

    fn answer_with(choice: ConflictChoice) -> mpsc::Sender<PendingDecision> {
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(decision) = rx.recv().await {
                match decision {
                    PendingDecision::CloudConflict(prompt) => prompt.resolve(choice),
                    PendingDecision::MissingFile(prompt) => {
                        prompt.resolve(RecoveryChoice::Abandon)
                    }
                }
            }
        });
        tx
    }

    #[tokio::test]
    async fn test_keep_local_pushes_over_remote() {
        let (manager, _) = manager_with_local_data().await;
        let cloud =
            MemoryAdapter::preloaded(StorageMode::Cloud, dataset_with_meter("Cloud meter"));
        let coordinator = SyncCoordinator::new(manager, answer_with(ConflictChoice::KeepLocal));

        let outcome = coordinator
            .switch_to_cloud(Backend::Memory(cloud.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, SwitchOutcome::MigratedLocal);
        let pushed = cloud.contents().unwrap();
        assert_eq!(pushed.meters[0].name, "Local meter");
        assert_eq!(pushed.settings.storage_mode, StorageMode::Cloud);
        assert_eq!(
            coordinator.manager().snapshot().settings.storage_mode,
            StorageMode::Cloud
        );
    }

    #[tokio::test]
    async fn test_keep_remote_adopts_cloud_copy() {
        let (manager, _) = manager_with_local_data().await;
        let cloud =
            MemoryAdapter::preloaded(StorageMode::Cloud, dataset_with_meter("Cloud meter"));
        let coordinator = SyncCoordinator::new(manager, answer_with(ConflictChoice::KeepRemote));

        let outcome = coordinator
            .switch_to_cloud(Backend::Memory(cloud.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, SwitchOutcome::AdoptedRemote);
        let adopted = coordinator.manager().snapshot();
        assert_eq!(adopted.meters[0].name, "Cloud meter");
        assert_eq!(adopted.settings.storage_mode, StorageMode::Cloud);
    }

    #[tokio::test]
    async fn test_cancel_leaves_both_sides_untouched() {
        let (manager, local) = manager_with_local_data().await;
        let remote = dataset_with_meter("Cloud meter");
        let cloud = MemoryAdapter::preloaded(StorageMode::Cloud, remote.clone());
        let coordinator = SyncCoordinator::new(manager, answer_with(ConflictChoice::Cancel));

        let outcome = coordinator
            .switch_to_cloud(Backend::Memory(cloud.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, SwitchOutcome::Cancelled);
        assert_eq!(
            coordinator.manager().snapshot().meters[0].name,
            "Local meter"
        );
        assert_eq!(
            coordinator.manager().snapshot().settings.storage_mode,
            StorageMode::Local
        );
        assert_eq!(cloud.contents().unwrap().meters[0].name, "Cloud meter");
        assert_eq!(local.contents().unwrap().meters[0].name, "Local meter");
    }

    #[tokio::test]
    async fn test_dropped_responder_counts_as_cancel() {
        let (manager, _) = manager_with_local_data().await;
        let cloud =
            MemoryAdapter::preloaded(StorageMode::Cloud, dataset_with_meter("Cloud meter"));

        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(async move {
            // Dismiss the dialog: drop the prompt without answering.
            let _ = rx.recv().await;
        });
        let coordinator = SyncCoordinator::new(manager, tx);

        let outcome = coordinator
            .switch_to_cloud(Backend::Memory(cloud))
            .await
            .unwrap();
        assert_eq!(outcome, SwitchOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_remote_only_data_is_adopted_without_prompt() {
        let local = MemoryAdapter::with_mode(StorageMode::Local);
        let manager = DataManager::new(Backend::Memory(local));
        manager.init().await.unwrap();

        let cloud =
            MemoryAdapter::preloaded(StorageMode::Cloud, dataset_with_meter("Cloud meter"));
        // No responder task: a prompt would hang the test.
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let coordinator = SyncCoordinator::new(manager, tx);

        let outcome = coordinator
            .switch_to_cloud(Backend::Memory(cloud))
            .await
            .unwrap();
        assert_eq!(outcome, SwitchOutcome::AdoptedRemote);
        assert_eq!(
            coordinator.manager().snapshot().meters[0].name,
            "Cloud meter"
        );
    }

    #[tokio::test]
    async fn test_local_only_data_is_migrated_without_prompt() {
        let (manager, _) = manager_with_local_data().await;
        let cloud = MemoryAdapter::with_mode(StorageMode::Cloud);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let coordinator = SyncCoordinator::new(manager, tx);

        let outcome = coordinator
            .switch_to_cloud(Backend::Memory(cloud.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, SwitchOutcome::MigratedLocal);
        assert_eq!(cloud.contents().unwrap().meters[0].name, "Local meter");
    }

    fn answer_recovery(choice: RecoveryChoice) -> mpsc::Sender<PendingDecision> {
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(decision) = rx.recv().await {
                if let PendingDecision::MissingFile(prompt) = decision {
                    prompt.resolve(choice.clone());
                }
            }
        });
        tx
    }

    /// A filesystem adapter whose persisted handle points at a deleted file.
    async fn orphaned_adapter(state_dir: &std::path::Path) -> FileSystemAdapter {
        let file = state_dir.join("meter-data.json");
        let mut adapter = FileSystemAdapter::new(state_dir);
        adapter.create_new_file(file.clone()).unwrap();
        let mut gone = dataset_with_meter("Vanished meter");
        adapter.save(&mut gone).await.unwrap();
        std::fs::remove_file(&file).unwrap();
        assert!(matches!(
            adapter.load().await,
            Err(store::StorageError::NotFound)
        ));
        adapter
    }

    #[tokio::test]
    async fn test_recovery_pick_replacement_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager_with_local_data().await;
        let adapter = orphaned_adapter(dir.path()).await;

        let replacement = dir.path().join("replacement.json");
        let replacement_data = dataset_with_meter("Replacement meter");
        std::fs::write(&replacement, replacement_data.to_document().unwrap()).unwrap();

        let coordinator = SyncCoordinator::new(
            manager,
            answer_recovery(RecoveryChoice::PickReplacement(replacement)),
        );
        let outcome = coordinator.recover_missing_file(adapter).await.unwrap();

        assert_eq!(outcome, RecoveryOutcome::ReplacementLoaded);
        let adopted = coordinator.manager().snapshot();
        assert_eq!(adopted.meters[0].name, "Replacement meter");
        assert_eq!(adopted.settings.storage_mode, StorageMode::Filesystem);
    }

    #[tokio::test]
    async fn test_recovery_create_new_migrates_current_data() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager_with_local_data().await;
        let adapter = orphaned_adapter(dir.path()).await;

        let fresh = dir.path().join("fresh.json");
        let coordinator = SyncCoordinator::new(
            manager,
            answer_recovery(RecoveryChoice::CreateNew(fresh.clone())),
        );
        let outcome = coordinator.recover_missing_file(adapter).await.unwrap();

        assert_eq!(outcome, RecoveryOutcome::NewFileCreated);
        let written: Dataset =
            serde_json::from_str(&std::fs::read_to_string(&fresh).unwrap()).unwrap();
        assert_eq!(written.meters[0].name, "Local meter");
        assert_eq!(written.settings.storage_mode, StorageMode::Filesystem);
    }

    #[tokio::test]
    async fn test_recovery_abandon_stays_on_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager_with_local_data().await;
        let adapter = orphaned_adapter(dir.path()).await;

        let coordinator =
            SyncCoordinator::new(manager, answer_recovery(RecoveryChoice::Abandon));
        let outcome = coordinator
            .recover_missing_file(adapter)
            .await
            .unwrap();

        assert_eq!(outcome, RecoveryOutcome::Abandoned);
        let snapshot = coordinator.manager().snapshot();
        assert_eq!(snapshot.meters[0].name, "Local meter");
        assert_eq!(snapshot.settings.storage_mode, StorageMode::Local);
        assert_eq!(coordinator.manager().active_mode().await, StorageMode::Local);
    }

    #[tokio::test]
    async fn test_keep_local_keeps_working_through_the_manager() {
        // After a migrate the manager still mutates and autosaves onto the
        // new backend.
        let (manager, _) = manager_with_local_data().await;
        let cloud = MemoryAdapter::with_mode(StorageMode::Cloud);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let coordinator = SyncCoordinator::new(manager.clone(), tx);
        coordinator
            .switch_to_cloud(Backend::Memory(cloud.clone()))
            .await
            .unwrap();

        let type_id = manager.meter_types()[0].id;
        manager
            .add_meter(NewMeter::named("New after switch", type_id))
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;

        let stored = cloud.contents().unwrap();
        assert_eq!(stored.meters.len(), 2);
    }
}
