//! # DataManager, the sync coordination core
//!
//! Owns the in-memory [`Dataset`] and the active [`Backend`], and funnels
//! every mutation through itself: UI code edits entities here, never on the
//! dataset directly, and adapters only ever see a deep copy at save time.
//!
//! ## Autosave
//!
//! Every mutation schedules a debounced save: a 100 ms timer that each new
//! mutation resets, so bursts of edits coalesce into one write while the
//! data-loss window stays small. [`DataManager::save_now`] is the
//! non-debounced primitive underneath; a boolean guard collapses concurrent
//! calls into one in-flight save, relying on the debounce timer to schedule
//! a follow-up that reflects the latest state.
//!
//! ## Permission fallback
//!
//! A save that fails with `PermissionDenied` does not propagate. The current
//! dataset is persisted to the configured local fallback backend, the
//! manager swaps over to it, and a separate permission-error listener set is
//! notified so the UI can ask the user to re-grant access. Data may silently
//! move backend, but it is never silently lost.
//!
//! ## Hot swap
//!
//! [`DataManager::switch_adapter`] supports two mutually exclusive policies:
//! *migrate* (current data wins, pushed onto the new backend) and *reload*
//! (the new backend's copy wins, in-memory data discarded). Any pending
//! autosave is cancelled before the switch so it cannot race the migration
//! snapshot.
//!
//! All methods must run inside a Tokio runtime; the debounce timer is a
//! spawned task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use store::{
    Backend, Dataset, Group, InitOutcome, Meter, MeterType, PermissionMode, Reading, Result,
    Settings, StorageAdapter, StorageError, StorageMode, Tariff,
};

use crate::stats::{
    self, Consumption, CostBreakdown, DateRange, MeterWithType, MonthlySlice,
};

/// Quiet period after the last mutation before the autosave fires.
pub const AUTOSAVE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Handle for unregistering a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Payload for the permission-error listener set: which backend lost which
/// permission before the manager fell back to local storage.
#[derive(Clone, Debug)]
pub struct PermissionFallback {
    pub from: StorageMode,
    pub mode: PermissionMode,
}

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

impl<T> ListenerSet<T> {
    fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    fn add(&mut self, listener: Listener<T>) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, listener));
        ListenerId(id)
    }

    fn remove(&mut self, id: ListenerId) {
        self.entries.retain(|(entry_id, _)| *entry_id != id.0);
    }

    fn notify(&self, value: &T) {
        for (_, listener) in &self.entries {
            listener(value);
        }
    }
}

struct AutosaveTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct ManagerInner {
    backend: tokio::sync::Mutex<Backend>,
    data: Mutex<Dataset>,
    fallback: Mutex<Option<Backend>>,
    autosave: Mutex<AutosaveTimer>,
    saving: AtomicBool,
    listeners: Mutex<ListenerSet<Dataset>>,
    permission_listeners: Mutex<ListenerSet<PermissionFallback>>,
}

#[derive(Clone)]
pub struct DataManager {
    inner: Arc<ManagerInner>,
}

impl DataManager {
    pub fn new(backend: Backend) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                backend: tokio::sync::Mutex::new(backend),
                data: Mutex::new(Dataset::empty()),
                fallback: Mutex::new(None),
                autosave: Mutex::new(AutosaveTimer {
                    generation: 0,
                    handle: None,
                }),
                saving: AtomicBool::new(false),
                listeners: Mutex::new(ListenerSet::new()),
                permission_listeners: Mutex::new(ListenerSet::new()),
            }),
        }
    }

    /// A manager that recovers `PermissionDenied` saves by moving the data
    /// onto `fallback` (normally the local database backend).
    pub fn with_fallback(backend: Backend, fallback: Backend) -> Self {
        let manager = Self::new(backend);
        *manager.inner.fallback.lock().unwrap() = Some(fallback);
        manager
    }

    /// Initialize the active adapter and adopt its stored dataset.
    pub async fn init(&self) -> Result<InitOutcome> {
        let outcome = {
            let mut backend = self.inner.backend.lock().await;
            let outcome = backend.init().await?;
            let data = backend.load().await?;
            *self.inner.data.lock().unwrap() = data;
            outcome
        };
        self.notify_change();
        Ok(outcome)
    }

    // ----- listeners -------------------------------------------------------

    /// Register a change listener. It is called with a snapshot after every
    /// adopted change; the snapshot must be treated as read-only.
    pub fn on_change(&self, listener: impl Fn(&Dataset) + Send + Sync + 'static) -> ListenerId {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .add(Box::new(listener))
    }

    pub fn remove_change_listener(&self, id: ListenerId) {
        self.inner.listeners.lock().unwrap().remove(id);
    }

    /// Register a listener for permission fallbacks (see module docs).
    pub fn on_permission_error(
        &self,
        listener: impl Fn(&PermissionFallback) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner
            .permission_listeners
            .lock()
            .unwrap()
            .add(Box::new(listener))
    }

    pub fn remove_permission_listener(&self, id: ListenerId) {
        self.inner.permission_listeners.lock().unwrap().remove(id);
    }

    fn notify_change(&self) {
        let snapshot = self.snapshot();
        self.inner.listeners.lock().unwrap().notify(&snapshot);
    }

    // ----- saving ----------------------------------------------------------

    fn schedule_autosave(&self) {
        let mut timer = self.inner.autosave.lock().unwrap();
        timer.generation = timer.generation.wrapping_add(1);
        let generation = timer.generation;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }

        let manager = self.clone();
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(AUTOSAVE_DEBOUNCE).await;
            {
                let mut timer = manager.inner.autosave.lock().unwrap();
                if timer.generation != generation {
                    return;
                }
                // Detach before saving so save_now does not abort this task.
                timer.handle = None;
            }
            if let Err(e) = manager.save_now().await {
                error!("autosave failed: {e}");
            }
        }));
    }

    fn cancel_autosave(&self) {
        let mut timer = self.inner.autosave.lock().unwrap();
        timer.generation = timer.generation.wrapping_add(1);
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
    }

    /// Persist immediately, without debouncing. A save already in flight
    /// makes this call a no-op; the debounce timer covers whatever mutation
    /// prompted it.
    pub async fn save_now(&self) -> Result<()> {
        if self.inner.saving.swap(true, Ordering::SeqCst) {
            debug!("save already in progress, skipping");
            return Ok(());
        }
        let result = self.save_now_inner().await;
        self.inner.saving.store(false, Ordering::SeqCst);
        result
    }

    async fn save_now_inner(&self) -> Result<()> {
        self.cancel_autosave();
        let mut copy = self.snapshot();

        let mut backend = self.inner.backend.lock().await;
        match backend.save(&mut copy).await {
            Ok(()) => {
                self.inner.data.lock().unwrap().last_modified = copy.last_modified;
                drop(backend);
                self.notify_change();
                Ok(())
            }
            Err(StorageError::PermissionDenied { mode }) => {
                let fallback = self.inner.fallback.lock().unwrap().take();
                let Some(mut fallback) = fallback else {
                    return Err(StorageError::PermissionDenied { mode });
                };
                let from = backend.mode();
                warn!("{from} backend lost {mode} permission, falling back to local storage");

                fallback.init().await?;
                copy.settings.storage_mode = fallback.mode();
                fallback.save(&mut copy).await?;
                *backend = fallback;

                {
                    let mut data = self.inner.data.lock().unwrap();
                    data.settings.storage_mode = copy.settings.storage_mode;
                    data.last_modified = copy.last_modified;
                }
                drop(backend);

                let event = PermissionFallback { from, mode };
                self.inner
                    .permission_listeners
                    .lock()
                    .unwrap()
                    .notify(&event);
                self.notify_change();
                Ok(())
            }
            Err(e) => {
                error!("save failed: {e}");
                Err(e)
            }
        }
    }

    /// Switch to a different backend.
    ///
    /// With `load_from_new = false` (*migrate*) the current in-memory
    /// dataset wins: it is deep-copied, stamped with the new backend's mode,
    /// saved there, and adopted. Nothing is read from the destination first.
    ///
    /// With `load_from_new = true` (*reload*) the destination wins: the
    /// in-memory dataset is discarded, the new backend's copy is loaded and
    /// stamped, and if the stamp actually changed an autosave persists it.
    ///
    /// `skip_init` lets callers that already initialized the adapter (e.g.
    /// after a permission grant) avoid a redundant `init`.
    pub async fn switch_adapter(
        &self,
        mut new_backend: Backend,
        load_from_new: bool,
        skip_init: bool,
    ) -> Result<()> {
        // The switch captures "current dataset" as its source; a pending
        // autosave must not race that.
        self.cancel_autosave();

        let mut backend = self.inner.backend.lock().await;

        if !skip_init {
            new_backend.init().await?;
        }
        let expected_mode = new_backend.mode();

        if load_from_new {
            let mut loaded = new_backend.load().await?;
            let mode_changed = loaded.settings.storage_mode != expected_mode;
            loaded.settings.storage_mode = expected_mode;

            *self.inner.data.lock().unwrap() = loaded;
            *backend = new_backend;
            drop(backend);

            if mode_changed {
                // Persist the stamp itself.
                self.schedule_autosave();
            }
        } else {
            let mut exported = self.snapshot();
            exported.settings.storage_mode = expected_mode;

            new_backend.save(&mut exported).await?;

            *self.inner.data.lock().unwrap() = exported;
            *backend = new_backend;
            drop(backend);
        }

        debug!(mode = %expected_mode, "switched storage backend");
        self.notify_change();
        Ok(())
    }

    /// Cancel pending work and best-effort flush. Only the local database
    /// can be written synchronously; other backends are skipped, their last
    /// debounced save already having run or being lost with the process.
    pub async fn shutdown(&self) {
        self.cancel_autosave();
        let backend = self.inner.backend.lock().await;
        let mut copy = self.snapshot();
        if let Some(result) = backend.flush_blocking(&mut copy) {
            match result {
                Ok(()) => self.inner.data.lock().unwrap().last_modified = copy.last_modified,
                Err(e) => warn!("shutdown flush failed: {e}"),
            }
        }
    }

    // ----- introspection ---------------------------------------------------

    /// A deep copy of the current dataset.
    pub fn snapshot(&self) -> Dataset {
        self.inner.data.lock().unwrap().clone()
    }

    pub async fn storage_name(&self) -> String {
        self.inner.backend.lock().await.name()
    }

    pub async fn active_mode(&self) -> StorageMode {
        self.inner.backend.lock().await.mode()
    }

    fn read<T>(&self, f: impl FnOnce(&Dataset) -> T) -> T {
        f(&self.inner.data.lock().unwrap())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Dataset) -> Result<T>) -> Result<T> {
        let out = {
            let mut data = self.inner.data.lock().unwrap();
            f(&mut data)?
        };
        self.schedule_autosave();
        Ok(out)
    }

    fn mutate_ok<T>(&self, f: impl FnOnce(&mut Dataset) -> T) -> T {
        let out = {
            let mut data = self.inner.data.lock().unwrap();
            f(&mut data)
        };
        self.schedule_autosave();
        out
    }

    // ----- meter types -----------------------------------------------------

    pub fn add_meter_type(&self, name: &str, unit: &str, icon: &str) -> MeterType {
        let meter_type = MeterType {
            id: Uuid::new_v4(),
            name: name.to_string(),
            unit: unit.to_string(),
            icon: icon.to_string(),
            created_at: Utc::now(),
        };
        let clone = meter_type.clone();
        self.mutate_ok(move |data| data.meter_types.push(meter_type));
        clone
    }

    pub fn update_meter_type(&self, id: Uuid, update: MeterTypeUpdate) -> Result<MeterType> {
        self.mutate(|data| {
            let meter_type = data
                .meter_types
                .iter_mut()
                .find(|mt| mt.id == id)
                .ok_or(StorageError::entity_not_found("meter type", id))?;
            if let Some(name) = update.name {
                meter_type.name = name;
            }
            if let Some(unit) = update.unit {
                meter_type.unit = unit;
            }
            if let Some(icon) = update.icon {
                meter_type.icon = icon;
            }
            Ok(meter_type.clone())
        })
    }

    /// Fails with [`StorageError::InUse`] while any meter still has this type.
    pub fn delete_meter_type(&self, id: Uuid) -> Result<()> {
        self.mutate(|data| {
            if !data.meter_types.iter().any(|mt| mt.id == id) {
                return Err(StorageError::entity_not_found("meter type", id));
            }
            if data.meters.iter().any(|m| m.type_id == id) {
                return Err(StorageError::InUse {
                    kind: "meter type",
                    id,
                });
            }
            data.meter_types.retain(|mt| mt.id != id);
            Ok(())
        })
    }

    pub fn meter_types(&self) -> Vec<MeterType> {
        self.read(|data| data.meter_types.clone())
    }

    // ----- meters ----------------------------------------------------------

    pub fn add_meter(&self, new: NewMeter) -> Result<Meter> {
        self.mutate(|data| {
            if !data.meter_types.iter().any(|mt| mt.id == new.type_id) {
                return Err(StorageError::entity_not_found("meter type", new.type_id));
            }
            if let Some(group_id) = new.group_id {
                if !data.groups.iter().any(|g| g.id == group_id) {
                    return Err(StorageError::entity_not_found("group", group_id));
                }
            }
            if let Some(tariff_id) = new.tariff_id {
                if !data.tariffs.iter().any(|t| t.id == tariff_id) {
                    return Err(StorageError::entity_not_found("tariff", tariff_id));
                }
            }

            let now = Utc::now();
            let meter = Meter {
                id: Uuid::new_v4(),
                name: new.name,
                type_id: new.type_id,
                meter_number: new.meter_number,
                location: new.location,
                is_continuous: new.is_continuous,
                group_id: new.group_id,
                tariff_id: new.tariff_id,
                created_at: now,
                updated_at: now,
            };
            data.meters.push(meter.clone());
            Ok(meter)
        })
    }

    pub fn update_meter(&self, id: Uuid, update: MeterUpdate) -> Result<Meter> {
        self.mutate(|data| {
            if let Some(type_id) = update.type_id {
                if !data.meter_types.iter().any(|mt| mt.id == type_id) {
                    return Err(StorageError::entity_not_found("meter type", type_id));
                }
            }
            if let Some(Some(group_id)) = update.group_id {
                if !data.groups.iter().any(|g| g.id == group_id) {
                    return Err(StorageError::entity_not_found("group", group_id));
                }
            }
            if let Some(Some(tariff_id)) = update.tariff_id {
                if !data.tariffs.iter().any(|t| t.id == tariff_id) {
                    return Err(StorageError::entity_not_found("tariff", tariff_id));
                }
            }

            let meter = data
                .meters
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(StorageError::entity_not_found("meter", id))?;
            if let Some(name) = update.name {
                meter.name = name;
            }
            if let Some(type_id) = update.type_id {
                meter.type_id = type_id;
            }
            if let Some(meter_number) = update.meter_number {
                meter.meter_number = meter_number;
            }
            if let Some(location) = update.location {
                meter.location = location;
            }
            if let Some(is_continuous) = update.is_continuous {
                meter.is_continuous = is_continuous;
            }
            if let Some(group_id) = update.group_id {
                meter.group_id = group_id;
            }
            if let Some(tariff_id) = update.tariff_id {
                meter.tariff_id = tariff_id;
            }
            meter.updated_at = Utc::now();
            Ok(meter.clone())
        })
    }

    /// Deletes the meter and, with it, every one of its readings.
    pub fn delete_meter(&self, id: Uuid) -> Result<()> {
        self.mutate(|data| {
            if !data.meters.iter().any(|m| m.id == id) {
                return Err(StorageError::entity_not_found("meter", id));
            }
            data.meters.retain(|m| m.id != id);
            data.readings.retain(|r| r.meter_id != id);
            Ok(())
        })
    }

    pub fn meters(&self) -> Vec<Meter> {
        self.read(|data| data.meters.clone())
    }

    pub fn meter(&self, id: Uuid) -> Option<Meter> {
        self.read(|data| data.meters.iter().find(|m| m.id == id).cloned())
    }

    pub fn meter_with_type(&self, id: Uuid) -> Option<MeterWithType> {
        self.read(|data| {
            let meter = data.meters.iter().find(|m| m.id == id)?.clone();
            let meter_type = data
                .meter_types
                .iter()
                .find(|mt| mt.id == meter.type_id)
                .cloned();
            Some(MeterWithType { meter, meter_type })
        })
    }

    pub fn meters_with_types(&self) -> Vec<MeterWithType> {
        self.read(stats::meters_with_types)
    }

    // ----- readings --------------------------------------------------------

    pub fn add_reading(&self, new: NewReading) -> Result<Reading> {
        self.mutate(|data| {
            if !data.meters.iter().any(|m| m.id == new.meter_id) {
                return Err(StorageError::entity_not_found("meter", new.meter_id));
            }
            let reading = Reading {
                id: Uuid::new_v4(),
                meter_id: new.meter_id,
                value: new.value,
                timestamp: new.timestamp.unwrap_or_else(Utc::now),
                note: new.note,
                photo: new.photo,
            };
            data.readings.push(reading.clone());
            Ok(reading)
        })
    }

    pub fn update_reading(&self, id: Uuid, update: ReadingUpdate) -> Result<Reading> {
        self.mutate(|data| {
            let reading = data
                .readings
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(StorageError::entity_not_found("reading", id))?;
            if let Some(value) = update.value {
                reading.value = value;
            }
            if let Some(timestamp) = update.timestamp {
                reading.timestamp = timestamp;
            }
            if let Some(note) = update.note {
                reading.note = note;
            }
            if let Some(photo) = update.photo {
                reading.photo = photo;
            }
            Ok(reading.clone())
        })
    }

    pub fn delete_reading(&self, id: Uuid) -> Result<()> {
        self.mutate(|data| {
            if !data.readings.iter().any(|r| r.id == id) {
                return Err(StorageError::entity_not_found("reading", id));
            }
            data.readings.retain(|r| r.id != id);
            Ok(())
        })
    }

    /// All readings of one meter, sorted by timestamp ascending.
    pub fn readings_for_meter(&self, meter_id: Uuid) -> Vec<Reading> {
        self.read(|data| stats::readings_for_meter(data, meter_id))
    }

    pub fn latest_reading(&self, meter_id: Uuid) -> Option<Reading> {
        self.read(|data| stats::latest_reading(data, meter_id))
    }

    // ----- groups ----------------------------------------------------------

    pub fn add_group(&self, name: &str, description: &str, icon: &str, color: &str) -> Group {
        let group = Group {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            icon: icon.to_string(),
            color: color.to_string(),
            created_at: Utc::now(),
        };
        let clone = group.clone();
        self.mutate_ok(move |data| data.groups.push(group));
        clone
    }

    pub fn update_group(&self, id: Uuid, update: GroupUpdate) -> Result<Group> {
        self.mutate(|data| {
            let group = data
                .groups
                .iter_mut()
                .find(|g| g.id == id)
                .ok_or(StorageError::entity_not_found("group", id))?;
            if let Some(name) = update.name {
                group.name = name;
            }
            if let Some(description) = update.description {
                group.description = description;
            }
            if let Some(icon) = update.icon {
                group.icon = icon;
            }
            if let Some(color) = update.color {
                group.color = color;
            }
            Ok(group.clone())
        })
    }

    /// Meters in the group are unlinked, never deleted.
    pub fn delete_group(&self, id: Uuid) -> Result<()> {
        self.mutate(|data| {
            if !data.groups.iter().any(|g| g.id == id) {
                return Err(StorageError::entity_not_found("group", id));
            }
            for meter in data.meters.iter_mut().filter(|m| m.group_id == Some(id)) {
                meter.group_id = None;
            }
            data.groups.retain(|g| g.id != id);
            Ok(())
        })
    }

    pub fn groups(&self) -> Vec<Group> {
        self.read(|data| data.groups.clone())
    }

    pub fn meters_in_group(&self, group_id: Uuid) -> Vec<Meter> {
        self.read(|data| stats::meters_in_group(data, group_id))
    }

    pub fn ungrouped_meters(&self) -> Vec<Meter> {
        self.read(stats::ungrouped_meters)
    }

    // ----- tariffs ---------------------------------------------------------

    pub fn add_tariff(&self, new: NewTariff) -> Result<Tariff> {
        self.mutate(|data| {
            if !data
                .meter_types
                .iter()
                .any(|mt| mt.id == new.meter_type_id)
            {
                return Err(StorageError::entity_not_found(
                    "meter type",
                    new.meter_type_id,
                ));
            }
            let tariff = Tariff {
                id: Uuid::new_v4(),
                name: new.name,
                meter_type_id: new.meter_type_id,
                price_per_unit: new.price_per_unit,
                base_charge: new.base_charge,
                valid_from: new.valid_from.unwrap_or_else(|| Utc::now().date_naive()),
                valid_to: new.valid_to,
                created_at: Utc::now(),
            };
            data.tariffs.push(tariff.clone());
            Ok(tariff)
        })
    }

    pub fn update_tariff(&self, id: Uuid, update: TariffUpdate) -> Result<Tariff> {
        self.mutate(|data| {
            let tariff = data
                .tariffs
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(StorageError::entity_not_found("tariff", id))?;
            if let Some(name) = update.name {
                tariff.name = name;
            }
            if let Some(price_per_unit) = update.price_per_unit {
                tariff.price_per_unit = price_per_unit;
            }
            if let Some(base_charge) = update.base_charge {
                tariff.base_charge = base_charge;
            }
            if let Some(valid_from) = update.valid_from {
                tariff.valid_from = valid_from;
            }
            if let Some(valid_to) = update.valid_to {
                tariff.valid_to = valid_to;
            }
            Ok(tariff.clone())
        })
    }

    /// Meters on the tariff are unlinked, never deleted.
    pub fn delete_tariff(&self, id: Uuid) -> Result<()> {
        self.mutate(|data| {
            if !data.tariffs.iter().any(|t| t.id == id) {
                return Err(StorageError::entity_not_found("tariff", id));
            }
            for meter in data.meters.iter_mut().filter(|m| m.tariff_id == Some(id)) {
                meter.tariff_id = None;
            }
            data.tariffs.retain(|t| t.id != id);
            Ok(())
        })
    }

    pub fn tariffs(&self) -> Vec<Tariff> {
        self.read(|data| data.tariffs.clone())
    }

    pub fn tariffs_for_meter_type(&self, meter_type_id: Uuid) -> Vec<Tariff> {
        self.read(|data| stats::tariffs_for_meter_type(data, meter_type_id))
    }

    pub fn active_tariff_for_meter(&self, meter_id: Uuid, on: NaiveDate) -> Option<Tariff> {
        self.read(|data| stats::active_tariff_for_meter(data, meter_id, on))
    }

    // ----- settings --------------------------------------------------------

    /// `storage_mode` is not updatable here; the manager stamps it itself
    /// whenever the active adapter changes.
    pub fn update_settings(&self, update: SettingsUpdate) -> Settings {
        self.mutate_ok(|data| {
            if let Some(currency) = update.currency {
                data.settings.currency = currency;
            }
            if let Some(theme) = update.theme {
                data.settings.theme = theme;
            }
            if let Some(widgets) = update.dashboard_widgets {
                data.settings.dashboard_widgets = widgets;
            }
            data.settings.clone()
        })
    }

    pub fn settings(&self) -> Settings {
        self.read(|data| data.settings.clone())
    }

    // ----- consumption and cost --------------------------------------------

    pub fn calculate_consumption(&self, meter_id: Uuid, range: &DateRange) -> Consumption {
        self.read(|data| stats::calculate_consumption(data, meter_id, range))
    }

    pub fn calculate_cost(&self, meter_id: Uuid, range: &DateRange) -> CostBreakdown {
        self.read(|data| stats::calculate_cost(data, meter_id, range))
    }

    pub fn monthly_breakdown(&self, meter_id: Uuid, year: i32) -> Vec<MonthlySlice> {
        self.read(|data| stats::monthly_breakdown(data, meter_id, year))
    }

    // ----- export / import -------------------------------------------------

    /// The dataset as a pretty-printed JSON document.
    pub fn export_json(&self) -> Result<String> {
        self.read(|data| data.to_document().map_err(|_| StorageError::InvalidFormat))
    }

    /// Replace the dataset with an imported document and persist it
    /// immediately.
    pub async fn import_json(&self, text: &str) -> Result<()> {
        let imported: Dataset =
            serde_json::from_str(text).map_err(|_| StorageError::InvalidFormat)?;
        *self.inner.data.lock().unwrap() = imported;
        self.save_now().await
    }
}

// ----- input types ---------------------------------------------------------

#[derive(Clone, Debug)]
pub struct NewMeter {
    pub name: String,
    pub type_id: Uuid,
    pub meter_number: String,
    pub location: String,
    pub is_continuous: bool,
    pub group_id: Option<Uuid>,
    pub tariff_id: Option<Uuid>,
}

impl NewMeter {
    pub fn named(name: &str, type_id: Uuid) -> Self {
        Self {
            name: name.to_string(),
            type_id,
            meter_number: String::new(),
            location: String::new(),
            is_continuous: false,
            group_id: None,
            tariff_id: None,
        }
    }
}

/// Field updates for a meter. `group_id`/`tariff_id` use a double `Option`:
/// the outer level is "change or not", the inner is the new value or `None`
/// to unlink.
#[derive(Clone, Debug, Default)]
pub struct MeterUpdate {
    pub name: Option<String>,
    pub type_id: Option<Uuid>,
    pub meter_number: Option<String>,
    pub location: Option<String>,
    pub is_continuous: Option<bool>,
    pub group_id: Option<Option<Uuid>>,
    pub tariff_id: Option<Option<Uuid>>,
}

#[derive(Clone, Debug)]
pub struct NewReading {
    pub meter_id: Uuid,
    pub value: f64,
    /// Defaults to now.
    pub timestamp: Option<chrono::DateTime<Utc>>,
    pub note: String,
    pub photo: Option<String>,
}

impl NewReading {
    pub fn of(meter_id: Uuid, value: f64) -> Self {
        Self {
            meter_id,
            value,
            timestamp: None,
            note: String::new(),
            photo: None,
        }
    }

    pub fn at(mut self, timestamp: chrono::DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReadingUpdate {
    pub value: Option<f64>,
    pub timestamp: Option<chrono::DateTime<Utc>>,
    pub note: Option<String>,
    pub photo: Option<Option<String>>,
}

#[derive(Clone, Debug)]
pub struct NewTariff {
    pub name: String,
    pub meter_type_id: Uuid,
    pub price_per_unit: f64,
    pub base_charge: f64,
    /// Defaults to today.
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
}

#[derive(Clone, Debug, Default)]
pub struct TariffUpdate {
    pub name: Option<String>,
    pub price_per_unit: Option<f64>,
    pub base_charge: Option<f64>,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<Option<NaiveDate>>,
}

#[derive(Clone, Debug, Default)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct MeterTypeUpdate {
    pub name: Option<String>,
    pub unit: Option<String>,
    pub icon: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct SettingsUpdate {
    pub currency: Option<String>,
    pub theme: Option<String>,
    pub dashboard_widgets: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use store::MemoryAdapter;

    async fn manager_on(adapter: MemoryAdapter) -> DataManager {
        let manager = DataManager::new(Backend::Memory(adapter));
        manager.init().await.unwrap();
        manager
    }

    fn fixture(manager: &DataManager) -> (Uuid, Uuid) {
        let meter_type = manager.add_meter_type("Water", "m³", "💧");
        let meter = manager
            .add_meter(NewMeter::named("Water main", meter_type.id))
            .unwrap();
        (meter_type.id, meter.id)
    }

    async fn settle() {
        tokio::time::sleep(AUTOSAVE_DEBOUNCE * 3).await;
    }

    #[tokio::test]
    async fn test_autosave_persists_the_final_state_of_a_burst() {
        let adapter = MemoryAdapter::new();
        let manager = manager_on(adapter.clone()).await;

        let (_, meter_id) = fixture(&manager);
        for value in [100.0, 101.5, 103.0] {
            manager.add_reading(NewReading::of(meter_id, value)).unwrap();
        }
        settle().await;

        let stored = adapter.contents().expect("autosave ran");
        assert_eq!(stored.readings.len(), 3);
        assert_eq!(stored.meters.len(), 1);
        assert_eq!(stored, manager.snapshot());
        // The burst coalesced: one write, not one per mutation.
        assert_eq!(adapter.save_count(), 1);
    }

    #[tokio::test]
    async fn test_deleting_a_meter_cascades_to_its_readings_only() {
        let adapter = MemoryAdapter::new();
        let manager = manager_on(adapter).await;

        let (type_id, kept_meter) = fixture(&manager);
        let doomed = manager
            .add_meter(NewMeter::named("Old meter", type_id))
            .unwrap();
        manager.add_reading(NewReading::of(kept_meter, 5.0)).unwrap();
        manager.add_reading(NewReading::of(doomed.id, 1.0)).unwrap();
        manager.add_reading(NewReading::of(doomed.id, 2.0)).unwrap();

        manager.delete_meter(doomed.id).unwrap();

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.meters.len(), 1);
        assert_eq!(snapshot.readings.len(), 1);
        assert_eq!(snapshot.readings[0].meter_id, kept_meter);
    }

    #[tokio::test]
    async fn test_deleting_group_and_tariff_unlinks_meters() {
        let adapter = MemoryAdapter::new();
        let manager = manager_on(adapter).await;

        let (type_id, meter_id) = fixture(&manager);
        let group = manager.add_group("Flat", "", "🏠", "#3b82f6");
        let tariff = manager
            .add_tariff(NewTariff {
                name: "Standard".into(),
                meter_type_id: type_id,
                price_per_unit: 0.5,
                base_charge: 0.0,
                valid_from: None,
                valid_to: None,
            })
            .unwrap();
        manager
            .update_meter(
                meter_id,
                MeterUpdate {
                    group_id: Some(Some(group.id)),
                    tariff_id: Some(Some(tariff.id)),
                    ..MeterUpdate::default()
                },
            )
            .unwrap();

        manager.delete_group(group.id).unwrap();
        manager.delete_tariff(tariff.id).unwrap();

        let meter = manager.meter(meter_id).unwrap();
        assert_eq!(meter.group_id, None);
        assert_eq!(meter.tariff_id, None);
        assert_eq!(manager.meters().len(), 1);
    }

    #[tokio::test]
    async fn test_meter_type_in_use_cannot_be_deleted() {
        let adapter = MemoryAdapter::new();
        let manager = manager_on(adapter).await;

        let (type_id, meter_id) = fixture(&manager);
        assert!(matches!(
            manager.delete_meter_type(type_id),
            Err(StorageError::InUse { .. })
        ));

        manager.delete_meter(meter_id).unwrap();
        manager.delete_meter_type(type_id).unwrap();
        assert!(manager.meter_types().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_propagate_entity_not_found() {
        let adapter = MemoryAdapter::new();
        let manager = manager_on(adapter).await;
        let ghost = Uuid::new_v4();

        assert!(matches!(
            manager.update_meter(ghost, MeterUpdate::default()),
            Err(StorageError::EntityNotFound { .. })
        ));
        assert!(matches!(
            manager.delete_reading(ghost),
            Err(StorageError::EntityNotFound { .. })
        ));
        assert!(matches!(
            manager.add_reading(NewReading::of(ghost, 1.0)),
            Err(StorageError::EntityNotFound { .. })
        ));
        assert!(matches!(
            manager.add_meter(NewMeter::named("No type", ghost)),
            Err(StorageError::EntityNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_switch_migrate_pushes_current_data() {
        let source = MemoryAdapter::new();
        let manager = manager_on(source.clone()).await;
        let (_, meter_id) = fixture(&manager);
        manager.add_reading(NewReading::of(meter_id, 42.0)).unwrap();

        let before = manager.snapshot();
        let target = MemoryAdapter::with_mode(StorageMode::Cloud);
        manager
            .switch_adapter(Backend::Memory(target.clone()), false, false)
            .await
            .unwrap();

        let migrated = target.contents().expect("migration saved");
        assert_eq!(migrated.meters, before.meters);
        assert_eq!(migrated.readings, before.readings);
        assert_eq!(migrated.settings.storage_mode, StorageMode::Cloud);
        assert_eq!(manager.active_mode().await, StorageMode::Cloud);
        // Nothing was read from the destination first; current data won.
        assert_eq!(manager.snapshot().meters, before.meters);
    }

    #[tokio::test]
    async fn test_switch_reload_discards_unsaved_edits() {
        let source = MemoryAdapter::new();
        let manager = manager_on(source).await;
        fixture(&manager);
        settle().await;

        // An edit that never reaches any backend: the switch discards it.
        manager.add_meter_type("Gas", "m³", "🔥");

        let mut authoritative = Dataset::empty();
        authoritative.settings.theme = "light".to_string();
        let target = MemoryAdapter::preloaded(StorageMode::Cloud, authoritative.clone());
        manager
            .switch_adapter(Backend::Memory(target), true, false)
            .await
            .unwrap();

        let adopted = manager.snapshot();
        assert!(adopted.meter_types.is_empty());
        assert_eq!(adopted.settings.theme, "light");
        assert_eq!(adopted.settings.storage_mode, StorageMode::Cloud);
    }

    #[tokio::test]
    async fn test_switch_cancels_pending_autosave() {
        let source = MemoryAdapter::new();
        let manager = manager_on(source.clone()).await;

        // Mutation schedules an autosave, but the switch lands first.
        manager.add_meter_type("Water", "m³", "💧");
        let target = MemoryAdapter::with_mode(StorageMode::Cloud);
        manager
            .switch_adapter(Backend::Memory(target.clone()), false, false)
            .await
            .unwrap();
        settle().await;

        // The cancelled timer never wrote to the old backend.
        assert_eq!(source.save_count(), 0);
        assert!(target.contents().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_save_now_results_in_one_write() {
        let adapter =
            MemoryAdapter::new().with_save_delay(Duration::from_millis(50));
        let manager = manager_on(adapter.clone()).await;
        manager.add_meter_type("Water", "m³", "💧");
        // Let the debounce timer pass so only our explicit saves run.
        settle().await;
        let baseline = adapter.save_count();

        let (first, second) = tokio::join!(manager.save_now(), manager.save_now());
        first.unwrap();
        second.unwrap();

        assert_eq!(adapter.save_count(), baseline + 1);
    }

    #[tokio::test]
    async fn test_permission_denied_falls_back_to_local() {
        let flaky = MemoryAdapter::with_mode(StorageMode::Filesystem);
        let fallback = MemoryAdapter::new();
        let manager = DataManager::with_fallback(
            Backend::Memory(flaky.clone()),
            Backend::Memory(fallback.clone()),
        );
        manager.init().await.unwrap();

        let events = Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        manager.on_permission_error(move |event| {
            assert_eq!(event.from, StorageMode::Filesystem);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        manager.add_meter_type("Water", "m³", "💧");
        flaky.inject_save_error(StorageError::PermissionDenied {
            mode: PermissionMode::ReadWrite,
        });
        // The caller sees success: the data moved backend instead of dying.
        manager.save_now().await.unwrap();

        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_mode().await, StorageMode::Local);
        let rescued = fallback.contents().expect("fallback save ran");
        assert_eq!(rescued.meter_types.len(), 1);
        assert_eq!(rescued.settings.storage_mode, StorageMode::Local);
        assert_eq!(
            manager.snapshot().settings.storage_mode,
            StorageMode::Local
        );
    }

    #[tokio::test]
    async fn test_permission_denied_without_fallback_propagates() {
        let flaky = MemoryAdapter::with_mode(StorageMode::Filesystem);
        let manager = manager_on(flaky.clone()).await;
        manager.add_meter_type("Water", "m³", "💧");

        flaky.inject_save_error(StorageError::PermissionDenied {
            mode: PermissionMode::ReadWrite,
        });
        assert!(matches!(
            manager.save_now().await,
            Err(StorageError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_change_listeners_fire_on_save_and_unsubscribe() {
        let adapter = MemoryAdapter::new();
        let manager = manager_on(adapter).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let id = manager.on_change(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        manager.add_meter_type("Water", "m³", "💧");
        manager.save_now().await.unwrap();
        let after_save = calls.load(Ordering::SeqCst);
        assert!(after_save >= 1);

        manager.remove_change_listener(id);
        manager.save_now().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), after_save);
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let adapter = MemoryAdapter::new();
        let manager = manager_on(adapter.clone()).await;
        let (_, meter_id) = fixture(&manager);
        manager.add_reading(NewReading::of(meter_id, 7.0)).unwrap();

        let exported = manager.export_json().unwrap();

        let other = manager_on(MemoryAdapter::new()).await;
        other.import_json(&exported).await.unwrap();
        assert_eq!(other.snapshot().readings.len(), 1);
        assert_eq!(other.snapshot().meters.len(), 1);

        assert!(matches!(
            other.import_json("{\"not\": \"a dataset\"}").await,
            Err(StorageError::InvalidFormat)
        ));
    }

    #[tokio::test]
    async fn test_consumption_query_through_manager() {
        let adapter = MemoryAdapter::new();
        let manager = manager_on(adapter).await;
        let (_, meter_id) = fixture(&manager);
        manager
            .add_reading(
                NewReading::of(meter_id, 100.0).at("2024-01-01T00:00:00Z".parse().unwrap()),
            )
            .unwrap();
        manager
            .add_reading(
                NewReading::of(meter_id, 150.0).at("2024-02-01T00:00:00Z".parse().unwrap()),
            )
            .unwrap();

        let result = manager.calculate_consumption(meter_id, &DateRange::all());
        assert_eq!(result.consumption, 50.0);
        assert_eq!(manager.latest_reading(meter_id).unwrap().value, 150.0);
    }

    #[tokio::test]
    async fn test_shutdown_is_quiet_on_non_local_backends() {
        let adapter = MemoryAdapter::with_mode(StorageMode::Cloud);
        let manager = manager_on(adapter.clone()).await;
        manager.add_meter_type("Water", "m³", "💧");

        // Memory is not the local database backend, so nothing is flushed
        // synchronously; the pending autosave is cancelled.
        manager.shutdown().await;
        assert_eq!(adapter.save_count(), 0);
    }
}
