//! # Domain models for the meterbook dataset
//!
//! The [`Dataset`] is the single unit of persistence: every backend stores it
//! whole, as one JSON document with camelCase keys, and every save round-trips
//! the entire aggregate. Entities reference each other by client-generated
//! UUIDs. Two referential rules hold everywhere:
//!
//! - deleting a meter deletes all of its readings (cascade);
//! - deleting a group or tariff nulls the reference on meters that pointed to
//!   it, never the meters themselves.
//!
//! `lastModified` is rewritten by the active adapter on every successful save
//! and is the only signal used to detect divergence between two copies of the
//! dataset saved on different backends.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dataset format tag written into every document.
pub const DATASET_VERSION: &str = "1.0";

/// Tag identifying which adapter currently owns the data.
///
/// This is carried explicitly by every adapter via
/// [`StorageAdapter::mode`](crate::StorageAdapter::mode); nothing in the
/// system infers the backend from a concrete type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Local,
    Filesystem,
    Webdav,
    Cloud,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            StorageMode::Local => "local",
            StorageMode::Filesystem => "filesystem",
            StorageMode::Webdav => "webdav",
            StorageMode::Cloud => "cloud",
        };
        f.write_str(tag)
    }
}

/// A kind of meter (water, electricity, gas, ...) with its unit of measure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterType {
    pub id: Uuid,
    pub name: String,
    /// Unit the readings are taken in, e.g. "m³" or "kWh".
    pub unit: String,
    pub icon: String,
    pub created_at: DateTime<Utc>,
}

/// A physical meter. `type_id` must reference an existing [`MeterType`];
/// `group_id` and `tariff_id` are optional weak references.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meter {
    pub id: Uuid,
    pub name: String,
    pub type_id: Uuid,
    pub meter_number: String,
    pub location: String,
    /// Continuous meters accumulate forever; non-continuous ones may reset.
    pub is_continuous: bool,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub tariff_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single recorded meter value. `meter_id` must reference an existing meter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub id: Uuid,
    pub meter_id: Uuid,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub note: String,
    /// Optional photo of the meter display, as a data URL.
    #[serde(default)]
    pub photo: Option<String>,
}

/// A user-defined grouping of meters (per building, flat, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub icon: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
}

/// A price schedule for one meter type, effective within
/// `[valid_from, valid_to]` and open-ended when `valid_to` is absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tariff {
    pub id: Uuid,
    pub name: String,
    pub meter_type_id: Uuid,
    pub price_per_unit: f64,
    /// Fixed monthly charge, pro-rated over partial periods.
    pub base_charge: f64,
    pub valid_from: NaiveDate,
    #[serde(default)]
    pub valid_to: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Tariff {
    /// Whether the tariff is effective on the given date.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        date >= self.valid_from && self.valid_to.map_or(true, |end| date <= end)
    }
}

/// User settings stored inside the dataset. `storage_mode` is descriptive:
/// the manager keeps it consistent with the active adapter, it is never used
/// to select one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub storage_mode: StorageMode,
    pub currency: String,
    pub theme: String,
    #[serde(default)]
    pub dashboard_widgets: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::Local,
            currency: "EUR".to_string(),
            theme: "dark".to_string(),
            dashboard_widgets: Vec::new(),
        }
    }
}

/// The single serializable aggregate of all user data and settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub version: String,
    pub meter_types: Vec<MeterType>,
    pub meters: Vec<Meter>,
    pub readings: Vec<Reading>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub tariffs: Vec<Tariff>,
    #[serde(default)]
    pub settings: Settings,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Dataset {
    /// The empty template handed out the first time a backend is read.
    ///
    /// Adapters return this from `load` when their store has never been
    /// written, which keeps "empty" distinguishable from "unreachable".
    pub fn empty() -> Self {
        let now = Utc::now();
        Self {
            version: DATASET_VERSION.to_string(),
            meter_types: Vec::new(),
            meters: Vec::new(),
            readings: Vec::new(),
            groups: Vec::new(),
            tariffs: Vec::new(),
            settings: Settings::default(),
            created_at: now,
            last_modified: now,
        }
    }

    /// Whether the dataset holds any user data worth fighting over.
    /// Used by the conflict orchestration when two copies meet.
    pub fn has_user_data(&self) -> bool {
        !self.meters.is_empty() || !self.readings.is_empty()
    }

    /// Serialize as the on-disk document format: pretty JSON, 2-space indent.
    pub fn to_document(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
