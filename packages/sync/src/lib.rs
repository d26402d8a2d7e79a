pub mod conflict;
pub mod manager;
pub mod stats;

pub use conflict::{
    CloudConflict, ConflictChoice, MissingFile, PendingDecision, RecoveryChoice, RecoveryOutcome,
    SwitchOutcome, SyncCoordinator,
};
pub use manager::{
    DataManager, GroupUpdate, ListenerId, MeterTypeUpdate, MeterUpdate, NewMeter, NewReading,
    NewTariff, PermissionFallback, ReadingUpdate, SettingsUpdate, TariffUpdate,
    AUTOSAVE_DEBOUNCE,
};
pub use stats::{Consumption, CostBreakdown, DateRange, MeterWithType, MonthlySlice};
