pub mod scheduler;

pub use scheduler::{CycleReport, CycleTrigger, SyncCycleState, SyncScheduler, SyncStatus};
