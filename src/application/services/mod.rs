pub mod action_batch;
pub mod action_log;
pub mod adapter_registry;
pub mod offline_cache_service;
pub mod sync_coordinator;

pub use action_batch::ActionBatch;
pub use action_log::{ActionLog, ActionLogState, RecordRequest, Subscription};
pub use adapter_registry::AdapterRegistry;
pub use offline_cache_service::{CachedKey, OfflineCacheService, cache_store_schema};
pub use sync_coordinator::{
    ConflictResolution, ConflictWinner, DrainReport, SyncCoordinator, SyncEvent, resolve_conflict,
};
