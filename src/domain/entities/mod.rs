pub mod action;
pub mod pending_entry;
pub mod replay;
pub mod snapshot;

pub use action::{Action, ActionKind, ActionMetadata, ActionPayload, ActionSource};
pub use pending_entry::{HttpMethod, PendingQueueEntry};
pub use replay::{ReplayData, ReplayDirection, record_id};
pub use snapshot::{
    HISTORY_SNAPSHOT_KEY, HistorySnapshot, PENDING_QUEUE_KEY, PendingQueueSnapshot,
    SNAPSHOT_SCHEMA_VERSION,
};
