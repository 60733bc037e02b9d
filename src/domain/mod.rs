pub mod entities;
pub mod value_objects;

pub use entities::{Action, ActionKind, ActionPayload, PendingQueueEntry, ReplayData};
pub use value_objects::{ActionId, BatchId, EntityType, QueueEntryId};
