pub mod action_id;
pub mod batch_id;
pub mod entity_type;
pub mod queue_entry_id;

pub use action_id::ActionId;
pub use batch_id::BatchId;
pub use entity_type::EntityType;
pub use queue_entry_id::QueueEntryId;
