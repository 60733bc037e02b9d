pub mod connectivity;
pub mod durable_store;
pub mod entity_adapter;
pub mod mutation_delivery;

pub use connectivity::ConnectivitySignal;
pub use durable_store::{
    CollectionSchema, DurableStore, IndexRange, IndexSchema, StoreOp, StoreOpResult, StoreSchema,
    StoredRecord,
};
pub use entity_adapter::EntityAdapter;
pub use mutation_delivery::MutationDelivery;
