use std::path::Path;
use std::sync::Arc;

use rewind_sync::application::ports::DurableStore;
use rewind_sync::application::services::{
    ActionLog, AdapterRegistry, OfflineCacheService, RecordRequest, cache_store_schema,
};
use rewind_sync::domain::entities::{ActionKind, ActionPayload, ReplayData};
use rewind_sync::domain::value_objects::EntityType;
use rewind_sync::infrastructure::storage::{ConnectionPool, SqliteDurableStore};
use rewind_sync::shared::config::HistoryConfig;
use serde_json::{Value, json};

use super::mocks::InMemoryRemote;

pub const STORE_NAME: &str = "rewind";

pub fn transaction_type() -> EntityType {
    EntityType::new("transaction").expect("entity type")
}

pub async fn memory_cache() -> (ConnectionPool, OfflineCacheService) {
    let pool = ConnectionPool::from_memory().await.expect("in-memory sqlite");
    let cache = open_cache(&pool, 1).await;
    (pool, cache)
}

pub async fn file_pool(path: &Path) -> ConnectionPool {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    ConnectionPool::new(&url, 2).await.expect("file sqlite")
}

pub async fn open_cache(pool: &ConnectionPool, version: u32) -> OfflineCacheService {
    let store: Arc<dyn DurableStore> = Arc::new(
        SqliteDurableStore::open(pool.get_pool().clone(), STORE_NAME, version, cache_store_schema())
            .await
            .expect("open store"),
    );
    OfflineCacheService::new(store)
}

pub struct HistoryContext {
    pub log: Arc<ActionLog>,
    pub remote: Arc<InMemoryRemote>,
    pub pool: ConnectionPool,
}

pub async fn setup_history(max_stack_size: usize) -> HistoryContext {
    let (pool, cache) = memory_cache().await;
    let remote = Arc::new(InMemoryRemote::new());
    let log = history_with(cache, remote.clone(), max_stack_size).await;
    HistoryContext { log, remote, pool }
}

pub async fn history_with(
    cache: OfflineCacheService,
    remote: Arc<InMemoryRemote>,
    max_stack_size: usize,
) -> Arc<ActionLog> {
    let registry = Arc::new(AdapterRegistry::new());
    registry.register(transaction_type(), remote);
    ActionLog::init(&HistoryConfig { max_stack_size }, registry, cache)
        .await
        .expect("init action log")
}

pub fn transaction(id: &str, amount: i64) -> Value {
    json!({ "id": id, "amount": amount })
}

/// ホストの典型的な流れ: リモートへ反映してから履歴に記録する
pub async fn create_transaction(ctx: &HistoryContext, id: &str, amount: i64) {
    let after = transaction(id, amount);
    ctx.remote
        .apply(&ReplayData::Upsert(after.clone()))
        .expect("remote create");
    ctx.log
        .record(RecordRequest::new(
            ActionKind::Create,
            transaction_type(),
            ActionPayload::created(after),
            "create transaction",
        ))
        .await
        .expect("record create");
}

pub async fn update_transaction(ctx: &HistoryContext, id: &str, amount: i64) {
    let before = ctx
        .remote
        .records()
        .get(id)
        .cloned()
        .expect("existing record");
    let after = transaction(id, amount);
    ctx.remote
        .apply(&ReplayData::Upsert(after.clone()))
        .expect("remote update");
    ctx.log
        .record(RecordRequest::new(
            ActionKind::Update,
            transaction_type(),
            ActionPayload::updated(before, after),
            "update transaction",
        ))
        .await
        .expect("record update");
}

pub async fn delete_transaction(ctx: &HistoryContext, id: &str) {
    let before = ctx
        .remote
        .records()
        .get(id)
        .cloned()
        .expect("existing record");
    ctx.remote
        .apply(&ReplayData::DeleteById(id.to_string()))
        .expect("remote delete");
    ctx.log
        .record(RecordRequest::new(
            ActionKind::Delete,
            transaction_type(),
            ActionPayload::deleted(before),
            "delete transaction",
        ))
        .await
        .expect("record delete");
}
