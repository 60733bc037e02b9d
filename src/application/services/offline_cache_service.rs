use crate::application::ports::durable_store::{
    CollectionSchema, DurableStore, IndexRange, StoreSchema,
};
use crate::domain::entities::SNAPSHOT_SCHEMA_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub const CACHE_COLLECTION: &str = "offline_cache";
const SAVED_AT_INDEX: &str = "by_saved_at";

/// キャッシュサービスが前提とするストアスキーマ
pub fn cache_store_schema() -> StoreSchema {
    StoreSchema::new(vec![
        CollectionSchema::new(CACHE_COLLECTION).with_index(SAVED_AT_INDEX, "saved_at_ms"),
    ])
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    schema_version: u32,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    saved_at_ms: i64,
    data: T,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedKey {
    pub key: String,
    pub saved_at: Option<DateTime<Utc>>,
}

/// `DurableStore` 上のキー→スナップショット保存サービス。
///
/// 永続化はベストエフォートで、ストアの失敗はログに残すだけで呼び出し元へは返さない。
/// 読み込んだ値が壊れている・形式バージョンが違う場合は「存在しない」として扱う。
#[derive(Clone)]
pub struct OfflineCacheService {
    store: Option<Arc<dyn DurableStore>>,
}

impl OfflineCacheService {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store: Some(store) }
    }

    /// ストアを開けなかった場合のメモリのみ動作
    pub fn detached() -> Self {
        Self { store: None }
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    /// 値を保存する。永続化できた場合のみ `true`。
    pub async fn store<T>(&self, key: &str, value: &T) -> bool
    where
        T: Serialize + Sync,
    {
        let Some(store) = &self.store else {
            debug!(key, "cache store detached; skipping write");
            return false;
        };

        let saved_at = Utc::now();
        let envelope = Envelope {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            saved_at,
            saved_at_ms: saved_at.timestamp_millis(),
            data: value,
        };
        let encoded = match serde_json::to_value(&envelope) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(key, error = %err, "failed to encode cache value");
                return false;
            }
        };

        match store.put(CACHE_COLLECTION, key, encoded).await {
            Ok(()) => true,
            Err(err) => {
                warn!(key, error = %err, "persistence failed; continuing in memory");
                false
            }
        }
    }

    pub async fn load<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        self.load_validated(key, |_: &T| true).await
    }

    /// 形状チェックを通った値だけを返す
    pub async fn load_validated<T, F>(&self, key: &str, is_valid: F) -> Option<T>
    where
        T: DeserializeOwned,
        F: FnOnce(&T) -> bool,
    {
        let store = self.store.as_ref()?;
        let raw = match store.get(CACHE_COLLECTION, key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "failed to read cache value");
                return None;
            }
        };

        let envelope = decode_envelope::<T>(key, raw)?;
        if is_valid(&envelope.data) {
            Some(envelope.data)
        } else {
            warn!(key, "cached value failed shape check; ignoring");
            None
        }
    }

    pub async fn remove(&self, key: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.delete(CACHE_COLLECTION, key).await {
            Ok(existed) => existed,
            Err(err) => {
                warn!(key, error = %err, "failed to remove cache value");
                false
            }
        }
    }

    /// 保存日時の古い順にキーを列挙する
    pub async fn keys(&self) -> Vec<CachedKey> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        match store
            .query_index(CACHE_COLLECTION, SAVED_AT_INDEX, IndexRange::All)
            .await
        {
            Ok(records) => records
                .into_iter()
                .map(|record| CachedKey {
                    saved_at: record
                        .value
                        .get("saved_at")
                        .and_then(|v| serde_json::from_value(v.clone()).ok()),
                    key: record.key,
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "failed to list cache keys");
                Vec::new()
            }
        }
    }
}

fn decode_envelope<T: DeserializeOwned>(key: &str, raw: Value) -> Option<Envelope<T>> {
    let version = raw.get("schema_version").and_then(Value::as_u64);
    match version {
        Some(v) if v == u64::from(SNAPSHOT_SCHEMA_VERSION) => {}
        Some(v) => {
            warn!(
                key,
                found = v,
                expected = SNAPSHOT_SCHEMA_VERSION,
                "cached value has incompatible schema version; ignoring"
            );
            return None;
        }
        None => {
            warn!(key, "cached value is missing schema version; ignoring");
            return None;
        }
    }
    if raw.get("data").is_none_or(Value::is_null) {
        return None;
    }

    match serde_json::from_value::<Envelope<T>>(raw) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!(key, error = %err, "cached value failed to decode; ignoring");
            None
        }
    }
}
