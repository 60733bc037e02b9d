use crate::application::ports::durable_store::{
    CollectionSchema, DurableStore, IndexRange, StoreOp, StoreOpResult, StoreSchema,
    StoredRecord, compare_index_values,
};
use crate::shared::error::AppError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

type Collection = BTreeMap<String, Value>;

/// プロセス内だけで完結する `DurableStore`。ディスクを持たないホストとテストで使う。
///
/// トランザクションはコレクションの写しに適用し、全操作が成功した時点で差し替える。
pub struct MemoryDurableStore {
    name: String,
    version: u32,
    schemas: HashMap<String, CollectionSchema>,
    data: RwLock<HashMap<String, Collection>>,
}

impl MemoryDurableStore {
    pub fn open(name: &str, version: u32, schema: StoreSchema) -> Result<Self, AppError> {
        if version == 0 {
            return Err(AppError::StoreOpen(
                "Store version must be greater than 0".to_string(),
            ));
        }
        schema.validate()?;

        let data = schema
            .collections
            .iter()
            .map(|collection| (collection.name.clone(), Collection::new()))
            .collect();
        let schemas = schema
            .collections
            .into_iter()
            .map(|collection| (collection.name.clone(), collection))
            .collect();

        Ok(Self {
            name: name.to_string(),
            version,
            schemas,
            data: RwLock::new(data),
        })
    }

    fn schema(&self, collection: &str) -> Result<&CollectionSchema, AppError> {
        self.schemas
            .get(collection)
            .ok_or_else(|| AppError::NotFound(format!("Collection `{collection}`")))
    }
}

fn apply(records: &mut Collection, op: StoreOp) -> Result<StoreOpResult, AppError> {
    match op {
        StoreOp::Add { key, value } => {
            if records.contains_key(&key) {
                return Err(AppError::Database(format!("Key `{key}` already exists")));
            }
            records.insert(key, value);
            Ok(StoreOpResult::Added)
        }
        StoreOp::Put { key, value } => {
            records.insert(key, value);
            Ok(StoreOpResult::Stored)
        }
        StoreOp::Get { key } => Ok(StoreOpResult::Value(records.get(&key).cloned())),
        StoreOp::Delete { key } => Ok(StoreOpResult::Deleted(records.remove(&key).is_some())),
        StoreOp::GetAll => Ok(StoreOpResult::All(
            records
                .iter()
                .map(|(key, value)| StoredRecord {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        )),
        StoreOp::Clear => {
            records.clear();
            Ok(StoreOpResult::Cleared)
        }
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    async fn transaction(
        &self,
        collection: &str,
        ops: Vec<StoreOp>,
    ) -> Result<Vec<StoreOpResult>, AppError> {
        self.schema(collection)?;

        let mut data = self.data.write().await;
        let mut working = data.get(collection).cloned().unwrap_or_default();
        let mut results = Vec::with_capacity(ops.len());

        for (index, op) in ops.into_iter().enumerate() {
            match apply(&mut working, op) {
                Ok(result) => results.push(result),
                Err(err) => {
                    return Err(AppError::TransactionAbort(format!(
                        "operation #{index} on `{collection}` failed: {err}"
                    )));
                }
            }
        }

        data.insert(collection.to_string(), working);
        Ok(results)
    }

    async fn query_index(
        &self,
        collection: &str,
        index: &str,
        range: IndexRange,
    ) -> Result<Vec<StoredRecord>, AppError> {
        let schema = self.schema(collection)?;
        let field = schema
            .index(index)
            .ok_or_else(|| {
                AppError::NotFound(format!("Index `{index}` on collection `{collection}`"))
            })?
            .field
            .clone();

        let data = self.data.read().await;
        let mut records: Vec<(Value, StoredRecord)> = data
            .get(collection)
            .into_iter()
            .flat_map(|records| records.iter())
            .filter_map(|(key, value)| {
                let indexed = value.get(&field).filter(|v| !v.is_null())?;
                range.contains(indexed).then(|| {
                    (
                        indexed.clone(),
                        StoredRecord {
                            key: key.clone(),
                            value: value.clone(),
                        },
                    )
                })
            })
            .collect();

        records.sort_by(|(a, ra), (b, rb)| {
            compare_index_values(a, b).then_with(|| ra.key.cmp(&rb.key))
        });
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemoryDurableStore {
        MemoryDurableStore::open(
            "memory",
            1,
            StoreSchema::new(vec![
                CollectionSchema::new("offline_cache"),
                CollectionSchema::new("events").with_index("by_timestamp", "timestamp"),
            ]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn add_rejects_duplicates_and_aborts_whole_transaction() {
        let store = store();
        store.add("offline_cache", "a", json!(1)).await.unwrap();

        let result = store
            .transaction(
                "offline_cache",
                vec![
                    StoreOp::Put {
                        key: "b".into(),
                        value: json!(2),
                    },
                    StoreOp::Add {
                        key: "a".into(),
                        value: json!(3),
                    },
                ],
            )
            .await;
        assert!(matches!(result, Err(AppError::TransactionAbort(_))));
        assert_eq!(store.get("offline_cache", "b").await.unwrap(), None);
        assert_eq!(
            store.get("offline_cache", "a").await.unwrap(),
            Some(json!(1))
        );
    }

    #[tokio::test]
    async fn unknown_collection_is_not_found() {
        let store = store();
        let result = store.get("missing", "a").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn exact_index_match() {
        let store = store();
        store
            .put("events", "x", json!({"timestamp": "2024-01-02"}))
            .await
            .unwrap();
        store
            .put("events", "y", json!({"timestamp": "2024-01-03"}))
            .await
            .unwrap();
        store.put("events", "z", json!({"other": 1})).await.unwrap();

        let hits = store
            .query_index(
                "events",
                "by_timestamp",
                IndexRange::Exact(json!("2024-01-03")),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "y");

        let all = store
            .query_index("events", "by_timestamp", IndexRange::All)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}
