use crate::application::ports::durable_store::{
    CollectionSchema, DurableStore, IndexRange, StoreOp, StoreOpResult, StoreSchema,
    StoredRecord,
};
use crate::shared::error::AppError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use tracing::{debug, info};

/// SQLite をバックエンドにした `DurableStore`。
///
/// 1 つの DB ファイルに複数のストアを同居させられるよう、全テーブルをストア名で区切る。
pub struct SqliteDurableStore {
    pool: SqlitePool,
    name: String,
    version: u32,
    collections: HashMap<String, CollectionSchema>,
}

impl SqliteDurableStore {
    /// ストアを開く。初回またはバージョンが上がった場合のみ宣言されたコレクションを作成する。
    pub async fn open(
        pool: SqlitePool,
        name: &str,
        version: u32,
        schema: StoreSchema,
    ) -> Result<Self, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::StoreOpen("Store name cannot be empty".to_string()));
        }
        if version == 0 {
            return Err(AppError::StoreOpen(
                "Store version must be greater than 0".to_string(),
            ));
        }
        schema.validate()?;
        initialize_catalog(&pool).await?;

        let stored_version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM store_meta WHERE name = ?1")
                .bind(name)
                .fetch_optional(&pool)
                .await?;

        match stored_version {
            Some(stored) if stored > i64::from(version) => {
                return Err(AppError::StoreOpen(format!(
                    "Store `{name}` is at version {stored}, \
                     cannot open with older version {version}"
                )));
            }
            Some(stored) if stored == i64::from(version) => {
                debug!(store = name, version, "opened existing store");
            }
            previous => {
                upgrade(&pool, name, version, &schema).await?;
                info!(
                    store = name,
                    from = previous.unwrap_or(0),
                    to = version,
                    "store schema upgraded"
                );
            }
        }

        let collections = load_collections(&pool, name).await?;

        Ok(Self {
            pool,
            name: name.to_string(),
            version,
            collections,
        })
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.keys().cloned().collect();
        names.sort();
        names
    }

    fn collection(&self, collection: &str) -> Result<&CollectionSchema, AppError> {
        self.collections
            .get(collection)
            .ok_or_else(|| AppError::NotFound(format!("Collection `{collection}`")))
    }

    async fn apply(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
        op: StoreOp,
    ) -> Result<StoreOpResult, AppError> {
        let now = Utc::now().timestamp_millis();
        match op {
            StoreOp::Add { key, value } => {
                sqlx::query(
                    r#"
                    INSERT INTO store_records (store, collection, key, value, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                )
                .bind(&self.name)
                .bind(collection)
                .bind(&key)
                .bind(serde_json::to_string(&value)?)
                .bind(now)
                .execute(&mut **tx)
                .await?;
                Ok(StoreOpResult::Added)
            }
            StoreOp::Put { key, value } => {
                sqlx::query(
                    r#"
                    INSERT INTO store_records (store, collection, key, value, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(store, collection, key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&self.name)
                .bind(collection)
                .bind(&key)
                .bind(serde_json::to_string(&value)?)
                .bind(now)
                .execute(&mut **tx)
                .await?;
                Ok(StoreOpResult::Stored)
            }
            StoreOp::Get { key } => {
                let raw: Option<String> = sqlx::query_scalar(
                    r#"
                    SELECT value FROM store_records
                    WHERE store = ?1 AND collection = ?2 AND key = ?3
                    "#,
                )
                .bind(&self.name)
                .bind(collection)
                .bind(&key)
                .fetch_optional(&mut **tx)
                .await?;
                let value = raw.map(|raw| serde_json::from_str(&raw)).transpose()?;
                Ok(StoreOpResult::Value(value))
            }
            StoreOp::Delete { key } => {
                let result = sqlx::query(
                    "DELETE FROM store_records WHERE store = ?1 AND collection = ?2 AND key = ?3",
                )
                .bind(&self.name)
                .bind(collection)
                .bind(&key)
                .execute(&mut **tx)
                .await?;
                Ok(StoreOpResult::Deleted(result.rows_affected() > 0))
            }
            StoreOp::GetAll => {
                let rows = sqlx::query(
                    r#"
                    SELECT key, value FROM store_records
                    WHERE store = ?1 AND collection = ?2
                    ORDER BY key ASC
                    "#,
                )
                .bind(&self.name)
                .bind(collection)
                .fetch_all(&mut **tx)
                .await?;
                Ok(StoreOpResult::All(rows_to_records(rows)?))
            }
            StoreOp::Clear => {
                sqlx::query("DELETE FROM store_records WHERE store = ?1 AND collection = ?2")
                    .bind(&self.name)
                    .bind(collection)
                    .execute(&mut **tx)
                    .await?;
                Ok(StoreOpResult::Cleared)
            }
        }
    }
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
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
        self.collection(collection)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::TransactionAbort(e.to_string()))?;
        let mut results = Vec::with_capacity(ops.len());

        for (index, op) in ops.into_iter().enumerate() {
            match self.apply(&mut tx, collection, op).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        tracing::warn!(error = %rollback_err, "rollback failed");
                    }
                    return Err(AppError::TransactionAbort(format!(
                        "operation #{index} on `{collection}` failed: {err}"
                    )));
                }
            }
        }

        // コミット完了まで結果を返さない
        tx.commit()
            .await
            .map_err(|e| AppError::TransactionAbort(e.to_string()))?;
        Ok(results)
    }

    async fn query_index(
        &self,
        collection: &str,
        index: &str,
        range: IndexRange,
    ) -> Result<Vec<StoredRecord>, AppError> {
        let schema = self.collection(collection)?;
        let index = schema.index(index).ok_or_else(|| {
            AppError::NotFound(format!("Index `{index}` on collection `{collection}`"))
        })?;

        // フィールド名はスキーマ検証済みの識別子
        let sql = format!(
            r#"
            SELECT key, value FROM store_records
            WHERE store = ?1 AND collection = ?2
              AND json_extract(value, '$.{field}') IS NOT NULL
            ORDER BY json_extract(value, '$.{field}') ASC, key ASC
            "#,
            field = index.field
        );
        let rows = sqlx::query(&sql)
            .bind(&self.name)
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;

        let field = index.field.clone();
        Ok(rows_to_records(rows)?
            .into_iter()
            .filter(|record| {
                record
                    .value
                    .get(&field)
                    .is_some_and(|value| range.contains(value))
            })
            .collect())
    }
}

async fn initialize_catalog(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS store_meta (
            name TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            upgraded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS store_collections (
            store TEXT NOT NULL,
            name TEXT NOT NULL,
            indices TEXT NOT NULL,
            PRIMARY KEY (store, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS store_records (
            store TEXT NOT NULL,
            collection TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (store, collection, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn upgrade(
    pool: &SqlitePool,
    name: &str,
    version: u32,
    schema: &StoreSchema,
) -> Result<(), AppError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| AppError::StoreOpen(e.to_string()))?;

    for collection in &schema.collections {
        sqlx::query(
            r#"
            INSERT INTO store_collections (store, name, indices)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(store, name) DO UPDATE SET indices = excluded.indices
            "#,
        )
        .bind(name)
        .bind(&collection.name)
        .bind(serde_json::to_string(&collection.indices)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::StoreOpen(e.to_string()))?;

        for index in &collection.indices {
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS idx_records_{collection}_{index} \
                 ON store_records(store, collection, json_extract(value, '$.{field}'))",
                collection = collection.name,
                index = index.name,
                field = index.field,
            );
            sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::StoreOpen(e.to_string()))?;
        }
    }

    sqlx::query(
        r#"
        INSERT INTO store_meta (name, version, upgraded_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(name) DO UPDATE SET
            version = excluded.version,
            upgraded_at = excluded.upgraded_at
        "#,
    )
    .bind(name)
    .bind(i64::from(version))
    .bind(Utc::now().timestamp_millis())
    .execute(&mut *tx)
    .await
    .map_err(|e| AppError::StoreOpen(e.to_string()))?;

    tx.commit()
        .await
        .map_err(|e| AppError::StoreOpen(e.to_string()))
}

async fn load_collections(
    pool: &SqlitePool,
    name: &str,
) -> Result<HashMap<String, CollectionSchema>, AppError> {
    let rows = sqlx::query("SELECT name, indices FROM store_collections WHERE store = ?1")
        .bind(name)
        .fetch_all(pool)
        .await?;

    let mut collections = HashMap::with_capacity(rows.len());
    for row in rows {
        let collection_name: String = row.try_get("name")?;
        let indices: String = row.try_get("indices")?;
        collections.insert(
            collection_name.clone(),
            CollectionSchema {
                name: collection_name,
                indices: serde_json::from_str(&indices)?,
            },
        );
    }
    Ok(collections)
}

fn rows_to_records(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<StoredRecord>, AppError> {
    rows.into_iter()
        .map(|row| {
            let key: String = row.try_get("key")?;
            let raw: String = row.try_get("value")?;
            let value: Value = serde_json::from_str(&raw)?;
            Ok(StoredRecord { key, value })
        })
        .collect()
}
