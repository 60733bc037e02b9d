use crate::shared::error::AppError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// コレクションのセカンダリインデックス定義（トップレベルの JSON フィールドに張る）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub indices: Vec<IndexSchema>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indices: Vec::new(),
        }
    }

    pub fn with_index(mut self, name: impl Into<String>, field: impl Into<String>) -> Self {
        self.indices.push(IndexSchema {
            name: name.into(),
            field: field.into(),
        });
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indices.iter().find(|index| index.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub collections: Vec<CollectionSchema>,
}

impl StoreSchema {
    pub fn new(collections: Vec<CollectionSchema>) -> Self {
        Self { collections }
    }

    /// コレクション名・インデックス名は SQL 識別子としても使うため英数字と `_` に限る
    pub fn validate(&self) -> Result<(), AppError> {
        for collection in &self.collections {
            validate_identifier(&collection.name)?;
            for index in &collection.indices {
                validate_identifier(&index.name)?;
                validate_identifier(&index.field)?;
            }
        }
        Ok(())
    }
}

fn validate_identifier(value: &str) -> Result<(), AppError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::StoreOpen(format!(
            "Invalid collection or index identifier: `{value}`"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub value: Value,
}

/// インデックス範囲（両端とも含む）
#[derive(Debug, Clone, PartialEq)]
pub enum IndexRange {
    All,
    Exact(Value),
    Between {
        lower: Option<Value>,
        upper: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Add { key: String, value: Value },
    Put { key: String, value: Value },
    Get { key: String },
    Delete { key: String },
    GetAll,
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreOpResult {
    Added,
    Stored,
    Value(Option<Value>),
    Deleted(bool),
    All(Vec<StoredRecord>),
    Cleared,
}

/// トランザクション単位で完了を返す永続ストア。
///
/// `transaction` は全操作がコミットされてから結果を返す。途中で 1 つでも失敗した場合は
/// 全体をロールバックし、個別には成功していた操作も含めて `AppError::TransactionAbort` とする。
/// 存在しないキーへの get/delete はエラーではなく `None` / `false` を返す。
#[async_trait]
pub trait DurableStore: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u32;

    async fn transaction(
        &self,
        collection: &str,
        ops: Vec<StoreOp>,
    ) -> Result<Vec<StoreOpResult>, AppError>;

    async fn query_index(
        &self,
        collection: &str,
        index: &str,
        range: IndexRange,
    ) -> Result<Vec<StoredRecord>, AppError>;

    async fn add(&self, collection: &str, key: &str, value: Value) -> Result<(), AppError> {
        self.single(
            collection,
            StoreOp::Add {
                key: key.to_string(),
                value,
            },
        )
        .await
        .map(|_| ())
    }

    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<(), AppError> {
        self.single(
            collection,
            StoreOp::Put {
                key: key.to_string(),
                value,
            },
        )
        .await
        .map(|_| ())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, AppError> {
        match self
            .single(
                collection,
                StoreOp::Get {
                    key: key.to_string(),
                },
            )
            .await?
        {
            StoreOpResult::Value(value) => Ok(value),
            other => Err(unexpected_result("get", &other)),
        }
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, AppError> {
        match self
            .single(
                collection,
                StoreOp::Delete {
                    key: key.to_string(),
                },
            )
            .await?
        {
            StoreOpResult::Deleted(existed) => Ok(existed),
            other => Err(unexpected_result("delete", &other)),
        }
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<StoredRecord>, AppError> {
        match self.single(collection, StoreOp::GetAll).await? {
            StoreOpResult::All(records) => Ok(records),
            other => Err(unexpected_result("get_all", &other)),
        }
    }

    async fn clear(&self, collection: &str) -> Result<(), AppError> {
        self.single(collection, StoreOp::Clear).await.map(|_| ())
    }

    async fn single(&self, collection: &str, op: StoreOp) -> Result<StoreOpResult, AppError> {
        self.transaction(collection, vec![op])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("Transaction returned no result".to_string()))
    }
}

fn unexpected_result(op: &str, result: &StoreOpResult) -> AppError {
    AppError::Internal(format!("Unexpected store result for {op}: {result:?}"))
}

/// インデックス値の比較。数値は数値として、それ以外は文字列表現で比較する。
pub fn compare_index_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => index_text(a).cmp(&index_text(b)),
    }
}

fn index_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl IndexRange {
    pub fn contains(&self, value: &Value) -> bool {
        use std::cmp::Ordering;
        match self {
            IndexRange::All => true,
            IndexRange::Exact(expected) => compare_index_values(value, expected) == Ordering::Equal,
            IndexRange::Between { lower, upper } => {
                let above = lower
                    .as_ref()
                    .is_none_or(|lower| compare_index_values(value, lower) != Ordering::Less);
                let below = upper
                    .as_ref()
                    .is_none_or(|upper| compare_index_values(value, upper) != Ordering::Greater);
                above && below
            }
        }
    }
}
