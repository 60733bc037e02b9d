use crate::domain::entities::PendingQueueEntry;
use crate::shared::error::AppError;
use async_trait::async_trait;
use serde_json::Value;

/// 保留中の変更をリモートへ届けるポート
#[async_trait]
pub trait MutationDelivery: Send + Sync {
    /// 2xx 以外の応答や通信エラーはすべて失敗として返す
    async fn deliver(&self, entry: &PendingQueueEntry) -> Result<(), AppError>;

    /// 競合判定のためにサーバー側の現在のレコードを取得する。未対応なら `None`。
    async fn fetch_current(&self, _entry: &PendingQueueEntry) -> Result<Option<Value>, AppError> {
        Ok(None)
    }
}
