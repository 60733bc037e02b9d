use crate::domain::entities::ReplayData;
use crate::shared::error::AppError;
use async_trait::async_trait;

/// エンティティ種別ごとの undo/redo 適用ポート。
///
/// 実装は通常リモートの正本への呼び出しになる。失敗は `AppError::RemoteOperation` で返す。
#[async_trait]
pub trait EntityAdapter: Send + Sync {
    async fn undo(&self, data: ReplayData) -> Result<(), AppError>;

    async fn redo(&self, data: ReplayData) -> Result<(), AppError>;
}
