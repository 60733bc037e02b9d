use crate::application::services::action_log::{ActionLog, RecordRequest};
use crate::domain::entities::{ActionKind, ActionPayload};
use crate::domain::value_objects::{ActionId, BatchId, EntityType};
use crate::shared::error::AppError;
use std::sync::Arc;
use tracing::debug;

/// 1 つのユーザー操作で発生した複数のアクションを同じ `BatchId` でまとめる。
///
/// commit は記録を順番に行うだけで、まとめて 1 回の undo になるわけではない。
pub struct ActionBatch {
    batch_id: BatchId,
    log: Arc<ActionLog>,
    pending: Vec<RecordRequest>,
}

impl ActionBatch {
    pub(crate) fn new(log: Arc<ActionLog>) -> Self {
        Self {
            batch_id: BatchId::generate(),
            log,
            pending: Vec::new(),
        }
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn add_action(
        &mut self,
        kind: ActionKind,
        entity_type: EntityType,
        payload: ActionPayload,
        description: impl Into<String>,
    ) -> &mut Self {
        self.add_request(RecordRequest::new(kind, entity_type, payload, description))
    }

    /// 既存のメタデータは保ったまま batch_id だけ付け替える
    pub fn add_request(&mut self, mut request: RecordRequest) -> &mut Self {
        let metadata = request.metadata.take().unwrap_or_default();
        request.metadata = Some(metadata.with_batch(self.batch_id.clone()));
        self.pending.push(request);
        self
    }

    /// 追加した順に記録する。途中で失敗した場合、それまでに記録した分は残る。
    pub async fn commit(self) -> Result<Vec<ActionId>, AppError> {
        let mut ids = Vec::with_capacity(self.pending.len());
        for request in self.pending {
            ids.push(self.log.record(request).await?);
        }
        debug!(batch_id = %self.batch_id, actions = ids.len(), "committed batch");
        Ok(ids)
    }

    pub fn cancel(self) {
        debug!(
            batch_id = %self.batch_id,
            discarded = self.pending.len(),
            "cancelled batch"
        );
    }
}
