use super::action::Action;
use super::pending_entry::PendingQueueEntry;
use serde::{Deserialize, Serialize};

/// 永続スナップショットの形式バージョン。形状を変える場合は必ず上げる。
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

pub const HISTORY_SNAPSHOT_KEY: &str = "action_log:snapshot";
pub const PENDING_QUEUE_KEY: &str = "sync:pending_queue";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub undo_stack: Vec<Action>,
    pub redo_stack: Vec<Action>,
}

impl HistorySnapshot {
    /// 読み込み時の構造検証。ID の重複があれば破損とみなす。
    pub fn is_well_formed(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.undo_stack
            .iter()
            .chain(self.redo_stack.iter())
            .all(|action| seen.insert(action.id.clone()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingQueueSnapshot {
    pub entries: Vec<PendingQueueEntry>,
}
