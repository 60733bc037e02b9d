use super::action::{Action, ActionKind, ActionPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// アダプタへ渡す再生データ。undo/redo の方向ごとにアクションから導出する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum ReplayData {
    Upsert(Value),
    UpsertMany(Vec<Value>),
    DeleteById(String),
    DeleteMany(Vec<String>),
    /// ID しか残っていない一括削除の取り消し
    RestoreIds(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDirection {
    Undo,
    Redo,
}

impl ReplayDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayDirection::Undo => "undo",
            ReplayDirection::Redo => "redo",
        }
    }
}

impl ReplayData {
    /// undo 用の逆操作データ
    pub fn inverse_of(action: &Action) -> Result<Self, String> {
        match (action.kind, &action.payload) {
            (ActionKind::Create, ActionPayload::Single { after: Some(after), .. }) => {
                Ok(Self::DeleteById(record_id(after)?))
            }
            (
                ActionKind::Update | ActionKind::Delete,
                ActionPayload::Single {
                    before: Some(before),
                    ..
                },
            ) => Ok(Self::Upsert(before.clone())),
            (
                ActionKind::BulkUpdate | ActionKind::BulkDelete,
                ActionPayload::Bulk { before, .. },
            ) => Ok(Self::UpsertMany(before.clone())),
            (ActionKind::BulkDelete, ActionPayload::Ids { ids }) => {
                Ok(Self::RestoreIds(ids.clone()))
            }
            (kind, _) => Err(format!(
                "Action {} has no inverse payload for {}",
                action.id,
                kind.as_str()
            )),
        }
    }

    /// redo 用の順方向データ
    pub fn forward_of(action: &Action) -> Result<Self, String> {
        match (action.kind, &action.payload) {
            (
                ActionKind::Create | ActionKind::Update,
                ActionPayload::Single {
                    after: Some(after), ..
                },
            ) => Ok(Self::Upsert(after.clone())),
            (
                ActionKind::Delete,
                ActionPayload::Single {
                    before: Some(before),
                    ..
                },
            ) => Ok(Self::DeleteById(record_id(before)?)),
            (ActionKind::BulkUpdate, ActionPayload::Bulk { after, .. }) => {
                Ok(Self::UpsertMany(after.clone()))
            }
            (ActionKind::BulkDelete, ActionPayload::Bulk { before, .. }) => Ok(Self::DeleteMany(
                before.iter().map(record_id).collect::<Result<Vec<_>, _>>()?,
            )),
            (ActionKind::BulkDelete, ActionPayload::Ids { ids }) => {
                Ok(Self::DeleteMany(ids.clone()))
            }
            (kind, _) => Err(format!(
                "Action {} has no forward payload for {}",
                action.id,
                kind.as_str()
            )),
        }
    }

    pub fn for_direction(action: &Action, direction: ReplayDirection) -> Result<Self, String> {
        match direction {
            ReplayDirection::Undo => Self::inverse_of(action),
            ReplayDirection::Redo => Self::forward_of(action),
        }
    }
}

/// レコードの `id` フィールドを文字列として取り出す
pub fn record_id(record: &Value) -> Result<String, String> {
    match record.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err("Record is missing an `id` field".to_string()),
    }
}
