use crate::domain::value_objects::{ActionId, BatchId, EntityType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    BulkUpdate,
    BulkDelete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::BulkUpdate => "bulk_update",
            ActionKind::BulkDelete => "bulk_delete",
        }
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self, ActionKind::BulkUpdate | ActionKind::BulkDelete)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ActionPayload {
    Single {
        before: Option<Value>,
        after: Option<Value>,
    },
    Bulk {
        before: Vec<Value>,
        after: Vec<Value>,
    },
    Ids {
        ids: Vec<String>,
    },
}

impl ActionPayload {
    pub fn created(after: Value) -> Self {
        Self::Single {
            before: None,
            after: Some(after),
        }
    }

    pub fn updated(before: Value, after: Value) -> Self {
        Self::Single {
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn deleted(before: Value) -> Self {
        Self::Single {
            before: Some(before),
            after: None,
        }
    }

    pub fn bulk(before: Vec<Value>, after: Vec<Value>) -> Self {
        Self::Bulk { before, after }
    }

    /// 種別と形状の組み合わせを検証する
    pub fn validate_for(&self, kind: ActionKind) -> Result<(), String> {
        match (kind, self) {
            (ActionKind::Create, ActionPayload::Single { after: Some(_), .. }) => Ok(()),
            (ActionKind::Create, _) => Err("Create action requires an `after` payload".into()),
            (
                ActionKind::Update,
                ActionPayload::Single {
                    before: Some(_),
                    after: Some(_),
                },
            ) => Ok(()),
            (ActionKind::Update, _) => {
                Err("Update action requires both `before` and `after` payloads".into())
            }
            (ActionKind::Delete, ActionPayload::Single { before: Some(_), .. }) => Ok(()),
            (ActionKind::Delete, _) => Err("Delete action requires a `before` payload".into()),
            (ActionKind::BulkUpdate, ActionPayload::Bulk { .. }) => Ok(()),
            (ActionKind::BulkUpdate, _) => {
                Err("BulkUpdate action requires `before`/`after` lists".into())
            }
            (ActionKind::BulkDelete, ActionPayload::Bulk { .. } | ActionPayload::Ids { .. }) => {
                Ok(())
            }
            (ActionKind::BulkDelete, _) => {
                Err("BulkDelete action requires a `before` list or `ids`".into())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    #[default]
    Manual,
    Import,
    Automation,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub source: ActionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
}

impl ActionMetadata {
    pub fn new(source: ActionSource) -> Self {
        Self {
            source,
            batch_id: None,
        }
    }

    pub fn with_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }
}

/// 完了済みの変更 1 件の不変な記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    pub entity_type: EntityType,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub payload: ActionPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ActionMetadata>,
}

impl Action {
    pub fn new(
        kind: ActionKind,
        entity_type: EntityType,
        payload: ActionPayload,
        description: String,
        metadata: Option<ActionMetadata>,
    ) -> Result<Self, String> {
        payload.validate_for(kind)?;
        Ok(Self {
            id: ActionId::generate(),
            kind,
            entity_type,
            timestamp: Utc::now(),
            description,
            payload,
            metadata,
        })
    }

    pub fn batch_id(&self) -> Option<&BatchId> {
        self.metadata.as_ref().and_then(|m| m.batch_id.as_ref())
    }
}
