use crate::domain::value_objects::{EntityType, QueueEntryId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// 既存レコードを書き換えるメソッドかどうか（競合判定の対象）
    pub fn targets_existing_record(&self) -> bool {
        matches!(self, HttpMethod::Put | HttpMethod::Patch)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for HttpMethod {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("Unsupported HTTP method: {other}")),
        }
    }
}

/// 送信できなかった変更リクエスト 1 件。配送成功が確認されるまで保持する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQueueEntry {
    pub id: QueueEntryId,
    pub url: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// キューに積んだ時点でクライアントが見ていたサーバー側レコード
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_baseline: Option<Value>,
}

impl PendingQueueEntry {
    pub fn new(url: impl Into<String>, method: HttpMethod, body: Option<Value>) -> Self {
        Self {
            id: QueueEntryId::generate(),
            url: url.into(),
            method,
            headers: BTreeMap::new(),
            body,
            entity_type: None,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
            server_baseline: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    /// 編集元になったサーバー側レコードを添える。drain 時にサーバー側の変更有無をこれと比べる。
    pub fn with_server_baseline(mut self, server: Value) -> Self {
        self.server_baseline = Some(server);
        self
    }

    /// 競合解決に使うローカル側レコード
    pub fn local_record(&self) -> Option<&Value> {
        if !self.method.targets_existing_record() {
            return None;
        }
        self.body.as_ref().filter(|body| body.is_object())
    }
}
