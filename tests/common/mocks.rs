use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use rewind_sync::application::ports::{EntityAdapter, MutationDelivery};
use rewind_sync::domain::entities::{PendingQueueEntry, ReplayData, ReplayDirection, record_id};
use rewind_sync::shared::AppError;
use serde_json::Value;
use tokio::sync::Notify;

/// サーバー側のテーブルを模したアダプタ。削除されたレコードは trash に移り、RestoreIds で戻せる。
#[derive(Default)]
pub struct InMemoryRemote {
    records: Mutex<BTreeMap<String, Value>>,
    trash: Mutex<BTreeMap<String, Value>>,
    calls: Mutex<Vec<(ReplayDirection, ReplayData)>>,
    fail: AtomicBool,
    gate: Mutex<Option<std::sync::Arc<ReplayGate>>>,
    invocations: AtomicUsize,
}

/// 呼び出しを途中で止めておくためのゲート
#[derive(Default)]
pub struct ReplayGate {
    pub entered: Notify,
    pub release: Notify,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// ホスト側の「ネットワーク成功」を模して直接反映する
    pub fn apply(&self, data: &ReplayData) -> Result<(), AppError> {
        let mut records = self.records.lock().expect("records lock");
        let mut trash = self.trash.lock().expect("trash lock");
        match data {
            ReplayData::Upsert(record) => {
                let id = record_id(record).map_err(AppError::ValidationError)?;
                trash.remove(&id);
                records.insert(id, record.clone());
            }
            ReplayData::UpsertMany(list) => {
                for record in list {
                    let id = record_id(record).map_err(AppError::ValidationError)?;
                    trash.remove(&id);
                    records.insert(id, record.clone());
                }
            }
            ReplayData::DeleteById(id) => {
                if let Some(record) = records.remove(id) {
                    trash.insert(id.clone(), record);
                }
            }
            ReplayData::DeleteMany(ids) => {
                for id in ids {
                    if let Some(record) = records.remove(id) {
                        trash.insert(id.clone(), record);
                    }
                }
            }
            ReplayData::RestoreIds(ids) => {
                for id in ids {
                    let record = trash
                        .remove(id)
                        .ok_or_else(|| AppError::RemoteOperation(format!("{id} not in trash")))?;
                    records.insert(id.clone(), record);
                }
            }
        }
        Ok(())
    }

    pub fn records(&self) -> BTreeMap<String, Value> {
        self.records.lock().expect("records lock").clone()
    }

    pub fn calls(&self) -> Vec<(ReplayDirection, ReplayData)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn install_gate(&self) -> std::sync::Arc<ReplayGate> {
        let gate = std::sync::Arc::new(ReplayGate::default());
        *self.gate.lock().expect("gate lock") = Some(gate.clone());
        gate
    }

    async fn replay(&self, direction: ReplayDirection, data: ReplayData) -> Result<(), AppError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().expect("gate lock").take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::RemoteOperation("remote unavailable".to_string()));
        }
        self.apply(&data)?;
        self.calls
            .lock()
            .expect("calls lock")
            .push((direction, data));
        Ok(())
    }
}

#[async_trait]
impl EntityAdapter for InMemoryRemote {
    async fn undo(&self, data: ReplayData) -> Result<(), AppError> {
        self.replay(ReplayDirection::Undo, data).await
    }

    async fn redo(&self, data: ReplayData) -> Result<(), AppError> {
        self.replay(ReplayDirection::Redo, data).await
    }
}

/// URL 単位で失敗を仕込める配送モック
#[derive(Default)]
pub struct ScriptedDelivery {
    failing: Mutex<HashSet<String>>,
    delivered: Mutex<Vec<PendingQueueEntry>>,
    server_records: Mutex<BTreeMap<String, Value>>,
}

impl ScriptedDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_url(&self, url: &str) {
        self.failing.lock().expect("failing lock").insert(url.to_string());
    }

    pub fn heal_url(&self, url: &str) {
        self.failing.lock().expect("failing lock").remove(url);
    }

    pub fn set_server_record(&self, url: &str, record: Value) {
        self.server_records
            .lock()
            .expect("server lock")
            .insert(url.to_string(), record);
    }

    pub fn delivered_urls(&self) -> Vec<String> {
        self.delivered
            .lock()
            .expect("delivered lock")
            .iter()
            .map(|entry| entry.url.clone())
            .collect()
    }
}

#[async_trait]
impl MutationDelivery for ScriptedDelivery {
    async fn deliver(&self, entry: &PendingQueueEntry) -> Result<(), AppError> {
        if self.failing.lock().expect("failing lock").contains(&entry.url) {
            return Err(AppError::SyncDelivery(format!(
                "{} {} -> 503",
                entry.method, entry.url
            )));
        }
        self.delivered
            .lock()
            .expect("delivered lock")
            .push(entry.clone());
        Ok(())
    }

    async fn fetch_current(&self, entry: &PendingQueueEntry) -> Result<Option<Value>, AppError> {
        Ok(self
            .server_records
            .lock()
            .expect("server lock")
            .get(&entry.url)
            .cloned())
    }
}
