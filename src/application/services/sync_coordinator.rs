use crate::application::ports::{ConnectivitySignal, MutationDelivery};
use crate::application::services::offline_cache_service::OfflineCacheService;
use crate::domain::entities::{PENDING_QUEUE_KEY, PendingQueueEntry, PendingQueueSnapshot};
use crate::domain::value_objects::QueueEntryId;
use crate::shared::config::SyncConfig;
use crate::shared::error::AppError;
use crate::shared::metrics::{DeliveryMetrics, DeliveryStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Delivered(PendingQueueEntry),
    /// サーバー側の方が新しかったため破棄した
    Superseded {
        entry: PendingQueueEntry,
        server: Value,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub delivered: usize,
    pub superseded: usize,
    pub failed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    Local,
    Server,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    pub winner: ConflictWinner,
    pub record: Value,
}

/// last-write-wins。`updatedAt`（または `updated_at`）が厳密に新しい方を採用する。
///
/// 同時刻はサーバー優先。どちらにも時刻が無い場合もサーバー優先になり、
/// ローカルの変更は失われる。
pub fn resolve_conflict(local: &Value, server: &Value) -> ConflictResolution {
    let winner = match (updated_at(local), updated_at(server)) {
        (Some(local_at), Some(server_at)) if local_at > server_at => ConflictWinner::Local,
        (Some(_), Some(_)) => ConflictWinner::Server,
        (Some(_), None) => ConflictWinner::Local,
        (None, Some(_)) => ConflictWinner::Server,
        (None, None) => {
            warn!("neither record carries updatedAt; keeping server copy");
            ConflictWinner::Server
        }
    };

    let record = match winner {
        ConflictWinner::Local => local.clone(),
        ConflictWinner::Server => server.clone(),
    };
    ConflictResolution { winner, record }
}

/// RFC3339 文字列か UNIX ミリ秒を受け付ける。解釈できない値は時刻なしとみなす。
fn updated_at(record: &Value) -> Option<DateTime<Utc>> {
    let raw = record
        .get("updatedAt")
        .or_else(|| record.get("updated_at"))?;
    match raw {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|at| at.with_timezone(&Utc)),
        Value::Number(number) => number.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// 積んだ時点の版があればそれと比べる。無ければ積んだ後にサーバー側で更新されたかを時刻で見る。
fn server_changed_since_queued(entry: &PendingQueueEntry, server: &Value) -> bool {
    match &entry.server_baseline {
        Some(baseline) => match (updated_at(baseline), updated_at(server)) {
            (Some(before), Some(now)) => now != before,
            _ => baseline != server,
        },
        None => updated_at(server).is_some_and(|at| at > entry.enqueued_at),
    }
}

/// 時刻を持たない body は積んだ時刻を編集時刻として扱う
fn stamped_with_edit_time(local: &Value, edited_at: DateTime<Utc>) -> Value {
    let mut local = local.clone();
    if updated_at(&local).is_none() {
        if let Value::Object(fields) = &mut local {
            if !fields.contains_key("updatedAt") && !fields.contains_key("updated_at") {
                fields.insert("updatedAt".to_string(), Value::String(edited_at.to_rfc3339()));
            }
        }
    }
    local
}

enum Outcome {
    Delivered,
    Superseded(Value),
}

pub struct SyncCoordinator {
    queue: RwLock<VecDeque<PendingQueueEntry>>,
    cache: OfflineCacheService,
    delivery: Arc<dyn MutationDelivery>,
    connectivity: ConnectivitySignal,
    drain_gate: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
    metrics: DeliveryMetrics,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// 永続化されたキューを復元する。`auto_drain` が有効なら再接続監視も開始する。
    pub async fn init(
        config: &SyncConfig,
        cache: OfflineCacheService,
        delivery: Arc<dyn MutationDelivery>,
        connectivity: ConnectivitySignal,
    ) -> Arc<Self> {
        let queue: VecDeque<PendingQueueEntry> = cache
            .load::<PendingQueueSnapshot>(PENDING_QUEUE_KEY)
            .await
            .map(|snapshot| snapshot.entries.into())
            .unwrap_or_default();
        if !queue.is_empty() {
            info!(pending = queue.len(), "restored pending queue");
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let coordinator = Arc::new(Self {
            queue: RwLock::new(queue),
            cache,
            delivery,
            connectivity,
            drain_gate: Mutex::new(()),
            events,
            metrics: DeliveryMetrics::new(),
            watcher: Mutex::new(None),
        });

        if config.auto_drain {
            let handle = coordinator.spawn_reconnect_watcher(config.drain_interval);
            *coordinator.watcher.lock().await = Some(handle);
        }
        coordinator
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn connectivity(&self) -> &ConnectivitySignal {
        &self.connectivity
    }

    /// 送信できなかった変更をキュー末尾に追加して永続化する
    pub async fn enqueue(&self, entry: PendingQueueEntry) -> QueueEntryId {
        let id = entry.id.clone();
        let mut queue = self.queue.write().await;
        debug!(entry_id = %id, method = entry.method.as_str(), url = %entry.url, "queued mutation");
        queue.push_back(entry);
        self.persist(&queue).await;
        id
    }

    pub async fn pending(&self) -> Vec<PendingQueueEntry> {
        self.queue.read().await.iter().cloned().collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.read().await.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> DeliveryStats {
        self.metrics.snapshot()
    }

    /// キューを先頭から順に送る。失敗したエントリは残して次へ進む。
    pub async fn drain(&self) -> DrainReport {
        let _gate = self.drain_gate.lock().await;
        let mut report = DrainReport::default();

        if !self.is_online() {
            report.remaining = self.pending_count().await;
            debug!(remaining = report.remaining, "offline; drain skipped");
            return report;
        }

        let started = Instant::now();
        // 実行中に追加されたエントリは次回に回す
        let snapshot = self.pending().await;
        for entry in snapshot {
            if !self.is_online() {
                debug!("connectivity lost during drain");
                break;
            }

            match self.deliver_one(&entry).await {
                Ok(Outcome::Delivered) => {
                    self.metrics.record_delivered();
                    self.remove(&entry.id).await;
                    report.delivered += 1;
                    debug!(entry_id = %entry.id, "delivered pending mutation");
                    let _ = self.events.send(SyncEvent::Delivered(entry));
                }
                Ok(Outcome::Superseded(server)) => {
                    self.metrics.record_superseded();
                    self.remove(&entry.id).await;
                    report.superseded += 1;
                    info!(entry_id = %entry.id, "pending mutation superseded by server record");
                    let _ = self.events.send(SyncEvent::Superseded { entry, server });
                }
                Err(err) => {
                    self.metrics.record_failed();
                    report.failed += 1;
                    warn!(
                        entry_id = %entry.id,
                        attempts = entry.attempts + 1,
                        error = %err,
                        "pending mutation delivery failed; keeping entry"
                    );
                    self.mark_failed(&entry.id, &err).await;
                }
            }
        }

        report.remaining = self.pending_count().await;
        self.metrics.record_drain(started.elapsed());
        info!(
            delivered = report.delivered,
            superseded = report.superseded,
            failed = report.failed,
            remaining = report.remaining,
            "drain finished"
        );
        report
    }

    async fn deliver_one(&self, entry: &PendingQueueEntry) -> Result<Outcome, AppError> {
        if let Some(local) = entry.local_record() {
            if let Some(server) = self.delivery.fetch_current(entry).await? {
                // 部分更新の body はサーバーのレコードと一致しないので、比べる相手は積んだ時点の版
                if server_changed_since_queued(entry, &server) {
                    let local = stamped_with_edit_time(local, entry.enqueued_at);
                    if resolve_conflict(&local, &server).winner == ConflictWinner::Server {
                        return Ok(Outcome::Superseded(server));
                    }
                    debug!(entry_id = %entry.id, "local edit is newer than server change");
                }
            }
        }
        self.delivery.deliver(entry).await?;
        Ok(Outcome::Delivered)
    }

    async fn remove(&self, id: &QueueEntryId) {
        let mut queue = self.queue.write().await;
        queue.retain(|entry| &entry.id != id);
        self.persist(&queue).await;
    }

    async fn mark_failed(&self, id: &QueueEntryId, err: &AppError) {
        let mut queue = self.queue.write().await;
        if let Some(entry) = queue.iter_mut().find(|entry| &entry.id == id) {
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_error = Some(err.to_string());
        }
        self.persist(&queue).await;
    }

    /// キューのロックを持ったまま呼び、書き込み順を変更順と揃える
    async fn persist(&self, queue: &VecDeque<PendingQueueEntry>) {
        let snapshot = PendingQueueSnapshot {
            entries: queue.iter().cloned().collect(),
        };
        if !self.cache.store(PENDING_QUEUE_KEY, &snapshot).await && self.cache.is_durable() {
            let err = AppError::Persistence("pending queue was not written".to_string());
            warn!(error = %err, "continuing with in-memory queue");
        }
    }

    /// オフライン → オンラインの遷移ごとに drain する。`interval_secs` > 0 なら定期実行も行う。
    pub fn spawn_reconnect_watcher(self: &Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let mut online_rx = self.connectivity.subscribe();
        // spawn 前に現在値を読んでおき、直後の遷移を取りこぼさない
        let mut was_online = *online_rx.borrow_and_update();
        let mut ticker = (interval_secs > 0).then(|| {
            let period = Duration::from_secs(interval_secs);
            tokio::time::interval_at(Instant::now() + period, period)
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *online_rx.borrow_and_update();
                        let reconnected = online && !was_online;
                        was_online = online;
                        if !reconnected {
                            continue;
                        }
                        let Some(coordinator) = coordinator.upgrade() else {
                            break;
                        };
                        info!("connectivity restored; draining pending queue");
                        coordinator.drain().await;
                    }
                    _ = next_tick(&mut ticker) => {
                        let Some(coordinator) = coordinator.upgrade() else {
                            break;
                        };
                        if coordinator.is_online() && coordinator.pending_count().await > 0 {
                            coordinator.drain().await;
                        }
                    }
                }
            }
            debug!("reconnect watcher stopped");
        })
    }

    /// 再接続監視を止める。キューは各変更の時点で永続化済み。
    pub async fn shutdown(&self) {
        if let Some(handle) = self.watcher.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!("sync coordinator shut down");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::offline_cache_service::cache_store_schema;
    use crate::domain::entities::HttpMethod;
    use crate::infrastructure::storage::MemoryDurableStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct ScriptedDelivery {
        failing_urls: StdMutex<HashSet<String>>,
        delivered: StdMutex<Vec<String>>,
        server_record: StdMutex<Option<Value>>,
    }

    impl ScriptedDelivery {
        fn fail(&self, url: &str) {
            self.failing_urls.lock().unwrap().insert(url.to_string());
        }

        fn recover(&self, url: &str) {
            self.failing_urls.lock().unwrap().remove(url);
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MutationDelivery for ScriptedDelivery {
        async fn deliver(&self, entry: &PendingQueueEntry) -> Result<(), AppError> {
            if self.failing_urls.lock().unwrap().contains(&entry.url) {
                return Err(AppError::SyncDelivery(format!("503 for {}", entry.url)));
            }
            self.delivered.lock().unwrap().push(entry.url.clone());
            Ok(())
        }

        async fn fetch_current(
            &self,
            _entry: &PendingQueueEntry,
        ) -> Result<Option<Value>, AppError> {
            Ok(self.server_record.lock().unwrap().clone())
        }
    }

    fn cache() -> OfflineCacheService {
        OfflineCacheService::new(Arc::new(
            MemoryDurableStore::open("test", 1, cache_store_schema()).unwrap(),
        ))
    }

    fn manual() -> SyncConfig {
        SyncConfig {
            auto_drain: false,
            drain_interval: 0,
        }
    }

    async fn setup(
        online: bool,
    ) -> (Arc<SyncCoordinator>, Arc<ScriptedDelivery>, OfflineCacheService) {
        let delivery = Arc::new(ScriptedDelivery::default());
        let cache = cache();
        let coordinator = SyncCoordinator::init(
            &manual(),
            cache.clone(),
            delivery.clone(),
            ConnectivitySignal::new(online),
        )
        .await;
        (coordinator, delivery, cache)
    }

    fn post(url: &str) -> PendingQueueEntry {
        PendingQueueEntry::new(url, HttpMethod::Post, Some(json!({"amount": 1})))
    }

    #[test]
    fn later_local_timestamp_wins() {
        let local = json!({"id": "1", "updatedAt": "2024-05-01T10:00:01Z"});
        let server = json!({"id": "1", "updatedAt": "2024-05-01T10:00:00Z"});
        let resolution = resolve_conflict(&local, &server);
        assert_eq!(resolution.winner, ConflictWinner::Local);
        assert_eq!(resolution.record, local);
    }

    #[test]
    fn tie_goes_to_server() {
        let local = json!({"id": "1", "updatedAt": "2024-05-01T10:00:00Z", "v": "local"});
        let server = json!({"id": "1", "updatedAt": "2024-05-01T10:00:00+00:00", "v": "server"});
        assert_eq!(resolve_conflict(&local, &server).winner, ConflictWinner::Server);
    }

    #[test]
    fn missing_timestamps_fall_back_to_server() {
        let local = json!({"id": "1", "v": "local"});
        let server = json!({"id": "1", "v": "server"});
        let resolution = resolve_conflict(&local, &server);
        assert_eq!(resolution.winner, ConflictWinner::Server);
        assert_eq!(resolution.record, server);
    }

    #[test]
    fn single_sided_timestamp_and_snake_case_field() {
        let local = json!({"id": "1", "updated_at": 1_714_557_600_000_i64});
        let server = json!({"id": "1"});
        assert_eq!(resolve_conflict(&local, &server).winner, ConflictWinner::Local);
        assert_eq!(resolve_conflict(&server, &local).winner, ConflictWinner::Server);
    }

    #[tokio::test]
    async fn drain_is_fifo_and_keeps_failures() {
        let (coordinator, delivery, _) = setup(true).await;
        coordinator.enqueue(post("/a")).await;
        coordinator.enqueue(post("/b")).await;
        coordinator.enqueue(post("/c")).await;
        delivery.fail("/b");

        let report = coordinator.drain().await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(delivery.delivered(), vec!["/a", "/c"]);

        let pending = coordinator.pending().await;
        assert_eq!(pending[0].url, "/b");
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());

        let metrics = coordinator.metrics();
        assert_eq!(metrics.delivered, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.superseded, 0);
        assert_eq!(metrics.drains, 1);
        assert!(metrics.last_drain_duration_ms.is_some());

        delivery.recover("/b");
        let report = coordinator.drain().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn offline_drain_attempts_nothing() {
        let (coordinator, delivery, _) = setup(false).await;
        coordinator.enqueue(post("/a")).await;

        let report = coordinator.drain().await;
        assert_eq!(report, DrainReport { remaining: 1, ..DrainReport::default() });
        assert!(delivery.delivered().is_empty());
        assert_eq!(coordinator.metrics().drains, 0);
    }

    #[tokio::test]
    async fn newer_server_record_supersedes_entry() {
        let (coordinator, delivery, _) = setup(true).await;
        *delivery.server_record.lock().unwrap() =
            Some(json!({"id": "t1", "amount": 9, "updatedAt": "2024-05-02T00:00:00Z"}));
        let mut events = coordinator.subscribe();

        coordinator
            .enqueue(
                PendingQueueEntry::new(
                    "/transactions/t1",
                    HttpMethod::Put,
                    Some(json!({"id": "t1", "amount": 5, "updatedAt": "2024-05-01T00:00:00Z"})),
                )
                .with_server_baseline(
                    json!({"id": "t1", "amount": 4, "updatedAt": "2024-04-30T00:00:00Z"}),
                ),
            )
            .await;

        let report = coordinator.drain().await;
        assert_eq!(report.superseded, 1);
        assert_eq!(report.remaining, 0);
        assert!(delivery.delivered().is_empty());
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Superseded { .. }));
        assert_eq!(coordinator.metrics().superseded, 1);
    }

    #[tokio::test]
    async fn partial_patch_against_unchanged_server_record_is_delivered() {
        let (coordinator, delivery, _) = setup(false).await;
        *delivery.server_record.lock().unwrap() =
            Some(json!({"id": "42", "amount": 10, "updatedAt": "2024-01-01T00:00:00Z"}));

        coordinator
            .enqueue(PendingQueueEntry::new(
                "/bills/42",
                HttpMethod::Patch,
                Some(json!({"amount": 99})),
            ))
            .await;
        coordinator.connectivity().set_online(true);

        let report = coordinator.drain().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.superseded, 0);
        assert_eq!(delivery.delivered(), vec!["/bills/42"]);
    }

    #[tokio::test]
    async fn unchanged_baseline_without_timestamps_is_delivered() {
        let (coordinator, delivery, _) = setup(true).await;
        let server = json!({"id": "42", "amount": 10});
        *delivery.server_record.lock().unwrap() = Some(server.clone());

        coordinator
            .enqueue(
                PendingQueueEntry::new("/bills/42", HttpMethod::Put, Some(json!({"id": "42"})))
                    .with_server_baseline(server),
            )
            .await;

        let report = coordinator.drain().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.superseded, 0);
    }

    #[tokio::test]
    async fn server_edit_after_queueing_supersedes_untimestamped_body() {
        let (coordinator, delivery, _) = setup(true).await;
        let later = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        *delivery.server_record.lock().unwrap() =
            Some(json!({"id": "42", "amount": 10, "updatedAt": later}));

        coordinator
            .enqueue(PendingQueueEntry::new(
                "/bills/42",
                HttpMethod::Patch,
                Some(json!({"amount": 99})),
            ))
            .await;

        let report = coordinator.drain().await;
        assert_eq!(report.superseded, 1);
        assert!(delivery.delivered().is_empty());
    }

    #[test]
    fn edit_time_is_added_only_when_body_has_none() {
        let at = DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let stamped = stamped_with_edit_time(&json!({"amount": 1}), at);
        assert_eq!(updated_at(&stamped), Some(at));

        let own = json!({"amount": 1, "updated_at": "2024-01-01T00:00:00Z"});
        assert_eq!(stamped_with_edit_time(&own, at), own);
    }

    #[tokio::test]
    async fn newer_local_record_is_delivered() {
        let (coordinator, delivery, _) = setup(true).await;
        *delivery.server_record.lock().unwrap() =
            Some(json!({"id": "t1", "amount": 9, "updatedAt": "2024-05-01T00:00:00Z"}));

        coordinator
            .enqueue(PendingQueueEntry::new(
                "/transactions/t1",
                HttpMethod::Put,
                Some(json!({"id": "t1", "amount": 5, "updatedAt": "2024-05-02T00:00:00Z"})),
            ))
            .await;

        let report = coordinator.drain().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(delivery.delivered(), vec!["/transactions/t1"]);
    }

    #[tokio::test]
    async fn queue_survives_restart() {
        let (coordinator, _, cache) = setup(false).await;
        coordinator.enqueue(post("/a")).await;
        coordinator.enqueue(post("/b")).await;
        coordinator.shutdown().await;

        let restored = SyncCoordinator::init(
            &manual(),
            cache,
            Arc::new(ScriptedDelivery::default()),
            ConnectivitySignal::new(false),
        )
        .await;
        let urls: Vec<String> = restored.pending().await.into_iter().map(|e| e.url).collect();
        assert_eq!(urls, vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn reconnect_triggers_drain() {
        let delivery = Arc::new(ScriptedDelivery::default());
        let signal = ConnectivitySignal::new(false);
        let coordinator = SyncCoordinator::init(
            &SyncConfig {
                auto_drain: true,
                drain_interval: 0,
            },
            cache(),
            delivery.clone(),
            signal.clone(),
        )
        .await;
        let mut events = coordinator.subscribe();
        coordinator.enqueue(post("/a")).await;

        signal.set_online(true);
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SyncEvent::Delivered(entry) if entry.url == "/a"));
        assert_eq!(coordinator.pending_count().await, 0);

        coordinator.shutdown().await;
    }
}
