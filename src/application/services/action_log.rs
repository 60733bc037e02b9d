//! undo/redo スタックの管理。
//!
//! - `record` は undo スタックの先頭に積み、redo スタックを空にする（分岐しない履歴）
//! - undo/redo はアダプタ呼び出しが成功した場合だけスタックを移動する
//! - 再入ガードは 1 つのアトミックなフェーズで持つため、undo 中と redo 中が同時に立つことはない
//! - スナップショットの書き込みは専用タスクへ順番に流し、呼び出し元は待たない

use crate::application::services::action_batch::ActionBatch;
use crate::application::services::adapter_registry::AdapterRegistry;
use crate::application::services::offline_cache_service::OfflineCacheService;
use crate::domain::entities::{
    Action, ActionKind, ActionMetadata, ActionPayload, HISTORY_SNAPSHOT_KEY, HistorySnapshot,
    ReplayData, ReplayDirection,
};
use crate::domain::value_objects::{ActionId, EntityType};
use crate::shared::config::HistoryConfig;
use crate::shared::error::AppError;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RecordRequest {
    pub kind: ActionKind,
    pub entity_type: EntityType,
    pub payload: ActionPayload,
    pub description: String,
    pub metadata: Option<ActionMetadata>,
}

impl RecordRequest {
    pub fn new(
        kind: ActionKind,
        entity_type: EntityType,
        payload: ActionPayload,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity_type,
            payload,
            description: description.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: ActionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// 購読者へ渡す状態。スタックはどちらも新しい順。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogState {
    pub undo_stack: Vec<Action>,
    pub redo_stack: Vec<Action>,
    pub is_undoing: bool,
    pub is_redoing: bool,
}

impl ActionLogState {
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty() && !self.is_undoing && !self.is_redoing
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty() && !self.is_undoing && !self.is_redoing
    }
}

const PHASE_IDLE: u8 = 0;
const PHASE_UNDOING: u8 = 1;
const PHASE_REDOING: u8 = 2;

fn phase_for(direction: ReplayDirection) -> u8 {
    match direction {
        ReplayDirection::Undo => PHASE_UNDOING,
        ReplayDirection::Redo => PHASE_REDOING,
    }
}

/// 成功・失敗どちらの経路でもフェーズを戻す
struct PhaseGuard<'a> {
    phase: &'a AtomicU8,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(PHASE_IDLE, Ordering::Release);
    }
}

#[derive(Default)]
struct Stacks {
    undo: VecDeque<Action>,
    redo: VecDeque<Action>,
    /// record のたびに進む。replay 中に履歴が進んだかの判定に使う
    generation: u64,
}

impl Stacks {
    fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            undo_stack: self.undo.iter().cloned().collect(),
            redo_stack: self.redo.iter().cloned().collect(),
        }
    }

    fn source_mut(&mut self, direction: ReplayDirection) -> &mut VecDeque<Action> {
        match direction {
            ReplayDirection::Undo => &mut self.undo,
            ReplayDirection::Redo => &mut self.redo,
        }
    }

    fn source(&self, direction: ReplayDirection) -> &VecDeque<Action> {
        match direction {
            ReplayDirection::Undo => &self.undo,
            ReplayDirection::Redo => &self.redo,
        }
    }

    fn enforce_capacity(&mut self, max_stack_size: usize) {
        while self.undo.len() > max_stack_size {
            if let Some(evicted) = self.undo.pop_back() {
                debug!(action_id = %evicted.id, "evicted oldest action from undo stack");
            }
        }
    }
}

type Listener = Arc<dyn Fn(&ActionLogState) + Send + Sync>;

#[derive(Default)]
struct ListenerSet {
    next_id: AtomicU64,
    listeners: StdMutex<Vec<(u64, Listener)>>,
}

impl ListenerSet {
    fn add(&self, listener: Listener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, listener));
        id
    }

    fn remove(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(listener_id, _)| *listener_id != id);
    }

    fn notify(&self, state: &ActionLogState) {
        // 呼び出し中に購読解除されてもよいよう写しを取ってから呼ぶ
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(state);
        }
    }

    fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// `subscribe` が返す購読ハンドル。drop または `unsubscribe` で解除される。
#[must_use = "dropping a Subscription removes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerSet>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

enum PersistCommand {
    Snapshot(HistorySnapshot),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

pub struct ActionLog {
    max_stack_size: usize,
    stacks: RwLock<Stacks>,
    phase: AtomicU8,
    registry: Arc<AdapterRegistry>,
    listeners: Arc<ListenerSet>,
    persist_tx: mpsc::UnboundedSender<PersistCommand>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl ActionLog {
    /// 永続スナップショットから復元して起動する。tokio ランタイム上で呼ぶこと。
    pub async fn init(
        config: &HistoryConfig,
        registry: Arc<AdapterRegistry>,
        cache: OfflineCacheService,
    ) -> Result<Arc<Self>, AppError> {
        if config.max_stack_size == 0 {
            return Err(AppError::ConfigurationError(
                "max_stack_size must be greater than 0".to_string(),
            ));
        }

        let mut stacks = Stacks::default();
        if let Some(snapshot) = cache
            .load_validated(HISTORY_SNAPSHOT_KEY, HistorySnapshot::is_well_formed)
            .await
        {
            stacks.undo = snapshot.undo_stack.into();
            stacks.redo = snapshot.redo_stack.into();
            stacks.enforce_capacity(config.max_stack_size);
            info!(
                undo = stacks.undo.len(),
                redo = stacks.redo.len(),
                "restored action history"
            );
        }

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(cache, persist_rx));

        Ok(Arc::new(Self {
            max_stack_size: config.max_stack_size,
            stacks: RwLock::new(stacks),
            phase: AtomicU8::new(PHASE_IDLE),
            registry,
            listeners: Arc::new(ListenerSet::default()),
            persist_tx,
            writer: Mutex::new(Some(writer)),
        }))
    }

    pub fn max_stack_size(&self) -> usize {
        self.max_stack_size
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// 完了済みの変更を記録する
    pub async fn record(&self, request: RecordRequest) -> Result<ActionId, AppError> {
        let action = Action::new(
            request.kind,
            request.entity_type,
            request.payload,
            request.description,
            request.metadata,
        )
        .map_err(AppError::ValidationError)?;
        let action_id = action.id.clone();

        let state = {
            let mut stacks = self.stacks.write().await;
            stacks.undo.push_front(action);
            stacks.enforce_capacity(self.max_stack_size);
            stacks.redo.clear();
            stacks.generation = stacks.generation.wrapping_add(1);
            self.schedule_persist(stacks.snapshot());
            self.state_from(&stacks)
        };

        debug!(action_id = %action_id, "recorded action");
        self.listeners.notify(&state);
        Ok(action_id)
    }

    /// 直前のアクションを取り消す。取り消せる対象がない・再生中なら `Ok(false)`。
    pub async fn undo(&self) -> Result<bool, AppError> {
        self.replay(ReplayDirection::Undo).await
    }

    /// 直前に取り消したアクションをやり直す
    pub async fn redo(&self) -> Result<bool, AppError> {
        self.replay(ReplayDirection::Redo).await
    }

    async fn replay(&self, direction: ReplayDirection) -> Result<bool, AppError> {
        if self.stacks.read().await.source(direction).is_empty() {
            return Ok(false);
        }
        if self
            .phase
            .compare_exchange(
                PHASE_IDLE,
                phase_for(direction),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(direction = direction.as_str(), "replay already in flight");
            return Ok(false);
        }
        let _guard = PhaseGuard { phase: &self.phase };

        let (action, generation) = {
            let stacks = self.stacks.read().await;
            match stacks.source(direction).front() {
                Some(action) => (action.clone(), stacks.generation),
                None => return Ok(false),
            }
        };

        let adapter = self.registry.resolve(&action.entity_type)?;
        let data =
            ReplayData::for_direction(&action, direction).map_err(AppError::ValidationError)?;

        let outcome = match direction {
            ReplayDirection::Undo => adapter.undo(data).await,
            ReplayDirection::Redo => adapter.redo(data).await,
        };
        if let Err(err) = outcome {
            warn!(
                action_id = %action.id,
                entity_type = %action.entity_type,
                direction = direction.as_str(),
                error = %err,
                "replay failed; history unchanged"
            );
            return Err(err);
        }

        let state = {
            let mut stacks = self.stacks.write().await;
            let advanced = stacks.generation != generation;
            let source = stacks.source_mut(direction);
            let position = source.iter().position(|a| a.id == action.id);
            let moved = position.and_then(|index| source.remove(index));
            match (direction, moved) {
                // 取り消し中に新しい記録が入った。redo に積むと履歴が分岐する
                (ReplayDirection::Undo, Some(_)) if advanced => {
                    debug!(action_id = %action.id, "history advanced during undo; not redoable");
                }
                (ReplayDirection::Undo, Some(moved)) => stacks.redo.push_front(moved),
                (ReplayDirection::Redo, Some(moved)) => {
                    stacks.undo.push_front(moved);
                    stacks.enforce_capacity(self.max_stack_size);
                }
                // redo 中の record で redo スタックは空になったが、変更自体は適用済み
                (ReplayDirection::Redo, None) if advanced => {
                    stacks.undo.push_front(action.clone());
                    stacks.enforce_capacity(self.max_stack_size);
                }
                (_, None) => {
                    warn!(action_id = %action.id, "action left history during replay");
                }
            }
            self.schedule_persist(stacks.snapshot());
            // ガード解除前なのでフラグは立ったまま。通知では解除後の状態を見せる
            let mut state = self.state_from(&stacks);
            state.is_undoing = false;
            state.is_redoing = false;
            state
        };

        debug!(
            action_id = %action.id,
            direction = direction.as_str(),
            "replayed action"
        );
        self.listeners.notify(&state);
        Ok(true)
    }

    /// 両スタックを空にする。ローカルのみの操作でアダプタは呼ばない。
    pub async fn clear_history(&self) {
        let state = {
            let mut stacks = self.stacks.write().await;
            stacks.undo.clear();
            stacks.redo.clear();
            self.schedule_persist(stacks.snapshot());
            self.state_from(&stacks)
        };
        info!("cleared action history");
        self.listeners.notify(&state);
    }

    pub async fn can_undo(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_IDLE
            && !self.stacks.read().await.undo.is_empty()
    }

    pub async fn can_redo(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_IDLE
            && !self.stacks.read().await.redo.is_empty()
    }

    pub fn is_undoing(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_UNDOING
    }

    pub fn is_redoing(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_REDOING
    }

    pub async fn state(&self) -> ActionLogState {
        let stacks = self.stacks.read().await;
        self.state_from(&stacks)
    }

    /// 次に取り消されるアクション（"Undo: ..." 表示用）
    pub async fn peek_undo(&self) -> Option<Action> {
        self.stacks.read().await.undo.front().cloned()
    }

    pub async fn peek_redo(&self) -> Option<Action> {
        self.stacks.read().await.redo.front().cloned()
    }

    pub fn create_batch(self: &Arc<Self>) -> ActionBatch {
        ActionBatch::new(Arc::clone(self))
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ActionLogState) + Send + Sync + 'static,
    {
        let id = self.listeners.add(Arc::new(listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    /// 送信済みのスナップショット書き込みが終わるまで待つ
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.persist_tx.send(PersistCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// 残りの書き込みを済ませて書き込みタスクを止める
    pub async fn shutdown(&self) {
        let handle = self.writer.lock().await.take();
        let Some(handle) = handle else {
            return;
        };
        if self.persist_tx.send(PersistCommand::Shutdown).is_err() {
            debug!("history writer already stopped");
        }
        if let Err(err) = handle.await {
            warn!(error = %err, "history writer terminated abnormally");
        }
        info!("action log shut down");
    }

    fn schedule_persist(&self, snapshot: HistorySnapshot) {
        if self
            .persist_tx
            .send(PersistCommand::Snapshot(snapshot))
            .is_err()
        {
            debug!("history writer stopped; snapshot kept in memory only");
        }
    }

    fn state_from(&self, stacks: &Stacks) -> ActionLogState {
        let phase = self.phase.load(Ordering::Acquire);
        ActionLogState {
            undo_stack: stacks.undo.iter().cloned().collect(),
            redo_stack: stacks.redo.iter().cloned().collect(),
            is_undoing: phase == PHASE_UNDOING,
            is_redoing: phase == PHASE_REDOING,
        }
    }
}

async fn run_writer(cache: OfflineCacheService, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Snapshot(mut snapshot) => {
                // 溜まっているスナップショットは最新のものだけ書けばよい
                let mut acks = Vec::new();
                let mut stop = false;
                while let Ok(next) = rx.try_recv() {
                    match next {
                        PersistCommand::Snapshot(newer) => snapshot = newer,
                        PersistCommand::Flush(ack) => {
                            acks.push(ack);
                            break;
                        }
                        PersistCommand::Shutdown => {
                            stop = true;
                            break;
                        }
                    }
                }
                write_snapshot(&cache, &snapshot).await;
                for ack in acks {
                    let _ = ack.send(());
                }
                if stop {
                    break;
                }
            }
            PersistCommand::Flush(ack) => {
                let _ = ack.send(());
            }
            PersistCommand::Shutdown => break,
        }
    }
    debug!("history writer stopped");
}

async fn write_snapshot(cache: &OfflineCacheService, snapshot: &HistorySnapshot) {
    if !cache.store(HISTORY_SNAPSHOT_KEY, snapshot).await && cache.is_durable() {
        let err = AppError::Persistence("history snapshot was not written".to_string());
        warn!(error = %err, "continuing with in-memory history");
    }
}
