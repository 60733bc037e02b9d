//! 取り消し可能な操作履歴とオフライン同期のコア。
//!
//! - `application::services::ActionLog`: undo/redo スタック
//! - `application::services::SyncCoordinator`: 送信待ちキューと再接続時の drain
//! - `application::services::OfflineCacheService`: 永続スナップショット
//! - `infrastructure::storage`: SQLite / メモリのストア実装

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod shared;

pub use application::ports::{ConnectivitySignal, DurableStore, EntityAdapter, MutationDelivery};
pub use application::services::{
    ActionBatch, ActionLog, ActionLogState, AdapterRegistry, DrainReport, OfflineCacheService,
    RecordRequest, SyncCoordinator, SyncEvent, resolve_conflict,
};
pub use shared::{AppConfig, AppError, Result};
