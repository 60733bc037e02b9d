//! 保留キュー配送の集計。`SyncCoordinator::metrics` から読む。

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NEVER: u64 = 0;

#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    delivered: AtomicU64,
    failed: AtomicU64,
    superseded: AtomicU64,
    drains: AtomicU64,
    last_drain_duration_ms: AtomicU64,
    last_delivered_at_ms: AtomicU64,
    last_failed_at_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub delivered: u64,
    pub failed: u64,
    /// サーバー側のレコードが勝って破棄したエントリ数
    pub superseded: u64,
    /// オンラインで実際にキューを走査した回数
    pub drains: u64,
    pub last_drain_duration_ms: Option<u64>,
    pub last_delivered_at_ms: Option<u64>,
    pub last_failed_at_ms: Option<u64>,
}

impl DeliveryMetrics {
    pub const fn new() -> Self {
        Self {
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
            drains: AtomicU64::new(0),
            last_drain_duration_ms: AtomicU64::new(NEVER),
            last_delivered_at_ms: AtomicU64::new(NEVER),
            last_failed_at_ms: AtomicU64::new(NEVER),
        }
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.last_delivered_at_ms
            .store(current_unix_ms(), Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.last_failed_at_ms
            .store(current_unix_ms(), Ordering::Relaxed);
    }

    pub fn record_superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drain(&self, elapsed: Duration) {
        self.drains.fetch_add(1, Ordering::Relaxed);
        // 0 は未計測と区別できないので 1ms に切り上げる
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX).max(1);
        self.last_drain_duration_ms
            .store(millis, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            last_drain_duration_ms: recorded(&self.last_drain_duration_ms),
            last_delivered_at_ms: recorded(&self.last_delivered_at_ms),
            last_failed_at_ms: recorded(&self.last_failed_at_ms),
        }
    }
}

fn current_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(NEVER)
}

fn recorded(value: &AtomicU64) -> Option<u64> {
    match value.load(Ordering::Relaxed) {
        NEVER => None,
        value => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_metrics_have_no_timestamps() {
        assert_eq!(DeliveryMetrics::new().snapshot(), DeliveryStats::default());
    }

    #[test]
    fn outcomes_and_drains_are_counted_separately() {
        let metrics = DeliveryMetrics::new();
        metrics.record_delivered();
        metrics.record_delivered();
        metrics.record_failed();
        metrics.record_superseded();
        metrics.record_drain(Duration::ZERO);

        let stats = metrics.snapshot();
        assert_eq!(
            (stats.delivered, stats.failed, stats.superseded, stats.drains),
            (2, 1, 1, 1)
        );
        assert_eq!(stats.last_drain_duration_ms, Some(1));
        assert!(stats.last_delivered_at_ms.is_some());
        assert!(stats.last_failed_at_ms.is_some());
    }
}
