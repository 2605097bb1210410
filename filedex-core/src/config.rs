use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime knobs for the indexing core.
///
/// All fields carry defaults so a configuration file only needs to name the
/// values it wants to change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Watcher channel, debounce and worker pool sizing.
    pub watch: WatchConfig,
    /// Startup / resync sweep bounds.
    pub sweep: SweepConfig,
    /// Reconciler write policy.
    pub reconcile: ReconcileConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Debounce window in milliseconds.
    pub debounce_window_ms: u64,
    /// Capacity of the raw event channel between the OS callback and the
    /// normalizer. A full channel triggers a resync sweep.
    pub channel_capacity: usize,
    /// Maximum number of paths with an open debounce window. The oldest
    /// windows are closed early once exceeded.
    pub max_pending_paths: usize,
    /// Number of reconcile workers. Events are partitioned by path hash.
    pub workers: usize,
    /// Cadence for expiring remembered dedup keys, in milliseconds.
    pub expiry_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 750,
            channel_capacity: 4096,
            max_pending_paths: 10_000,
            workers: 4,
            expiry_interval_ms: 1_000,
        }
    }
}

impl WatchConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms.max(1))
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_interval_ms.max(10))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.max(16)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Run the sweep before live events are applied.
    pub enabled: bool,
    /// Upper bound on filesystem entries visited per sweep.
    pub max_entries: usize,
    /// Wall-clock bound for a sweep in milliseconds.
    pub timeout_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 200_000,
            timeout_ms: 120_000,
        }
    }
}

impl SweepConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Index directories seen by the watcher and the sweep as Folder records.
    /// Folders made through `create_folder` are indexed regardless.
    pub index_directories: bool,
    /// Attempts for a store write driven by a passive event.
    pub write_retry_attempts: u16,
    /// Base backoff between attempts; doubles per retry.
    pub write_retry_backoff_ms: u64,
    /// Capacity of the change broadcast channel.
    pub change_buffer: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            index_directories: false,
            write_retry_attempts: 3,
            write_retry_backoff_ms: 100,
            change_buffer: 1024,
        }
    }
}

impl ReconcileConfig {
    pub fn retry_backoff(&self, attempt: u16) -> Duration {
        let factor = 1u64 << u32::from(attempt.min(10));
        Duration::from_millis(self.write_retry_backoff_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fall_back_to_defaults() {
        let settings: IndexSettings =
            serde_json::from_str(r#"{ "watch": { "debounce_window_ms": 50 } }"#).unwrap();
        assert_eq!(settings.watch.debounce_window(), Duration::from_millis(50));
        assert_eq!(settings.watch.workers, WatchConfig::default().workers);
        assert_eq!(settings.sweep, SweepConfig::default());
        assert!(!settings.reconcile.index_directories);
    }

    #[test]
    fn degenerate_values_are_clamped() {
        let watch = WatchConfig {
            debounce_window_ms: 0,
            workers: 0,
            channel_capacity: 1,
            ..WatchConfig::default()
        };
        assert_eq!(watch.debounce_window(), Duration::from_millis(1));
        assert_eq!(watch.worker_count(), 1);
        assert_eq!(watch.channel_capacity(), 16);
    }

    #[test]
    fn retry_backoff_doubles() {
        let cfg = ReconcileConfig::default();
        assert_eq!(cfg.retry_backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.retry_backoff(2), Duration::from_millis(400));
    }
}
