//! Tuning knobs for the sync core.
//!
//! A typed snapshot struct behind a watch channel. Cores sample the current
//! value at each decision point instead of caching individual fields, so a
//! settings change takes effect on the next scheduling cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Lower bound for the time-sync probe interval
pub const MIN_TIME_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound for the time-sync probe interval
pub const MAX_TIME_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Snapshot of all tunable values.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Correct small drift by nudging the playback rate
    pub use_speed_to_sync: bool,
    /// Correct large drift by seeking
    pub use_skip_to_sync: bool,
    /// Minimum drift (ms) before a rate nudge is attempted
    pub min_delay_speed_to_sync_ms: i64,
    /// Drift (ms) at or beyond which a rate nudge is no longer enough
    pub max_delay_speed_to_sync_ms: i64,
    /// Minimum drift (ms) before a skip is attempted
    pub min_delay_skip_to_sync_ms: i64,
    /// Nominal duration (ms) of a rate-nudge correction window
    pub speed_to_sync_duration_ms: i64,
    /// How long playback must stall before the server is told we are buffering
    pub min_buffering_threshold_ms: u64,
    /// Interval between time-sync probes, clamped to [5s, 30s]
    pub time_sync_interval: Duration,
    /// User-tunable trim (ms) added to the measured clock offset
    pub extra_time_offset_ms: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            use_speed_to_sync: true,
            use_skip_to_sync: true,
            min_delay_speed_to_sync_ms: 60,
            max_delay_speed_to_sync_ms: 3000,
            min_delay_skip_to_sync_ms: 400,
            speed_to_sync_duration_ms: 1000,
            min_buffering_threshold_ms: 1000,
            time_sync_interval: Duration::from_secs(10),
            extra_time_offset_ms: 0,
        }
    }
}

impl SyncSettings {
    /// Probe interval clamped to the supported range.
    pub fn clamped_time_sync_interval(&self) -> Duration {
        self.time_sync_interval
            .clamp(MIN_TIME_SYNC_INTERVAL, MAX_TIME_SYNC_INTERVAL)
    }
}

/// Shared handle to the settings store.
///
/// Cloning is cheap; all clones observe the same values.
#[derive(Debug, Clone)]
pub struct Settings {
    tx: Arc<watch::Sender<SyncSettings>>,
}

impl Settings {
    pub fn new() -> Self {
        Self::with(SyncSettings::default())
    }

    pub fn with(initial: SyncSettings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot.
    pub fn get(&self) -> SyncSettings {
        self.tx.borrow().clone()
    }

    /// Mutate the settings in place, notifying subscribers.
    pub fn update(&self, f: impl FnOnce(&mut SyncSettings)) {
        self.tx.send_modify(f);
    }

    /// Subscribe to changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncSettings> {
        self.tx.subscribe()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = SyncSettings::default();
        assert!(s.min_delay_speed_to_sync_ms < s.max_delay_speed_to_sync_ms);
        assert!(s.min_delay_skip_to_sync_ms < s.max_delay_speed_to_sync_ms);
        assert_eq!(s.clamped_time_sync_interval(), Duration::from_secs(10));
    }

    #[test]
    fn interval_is_clamped() {
        let mut s = SyncSettings::default();
        s.time_sync_interval = Duration::from_secs(1);
        assert_eq!(s.clamped_time_sync_interval(), MIN_TIME_SYNC_INTERVAL);
        s.time_sync_interval = Duration::from_secs(120);
        assert_eq!(s.clamped_time_sync_interval(), MAX_TIME_SYNC_INTERVAL);
    }

    #[tokio::test]
    async fn update_notifies_subscribers() {
        let settings = Settings::new();
        let mut rx = settings.subscribe();

        settings.update(|s| s.use_speed_to_sync = false);

        rx.changed().await.unwrap();
        assert!(!rx.borrow().use_speed_to_sync);
        assert!(!settings.get().use_speed_to_sync);
    }
}
