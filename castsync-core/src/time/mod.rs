//! Clock synchronization against the server's reference clock.
//!
//! Probes the server on an interval, keeps a rolling ring of samples and
//! derives the offset estimate from the sample with the smallest round-trip.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

use crate::error::TransportError;
use crate::settings::Settings;

/// Ticks per second on the wire (100 ns resolution).
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Ticks per millisecond.
pub const TICKS_PER_MILLISECOND: i64 = 10_000;

pub fn ticks_to_ms(ticks: i64) -> i64 {
    ticks / TICKS_PER_MILLISECOND
}

pub fn ms_to_ticks(ms: i64) -> i64 {
    ms * TICKS_PER_MILLISECOND
}

/// Samples kept in the rolling ring.
const SAMPLE_RING_SIZE: usize = 8;

/// Minimum change of the best offset (ms) before an update is emitted.
const OFFSET_DEAD_BAND_MS: i64 = 50;

/// Probes without a response before the reference clock is considered lost.
const MAX_SILENT_PROBES: u32 = 10;

/// One probe round-trip.
#[derive(Debug, Clone, Copy)]
pub struct TimeSyncSample {
    /// Local wall time when the probe was sent
    pub requested_at: DateTime<Utc>,
    /// Server time carried in the response
    pub server_at: DateTime<Utc>,
    /// Local wall time when the response arrived
    pub received_at: DateTime<Utc>,
}

impl TimeSyncSample {
    pub fn rtt(&self) -> Duration {
        self.received_at - self.requested_at
    }

    /// Estimated `(remote − local)` assuming a symmetric path.
    pub fn offset(&self) -> Duration {
        self.server_at - (self.requested_at + self.rtt() / 2)
    }
}

/// Notifications pushed by the probe loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeSyncEvent {
    /// An accepted probe round-trip. Sent for every sample, so the measured
    /// ping reaches the server even while the offset sits inside the dead
    /// band.
    Sample { ping_ms: i64 },
    /// The best offset moved past the dead band (or the first sample landed)
    Update { offset_ms: i64, ping_ms: i64 },
    Lost,
}

/// Async probe capability. The session implements this over the live
/// transport so the slot is re-read on every probe.
#[async_trait]
pub trait TimeProbe: Send + Sync {
    /// Returns the server's current time.
    async fn probe(&self) -> Result<DateTime<Utc>, TransportError>;
}

#[derive(Default)]
struct Inner {
    samples: VecDeque<TimeSyncSample>,
    offset: Option<Duration>,
    ping: Option<Duration>,
    last_emitted_offset_ms: Option<i64>,
    silent_probes: u32,
    lost_emitted: bool,
    cancel: Option<oneshot::Sender<()>>,
}

/// Running estimate of the offset between the local and remote clocks.
pub struct TimeSync {
    settings: Settings,
    inner: Mutex<Inner>,
    refresh: Notify,
}

impl TimeSync {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner::default()),
            refresh: Notify::new(),
        }
    }

    /// Whether at least one sample has been accepted.
    pub fn has_synced(&self) -> bool {
        self.inner.lock().offset.is_some()
    }

    /// Current estimated `(remote − local)`. Zero until the first sample.
    pub fn offset(&self) -> Duration {
        self.inner.lock().offset.unwrap_or_else(Duration::zero)
    }

    /// RTT of the currently chosen sample. `None` means no sample yet.
    pub fn ping(&self) -> Option<Duration> {
        self.inner.lock().ping
    }

    fn extra_offset(&self) -> Duration {
        Duration::milliseconds(self.settings.get().extra_time_offset_ms)
    }

    /// Converts a local wall instant to the remote clock.
    pub fn local_to_remote(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        t + self.offset() + self.extra_offset()
    }

    /// Converts a remote instant to the local wall clock.
    pub fn remote_to_local(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        t - self.offset() - self.extra_offset()
    }

    /// Records a completed probe round-trip. Returns an event when the best
    /// offset moved by more than the dead band (or on the first sample).
    pub fn record_sample(&self, sample: TimeSyncSample) -> Option<TimeSyncEvent> {
        let mut inner = self.inner.lock();
        inner.silent_probes = 0;
        inner.lost_emitted = false;

        if inner.samples.len() >= SAMPLE_RING_SIZE {
            inner.samples.pop_front();
        }
        inner.samples.push_back(sample);

        let best = inner
            .samples
            .iter()
            .min_by_key(|s| s.rtt())
            .copied()
            .expect("ring is non-empty after push");

        let offset = best.offset();
        inner.offset = Some(offset);
        inner.ping = Some(best.rtt());

        let offset_ms = offset.num_milliseconds();
        let moved = match inner.last_emitted_offset_ms {
            Some(prev) => (offset_ms - prev).abs() > OFFSET_DEAD_BAND_MS,
            None => true,
        };
        if !moved {
            return None;
        }

        inner.last_emitted_offset_ms = Some(offset_ms);
        Some(TimeSyncEvent::Update {
            offset_ms,
            ping_ms: best.rtt().num_milliseconds(),
        })
    }

    /// Records a probe that got no usable response.
    pub fn note_probe_miss(&self) -> Option<TimeSyncEvent> {
        let mut inner = self.inner.lock();
        inner.silent_probes += 1;
        if inner.silent_probes >= MAX_SILENT_PROBES && !inner.lost_emitted {
            inner.lost_emitted = true;
            return Some(TimeSyncEvent::Lost);
        }
        None
    }

    /// Drops all samples and restarts collection. The next conversion uses a
    /// zero offset until a fresh sample arrives.
    pub fn force_update(&self) {
        {
            let mut inner = self.inner.lock();
            inner.samples.clear();
            inner.offset = None;
            inner.ping = None;
            inner.last_emitted_offset_ms = None;
            inner.silent_probes = 0;
            inner.lost_emitted = false;
        }
        self.refresh.notify_one();
    }

    /// Starts the background probe loop. A prior loop is cancelled first.
    pub fn start(
        self: &Arc<Self>,
        probe: Arc<dyn TimeProbe>,
        events: mpsc::UnboundedSender<TimeSyncEvent>,
    ) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.inner.lock().cancel.replace(cancel_tx);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let requested_at = Utc::now();
                let event = match probe.probe().await {
                    Ok(server_at) => {
                        let sample = TimeSyncSample {
                            requested_at,
                            server_at,
                            received_at: Utc::now(),
                        };
                        let ping_ms = sample.rtt().num_milliseconds();
                        let update = this.record_sample(sample);
                        // Every accepted sample is reported, dead band or not
                        if events.send(TimeSyncEvent::Sample { ping_ms }).is_err() {
                            break;
                        }
                        update
                    }
                    Err(err) => {
                        debug!("time-sync probe failed: {err}");
                        this.note_probe_miss()
                    }
                };
                if let Some(event) = event {
                    if events.send(event).is_err() {
                        break;
                    }
                }

                let interval = this.settings.get().clamped_time_sync_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = this.refresh.notified() => {}
                    _ = &mut cancel_rx => break,
                }
            }
        });
    }

    /// Stops the background probe loop.
    pub fn stop(&self) {
        self.inner.lock().cancel.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn sample(send_ms: i64, server_ms: i64, recv_ms: i64) -> TimeSyncSample {
        TimeSyncSample {
            requested_at: at(send_ms),
            server_at: at(server_ms),
            received_at: at(recv_ms),
        }
    }

    #[test]
    fn no_samples_means_zero_offset_and_no_ping() {
        let sync = TimeSync::new(Settings::new());
        assert!(!sync.has_synced());
        assert_eq!(sync.offset(), Duration::zero());
        assert_eq!(sync.ping(), None);
    }

    #[test]
    fn best_sample_is_minimum_rtt() {
        let sync = TimeSync::new(Settings::new());
        // 100 ms RTT, server 500 ms ahead of midpoint
        sync.record_sample(sample(0, 550, 100));
        // 20 ms RTT, server 1000 ms ahead of midpoint; better sample wins
        sync.record_sample(sample(1000, 2010, 1020));

        assert_eq!(sync.offset().num_milliseconds(), 1000);
        assert_eq!(sync.ping().unwrap().num_milliseconds(), 20);
    }

    #[test]
    fn round_trip_is_exact() {
        let sync = TimeSync::new(Settings::new());
        sync.record_sample(sample(0, 1234, 60));

        let t = at(98_765);
        let back = sync.remote_to_local(sync.local_to_remote(t));
        assert_eq!((back - t).num_milliseconds().abs(), 0);
    }

    #[test]
    fn extra_offset_applies_to_conversions_only() {
        let settings = Settings::new();
        settings.update(|s| s.extra_time_offset_ms = 200);
        let sync = TimeSync::new(settings);
        sync.record_sample(sample(0, 1000, 0));

        assert_eq!(sync.offset().num_milliseconds(), 1000);
        assert_eq!(
            (sync.local_to_remote(at(0)) - at(0)).num_milliseconds(),
            1200
        );
        // Round trip still cancels out
        let t = at(5_000);
        assert_eq!(sync.remote_to_local(sync.local_to_remote(t)), t);
    }

    #[test]
    fn dead_band_suppresses_small_moves() {
        let sync = TimeSync::new(Settings::new());
        assert!(matches!(
            sync.record_sample(sample(0, 500, 20)),
            Some(TimeSyncEvent::Update { .. })
        ));
        // Same RTT, offset moved by 30 ms only: suppressed
        assert_eq!(sync.record_sample(sample(1000, 1530 + 10, 1020)), None);
        // Better RTT and offset moved by 100 ms: emitted
        let event = sync.record_sample(sample(2000, 2605, 2010));
        assert!(matches!(event, Some(TimeSyncEvent::Update { .. })));
    }

    #[test]
    fn ring_is_bounded() {
        let sync = TimeSync::new(Settings::new());
        // Fill with a great sample first, then push it out of the ring
        sync.record_sample(sample(0, 5000, 2));
        for i in 1..=SAMPLE_RING_SIZE as i64 {
            sync.record_sample(sample(i * 1000, i * 1000 + 100, i * 1000 + 50));
        }
        // The 2 ms RTT sample fell out; the best remaining has 50 ms RTT
        assert_eq!(sync.ping().unwrap().num_milliseconds(), 50);
    }

    #[test]
    fn lost_after_ten_silent_probes() {
        let sync = TimeSync::new(Settings::new());
        sync.record_sample(sample(0, 0, 10));

        for _ in 0..MAX_SILENT_PROBES - 1 {
            assert_eq!(sync.note_probe_miss(), None);
        }
        assert_eq!(sync.note_probe_miss(), Some(TimeSyncEvent::Lost));
        // Emitted once only
        assert_eq!(sync.note_probe_miss(), None);
        // A fresh sample re-arms the detector
        sync.record_sample(sample(0, 0, 10));
        for _ in 0..MAX_SILENT_PROBES - 1 {
            assert_eq!(sync.note_probe_miss(), None);
        }
        assert_eq!(sync.note_probe_miss(), Some(TimeSyncEvent::Lost));
    }

    #[test]
    fn force_update_restarts_collection() {
        let sync = TimeSync::new(Settings::new());
        sync.record_sample(sample(0, 700, 30));
        assert!(sync.has_synced());

        sync.force_update();
        assert!(!sync.has_synced());
        assert_eq!(sync.offset(), Duration::zero());
        assert_eq!(sync.ping(), None);
    }

    struct LocalClockProbe;

    #[async_trait]
    impl TimeProbe for LocalClockProbe {
        async fn probe(&self) -> Result<DateTime<Utc>, crate::error::TransportError> {
            Ok(Utc::now())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probe_loop_reports_every_sample_past_the_dead_band() {
        let sync = Arc::new(TimeSync::new(Settings::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        sync.start(Arc::new(LocalClockProbe), tx);

        // Three probe rounds at the default 10 s interval
        tokio::time::sleep(std::time::Duration::from_secs(25)).await;
        sync.stop();

        let mut samples = 0;
        let mut updates = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                TimeSyncEvent::Sample { .. } => samples += 1,
                TimeSyncEvent::Update { .. } => updates += 1,
                TimeSyncEvent::Lost => {}
            }
        }
        assert!(samples >= 3, "every accepted sample is reported, got {samples}");
        assert_eq!(updates, 1, "a steady offset stays inside the dead band");
    }

    #[test]
    fn ticks_conversions() {
        assert_eq!(ms_to_ticks(1), TICKS_PER_MILLISECOND);
        assert_eq!(ticks_to_ms(TICKS_PER_SECOND), 1000);
        assert_eq!(ms_to_ticks(-500), -500 * TICKS_PER_MILLISECOND);
    }
}
