//! Command scheduling and continuous drift correction.
//!
//! Turns remote-timed commands into local player actions fired at the right
//! local instant, then keeps the player aligned with the estimated remote
//! position until the next command arrives.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use super::{SessionContext, TimerSlot};
use crate::events::{MessageKey, OsdAction, SyncMethod, SyncPlayEvent};
use crate::player::adapter::SyncedPlayer;
use crate::player::PlayerEvent;
use crate::protocol::{BufferingRequest, CommandKind, PlaybackCommand};
use crate::time::{ms_to_ticks, ticks_to_ms, TICKS_PER_MILLISECOND};

/// How long to wait for the player to acknowledge a pause with an event.
const PAUSE_EVENT_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for the `unpause` event when realigning a late command.
const UNPAUSE_EVENT_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a seek may take to produce a `playing` event.
const PLAYING_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a fresh queue start may take to produce `playbackstart`.
const PLAYBACK_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Jitter half-range applied to repair seeks, in milliseconds. Players may
/// no-op a seek to the exact current position.
const SEEK_JITTER_MS: i64 = 50;

/// Scheduler states, visible for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Disabled,
    Enabling,
    Idle,
    Scheduled,
    Syncing,
    Buffering,
}

/// Snapshot of the drift corrector, for the stats overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStats {
    pub playback_diff_ms: i64,
    pub sync_method: Option<SyncMethod>,
    pub corrections: u64,
    pub in_sync_ticks: u64,
}

struct PlaybackInner {
    state: CoreState,
    sync_enabled: bool,
    buffering_started: bool,
    last_sync_check: Option<tokio::time::Instant>,
    /// Last command dispatched by this core; duplicate-detection basis
    prev_command: Option<PlaybackCommand>,
    stats: SyncStats,
}

impl PlaybackInner {
    fn new() -> Self {
        Self {
            state: CoreState::Disabled,
            sync_enabled: false,
            buffering_started: false,
            last_sync_check: None,
            prev_command: None,
            stats: SyncStats::default(),
        }
    }
}

/// The command scheduler and drift corrector.
pub struct PlaybackCore {
    ctx: Arc<SessionContext>,
    inner: Mutex<PlaybackInner>,
    scheduled_command: TimerSlot,
    sync_enable: TimerSlot,
    buffering_notify: TimerSlot,
    ready_request: TimerSlot,
}

impl PlaybackCore {
    pub fn new(ctx: Arc<SessionContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            inner: Mutex::new(PlaybackInner::new()),
            scheduled_command: TimerSlot::new(),
            sync_enable: TimerSlot::new(),
            buffering_notify: TimerSlot::new(),
            ready_request: TimerSlot::new(),
        })
    }

    pub fn state(&self) -> CoreState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.lock().stats
    }

    /// Joined a group; time sync is not usable yet.
    pub fn on_enabling(&self) {
        let mut inner = self.inner.lock();
        inner.state = CoreState::Enabling;
        inner.sync_enabled = false;
    }

    /// Time sync produced its first usable offset.
    pub fn on_ready(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CoreState::Enabling {
            inner.state = CoreState::Idle;
        }
    }

    /// Cancels every pending timer and drops back to `Disabled`. No player
    /// command is issued by this core afterwards.
    pub fn disable(&self) {
        self.scheduled_command.cancel();
        self.sync_enable.cancel();
        self.buffering_notify.cancel();
        self.ready_request.cancel();
        *self.inner.lock() = PlaybackInner::new();
    }

    /// Projects `ticks` stamped at remote instant `when` to the present.
    pub fn estimate_current_ticks(&self, ticks: i64, when: DateTime<Utc>) -> i64 {
        let now_remote = self.ctx.time_sync.local_to_remote(Utc::now());
        ticks + (now_remote - when).num_milliseconds() * TICKS_PER_MILLISECOND
    }

    /// Applies a remote-timed command, scheduling the player action at the
    /// derived local instant.
    pub async fn apply_command(self: &Arc<Self>, cmd: PlaybackCommand) {
        let Some(player) = self.ctx.player() else {
            warn!("command {:?} arrived with no player bound", cmd.command);
            return;
        };

        let fire_at = self.ctx.time_sync.remote_to_local(cmd.when);
        let now = Utc::now();
        let was_past = fire_at <= now;

        let mut repair = false;
        {
            let inner = self.inner.lock();
            if inner
                .prev_command
                .as_ref()
                .is_some_and(|prev| prev.same_request(&cmd))
            {
                if !was_past {
                    debug!("duplicate command is already scheduled, ignoring");
                    return;
                }
                if !self.player_state_diverged(&cmd, player.as_ref()) {
                    debug!("duplicate command and player state converged, dropping");
                    return;
                }
                repair = true;
            }
        }

        // Only one scheduled action may be pending
        self.scheduled_command.cancel();
        self.sync_enable.cancel();

        {
            let mut inner = self.inner.lock();
            inner.sync_enabled = false;
            inner.prev_command = Some(cmd.clone());

            if player.is_remote() {
                // The remote player is authoritative; record only
                return;
            }
            inner.state = CoreState::Scheduled;
        }

        let delay = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
        let this = Arc::clone(self);
        self.scheduled_command.arm(delay, async move {
            this.fire_command(cmd, was_past, repair).await;
        });
    }

    /// Whether the player's observable state disagrees with what `cmd`
    /// should have produced by now.
    fn player_state_diverged(&self, cmd: &PlaybackCommand, player: &dyn SyncedPlayer) -> bool {
        let threshold = ms_to_ticks(self.ctx.settings.get().min_delay_skip_to_sync_ms);
        let target = cmd.position_ticks.unwrap_or(0);
        let current = player.current_ticks();

        match cmd.command {
            CommandKind::Unpause => {
                let expected = self.estimate_current_ticks(target, cmd.when);
                !player.is_playing() || (expected - current).abs() > threshold
            }
            CommandKind::Pause => player.is_playing() || (current - target).abs() > threshold,
            CommandKind::Seek => (current - target).abs() > threshold,
            CommandKind::Stop => player.is_playback_active(),
        }
    }

    async fn fire_command(self: Arc<Self>, cmd: PlaybackCommand, was_past: bool, repair: bool) {
        if !self.ctx.is_enabled() {
            return;
        }
        let Some(player) = self.ctx.player() else { return };
        let settings = self.ctx.settings.get();

        match cmd.command {
            CommandKind::Unpause => {
                let target = cmd.position_ticks.unwrap_or(0);
                let threshold = ms_to_ticks(settings.min_delay_skip_to_sync_ms);
                if (player.current_ticks() - target).abs() > threshold {
                    if let Err(err) = player.local_seek(target).await {
                        warn!("pre-unpause seek failed: {err}");
                    }
                }
                if let Err(err) = player.local_unpause().await {
                    warn!("unpause failed: {err}");
                }
                self.ctx.emit(SyncPlayEvent::NotifyOsd(OsdAction::Unpause));

                if was_past {
                    // The group has been playing for a while; realign once
                    // the player confirms it resumed
                    match player
                        .wait_for(PlayerEvent::Unpause, UNPAUSE_EVENT_TIMEOUT)
                        .await
                    {
                        Ok(()) if self.ctx.is_enabled() => {
                            let estimate = self.estimate_current_ticks(target, cmd.when);
                            if let Err(err) = player.local_seek(estimate).await {
                                warn!("late-join realign seek failed: {err}");
                            }
                        }
                        Ok(()) => return,
                        Err(err) => {
                            debug!("no unpause event ({err}); drift correction will realign");
                        }
                    }
                }
                if !self.ctx.is_enabled() {
                    return;
                }

                let delay =
                    Duration::from_millis((settings.max_delay_speed_to_sync_ms / 2) as u64);
                let this = Arc::clone(&self);
                self.sync_enable.arm(delay, async move {
                    this.enable_sync();
                });
            }

            CommandKind::Pause => {
                if let Err(err) = player.local_pause().await {
                    warn!("pause failed: {err}");
                }
                if player
                    .wait_for(PlayerEvent::Pause, PAUSE_EVENT_TIMEOUT)
                    .await
                    .is_err()
                {
                    debug!("pause event timed out, seeking anyway");
                }
                if !self.ctx.is_enabled() {
                    return;
                }
                let target = cmd.position_ticks.unwrap_or(0);
                if let Err(err) = player.local_seek(target).await {
                    warn!("post-pause seek failed: {err}");
                }
                self.inner.lock().state = CoreState::Idle;
            }

            CommandKind::Stop => {
                if let Err(err) = player.local_stop().await {
                    warn!("stop failed: {err}");
                }
                self.inner.lock().state = CoreState::Idle;
            }

            CommandKind::Seek => {
                let mut target = cmd.position_ticks.unwrap_or(0);
                if repair {
                    target += seek_jitter();
                }
                if let Err(err) = player.local_unpause().await {
                    warn!("pre-seek unpause failed: {err}");
                }
                match player.local_seek(target).await {
                    Err(crate::error::PlayerError::NotSeekable) => {
                        // Not retried; the server resyncs the group
                        warn!("item is not seekable, leaving resync to the server");
                        self.inner.lock().state = CoreState::Idle;
                        return;
                    }
                    Err(err) => warn!("seek failed: {err}"),
                    Ok(()) => {}
                }
                match player
                    .wait_for(PlayerEvent::Playing, PLAYING_EVENT_TIMEOUT)
                    .await
                {
                    Ok(()) if self.ctx.is_enabled() => {
                        if let Err(err) = player.local_pause().await {
                            warn!("post-seek pause failed: {err}");
                        }
                        self.send_buffering(true).await;
                    }
                    Ok(()) => return,
                    Err(_) => {
                        if !self.ctx.is_enabled() {
                            return;
                        }
                        warn!("no playing event after seek, re-seeking");
                        if let Err(err) = player.local_seek(target).await {
                            warn!("re-seek failed: {err}");
                        }
                    }
                }
                self.inner.lock().state = CoreState::Idle;
            }
        }
    }

    fn enable_sync(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CoreState::Disabled {
            return;
        }
        inner.sync_enabled = true;
        inner.state = CoreState::Syncing;
    }

    /// Drift correction, driven by throttled `timeupdate` events.
    pub async fn on_time_update(self: &Arc<Self>) {
        let settings = self.ctx.settings.get();
        let throttle = Duration::from_millis((settings.max_delay_speed_to_sync_ms / 2) as u64);

        {
            let mut inner = self.inner.lock();
            if !inner.sync_enabled || inner.buffering_started {
                return;
            }
            if let Some(last) = inner.last_sync_check {
                if last.elapsed() < throttle {
                    return;
                }
            }
            inner.last_sync_check = Some(tokio::time::Instant::now());
        }

        let Some(cmd) = self.ctx.state.lock().last_command.clone() else {
            return;
        };
        if cmd.command != CommandKind::Unpause {
            return;
        }
        let Some(player) = self.ctx.player() else { return };

        let server_ticks =
            self.estimate_current_ticks(cmd.position_ticks.unwrap_or(0), cmd.when);
        let diff_ms = ticks_to_ms(server_ticks - player.current_ticks());
        self.inner.lock().stats.playback_diff_ms = diff_ms;
        let abs = diff_ms.abs();

        if player.has_playback_rate()
            && settings.use_speed_to_sync
            && abs >= settings.min_delay_speed_to_sync_ms
            && abs < settings.max_delay_speed_to_sync_ms
        {
            let diff = diff_ms as f64;
            let mut duration_ms = settings.speed_to_sync_duration_ms as f64;
            if diff <= -duration_ms * 0.1 {
                // Keep the computed speed at or above 0.1
                duration_ms = diff.abs() / 0.9;
            }
            let rate = 1.0 + diff / duration_ms;
            player.set_playback_rate(rate);
            {
                let mut inner = self.inner.lock();
                inner.sync_enabled = false;
                inner.stats.sync_method = Some(SyncMethod::SpeedToSync);
                inner.stats.corrections += 1;
            }
            self.ctx.emit(SyncPlayEvent::Syncing {
                active: true,
                method: SyncMethod::SpeedToSync,
            });

            let this = Arc::clone(self);
            self.sync_enable
                .arm(Duration::from_millis(duration_ms as u64), async move {
                    if let Some(player) = this.ctx.player() {
                        player.set_playback_rate(1.0);
                    }
                    this.enable_sync();
                    this.ctx.emit(SyncPlayEvent::Syncing {
                        active: false,
                        method: SyncMethod::SpeedToSync,
                    });
                });
        } else if settings.use_skip_to_sync && abs >= settings.min_delay_skip_to_sync_ms {
            if let Err(err) = player.local_seek(server_ticks).await {
                warn!("skip-to-sync seek failed: {err}");
            }
            {
                let mut inner = self.inner.lock();
                inner.sync_enabled = false;
                inner.stats.sync_method = Some(SyncMethod::SkipToSync);
                inner.stats.corrections += 1;
            }
            self.ctx.emit(SyncPlayEvent::Syncing {
                active: true,
                method: SyncMethod::SkipToSync,
            });

            let delay = Duration::from_millis((settings.max_delay_speed_to_sync_ms / 2) as u64);
            let this = Arc::clone(self);
            self.sync_enable.arm(delay, async move {
                this.enable_sync();
                this.ctx.emit(SyncPlayEvent::Syncing {
                    active: false,
                    method: SyncMethod::SkipToSync,
                });
            });
        } else {
            let mut inner = self.inner.lock();
            inner.stats.in_sync_ticks += 1;
            inner.stats.sync_method = None;
        }
    }

    /// Player reported a stall. Tell the server only if it lasts.
    pub fn on_waiting(self: &Arc<Self>) {
        {
            let inner = self.inner.lock();
            if inner.state == CoreState::Disabled || inner.buffering_started {
                return;
            }
        }
        let threshold =
            Duration::from_millis(self.ctx.settings.get().min_buffering_threshold_ms);
        let this = Arc::clone(self);
        self.buffering_notify.arm(threshold, async move {
            if !this.ctx.is_enabled() {
                return;
            }
            {
                let mut inner = this.inner.lock();
                inner.buffering_started = true;
                inner.state = CoreState::Buffering;
            }
            this.send_buffering(false).await;
            this.ctx.emit(SyncPlayEvent::Buffering { done: false });
        });
    }

    /// Player resumed producing frames.
    pub async fn on_playing(self: &Arc<Self>) {
        self.buffering_notify.cancel();

        let was_buffering = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.buffering_started)
        };
        if !was_buffering {
            return;
        }

        self.send_buffering(true).await;
        self.ctx.emit(SyncPlayEvent::Buffering { done: true });

        let mut inner = self.inner.lock();
        inner.state = if inner.sync_enabled {
            CoreState::Syncing
        } else {
            CoreState::Idle
        };
    }

    /// Reports readiness once the next `playbackstart` arrives, or halts
    /// group playback when it never does.
    pub fn schedule_ready_request_on_playback_start(
        self: &Arc<Self>,
        playlist_item_id: Option<String>,
    ) {
        let this = Arc::clone(self);
        self.ready_request.arm(Duration::ZERO, async move {
            let Some(player) = this.ctx.player() else { return };
            match player
                .wait_for(PlayerEvent::PlaybackStart, PLAYBACK_START_TIMEOUT)
                .await
            {
                Ok(()) => {
                    if !this.ctx.is_enabled() {
                        return;
                    }
                    if let Err(err) = player.local_pause().await {
                        warn!("pause before ready report failed: {err}");
                    }
                    let Some(transport) = this.ctx.transport() else {
                        return;
                    };
                    let request = BufferingRequest {
                        when: this.ctx.time_sync.local_to_remote(Utc::now()),
                        position_ticks: player.current_ticks(),
                        is_playing: false,
                        playlist_item_id: playlist_item_id.unwrap_or_default(),
                        buffering_done: true,
                    };
                    if let Err(err) = transport.request_buffering(request).await {
                        warn!("ready report failed: {err}");
                    }
                    this.ctx.emit(SyncPlayEvent::Buffering { done: true });
                }
                Err(_) => {
                    warn!("playback did not start in time, halting group playback");
                    this.ctx.state.lock().following_group = false;
                    if let Some(transport) = this.ctx.transport() {
                        if let Err(err) = transport.request_set_ignore_wait(true).await {
                            warn!("halt notification failed: {err}");
                        }
                    }
                    this.ctx
                        .emit(SyncPlayEvent::ShowMessage(MessageKey::HaltedGroupPlayback));
                }
            }
        });
    }

    async fn send_buffering(&self, done: bool) {
        let Some(player) = self.ctx.player() else { return };
        let Some(transport) = self.ctx.transport() else {
            return;
        };
        let playlist_item_id = self
            .ctx
            .state
            .lock()
            .last_command
            .as_ref()
            .map(|c| c.playlist_item_id.clone())
            .unwrap_or_default();

        let request = BufferingRequest {
            when: self.ctx.time_sync.local_to_remote(Utc::now()),
            position_ticks: player.current_ticks(),
            is_playing: player.is_playing(),
            playlist_item_id,
            buffering_done: done,
        };
        if let Err(err) = transport.request_buffering(request).await {
            warn!("buffering report failed: {err}");
        }
    }

    #[cfg(test)]
    pub(crate) fn scheduled_pending(&self) -> bool {
        self.scheduled_command.is_armed()
    }

    #[cfg(test)]
    pub(crate) fn force_sync_enabled(&self) {
        self.enable_sync();
    }
}

fn seek_jitter() -> i64 {
    rand::thread_rng().gen_range(-SEEK_JITTER_MS..=SEEK_JITTER_MS) * TICKS_PER_MILLISECOND
}
