//! Uniform capability over heterogeneous player variants.
//!
//! [`LocalPlayer`] drives an in-process [`MediaPlayer`]; [`RemotePlayer`]
//! stands in for a player running elsewhere that manages its own sync
//! session, so every `local_*` operation is a recorded no-op.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{MediaPlayer, PlayOptions, PlayerEvent, Waiters};
use crate::error::PlayerError;
use crate::protocol::{QueueItem, RepeatMode, ShuffleMode};

/// The capability set the cores drive.
#[async_trait]
pub trait SyncedPlayer: Send + Sync {
    fn is_remote(&self) -> bool;

    fn is_playback_active(&self) -> bool;

    fn is_playing(&self) -> bool;

    fn current_ticks(&self) -> i64;

    fn has_playback_rate(&self) -> bool;

    fn playback_rate(&self) -> f64;

    fn set_playback_rate(&self, rate: f64);

    fn can_seek(&self) -> bool;

    async fn local_play(&self, options: PlayOptions) -> Result<(), PlayerError>;

    async fn local_pause(&self) -> Result<(), PlayerError>;

    async fn local_unpause(&self) -> Result<(), PlayerError>;

    async fn local_seek(&self, position_ticks: i64) -> Result<(), PlayerError>;

    async fn local_stop(&self) -> Result<(), PlayerError>;

    async fn local_set_current_item(&self, item: QueueItem) -> Result<(), PlayerError>;

    async fn local_set_repeat_mode(&self, mode: RepeatMode) -> Result<(), PlayerError>;

    async fn local_set_shuffle_mode(&self, mode: ShuffleMode) -> Result<(), PlayerError>;

    fn notify_playlist_update(&self, items: &[QueueItem]);

    /// Waits for the next occurrence of `event`, up to `timeout`.
    async fn wait_for(&self, event: PlayerEvent, timeout: Duration) -> Result<(), PlayerError>;

    /// Starts the event pump, forwarding normalized events to `forward`.
    fn bind_to_player(&self, forward: mpsc::UnboundedSender<PlayerEvent>);

    /// Stops the event pump and fails pending waits.
    fn unbind_from_player(&self);
}

/// Adapter over an in-process media engine.
pub struct LocalPlayer {
    player: Arc<dyn MediaPlayer>,
    waiters: Arc<Waiters>,
    pump_cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl LocalPlayer {
    pub fn new(player: Arc<dyn MediaPlayer>) -> Self {
        Self {
            player,
            waiters: Arc::new(Waiters::new()),
            pump_cancel: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SyncedPlayer for LocalPlayer {
    fn is_remote(&self) -> bool {
        false
    }

    fn is_playback_active(&self) -> bool {
        self.player.is_playback_active()
    }

    fn is_playing(&self) -> bool {
        self.player.is_playing()
    }

    fn current_ticks(&self) -> i64 {
        self.player.current_ticks()
    }

    fn has_playback_rate(&self) -> bool {
        self.player.has_playback_rate()
    }

    fn playback_rate(&self) -> f64 {
        self.player.playback_rate()
    }

    fn set_playback_rate(&self, rate: f64) {
        self.player.set_playback_rate(rate);
    }

    fn can_seek(&self) -> bool {
        self.player.can_seek()
    }

    async fn local_play(&self, options: PlayOptions) -> Result<(), PlayerError> {
        self.player.play(options).await
    }

    async fn local_pause(&self) -> Result<(), PlayerError> {
        self.player.pause().await
    }

    async fn local_unpause(&self) -> Result<(), PlayerError> {
        self.player.unpause().await
    }

    async fn local_seek(&self, position_ticks: i64) -> Result<(), PlayerError> {
        if !self.player.can_seek() {
            return Err(PlayerError::NotSeekable);
        }
        self.player.seek(position_ticks).await
    }

    async fn local_stop(&self) -> Result<(), PlayerError> {
        self.player.stop().await
    }

    async fn local_set_current_item(&self, item: QueueItem) -> Result<(), PlayerError> {
        self.player.set_current_item(item).await
    }

    async fn local_set_repeat_mode(&self, mode: RepeatMode) -> Result<(), PlayerError> {
        self.player.set_repeat_mode(mode).await
    }

    async fn local_set_shuffle_mode(&self, mode: ShuffleMode) -> Result<(), PlayerError> {
        self.player.set_shuffle_mode(mode).await
    }

    fn notify_playlist_update(&self, items: &[QueueItem]) {
        self.player.notify_playlist_update(items);
    }

    async fn wait_for(&self, event: PlayerEvent, timeout: Duration) -> Result<(), PlayerError> {
        self.waiters.wait(event, timeout).await
    }

    fn bind_to_player(&self, forward: mpsc::UnboundedSender<PlayerEvent>) {
        let Some(mut events) = self.player.take_events() else {
            warn!("player event stream already taken, not binding again");
            return;
        };

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.pump_cancel.lock().replace(cancel_tx);

        let waiters = Arc::clone(&self.waiters);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        waiters.resolve(event);
                        if forward.send(event).is_err() {
                            break;
                        }
                    }
                    _ = &mut cancel_rx => break,
                }
            }
            debug!("player event pump stopped");
        });
    }

    fn unbind_from_player(&self) {
        self.pump_cancel.lock().take();
        self.waiters.cancel_all();
    }
}

/// Adapter for a remote-controlled player.
///
/// The remote end runs its own sync session and is authoritative; nothing is
/// forwarded to it from here.
#[derive(Default)]
pub struct RemotePlayer;

impl RemotePlayer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SyncedPlayer for RemotePlayer {
    fn is_remote(&self) -> bool {
        true
    }

    fn is_playback_active(&self) -> bool {
        true
    }

    fn is_playing(&self) -> bool {
        false
    }

    fn current_ticks(&self) -> i64 {
        0
    }

    fn has_playback_rate(&self) -> bool {
        false
    }

    fn playback_rate(&self) -> f64 {
        1.0
    }

    fn set_playback_rate(&self, _rate: f64) {}

    fn can_seek(&self) -> bool {
        false
    }

    async fn local_play(&self, _options: PlayOptions) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn local_pause(&self) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn local_unpause(&self) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn local_seek(&self, _position_ticks: i64) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn local_stop(&self) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn local_set_current_item(&self, _item: QueueItem) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn local_set_repeat_mode(&self, _mode: RepeatMode) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn local_set_shuffle_mode(&self, _mode: ShuffleMode) -> Result<(), PlayerError> {
        Ok(())
    }

    fn notify_playlist_update(&self, _items: &[QueueItem]) {}

    async fn wait_for(&self, _event: PlayerEvent, _timeout: Duration) -> Result<(), PlayerError> {
        Ok(())
    }

    fn bind_to_player(&self, _forward: mpsc::UnboundedSender<PlayerEvent>) {}

    fn unbind_from_player(&self) {}
}
