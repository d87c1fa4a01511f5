//! Player capabilities and normalized player events.
//!
//! The underlying media engine is an opaque [`MediaPlayer`] capability; the
//! adapters in [`adapter`] wrap it into the uniform surface the cores drive.

pub mod adapter;

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::PlayerError;
use crate::protocol::{QueueItem, RepeatMode, ShuffleMode};

/// Events a media player reports, normalized across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    PlaybackStart,
    PlaybackStop,
    Unpause,
    Pause,
    TimeUpdate,
    Playing,
    Waiting,
}

/// Options for starting playback of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayOptions {
    /// Library item ids in play order
    pub item_ids: Vec<String>,
    pub start_index: usize,
    pub start_position_ticks: i64,
}

/// The in-process media engine the core drives.
///
/// Successful completion means the engine acknowledged the request, not that
/// the effect is already visible.
#[async_trait]
pub trait MediaPlayer: Send + Sync {
    async fn play(&self, options: PlayOptions) -> Result<(), PlayerError>;

    async fn pause(&self) -> Result<(), PlayerError>;

    async fn unpause(&self) -> Result<(), PlayerError>;

    async fn seek(&self, position_ticks: i64) -> Result<(), PlayerError>;

    async fn stop(&self) -> Result<(), PlayerError>;

    async fn set_current_item(&self, item: QueueItem) -> Result<(), PlayerError>;

    async fn set_repeat_mode(&self, mode: RepeatMode) -> Result<(), PlayerError>;

    async fn set_shuffle_mode(&self, mode: ShuffleMode) -> Result<(), PlayerError>;

    fn is_playback_active(&self) -> bool;

    fn is_playing(&self) -> bool;

    fn current_ticks(&self) -> i64;

    fn has_playback_rate(&self) -> bool;

    fn playback_rate(&self) -> f64;

    fn set_playback_rate(&self, rate: f64);

    /// Whether the current item supports client-side seeking.
    fn can_seek(&self) -> bool;

    /// Refresh the player's queue display without interrupting playback.
    fn notify_playlist_update(&self, items: &[QueueItem]);

    /// Takes the event stream. Yields `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PlayerEvent>>;
}

/// Registry of one-shot waits on player events.
///
/// Each wait is cancellable: dropping the registry (or calling
/// [`Waiters::cancel_all`]) fails pending waits with `Detached`.
#[derive(Default)]
pub(crate) struct Waiters {
    slots: Mutex<Vec<(PlayerEvent, oneshot::Sender<()>)>>,
}

impl Waiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves every pending wait registered for `event`.
    pub fn resolve(&self, event: PlayerEvent) {
        let mut slots = self.slots.lock();
        let mut kept = Vec::with_capacity(slots.len());
        for (kind, tx) in slots.drain(..) {
            if kind == event {
                let _ = tx.send(());
            } else {
                kept.push((kind, tx));
            }
        }
        *slots = kept;
    }

    /// Fails every pending wait with `Detached`.
    pub fn cancel_all(&self) {
        self.slots.lock().clear();
    }

    /// Waits for the next `event`, up to `timeout`.
    pub async fn wait(&self, event: PlayerEvent, timeout: Duration) -> Result<(), PlayerError> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().push((event, tx));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PlayerError::Detached),
            Err(_) => {
                // Drop our abandoned slot so the registry does not grow
                self.slots.lock().retain(|(_, tx)| !tx.is_closed());
                Err(PlayerError::Timeout)
            }
        }
    }
}
