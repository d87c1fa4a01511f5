//! Applies queue updates to the shared playlist and (re)starts playback.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::playback::PlaybackCore;
use super::SessionContext;
use crate::error::CoreError;
use crate::player::adapter::SyncedPlayer;
use crate::player::PlayOptions;
use crate::protocol::{QueueUpdate, ShuffleMode, UpdateReason};
use crate::queue::{ApplyOutcome, QueueModel};

/// Queue-side counterpart of [`PlaybackCore`].
pub struct QueueCore {
    ctx: Arc<SessionContext>,
    playback: Arc<PlaybackCore>,
    model: Mutex<QueueModel>,
}

impl QueueCore {
    pub fn new(ctx: Arc<SessionContext>, playback: Arc<PlaybackCore>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            playback,
            model: Mutex::new(QueueModel::new()),
        })
    }

    /// Id of the item at the queue cursor.
    pub fn current_playlist_item_id(&self) -> Option<String> {
        self.model.lock().current_playlist_item_id().map(Into::into)
    }

    /// Id of the item the local player is actually playing.
    pub fn real_playlist_item_id(&self) -> Option<String> {
        self.model.lock().real_playlist_item_id().map(Into::into)
    }

    pub fn shuffle_mode(&self) -> ShuffleMode {
        self.model.lock().shuffle_mode()
    }

    /// Clears the queue on session teardown.
    pub fn reset(&self) {
        *self.model.lock() = QueueModel::new();
    }

    /// Applies a queue update and enacts its consequences on the player.
    /// Updates older than the last applied one come back as `StaleUpdate`.
    pub async fn update_play_queue(
        self: &Arc<Self>,
        update: QueueUpdate,
    ) -> Result<(), CoreError> {
        if self.model.lock().apply(&update) == ApplyOutcome::Discarded {
            debug!(
                "discarding queue update older than the applied one ({:?})",
                update.last_update
            );
            return Err(CoreError::StaleUpdate);
        }

        let Some(player) = self.ctx.player() else {
            return Ok(());
        };
        if player.is_remote() {
            // The remote player manages its own sync session
            return Ok(());
        }

        match update.reason {
            UpdateReason::NewPlaylist => {
                if !self.ctx.state.lock().following_group {
                    self.follow_group_playback().await;
                }
                self.start_playback(&update).await;
            }

            UpdateReason::SetCurrentItem
            | UpdateReason::NextTrack
            | UpdateReason::PreviousTrack => {
                if !self.ctx.state.lock().following_group {
                    return Ok(());
                }
                self.switch_current_item(&player).await;
            }

            UpdateReason::RemoveItems => {
                let cursor_moved = {
                    let model = self.model.lock();
                    model.real_playlist_item_id() != model.current_playlist_item_id()
                };
                if cursor_moved {
                    if !self.ctx.state.lock().following_group {
                        return Ok(());
                    }
                    self.switch_current_item(&player).await;
                }
            }

            UpdateReason::MoveItem | UpdateReason::Queue | UpdateReason::QueueNext => {
                let items = self.model.lock().playlist().to_vec();
                player.notify_playlist_update(&items);
            }

            UpdateReason::RepeatMode => {
                if let Err(err) = player.local_set_repeat_mode(update.repeat_mode).await {
                    warn!("repeat mode change failed: {err}");
                }
            }

            UpdateReason::ShuffleMode => {
                if let Err(err) = player.local_set_shuffle_mode(update.shuffle_mode).await {
                    warn!("shuffle mode change failed: {err}");
                }
            }
        }
        Ok(())
    }

    /// Re-engages group playback: tell the server to wait for us again.
    pub async fn follow_group_playback(&self) {
        if let Some(transport) = self.ctx.transport() {
            if let Err(err) = transport.request_set_ignore_wait(false).await {
                warn!("follow-group request failed: {err}");
            }
        }
        self.ctx.state.lock().following_group = true;
    }

    async fn switch_current_item(self: &Arc<Self>, player: &Arc<dyn SyncedPlayer>) {
        let Some(item) = self.model.lock().current_item().cloned() else {
            return;
        };
        let id = item.playlist_item_id.clone();
        if let Err(err) = player.local_set_current_item(item).await {
            warn!("switching playlist item failed: {err}");
        }
        self.model.lock().set_real_playlist_item_id(Some(id.clone()));
        self.playback
            .schedule_ready_request_on_playback_start(Some(id));
    }

    async fn start_playback(self: &Arc<Self>, update: &QueueUpdate) {
        let (item_ids, start_index, current_id, empty) = {
            let model = self.model.lock();
            (
                model.item_ids(),
                model.current_index().unwrap_or(0),
                model.current_playlist_item_id().map(String::from),
                model.is_empty(),
            )
        };
        if empty {
            return;
        }

        // Prefer the last playback command when it postdates the update; it
        // carries the freshest position
        let last_command = self.ctx.state.lock().last_command.clone();
        let start_position_ticks = match last_command {
            Some(cmd) if cmd.emitted_at >= update.last_update => self.playback.estimate_current_ticks(
                cmd.position_ticks.unwrap_or(update.start_position_ticks),
                cmd.when,
            ),
            _ => self
                .playback
                .estimate_current_ticks(update.start_position_ticks, update.last_update),
        };

        let Some(player) = self.ctx.player() else { return };
        let options = PlayOptions {
            item_ids,
            start_index,
            start_position_ticks,
        };
        if let Err(err) = player.local_play(options).await {
            warn!("starting playback failed: {err}");
        }
        self.model
            .lock()
            .set_real_playlist_item_id(current_id.clone());
        self.playback
            .schedule_ready_request_on_playback_start(current_id);
    }
}
