//! In-memory representation of the shared playlist.
//!
//! Updates arrive stamped with the server's `LastUpdate` instant and are
//! applied only when strictly newer than the last applied one.

use chrono::{DateTime, Utc};

use crate::protocol::{QueueItem, QueueUpdate, RepeatMode, ShuffleMode, UpdateReason};

/// Result of [`QueueModel::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Discarded,
}

/// The shared queue as last told by the server.
#[derive(Debug, Default)]
pub struct QueueModel {
    last_update: Option<DateTime<Utc>>,
    playlist: Vec<QueueItem>,
    /// Ordering as of the last non-shuffled snapshot, kept so a flip back to
    /// `Sorted` without a playlist payload can restore it
    sorted_playlist: Vec<QueueItem>,
    current_index: Option<usize>,
    start_position_ticks: i64,
    repeat_mode: RepeatMode,
    shuffle_mode: ShuffleMode,
    /// Item the local player is actually playing; may lag the cursor across
    /// `RemoveItems` updates that do not move it
    real_playlist_item_id: Option<String>,
}

impl QueueModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `update` if it is strictly newer than the last applied one.
    pub fn apply(&mut self, update: &QueueUpdate) -> ApplyOutcome {
        if let Some(last) = self.last_update {
            if update.last_update <= last {
                return ApplyOutcome::Discarded;
            }
        }

        self.last_update = Some(update.last_update);
        self.repeat_mode = update.repeat_mode;

        if update.playlist.is_empty()
            && update.reason == UpdateReason::ShuffleMode
            && update.shuffle_mode == ShuffleMode::Sorted
        {
            self.playlist = self.sorted_playlist.clone();
        } else {
            self.playlist = update.playlist.clone();
        }
        if update.shuffle_mode == ShuffleMode::Sorted {
            self.sorted_playlist = self.playlist.clone();
        }
        self.shuffle_mode = update.shuffle_mode;

        self.current_index = if update.playing_item_index >= 0
            && (update.playing_item_index as usize) < self.playlist.len()
        {
            Some(update.playing_item_index as usize)
        } else {
            None
        };
        self.start_position_ticks = update.start_position_ticks;

        ApplyOutcome::Applied
    }

    pub fn is_empty(&self) -> bool {
        self.playlist.is_empty()
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn current_item(&self) -> Option<&QueueItem> {
        self.current_index.and_then(|i| self.playlist.get(i))
    }

    /// Id of the item at the cursor.
    pub fn current_playlist_item_id(&self) -> Option<&str> {
        self.current_item().map(|i| i.playlist_item_id.as_str())
    }

    /// Id of the item the local player is actually playing.
    pub fn real_playlist_item_id(&self) -> Option<&str> {
        self.real_playlist_item_id.as_deref()
    }

    /// Records what the local player is now playing.
    pub fn set_real_playlist_item_id(&mut self, id: Option<String>) {
        self.real_playlist_item_id = id;
    }

    pub fn playlist(&self) -> &[QueueItem] {
        &self.playlist
    }

    /// Server-assigned ids, in play order.
    pub fn playlist_item_ids(&self) -> Vec<String> {
        self.playlist
            .iter()
            .map(|i| i.playlist_item_id.clone())
            .collect()
    }

    /// Library item ids, in play order.
    pub fn item_ids(&self) -> Vec<String> {
        self.playlist.iter().map(|i| i.item_id.clone()).collect()
    }

    pub fn start_position_ticks(&self) -> i64 {
        self.start_position_ticks
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat_mode
    }

    pub fn shuffle_mode(&self) -> ShuffleMode {
        self.shuffle_mode
    }
}
