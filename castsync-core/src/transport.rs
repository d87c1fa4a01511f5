//! Server capability consumed by the core.
//!
//! One method per server request. The surrounding application implements this
//! over its session to the server; the core re-reads the active transport at
//! every dispatch and never caches it across a suspension point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::TransportError;
use crate::protocol::{BufferingRequest, PlayRequest, QueueRequestMode, RepeatMode, ShuffleMode};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Server's current time. This is the time-sync probe endpoint.
    async fn request_server_time(&self) -> Result<DateTime<Utc>, TransportError>;

    async fn request_unpause(&self) -> Result<(), TransportError>;

    async fn request_pause(&self) -> Result<(), TransportError>;

    async fn request_seek(&self, position_ticks: i64) -> Result<(), TransportError>;

    async fn request_stop(&self) -> Result<(), TransportError>;

    async fn request_play(&self, request: PlayRequest) -> Result<(), TransportError>;

    async fn request_set_playlist_item(
        &self,
        playlist_item_id: &str,
    ) -> Result<(), TransportError>;

    async fn request_remove_from_playlist(
        &self,
        playlist_item_ids: &[String],
    ) -> Result<(), TransportError>;

    async fn request_move_playlist_item(
        &self,
        playlist_item_id: &str,
        new_index: usize,
    ) -> Result<(), TransportError>;

    async fn request_queue(
        &self,
        item_ids: &[String],
        mode: QueueRequestMode,
    ) -> Result<(), TransportError>;

    async fn request_next_track(&self, playlist_item_id: &str) -> Result<(), TransportError>;

    async fn request_previous_track(&self, playlist_item_id: &str)
        -> Result<(), TransportError>;

    async fn request_set_repeat_mode(&self, mode: RepeatMode) -> Result<(), TransportError>;

    async fn request_set_shuffle_mode(&self, mode: ShuffleMode) -> Result<(), TransportError>;

    async fn request_buffering(&self, request: BufferingRequest) -> Result<(), TransportError>;

    async fn request_set_ignore_wait(&self, ignore_wait: bool) -> Result<(), TransportError>;

    async fn send_ping(&self, ping_ms: i64) -> Result<(), TransportError>;
}
