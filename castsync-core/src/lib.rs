//! CastSync core
//!
//! Keeps a set of distributed playback clients playing the same content at
//! the same wall-clock position, under the direction of a central server.
//! The surrounding receiver provides the transport and the media player;
//! everything between them lives here.

pub mod core;
pub mod error;
pub mod events;
pub mod manager;
pub mod player;
pub mod protocol;
pub mod queue;
pub mod settings;
pub mod time;
pub mod transport;

// Re-exports for convenience
pub use crate::core::playback::{CoreState, PlaybackCore, SyncStats};
pub use crate::core::queue::QueueCore;
pub use crate::core::{SessionContext, SessionState};
pub use error::{CoreError, PlayerError, TransportError};
pub use events::{EventSink, MessageKey, OsdAction, SyncMethod, SyncPlayEvent};
pub use manager::Manager;
pub use player::adapter::{LocalPlayer, RemotePlayer, SyncedPlayer};
pub use player::{MediaPlayer, PlayOptions, PlayerEvent};
pub use protocol::{
    CommandKind, GroupInfo, GroupState, GroupUpdate, InboundMessage, PlaybackCommand, QueueItem,
    QueueUpdate, RepeatMode, ShuffleMode, UpdateReason,
};
pub use queue::{ApplyOutcome, QueueModel};
pub use settings::{Settings, SyncSettings};
pub use time::{TimeProbe, TimeSync, TimeSyncEvent, TimeSyncSample};
pub use transport::Transport;
