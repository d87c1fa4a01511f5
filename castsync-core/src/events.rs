//! Events emitted to the surrounding receiver application.
//!
//! The application registers a single [`EventSink`]; the core never calls
//! back into it re-entrantly from a lock.

use crate::player::PlayerEvent;
use crate::protocol::{GroupInfo, GroupState};

/// Drift-correction method currently in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
    SpeedToSync,
    SkipToSync,
}

/// On-screen-display hints for command application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsdAction {
    Unpause,
    Pause,
}

/// Symbolic keys for user-visible messages. The application maps these to
/// localized strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKey {
    MissingPlaybackAccess,
    MissingPlaylistAccess,
    GroupDoesNotExist,
    CreateGroupDenied,
    JoinGroupDenied,
    LibraryAccessDenied,
    HaltedGroupPlayback,
    SyncPlayDisabled,
}

impl MessageKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingPlaybackAccess => "MessageSyncPlayMissingPlaybackAccess",
            Self::MissingPlaylistAccess => "MessageSyncPlayMissingPlaylistAccess",
            Self::GroupDoesNotExist => "MessageSyncPlayGroupDoesNotExist",
            Self::CreateGroupDenied => "MessageSyncPlayCreateGroupDenied",
            Self::JoinGroupDenied => "MessageSyncPlayJoinGroupDenied",
            Self::LibraryAccessDenied => "MessageSyncPlayLibraryAccessDenied",
            Self::HaltedGroupPlayback => "MessageSyncPlayHaltedGroupPlayback",
            Self::SyncPlayDisabled => "MessageSyncPlayIsDisabled",
        }
    }
}

/// Everything the core reports outward.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPlayEvent {
    PlayerChange,
    Enabled(bool),
    Ready(bool),
    GroupStateChange {
        state: GroupState,
        reason: Option<String>,
    },
    GroupUpdated(GroupInfo),
    UserJoined(String),
    UserLeft(String),
    Syncing {
        active: bool,
        method: SyncMethod,
    },
    NotifyOsd(OsdAction),
    ShowMessage(MessageKey),
    Buffering {
        done: bool,
    },
    TimeSyncUpdate {
        offset_ms: i64,
        ping_ms: i64,
    },
    TimeSyncLost,
    /// Normalized player event, forwarded as observed
    Player(PlayerEvent),
    SessionError(String),
}

/// Receiver for core events, provided by the application.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncPlayEvent);
}

/// Sink that drops everything. Useful as a default.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SyncPlayEvent) {}
}
