//! Wire types for the sync protocol.
//!
//! Instants travel as ISO-8601 UTC strings; positions and durations are
//! expressed in ticks (100 ns) as signed 64-bit integers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Playback command kinds the server may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Unpause,
    Pause,
    Seek,
    Stop,
}

/// A remote-timed playback command. Immutable after receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlaybackCommand {
    pub command: CommandKind,
    /// Remote instant at which the command takes effect
    pub when: DateTime<Utc>,
    /// Remote instant at which the server emitted the command
    pub emitted_at: DateTime<Utc>,
    #[serde(default)]
    pub position_ticks: Option<i64>,
    pub playlist_item_id: String,
}

impl PlaybackCommand {
    /// Whether `other` asks for the same action at the same instant.
    /// Used for duplicate detection; `emitted_at` is deliberately ignored.
    pub fn same_request(&self, other: &Self) -> bool {
        self.command == other.command
            && self.when == other.when
            && self.position_ticks == other.position_ticks
            && self.playlist_item_id == other.playlist_item_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepeatMode {
    #[default]
    RepeatNone,
    RepeatOne,
    RepeatAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShuffleMode {
    #[default]
    Sorted,
    Shuffle,
}

/// Queue placement for `requestSyncPlayQueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueRequestMode {
    Default,
    Next,
}

/// One entry of the shared playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueItem {
    /// Server-assigned id, unique per queue position
    pub playlist_item_id: String,
    /// Library item id
    pub item_id: String,
}

/// Why the server sent a queue update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateReason {
    NewPlaylist,
    SetCurrentItem,
    NextTrack,
    PreviousTrack,
    RemoveItems,
    MoveItem,
    Queue,
    QueueNext,
    RepeatMode,
    ShuffleMode,
}

/// A monotonically-ordered snapshot of the shared queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueUpdate {
    pub reason: UpdateReason,
    pub last_update: DateTime<Utc>,
    pub playlist: Vec<QueueItem>,
    pub playing_item_index: i32,
    pub start_position_ticks: i64,
    #[serde(default)]
    pub repeat_mode: RepeatMode,
    #[serde(default)]
    pub shuffle_mode: ShuffleMode,
}

/// Server-side group playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupState {
    Idle,
    Waiting,
    Paused,
    Playing,
}

/// Per-user rights within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccessRights {
    pub playback_access: bool,
    pub playlist_access: bool,
}

/// Group membership and rights. Replaced wholesale on `GroupUpdate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupInfo {
    pub group_id: String,
    pub participants: Vec<String>,
    pub administrators: Vec<String>,
    #[serde(default)]
    pub access_list: HashMap<String, AccessRights>,
    pub last_updated_at: DateTime<Utc>,
}

impl GroupInfo {
    /// Whether `user_id` may issue playback commands. Users absent from the
    /// access list fall back to administrator status.
    pub fn has_playback_access(&self, user_id: &str) -> bool {
        match self.access_list.get(user_id) {
            Some(rights) => rights.playback_access,
            None => self.administrators.iter().any(|a| a == user_id),
        }
    }

    /// Whether `user_id` may edit the shared playlist.
    pub fn has_playlist_access(&self, user_id: &str) -> bool {
        match self.access_list.get(user_id) {
            Some(rights) => rights.playlist_access,
            None => self.administrators.iter().any(|a| a == user_id),
        }
    }
}

/// State change broadcast by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupStateUpdate {
    pub state: GroupState,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Group update envelope, tagged by `Type` with the payload in `Data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Data")]
pub enum GroupUpdate {
    PlayQueue(QueueUpdate),
    UserJoined(String),
    UserLeft(String),
    GroupJoined(GroupInfo),
    SyncPlayIsDisabled,
    NotInGroup,
    GroupLeft,
    GroupUpdate(GroupInfo),
    StateUpdate(GroupStateUpdate),
    GroupDoesNotExist,
    CreateGroupDenied,
    JoinGroupDenied,
    LibraryAccessDenied,
}

/// Top-level inbound message from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "MessageType", content = "Data")]
pub enum InboundMessage {
    SyncPlayCommand(PlaybackCommand),
    SyncPlayGroupUpdate(GroupUpdate),
}

/// Payload for `requestSyncPlayPlay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayRequest {
    pub playing_queue: Vec<String>,
    pub playing_item_position: i32,
    pub start_position_ticks: i64,
}

/// Payload for `requestSyncPlayBuffering`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BufferingRequest {
    pub when: DateTime<Utc>,
    pub position_ticks: i64,
    pub is_playing: bool,
    pub playlist_item_id: String,
    pub buffering_done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn command_round_trips_iso8601() {
        let cmd = PlaybackCommand {
            command: CommandKind::Unpause,
            when: instant(1_000),
            emitted_at: instant(999),
            position_ticks: Some(50_000_000),
            playlist_item_id: "item-a".into(),
        };

        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"Command\":\"Unpause\""));
        assert!(json.contains("\"PositionTicks\":50000000"));
        assert!(json.contains("1970-01-01T00:16:40Z"));

        let back: PlaybackCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn same_request_ignores_emitted_at() {
        let a = PlaybackCommand {
            command: CommandKind::Pause,
            when: instant(10),
            emitted_at: instant(9),
            position_ticks: Some(0),
            playlist_item_id: "x".into(),
        };
        let mut b = a.clone();
        b.emitted_at = instant(8);
        assert!(a.same_request(&b));

        b.position_ticks = Some(1);
        assert!(!a.same_request(&b));
    }

    #[test]
    fn group_update_envelope_parses() {
        let json = r#"{
            "Type": "StateUpdate",
            "Data": { "State": "Playing", "Reason": "Unpause" }
        }"#;
        let update: GroupUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(
            update,
            GroupUpdate::StateUpdate(GroupStateUpdate {
                state: GroupState::Playing,
                reason: Some("Unpause".into()),
            })
        );

        let unit: GroupUpdate = serde_json::from_str(r#"{"Type":"NotInGroup"}"#).unwrap();
        assert_eq!(unit, GroupUpdate::NotInGroup);
    }

    #[test]
    fn mode_strings_match_wire() {
        assert_eq!(
            serde_json::to_string(&RepeatMode::RepeatAll).unwrap(),
            "\"RepeatAll\""
        );
        assert_eq!(
            serde_json::to_string(&ShuffleMode::Shuffle).unwrap(),
            "\"Shuffle\""
        );
        assert_eq!(
            serde_json::to_string(&QueueRequestMode::Next).unwrap(),
            "\"next\""
        );
    }

    #[test]
    fn access_falls_back_to_administrators() {
        let mut access_list = HashMap::new();
        access_list.insert(
            "bob".to_string(),
            AccessRights {
                playback_access: false,
                playlist_access: true,
            },
        );
        let info = GroupInfo {
            group_id: "g1".into(),
            participants: vec!["alice".into(), "bob".into()],
            administrators: vec!["alice".into()],
            access_list,
            last_updated_at: instant(0),
        };

        assert!(info.has_playback_access("alice"));
        assert!(!info.has_playback_access("bob"));
        assert!(info.has_playlist_access("bob"));
        assert!(!info.has_playback_access("carol"));
    }
}
