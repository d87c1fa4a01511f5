//! Top-level facade owning the session and routing messages to the cores.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::playback::{CoreState, PlaybackCore, SyncStats};
use crate::core::queue::QueueCore;
use crate::core::SessionContext;
use crate::error::{CoreError, TransportError};
use crate::events::{EventSink, MessageKey, SyncPlayEvent};
use crate::player::adapter::SyncedPlayer;
use crate::player::PlayerEvent;
use crate::protocol::{
    CommandKind, GroupInfo, GroupUpdate, InboundMessage, PlayRequest, PlaybackCommand,
    QueueRequestMode, RepeatMode, ShuffleMode,
};
use crate::settings::Settings;
use crate::time::{TimeProbe, TimeSyncEvent};
use crate::transport::Transport;

/// Time probe that re-reads the transport slot at every dispatch.
struct ProbeViaTransport {
    ctx: Arc<SessionContext>,
}

#[async_trait]
impl TimeProbe for ProbeViaTransport {
    async fn probe(&self) -> Result<DateTime<Utc>, TransportError> {
        let Some(transport) = self.ctx.transport() else {
            return Err(TransportError::Unreachable);
        };
        transport.request_server_time().await
    }
}

/// The one instance coordinating a client's sync session.
///
/// Owns the session state, the cores and the time-sync loop; everything else
/// reaches it through constructor injection.
pub struct Manager {
    ctx: Arc<SessionContext>,
    playback: Arc<PlaybackCore>,
    queue: Arc<QueueCore>,
    user_id: String,
    time_events_cancel: Mutex<Option<oneshot::Sender<()>>>,
    player_dispatch_cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl Manager {
    pub fn new(
        user_id: impl Into<String>,
        settings: Settings,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let ctx = SessionContext::new(settings, sink);
        let playback = PlaybackCore::new(Arc::clone(&ctx));
        let queue = QueueCore::new(Arc::clone(&ctx), Arc::clone(&playback));

        Arc::new(Self {
            ctx,
            playback,
            queue,
            user_id: user_id.into(),
            time_events_cancel: Mutex::new(None),
            player_dispatch_cancel: Mutex::new(None),
        })
    }

    /// Installs (or swaps) the transport.
    pub fn init(&self, transport: Arc<dyn Transport>) {
        self.ctx.set_transport(Some(transport));
    }

    pub fn settings(&self) -> Settings {
        self.ctx.settings.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.ctx.is_enabled()
    }

    pub fn is_following(&self) -> bool {
        self.ctx.state.lock().following_group
    }

    pub fn playback_state(&self) -> CoreState {
        self.playback.state()
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.playback.stats()
    }

    pub fn group(&self) -> Option<GroupInfo> {
        self.ctx.state.lock().group.clone()
    }

    /// Binds a player adapter and starts dispatching its events.
    pub fn bind_player(self: &Arc<Self>, player: Arc<dyn SyncedPlayer>) {
        self.unbind_player();

        let (tx, mut rx) = mpsc::unbounded_channel();
        player.bind_to_player(tx);
        self.ctx.set_player(Some(player));

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.player_dispatch_cancel.lock().replace(cancel_tx);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        this.ctx.emit(SyncPlayEvent::Player(event));
                        match event {
                            PlayerEvent::TimeUpdate => this.playback.on_time_update().await,
                            PlayerEvent::Waiting => this.playback.on_waiting(),
                            PlayerEvent::Playing => this.playback.on_playing().await,
                            _ => {}
                        }
                    }
                    _ = &mut cancel_rx => break,
                }
            }
        });

        self.ctx.emit(SyncPlayEvent::PlayerChange);
    }

    /// Unbinds the current player adapter, if any.
    pub fn unbind_player(&self) {
        self.player_dispatch_cancel.lock().take();
        if let Some(player) = self.ctx.player() {
            player.unbind_from_player();
            self.ctx.set_player(None);
            self.ctx.emit(SyncPlayEvent::PlayerChange);
        }
    }

    /// Joins a group: resets the session and starts time synchronization.
    pub fn enable(self: &Arc<Self>, group: GroupInfo) {
        info!("enabling sync session for group {}", group.group_id);
        {
            let mut state = self.ctx.state.lock();
            state.enabled_at = Some(group.last_updated_at);
            state.ready = false;
            state.following_group = true;
            state.queued_command = None;
            state.last_command = None;
            state.group = Some(group.clone());
        }
        self.playback.on_enabling();
        self.ctx.time_sync.force_update();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let probe = Arc::new(ProbeViaTransport {
            ctx: Arc::clone(&self.ctx),
        });
        self.ctx.time_sync.start(probe, tx);

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.time_events_cancel.lock().replace(cancel_tx);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        this.on_time_sync_event(event).await;
                    }
                    _ = &mut cancel_rx => break,
                }
            }
        });

        self.ctx.emit(SyncPlayEvent::Enabled(true));
        self.ctx.emit(SyncPlayEvent::GroupUpdated(group));
    }

    async fn on_time_sync_event(self: &Arc<Self>, event: TimeSyncEvent) {
        match event {
            TimeSyncEvent::Sample { ping_ms } => {
                // Reported for every accepted sample; the server weights
                // group scheduling with it
                if let Some(transport) = self.ctx.transport() {
                    if let Err(err) = transport.send_ping(ping_ms).await {
                        debug!("ping report failed: {err}");
                    }
                }
            }
            TimeSyncEvent::Update { offset_ms, ping_ms } => {
                self.ctx
                    .emit(SyncPlayEvent::TimeSyncUpdate { offset_ms, ping_ms });

                let flushed = {
                    let mut state = self.ctx.state.lock();
                    if state.ready {
                        None
                    } else {
                        state.ready = true;
                        Some(state.queued_command.take())
                    }
                };
                if let Some(queued) = flushed {
                    self.playback.on_ready();
                    self.ctx.emit(SyncPlayEvent::Ready(true));
                    if let Some(cmd) = queued {
                        debug!("flushing command queued while time sync settled");
                        if let Err(err) = self.process_command(cmd).await {
                            debug!("queued command dropped: {err}");
                        }
                    }
                }
            }
            TimeSyncEvent::Lost => {
                warn!("time sync lost, queuing further commands");
                self.ctx.state.lock().ready = false;
                self.playback.on_enabling();
                self.ctx.time_sync.force_update();
                self.ctx.emit(SyncPlayEvent::TimeSyncLost);
                self.ctx.emit(SyncPlayEvent::Ready(false));
            }
        }
    }

    /// Leaves the group: cancels all timers, unbinds the player and clears
    /// the volatile session state.
    pub fn disable(&self) {
        info!("disabling sync session");
        self.ctx.time_sync.stop();
        self.time_events_cancel.lock().take();
        self.playback.disable();
        self.queue.reset();
        self.unbind_player();
        self.ctx.state.lock().clear();
        self.ctx.emit(SyncPlayEvent::Enabled(false));
    }

    /// Routes a raw inbound message.
    pub async fn process_message(self: &Arc<Self>, message: InboundMessage) {
        match message {
            InboundMessage::SyncPlayCommand(cmd) => {
                if let Err(err) = self.process_command(cmd).await {
                    debug!("command dropped: {err}");
                }
            }
            InboundMessage::SyncPlayGroupUpdate(update) => {
                self.process_group_update(update).await;
            }
        }
    }

    /// Routes a group update.
    pub async fn process_group_update(self: &Arc<Self>, update: GroupUpdate) {
        match update {
            GroupUpdate::GroupJoined(info) => self.enable(info),
            GroupUpdate::GroupLeft | GroupUpdate::NotInGroup => self.disable(),
            GroupUpdate::GroupUpdate(info) => {
                self.ctx.state.lock().group = Some(info.clone());
                self.ctx.emit(SyncPlayEvent::GroupUpdated(info));
            }
            GroupUpdate::StateUpdate(state) => {
                self.ctx.emit(SyncPlayEvent::GroupStateChange {
                    state: state.state,
                    reason: state.reason,
                });
            }
            GroupUpdate::PlayQueue(queue_update) => {
                if !self.ctx.is_enabled() {
                    debug!("queue update while disabled, dropping");
                    return;
                }
                if let Err(err) = self.queue.update_play_queue(queue_update).await {
                    debug!("queue update dropped: {err}");
                }
            }
            GroupUpdate::UserJoined(user) => self.ctx.emit(SyncPlayEvent::UserJoined(user)),
            GroupUpdate::UserLeft(user) => self.ctx.emit(SyncPlayEvent::UserLeft(user)),
            GroupUpdate::SyncPlayIsDisabled => self
                .ctx
                .emit(SyncPlayEvent::ShowMessage(MessageKey::SyncPlayDisabled)),
            GroupUpdate::GroupDoesNotExist => self
                .ctx
                .emit(SyncPlayEvent::ShowMessage(MessageKey::GroupDoesNotExist)),
            GroupUpdate::CreateGroupDenied => self
                .ctx
                .emit(SyncPlayEvent::ShowMessage(MessageKey::CreateGroupDenied)),
            GroupUpdate::JoinGroupDenied => self
                .ctx
                .emit(SyncPlayEvent::ShowMessage(MessageKey::JoinGroupDenied)),
            GroupUpdate::LibraryAccessDenied => self
                .ctx
                .emit(SyncPlayEvent::ShowMessage(MessageKey::LibraryAccessDenied)),
        }
    }

    /// Tears the session down after an internal consistency failure. The
    /// manager stays alive so the client can rejoin.
    fn invariant_failure(&self, what: &'static str) {
        tracing::error!("invariant violated: {what}");
        self.ctx
            .emit(SyncPlayEvent::SessionError(format!("invariant violated: {what}")));
        self.disable();
    }

    /// Validates and applies a playback command.
    pub async fn process_command(self: &Arc<Self>, cmd: PlaybackCommand) -> Result<(), CoreError> {
        let queued_while_ready = {
            let state = self.ctx.state.lock();
            state.ready && state.queued_command.is_some()
        };
        if queued_while_ready {
            self.invariant_failure("queued command alongside ready time sync");
            return Err(CoreError::Invariant(
                "queued command alongside ready time sync",
            ));
        }

        let player_active = self
            .ctx
            .player()
            .map(|p| p.is_playback_active())
            .unwrap_or(false);

        let following = {
            let mut state = self.ctx.state.lock();
            let Some(enabled_at) = state.enabled_at else {
                debug!("command while disabled, dropping");
                return Err(CoreError::NotEnabled);
            };
            if cmd.emitted_at < enabled_at {
                debug!(
                    "command emitted at {:?}, before session enable, dropping",
                    cmd.emitted_at
                );
                return Err(CoreError::StaleCommand);
            }
            if !player_active {
                debug!("command with no active playback, dropping");
                return Ok(());
            }
            if !state.ready {
                debug!("time sync not ready, queuing command");
                state.queued_command = Some(cmd);
                return Ok(());
            }
            state.following_group
        };

        if cmd.command != CommandKind::Stop {
            let current = self.queue.current_playlist_item_id();
            if current.as_deref() != Some(cmd.playlist_item_id.as_str()) {
                warn!(
                    "command for item {} but {} is playing, dropping",
                    cmd.playlist_item_id,
                    current.as_deref().unwrap_or("nothing")
                );
                return Err(CoreError::MismatchedItem);
            }
        }

        self.ctx.state.lock().last_command = Some(cmd.clone());
        if !following {
            debug!("not following the group, command recorded only");
            return Ok(());
        }
        self.playback.apply_command(cmd).await;
        Ok(())
    }

    /// Resumes following the group after a halt.
    pub async fn follow_group(&self) {
        self.queue.follow_group_playback().await;
    }

    /// Stops following the group without leaving it.
    pub async fn halt_group(&self) {
        if let Some(transport) = self.ctx.transport() {
            if let Err(err) = transport.request_set_ignore_wait(true).await {
                warn!("halt request failed: {err}");
            }
        }
        self.ctx.state.lock().following_group = false;
    }

    pub async fn toggle_follow(&self) {
        if self.is_following() {
            self.halt_group().await;
        } else {
            self.follow_group().await;
        }
    }

    // Controller operations. Each checks the caller's access rights and
    // forwards the request to the server; the server answers with a command
    // or queue update that drives the actual change.

    fn check_access(&self, needs_playback: bool) -> Result<(), CoreError> {
        let allowed = {
            let state = self.ctx.state.lock();
            let Some(group) = state.group.as_ref() else {
                return Err(CoreError::NotEnabled);
            };
            if needs_playback {
                group.has_playback_access(&self.user_id)
            } else {
                group.has_playlist_access(&self.user_id)
            }
        };

        if !allowed {
            let key = if needs_playback {
                MessageKey::MissingPlaybackAccess
            } else {
                MessageKey::MissingPlaylistAccess
            };
            self.ctx.emit(SyncPlayEvent::ShowMessage(key));
            return Err(CoreError::AccessDenied(if needs_playback {
                "playback"
            } else {
                "playlist"
            }));
        }
        Ok(())
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, CoreError> {
        self.ctx.transport().ok_or(CoreError::NotEnabled)
    }

    pub async fn play_pause(&self) -> Result<(), CoreError> {
        let playing = self.ctx.player().map(|p| p.is_playing()).unwrap_or(false);
        if playing {
            self.pause().await
        } else {
            self.unpause().await
        }
    }

    pub async fn unpause(&self) -> Result<(), CoreError> {
        self.check_access(true)?;
        if let Err(err) = self.transport()?.request_unpause().await {
            warn!("unpause request failed: {err}");
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), CoreError> {
        self.check_access(true)?;
        if let Err(err) = self.transport()?.request_pause().await {
            warn!("pause request failed: {err}");
        }
        Ok(())
    }

    pub async fn seek(&self, position_ticks: i64) -> Result<(), CoreError> {
        self.check_access(true)?;
        if let Err(err) = self.transport()?.request_seek(position_ticks).await {
            warn!("seek request failed: {err}");
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), CoreError> {
        self.check_access(true)?;
        if let Err(err) = self.transport()?.request_stop().await {
            warn!("stop request failed: {err}");
        }
        Ok(())
    }

    pub async fn play(&self, request: PlayRequest) -> Result<(), CoreError> {
        self.check_access(false)?;
        if let Err(err) = self.transport()?.request_play(request).await {
            warn!("play request failed: {err}");
        }
        Ok(())
    }

    pub async fn set_current_playlist_item(
        &self,
        playlist_item_id: &str,
    ) -> Result<(), CoreError> {
        self.check_access(true)?;
        if let Err(err) = self
            .transport()?
            .request_set_playlist_item(playlist_item_id)
            .await
        {
            warn!("set-playlist-item request failed: {err}");
        }
        Ok(())
    }

    pub async fn remove_from_playlist(
        &self,
        playlist_item_ids: &[String],
    ) -> Result<(), CoreError> {
        self.check_access(false)?;
        if let Err(err) = self
            .transport()?
            .request_remove_from_playlist(playlist_item_ids)
            .await
        {
            warn!("remove-from-playlist request failed: {err}");
        }
        Ok(())
    }

    pub async fn move_playlist_item(
        &self,
        playlist_item_id: &str,
        new_index: usize,
    ) -> Result<(), CoreError> {
        self.check_access(false)?;
        if let Err(err) = self
            .transport()?
            .request_move_playlist_item(playlist_item_id, new_index)
            .await
        {
            warn!("move-playlist-item request failed: {err}");
        }
        Ok(())
    }

    pub async fn queue(&self, item_ids: &[String]) -> Result<(), CoreError> {
        self.check_access(false)?;
        if let Err(err) = self
            .transport()?
            .request_queue(item_ids, QueueRequestMode::Default)
            .await
        {
            warn!("queue request failed: {err}");
        }
        Ok(())
    }

    pub async fn queue_next(&self, item_ids: &[String]) -> Result<(), CoreError> {
        self.check_access(false)?;
        if let Err(err) = self
            .transport()?
            .request_queue(item_ids, QueueRequestMode::Next)
            .await
        {
            warn!("queue-next request failed: {err}");
        }
        Ok(())
    }

    pub async fn next_track(&self) -> Result<(), CoreError> {
        self.check_access(true)?;
        let Some(current) = self.queue.current_playlist_item_id() else {
            return Ok(());
        };
        if let Err(err) = self.transport()?.request_next_track(&current).await {
            warn!("next-track request failed: {err}");
        }
        Ok(())
    }

    pub async fn previous_track(&self) -> Result<(), CoreError> {
        self.check_access(true)?;
        let Some(current) = self.queue.current_playlist_item_id() else {
            return Ok(());
        };
        if let Err(err) = self.transport()?.request_previous_track(&current).await {
            warn!("previous-track request failed: {err}");
        }
        Ok(())
    }

    pub async fn set_repeat_mode(&self, mode: RepeatMode) -> Result<(), CoreError> {
        self.check_access(true)?;
        if let Err(err) = self.transport()?.request_set_repeat_mode(mode).await {
            warn!("repeat-mode request failed: {err}");
        }
        Ok(())
    }

    pub async fn set_shuffle_mode(&self, mode: ShuffleMode) -> Result<(), CoreError> {
        self.check_access(true)?;
        if let Err(err) = self.transport()?.request_set_shuffle_mode(mode).await {
            warn!("shuffle-mode request failed: {err}");
        }
        Ok(())
    }

    pub async fn toggle_shuffle_mode(&self) -> Result<(), CoreError> {
        let next = match self.queue.shuffle_mode() {
            ShuffleMode::Sorted => ShuffleMode::Shuffle,
            ShuffleMode::Shuffle => ShuffleMode::Sorted,
        };
        self.set_shuffle_mode(next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_sink::RecordingSink;
    use crate::player::adapter::LocalPlayer;
    use crate::player::test_player::{MockPlayer, PlayerCall};
    use crate::player::MediaPlayer;
    use crate::protocol::{
        AccessRights, GroupState, GroupStateUpdate, QueueItem, QueueUpdate, UpdateReason,
    };
    use crate::transport::test_transport::{RecordingTransport, TransportCall};
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        manager: Arc<Manager>,
        sink: Arc<RecordingSink>,
        transport: Arc<RecordingTransport>,
        player: Arc<MockPlayer>,
    }

    fn fixture() -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let sink = Arc::new(RecordingSink::new());
        let manager = Manager::new("alice", Settings::new(), Arc::clone(&sink) as _);

        let transport = Arc::new(RecordingTransport::new());
        manager.init(Arc::clone(&transport) as _);

        let player = Arc::new(MockPlayer::new());
        let adapter = Arc::new(LocalPlayer::new(
            Arc::clone(&player) as Arc<dyn MediaPlayer>
        ));
        manager.bind_player(adapter);

        Fixture {
            manager,
            sink,
            transport,
            player,
        }
    }

    fn group(enabled_secs_ago: i64) -> GroupInfo {
        GroupInfo {
            group_id: "group-1".into(),
            participants: vec!["alice".into(), "bob".into()],
            administrators: vec!["alice".into()],
            access_list: HashMap::new(),
            last_updated_at: Utc::now() - ChronoDuration::seconds(enabled_secs_ago),
        }
    }

    fn restricted_group() -> GroupInfo {
        let mut access_list = HashMap::new();
        access_list.insert(
            "alice".to_string(),
            AccessRights {
                playback_access: false,
                playlist_access: false,
            },
        );
        GroupInfo {
            access_list,
            ..group(60)
        }
    }

    fn item(n: u32) -> QueueItem {
        QueueItem {
            playlist_item_id: format!("pl-{n}"),
            item_id: format!("it-{n}"),
        }
    }

    fn playlist_update(secs_ago: i64) -> QueueUpdate {
        QueueUpdate {
            reason: UpdateReason::NewPlaylist,
            last_update: Utc::now() - ChronoDuration::seconds(secs_ago),
            playlist: vec![item(1), item(2)],
            playing_item_index: 0,
            start_position_ticks: 0,
            repeat_mode: RepeatMode::RepeatNone,
            shuffle_mode: ShuffleMode::Sorted,
        }
    }

    fn command(kind: CommandKind, item_id: &str) -> PlaybackCommand {
        PlaybackCommand {
            command: kind,
            when: Utc::now(),
            emitted_at: Utc::now(),
            position_ticks: Some(0),
            playlist_item_id: item_id.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn command_queued_until_ready_then_flushed() {
        let f = fixture();
        f.manager.enable(group(60));
        assert!(f.manager.is_enabled());
        // Spawned tasks have not run yet: still Enabling, not ready
        assert_eq!(f.manager.playback_state(), CoreState::Enabling);

        let cmd = command(CommandKind::Unpause, "pl-1");
        f.manager.process_command(cmd).await.unwrap();
        // Queued, invariant: queued implies not ready
        assert!(f.manager.ctx.state.lock().queued_command.is_some());
        assert!(!f.manager.ctx.state.lock().ready);

        f.manager
            .process_group_update(GroupUpdate::PlayQueue(playlist_update(30)))
            .await;

        // Let the probe loop produce a sample and the consumer flush
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(f.manager.ctx.state.lock().ready);
        assert!(f.manager.ctx.state.lock().queued_command.is_none());
        assert!(f.sink.contains(&SyncPlayEvent::Ready(true)));
        assert!(f.player.contains(&PlayerCall::Unpause));
        // The measured ping was reported to the server
        assert!(f
            .transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::Ping(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_drops_commands_from_the_previous_session() {
        let f = fixture();
        f.manager.enable(group(120));
        f.manager.disable();

        // New session enabled "now"; the straggler was emitted a minute ago
        let fresh = group(0);
        f.manager.enable(fresh.clone());

        let mut stale = command(CommandKind::Unpause, "pl-1");
        stale.emitted_at = fresh.last_updated_at - ChronoDuration::seconds(60);
        let result = f.manager.process_command(stale).await;

        assert_eq!(result, Err(CoreError::StaleCommand));
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_item_is_dropped_but_stop_passes() {
        let f = fixture();
        f.manager.enable(group(60));
        f.manager
            .process_group_update(GroupUpdate::PlayQueue(playlist_update(30)))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await; // ready

        let wrong = command(CommandKind::Pause, "pl-9");
        assert_eq!(
            f.manager.process_command(wrong).await,
            Err(CoreError::MismatchedItem)
        );

        let stop = command(CommandKind::Stop, "pl-9");
        assert_eq!(f.manager.process_command(stop).await, Ok(()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.player.contains(&PlayerCall::Stop));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_while_disabled_are_dropped() {
        let f = fixture();
        let result = f.manager.process_command(command(CommandKind::Pause, "x")).await;
        assert_eq!(result, Err(CoreError::NotEnabled));
        assert!(f.player.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disable_clears_session_and_unbinds_player() {
        let f = fixture();
        f.manager.enable(group(60));
        f.manager.disable();

        assert!(!f.manager.is_enabled());
        assert_eq!(f.manager.playback_state(), CoreState::Disabled);
        assert!(f.manager.ctx.player().is_none());
        assert!(f.sink.contains(&SyncPlayEvent::Enabled(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn group_update_routing() {
        let f = fixture();
        f.manager.enable(group(60));

        // GroupUpdate replaces the group info
        let mut replacement = group(30);
        replacement.participants.push("carol".into());
        f.manager
            .process_group_update(GroupUpdate::GroupUpdate(replacement.clone()))
            .await;
        assert_eq!(
            f.manager.group().unwrap().participants,
            replacement.participants
        );

        // StateUpdate becomes an observable event
        f.manager
            .process_group_update(GroupUpdate::StateUpdate(GroupStateUpdate {
                state: GroupState::Playing,
                reason: Some("Unpause".into()),
            }))
            .await;
        assert!(f.sink.contains(&SyncPlayEvent::GroupStateChange {
            state: GroupState::Playing,
            reason: Some("Unpause".into()),
        }));

        // User churn is observable without state change
        f.manager
            .process_group_update(GroupUpdate::UserJoined("carol".into()))
            .await;
        assert!(f.sink.contains(&SyncPlayEvent::UserJoined("carol".into())));

        // GroupLeft disables
        f.manager.process_group_update(GroupUpdate::GroupLeft).await;
        assert!(!f.manager.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn denied_playback_access_shows_message_and_skips_transport() {
        let f = fixture();
        f.manager.enable(restricted_group());
        let before = f.transport.calls().len();

        let result = f.manager.unpause().await;
        assert_eq!(result, Err(CoreError::AccessDenied("playback")));
        assert!(f.sink.contains(&SyncPlayEvent::ShowMessage(
            MessageKey::MissingPlaybackAccess
        )));
        assert_eq!(f.transport.calls().len(), before);

        let result = f.manager.queue(&["it-5".into()]).await;
        assert_eq!(result, Err(CoreError::AccessDenied("playlist")));
        assert!(f.sink.contains(&SyncPlayEvent::ShowMessage(
            MessageKey::MissingPlaylistAccess
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn controller_operations_reach_the_server() {
        let f = fixture();
        f.manager.enable(group(60));
        f.manager
            .process_group_update(GroupUpdate::PlayQueue(playlist_update(30)))
            .await;

        f.manager.unpause().await.unwrap();
        f.manager.seek(1234).await.unwrap();
        f.manager.next_track().await.unwrap();
        f.manager.toggle_shuffle_mode().await.unwrap();

        assert!(f.transport.contains(&TransportCall::Unpause));
        assert!(f.transport.contains(&TransportCall::Seek(1234)));
        assert!(f
            .transport
            .contains(&TransportCall::NextTrack("pl-1".into())));
        assert!(f
            .transport
            .contains(&TransportCall::SetShuffleMode(ShuffleMode::Shuffle)));
    }

    #[tokio::test(start_paused = true)]
    async fn halt_and_follow_round_trip() {
        let f = fixture();
        f.manager.enable(group(60));
        assert!(f.manager.is_following());

        f.manager.halt_group().await;
        assert!(!f.manager.is_following());
        assert!(f.transport.contains(&TransportCall::SetIgnoreWait(true)));

        f.manager.toggle_follow().await;
        assert!(f.manager.is_following());
        assert!(f.transport.contains(&TransportCall::SetIgnoreWait(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_message_envelope_routes_both_kinds() {
        let f = fixture();
        f.manager.enable(group(60));

        f.manager
            .process_message(InboundMessage::SyncPlayGroupUpdate(GroupUpdate::PlayQueue(
                playlist_update(30),
            )))
            .await;
        assert_eq!(
            f.manager.queue.current_playlist_item_id(),
            Some("pl-1".into())
        );

        tokio::time::sleep(Duration::from_millis(100)).await; // ready
        f.manager
            .process_message(InboundMessage::SyncPlayCommand(command(
                CommandKind::Unpause,
                "pl-1",
            )))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.player.contains(&PlayerCall::Unpause));
    }

    #[tokio::test(start_paused = true)]
    async fn every_accepted_probe_reports_ping() {
        let f = fixture();
        f.manager.enable(group(60));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pings = |f: &Fixture| {
            f.transport
                .calls()
                .iter()
                .filter(|c| matches!(c, TransportCall::Ping(_)))
                .count()
        };
        let initial = pings(&f);
        assert!(initial >= 1);

        // Later samples keep the offset inside the dead band, so no further
        // TimeSyncUpdate is emitted, but pings keep flowing
        let updates_before = f
            .sink
            .events()
            .iter()
            .filter(|e| matches!(e, SyncPlayEvent::TimeSyncUpdate { .. }))
            .count();
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert!(pings(&f) > initial);
        let updates_after = f
            .sink
            .events()
            .iter()
            .filter(|e| matches!(e, SyncPlayEvent::TimeSyncUpdate { .. }))
            .count();
        assert_eq!(updates_before, updates_after);
    }

    #[tokio::test(start_paused = true)]
    async fn invariant_violation_tears_the_session_down() {
        let f = fixture();
        f.manager.enable(group(60));
        tokio::time::sleep(Duration::from_millis(100)).await; // ready

        // Corrupt the state: a queued command must never coexist with ready
        f.manager.ctx.state.lock().queued_command =
            Some(command(CommandKind::Pause, "pl-1"));

        let result = f
            .manager
            .process_command(command(CommandKind::Unpause, "pl-1"))
            .await;
        assert!(matches!(result, Err(CoreError::Invariant(_))));
        assert!(!f.manager.is_enabled());
        assert!(f
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, SyncPlayEvent::SessionError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn halted_client_records_commands_without_enacting_them() {
        let f = fixture();
        f.manager.enable(group(60));
        f.manager
            .process_group_update(GroupUpdate::PlayQueue(playlist_update(30)))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await; // ready

        f.manager.halt_group().await;
        let calls_before = f.player.calls().len();

        f.manager
            .process_command(command(CommandKind::Unpause, "pl-1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Bookkeeping happened, the player was left alone
        assert!(f.manager.ctx.state.lock().last_command.is_some());
        assert_eq!(f.player.calls().len(), calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn measured_offset_reaches_the_event_sink() {
        let sink = Arc::new(RecordingSink::new());
        let manager = Manager::new("alice", Settings::new(), Arc::clone(&sink) as _);
        // Server clock runs 5 s ahead of ours
        let transport = Arc::new(RecordingTransport::with_offset(
            chrono::Duration::seconds(5),
        ));
        manager.init(Arc::clone(&transport) as _);
        let player = Arc::new(MockPlayer::new());
        manager.bind_player(Arc::new(LocalPlayer::new(
            player as Arc<dyn MediaPlayer>,
        )));

        manager.enable(group(60));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let offset_ms = sink
            .events()
            .into_iter()
            .find_map(|e| match e {
                SyncPlayEvent::TimeSyncUpdate { offset_ms, .. } => Some(offset_ms),
                _ => None,
            })
            .expect("time sync update emitted");
        assert!((offset_ms - 5_000).abs() < 100, "offset was {offset_ms}");
    }

    #[tokio::test(start_paused = true)]
    async fn time_sync_lost_drops_back_to_enabling_and_queues() {
        let f = fixture();
        f.manager.enable(group(60));
        tokio::time::sleep(Duration::from_millis(100)).await; // ready
        assert!(f.manager.ctx.state.lock().ready);

        f.manager.on_time_sync_event(TimeSyncEvent::Lost).await;

        assert!(!f.manager.ctx.state.lock().ready);
        assert_eq!(f.manager.playback_state(), CoreState::Enabling);
        assert!(f.sink.contains(&SyncPlayEvent::TimeSyncLost));

        // Subsequent commands are queued again
        f.manager
            .process_command(command(CommandKind::Pause, "pl-1"))
            .await
            .unwrap();
        assert!(f.manager.ctx.state.lock().queued_command.is_some());
    }
}
