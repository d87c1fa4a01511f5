//! Session context shared by the cores and the manager.

pub mod playback;
pub mod queue;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::events::{EventSink, SyncPlayEvent};
use crate::player::adapter::SyncedPlayer;
use crate::protocol::{GroupInfo, PlaybackCommand};
use crate::settings::Settings;
use crate::time::TimeSync;
use crate::transport::Transport;

/// Volatile per-session state. Cleared on disable; nothing is persisted.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Remote instant the session was enabled at; present iff in a group
    pub enabled_at: Option<DateTime<Utc>>,
    /// True once time sync has produced a usable offset
    pub ready: bool,
    /// Whether local playback tracks the group
    pub following_group: bool,
    /// Command received while not ready, applied once ready flips true
    pub queued_command: Option<PlaybackCommand>,
    /// Last successfully interpreted command; basis for drift estimates
    pub last_command: Option<PlaybackCommand>,
    pub group: Option<GroupInfo>,
}

impl SessionState {
    /// Resets everything except configuration-like fields.
    pub fn clear(&mut self) {
        *self = Self {
            following_group: true,
            ..Self::default()
        };
    }
}

/// Shared plumbing injected into both cores.
///
/// The transport and player slots are re-read at every use; holding an
/// `Arc<dyn Transport>` across a suspension point would pin a swapped-out
/// transport alive and dispatch to the wrong server.
pub struct SessionContext {
    pub settings: Settings,
    pub time_sync: Arc<TimeSync>,
    sink: Arc<dyn EventSink>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    player: RwLock<Option<Arc<dyn SyncedPlayer>>>,
    pub state: Mutex<SessionState>,
}

impl SessionContext {
    pub fn new(settings: Settings, sink: Arc<dyn EventSink>) -> Arc<Self> {
        let time_sync = Arc::new(TimeSync::new(settings.clone()));
        Arc::new(Self {
            settings,
            time_sync,
            sink,
            transport: RwLock::new(None),
            player: RwLock::new(None),
            state: Mutex::new(SessionState {
                following_group: true,
                ..SessionState::default()
            }),
        })
    }

    /// The active transport, re-read per use.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    pub fn set_transport(&self, transport: Option<Arc<dyn Transport>>) {
        *self.transport.write() = transport;
    }

    /// The bound player adapter, re-read per use.
    pub fn player(&self) -> Option<Arc<dyn SyncedPlayer>> {
        self.player.read().clone()
    }

    pub fn set_player(&self, player: Option<Arc<dyn SyncedPlayer>>) {
        *self.player.write() = player;
    }

    pub fn emit(&self, event: SyncPlayEvent) {
        self.sink.emit(event);
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled_at.is_some()
    }
}

/// One-shot timer slot. Arming replaces (and thereby cancels) the previous
/// timer of this slot, so at most one is ever pending.
#[derive(Default)]
pub(crate) struct TimerSlot {
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `action` after `delay` on the monotonic clock, unless cancelled
    /// or re-armed first. A zero delay still yields to the executor.
    pub fn arm<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = oneshot::channel::<()>();
        self.cancel.lock().replace(tx);

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => action.await,
                _ = &mut rx => {}
            }
        });
    }

    /// Cancels the pending timer, if any.
    pub fn cancel(&self) {
        self.cancel.lock().take();
    }

    pub fn is_armed(&self) -> bool {
        self.cancel
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}
