//! Session facade: the single point of contact for one guild's music view.
//!
//! A [`Session`] owns the driver task for its guild and hands out cheap
//! read-only views: state and status snapshots through watch channels, an
//! event receiver, and a [`Remote`] for sending playback commands. Exactly
//! one facade should be live per guild view at a time; dropping it cancels
//! its driver, so a superseded session can never feed stale updates into a
//! new one.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    connection::{ConnectionStatus, Driver},
    error::Result,
    events::Event,
    player::PlayerState,
    protocol::{OutboundMessage, RepeatMode},
    resolver::{ArtistInfo, LyricsResult, Resolver},
};

/// A guild music session.
///
/// Constructed when a guild's music view mounts; [`start`](Self::start)
/// connects, [`stop`](Self::stop) tears down. Both are idempotent.
pub struct Session {
    config: Config,
    resolver: Resolver,

    state_tx: Arc<watch::Sender<PlayerState>>,
    state_rx: watch::Receiver<PlayerState>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    status_rx: watch::Receiver<ConnectionStatus>,

    command_tx: mpsc::UnboundedSender<OutboundMessage>,
    command_rx: Arc<Mutex<mpsc::UnboundedReceiver<OutboundMessage>>>,

    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: Option<mpsc::UnboundedReceiver<Event>>,

    shutdown: CancellationToken,
    driver: Option<(JoinHandle<()>, CancellationToken)>,
}

impl Session {
    /// Creates a session for the configured guild. Does not connect yet.
    pub fn new(config: Config) -> Result<Self> {
        let resolver = Resolver::new(&config)?;
        let (state_tx, state_rx) = watch::channel(PlayerState::default());
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            resolver,
            state_tx: Arc::new(state_tx),
            state_rx,
            status_tx: Arc::new(status_tx),
            status_rx,
            command_tx,
            command_rx: Arc::new(Mutex::new(command_rx)),
            event_tx,
            event_rx: Some(event_rx),
            shutdown: CancellationToken::new(),
            driver: None,
        })
    }

    /// Starts the connection driver.
    ///
    /// No-op while a driver is already connecting or connected. After a
    /// terminal connection error the driver has ended, and calling this
    /// again starts a fresh one with a fresh reconnect budget.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if let Some((handle, _)) = &self.driver {
            if !handle.is_finished() {
                debug!("session already started");
                return;
            }
        }

        let token = self.shutdown.child_token();
        let driver = Driver::new(
            self.config.clone(),
            self.resolver.clone(),
            Arc::clone(&self.state_tx),
            Arc::clone(&self.status_tx),
            self.event_tx.clone(),
            Arc::clone(&self.command_rx),
            token.clone(),
        );

        let handle = tokio::spawn(driver.run());
        self.driver = Some((handle, token));
    }

    /// Stops the connection driver and waits for it to wind down.
    ///
    /// Cancels the heartbeat, position tick, any pending reconnect, and the
    /// transport, all at once. Idempotent; the session can be started again
    /// afterwards.
    pub async fn stop(&mut self) {
        if let Some((handle, token)) = self.driver.take() {
            debug!("stopping session for guild {}", self.config.guild_id);
            token.cancel();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("session driver ended abnormally: {e}");
                }
            }
        }
    }

    /// Current player state snapshot. Cheap to call on every render.
    #[must_use]
    pub fn state(&self) -> PlayerState {
        self.state_rx.borrow().clone()
    }

    /// Watch channel for state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<PlayerState> {
        self.state_rx.clone()
    }

    /// Whether the WebSocket is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status_rx.borrow().connected
    }

    /// Last connection-level error, if any.
    #[must_use]
    pub fn connection_error(&self) -> Option<String> {
        self.status_rx.borrow().error.clone()
    }

    /// Watch channel for connection status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Command surface for this session.
    #[must_use]
    pub fn remote(&self) -> Remote {
        Remote {
            command_tx: self.command_tx.clone(),
            state_rx: self.state_rx.clone(),
            status_rx: self.status_rx.clone(),
        }
    }

    /// Takes the session event receiver. Returns `None` after the first
    /// call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.event_rx.take()
    }

    /// Lyrics for the currently playing track, fetched on demand and cached.
    ///
    /// `None` when nothing is playing or no lyrics are available.
    pub async fn lyrics(&self) -> Option<Arc<LyricsResult>> {
        let (title, artist) = self.current_identity()?;
        self.resolver.lyrics(&title, &artist).await
    }

    /// Artist info for the currently playing track, fetched on demand and
    /// cached.
    pub async fn artist_info(&self) -> Option<Arc<ArtistInfo>> {
        let (title, artist) = self.current_identity()?;
        self.resolver.artist_info(&title, &artist).await
    }

    fn current_identity(&self) -> Option<(String, String)> {
        let state = self.state_rx.borrow();
        state
            .current
            .as_ref()
            .map(|current| (current.title.clone(), current.artist.clone()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Cancels the driver and with it the transport and all timers.
        self.shutdown.cancel();
    }
}

/// Playback command surface of a session.
///
/// Commands serialize user intent to the server; local state never changes
/// until the next authoritative `STATE_UPDATE` arrives. While disconnected,
/// commands are dropped silently; consumers should disable controls based on
/// [`Session::is_connected`].
#[derive(Clone, Debug)]
pub struct Remote {
    command_tx: mpsc::UnboundedSender<OutboundMessage>,
    state_rx: watch::Receiver<PlayerState>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl Remote {
    pub fn play(&self) {
        self.send(OutboundMessage::Play {});
    }

    pub fn pause(&self) {
        self.send(OutboundMessage::Pause {});
    }

    /// Pauses when playing, plays when paused.
    pub fn toggle_play(&self) {
        if self.state_rx.borrow().controls.is_playing {
            self.pause();
        } else {
            self.play();
        }
    }

    pub fn skip(&self) {
        self.send(OutboundMessage::Skip {});
    }

    pub fn seek(&self, position: Duration) {
        self.send(OutboundMessage::Seek { position });
    }

    /// Sets the volume in percent, clamped to `0..=100`.
    pub fn set_volume(&self, volume: u8) {
        self.send(OutboundMessage::Volume {
            volume: volume.min(100),
        });
    }

    pub fn toggle_shuffle(&self) {
        self.send(OutboundMessage::Shuffle {});
    }

    pub fn set_repeat(&self, mode: RepeatMode) {
        self.send(OutboundMessage::Repeat { mode });
    }

    fn send(&self, message: OutboundMessage) {
        if !self.status_rx.borrow().connected {
            debug!("dropping command while disconnected: {message:?}");
            return;
        }

        if self.command_tx.send(message).is_err() {
            debug!("dropping command: session is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;

    use super::*;
    use crate::token::AuthToken;

    fn test_session() -> Session {
        let token: AuthToken = "test-token".parse().unwrap();
        let config = Config::new(NonZeroU64::new(1).unwrap(), token);
        Session::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_commands_are_dropped_while_disconnected() {
        let session = test_session();
        let remote = session.remote();

        remote.play();
        remote.seek(Duration::from_secs(10));

        let mut command_rx = session.command_rx.try_lock().unwrap();
        assert!(command_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_receiver_is_taken_once() {
        let mut session = test_session();
        assert!(session.events().is_some());
        assert!(session.events().is_none());
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected_and_idle() {
        let session = test_session();
        assert!(!session.is_connected());
        assert!(session.connection_error().is_none());
        assert!(session.state().current.is_none());
    }

    #[tokio::test]
    async fn test_volume_is_clamped_before_sending() {
        let session = test_session();

        // Force the connected status so the command passes the gate.
        let _ = session
            .status_tx
            .send_replace(crate::connection::ConnectionStatus {
                connected: true,
                error: None,
            });

        session.remote().set_volume(200);

        let mut command_rx = session.command_rx.try_lock().unwrap();
        assert_eq!(
            command_rx.try_recv().unwrap(),
            OutboundMessage::Volume { volume: 100 }
        );
    }
}
