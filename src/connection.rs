//! WebSocket lifecycle for one guild music session.
//!
//! The [`Driver`] owns the transport and everything scheduled around it: the
//! heartbeat timer, the local position tick, the command receiver, and the
//! in-flight artwork resolutions. All of them are branches of one
//! `tokio::select!` loop, so the reconciler has a single writer and
//! teardown is total: cancelling the session token unwinds the loop, which
//! drops the socket and every timer together.
//!
//! Abnormal connection losses are retried on an exponential backoff schedule
//! ([`ReconnectPolicy`]); exhausting the budget publishes a terminal
//! connection error and ends the driver until the session is started again.

use std::{ops::ControlFlow, sync::Arc, time::Duration, vec};

use exponential_backoff::Backoff;
use futures_util::{
    future::BoxFuture,
    stream::{FuturesUnordered, SplitSink},
    FutureExt, SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Mutex},
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
    tungstenite::Message as WebsocketMessage,
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::Config,
    error::Result,
    events::Event,
    player::PlayerState,
    protocol::{InboundMessage, OutboundMessage},
    reconciler::Reconciler,
    resolver::Resolver,
};

/// Cadence of the local playback position interpolation.
const POSITION_TICK: Duration = Duration::from_secs(1);

/// Inbound messages larger than this are dropped unparsed.
const MAX_MESSAGE_SIZE: usize = 128 * 1024;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WebsocketMessage>;

/// Connection status as exposed to session consumers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Whether the WebSocket is currently open.
    pub connected: bool,

    /// Last connection-level error. Set while the server reports an error
    /// and after the reconnect budget is exhausted; cleared on reconnect.
    pub error: Option<String>,
}

/// Lifecycle of the transport connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed(CloseReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Normal,
    Abnormal(String),
}

/// Bounded exponential backoff schedule for reconnect attempts.
///
/// The schedule is computed up front, so the remaining budget is plain
/// state rather than a captured counter.
#[derive(Debug)]
pub struct ReconnectPolicy {
    delays: vec::IntoIter<Duration>,
    attempts: u32,
    used: u32,
}

impl ReconnectPolicy {
    /// Creates a schedule of `attempts` delays starting at `base` and
    /// doubling, e.g. 1s, 2s, 4s for the defaults.
    #[must_use]
    pub fn new(attempts: u32, base: Duration) -> Self {
        // The final backoff entry signals exhaustion instead of a delay, so
        // request one more attempt than delays needed.
        let cap = base.saturating_mul(1_u32 << attempts.min(16));
        let backoff = Backoff::new(attempts + 1, base, cap);
        let delays: Vec<Duration> = backoff.iter().flatten().take(attempts as usize).collect();

        Self {
            delays: delays.into_iter(),
            attempts,
            used: 0,
        }
    }

    /// The next reconnect delay, or `None` when the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.delays.next();
        if delay.is_some() {
            self.used += 1;
        }
        delay
    }

    /// Attempts used so far.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.used
    }

    /// Total attempts in the budget.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// How one served connection ended.
enum ServeEnd {
    /// The session was stopped; do not reconnect.
    Stopped,

    /// The server closed the connection cleanly; do not reconnect.
    NormalClosure,

    /// The connection failed or was lost; eligible for reconnect.
    Abnormal(String),
}

/// Owns the transport and drives one guild session until stopped.
pub(crate) struct Driver {
    config: Config,
    resolver: Resolver,
    reconciler: Reconciler,
    state: ConnectionState,
    state_tx: Arc<watch::Sender<PlayerState>>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    event_tx: mpsc::UnboundedSender<Event>,
    command_rx: Arc<Mutex<mpsc::UnboundedReceiver<OutboundMessage>>>,
    shutdown: CancellationToken,
}

impl Driver {
    pub fn new(
        config: Config,
        resolver: Resolver,
        state_tx: Arc<watch::Sender<PlayerState>>,
        status_tx: Arc<watch::Sender<ConnectionStatus>>,
        event_tx: mpsc::UnboundedSender<Event>,
        command_rx: Arc<Mutex<mpsc::UnboundedReceiver<OutboundMessage>>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            resolver,
            reconciler: Reconciler::new(),
            state: ConnectionState::Idle,
            state_tx,
            status_tx,
            event_tx,
            command_rx,
            shutdown,
        }
    }

    /// Runs the session until stopped, the server closes cleanly, or the
    /// reconnect budget is exhausted.
    pub async fn run(mut self) {
        let command_rx = Arc::clone(&self.command_rx);
        let Ok(mut command_rx) = command_rx.try_lock() else {
            error!("session driver is already running");
            return;
        };

        let mut policy = ReconnectPolicy::new(
            self.config.reconnect_attempts,
            self.config.reconnect_base,
        );

        'session: loop {
            match self.serve(&mut command_rx).await {
                ServeEnd::Stopped => {
                    self.publish_status(false, None);
                    break;
                }
                ServeEnd::NormalClosure => {
                    info!("session closed by server");
                    self.publish_status(false, None);
                    break;
                }
                ServeEnd::Abnormal(reason) => {
                    self.publish_status(false, None);

                    let Some(delay) = policy.next_delay() else {
                        warn!(
                            "giving up after {} reconnect attempts: {reason}",
                            policy.attempts()
                        );
                        self.publish_status(false, Some(reason));
                        break;
                    };

                    info!(
                        "reconnecting in {:.1}s (attempt {}/{}): {reason}",
                        delay.as_secs_f32(),
                        policy.attempt(),
                        policy.attempts()
                    );

                    let sleep = tokio::time::sleep(delay);
                    tokio::pin!(sleep);
                    loop {
                        tokio::select! {
                            () = self.shutdown.cancelled() => {
                                self.publish_status(false, None);
                                break 'session;
                            }
                            () = &mut sleep => break,
                            Some(command) = command_rx.recv() => {
                                debug!("dropping command while disconnected: {command:?}");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Serves one connection attempt from dial to close.
    async fn serve(
        &mut self,
        command_rx: &mut mpsc::UnboundedReceiver<OutboundMessage>,
    ) -> ServeEnd {
        self.set_state(ConnectionState::Connecting);

        let url = self.endpoint();
        debug!(
            "connecting to {} for guild {}",
            self.config.websocket_url, self.config.guild_id
        );

        let connect = tokio_tungstenite::connect_async(url);
        let ws = tokio::select! {
            () = self.shutdown.cancelled() => {
                self.set_state(ConnectionState::Closed(CloseReason::Normal));
                return ServeEnd::Stopped;
            }
            result = connect => match result {
                Ok((ws, _)) => ws,
                Err(e) => {
                    self.set_state(ConnectionState::Closed(CloseReason::Abnormal(e.to_string())));
                    return ServeEnd::Abnormal(format!("connection failed: {e}"));
                }
            }
        };

        let (mut ws_tx, mut ws_rx) = ws.split();
        self.set_state(ConnectionState::Open);
        self.publish_status(true, None);
        let _ = self.event_tx.send(Event::Connected);
        info!("connected to music session for guild {}", self.config.guild_id);

        // Commands issued while there was no connection are dropped, not
        // replayed against a player state they were not aimed at.
        while command_rx.try_recv().is_ok() {}

        if let Err(e) = send(&mut ws_tx, &OutboundMessage::Hello {}).await {
            warn!("error sending handshake: {e}");
        }

        let mut heartbeat: Option<Interval> = None;
        let mut position = interval_at(Instant::now() + POSITION_TICK, POSITION_TICK);
        position.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut enrichments: FuturesUnordered<BoxFuture<'static, (String, Option<Url>)>> =
            FuturesUnordered::new();

        let end = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    self.set_state(ConnectionState::Closing);
                    let close = WebsocketMessage::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "session stopped".into(),
                    }));
                    if let Err(e) = ws_tx.send(close).await {
                        debug!("error closing connection: {e}");
                    }
                    break ServeEnd::Stopped;
                }

                _ = position.tick() => {
                    self.reconciler.tick(POSITION_TICK);
                    self.publish_state();
                }

                // Pends forever until the server's HELLO arms the timer.
                () = async {
                    match heartbeat.as_mut() {
                        Some(timer) => {
                            timer.tick().await;
                        }
                        None => std::future::pending().await,
                    }
                } => {
                    trace!("ping");
                    if let Err(e) = send(&mut ws_tx, &OutboundMessage::Ping {}).await {
                        warn!("error sending heartbeat: {e}");
                    }
                }

                Some(command) = command_rx.recv() => {
                    if self.state == ConnectionState::Open {
                        trace!("sending command: {command:?}");
                        if let Err(e) = send(&mut ws_tx, &command).await {
                            warn!("error sending command: {e}");
                        }
                    } else {
                        debug!("dropping command: connection not open");
                    }
                }

                Some((key, artwork)) = enrichments.next(), if !enrichments.is_empty() => {
                    if self.reconciler.apply_artwork(&key, artwork) {
                        self.publish_state();
                    }
                }

                message = ws_rx.next() => match message {
                    Some(Ok(message)) => {
                        match self.handle_message(&message, &mut heartbeat, &mut enrichments) {
                            ControlFlow::Continue(()) => {}
                            ControlFlow::Break(end) => break end,
                        }
                    }
                    Some(Err(e)) => break ServeEnd::Abnormal(format!("connection lost: {e}")),
                    None => break ServeEnd::Abnormal("connection closed unexpectedly".to_owned()),
                }
            }
        };

        self.set_state(match &end {
            ServeEnd::Stopped | ServeEnd::NormalClosure => ConnectionState::Closed(CloseReason::Normal),
            ServeEnd::Abnormal(reason) => {
                ConnectionState::Closed(CloseReason::Abnormal(reason.clone()))
            }
        });
        let _ = self.event_tx.send(Event::Disconnected);

        end
    }

    /// Handles one frame from the transport.
    ///
    /// Parse failures are logged and dropped; they never end the connection.
    fn handle_message(
        &mut self,
        message: &WebsocketMessage,
        heartbeat: &mut Option<Interval>,
        enrichments: &mut FuturesUnordered<BoxFuture<'static, (String, Option<Url>)>>,
    ) -> ControlFlow<ServeEnd> {
        match message {
            WebsocketMessage::Text(text) => {
                let message_size = text.len();
                if message_size > MAX_MESSAGE_SIZE {
                    warn!("ignoring oversized message with {message_size} bytes");
                    return ControlFlow::Continue(());
                }

                match serde_json::from_str::<InboundMessage>(text.as_str()) {
                    Ok(inbound) => self.handle_inbound(inbound, heartbeat, enrichments),
                    Err(e) => warn!("error parsing message: {e}"),
                }
                ControlFlow::Continue(())
            }
            // tungstenite answers pings on flush; nothing to do here.
            WebsocketMessage::Ping(_) | WebsocketMessage::Pong(_) => ControlFlow::Continue(()),
            WebsocketMessage::Close(frame) => {
                let normal = frame
                    .as_ref()
                    .is_some_and(|frame| frame.code == CloseCode::Normal);
                debug!("connection closed by server: {frame:?}");

                if normal {
                    ControlFlow::Break(ServeEnd::NormalClosure)
                } else {
                    ControlFlow::Break(ServeEnd::Abnormal(format!(
                        "connection closed by server: {frame:?}"
                    )))
                }
            }
            _ => {
                trace!("message type unimplemented");
                ControlFlow::Continue(())
            }
        }
    }

    /// Dispatches one parsed inbound message.
    fn handle_inbound(
        &mut self,
        message: InboundMessage,
        heartbeat: &mut Option<Interval>,
        enrichments: &mut FuturesUnordered<BoxFuture<'static, (String, Option<Url>)>>,
    ) {
        match message {
            InboundMessage::Hello(hello) => {
                let period = hello.heartbeat_interval;
                if period.is_zero() {
                    warn!("ignoring zero heartbeat interval");
                    return;
                }
                debug!("heartbeat every {:.1}s", period.as_secs_f32());

                // The first ping is due one full interval after the handshake.
                let mut timer = interval_at(Instant::now() + period, period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *heartbeat = Some(timer);
            }

            InboundMessage::StateUpdate(update) => {
                let outcome = self.reconciler.apply_update(update);
                self.publish_state();

                for event in outcome.events {
                    let _ = self.event_tx.send(event);
                }

                if let Some(change) = outcome.track_change {
                    debug!("track changed to {} by {}", change.title, change.artist);
                    let resolver = self.resolver.clone();
                    enrichments.push(
                        async move {
                            let artwork = resolver.artwork(&change.title, &change.artist).await;
                            (change.key, artwork)
                        }
                        .boxed(),
                    );
                }
            }

            InboundMessage::ServerError(error) => {
                warn!("server error: {}", error.message);
                self.publish_status(true, Some(error.message));
            }
        }
    }

    /// The connection URL, including the authentication query parameter.
    /// Never logged.
    fn endpoint(&self) -> String {
        let mut url = self.config.websocket_url.clone();
        url.set_path(&format!("/ws/music/{}", self.config.guild_id));
        url.query_pairs_mut()
            .clear()
            .append_pair("auth", self.config.token.as_str());

        url.to_string()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            trace!("connection state: {:?} -> {state:?}", self.state);
            self.state = state;
        }
    }

    fn publish_state(&self) {
        let _ = self.state_tx.send_replace(self.reconciler.state().clone());
    }

    fn publish_status(&self, connected: bool, error: Option<String>) {
        let _ = self
            .status_tx
            .send_replace(ConnectionStatus { connected, error });
    }
}

/// Serializes and sends one outbound message.
async fn send(ws_tx: &mut WsSink, message: &OutboundMessage) -> Result<()> {
    let text = serde_json::to_string(message)?;
    ws_tx
        .send(WebsocketMessage::text(text))
        .await
        .map_err(Into::into)
}
