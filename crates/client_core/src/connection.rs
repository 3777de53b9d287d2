//! The single broker session: STOMP over a WebSocket, with automatic
//! reconnect and heart-beat supervision.
//!
//! A [`ConnectionManager`] owns one background task. Everything the rest of the
//! client learns about the session arrives, in order, on the event channel
//! returned by [`ConnectionManager::activate`]; everything it asks of the session
//! goes through a [`BrokerHandle`].

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::domain::ConnectionState;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ClientError, ClientResult},
    stomp::{decode_frames, Command, Frame, Heartbeat},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Counts successful `CONNECTED` handshakes; every reconnect starts a new epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionEpoch(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub session: SessionEpoch,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub session: SessionEpoch,
    pub subscription: String,
    pub destination: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { session: SessionEpoch },
    Closed,
    Error(String),
    Delivery(Delivery),
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub endpoint: Url,
    pub reconnect_delay: Duration,
    pub heartbeat: Heartbeat,
    pub connect_timeout: Duration,
}

impl ConnectionOptions {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            reconnect_delay: Duration::from_secs(5),
            heartbeat: Heartbeat::new(Duration::from_secs(4), Duration::from_secs(4)),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
enum BrokerCommand {
    Subscribe {
        handle: SubscriptionHandle,
        destination: String,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
    },
    Publish {
        session: SessionEpoch,
        destination: String,
        body: String,
    },
    Deactivate,
}

/// Cheap, cloneable way to issue broker operations. Commands addressed to a
/// session that is no longer live are dropped by the connection task.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    commands: mpsc::UnboundedSender<BrokerCommand>,
}

impl BrokerHandle {
    pub fn subscribe(&self, handle: &SubscriptionHandle, destination: &str) -> ClientResult<()> {
        self.submit(BrokerCommand::Subscribe {
            handle: handle.clone(),
            destination: destination.to_string(),
        })
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> ClientResult<()> {
        self.submit(BrokerCommand::Unsubscribe {
            handle: handle.clone(),
        })
    }

    pub fn publish(
        &self,
        session: SessionEpoch,
        destination: &str,
        body: String,
    ) -> ClientResult<()> {
        self.submit(BrokerCommand::Publish {
            session,
            destination: destination.to_string(),
            body,
        })
    }

    fn submit(&self, command: BrokerCommand) -> ClientResult<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::Connection("broker session has been deactivated".into()))
    }
}

pub struct ConnectionManager {
    broker: BrokerHandle,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Starts the session task. It keeps reconnecting until [`deactivate`]
    /// is called or every [`BrokerHandle`] is dropped.
    ///
    /// [`deactivate`]: ConnectionManager::deactivate
    pub fn activate(
        options: ConnectionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let worker = ConnectionWorker {
            options,
            commands: commands_rx,
            events: events_tx,
            state: state_tx,
            epoch: 0,
        };
        let task = tokio::spawn(worker.run());

        (
            Self {
                broker: BrokerHandle {
                    commands: commands_tx,
                },
                state: state_rx,
                task,
            },
            events_rx,
        )
    }

    pub fn broker(&self) -> BrokerHandle {
        self.broker.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Sends `DISCONNECT`, stops reconnecting, and waits for the task to exit.
    /// No event is emitted after this returns.
    pub async fn deactivate(self) {
        let _ = self.broker.commands.send(BrokerCommand::Deactivate);
        if let Err(err) = self.task.await {
            warn!(%err, "broker connection task ended abnormally");
        }
    }
}

enum SessionEnd {
    Deactivated,
    Closed,
    Failed(String),
}

struct ConnectionWorker {
    options: ConnectionOptions,
    commands: mpsc::UnboundedReceiver<BrokerCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    epoch: u64,
}

impl ConnectionWorker {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.run_session().await {
                SessionEnd::Deactivated => break,
                SessionEnd::Closed => {
                    info!(endpoint = %self.options.endpoint, "broker session closed");
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(ConnectionEvent::Closed);
                }
                SessionEnd::Failed(reason) => {
                    warn!(endpoint = %self.options.endpoint, %reason, "broker session failed");
                    self.set_state(ConnectionState::Error);
                    self.emit(ConnectionEvent::Error(reason));
                }
            }
            if !self.wait_before_retry().await {
                break;
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!(endpoint = %self.options.endpoint, "broker session deactivated");
    }

    async fn run_session(&mut self) -> SessionEnd {
        let opening = open_session(self.options.clone());
        tokio::pin!(opening);
        let (mut sink, mut source, beats) = loop {
            tokio::select! {
                opened = &mut opening => match opened {
                    Ok(parts) => break parts,
                    Err(err) => return SessionEnd::Failed(format!("{err:#}")),
                },
                command = self.commands.recv() => match command {
                    None | Some(BrokerCommand::Deactivate) => return SessionEnd::Deactivated,
                    Some(stale) => debug!(?stale, "dropping broker command while connecting"),
                },
            }
        };

        self.epoch += 1;
        let session = SessionEpoch(self.epoch);
        info!(
            session = session.0,
            endpoint = %self.options.endpoint,
            heartbeat_out_ms = beats.outgoing.as_millis() as u64,
            heartbeat_in_ms = beats.incoming.as_millis() as u64,
            "broker session connected"
        );
        self.set_state(ConnectionState::Connected);
        self.emit(ConnectionEvent::Connected { session });

        let mut outgoing = heartbeat_ticker(beats.outgoing);
        let mut incoming = heartbeat_ticker(beats.incoming);
        let mut last_received = Instant::now();

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let command = command.unwrap_or(BrokerCommand::Deactivate);
                    if let BrokerCommand::Deactivate = command {
                        let _ = sink
                            .send(WsMessage::Text(Frame::new(Command::Disconnect).encode()))
                            .await;
                        let _ = sink.close().await;
                        return SessionEnd::Deactivated;
                    }
                    if let Some(frame) = frame_for(session, command) {
                        if let Err(err) = sink.send(WsMessage::Text(frame.encode())).await {
                            return SessionEnd::Failed(format!("websocket send failed: {err}"));
                        }
                    }
                }
                message = source.next() => {
                    last_received = Instant::now();
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(end) = self.handle_inbound(session, &text) {
                                return end;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Closed,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            return SessionEnd::Failed(format!("websocket receive failed: {err}"));
                        }
                    }
                }
                _ = next_tick(&mut outgoing) => {
                    if let Err(err) = sink.send(WsMessage::Text("\n".into())).await {
                        return SessionEnd::Failed(format!("heart-beat send failed: {err}"));
                    }
                }
                _ = next_tick(&mut incoming) => {
                    if last_received.elapsed() > beats.incoming * 2 {
                        return SessionEnd::Failed("heart-beat timeout: broker went silent".into());
                    }
                }
            }
        }
    }

    fn handle_inbound(&self, session: SessionEpoch, text: &str) -> Option<SessionEnd> {
        let frames = match decode_frames(text) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(%err, "discarding undecodable broker frame");
                return None;
            }
        };
        for frame in frames {
            match frame.command {
                Command::Message => {
                    let Some(subscription) = frame.get("subscription") else {
                        debug!("MESSAGE frame without subscription header");
                        continue;
                    };
                    self.emit(ConnectionEvent::Delivery(Delivery {
                        session,
                        subscription: subscription.to_string(),
                        destination: frame.get("destination").unwrap_or_default().to_string(),
                        body: frame.body.clone(),
                    }));
                }
                Command::Error => return Some(SessionEnd::Failed(error_reason(&frame))),
                Command::Receipt | Command::Connected => {}
                other => debug!(command = other.as_str(), "ignoring unexpected broker frame"),
            }
        }
        None
    }

    /// Returns `false` when deactivated during the pause.
    async fn wait_before_retry(&mut self) -> bool {
        let deadline = Instant::now() + self.options.reconnect_delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                command = self.commands.recv() => match command {
                    None | Some(BrokerCommand::Deactivate) => return false,
                    Some(stale) => debug!(?stale, "dropping broker command while disconnected"),
                },
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

fn frame_for(session: SessionEpoch, command: BrokerCommand) -> Option<Frame> {
    match command {
        BrokerCommand::Subscribe {
            handle,
            destination,
        } if handle.session == session => Some(Frame::subscribe(&handle.id, &destination)),
        BrokerCommand::Unsubscribe { handle } if handle.session == session => {
            Some(Frame::unsubscribe(&handle.id))
        }
        BrokerCommand::Publish {
            session: target,
            destination,
            body,
        } if target == session => Some(Frame::send(&destination, body)),
        BrokerCommand::Deactivate => None,
        stale => {
            debug!(?stale, current = session.0, "dropping broker command for a previous session");
            None
        }
    }
}

async fn open_session(options: ConnectionOptions) -> Result<(WsSink, WsSource, Heartbeat)> {
    let (ws_stream, _) = timeout(options.connect_timeout, connect_async(options.endpoint.as_str()))
        .await
        .map_err(|_| anyhow!("timed out connecting websocket: {}", options.endpoint))?
        .with_context(|| format!("failed to connect websocket: {}", options.endpoint))?;
    let (mut sink, mut source) = ws_stream.split();

    let host = options.endpoint.host_str().unwrap_or("localhost");
    sink.send(WsMessage::Text(Frame::connect(host, options.heartbeat).encode()))
        .await
        .context("failed to send CONNECT frame")?;

    let connected = timeout(options.connect_timeout, await_connected(&mut source))
        .await
        .map_err(|_| anyhow!("timed out waiting for CONNECTED frame"))??;
    let server = connected
        .get("heart-beat")
        .and_then(Heartbeat::parse)
        .unwrap_or_default();

    Ok((sink, source, options.heartbeat.negotiate(server)))
}

async fn await_connected(source: &mut WsSource) -> Result<Frame> {
    while let Some(message) = source.next().await {
        let text = match message.context("websocket receive failed")? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        for frame in decode_frames(&text)? {
            match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => return Err(anyhow!(error_reason(&frame))),
                _ => {}
            }
        }
    }
    Err(anyhow!("connection closed before CONNECTED frame"))
}

fn error_reason(frame: &Frame) -> String {
    match frame.get("message") {
        Some(message) if !message.is_empty() => message.to_string(),
        _ if !frame.body.is_empty() => frame.body.clone(),
        _ => "broker reported an error".to_string(),
    }
}

fn heartbeat_ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
