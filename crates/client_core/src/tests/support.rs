//! In-process chat server for network tests: the auth and history routes plus
//! a minimal STOMP broker on `/ws-chat`.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ConversationId, Identity, MessageId, ParticipantId},
    protocol::{
        conversation_topic, LoginRequest, Message, OutboundMessage, RegisterRequest,
        SEND_DESTINATION,
    },
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
    time::timeout,
};
use url::Url;

use crate::{
    connection::ConnectionOptions,
    stomp::{decode_frames, Command, Frame, Heartbeat},
};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BrokerRecord {
    Connected,
    Subscribed { id: String, destination: String },
    Unsubscribed { id: String },
    Sent { destination: String, body: String },
    Heartbeat,
    Disconnected,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeOptions {
    /// `heart-beat` header of the CONNECTED frame.
    pub server_heartbeat: String,
    /// Answer CONNECT with an ERROR frame carrying this message.
    pub reject_connect: Option<String>,
    /// Store and re-publish every SEND to `/app/chat.send`.
    pub echo_sends: bool,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            server_heartbeat: "0,0".into(),
            reject_connect: None,
            echo_sends: false,
        }
    }
}

#[derive(Debug, Clone)]
enum Control {
    Publish { destination: String, body: String },
    DropConnections,
}

struct User {
    password: String,
    display_name: String,
}

struct FakeState {
    options: FakeOptions,
    records: mpsc::UnboundedSender<BrokerRecord>,
    control: broadcast::Sender<Control>,
    users: Mutex<HashMap<u64, User>>,
    history: Mutex<HashMap<u64, Vec<Message>>>,
    history_delays: Mutex<HashMap<u64, Duration>>,
    failing_history: Mutex<bool>,
    next_message_id: AtomicI64,
}

pub(crate) struct FakeServer {
    pub base_url: String,
    state: Arc<FakeState>,
    records: mpsc::UnboundedReceiver<BrokerRecord>,
}

impl FakeServer {
    pub async fn start(options: FakeOptions) -> Self {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");

        let (records_tx, records) = mpsc::unbounded_channel();
        let (control, _) = broadcast::channel(64);
        let state = Arc::new(FakeState {
            options,
            records: records_tx,
            control,
            users: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            history_delays: Mutex::new(HashMap::new()),
            failing_history: Mutex::new(false),
            next_message_id: AtomicI64::new(1000),
        });

        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/register", post(register))
            .route("/api/conversations/:id/messages", get(history))
            .route("/ws-chat", get(broker))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve fake server");
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            records,
        }
    }

    pub fn ws_url(&self) -> Url {
        let url = format!("{}/ws-chat", self.base_url.replacen("http", "ws", 1));
        Url::parse(&url).expect("ws url")
    }

    /// Fast timings so reconnect tests finish quickly.
    pub fn connection_options(&self) -> ConnectionOptions {
        let mut options = ConnectionOptions::new(self.ws_url());
        options.reconnect_delay = Duration::from_millis(50);
        options.heartbeat = Heartbeat::new(Duration::ZERO, Duration::ZERO);
        options.connect_timeout = Duration::from_secs(2);
        options
    }

    pub fn add_user(&self, id: u64, password: &str, display_name: &str) {
        self.state.users.lock().expect("users lock").insert(
            id,
            User {
                password: password.into(),
                display_name: display_name.into(),
            },
        );
    }

    pub fn set_history(&self, conversation: ConversationId, messages: Vec<Message>) {
        self.state
            .history
            .lock()
            .expect("history lock")
            .insert(conversation.0, messages);
    }

    pub fn delay_history(&self, conversation: ConversationId, delay: Duration) {
        self.state
            .history_delays
            .lock()
            .expect("delay lock")
            .insert(conversation.0, delay);
    }

    pub fn fail_history(&self, failing: bool) {
        *self.state.failing_history.lock().expect("failure lock") = failing;
    }

    /// Delivers `message` to every subscriber of its conversation topic.
    pub fn publish(&self, message: &Message) {
        let _ = self.state.control.send(Control::Publish {
            destination: conversation_topic(message.conversation_id),
            body: serde_json::to_string(message).expect("encode message"),
        });
    }

    pub fn drop_connections(&self) {
        let _ = self.state.control.send(Control::DropConnections);
    }

    /// Skips records until one matches, failing the test after [`WAIT`].
    pub async fn wait_for(&mut self, mut matches: impl FnMut(&BrokerRecord) -> bool) -> BrokerRecord {
        within(async {
            loop {
                let record = self.records.recv().await.expect("record channel open");
                if matches(&record) {
                    return record;
                }
            }
        })
        .await
    }

    /// Everything recorded so far, without waiting.
    pub fn drain_records(&mut self) -> Vec<BrokerRecord> {
        let mut drained = Vec::new();
        while let Ok(record) = self.records.try_recv() {
            drained.push(record);
        }
        drained
    }
}

pub(crate) async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(WAIT, future).await.expect("timed out waiting")
}

pub(crate) fn sample_message(id: i64, conversation: ConversationId, sender: u64, content: &str) -> Message {
    Message {
        id: MessageId(id),
        conversation_id: conversation,
        sender_id: ParticipantId(sender),
        recipient_id: None,
        sender_name: format!("User {sender}"),
        content: content.into(),
        sent_at: Utc::now(),
    }
}

async fn login(State(state): State<Arc<FakeState>>, Json(body): Json<LoginRequest>) -> Response {
    let users = state.users.lock().expect("users lock");
    match users.get(&body.participant_id.0) {
        Some(user) if user.password == body.password => {
            Json(identity(body.participant_id, &user.display_name)).into_response()
        }
        _ => (StatusCode::BAD_REQUEST, "Invalid credentials").into_response(),
    }
}

async fn register(
    State(state): State<Arc<FakeState>>,
    Json(body): Json<RegisterRequest>,
) -> Response {
    let mut users = state.users.lock().expect("users lock");
    if users.contains_key(&body.participant_id.0) {
        return (StatusCode::BAD_REQUEST, "User already exists").into_response();
    }
    let display_name = body
        .display_name
        .unwrap_or_else(|| format!("User {}", body.participant_id));
    users.insert(
        body.participant_id.0,
        User {
            password: body.password,
            display_name: display_name.clone(),
        },
    );
    (
        StatusCode::CREATED,
        Json(identity(body.participant_id, &display_name)),
    )
        .into_response()
}

fn identity(participant_id: ParticipantId, display_name: &str) -> Identity {
    Identity {
        participant_id,
        username: format!("user{participant_id}"),
        display_name: display_name.into(),
    }
}

async fn history(State(state): State<Arc<FakeState>>, Path(conversation): Path<u64>) -> Response {
    let delay = state
        .history_delays
        .lock()
        .expect("delay lock")
        .get(&conversation)
        .copied();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if *state.failing_history.lock().expect("failure lock") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "history unavailable").into_response();
    }
    let messages = state
        .history
        .lock()
        .expect("history lock")
        .get(&conversation)
        .cloned()
        .unwrap_or_default();
    Json(messages).into_response()
}

async fn broker(ws: WebSocketUpgrade, State(state): State<Arc<FakeState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| broker_connection(state, socket))
}

async fn broker_connection(state: Arc<FakeState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut control = state.control.subscribe();
    // (subscription id, destination)
    let mut subscriptions: Vec<(String, String)> = Vec::new();
    let record = |record: BrokerRecord| {
        let _ = state.records.send(record);
    };

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                let text = match inbound {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if text.trim_matches(|c| c == '\r' || c == '\n').is_empty() {
                    record(BrokerRecord::Heartbeat);
                    continue;
                }
                let Ok(frames) = decode_frames(&text) else {
                    continue;
                };
                for frame in frames {
                    match frame.command {
                        Command::Connect => {
                            if let Some(reason) = &state.options.reject_connect {
                                let error = Frame::new(Command::Error).header("message", reason.as_str());
                                let _ = sender.send(WsMessage::Text(error.encode())).await;
                                let _ = sender.send(WsMessage::Close(None)).await;
                                return;
                            }
                            let connected = Frame::new(Command::Connected)
                                .header("version", "1.2")
                                .header("heart-beat", state.options.server_heartbeat.as_str());
                            if sender.send(WsMessage::Text(connected.encode())).await.is_err() {
                                return;
                            }
                            record(BrokerRecord::Connected);
                        }
                        Command::Subscribe => {
                            let id = frame.get("id").unwrap_or_default().to_string();
                            let destination = frame.get("destination").unwrap_or_default().to_string();
                            subscriptions.push((id.clone(), destination.clone()));
                            record(BrokerRecord::Subscribed { id, destination });
                        }
                        Command::Unsubscribe => {
                            let id = frame.get("id").unwrap_or_default().to_string();
                            subscriptions.retain(|(active, _)| *active != id);
                            record(BrokerRecord::Unsubscribed { id });
                        }
                        Command::Send => {
                            let destination = frame.get("destination").unwrap_or_default().to_string();
                            if state.options.echo_sends && destination == SEND_DESTINATION {
                                echo(&state, &frame.body);
                            }
                            record(BrokerRecord::Sent {
                                destination,
                                body: frame.body,
                            });
                        }
                        Command::Disconnect => {
                            record(BrokerRecord::Disconnected);
                            return;
                        }
                        _ => {}
                    }
                }
            }
            signal = control.recv() => match signal {
                Ok(Control::Publish { destination, body }) => {
                    for (id, subscribed) in &subscriptions {
                        if *subscribed != destination {
                            continue;
                        }
                        let message = Frame::new(Command::Message)
                            .header("subscription", id.as_str())
                            .header("destination", destination.as_str())
                            .header("message-id", id.as_str())
                            .header("content-type", "application/json")
                            .body(body.clone());
                        if sender.send(WsMessage::Text(message.encode())).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Control::DropConnections) => {
                    let _ = sender.send(WsMessage::Close(None)).await;
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

/// Persists an outbound message the way the real server does and publishes it.
fn echo(state: &FakeState, body: &str) {
    let Ok(outbound) = serde_json::from_str::<OutboundMessage>(body) else {
        return;
    };
    let display_name = state
        .users
        .lock()
        .expect("users lock")
        .get(&outbound.sender_id.0)
        .map(|user| user.display_name.clone())
        .unwrap_or_else(|| format!("User {}", outbound.sender_id));
    let message = Message {
        id: MessageId(state.next_message_id.fetch_add(1, Ordering::SeqCst)),
        conversation_id: outbound.conversation_id,
        sender_id: outbound.sender_id,
        recipient_id: outbound.recipient_id,
        sender_name: display_name,
        content: outbound.content,
        sent_at: Utc::now(),
    };
    state
        .history
        .lock()
        .expect("history lock")
        .entry(message.conversation_id.0)
        .or_default()
        .push(message.clone());
    let _ = state.control.send(Control::Publish {
        destination: conversation_topic(message.conversation_id),
        body: serde_json::to_string(&message).expect("encode message"),
    });
}
