//! The public face of the client: a cheap handle in front of one driver task
//! that owns the [`ChatMachine`] and performs its effects.

use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::{ConnectionState, ConversationId, Identity, ParticipantId},
    protocol::{Message, SEND_DESTINATION},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    api::HttpChatApi,
    auth::{AuthApi, Credentials, Registration},
    config::ClientSettings,
    connection::{BrokerHandle, ConnectionEvent, ConnectionManager},
    conversation::parse_participant_id,
    error::{ClientError, ClientResult, ValidationError},
    history::{self, HistoryApi, HistoryResult},
    machine::{ChatMachine, ClientEvent, Effect, Phase},
};

const EVENT_CAPACITY: usize = 1024;

/// Point-in-time copy of everything a front end renders.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub identity: Option<Identity>,
    pub peer: Option<ParticipantId>,
    pub conversation: Option<ConversationId>,
    pub connection: ConnectionState,
    pub phase: Phase,
    pub messages: Vec<Message>,
    pub history_error: Option<String>,
}

enum Input {
    SignIn {
        identity: Identity,
        reply: oneshot::Sender<()>,
    },
    SignOut {
        reply: oneshot::Sender<()>,
    },
    SelectPeer {
        peer: Option<ParticipantId>,
        reply: oneshot::Sender<Result<Option<ConversationId>, ValidationError>>,
    },
    Send {
        content: String,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<ChatSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct ChatClient {
    auth: Arc<dyn AuthApi>,
    inputs: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<ClientEvent>,
    connection_state: watch::Receiver<ConnectionState>,
    driver: JoinHandle<()>,
}

impl ChatClient {
    /// Connects to the server described by `settings`. The broker session is
    /// activated immediately and lives until [`ChatClient::shutdown`].
    pub fn start(settings: &ClientSettings) -> Result<Self> {
        let api = Arc::new(HttpChatApi::new(
            &settings.server_url,
            settings.request_timeout(),
        )?);
        let (connection, connection_events) =
            ConnectionManager::activate(settings.connection_options()?);
        Ok(Self::with_dependencies(
            api.clone(),
            api,
            connection,
            connection_events,
        ))
    }

    pub fn with_dependencies(
        auth: Arc<dyn AuthApi>,
        history: Arc<dyn HistoryApi>,
        connection: ConnectionManager,
        connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let connection_state = connection.watch_state();

        let driver = Driver {
            machine: ChatMachine::default(),
            history_api: history,
            broker: connection.broker(),
            connection_state: connection_state.clone(),
            events: events.clone(),
            history_tx,
            fetch: None,
        };
        let driver = tokio::spawn(driver.run(inputs_rx, connection_events, history_rx, connection));

        Self {
            auth,
            inputs: inputs_tx,
            events,
            connection_state,
            driver,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.clone()
    }

    /// Validates locally, authenticates, then replaces any previous identity.
    /// On failure nothing about the current session changes.
    pub async fn login(&self, participant_id: &str, password: &str) -> ClientResult<Identity> {
        let credentials = Credentials::parse(participant_id, password)?;
        let identity = self.auth.login(&credentials).await?;
        self.sign_in(identity).await
    }

    pub async fn register(
        &self,
        participant_id: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> ClientResult<Identity> {
        let registration = Registration::parse(participant_id, password, display_name)?;
        let identity = self.auth.register(&registration).await?;
        self.sign_in(identity).await
    }

    pub async fn logout(&self) -> ClientResult<()> {
        self.request(|reply| Input::SignOut { reply }).await
    }

    /// An empty `peer` clears the selection. Returns the conversation now shown.
    pub async fn select_peer(&self, peer: &str) -> ClientResult<Option<ConversationId>> {
        let peer = match peer.trim() {
            "" => None,
            raw => Some(parse_participant_id(raw)?),
        };
        Ok(self
            .request(|reply| Input::SelectPeer { peer, reply })
            .await??)
    }

    /// Publishes to the selected conversation. The message is shown once the
    /// broker echoes it on the conversation topic.
    pub async fn send_message(&self, content: &str) -> ClientResult<()> {
        let content = content.to_string();
        self.request(|reply| Input::Send { content, reply }).await?
    }

    pub async fn snapshot(&self) -> ClientResult<ChatSnapshot> {
        self.request(|reply| Input::Snapshot { reply }).await
    }

    /// Unsubscribes, deactivates the broker session and waits for the driver
    /// to exit. No event is published afterwards.
    pub async fn shutdown(self) {
        let (reply, done) = oneshot::channel();
        if self.inputs.send(Input::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
        if let Err(err) = self.driver.await {
            warn!(%err, "chat driver ended abnormally");
        }
    }

    async fn sign_in(&self, identity: Identity) -> ClientResult<Identity> {
        let signed_in = identity.clone();
        self.request(|reply| Input::SignIn { identity, reply })
            .await?;
        Ok(signed_in)
    }

    async fn request<T>(&self, input: impl FnOnce(oneshot::Sender<T>) -> Input) -> ClientResult<T> {
        let (reply, response) = oneshot::channel();
        self.inputs.send(input(reply)).map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())
    }
}

fn stopped() -> ClientError {
    ClientError::Connection("chat client has shut down".into())
}

struct Driver {
    machine: ChatMachine,
    history_api: Arc<dyn HistoryApi>,
    broker: BrokerHandle,
    connection_state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    history_tx: mpsc::UnboundedSender<HistoryResult>,
    fetch: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut history_results: mpsc::UnboundedReceiver<HistoryResult>,
        connection: ConnectionManager,
    ) {
        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(Input::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(input) => self.on_input(input),
                    None => break,
                },
                Some(event) = connection_events.recv() => {
                    let effects = self.machine.on_connection_event(event);
                    self.execute(effects);
                    self.publish();
                }
                Some(result) = history_results.recv() => {
                    self.machine.on_history(result);
                    self.publish();
                }
            }
        }

        let effects = self.machine.teardown();
        self.execute(effects);
        self.abort_fetch();
        connection.deactivate().await;
        info!("chat client stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::SignIn { identity, reply } => {
                let effects = self.machine.sign_in(identity);
                self.execute(effects);
                self.publish();
                let _ = reply.send(());
            }
            Input::SignOut { reply } => {
                let effects = self.machine.sign_out();
                self.execute(effects);
                self.publish();
                let _ = reply.send(());
            }
            Input::SelectPeer { peer, reply } => {
                let outcome = self.machine.select_peer(peer).map(|effects| {
                    self.execute(effects);
                    self.machine.conversation()
                });
                self.publish();
                let _ = reply.send(outcome);
            }
            Input::Send { content, reply } => {
                let _ = reply.send(self.send(&content));
            }
            Input::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop.
            Input::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn send(&self, content: &str) -> ClientResult<()> {
        let outbound = self.machine.compose(content)?;
        let body = serde_json::to_string(&outbound.message)
            .map_err(|err| ClientError::Connection(format!("failed to encode message: {err}")))?;
        self.broker
            .publish(outbound.session, SEND_DESTINATION, body)?;
        info!(
            conversation_id = outbound.message.conversation_id.0,
            session = outbound.session.0,
            "message published"
        );
        Ok(())
    }

    fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            identity: self.machine.identity().cloned(),
            peer: self.machine.peer(),
            conversation: self.machine.conversation(),
            // Read from the session task so a pending retry shows as Connecting.
            connection: *self.connection_state.borrow(),
            phase: self.machine.phase(),
            messages: self.machine.messages().to_vec(),
            history_error: self.machine.history_error().map(str::to_string),
        }
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            let issued = match effect {
                Effect::Unsubscribe(handle) => self.broker.unsubscribe(&handle),
                Effect::Subscribe {
                    handle,
                    destination,
                } => self.broker.subscribe(&handle, &destination),
                Effect::FetchHistory(request) => {
                    self.abort_fetch();
                    let api = self.history_api.clone();
                    let results = self.history_tx.clone();
                    self.fetch = Some(tokio::spawn(async move {
                        let _ = results.send(history::load(api.as_ref(), request).await);
                    }));
                    Ok(())
                }
                Effect::CancelHistory => {
                    self.abort_fetch();
                    Ok(())
                }
            };
            if let Err(err) = issued {
                warn!(%err, "broker command rejected");
            }
        }
    }

    fn abort_fetch(&mut self) {
        if let Some(fetch) = self.fetch.take() {
            fetch.abort();
        }
    }

    fn publish(&mut self) {
        for event in self.machine.drain_events() {
            // No receivers is fine.
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
