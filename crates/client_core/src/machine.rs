//! The chat state machine. Pure: every transition returns the effects the
//! caller must perform, in order, and queues [`ClientEvent`]s for observers.

use shared::{
    domain::{ConnectionState, ConversationId, Identity, ParticipantId},
    protocol::{Message, OutboundMessage},
};
use tracing::{debug, info, warn};

use crate::{
    auth::AuthSession,
    connection::{ConnectionEvent, Delivery, SessionEpoch, SubscriptionHandle},
    conversation::conversation_id,
    error::{ClientError, ClientResult, ValidationError},
    history::{HistoryLoader, HistoryRequest, HistoryResult},
    stream::{LiveOutcome, MessageStream},
    subscription::{Link, Subscription, SubscriptionCoordinator, SubscriptionOp},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No conversation selected.
    Idle,
    LoadingHistory,
    /// History shown, waiting for the broker to come up.
    Subscribing,
    Live,
    /// The history snapshot failed; live delivery still proceeds.
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Unsubscribe(SubscriptionHandle),
    FetchHistory(HistoryRequest),
    CancelHistory,
    Subscribe {
        handle: SubscriptionHandle,
        destination: String,
    },
}

impl From<SubscriptionOp> for Effect {
    fn from(op: SubscriptionOp) -> Self {
        match op {
            SubscriptionOp::Unsubscribe(handle) => Self::Unsubscribe(handle),
            SubscriptionOp::Subscribe {
                handle,
                destination,
            } => Self::Subscribe {
                handle,
                destination,
            },
        }
    }
}

/// A message ready to publish on a specific broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub session: SessionEpoch,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SignedIn(Identity),
    SignedOut,
    ConnectionChanged(ConnectionState),
    BrokerError(String),
    /// The displayed conversation changed and its sequence was cleared.
    ConversationChanged(Option<ConversationId>),
    MessagesReplaced {
        conversation: ConversationId,
        messages: Vec<Message>,
    },
    MessageAppended(Message),
    HistoryFailed {
        conversation: ConversationId,
        reason: String,
    },
}

#[derive(Debug, Default)]
pub struct ChatMachine {
    auth: AuthSession,
    peer: Option<ParticipantId>,
    conversation: Option<ConversationId>,
    link: Link,
    subscriptions: SubscriptionCoordinator,
    history: HistoryLoader,
    stream: MessageStream,
    history_error: Option<String>,
    outbox: Vec<ClientEvent>,
}

impl ChatMachine {
    pub fn identity(&self) -> Option<&Identity> {
        self.auth.identity()
    }

    pub fn peer(&self) -> Option<ParticipantId> {
        self.peer
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.conversation
    }

    pub fn connection(&self) -> ConnectionState {
        self.link.state
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscriptions.active()
    }

    pub fn messages(&self) -> &[Message] {
        self.stream.messages()
    }

    pub fn history_error(&self) -> Option<&str> {
        self.history_error.as_deref()
    }

    pub fn phase(&self) -> Phase {
        if self.conversation.is_none() {
            Phase::Idle
        } else if self.history.is_loading() {
            Phase::LoadingHistory
        } else if self.history_error.is_some() {
            Phase::Errored
        } else if self.subscriptions.active().is_some() {
            Phase::Live
        } else {
            Phase::Subscribing
        }
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// A new identity always starts without a peer and without messages.
    pub fn sign_in(&mut self, identity: Identity) -> Vec<Effect> {
        self.auth.establish(identity.clone());
        self.peer = None;
        let effects = self.retarget();
        self.outbox.push(ClientEvent::SignedIn(identity));
        effects
    }

    pub fn sign_out(&mut self) -> Vec<Effect> {
        let previous = self.auth.clear();
        self.peer = None;
        let effects = self.retarget();
        if previous.is_some() {
            self.outbox.push(ClientEvent::SignedOut);
        }
        effects
    }

    pub fn select_peer(&mut self, peer: Option<ParticipantId>) -> Result<Vec<Effect>, ValidationError> {
        if self.auth.identity().is_none() {
            return Err(ValidationError::NotSignedIn);
        }
        self.peer = peer;
        Ok(self.retarget())
    }

    pub fn on_connection_event(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        match event {
            ConnectionEvent::Connected { session } => {
                self.set_link(Link::connected(session));
                self.reconcile_subscription()
            }
            ConnectionEvent::Closed => {
                self.set_link(Link::down(ConnectionState::Disconnected));
                self.reconcile_subscription()
            }
            ConnectionEvent::Error(reason) => {
                self.set_link(Link::down(ConnectionState::Error));
                self.outbox.push(ClientEvent::BrokerError(reason));
                self.reconcile_subscription()
            }
            ConnectionEvent::Delivery(delivery) => {
                self.on_delivery(delivery);
                Vec::new()
            }
        }
    }

    pub fn on_history(&mut self, result: HistoryResult) {
        if !self.history.complete(result.request) {
            return;
        }
        let conversation = result.request.conversation;
        match result.outcome {
            Ok(snapshot) => {
                self.history_error = None;
                self.stream.apply_snapshot(conversation, snapshot);
            }
            Err(err) => {
                let reason = err.to_string();
                self.history_error = Some(reason.clone());
                self.stream.apply_failed_snapshot(conversation);
                self.outbox.push(ClientEvent::HistoryFailed {
                    conversation,
                    reason,
                });
            }
        }
        self.outbox.push(ClientEvent::MessagesReplaced {
            conversation,
            messages: self.stream.messages().to_vec(),
        });
    }

    /// Validates an outgoing message against the current selection and session.
    pub fn compose(&self, content: &str) -> ClientResult<Outbound> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        let sender = self
            .auth
            .participant_id()
            .ok_or(ValidationError::NotSignedIn)?;
        let (Some(peer), Some(conversation)) = (self.peer, self.conversation) else {
            return Err(ValidationError::NoPeerSelected.into());
        };
        let session = self
            .link
            .live_session()
            .ok_or_else(|| ClientError::Connection("not connected to the broker".into()))?;

        Ok(Outbound {
            session,
            message: OutboundMessage {
                conversation_id: conversation,
                sender_id: sender,
                recipient_id: Some(peer),
                content: content.to_string(),
            },
        })
    }

    /// Drops the subscription and any pending load, and forgets the session.
    pub fn teardown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.history.cancel().is_some() {
            effects.push(Effect::CancelHistory);
        }
        self.link = Link::down(ConnectionState::Disconnected);
        effects.extend(self.subscriptions.teardown().into_iter().map(Effect::from));
        effects
    }

    fn set_link(&mut self, link: Link) {
        if self.link.state != link.state {
            self.outbox.push(ClientEvent::ConnectionChanged(link.state));
        }
        self.link = link;
    }

    fn reconcile_subscription(&mut self) -> Vec<Effect> {
        self.subscriptions
            .reconcile(self.conversation, self.link)
            .into_iter()
            .map(Effect::from)
            .collect()
    }

    /// Recomputes the conversation from identity and peer. On change the
    /// displayed sequence is cleared first, the old subscription is dropped,
    /// then history is requested and the new subscription issued.
    fn retarget(&mut self) -> Vec<Effect> {
        let target = match (self.auth.participant_id(), self.peer) {
            (Some(me), Some(peer)) => Some(conversation_id(me, peer)),
            _ => None,
        };
        if target == self.conversation {
            return self.reconcile_subscription();
        }

        info!(
            from = ?self.conversation.map(|c| c.0),
            to = ?target.map(|c| c.0),
            "switching conversation"
        );
        self.conversation = target;
        self.stream.reset(target);
        self.history_error = None;
        self.outbox.push(ClientEvent::ConversationChanged(target));

        let mut effects = Vec::new();
        let mut subscribe = Vec::new();
        for op in self.subscriptions.reconcile(target, self.link) {
            match op {
                SubscriptionOp::Unsubscribe(_) => effects.push(op.into()),
                SubscriptionOp::Subscribe { .. } => subscribe.push(op.into()),
            }
        }
        match target {
            Some(conversation) => {
                effects.push(Effect::FetchHistory(self.history.begin(conversation)));
            }
            None => {
                if self.history.cancel().is_some() {
                    effects.push(Effect::CancelHistory);
                }
            }
        }
        effects.extend(subscribe);
        effects
    }

    fn on_delivery(&mut self, delivery: Delivery) {
        let Some(conversation) = self.subscriptions.route(&delivery) else {
            debug!(
                session = delivery.session.0,
                subscription = %delivery.subscription,
                "discarding delivery for an inactive subscription"
            );
            return;
        };
        let message: Message = match serde_json::from_str(&delivery.body) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, destination = %delivery.destination, "discarding undecodable message payload");
                return;
            }
        };
        match self.stream.push_live(message.clone()) {
            LiveOutcome::Appended => self.outbox.push(ClientEvent::MessageAppended(message)),
            LiveOutcome::Buffered => debug!(
                conversation_id = conversation.0,
                message_id = message.id.0,
                "holding live message until history arrives"
            ),
            LiveOutcome::Duplicate => debug!(
                conversation_id = conversation.0,
                message_id = message.id.0,
                "dropping duplicate live message"
            ),
            LiveOutcome::Foreign => debug!(
                conversation_id = conversation.0,
                message_conversation_id = message.conversation_id.0,
                "dropping live message addressed to another conversation"
            ),
        }
    }
}

#[cfg(test)]
#[path = "tests/machine_tests.rs"]
mod tests;
