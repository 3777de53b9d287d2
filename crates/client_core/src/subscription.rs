use shared::{
    domain::{ConnectionState, ConversationId},
    protocol::conversation_topic,
};
use tracing::info;

use crate::connection::{Delivery, SessionEpoch, SubscriptionHandle};

/// What the coordinator knows about the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Link {
    pub state: ConnectionState,
    pub session: Option<SessionEpoch>,
}

impl Link {
    pub fn connected(session: SessionEpoch) -> Self {
        Self {
            state: ConnectionState::Connected,
            session: Some(session),
        }
    }

    pub fn down(state: ConnectionState) -> Self {
        Self {
            state,
            session: None,
        }
    }

    pub fn live_session(&self) -> Option<SessionEpoch> {
        match self.state {
            ConnectionState::Connected => self.session,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub conversation: ConversationId,
    pub handle: SubscriptionHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOp {
    Unsubscribe(SubscriptionHandle),
    Subscribe {
        handle: SubscriptionHandle,
        destination: String,
    },
}

/// Owns the at-most-one live subscription.
#[derive(Debug, Default)]
pub struct SubscriptionCoordinator {
    active: Option<Subscription>,
    next_id: u64,
}

impl SubscriptionCoordinator {
    pub fn active(&self) -> Option<&Subscription> {
        self.active.as_ref()
    }

    /// Brings the subscription in line with `target` and `link`. The returned
    /// operations must be executed in order: any `Unsubscribe` precedes the
    /// `Subscribe` that replaces it.
    pub fn reconcile(&mut self, target: Option<ConversationId>, link: Link) -> Vec<SubscriptionOp> {
        let live = link.live_session();
        let mut ops = Vec::with_capacity(2);

        if let Some(active) = self.active.take() {
            if live == Some(active.handle.session) && target == Some(active.conversation) {
                self.active = Some(active);
                return ops;
            }
            info!(
                conversation_id = active.conversation.0,
                subscription = %active.handle.id,
                "unsubscribing from conversation topic"
            );
            ops.push(SubscriptionOp::Unsubscribe(active.handle));
        }

        if let (Some(conversation), Some(session)) = (target, live) {
            self.next_id += 1;
            let handle = SubscriptionHandle {
                session,
                id: format!("sub-{}", self.next_id),
            };
            info!(
                conversation_id = conversation.0,
                subscription = %handle.id,
                session = session.0,
                "subscribing to conversation topic"
            );
            ops.push(SubscriptionOp::Subscribe {
                handle: handle.clone(),
                destination: conversation_topic(conversation),
            });
            self.active = Some(Subscription {
                conversation,
                handle,
            });
        }

        ops
    }

    pub fn teardown(&mut self) -> Vec<SubscriptionOp> {
        self.reconcile(None, Link::default())
    }

    /// The conversation a delivery belongs to, if it arrived on the active subscription.
    pub fn route(&self, delivery: &Delivery) -> Option<ConversationId> {
        let active = self.active.as_ref()?;
        (active.handle.session == delivery.session && active.handle.id == delivery.subscription)
            .then_some(active.conversation)
    }
}

#[cfg(test)]
#[path = "tests/subscription_tests.rs"]
mod tests;
