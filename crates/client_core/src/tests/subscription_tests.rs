use super::*;

fn subscribed_to(ops: &[SubscriptionOp]) -> Vec<&str> {
    ops.iter()
        .filter_map(|op| match op {
            SubscriptionOp::Subscribe { destination, .. } => Some(destination.as_str()),
            SubscriptionOp::Unsubscribe(_) => None,
        })
        .collect()
}

#[test]
fn does_not_subscribe_until_connected() {
    let mut coordinator = SubscriptionCoordinator::default();
    let ops = coordinator.reconcile(
        Some(ConversationId(41)),
        Link::down(ConnectionState::Connecting),
    );
    assert!(ops.is_empty());
    assert!(coordinator.active().is_none());

    let ops = coordinator.reconcile(Some(ConversationId(41)), Link::connected(SessionEpoch(1)));
    assert_eq!(subscribed_to(&ops), vec!["/topic/conversations/41"]);
    assert_eq!(
        coordinator.active().map(|sub| sub.conversation),
        Some(ConversationId(41))
    );
}

#[test]
fn reconcile_is_idempotent_for_unchanged_inputs() {
    let mut coordinator = SubscriptionCoordinator::default();
    let link = Link::connected(SessionEpoch(1));
    coordinator.reconcile(Some(ConversationId(41)), link);
    assert!(coordinator
        .reconcile(Some(ConversationId(41)), link)
        .is_empty());
}

#[test]
fn switching_conversation_unsubscribes_before_subscribing() {
    let mut coordinator = SubscriptionCoordinator::default();
    let link = Link::connected(SessionEpoch(1));
    coordinator.reconcile(Some(ConversationId(41)), link);
    let old = coordinator.active().cloned().expect("active");

    let ops = coordinator.reconcile(Some(ConversationId(12)), link);
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0], SubscriptionOp::Unsubscribe(old.handle));
    match &ops[1] {
        SubscriptionOp::Subscribe {
            handle,
            destination,
        } => {
            assert_eq!(destination, "/topic/conversations/12");
            assert_ne!(handle.id, "sub-1");
        }
        other => panic!("expected subscribe, got {other:?}"),
    }
}

#[test]
fn losing_the_connection_tears_down_and_reconnect_resubscribes_once() {
    let mut coordinator = SubscriptionCoordinator::default();
    coordinator.reconcile(Some(ConversationId(41)), Link::connected(SessionEpoch(1)));

    let ops = coordinator.reconcile(Some(ConversationId(41)), Link::down(ConnectionState::Error));
    assert!(matches!(ops.as_slice(), [SubscriptionOp::Unsubscribe(_)]));
    assert!(coordinator.active().is_none());

    let ops = coordinator.reconcile(
        Some(ConversationId(41)),
        Link::down(ConnectionState::Disconnected),
    );
    assert!(ops.is_empty(), "teardown must be safe without a subscription");

    let ops = coordinator.reconcile(Some(ConversationId(41)), Link::connected(SessionEpoch(2)));
    assert_eq!(subscribed_to(&ops), vec!["/topic/conversations/41"]);
    assert_eq!(
        coordinator.active().map(|sub| sub.handle.session),
        Some(SessionEpoch(2))
    );
}

#[test]
fn new_session_replaces_subscription_bound_to_old_one() {
    let mut coordinator = SubscriptionCoordinator::default();
    coordinator.reconcile(Some(ConversationId(41)), Link::connected(SessionEpoch(1)));
    let ops = coordinator.reconcile(Some(ConversationId(41)), Link::connected(SessionEpoch(2)));
    assert_eq!(ops.len(), 2);
    assert!(matches!(&ops[0], SubscriptionOp::Unsubscribe(handle) if handle.session == SessionEpoch(1)));
}

#[test]
fn routes_only_deliveries_for_the_active_subscription() {
    let mut coordinator = SubscriptionCoordinator::default();
    coordinator.reconcile(Some(ConversationId(41)), Link::connected(SessionEpoch(3)));
    let handle = coordinator.active().expect("active").handle.clone();

    let delivery = Delivery {
        session: SessionEpoch(3),
        subscription: handle.id.clone(),
        destination: "/topic/conversations/41".into(),
        body: String::new(),
    };
    assert_eq!(coordinator.route(&delivery), Some(ConversationId(41)));

    let stale = Delivery {
        subscription: "sub-999".into(),
        ..delivery.clone()
    };
    assert_eq!(coordinator.route(&stale), None);

    coordinator.teardown();
    assert_eq!(coordinator.route(&delivery), None);
}
