use client_core::{ChatSnapshot, ClientEvent};
use shared::{domain::ParticipantId, protocol::Message};

/// Renders client events as transcript lines, marking the signed-in user's messages.
#[derive(Debug, Default)]
pub struct Transcript {
    me: Option<ParticipantId>,
}

impl Transcript {
    pub fn render(&mut self, event: &ClientEvent) -> Vec<String> {
        match event {
            ClientEvent::SignedIn(identity) => {
                self.me = Some(identity.participant_id);
                vec![format!(
                    "signed in as {} (id {})",
                    identity.display_name, identity.participant_id
                )]
            }
            ClientEvent::SignedOut => {
                self.me = None;
                vec!["signed out".to_string()]
            }
            ClientEvent::ConnectionChanged(state) => vec![format!("status: {state}")],
            ClientEvent::BrokerError(reason) => vec![format!("broker error: {reason}")],
            ClientEvent::ConversationChanged(Some(conversation)) => {
                vec![format!("conversation #{conversation}")]
            }
            ClientEvent::ConversationChanged(None) => vec!["no conversation selected".to_string()],
            ClientEvent::MessagesReplaced { messages, .. } => messages
                .iter()
                .map(|message| self.message_line(message))
                .collect(),
            ClientEvent::MessageAppended(message) => vec![self.message_line(message)],
            ClientEvent::HistoryFailed { reason, .. } => {
                vec![format!("could not load history: {reason}")]
            }
        }
    }

    fn message_line(&self, message: &Message) -> String {
        let own = self.me == Some(message.sender_id);
        format!(
            "[{}] {}{}: {}",
            message.local_time(),
            message.sender_name,
            if own { " (you)" } else { "" },
            message.content
        )
    }
}

pub fn status_line(snapshot: &ChatSnapshot) -> String {
    let who = match &snapshot.identity {
        Some(identity) => format!("{} (id {})", identity.display_name, identity.participant_id),
        None => "not signed in".to_string(),
    };
    let peer = snapshot
        .peer
        .map(|peer| peer.to_string())
        .unwrap_or_else(|| "none".to_string());
    let conversation = snapshot
        .conversation
        .map(|conversation| format!("#{conversation}"))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{who} | peer {peer} | conversation {conversation} | status: {} | {:?} | {} messages",
        snapshot.connection,
        snapshot.phase,
        snapshot.messages.len()
    );
    if let Some(error) = &snapshot.history_error {
        line.push_str(&format!(" | history: {error}"));
    }
    line
}
