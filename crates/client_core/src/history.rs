use async_trait::async_trait;
use shared::{domain::ConversationId, protocol::Message};
use tracing::{debug, warn};

use crate::error::ClientResult;

#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Ordered snapshot of every stored message in `conversation`.
    async fn fetch_messages(&self, conversation: ConversationId) -> ClientResult<Vec<Message>>;
}

/// One activation of a conversation. Two loads of the same conversation get
/// different generations, so only the latest can be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRequest {
    pub conversation: ConversationId,
    pub generation: u64,
}

#[derive(Debug)]
pub struct HistoryResult {
    pub request: HistoryRequest,
    pub outcome: ClientResult<Vec<Message>>,
}

#[derive(Debug, Default)]
pub struct HistoryLoader {
    generation: u64,
    pending: Option<HistoryRequest>,
}

impl HistoryLoader {
    pub fn begin(&mut self, conversation: ConversationId) -> HistoryRequest {
        self.generation += 1;
        let request = HistoryRequest {
            conversation,
            generation: self.generation,
        };
        self.pending = Some(request);
        request
    }

    pub fn cancel(&mut self) -> Option<HistoryRequest> {
        self.pending.take()
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether `request` is the outstanding load; if so it stops being pending.
    pub fn complete(&mut self, request: HistoryRequest) -> bool {
        if self.pending == Some(request) {
            self.pending = None;
            return true;
        }
        debug!(
            conversation_id = request.conversation.0,
            generation = request.generation,
            "discarding stale history response"
        );
        false
    }
}

pub async fn load(api: &dyn HistoryApi, request: HistoryRequest) -> HistoryResult {
    let outcome = api.fetch_messages(request.conversation).await;
    match &outcome {
        Ok(messages) => debug!(
            conversation_id = request.conversation.0,
            count = messages.len(),
            "history snapshot fetched"
        ),
        Err(err) => warn!(
            conversation_id = request.conversation.0,
            %err,
            "history snapshot fetch failed"
        ),
    }
    HistoryResult { request, outcome }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
