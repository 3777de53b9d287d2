use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Serialize;
use shared::{
    domain::{ConversationId, Identity},
    protocol::{
        conversation_messages_path, LoginRequest, Message, RegisterRequest, LOGIN_PATH,
        REGISTER_PATH,
    },
};
use tracing::debug;

use crate::{
    auth::{AuthApi, Credentials, Registration},
    error::{ClientError, ClientResult},
    history::HistoryApi,
};

const FALLBACK_AUTH_ERROR: &str = "Unable to authenticate.";

/// The chat server's request/response endpoints.
pub struct HttpChatApi {
    http: Client,
    server_url: String,
}

impl HttpChatApi {
    pub fn new(server_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    async fn authenticate<B: Serialize + Sync>(&self, path: &str, body: &B) -> ClientResult<Identity> {
        let response = self
            .http
            .post(format!("{}{path}", self.server_url))
            .json(body)
            .send()
            .await
            .map_err(|err| ClientError::Auth(format!("{FALLBACK_AUTH_ERROR} {err}")))?;

        if !response.status().is_success() {
            return Err(ClientError::Auth(rejection_text(response).await));
        }

        response
            .json::<Identity>()
            .await
            .map_err(|err| ClientError::Auth(format!("malformed auth response: {err}")))
    }
}

async fn rejection_text(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let text = text.trim();
    debug!(%status, body = text, "auth request rejected");
    if text.is_empty() {
        FALLBACK_AUTH_ERROR.to_string()
    } else {
        text.to_string()
    }
}

#[async_trait]
impl AuthApi for HttpChatApi {
    async fn login(&self, credentials: &Credentials) -> ClientResult<Identity> {
        self.authenticate(
            LOGIN_PATH,
            &LoginRequest {
                participant_id: credentials.participant_id(),
                password: credentials.password().to_string(),
            },
        )
        .await
    }

    async fn register(&self, registration: &Registration) -> ClientResult<Identity> {
        self.authenticate(
            REGISTER_PATH,
            &RegisterRequest {
                participant_id: registration.credentials.participant_id(),
                password: registration.credentials.password().to_string(),
                display_name: registration.display_name.clone(),
            },
        )
        .await
    }
}

#[async_trait]
impl HistoryApi for HttpChatApi {
    async fn fetch_messages(&self, conversation: ConversationId) -> ClientResult<Vec<Message>> {
        let url = format!(
            "{}{}",
            self.server_url,
            conversation_messages_path(conversation)
        );
        self.http
            .get(url)
            .send()
            .await
            .and_then(Response::error_for_status)
            .map_err(|err| ClientError::HistoryFetch(err.to_string()))?
            .json()
            .await
            .map_err(|err| ClientError::HistoryFetch(format!("malformed history body: {err}")))
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
