use async_trait::async_trait;
use shared::domain::{Identity, ParticipantId};
use tracing::info;
use zeroize::Zeroize;

use crate::{
    conversation::parse_participant_id,
    error::{ClientResult, ValidationError},
};

/// Sign-in form input that passed local validation.
pub struct Credentials {
    participant_id: ParticipantId,
    password: String,
}

impl Credentials {
    pub fn parse(participant_id: &str, password: &str) -> Result<Self, ValidationError> {
        if participant_id.trim().is_empty() || password.is_empty() {
            return Err(ValidationError::MissingCredentials);
        }
        Ok(Self {
            participant_id: parse_participant_id(participant_id)?,
            password: password.to_string(),
        })
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("participant_id", &self.participant_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
pub struct Registration {
    pub credentials: Credentials,
    pub display_name: Option<String>,
}

impl Registration {
    /// A blank display name is left for the server to choose.
    pub fn parse(
        participant_id: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            credentials: Credentials::parse(participant_id, password)?,
            display_name: display_name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        })
    }
}

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> ClientResult<Identity>;
    async fn register(&self, registration: &Registration) -> ClientResult<Identity>;
}

/// Who is signed in, if anyone.
#[derive(Debug, Default)]
pub struct AuthSession {
    identity: Option<Identity>,
}

impl AuthSession {
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.identity.as_ref().map(|identity| identity.participant_id)
    }

    pub fn establish(&mut self, identity: Identity) -> Option<Identity> {
        info!(
            participant_id = identity.participant_id.0,
            display_name = %identity.display_name,
            "signed in"
        );
        self.identity.replace(identity)
    }

    pub fn clear(&mut self) -> Option<Identity> {
        let previous = self.identity.take();
        if let Some(identity) = &previous {
            info!(participant_id = identity.participant_id.0, "signed out");
        }
        previous
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
