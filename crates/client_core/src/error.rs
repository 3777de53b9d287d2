use thiserror::Error;

/// Malformed local input, rejected before anything reaches the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("User ID and password are required.")]
    MissingCredentials,
    #[error("User ID must be a non-negative integer.")]
    InvalidParticipantId,
    #[error("User ID must not exceed {max}.")]
    ParticipantIdOutOfRange { max: u64 },
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("not signed in")]
    NotSignedIn,
    #[error("no chat partner selected")]
    NoPeerSelected,
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Auth(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("history fetch failed: {0}")]
    HistoryFetch(String),
}

impl ClientError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
