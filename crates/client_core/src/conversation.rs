use shared::domain::{ConversationId, ParticipantId};

use crate::error::ValidationError;

/// Largest participant id the pairing accepts.
///
/// For `a, b <= MAX_PARTICIPANT_ID` the result is at most `2^63 - 2^32`, so it
/// also fits the signed 64-bit id column on the server. Peers computing the
/// identifier with IEEE doubles only agree for ids whose result stays below
/// `2^53`.
pub const MAX_PARTICIPANT_ID: u64 = i32::MAX as u64;

/// Symmetric pairing of two participants into the id of their conversation.
///
/// Callers must keep both inputs within [`MAX_PARTICIPANT_ID`]; use
/// [`parse_participant_id`] on untrusted input.
pub fn conversation_id(x: ParticipantId, y: ParticipantId) -> ConversationId {
    debug_assert!(x.0 <= MAX_PARTICIPANT_ID && y.0 <= MAX_PARTICIPANT_ID);
    let a = x.0.min(y.0);
    let b = x.0.max(y.0);
    let s = a + b;
    ConversationId(s * (s + 1) / 2 + b)
}

/// Parses a participant id typed by the user.
pub fn parse_participant_id(raw: &str) -> Result<ParticipantId, ValidationError> {
    let value: u64 = raw
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidParticipantId)?;
    if value > MAX_PARTICIPANT_ID {
        return Err(ValidationError::ParticipantIdOutOfRange {
            max: MAX_PARTICIPANT_ID,
        });
    }
    Ok(ParticipantId(value))
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
