//! Client core for two-party direct messaging: conversation addressing, a
//! reconnecting STOMP session, one live subscription per selected
//! conversation, and history/live stream reconciliation.

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod history;
pub mod machine;
pub mod stomp;
pub mod stream;
pub mod subscription;

pub use api::HttpChatApi;
pub use auth::{AuthApi, Credentials, Registration};
pub use client::{ChatClient, ChatSnapshot};
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionOptions};
pub use conversation::{conversation_id, parse_participant_id, MAX_PARTICIPANT_ID};
pub use error::{ClientError, ClientResult, ValidationError};
pub use history::HistoryApi;
pub use machine::{ChatMachine, ClientEvent, Phase};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
