/// Shared types for the messaging layer
use crate::error::{ClientError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user or company as the backend reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "fullname", alias = "name", default)]
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// The logged-in principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User(Identity),
    Company(Identity),
}

impl Principal {
    pub fn identity(&self) -> &Identity {
        match self {
            Principal::User(identity) | Principal::Company(identity) => identity,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Principal::User(_))
    }
}

/// One message of a conversation; never updated in place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: String,
    pub sender: Identity,
    pub content: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Message thread between exactly two participants, oldest message first
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub participants: Vec<Identity>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Check the participant invariant. An empty participant list means the
    /// pair has never exchanged a message.
    pub fn validate(&self) -> Result<()> {
        match self.participants.len() {
            0 if self.messages.is_empty() => Ok(()),
            2 => Ok(()),
            n => Err(ClientError::Protocol(format!(
                "conversation must have exactly two participants, got {}",
                n
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The participant whose id is not `self_id`.
    ///
    /// Position in the participant list carries no meaning.
    pub fn peer_of(&self, self_id: &str) -> Option<&Identity> {
        self.participants.iter().find(|p| p.id != self_id)
    }

    /// The participant whose id equals `self_id`
    pub fn me(&self, self_id: &str) -> Option<&Identity> {
        self.participants.iter().find(|p| p.id == self_id)
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }
}

/// Event delivered by the push channel when a message was sent to us.
///
/// Only used to decide which conversation to refetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub content: String,
}

impl PushEvent {
    /// The id of the other side of the conversation, seen from `self_id`
    pub fn counterpart(&self, self_id: &str) -> &str {
        if self.sender_id == self_id {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

/// Accepted connection shown on the messaging screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub connection_id: String,
    /// Id of the connected user, used to open the conversation
    pub next_user_id: String,
    pub fullname: String,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Response envelope used by every backend route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}
