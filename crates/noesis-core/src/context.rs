//! Request-scoped types shared across the engine
//!
//! Every pipeline call receives an explicit [`RequestContext`] — there is no
//! ambient "current user". Messages are immutable once written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies whose turn this is and where it belongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Owner of all data touched during the turn
    pub user_id: String,
    /// Conversation the turn belongs to
    pub conversation_id: String,
    /// Unique id for this turn (also used as the message id prefix)
    pub turn_id: String,
}

impl RequestContext {
    /// Create a context with a fresh turn id.
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            turn_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user turn
    User,
    /// Model turn
    Assistant,
    /// Injected instruction
    System,
}

impl Role {
    /// String form used in storage and provider payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Parse from the stored string form
    pub fn parse_name(s: &str) -> Self {
        match s {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Conversation this message belongs to
    pub conversation_id: String,
    /// Owner
    pub user_id: String,
    /// user / assistant / system
    pub role: Role,
    /// Message text
    pub content: String,
    /// Creation time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Text extracted from non-image attachments, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_file_text: Option<String>,
}

impl ChatMessage {
    /// Build a new message stamped now.
    pub fn new(ctx: &RequestContext, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: ctx.conversation_id.clone(),
            user_id: ctx.user_id.clone(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            extracted_file_text: None,
        }
    }
}

/// An image (or document) attachment on an incoming message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    /// Original file name
    pub filename: String,
    /// MIME type (image/png, application/pdf, ...)
    pub content_type: String,
    /// Base64-encoded payload
    pub data_base64: String,
}

impl ImageAttachment {
    /// True when the attachment is an image the model could look at.
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::parse_name(role.as_str()), role);
        }
        assert_eq!(Role::parse_name("garbage"), Role::User);
    }

    #[test]
    fn test_request_context_turn_ids_are_unique() {
        let a = RequestContext::new("u1", "c1");
        let b = RequestContext::new("u1", "c1");
        assert_ne!(a.turn_id, b.turn_id);
    }
}
