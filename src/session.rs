//! Conversation data model
//!
//! A [`Session`] owns an ordered list of [`Message`]s. Message order is
//! conversation order: append-only, except for the truncation performed
//! by edit and delete. During generation exactly one message — the
//! pending placeholder — has no role and no content; the in-flight
//! reply is accumulated into it one [`Update`] at a time.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Speaker of a conversation turn.
///
/// A message with no role at all (`Message::role == None`) is the
/// pending placeholder reserved for an in-flight reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    /// Backend failure surfaced as a normal conversation turn.
    Error,
}

impl Role {
    /// Whether a message with this role can be edited or deleted
    /// directly. Assistant and error turns are only ever mutated as a
    /// side effect of editing or deleting their preceding turn.
    pub fn is_editable(self) -> bool {
        matches!(self, Role::User | Role::System)
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Option<Role>,
    pub content: String,
    /// Token count of `content`, filled in once generation completes.
    pub tokens: Option<usize>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            content: content.into(),
            tokens: None,
        }
    }

    pub fn with_tokens(role: Role, content: impl Into<String>, tokens: usize) -> Self {
        Self {
            role: Some(role),
            content: content.into(),
            tokens: Some(tokens),
        }
    }

    /// Placeholder for an in-flight reply: no role, no content.
    pub fn pending() -> Self {
        Self {
            role: None,
            content: String::new(),
            tokens: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.role.is_none() && self.content.is_empty()
    }
}

/// A persisted conversation: ordered messages plus the name of the
/// model configuration it runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub name: Option<String>,
    /// Key into the configuration collaborator's model table.
    pub model: String,
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            model: model.into(),
            messages: Vec::new(),
        }
    }

    /// Display label: the session name if set, else the first message's
    /// content, else a placeholder.
    pub fn label(&self) -> &str {
        if let Some(name) = &self.name {
            return name;
        }
        self.messages
            .first()
            .map(|m| m.content.as_str())
            .filter(|c| !c.is_empty())
            .unwrap_or("New session")
    }
}

/// One event in a generation's output stream.
///
/// Immutable value; the growing reply lives in the pending [`Message`],
/// never here. Role is conventionally set on the first update of a
/// generation, content deltas are appended in delivery order, and a
/// finish reason marks the terminal update when the backend reports one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub finish_reason: Option<String>,
}

impl Update {
    pub fn role(role: Role) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    pub fn content(delta: impl Into<String>) -> Self {
        Self {
            content: Some(delta.into()),
            ..Self::default()
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Terminal error update: role `error`, failure description as
    /// content. How every backend reports rejection.
    pub fn error(description: impl Into<String>) -> Self {
        Self {
            role: Some(Role::Error),
            content: Some(description.into()),
            finish_reason: Some("error".to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}
