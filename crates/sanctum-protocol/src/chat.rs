//! Chat socket envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConversationId, ProtocolError, UserId};

crate::wire_kind! {
    /// Discriminator of a [`ChatMessage`].
    pub enum ChatKind {
        Message => "message",
        ChatMention => "chat_mention",
        Typing => "typing",
        Join => "join",
        Leave => "leave",
        Error => "error",
        ServerShutdown => "server_shutdown",
    }
}

/// A message delivered to conversation members or sent by a chat socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub payload: Value,
}

impl ChatMessage {
    pub fn new(kind: ChatKind, conversation_id: ConversationId, payload: Value) -> Self {
        Self {
            kind,
            conversation_id: Some(conversation_id),
            user_id: None,
            payload,
        }
    }

    pub fn sent_by(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// The `chat_mention` event pushed to a conversation when a participant is mentioned.
    pub fn mention(
        conversation_id: ConversationId,
        sender_id: UserId,
        mentioned_user_id: UserId,
        message_id: u64,
    ) -> Self {
        Self::new(
            ChatKind::ChatMention,
            conversation_id,
            serde_json::json!({
                "conversation_id": conversation_id,
                "message_id": message_id,
                "mentioned_user_id": mentioned_user_id,
                "from_user_id": sender_id,
            }),
        )
        .sent_by(sender_id)
    }

    pub fn error(conversation_id: Option<ConversationId>, message: impl Into<String>) -> Self {
        Self {
            kind: ChatKind::Error,
            conversation_id,
            user_id: None,
            payload: serde_json::json!({ "message": message.into() }),
        }
    }

    pub fn shutdown() -> Self {
        Self {
            kind: ChatKind::ServerShutdown,
            conversation_id: None,
            user_id: None,
            payload: serde_json::json!({ "message": "Server is shutting down" }),
        }
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Inbound actions on a chat socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Join(ConversationId),
    Leave(ConversationId),
    Typing(ConversationId),
    Unknown(String),
}

impl ChatCommand {
    pub fn decode(message: &ChatMessage) -> Result<Self, ProtocolError> {
        let conversation = || {
            message
                .conversation_id
                .ok_or(ProtocolError::MissingField("conversation_id"))
        };
        let command = match &message.kind {
            ChatKind::Join => Self::Join(conversation()?),
            ChatKind::Leave => Self::Leave(conversation()?),
            ChatKind::Typing => Self::Typing(conversation()?),
            other => Self::Unknown(other.to_string()),
        };
        Ok(command)
    }
}
