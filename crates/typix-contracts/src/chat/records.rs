use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentType {
    #[default]
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub provider: String,
    pub model: String,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(user_id: &str, title: Option<String>, provider: &str, model: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            user_id: user_id.to_string(),
            title,
            provider: provider.to_string(),
            model: model.to_string(),
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_visible_to(&self, user_id: &str) -> bool {
        self.user_id == user_id && !self.deleted
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub role: Role,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    pub generation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(chat_id: &str, user_id: &str, content: &str, kind: MessageType) -> Self {
        Self {
            id: new_id(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            role: Role::User,
            kind,
            content: content.to_string(),
            generation_id: None,
            created_at: Utc::now(),
        }
    }

    /// The assistant turn that owns `generation_id`; content stays empty while it is pending.
    pub fn assistant_image(chat_id: &str, user_id: &str, generation_id: &str) -> Self {
        Self {
            role: Role::Assistant,
            kind: MessageType::Image,
            content: String::new(),
            generation_id: Some(generation_id.to_string()),
            ..Self::user(chat_id, user_id, "", MessageType::Image)
        }
    }

    pub fn is_assistant_image(&self) -> bool {
        self.role == Role::Assistant && self.kind == MessageType::Image
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub file_id: String,
    #[serde(rename = "type")]
    pub kind: AttachmentType,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn image(message_id: &str, file_id: &str) -> Self {
        Self {
            id: new_id(),
            message_id: message_id.to_string(),
            file_id: file_id.to_string(),
            kind: AttachmentType::Image,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Chat, Message, MessageType, Role};

    #[test]
    fn assistant_image_message_links_generation() {
        let message = Message::assistant_image("chat-1", "user-1", "gen-1");
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.kind, MessageType::Image);
        assert!(message.content.is_empty());
        assert_eq!(message.generation_id.as_deref(), Some("gen-1"));
        assert!(message.is_assistant_image());
        assert!(!Message::user("chat-1", "user-1", "hi", MessageType::Text).is_assistant_image());
    }

    #[test]
    fn deleted_or_foreign_chats_are_hidden() {
        let mut chat = Chat::new("user-1", None, "dryrun", "dryrun-t2i");
        assert!(chat.is_visible_to("user-1"));
        assert!(!chat.is_visible_to("user-2"));
        chat.deleted = true;
        assert!(!chat.is_visible_to("user-1"));
    }

    #[test]
    fn message_type_serializes_under_type_key() -> anyhow::Result<()> {
        let value = serde_json::to_value(Message::user("c", "u", "draw", MessageType::Text))?;
        assert_eq!(value["type"], "text");
        assert_eq!(value["role"], "user");
        Ok(())
    }
}
