use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Mutex;
use uuid::Uuid;

use super::{ derive_preview, derive_title, ChatStore, DEFAULT_CHAT_TITLE };
use crate::config::prompt::GREETING;
use crate::models::chat::{ clock_now, ChatSummary, StoredMessage };

#[derive(Default)]
struct Inner {
    chats: HashMap<String, ChatSummary>,
    messages: HashMap<String, Vec<StoredMessage>>,
    // message id -> owning chat id, for in-place updates
    message_index: HashMap<String, String>,
}

/// Process-local store, the default when no Redis is configured. All
/// chats vanish on restart.
pub struct MemoryChatStore {
    inner: Mutex<Inner>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, Box<dyn Error + Send + Sync>> {
        self.inner.lock().map_err(|_| "chat store lock poisoned".into())
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_chat(
        &self,
        user_id: &str
    ) -> Result<ChatSummary, Box<dyn Error + Send + Sync>> {
        let now = Utc::now().timestamp();
        let chat = ChatSummary {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: DEFAULT_CHAT_TITLE.to_string(),
            preview: String::new(),
            created_at: now,
            updated_at: now,
        };

        {
            let mut inner = self.lock()?;
            inner.chats.insert(chat.id.clone(), chat.clone());
            inner.messages.insert(chat.id.clone(), Vec::new());
        }

        // Every chat opens with the assistant greeting.
        self.append_message(&chat.id, GREETING, false).await?;
        Ok(chat)
    }

    async fn list_chats(
        &self,
        user_id: &str
    ) -> Result<Vec<ChatSummary>, Box<dyn Error + Send + Sync>> {
        let inner = self.lock()?;
        let mut chats: Vec<ChatSummary> = inner.chats
            .values()
            .filter(|chat| chat.user_id == user_id)
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn get_chat(
        &self,
        chat_id: &str
    ) -> Result<Option<ChatSummary>, Box<dyn Error + Send + Sync>> {
        Ok(self.lock()?.chats.get(chat_id).cloned())
    }

    async fn append_message(
        &self,
        chat_id: &str,
        content: &str,
        is_user: bool
    ) -> Result<StoredMessage, Box<dyn Error + Send + Sync>> {
        let mut inner = self.lock()?;

        let chat = inner.chats
            .get_mut(chat_id)
            .ok_or_else(|| format!("chat not found: {}", chat_id))?;

        if is_user && chat.title == DEFAULT_CHAT_TITLE {
            chat.title = derive_title(content);
        }
        chat.preview = derive_preview(content);
        chat.updated_at = Utc::now().timestamp();

        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            is_user,
            timestamp: clock_now(),
            created_at: Utc::now().timestamp(),
        };

        inner.message_index.insert(message.id.clone(), chat_id.to_string());
        inner.messages.entry(chat_id.to_string()).or_default().push(message.clone());
        Ok(message)
    }

    async fn update_message(
        &self,
        message_id: &str,
        content: &str
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut inner = self.lock()?;
        let chat_id = inner.message_index
            .get(message_id)
            .cloned()
            .ok_or_else(|| format!("message not found: {}", message_id))?;

        let messages = inner.messages
            .get_mut(&chat_id)
            .ok_or_else(|| format!("chat not found: {}", chat_id))?;
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| format!("message not found: {}", message_id))?;
        message.content = content.to_string();

        if let Some(chat) = inner.chats.get_mut(&chat_id) {
            chat.preview = derive_preview(content);
        }
        Ok(())
    }

    async fn get_messages(
        &self,
        chat_id: &str
    ) -> Result<Vec<StoredMessage>, Box<dyn Error + Send + Sync>> {
        Ok(self.lock()?.messages.get(chat_id).cloned().unwrap_or_default())
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut inner = self.lock()?;
        inner.chats.remove(chat_id);
        if let Some(messages) = inner.messages.remove(chat_id) {
            for message in messages {
                inner.message_index.remove(&message.id);
            }
        }
        Ok(())
    }
}
