use async_trait::async_trait;
use chrono::Utc;
use log::error;
use redis::{ AsyncCommands, Client };
use std::error::Error;
use uuid::Uuid;

use super::{ derive_preview, derive_title, ChatStore, DEFAULT_CHAT_TITLE };
use crate::config::prompt::GREETING;
use crate::models::chat::{ clock_now, ChatSummary, StoredMessage };

/// Redis-backed store for deployments that need chats to survive
/// restarts. Layout per chat:
///   {prefix}chat:{id}            chat summary JSON
///   {prefix}chat:{id}:messages   list of message JSON, append order
///   {prefix}message:{id}         "{chat_id}|{list_index}" locator
///   {prefix}user:{user}:chats    zset of chat ids scored by updated_at
pub struct RedisChatStore {
    client: Client,
    key_prefix: String,
}

impl RedisChatStore {
    pub fn new(url: &str, key_prefix: String) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(Self {
            client: Client::open(url)?,
            key_prefix,
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn chat_key(&self, chat_id: &str) -> String {
        format!("{}chat:{}", self.key_prefix, chat_id)
    }

    fn messages_key(&self, chat_id: &str) -> String {
        format!("{}chat:{}:messages", self.key_prefix, chat_id)
    }

    fn message_key(&self, message_id: &str) -> String {
        format!("{}message:{}", self.key_prefix, message_id)
    }

    fn user_chats_key(&self, user_id: &str) -> String {
        format!("{}user:{}:chats", self.key_prefix, user_id)
    }

    async fn load_chat(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        chat_id: &str
    ) -> Result<Option<ChatSummary>, Box<dyn Error + Send + Sync>> {
        let json: Option<String> = conn.get(self.chat_key(chat_id)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_chat(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        chat: &ChatSummary
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let json = serde_json::to_string(chat)?;
        let _: () = conn.set(self.chat_key(&chat.id), json).await?;
        let _: () = conn.zadd(
            self.user_chats_key(&chat.user_id),
            &chat.id,
            chat.updated_at
        ).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for RedisChatStore {
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

        let mut conn = self.get_connection().await?;
        self.save_chat(&mut conn, &chat).await?;
        drop(conn);

        self.append_message(&chat.id, GREETING, false).await?;
        Ok(chat)
    }

    async fn list_chats(
        &self,
        user_id: &str
    ) -> Result<Vec<ChatSummary>, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let chat_ids: Vec<String> = conn.zrevrange(self.user_chats_key(user_id), 0, -1).await?;

        let mut chats = Vec::with_capacity(chat_ids.len());
        for chat_id in &chat_ids {
            match self.load_chat(&mut conn, chat_id).await {
                Ok(Some(chat)) => chats.push(chat),
                Ok(None) => {}
                Err(e) => {
                    error!("Error loading chat {}: {}", chat_id, e);
                }
            }
        }
        Ok(chats)
    }

    async fn get_chat(
        &self,
        chat_id: &str
    ) -> Result<Option<ChatSummary>, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        self.load_chat(&mut conn, chat_id).await
    }

    async fn append_message(
        &self,
        chat_id: &str,
        content: &str,
        is_user: bool
    ) -> Result<StoredMessage, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let mut chat = self
            .load_chat(&mut conn, chat_id).await?
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

        let json = serde_json::to_string(&message)?;
        let length: i64 = conn.rpush(self.messages_key(chat_id), json).await?;
        let locator = format!("{}|{}", chat_id, length - 1);
        let _: () = conn.set(self.message_key(&message.id), locator).await?;

        self.save_chat(&mut conn, &chat).await?;
        Ok(message)
    }

    async fn update_message(
        &self,
        message_id: &str,
        content: &str
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let locator: Option<String> = conn.get(self.message_key(message_id)).await?;
        let locator = locator.ok_or_else(|| format!("message not found: {}", message_id))?;
        let (chat_id, index) = locator
            .split_once('|')
            .ok_or_else(|| format!("corrupt message locator: {}", locator))?;
        let index: isize = index.parse()?;

        let json: Option<String> = conn.lindex(self.messages_key(chat_id), index).await?;
        let json = json.ok_or_else(|| format!("message not found: {}", message_id))?;
        let mut message: StoredMessage = serde_json::from_str(&json)?;
        message.content = content.to_string();
        let _: () = conn.lset(
            self.messages_key(chat_id),
            index,
            serde_json::to_string(&message)?
        ).await?;

        if let Some(mut chat) = self.load_chat(&mut conn, chat_id).await? {
            chat.preview = derive_preview(content);
            self.save_chat(&mut conn, &chat).await?;
        }
        Ok(())
    }

    async fn get_messages(
        &self,
        chat_id: &str
    ) -> Result<Vec<StoredMessage>, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let entries: Vec<String> = conn.lrange(self.messages_key(chat_id), 0, -1).await?;

        let mut messages = Vec::with_capacity(entries.len());
        for entry in &entries {
            match serde_json::from_str::<StoredMessage>(entry) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    error!("Error parsing stored message: {}", e);
                }
            }
        }
        Ok(messages)
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let Some(chat) = self.load_chat(&mut conn, chat_id).await? else {
            return Ok(());
        };

        let entries: Vec<String> = conn.lrange(self.messages_key(chat_id), 0, -1).await?;
        for entry in &entries {
            if let Ok(message) = serde_json::from_str::<StoredMessage>(entry) {
                let _: () = conn.del(self.message_key(&message.id)).await?;
            }
        }

        let _: () = conn.del(self.messages_key(chat_id)).await?;
        let _: () = conn.del(self.chat_key(chat_id)).await?;
        let _: () = conn.zrem(self.user_chats_key(&chat.user_id), chat_id).await?;
        Ok(())
    }
}
