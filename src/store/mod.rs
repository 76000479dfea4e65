mod memory;
mod redis;
use async_trait::async_trait;
use log::info;
use std::error::Error;
use crate::cli::Args;
use std::sync::Arc;
use crate::models::chat::{ ChatSummary, StoredMessage };

pub const DEFAULT_CHAT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 50;
const PREVIEW_MAX_CHARS: usize = 60;

/// Persistence seam for chats and their transcripts. Structured timeline
/// documents are never stored; only the rendered text goes through here.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(
        &self,
        user_id: &str
    ) -> Result<ChatSummary, Box<dyn Error + Send + Sync>>;

    /// Chats for one user, most recently updated first.
    async fn list_chats(
        &self,
        user_id: &str
    ) -> Result<Vec<ChatSummary>, Box<dyn Error + Send + Sync>>;

    async fn get_chat(
        &self,
        chat_id: &str
    ) -> Result<Option<ChatSummary>, Box<dyn Error + Send + Sync>>;

    /// Append one message. The first user message also becomes the chat
    /// title, and every append refreshes the preview and recency.
    async fn append_message(
        &self,
        chat_id: &str,
        content: &str,
        is_user: bool
    ) -> Result<StoredMessage, Box<dyn Error + Send + Sync>>;

    /// Rewrite the content of an already-appended message in place.
    async fn update_message(
        &self,
        message_id: &str,
        content: &str
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn get_messages(
        &self,
        chat_id: &str
    ) -> Result<Vec<StoredMessage>, Box<dyn Error + Send + Sync>>;

    async fn delete_chat(&self, chat_id: &str) -> Result<(), Box<dyn Error + Send + Sync>>;
}

pub fn create_chat_store(args: &Args) -> Result<Arc<dyn ChatStore>, Box<dyn Error + Send + Sync>> {
    match args.store_type.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(memory::MemoryChatStore::new())),
        "redis" => {
            let store = redis::RedisChatStore::new(
                &args.store_redis_url,
                args.store_redis_prefix.clone()
            )?;
            Ok(Arc::new(store))
        }
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported chat store type: {}", args.store_type)
                    )
                )
            ),
    }
}

pub fn initialize_chat_store(
    args: &Args
) -> Result<Arc<dyn ChatStore>, Box<dyn Error + Send + Sync>> {
    info!("Chats will be stored in: {}", args.store_type);
    create_chat_store(args)
}

/// Chat title derived from the first user message.
pub(crate) fn derive_title(content: &str) -> String {
    truncate_chars(content.trim(), TITLE_MAX_CHARS)
}

pub(crate) fn derive_preview(content: &str) -> String {
    truncate_chars(content.trim(), PREVIEW_MAX_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}...", cut.trim_end())
}
