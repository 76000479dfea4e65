use async_trait::async_trait;
use log::info;
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;

use super::{ http_stream_generate, ChatClient, ChunkStream, CompletionResponse };
use crate::llm::LlmConfig;
use rllm::builder::{ LLMBackend, LLMBuilder };
use rllm::chat::{ ChatMessage, ChatRole, MessageType };
use rllm::LLMProvider;

const DEFAULT_API_ROOT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Serialize)]
struct GeminiStreamRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GoogleChunk {
    candidates: Vec<GoogleCandidate>,
}

#[derive(Deserialize)]
struct GoogleCandidate {
    content: GoogleContent,
}

#[derive(Deserialize)]
struct GoogleContent {
    parts: Vec<GooglePart>,
}

#[derive(Deserialize)]
struct GooglePart {
    text: String,
}

// The streaming endpoint emits a JSON array one element per line; each
// element carries one candidate text fragment.
fn parse_gemini_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line == "[" || line == "]" || line == "," {
        return None;
    }

    if line.starts_with('{') {
        let json_obj = if line.ends_with('}') {
            line.to_string()
        } else if line.ends_with("},") {
            line[..line.len() - 1].to_string()
        } else {
            return None;
        };

        return serde_json
            ::from_str::<GoogleChunk>(&json_obj)
            .ok()
            .and_then(|gc| {
                gc.candidates.first().and_then(|c| c.content.parts.first().map(|p| p.text.clone()))
            });
    }

    if line.contains("\"text\":") {
        if let Some(colon) = line.find(':') {
            let value_part = line[colon + 1..].trim();
            let first_quote = value_part.find('"')?;
            let last_quote = value_part.rfind('"')?;
            if last_quote > first_quote {
                return Some(value_part[first_quote + 1..last_quote].to_string());
            }
        }
    }

    None
}

pub struct GeminiChatClient {
    llm: Box<dyn LLMProvider + Send + Sync>,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>
    ) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let chat_model = model.unwrap_or_else(|| "gemini-2.5-flash".to_string());
        let model_base_url = base_url.unwrap_or_else(||
            format!("{}/{}", DEFAULT_API_ROOT, chat_model)
        );

        let llm_provider = LLMBuilder::new()
            .backend(LLMBackend::Google)
            .api_key(api_key.clone())
            .model(&chat_model)
            .stream(false)
            .build()?;

        Ok(Self {
            llm: llm_provider,
            api_key,
            model: chat_model,
            base_url: model_base_url,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let api_key = config.api_key
            .clone()
            .ok_or_else(|| "Google API key is required for GeminiChatClient".to_string())?;
        Self::new(api_key, config.completion_model.clone(), config.base_url.clone())
    }
}

#[async_trait]
impl ChatClient for GeminiChatClient {
    async fn complete(
        &self,
        prompt: &str
    ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>> {
        let messages = vec![ChatMessage {
            role: ChatRole::User,
            content: prompt.to_string(),
            message_type: MessageType::Text,
        }];
        info!("GeminiChatClient::complete() → model={}", self.model);
        let resp = self.llm.chat(&messages).await?;
        let text = resp
            .text()
            .map(|s| s.to_string())
            .unwrap_or_else(|| resp.to_string());
        Ok(CompletionResponse { response: text })
    }

    async fn complete_stream(
        &self,
        prompt: &str
    ) -> Result<ChunkStream, Box<dyn StdError + Send + Sync>> {
        info!("GeminiChatClient::complete_stream() → model={}", self.model);

        let payload = GeminiStreamRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt.to_string() }],
            }],
        };

        let route = format!(":streamGenerateContent?key={}", self.api_key);
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];

        http_stream_generate(
            self.base_url.clone(),
            &route,
            payload,
            parse_gemini_line,
            Some(headers)
        ).await
    }

    fn model(&self) -> String {
        self.model.clone()
    }
}
