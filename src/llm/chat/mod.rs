pub mod gemini;
pub mod ollama;

use async_trait::async_trait;
use futures::{ Future, Stream, StreamExt };
use serde::Deserialize;
use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use self::gemini::GeminiChatClient;
use self::ollama::OllamaClient;
use super::{ LlmConfig, LlmType };

/// Text fragments as they arrive from a completion backend.
pub type ChunkStream = Pin<
    Box<dyn Stream<Item = Result<String, Box<dyn StdError + Send + Sync>>> + Send>
>;

#[derive(Deserialize, Debug, Clone)]
pub struct CompletionResponse {
    pub response: String,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str
    ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>>;

    /// Open a streaming completion. The default turns a blocking completion
    /// into a one-chunk stream for backends without native streaming.
    async fn complete_stream(
        &self,
        prompt: &str
    ) -> Result<ChunkStream, Box<dyn StdError + Send + Sync>>;

    fn model(&self) -> String;
}

pub fn create_streaming_response<F, Fut>(
    response_fn: F
) -> Result<ChunkStream, Box<dyn StdError + Send + Sync>>
    where
        F: FnOnce(mpsc::Sender<Result<String, Box<dyn StdError + Send + Sync>>>) -> Fut +
            Send +
            'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}

/// Build one chat client for a specific completion model.
pub fn new_client(
    config: &LlmConfig
) -> Result<Arc<dyn ChatClient>, Box<dyn StdError + Send + Sync>> {
    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::Gemini => Arc::new(GeminiChatClient::from_config(config)?),
        LlmType::Ollama => Arc::new(OllamaClient::from_config(config)?),
    };
    Ok(client)
}

/// POST a JSON payload and forward parsed lines of the chunked response as
/// stream items. `line_parser` extracts the text fragment from one line of
/// the provider's wire format.
pub async fn http_stream_generate(
    base_url: String,
    route: &str,
    payload: impl serde::Serialize + Send + 'static,
    line_parser: fn(&str) -> Option<String>,
    headers: Option<Vec<(String, String)>>
) -> Result<ChunkStream, Box<dyn StdError + Send + Sync>> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), route);
    let (tx, rx) = mpsc::channel(32);
    let client = reqwest::Client::new();

    tokio::spawn(async move {
        let mut req = client.post(&url).json(&payload);

        if let Some(header_list) = headers {
            for (name, value) in header_list {
                req = req.header(name, value);
            }
        }

        match req.send().await {
            Ok(resp) => {
                if let Err(e) = resp.error_for_status_ref() {
                    let _ = tx.send(Err(Box::new(e) as _)).await;
                    return;
                }
                let mut bytes = resp.bytes_stream();
                while let Some(chunk) = bytes.next().await {
                    match chunk {
                        Ok(buf) => {
                            if let Ok(text) = String::from_utf8(buf.to_vec()) {
                                for line in text.lines() {
                                    if let Some(fragment) = line_parser(line) {
                                        if tx.send(Ok(fragment)).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(Box::new(e) as _)).await;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(Box::new(e) as _)).await;
            }
        }
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}
