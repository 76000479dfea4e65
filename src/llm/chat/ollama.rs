use async_trait::async_trait;
use futures::StreamExt;
use log::info;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;

use super::{ create_streaming_response, ChatClient, ChunkStream, CompletionResponse };
use crate::llm::LlmConfig;

/// Local-model backend for development without a hosted API key.
#[derive(Debug)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    completion_model: String,
}

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct StreamResponse {
    response: String,
    done: bool,
}

impl OllamaClient {
    pub fn new(base_url: Option<String>, completion_model: Option<String>) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.unwrap_or_else(|| "http://localhost:11434".into()),
            completion_model: completion_model.unwrap_or_else(|| "llama3".to_string()),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        Ok(Self::new(config.base_url.clone(), config.completion_model.clone()))
    }
}

#[async_trait]
impl ChatClient for OllamaClient {
    async fn complete(
        &self,
        prompt: &str
    ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>> {
        let url = format!("{}/api/generate", self.base_url);
        let req = GenerateRequest {
            model: self.completion_model.clone(),
            prompt: prompt.to_string(),
            stream: false,
        };
        let resp = self.http.post(&url).json(&req).send().await?.error_for_status()?;
        let data = resp.json::<GenerateResponse>().await?;
        Ok(CompletionResponse { response: data.response })
    }

    async fn complete_stream(
        &self,
        prompt: &str
    ) -> Result<ChunkStream, Box<dyn StdError + Send + Sync>> {
        let url = format!("{}/api/generate", self.base_url);
        let req = GenerateRequest {
            model: self.completion_model.clone(),
            prompt: prompt.to_string(),
            stream: true,
        };

        let client = self.http.clone();

        create_streaming_response(move |tx| async move {
            match client.post(&url).json(&req).send().await {
                Ok(response) => {
                    if !response.status().is_success() {
                        let err_msg = format!("HTTP error: {}", response.status());
                        let _ = tx.send(
                            Err(
                                Box::new(
                                    std::io::Error::new(std::io::ErrorKind::Other, err_msg)
                                ) as _
                            )
                        ).await;
                        return;
                    }
                    let mut stream = response.bytes_stream();

                    while let Some(chunk_result) = stream.next().await {
                        match chunk_result {
                            Ok(chunk) => {
                                if let Ok(text) = String::from_utf8(chunk.to_vec()) {
                                    for line in text.lines() {
                                        if line.is_empty() {
                                            continue;
                                        }

                                        match serde_json::from_str::<StreamResponse>(line) {
                                            Ok(stream_resp) => {
                                                if !stream_resp.response.is_empty() {
                                                    if
                                                        tx.send(Ok(stream_resp.response)).await
                                                            .is_err()
                                                    {
                                                        return;
                                                    }
                                                }

                                                if stream_resp.done {
                                                    return;
                                                }
                                            }
                                            Err(e) => {
                                                info!(
                                                    "JSON parse error: {} for line: {}",
                                                    e,
                                                    line
                                                );
                                                continue;
                                            }
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(
                                    Err(Box::new(e) as Box<dyn StdError + Send + Sync>)
                                ).await;
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(Box::new(e) as Box<dyn StdError + Send + Sync>)).await;
                }
            }
        })
    }

    fn model(&self) -> String {
        self.completion_model.clone()
    }
}
