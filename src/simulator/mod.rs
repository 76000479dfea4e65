use futures::stream::{ self, Stream, StreamExt };
use log::{ debug, info, warn };
use serde_json::json;
use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::classify::classify;
use crate::config::prompt;
use crate::llm::chat::{ new_client, ChatClient };
use crate::llm::{ parse_llm_type, LlmConfig };
use crate::models::chat::{ AssistantReply, HistoryTurn };

const MAX_COMPLETION_RETRIES: u32 = 2;
const RETRY_BASE_DELAY_MS: u64 = 1000;
const RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Everything the producer can fail with. Parse failures are not here:
/// they are absorbed by classification and never surface as errors.
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("API key not configured. Please set CHAT_API_KEY in your environment variables.")]
    Configuration,
    #[error("model '{model}' exceeded its quota")]
    QuotaExceeded {
        model: String,
    },
    #[error("All models exceeded quota. Please try again later.")]
    QuotaExhausted,
    #[error("completion backend failure: {0}")]
    Transport(String),
}

impl SimulatorError {
    /// The single JSON-encoded error fragment a streaming response body
    /// carries when the producer fails. Mirrors the non-streaming error
    /// envelope so the consumer-side classification sees one shape.
    pub fn client_payload(&self) -> String {
        let (message, details) = match self {
            SimulatorError::Configuration =>
                (self.to_string(), "Configuration Error".to_string()),
            SimulatorError::QuotaExhausted =>
                (self.to_string(), "Rate limit exceeded".to_string()),
            SimulatorError::QuotaExceeded { .. } | SimulatorError::Transport(_) =>
                (
                    "Failed to generate timelines. Please try again later.".to_string(),
                    self.to_string(),
                ),
        };
        json!({ "error": message, "details": details }).to_string()
    }
}

/// Quota and rate-limit failures are the recoverable class: the producer
/// walks to the next candidate instead of aborting.
pub fn is_quota_error(err: &(dyn StdError + Send + Sync)) -> bool {
    let message = err.to_string();
    message.contains("quota") || message.contains("429")
}

pub type TimelineStream = Pin<Box<dyn Stream<Item = Result<String, SimulatorError>> + Send>>;

/// One entry in the ordered fallback list, fastest/cheapest first.
pub struct ModelCandidate {
    pub model: String,
    pub client: Arc<dyn ChatClient>,
}

/// Stream Producer: turns a symptom/context payload into a live text
/// stream, falling back across model candidates on quota errors.
pub struct TimelineSimulator {
    candidates: Vec<ModelCandidate>,
}

impl TimelineSimulator {
    pub fn with_candidates(candidates: Vec<ModelCandidate>) -> Self {
        Self { candidates }
    }

    /// A simulator with no usable credential. Every request yields the
    /// single configuration-error payload.
    pub fn unconfigured() -> Self {
        Self { candidates: Vec::new() }
    }

    pub fn from_settings(
        llm_type: &str,
        api_key: &str,
        base_url: Option<&str>,
        fallback_models: &[String]
    ) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let llm_type = parse_llm_type(llm_type)?;

        if api_key.trim().is_empty() {
            warn!("No completion API key configured; requests will fail with a configuration error.");
            return Ok(Self::unconfigured());
        }

        let mut candidates = Vec::with_capacity(fallback_models.len());
        for model in fallback_models {
            let config = LlmConfig {
                llm_type,
                api_key: Some(api_key.to_string()),
                completion_model: Some(model.clone()),
                base_url: base_url.map(str::to_string),
            };
            candidates.push(ModelCandidate {
                model: model.clone(),
                client: new_client(&config)?,
            });
        }

        info!(
            "Timeline simulator configured with {} model candidate(s): {}",
            candidates.len(),
            fallback_models.join(", ")
        );
        Ok(Self { candidates })
    }

    pub fn is_configured(&self) -> bool {
        !self.candidates.is_empty()
    }

    pub fn candidate_models(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.model.clone()).collect()
    }

    /// Open a live text stream for one request. Errors are reported
    /// in-band: the stream yields either one or more text fragments
    /// followed by the end of the stream, or exactly one error item.
    pub async fn stream_timelines(
        &self,
        symptom: &str,
        history: &[HistoryTurn],
        choices: &[String]
    ) -> TimelineStream {
        if !choices.is_empty() {
            debug!("Requested choices (passed through, not used for branching): {:?}", choices);
        }

        if !self.is_configured() {
            return single_error(SimulatorError::Configuration);
        }

        let prompt = prompt::build_stream_prompt(symptom, history);
        self.try_candidates_streaming(&prompt).await
    }

    /// Try each candidate in order until a stream has started. Quota
    /// errors advance to the next candidate; anything else aborts.
    async fn try_candidates_streaming(&self, prompt: &str) -> TimelineStream {
        for candidate in &self.candidates {
            let mut chunk_stream = match candidate.client.complete_stream(prompt).await {
                Ok(s) => s,
                Err(e) if is_quota_error(e.as_ref()) => {
                    warn!("Model {} failed with quota error: {}", candidate.model, e);
                    continue;
                }
                Err(e) => {
                    warn!("Model {} failed: {}", candidate.model, e);
                    return single_error(SimulatorError::Transport(e.to_string()));
                }
            };

            // The transport may only report failures as the first stream
            // item; peek it so quota fallback still applies.
            match chunk_stream.next().await {
                Some(Ok(first)) => {
                    info!("Streaming response started on model {}", candidate.model);
                    let rest = chunk_stream.map(|item|
                        item.map_err(|e| SimulatorError::Transport(e.to_string()))
                    );
                    let chained = stream
                        ::once(async move { Ok(first) })
                        .chain(rest);
                    return error_terminal(Box::pin(chained));
                }
                Some(Err(e)) if is_quota_error(e.as_ref()) => {
                    warn!("Model {} failed with quota error: {}", candidate.model, e);
                    continue;
                }
                Some(Err(e)) => {
                    warn!("Model {} failed: {}", candidate.model, e);
                    return single_error(SimulatorError::Transport(e.to_string()));
                }
                None => {
                    warn!("Model {} produced an empty stream; trying next candidate", candidate.model);
                    continue;
                }
            }
        }

        warn!("All model candidates exhausted");
        single_error(SimulatorError::QuotaExhausted)
    }

    /// Non-streaming analysis for the `stream=false` route: same fallback
    /// walk, plus per-candidate retry with backoff on quota errors, and
    /// the result is classified before returning.
    pub async fn generate_timelines(
        &self,
        symptom: &str,
        choices: &[String]
    ) -> Result<AssistantReply, SimulatorError> {
        if !choices.is_empty() {
            debug!("Requested choices (passed through, not used for branching): {:?}", choices);
        }

        if !self.is_configured() {
            return Err(SimulatorError::Configuration);
        }

        let prompt = prompt::build_analysis_prompt(symptom);

        for candidate in &self.candidates {
            match self.complete_with_retry(candidate, &prompt).await {
                Ok(text) => {
                    return Ok(classify(&text));
                }
                Err(e) if is_quota_error(e.as_ref()) => {
                    warn!("Model {} exhausted its quota: {}", candidate.model, e);
                    continue;
                }
                Err(e) => {
                    return Err(SimulatorError::Transport(e.to_string()));
                }
            }
        }

        Err(SimulatorError::QuotaExhausted)
    }

    async fn complete_with_retry(
        &self,
        candidate: &ModelCandidate,
        prompt: &str
    ) -> Result<String, Box<dyn StdError + Send + Sync>> {
        let mut last_err: Option<Box<dyn StdError + Send + Sync>> = None;

        for attempt in 0..=MAX_COMPLETION_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_millis(
                    (RETRY_BASE_DELAY_MS * (1 << (attempt - 1))).min(RETRY_MAX_DELAY_MS)
                );
                info!("Retrying model {} after {:?}", candidate.model, delay);
                tokio::time::sleep(delay).await;
            }

            match candidate.client.complete(prompt).await {
                Ok(resp) => {
                    return Ok(resp.response);
                }
                Err(e) if is_quota_error(e.as_ref()) => {
                    last_err = Some(e);
                }
                Err(e) => {
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "quota retries exhausted".into()))
    }

    /// Connectivity probe against the first candidate.
    pub async fn probe(&self) -> Result<String, SimulatorError> {
        let candidate = self.candidates.first().ok_or(SimulatorError::Configuration)?;
        candidate.client
            .complete("Reply with only the word 'SUCCESS' if you can see this message.").await
            .map(|resp| resp.response)
            .map_err(|e| SimulatorError::Transport(e.to_string()))
    }
}

fn single_error(err: SimulatorError) -> TimelineStream {
    Box::pin(stream::once(async move { Err(err) }))
}

/// Enforce the producer guarantee: after an error item the stream ends,
/// regardless of what the transport would have yielded next.
fn error_terminal(inner: TimelineStream) -> TimelineStream {
    Box::pin(
        inner.scan(false, |errored, item| {
            if *errored {
                return futures::future::ready(None);
            }
            if item.is_err() {
                *errored = true;
            }
            futures::future::ready(Some(item))
        })
    )
}
