use futures::StreamExt;
use log::{ info, warn };
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::classify::{ classify, render_summary };
use crate::config::prompt::{ CANCEL_NOTICE, GREETING, STREAM_ERROR_NOTICE };
use crate::models::chat::{ AssistantReply, ConversationTurn, HistoryTurn };
use crate::simulator::{ SimulatorError, TimelineSimulator };
use crate::store::ChatStore;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Symptom description is required")]
    EmptyInput,
    #[error("chat not found: {0}")]
    UnknownChat(String),
    #[error("chat store failure: {0}")]
    Store(String),
}

/// How one submission ended. Parse trouble is not a failure; it comes
/// back as `Completed(AssistantReply::Text)`.
#[derive(Debug)]
pub enum SubmitOutcome {
    Completed(AssistantReply),
    Cancelled,
    Failed(SimulatorError),
}

/// Cancellation signal for an in-flight submission. Clone it into
/// whatever task needs to cancel; `cancel` is sticky and idempotent.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flagged| *flagged).await.is_err() {
        // All handles dropped without cancelling; never resolve.
        std::future::pending::<()>().await;
    }
}

/// Per-chat consumer state. Owns the transcript, drives the producer,
/// reconciles the streamed text into a final assistant turn, and
/// mirrors durable turns into the chat store when one is attached.
///
/// `&mut self` on submit keeps a session to one in-flight request.
pub struct ChatSession {
    simulator: Arc<TimelineSimulator>,
    store: Option<Arc<dyn ChatStore>>,
    chat_id: Option<String>,
    user_id: String,
    transcript: Vec<ConversationTurn>,
    chunk_listener: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl ChatSession {
    pub fn new(
        simulator: Arc<TimelineSimulator>,
        store: Option<Arc<dyn ChatStore>>,
        user_id: impl Into<String>
    ) -> Self {
        Self {
            simulator,
            store,
            chat_id: None,
            user_id: user_id.into(),
            transcript: vec![ConversationTurn::assistant(GREETING)],
            chunk_listener: None,
        }
    }

    /// Register a callback fired once per received chunk, in receipt
    /// order. Used for live "thinking" indicators; the placeholder turn
    /// itself is not updated chunk-by-chunk, so partial JSON never
    /// flickers through the transcript.
    pub fn set_chunk_listener(&mut self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.chunk_listener = Some(Box::new(listener));
    }

    /// Rebuild a session from a persisted chat so a new request can
    /// continue the conversation.
    pub async fn resume(
        simulator: Arc<TimelineSimulator>,
        store: Arc<dyn ChatStore>,
        chat_id: &str
    ) -> Result<Self, SessionError> {
        let chat = store
            .get_chat(chat_id).await
            .map_err(|e| SessionError::Store(e.to_string()))?
            .ok_or_else(|| SessionError::UnknownChat(chat_id.to_string()))?;
        let messages = store
            .get_messages(chat_id).await
            .map_err(|e| SessionError::Store(e.to_string()))?;

        let transcript = messages
            .iter()
            .map(|m| {
                if m.is_user {
                    ConversationTurn::user(m.content.clone())
                } else {
                    ConversationTurn::assistant(m.content.clone())
                }
            })
            .collect();

        Ok(Self {
            simulator,
            store: Some(store),
            chat_id: Some(chat.id),
            user_id: chat.user_id,
            transcript,
            chunk_listener: None,
        })
    }

    pub fn transcript(&self) -> &[ConversationTurn] {
        &self.transcript
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    /// Submit one user message and drive it to a terminal state. The
    /// transcript always gains the user turn plus exactly one assistant
    /// turn describing how the request ended.
    pub async fn submit(
        &mut self,
        input: &str,
        category: Option<&str>,
        abort: &AbortHandle
    ) -> Result<SubmitOutcome, SessionError> {
        let symptom = input.trim();
        if symptom.is_empty() {
            return Err(SessionError::EmptyInput);
        }

        let message = match category {
            Some(category) => format!("[Category: {}] {}", category, symptom),
            None => symptom.to_string(),
        };

        // History snapshot is taken before this turn is added; the model
        // sees the conversation as it stood when the user hit send.
        let history: Vec<HistoryTurn> = self.transcript.iter().map(HistoryTurn::from).collect();

        self.transcript.push(ConversationTurn::user(message.clone()));
        self.persist(&message, true).await;
        self.transcript.push(ConversationTurn::streaming_placeholder());

        let mut cancel_rx = abort.subscribe();

        let mut stream = tokio::select! {
            stream = self.simulator.stream_timelines(&message, &history, &[]) => stream,
            _ = cancelled(&mut cancel_rx) => {
                return Ok(self.finish_cancelled());
            }
        };

        let mut buffer = String::new();
        loop {
            tokio::select! {
                _ = cancelled(&mut cancel_rx) => {
                    return Ok(self.finish_cancelled());
                }
                item = stream.next() => match item {
                    Some(Ok(chunk)) => {
                        if let Some(listener) = &self.chunk_listener {
                            listener(&chunk);
                        }
                        buffer.push_str(&chunk);
                    }
                    Some(Err(err)) => {
                        return Ok(self.finish_failed(err));
                    }
                    None => {
                        break;
                    }
                },
            }
        }

        Ok(self.finish_completed(&buffer).await)
    }

    async fn finish_completed(&mut self, buffer: &str) -> SubmitOutcome {
        let reply = classify(buffer);
        let rendered = match &reply {
            AssistantReply::Timeline(doc) => render_summary(doc),
            AssistantReply::Text(text) => text.clone(),
        };

        self.finalize_placeholder(&rendered);
        self.persist(&rendered, false).await;
        SubmitOutcome::Completed(reply)
    }

    /// Partial text is discarded wholesale; only the cancel notice lands
    /// in the transcript and nothing is persisted for the dropped turn.
    fn finish_cancelled(&mut self) -> SubmitOutcome {
        info!("Submission cancelled by user");
        self.drop_streaming_turn();
        self.transcript.push(ConversationTurn::assistant(CANCEL_NOTICE));
        SubmitOutcome::Cancelled
    }

    /// The failure is shown in place of the placeholder, never persisted.
    fn finish_failed(&mut self, err: SimulatorError) -> SubmitOutcome {
        warn!("Submission failed: {}", err);
        self.finalize_placeholder(STREAM_ERROR_NOTICE);
        SubmitOutcome::Failed(err)
    }

    /// Write final content into the streaming placeholder and clear its
    /// streaming flag. Appends a fresh turn if the placeholder is gone.
    fn finalize_placeholder(&mut self, content: &str) {
        match self.transcript.last_mut().filter(|turn| turn.is_streaming) {
            Some(turn) => {
                turn.content = content.to_string();
                turn.is_streaming = false;
            }
            None => self.transcript.push(ConversationTurn::assistant(content)),
        }
    }

    fn drop_streaming_turn(&mut self) {
        if self.transcript.last().map_or(false, |turn| turn.is_streaming) {
            self.transcript.pop();
        }
    }

    /// Best-effort persistence: a store failure keeps the conversation
    /// alive in memory and logs instead of surfacing to the user.
    async fn persist(&mut self, content: &str, is_user: bool) {
        let Some(store) = self.store.clone() else {
            return;
        };

        if self.chat_id.is_none() {
            match store.create_chat(&self.user_id).await {
                Ok(chat) => {
                    self.chat_id = Some(chat.id);
                }
                Err(e) => {
                    warn!("Failed to create chat, continuing unpersisted: {}", e);
                    return;
                }
            }
        }

        if let Some(chat_id) = &self.chat_id {
            if let Err(e) = store.append_message(chat_id, content, is_user).await {
                warn!("Failed to persist message: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::error::Error as StdError;
    use std::sync::Mutex;
    use std::time::Duration;
    use crate::models::chat::{ clock_now, ChatSummary, StoredMessage };
    use crate::simulator::testing::{ candidate, FailingClient, ScriptedClient, StallingClient };

    const TIMELINE_JSON: &str = r#"{"timelines":[{"path":"Rest","action":"Stay home.","days":[],"riskPercentage":10,"recoveryPercentage":90},{"path":"Clinic","action":"Visit a clinic.","days":[],"riskPercentage":5,"recoveryPercentage":95}],"bestPath":{"pathIndex":1,"explanation":"Lower risk."},"disclaimer":"Simulation only."}"#;

    /// Store double that records appends in call order.
    #[derive(Default)]
    struct RecordingStore {
        appended: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl ChatStore for RecordingStore {
        async fn create_chat(
            &self,
            user_id: &str
        ) -> Result<ChatSummary, Box<dyn StdError + Send + Sync>> {
            Ok(ChatSummary {
                id: "chat-1".into(),
                user_id: user_id.into(),
                title: "New Chat".into(),
                preview: String::new(),
                created_at: 0,
                updated_at: 0,
            })
        }

        async fn list_chats(
            &self,
            _user_id: &str
        ) -> Result<Vec<ChatSummary>, Box<dyn StdError + Send + Sync>> {
            Ok(Vec::new())
        }

        async fn get_chat(
            &self,
            _chat_id: &str
        ) -> Result<Option<ChatSummary>, Box<dyn StdError + Send + Sync>> {
            Ok(None)
        }

        async fn append_message(
            &self,
            chat_id: &str,
            content: &str,
            is_user: bool
        ) -> Result<StoredMessage, Box<dyn StdError + Send + Sync>> {
            self.appended.lock().unwrap().push((content.to_string(), is_user));
            Ok(StoredMessage {
                id: format!("m-{}", self.appended.lock().unwrap().len()),
                chat_id: chat_id.into(),
                content: content.into(),
                is_user,
                timestamp: clock_now(),
                created_at: 0,
            })
        }

        async fn update_message(
            &self,
            _message_id: &str,
            _content: &str
        ) -> Result<(), Box<dyn StdError + Send + Sync>> {
            Ok(())
        }

        async fn get_messages(
            &self,
            _chat_id: &str
        ) -> Result<Vec<StoredMessage>, Box<dyn StdError + Send + Sync>> {
            Ok(Vec::new())
        }

        async fn delete_chat(
            &self,
            _chat_id: &str
        ) -> Result<(), Box<dyn StdError + Send + Sync>> {
            Ok(())
        }
    }

    fn simulator_with(chunks: &[&str]) -> Arc<TimelineSimulator> {
        Arc::new(
            TimelineSimulator::with_candidates(
                vec![candidate("scripted", ScriptedClient::new("scripted", chunks))]
            )
        )
    }

    #[tokio::test]
    async fn streamed_timeline_json_becomes_a_rendered_summary() {
        let simulator = simulator_with(&[TIMELINE_JSON]);
        let mut session = ChatSession::new(simulator, None, "guest");
        let outcome = session
            .submit("I have a headache", None, &AbortHandle::new()).await
            .unwrap();

        assert!(matches!(outcome, SubmitOutcome::Completed(AssistantReply::Timeline(_))));
        let last = session.transcript().last().unwrap();
        assert!(last.content.contains("analyzed 2 possible outcomes"));
        assert!(last.content.contains("Path 2 - Lower risk."));
        assert!(!last.is_streaming);
    }

    #[tokio::test]
    async fn fenced_json_streamed_in_pieces_is_reassembled() {
        let fenced = format!("```json\n{}\n```", TIMELINE_JSON);
        let mid = fenced.len() / 2;
        let simulator = simulator_with(&[&fenced[..mid], &fenced[mid..]]);
        let mut session = ChatSession::new(simulator, None, "guest");
        let outcome = session.submit("sore throat", None, &AbortHandle::new()).await.unwrap();

        assert!(matches!(outcome, SubmitOutcome::Completed(AssistantReply::Timeline(_))));
    }

    #[tokio::test]
    async fn plain_text_follow_up_lands_verbatim() {
        let simulator = simulator_with(&["Keep ", "resting ", "and hydrate."]);
        let mut session = ChatSession::new(simulator, None, "guest");
        let outcome = session
            .submit("should I still rest?", None, &AbortHandle::new()).await
            .unwrap();

        match outcome {
            SubmitOutcome::Completed(AssistantReply::Text(text)) => {
                assert_eq!(text, "Keep resting and hydrate.");
            }
            other => panic!("expected text reply, got {:?}", other),
        }
        assert_eq!(session.transcript().last().unwrap().content, "Keep resting and hydrate.");
    }

    #[tokio::test]
    async fn chunk_listener_sees_chunks_in_receipt_order() {
        let simulator = simulator_with(&["alpha ", "beta ", "gamma"]);
        let mut session = ChatSession::new(simulator, None, "guest");

        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        session.set_chunk_listener(move |chunk| {
            sink.lock().unwrap().push_str(chunk);
        });

        let outcome = session.submit("follow-up", None, &AbortHandle::new()).await.unwrap();

        // Concatenating the relayed chunks reconstructs the classified text.
        assert_eq!(*seen.lock().unwrap(), "alpha beta gamma");
        match outcome {
            SubmitOutcome::Completed(AssistantReply::Text(text)) => {
                assert_eq!(text, *seen.lock().unwrap());
            }
            other => panic!("expected text reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_discards_partial_text() {
        let simulator = Arc::new(
            TimelineSimulator::with_candidates(vec![candidate("stalling", StallingClient)])
        );
        let store = Arc::new(RecordingStore::default());
        let mut session = ChatSession::new(
            simulator,
            Some(store.clone() as Arc<dyn ChatStore>),
            "user-1"
        );

        let abort = AbortHandle::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = session.submit("chest pain", None, &abort).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Cancelled));

        let transcript = session.transcript();
        assert_eq!(transcript.last().unwrap().content, CANCEL_NOTICE);
        assert!(transcript.iter().all(|turn| !turn.is_streaming));

        // Only the user turn was persisted; no partial assistant text.
        let appended = store.appended.lock().unwrap();
        assert_eq!(appended.as_slice(), &[("chest pain".to_string(), true)]);
    }

    #[tokio::test]
    async fn transport_failure_shows_the_error_notice() {
        let simulator = Arc::new(
            TimelineSimulator::with_candidates(
                vec![candidate("flaky", FailingClient::new("flaky", "connection reset"))]
            )
        );
        let mut session = ChatSession::new(simulator, None, "guest");
        let outcome = session.submit("dizzy", None, &AbortHandle::new()).await.unwrap();

        assert!(matches!(outcome, SubmitOutcome::Failed(SimulatorError::Transport(_))));
        assert_eq!(session.transcript().last().unwrap().content, STREAM_ERROR_NOTICE);
    }

    #[tokio::test]
    async fn empty_input_is_rejected_without_touching_the_transcript() {
        let simulator = simulator_with(&["unused"]);
        let mut session = ChatSession::new(simulator, None, "guest");
        let err = session.submit("   ", None, &AbortHandle::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::EmptyInput));
        assert_eq!(session.transcript().len(), 1);
    }

    #[tokio::test]
    async fn category_label_is_prepended_to_the_user_turn() {
        let simulator = simulator_with(&["noted"]);
        let store = Arc::new(RecordingStore::default());
        let mut session = ChatSession::new(
            simulator,
            Some(store.clone() as Arc<dyn ChatStore>),
            "user-1"
        );
        session.submit("rash on arm", Some("Skin"), &AbortHandle::new()).await.unwrap();

        let appended = store.appended.lock().unwrap();
        assert_eq!(appended[0].0, "[Category: Skin] rash on arm");
        assert_eq!(session.chat_id(), Some("chat-1"));
    }

    #[tokio::test]
    async fn completed_turns_are_persisted_user_first() {
        let simulator = simulator_with(&["all good"]);
        let store = Arc::new(RecordingStore::default());
        let mut session = ChatSession::new(
            simulator,
            Some(store.clone() as Arc<dyn ChatStore>),
            "user-1"
        );
        session.submit("mild cough", None, &AbortHandle::new()).await.unwrap();

        let appended = store.appended.lock().unwrap();
        assert_eq!(
            appended.as_slice(),
            &[("mild cough".to_string(), true), ("all good".to_string(), false)]
        );
    }
}
