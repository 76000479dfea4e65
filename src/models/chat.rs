use chrono::Local;
use serde::{ Deserialize, Serialize };

/// One entry in a chat transcript. The most recent assistant turn is
/// mutable while `is_streaming` is true; everything else is append-only.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub content: String,
    pub is_user: bool,
    pub timestamp: String,
    #[serde(default)]
    pub is_streaming: bool,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_user: true,
            timestamp: clock_now(),
            is_streaming: false,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_user: false,
            timestamp: clock_now(),
            is_streaming: false,
        }
    }

    /// Empty assistant turn shown while a response is being generated.
    pub fn streaming_placeholder() -> Self {
        Self {
            content: String::new(),
            is_user: false,
            timestamp: clock_now(),
            is_streaming: true,
        }
    }
}

pub fn clock_now() -> String {
    Local::now().format("%H:%M").to_string()
}

/// Prior-turn context re-supplied to the model on every request; the
/// backend keeps no session memory.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTurn {
    pub content: String,
    pub is_user: bool,
}

impl From<&ConversationTurn> for HistoryTurn {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            content: turn.content.clone(),
            is_user: turn.is_user,
        }
    }
}

/// Structured analysis result the model may emit for a new symptom.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineDocument {
    pub timelines: Vec<Timeline>,
    #[serde(default)]
    pub best_path: BestPath,
    #[serde(default)]
    pub disclaimer: String,
}

impl TimelineDocument {
    /// Range-checked lookup of the recommended timeline. Indices outside
    /// `[0, timelines.len())` are model noise and yield None.
    pub fn best_timeline(&self) -> Option<(usize, &Timeline)> {
        let index = self.best_path.path_index?;
        self.timelines.get(index).map(|timeline| (index, timeline))
    }
}

/// One simulated 7-day outcome path for a given decision. Percentages are
/// untrusted model output and are not clamped here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub path: String,
    pub action: String,
    #[serde(default)]
    pub days: Vec<TimelineDay>,
    pub risk_percentage: f64,
    pub recovery_percentage: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimelineDay {
    pub day: u32,
    pub description: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BestPath {
    pub path_index: Option<usize>,
    pub explanation: String,
}

/// Result of classifying a fully accumulated stream. This is the only
/// place a response shape is decided; downstream code matches on the
/// variant instead of re-sniffing JSON.
#[derive(Clone, Debug, PartialEq)]
pub enum AssistantReply {
    Timeline(TimelineDocument),
    Text(String),
}

/// Chat record as held by the chat store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub preview: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Persisted message as held by the chat store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub is_user: bool,
    pub timestamp: String,
    pub created_at: i64,
}
