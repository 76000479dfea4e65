use crate::models::chat::HistoryTurn;

/// Synthetic first turn seeded into every new chat.
pub const GREETING: &str =
    "Hello! I'm ParaDoc, your health assistant. How can I help you today?";

pub const CANCEL_NOTICE: &str = "Request cancelled. Feel free to ask another question.";

pub const STREAM_ERROR_NOTICE: &str =
    "I apologize, but I encountered an error while analyzing your symptoms. This could be due to:\n\n\
    • High API usage - please try again in a minute\n\
    • Network connectivity issues\n\
    • Invalid response format\n\n\
    Please try submitting your symptoms again.";

pub const DEFAULT_DISCLAIMER: &str =
    "This is a fictional simulation generated by an AI for educational and awareness purposes \
    only. It is not medical advice. Always consult a licensed medical professional for \
    real-life concerns.";

const JSON_SHAPE: &str = r#"{
  "timelines": [
    {
      "path": "Short title",
      "action": "Full sentence describing the decision",
      "days": [
        {"day": 1, "description": "Day 1 progression"},
        {"day": 2, "description": "Day 2 progression"},
        {"day": 3, "description": "Day 3 progression"},
        {"day": 4, "description": "Day 4 progression"},
        {"day": 5, "description": "Day 5 progression"},
        {"day": 6, "description": "Day 6 progression"},
        {"day": 7, "description": "Day 7 progression"}
      ],
      "riskPercentage": 50,
      "recoveryPercentage": 70
    }
  ],
  "bestPath": {
    "pathIndex": 0,
    "explanation": "Brief explanation"
  },
  "disclaimer": "{disclaimer}"
}"#;

const ANALYSIS_TASK: &str = "\
1. Based on the complexity and ambiguity of the symptom described, generate between 2 and 7 \
unique decision paths a patient might realistically consider. Simple symptoms might yield \
2-3 paths, complex ones up to 7.\n\
2. Each decision path must describe a clearly distinct action the patient could take \
(e.g., doing nothing, visiting a clinic, self-medicating, consulting a friend, trying \
alternative therapy).\n\
3. For each path, simulate a 7-day progression (Days 1 through 7). Include daily symptom \
progression, complications or improvements, and impact on daily life or mental health.\n\
4. Assign two metrics per path: a risk percentage (0-100, how dangerous this path is) and a \
recovery percentage (0-100, likelihood of improvement or full recovery by Day 7).\n\n\
After generating all paths, identify which path (if any) leads to the best health outcome.";

const JSON_RULES: &str = "\
Rules for valid JSON:\n\
- Use double quotes for all strings\n\
- NO trailing commas\n\
- NO comments in JSON\n\
- Escape any quotes within strings with backslash\n\
- riskPercentage and recoveryPercentage must be numbers (0-100)\n\
- pathIndex must be a number or null";

const STREAM_TEMPLATE: &str = "\
You are ParaDoc, a medical simulation AI assistant that generates possible future outcomes \
based on a person's symptoms and potential decisions.\n\
{conversation_context}\
CURRENT USER MESSAGE:\n\
\"{symptom}\"\n\n\
INSTRUCTIONS:\n\n\
If this is a follow-up question or clarification about a previous analysis:\n\
- Reference the previous conversation context\n\
- Provide specific answers to their follow-up\n\
- Update or clarify previous recommendations if needed\n\
- Keep the response conversational and helpful\n\
- DO NOT generate a full timeline analysis again unless explicitly requested\n\n\
If this is a NEW symptom or health concern that requires timeline analysis:\n\
{analysis_task}\n\n\
RESPONSE FORMAT:\n\n\
For follow-up questions: respond naturally in plain text (no JSON needed).\n\n\
For NEW symptom timeline analysis: return ONLY valid JSON without any markdown formatting, \
code blocks, or additional text.\n\n\
{json_rules}\n\n\
{json_shape}";

const ANALYSIS_TEMPLATE: &str = "\
You are a medical simulation AI that generates possible future outcomes based on a person's \
symptoms and potential decisions.\n\n\
SYMPTOM DESCRIPTION:\n\
\"{symptom}\"\n\n\
Your task:\n\
{analysis_task}\n\n\
CRITICAL: Return ONLY valid JSON without any markdown formatting, code blocks, or \
additional text.\n\n\
{json_rules}\n\n\
{json_shape}";

/// Embed prior turns as alternating User/Assistant lines, skipping the
/// synthetic greeting turn at index 0.
pub fn format_history_for_prompt(history: &[HistoryTurn]) -> String {
    let turns: Vec<&HistoryTurn> = history.iter().skip(1).collect();
    if turns.is_empty() {
        return String::new();
    }

    let mut context = String::from("\nPREVIOUS CONVERSATION:\n");
    for turn in turns {
        let speaker = if turn.is_user { "User" } else { "Assistant" };
        context.push_str(&format!("{}: {}\n", speaker, turn.content));
    }
    context.push('\n');
    context
}

/// Dual-mode prompt for the streaming route: the model decides between a
/// conversational follow-up and a structured timeline document.
pub fn build_stream_prompt(symptom: &str, history: &[HistoryTurn]) -> String {
    STREAM_TEMPLATE
        .replace("{conversation_context}", &format_history_for_prompt(history))
        .replace("{symptom}", symptom)
        .replace("{analysis_task}", ANALYSIS_TASK)
        .replace("{json_rules}", JSON_RULES)
        .replace("{json_shape}", &JSON_SHAPE.replace("{disclaimer}", DEFAULT_DISCLAIMER))
}

/// Single-mode prompt for the non-streaming route: always a timeline
/// document, no conversation context.
pub fn build_analysis_prompt(symptom: &str) -> String {
    ANALYSIS_TEMPLATE
        .replace("{symptom}", symptom)
        .replace("{analysis_task}", ANALYSIS_TASK)
        .replace("{json_rules}", JSON_RULES)
        .replace("{json_shape}", &JSON_SHAPE.replace("{disclaimer}", DEFAULT_DISCLAIMER))
}
