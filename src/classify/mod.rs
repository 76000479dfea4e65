use log::{ debug, warn };

use crate::config::prompt::DEFAULT_DISCLAIMER;
use crate::models::chat::{ AssistantReply, TimelineDocument };

/// Decide whether accumulated stream text is a structured timeline
/// document or a conversational reply, repairing near-miss JSON on the
/// way. Never fails: anything unparseable becomes a plain-text reply
/// carrying the original text.
pub fn classify(raw: &str) -> AssistantReply {
    let trimmed = raw.trim();

    let candidate = match extract_candidate(trimmed) {
        Some(c) => c,
        None => {
            return AssistantReply::Text(raw.to_string());
        }
    };

    let repaired = strip_trailing_commas(candidate);

    match serde_json::from_str::<serde_json::Value>(&repaired) {
        Ok(value) if value.get("timelines").map_or(false, |t| t.is_array()) => {
            match serde_json::from_value::<TimelineDocument>(value) {
                Ok(doc) => AssistantReply::Timeline(doc),
                Err(e) => {
                    warn!("Timeline payload rejected during deserialization: {}", e);
                    AssistantReply::Text(raw.to_string())
                }
            }
        }
        Ok(_) => AssistantReply::Text(raw.to_string()),
        Err(e) => {
            debug!("Classification parse failure, falling back to plain reply: {}", e);
            AssistantReply::Text(raw.to_string())
        }
    }
}

/// Extraction order: a fenced ```json block, then the first balanced
/// `{...}` region, then the trimmed text itself when it already looks
/// like JSON. Prose with neither shape yields None (plain reply).
fn extract_candidate(trimmed: &str) -> Option<&str> {
    if let Some(fenced) = extract_fenced_json(trimmed) {
        return Some(fenced);
    }

    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return None;
    }

    if let Some(region) = extract_braced_region(trimmed) {
        return Some(region);
    }

    Some(trimmed)
}

fn extract_fenced_json(text: &str) -> Option<&str> {
    let start = text.find("```json")?;
    let interior = &text[start + "```json".len()..];
    let end = interior.find("```")?;
    Some(interior[..end].trim())
}

/// First `{` through its matching `}`, string- and escape-aware.
fn extract_braced_region(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => {
                escaped = true;
            }
            '"' => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                depth += 1;
            }
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Repair pass: drop commas that sit directly before a closing brace or
/// bracket (outside string literals). The one malformation the model
/// produces often enough to be worth recovering.
fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();

    for (i, &ch) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' if in_string => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = !in_string;
                out.push(ch);
            }
            ',' if !in_string => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, Some('}') | Some(']')) {
                    continue;
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }

    out
}

/// Render a timeline document into the transcript text that gets shown
/// and persisted. The structured document itself is never persisted.
pub fn render_summary(doc: &TimelineDocument) -> String {
    let mut out = format!(
        "**Based on your symptom description, I've analyzed {} possible outcomes:**\n\n",
        doc.timelines.len()
    );

    for (index, timeline) in doc.timelines.iter().enumerate() {
        out.push_str(&format!("**Path {}: {}**\n", index + 1, timeline.path));
        out.push_str(&format!("_{}_\n\n", timeline.action));
        out.push_str(&format!("• Risk Level: {}%\n", timeline.risk_percentage));
        out.push_str(&format!("• Recovery Chance: {}%\n\n", timeline.recovery_percentage));
    }

    if let Some((index, _)) = doc.best_timeline() {
        out.push_str("\n**Recommended Path:**\n");
        out.push_str(&format!("Path {} - {}\n\n", index + 1, doc.best_path.explanation));
    }

    let disclaimer = if doc.disclaimer.is_empty() {
        DEFAULT_DISCLAIMER
    } else {
        doc.disclaimer.as_str()
    };
    out.push_str(&format!("\n_{}_", disclaimer));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::AssistantReply;

    const TIMELINE_JSON: &str = r#"{
        "timelines": [
            {
                "path": "Do nothing",
                "action": "Wait and see how the symptom develops.",
                "days": [
                    {"day": 1, "description": "Mild discomfort"},
                    {"day": 2, "description": "Unchanged"},
                    {"day": 3, "description": "Slight improvement"},
                    {"day": 4, "description": "Improvement continues"},
                    {"day": 5, "description": "Occasional twinges"},
                    {"day": 6, "description": "Mostly resolved"},
                    {"day": 7, "description": "Fully resolved"}
                ],
                "riskPercentage": 20,
                "recoveryPercentage": 75
            },
            {
                "path": "Seek care",
                "action": "Visit a clinic for an examination.",
                "days": [
                    {"day": 1, "description": "Appointment booked"},
                    {"day": 2, "description": "Examined, reassured"},
                    {"day": 3, "description": "Treatment started"},
                    {"day": 4, "description": "Improving"},
                    {"day": 5, "description": "Improving"},
                    {"day": 6, "description": "Nearly resolved"},
                    {"day": 7, "description": "Resolved"}
                ],
                "riskPercentage": 5,
                "recoveryPercentage": 95
            }
        ],
        "bestPath": {"pathIndex": 1, "explanation": "Professional care lowers risk."},
        "disclaimer": "Simulation only."
    }"#;

    #[test]
    fn valid_timeline_json_classifies_as_timeline() {
        match classify(TIMELINE_JSON) {
            AssistantReply::Timeline(doc) => {
                assert_eq!(doc.timelines.len(), 2);
                assert_eq!(doc.timelines[0].days.len(), 7);
                assert_eq!(doc.best_path.path_index, Some(1));
            }
            other => panic!("expected timeline, got {:?}", other),
        }
    }

    #[test]
    fn prose_classifies_as_text_verbatim() {
        let text = "I think you should rest and drink water.";
        assert_eq!(classify(text), AssistantReply::Text(text.to_string()));
    }

    #[test]
    fn fenced_json_block_is_unwrapped() {
        let fenced = format!("```json\n{}\n```", TIMELINE_JSON);
        match classify(&fenced) {
            AssistantReply::Timeline(doc) => assert_eq!(doc.timelines.len(), 2),
            other => panic!("expected timeline, got {:?}", other),
        }
    }

    #[test]
    fn prose_around_embedded_block_is_discarded() {
        let mixed = format!(
            "Here is my analysis:\n```json\n{}\n```\nTake care!",
            TIMELINE_JSON
        );
        match classify(&mixed) {
            AssistantReply::Timeline(doc) => assert_eq!(doc.timelines.len(), 2),
            other => panic!("expected timeline, got {:?}", other),
        }
    }

    #[test]
    fn trailing_comma_is_repaired() {
        let broken = r#"{"timelines": [{"path": "A", "action": "B", "days": [],
            "riskPercentage": 10, "recoveryPercentage": 90,}],
            "bestPath": {"pathIndex": null, "explanation": ""},
            "disclaimer": "d"}"#;
        // Sanity: without the repair pass this document does not parse.
        assert!(serde_json::from_str::<serde_json::Value>(broken).is_err());
        match classify(broken) {
            AssistantReply::Timeline(doc) => assert_eq!(doc.timelines[0].path, "A"),
            other => panic!("expected timeline, got {:?}", other),
        }
    }

    #[test]
    fn commas_inside_strings_survive_repair() {
        let text = r#"{"note": "a, }", "n": 1,}"#;
        let repaired = strip_trailing_commas(text);
        assert_eq!(repaired, r#"{"note": "a, }", "n": 1}"#);
    }

    #[test]
    fn json_without_timelines_is_plain_text() {
        let payload = r#"{"error": "All models exceeded quota.", "details": "Rate limit"}"#;
        assert_eq!(classify(payload), AssistantReply::Text(payload.to_string()));
    }

    #[test]
    fn legacy_paths_shape_is_plain_text() {
        let legacy = r#"{"paths": [{"title": "Rest"}], "recommendation": "rest"}"#;
        assert_eq!(classify(legacy), AssistantReply::Text(legacy.to_string()));
    }

    #[test]
    fn malformed_json_falls_back_to_text() {
        let broken = "{\"timelines\": [";
        assert_eq!(classify(broken), AssistantReply::Text(broken.to_string()));
    }

    #[test]
    fn embedded_object_after_junk_prefix_is_found() {
        let wrapped = format!("{{garbage}} {}", TIMELINE_JSON);
        // Leading region is the junk object; classification treats it as
        // not-a-timeline and falls back to the raw text.
        assert!(matches!(classify(&wrapped), AssistantReply::Text(_)));
    }

    #[test]
    fn summary_lists_paths_and_recommendation() {
        let doc = match classify(TIMELINE_JSON) {
            AssistantReply::Timeline(doc) => doc,
            _ => unreachable!(),
        };
        let summary = render_summary(&doc);
        assert!(summary.contains("analyzed 2 possible outcomes"));
        assert!(summary.contains("**Path 1: Do nothing**"));
        assert!(summary.contains("• Risk Level: 20%"));
        assert!(summary.contains("Path 2 - Professional care lowers risk."));
        assert!(summary.contains("_Simulation only._"));
    }

    #[test]
    fn summary_omits_recommendation_for_bad_index() {
        let mut doc = match classify(TIMELINE_JSON) {
            AssistantReply::Timeline(doc) => doc,
            _ => unreachable!(),
        };
        doc.best_path.path_index = Some(9);
        let summary = render_summary(&doc);
        assert!(!summary.contains("Recommended Path"));
    }
}
