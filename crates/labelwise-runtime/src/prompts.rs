//! Prompts for reasoning-requirement judges.
//!
//! The system prompt is identical for every strategy so providers can cache
//! it; only the user message changes with the [`PromptView`]. Judges answer
//! with a single label token so log-probabilities of `0` and `1` can be read
//! from the first output position.
//!
//! Rationales use their own prompt pair and a separate request, after the
//! label is fixed.

use std::fmt::Write as _;

use labelwise_core::{Label, PromptView, StrategyKind};

use crate::providers::ChatMessage;

/// System prompt shared by every judge.
pub const SYSTEM_PROMPT: &str = r#"You label user requests sent to an AI assistant.

Decide whether answering the CURRENT MESSAGE well requires deliberate
multi-step reasoning (planning, derivation, proof, non-trivial math or code,
weighing several constraints) or whether a direct answer is sufficient
(lookup, chit-chat, rewriting, simple instructions).

Answer with exactly one character:
0 = reasoning required
1 = non-reasoning sufficient

Do not explain. Do not add punctuation."#;

/// System prompt for the follow-up explanation request.
pub const RATIONALE_SYSTEM_PROMPT: &str = r#"You explain labels assigned to user requests sent to an AI assistant.

You are given a request and its label:
0 = reasoning required
1 = non-reasoning sufficient

Explain briefly, in two to four sentences, why the label fits."#;

/// One-line framing of what the judge is shown.
fn strategy_preamble(strategy: StrategyKind) -> &'static str {
    match strategy {
        StrategyKind::TextOnly => "Judge the current message on its own.",
        StrategyKind::TextPlusMetrics => {
            "Judge the current message. Behavioral metrics from the session are included."
        }
        StrategyKind::TextPlusHistory => {
            "Judge the current message. Earlier turns of the conversation are included."
        }
        StrategyKind::FullContext => {
            "Judge the current message. Earlier turns and behavioral metrics are included."
        }
    }
}

/// Render the user message for a view.
pub fn render_user_prompt(view: &PromptView) -> String {
    let mut prompt = render_context(view);
    prompt.push_str("\n\nLabel:");
    prompt
}

fn render_context(view: &PromptView) -> String {
    let mut prompt = String::new();
    prompt.push_str(strategy_preamble(view.strategy));
    prompt.push_str("\n\n");

    if let Some(history) = &view.history {
        prompt.push_str("## Earlier turns\n");
        for turn in history {
            let _ = writeln!(prompt, "[{}] {}", turn.role, turn.text);
        }
        prompt.push('\n');
    }

    if let Some(metrics) = &view.metrics {
        prompt.push_str("## Metrics\n");
        for (name, value) in metrics {
            let _ = writeln!(prompt, "{}: {}", name, value);
        }
        prompt.push('\n');
    }

    prompt.push_str("## Current message\n");
    prompt.push_str(&view.text);
    prompt
}

/// Full message list for chat-completions backends.
pub fn render_messages(view: &PromptView) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(render_user_prompt(view)),
    ]
}

/// Messages asking why `label` fits the same view the judge classified.
pub fn render_rationale_messages(view: &PromptView, label: Label) -> Vec<ChatMessage> {
    let mut prompt = render_context(view);
    let _ = write!(prompt, "\n\nLabel: {}", label);
    vec![
        ChatMessage::system(RATIONALE_SYSTEM_PROMPT),
        ChatMessage::user(prompt),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelwise_core::{Record, Turn, ViewOptions};
    use std::collections::BTreeMap;

    fn record() -> Record {
        let mut metrics = BTreeMap::new();
        metrics.insert("edits".to_string(), 3.0);
        Record::new("r1", "Why does my proof by induction fail at n=2?")
            .with_turns(vec![Turn {
                role: "user".to_string(),
                text: "Here is my proof".to_string(),
            }])
            .with_metrics(metrics)
    }

    #[test]
    fn test_system_prompt_defines_both_labels() {
        assert!(SYSTEM_PROMPT.contains("0 = reasoning required"));
        assert!(SYSTEM_PROMPT.contains("1 = non-reasoning sufficient"));
    }

    #[test]
    fn test_text_only_prompt_hides_context() {
        let view = StrategyKind::TextOnly
            .view(&record(), &ViewOptions::default())
            .unwrap();
        let prompt = render_user_prompt(&view);
        assert!(prompt.contains("induction"));
        assert!(!prompt.contains("Earlier turns\n"));
        assert!(!prompt.contains("edits"));
        assert!(!prompt.contains("r1"));
    }

    #[test]
    fn test_full_context_prompt_shows_everything() {
        let view = StrategyKind::FullContext
            .view(&record(), &ViewOptions::default())
            .unwrap();
        let prompt = render_user_prompt(&view);
        assert!(prompt.contains("[user] Here is my proof"));
        assert!(prompt.contains("edits: 3"));
        assert!(prompt.ends_with("Label:"));
    }

    #[test]
    fn test_messages_are_system_then_user() {
        let view = StrategyKind::TextOnly
            .view(&record(), &ViewOptions::default())
            .unwrap();
        let messages = render_messages(&view);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
    }

    #[test]
    fn test_rationale_messages_carry_label() {
        let view = StrategyKind::TextPlusHistory
            .view(&record(), &ViewOptions::default())
            .unwrap();
        let messages = render_rationale_messages(&view, Label::ReasoningRequired);
        assert_eq!(messages[0].content, RATIONALE_SYSTEM_PROMPT);
        assert!(messages[1].content.contains("[user] Here is my proof"));
        assert!(messages[1].content.ends_with("Label: 0"));
    }
}
