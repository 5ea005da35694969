//! Prompt construction for label inference.
//!
//! Assembles the completion request from the repository's label
//! catalogue, its recent labeling history, and the target issue, then
//! prunes history until the prompt fits the model's context window.

use serde_json::json;

use crate::ai::{ChatMessage, ChatRequest, ToolDefinition};
use crate::github::{Issue, Label};
use crate::tokens::TokenCounter;

/// Name of the structured label-selection function.
pub const SET_LABELS_TOOL: &str = "set_labels";

/// Characters of issue body kept at each end when clipping.
const BODY_CLIP: usize = 500;

/// Token ceiling for a model. Unknown models get the largest known
/// window; an overflow error from the provider beats silently starving
/// the prompt of history.
fn token_ceiling(model: &str) -> usize {
    if model.starts_with("gpt-3.5-turbo") {
        16_385
    } else {
        128_000
    }
}

/// Keep the beginning and end of long bodies; the middle is the least
/// informative part of a bug report.
fn clip_middle(text: &str, keep: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= keep * 2 {
        return text.to_string();
    }
    let prefix: String = chars[..keep].iter().collect();
    let suffix: String = chars[chars.len() - keep..].iter().collect();
    format!("{prefix}\n[...]\n{suffix}")
}

/// Serialize an issue as a bounded text record wrapped in boundary
/// markers so records can be told apart downstream.
fn issue_to_text(issue: &Issue, include_labels: bool) -> String {
    let mut record = String::from("<issue>\n");
    record.push_str(&format!(
        "author: {} ({})\n",
        issue.user.login, issue.author_association
    ));
    if include_labels {
        let names: Vec<&str> = issue.labels.iter().map(|l| l.name.as_str()).collect();
        record.push_str(&format!("labels: {}\n", names.join(", ")));
    }
    record.push_str(&format!("title: {}\n", issue.title));
    record.push_str(&clip_middle(&issue.body, BODY_CLIP));
    record.push_str("\n</issue>");
    record
}

/// Prompt context for one inference call.
///
/// `history` must already be sorted ascending by creation time so that
/// the most recent examples sit closest to the target issue, and prune
/// steps discard the oldest half.
pub struct PromptContext {
    /// Repository label set
    pub labels: Vec<Label>,
    /// Prior issues used as in-context examples, oldest first
    pub history: Vec<Issue>,
    /// The issue being labeled
    pub target: Issue,
    /// Sentinel phrase quoted in the system instructions
    pub sentinel: String,
    /// Ceiling override for tests; production uses the model's ceiling
    pub ceiling_override: Option<usize>,
}

impl PromptContext {
    fn system_instructions(&self) -> String {
        let mut catalogue = String::new();
        for label in &self.labels {
            catalogue.push_str(&label.name);
            catalogue.push_str(": ");
            catalogue.push_str(&label.description);
            catalogue.push('\n');
        }
        format!(
            "You are a bot that labels GitHub issues using the \"{SET_LABELS_TOOL}\" function. \
             Apply zero or more labels from the fixed set below; an issue may deserve several. \
             Do not apply labels that are meant for pull requests. \
             Never apply a label whose description says something like \"{}\". \
             When unsure, prefer leaving a label off over applying a wrong one.\n\
             The labels available are:\n{}",
            self.sentinel, catalogue
        )
    }

    fn tool_definition(&self) -> ToolDefinition {
        let names: Vec<&str> = self.labels.iter().map(|l| l.name.as_str()).collect();
        ToolDefinition {
            name: SET_LABELS_TOOL.to_string(),
            description: "Label the GitHub issue with the given labels.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "labels": {
                        "type": "array",
                        "items": {
                            "type": "string",
                            "enum": names,
                        },
                    },
                },
            }),
        }
    }

    fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_instructions())];

        if !self.history.is_empty() {
            let records: Vec<String> = self
                .history
                .iter()
                .map(|issue| issue_to_text(issue, true))
                .collect();
            messages.push(ChatMessage::user(format!(
                "Recent issues from this repository and the labels they received:\n{}",
                records.join("\n")
            )));
        }

        messages.push(ChatMessage::user(issue_to_text(&self.target, false)));
        messages
    }

    /// Build the completion request, pruning history until the prompt
    /// fits the model's token ceiling.
    ///
    /// Each over-budget pass keeps only the newest half of the remaining
    /// history (integer division), so the loop finishes in at most
    /// ⌈log2(n)⌉ rebuilds. A single remaining history issue is sent even
    /// when over budget; at that point the provider's own limit is the
    /// arbiter.
    pub fn build_request(&mut self, counter: &TokenCounter, model: &str) -> ChatRequest {
        let ceiling = self.ceiling_override.unwrap_or_else(|| token_ceiling(model));

        let messages = loop {
            let messages = self.messages();
            if counter.count(&messages) <= ceiling || self.history.len() <= 1 {
                break messages;
            }
            let keep = self.history.len() / 2;
            let cut = self.history.len() - keep;
            self.history.drain(..cut);
        };

        ChatRequest {
            model: model.to_string(),
            messages,
            tools: vec![self.tool_definition()],
            // High determinism; logprobs reserved for confidence scoring.
            temperature: 0.0,
            logprobs: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn issue(number: i64, body: &str) -> Issue {
        Issue {
            id: number,
            number,
            title: format!("issue {number}"),
            body: body.to_string(),
            user: crate::github::User {
                login: "alice".to_string(),
            },
            author_association: "MEMBER".to_string(),
            labels: vec![Label {
                name: "bug".to_string(),
                description: String::new(),
            }],
            state: "open".to_string(),
            created_at: Utc.timestamp_opt(1_700_000_000 + number, 0).unwrap(),
            updated_at: Utc.timestamp_opt(1_700_000_000 + number, 0).unwrap(),
            pull_request: None,
            html_url: String::new(),
        }
    }

    fn context(history: Vec<Issue>) -> PromptContext {
        PromptContext {
            labels: vec![
                Label {
                    name: "bug".to_string(),
                    description: "Something is broken".to_string(),
                },
                Label {
                    name: "feature".to_string(),
                    description: String::new(),
                },
            ],
            history,
            target: issue(999, "the app crashes on startup"),
            sentinel: crate::sanitize::DISABLE_SENTINEL.to_string(),
            ceiling_override: None,
        }
    }

    #[test]
    fn test_clip_middle_keeps_prefix_and_suffix() {
        let body = format!("{}{}{}", "a".repeat(600), "b".repeat(600), "c".repeat(600));
        let clipped = clip_middle(&body, 500);
        assert!(clipped.starts_with(&"a".repeat(500)));
        assert!(clipped.ends_with(&"c".repeat(500)));
        assert!(clipped.contains("[...]"));

        let short = "short body";
        assert_eq!(clip_middle(short, 500), short);
    }

    #[test]
    fn test_clip_middle_respects_char_boundaries() {
        let body = "é".repeat(2000);
        let clipped = clip_middle(&body, 500);
        assert!(clipped.starts_with('é'));
        assert!(clipped.ends_with('é'));
    }

    #[test]
    fn test_records_are_wrapped_in_boundary_markers() {
        let mut ctx = context(vec![issue(1, "first"), issue(2, "second")]);
        let counter = TokenCounter::new().unwrap();
        let request = ctx.build_request(&counter, "gpt-4o");

        let history_msg = &request.messages[1].content;
        assert_eq!(history_msg.matches("<issue>").count(), 2);
        assert_eq!(history_msg.matches("</issue>").count(), 2);
        assert!(history_msg.contains("labels: bug"));

        // The target record carries no label annotation.
        let target_msg = &request.messages[2].content;
        assert!(!target_msg.contains("labels:"));
    }

    #[test]
    fn test_tool_schema_enumerates_label_names() {
        let mut ctx = context(vec![]);
        let counter = TokenCounter::new().unwrap();
        let request = ctx.build_request(&counter, "gpt-4o");

        assert_eq!(request.tools.len(), 1);
        let schema = &request.tools[0].parameters;
        assert_eq!(
            schema["properties"]["labels"]["items"]["enum"],
            serde_json::json!(["bug", "feature"])
        );
        assert!((request.temperature - 0.0).abs() < f32::EPSILON);
        assert!(request.logprobs);
    }

    #[test]
    fn test_prune_halves_history_until_within_budget() {
        // 20 history issues with fat bodies against a tiny ceiling.
        let history: Vec<Issue> = (1..=20).map(|n| issue(n, &"word ".repeat(200))).collect();
        let mut ctx = context(history);
        ctx.ceiling_override = Some(1_000);
        let counter = TokenCounter::new().unwrap();

        let request = ctx.build_request(&counter, "gpt-4o");

        // The survivor count must come from successive halving of 20.
        let halvings = [20, 10, 5, 2, 1];
        assert!(halvings.contains(&ctx.history.len()), "got {}", ctx.history.len());
        assert!(
            counter.count(&request.messages) <= 1_000 || ctx.history.len() == 1,
            "over budget with more than one history issue left"
        );
        // The newest issues survive pruning.
        assert_eq!(ctx.history.last().unwrap().number, 20);
    }

    #[test]
    fn test_prune_keeps_newest_half() {
        let history: Vec<Issue> = (1..=8).map(|n| issue(n, &"word ".repeat(500))).collect();
        let mut ctx = context(history);
        ctx.ceiling_override = Some(10);
        let counter = TokenCounter::new().unwrap();

        ctx.build_request(&counter, "gpt-4o");

        assert_eq!(ctx.history.len(), 1);
        assert_eq!(ctx.history[0].number, 8);
    }

    #[test]
    fn test_unrecognized_model_gets_largest_ceiling() {
        assert_eq!(token_ceiling("gpt-3.5-turbo"), 16_385);
        assert_eq!(token_ceiling("gpt-3.5-turbo-16k"), 16_385);
        assert_eq!(token_ceiling("gpt-4-turbo-preview"), 128_000);
        assert_eq!(token_ceiling("some-future-model"), 128_000);
    }
}
