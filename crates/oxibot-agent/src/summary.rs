//! Conversation history summarization — dual-threshold compression.
//!
//! Port of nanobot's `agent/summary.py`. When a session's history grows past
//! a trigger threshold (T2), everything older than a retain threshold (T1,
//! measured from the tail) is replaced with a single `[AutoSummary]` message
//! generated by an LLM call, so long-running conversations stay within the
//! model's context window without losing the gist of what came before.
//!
//! ```text
//! Original: [system] [msg1] [msg2] ... [msgN-10] ... [msgN-1] [msgN]
//!                       ↓ Compress segment    ↓ Retain tail
//! Result:   [system] [AutoSummary] [msgN-10] ... [msgN-1] [msgN]
//! ```

use std::sync::Arc;

use oxibot_core::types::{ContentPart, Message, MessageContent};
use oxibot_providers::{LlmProvider, LlmRequestConfig};
use regex::Regex;
use tracing::{debug, error};

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a conversation summarization assistant. Preserve facts, people/entities, \
     constraints, and unfinished items.";

/// Summarizes conversation history using a configured LLM provider.
///
/// Stateless and pure beyond holding the provider handle: callers (namely
/// `ContextBuilder`) own any concurrency guard around invoking it.
pub struct Summarizer {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Estimate token count: ASCII ~4 chars/token, non-ASCII ~1 char/token.
    pub fn estimate_tokens(s: &str) -> usize {
        if s.is_empty() {
            return 0;
        }
        let ascii_chars = s.chars().filter(|c| (*c as u32) < 128).count();
        let non_ascii = s.chars().count() - ascii_chars;
        (ascii_chars / 4 + non_ascii).max(1)
    }

    /// Ensure T2 > T1; if not, widen T2 to T1 + 200.
    pub fn calculate_thresholds(t1: usize, t2: usize) -> (usize, usize) {
        if t2 <= t1 {
            (t1, t1 + 200)
        } else {
            (t1, t2)
        }
    }

    /// Sum of `estimate_tokens` over cleaned, non-tool message content.
    pub fn should_summarize(history: &[Message], t1: usize, t2: usize) -> bool {
        let (t1, t2) = Self::calculate_thresholds(t1, t2);
        let total: usize = history
            .iter()
            .filter_map(|m| clean_message_content(m, false))
            .map(|c| Self::estimate_tokens(&c))
            .sum();
        debug!(total, t1, t2, "summary token check");
        total > t2
    }

    /// Generate a summary of `messages` via the configured LLM provider.
    ///
    /// Returns `Some("")` when there is no content worth summarizing, and
    /// `None` if the LLM call fails or returns nothing usable.
    pub async fn summarize(
        &self,
        messages: &[Message],
        prompt: &str,
        target_length: u32,
        budget_tokens: Option<u32>,
    ) -> Option<String> {
        let source_text = build_summary_source(messages);
        if source_text.trim().is_empty() {
            return Some(String::new());
        }

        let budget = budget_tokens.unwrap_or(target_length).max(50);
        let user_prompt = format!(
            "{prompt}\n\nTarget length (approx. tokens) \u{2264} {budget}.\n\n\
             Summarize the following conversation:\n\n{source_text}"
        );

        debug!(
            chars = source_text.len(),
            tokens = Self::estimate_tokens(&source_text),
            budget,
            "summary input"
        );

        let req = vec![
            Message::system(SUMMARY_SYSTEM_PROMPT),
            Message::user(user_prompt),
        ];
        let config = LlmRequestConfig {
            max_tokens: target_length,
            temperature: 0.3,
        };

        let response = self
            .provider
            .chat(&req, None, &self.model, &config)
            .await;

        let code_block = Regex::new(r"(?ms)```[\s\S]*?```").expect("valid regex");
        let summary = response
            .content
            .map(|c| code_block.replace_all(&c, "").trim().to_string())
            .unwrap_or_default();

        if summary.is_empty() {
            error!("summary generation produced empty output");
            return None;
        }

        debug!(
            chars = summary.len(),
            tokens = Self::estimate_tokens(&summary),
            "summary output"
        );
        Some(summary)
    }

    /// Replace history with `[AutoSummary]` + preserved tail.
    pub fn apply_summary(history: &[Message], summary: &str, t1: usize) -> Vec<Message> {
        let tail = preserved_tail_indices(history, t1);
        let mut new_history = vec![Message::assistant(format!("[AutoSummary]\n{summary}"))];
        new_history.extend(tail.into_iter().map(|i| history[i].clone()));
        new_history
    }

    /// Fallback: retain only the tail, no synthetic summary message.
    pub fn truncate_to_tail(history: &[Message], t1: usize) -> Vec<Message> {
        preserved_tail_indices(history, t1)
            .into_iter()
            .map(|i| history[i].clone())
            .collect()
    }

    /// Single entry point for `ContextBuilder`: summarize `history` in place
    /// if it exceeds the trigger threshold, falling back to tail-truncation
    /// if the LLM call fails. Returns `history` unchanged if no compression
    /// is needed.
    pub async fn maybe_summarize(
        &self,
        history: &[Message],
        t1: usize,
        t2: usize,
        prompt: &str,
        target_length: u32,
    ) -> Vec<Message> {
        let (t1, t2) = Self::calculate_thresholds(t1, t2);
        if !Self::should_summarize(history, t1, t2) {
            return history.to_vec();
        }

        match self.summarize(history, prompt, target_length, None).await {
            Some(summary) if !summary.is_empty() => {
                let new_history = Self::apply_summary(history, &summary, t1);
                debug!(
                    from = history.len(),
                    to = new_history.len(),
                    "compressed history"
                );
                new_history
            }
            _ => {
                tracing::warn!("summary generation failed, falling back to truncation");
                Self::truncate_to_tail(history, t1)
            }
        }
    }
}

// ─────────────────────────────────────────────
// Content cleaning
// ─────────────────────────────────────────────

fn flatten_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(s) => s.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.clone()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Clean a message's content for token-counting or tail-preservation.
///
/// Returns `None` when the message should be ignored entirely: `tool`
/// messages always, `system` messages when `for_tail` (but kept for the
/// summary source).
fn clean_message_content(msg: &Message, for_tail: bool) -> Option<String> {
    match msg {
        Message::Tool { .. } => None,
        Message::System { content } => {
            if for_tail {
                None
            } else if content.is_empty() {
                None
            } else {
                Some(content.clone())
            }
        }
        Message::User { content } => {
            let flat = flatten_content(content);
            if flat.is_empty() {
                None
            } else {
                Some(clean_text(&flat))
            }
        }
        Message::Assistant { content, .. } => {
            let flat = content.clone().unwrap_or_default();
            if flat.is_empty() {
                None
            } else {
                Some(clean_text(&flat))
            }
        }
    }
}

fn clean_text(text: &str) -> String {
    remove_tool_traces(&remove_json_blocks(text))
}

fn remove_json_blocks(text: &str) -> String {
    if text.is_empty() {
        return text.to_string();
    }

    let fenced_labeled = Regex::new(r"(?mis)```(?:json|JSON)?\s*[\r\n]+[\s\S]*?```").unwrap();
    let fenced_any = Regex::new(r"(?mis)```[\s\S]{40,}?```").unwrap();
    let mut out = fenced_labeled.replace_all(text, "").to_string();
    out = fenced_any.replace_all(&out, "").to_string();

    let brace_block = Regex::new(r"(?ms)^\s*\{[\s\S]{30,}?\}\s*$").unwrap();
    let bracket_block = Regex::new(r"(?ms)^\s*\[[\s\S]{30,}?\]\s*$").unwrap();

    out = strip_if_json_block(&brace_block, &out);
    out = strip_if_json_block(&bracket_block, &out);
    out
}

fn strip_if_json_block(re: &Regex, text: &str) -> String {
    re.replace_all(text, |caps: &regex::Captures| {
        let block = &caps[0];
        if block.len() >= 80 && (count_char(block, ':') >= 2 || count_char(block, '"') >= 4) {
            String::new()
        } else {
            block.to_string()
        }
    })
    .to_string()
}

fn count_char(s: &str, c: char) -> usize {
    s.chars().filter(|&x| x == c).count()
}

const TOOL_TRACE_PATTERN_SOURCES: &[&str] = &[
    r#"(?i)^\s*"?tool_calls"?\s*:"#,
    r#"(?i)^\s*"?tool_call_id"?\s*:"#,
    r#"(?i)^\s*"?function"?\s*:"#,
    r#"(?i)^\s*"?type"?\s*:\s*"?function"?"#,
    r#"(?i)^\s*"id"\s*:\s*"?call_[\w-]+"?"#,
];

fn remove_tool_traces(text: &str) -> String {
    if text.is_empty() {
        return text.to_string();
    }
    let patterns: Vec<Regex> = TOOL_TRACE_PATTERN_SOURCES
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect();

    let filtered: Vec<&str> = text
        .lines()
        .filter(|line| !patterns.iter().any(|p| p.is_match(line)))
        .collect();

    let cleaned = filtered.join("\n");
    let residual_json = Regex::new(r"(?ms)^\s*\{[\s\S]{80,}?\}\s*$").unwrap();
    residual_json.replace_all(&cleaned, "").to_string()
}

/// Build the `"role: content"` source text passed to the LLM for summarization.
fn build_summary_source(messages: &[Message]) -> String {
    let mut parts = Vec::new();
    for msg in messages {
        let (role, raw) = match msg {
            Message::Tool { .. } => continue,
            Message::System { content } => ("system", content.clone()),
            Message::User { content } => ("user", flatten_content(content)),
            Message::Assistant { content, .. } => ("assistant", content.clone().unwrap_or_default()),
        };
        if raw.is_empty() {
            continue;
        }
        let cleaned = if role == "user" || role == "assistant" {
            clean_text(&raw)
        } else {
            raw
        };
        if !cleaned.is_empty() {
            parts.push(format!("{role}: {cleaned}"));
        }
    }
    parts.join("\n").trim().to_string()
}

/// Walk `history` newest→oldest, accumulating cleaned-tail token estimates
/// until adding the next message would exceed `t1`. Returns the surviving
/// indices in ascending (original) order.
fn preserved_tail_indices(history: &[Message], t1: usize) -> Vec<usize> {
    let mut tail_tokens = 0usize;
    let mut preserved = Vec::new();

    for i in (0..history.len()).rev() {
        let content = match clean_message_content(&history[i], true) {
            Some(c) => c,
            None => continue,
        };
        let msg_len = Summarizer::estimate_tokens(&content);
        if tail_tokens + msg_len > t1 {
            break;
        }
        tail_tokens += msg_len;
        preserved.push(i);
    }

    preserved.reverse();
    preserved
}
