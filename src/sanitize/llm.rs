// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

// Classifier backed by a local OpenAI-compatible LLM (e.g. Ollama with a
// small Qwen), catching sensitive values NER cannot -- API keys, passwords,
// credentials.
//
// The model is asked to return the sensitive strings verbatim rather than
// byte offsets, because small models get offsets wrong. We locate all
// occurrences in the original text ourselves, byte-exactly.

use super::{is_word_boundary_byte, Classifier, ClassifyError, Span, TOKEN_PREFIX};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SYSTEM_PROMPT: &str = r#"Extract sensitive data from the text. Return a JSON array of exact strings that are sensitive. Return [] if nothing sensitive found.

Sensitive data includes:
- API keys and tokens: strings starting with sk-, pk-, ghp_, Bearer, or any alphanumeric string that looks like a credential (e.g. sk123123123, sk-abc123, ghp_xyz789)
- Passwords and secrets mentioned explicitly
- Email addresses (e.g. user@example.com)
- Phone numbers (e.g. +79997899900, 8-800-555-35-35)
- Full person names with first+last (e.g. John Smith, Иван Иванов, Виктор Александрович)
- Credit card numbers, IBANs, bank account numbers
- Private keys (long hex or base64 strings)

Do NOT flag: «TOKEN_» placeholders, city names alone, common words, dates, regular numbers.

Return ONLY a valid JSON array of the exact sensitive strings. No explanation.

Examples:
Input: "my api key is sk-abc123xyz789"
Output: ["sk-abc123xyz789"]

Input: "call me at +79997899900, John Smith"
Output: ["+79997899900", "John Smith"]

Input: "ключ апи sk123123123"
Output: ["sk123123123"]

Input: "how are you?"
Output: []"#;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(125);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Calls a local LLM to detect semantically sensitive values.
pub struct LlmClassifier {
    url: String,
    model: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    /// Hint to disable chain-of-thought thinking (Qwen3 and some others
    /// support this). strip_think_block handles models that ignore it.
    think: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    /// Qwen3 via Ollama.
    #[serde(default)]
    reasoning: Option<String>,
    /// Qwen3 direct API.
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl LlmClassifier {
    /// `base_url` is any OpenAI-compatible server, e.g. `http://ollama:11434`.
    /// `threshold` is not used currently but kept for interface compatibility.
    pub fn new(base_url: &str, model: &str, _threshold: f32) -> Self {
        Self {
            url: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            http: reqwest::Client::builder()
                .timeout(CLIENT_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, text: &str) -> Result<Vec<Span>, ClassifyError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(url = %self.url, model = %self.model, text_len = text.len(), "llmclassifier: classifying");

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                // /no_think is Qwen3's control token to skip thinking and go
                // straight to the answer.
                ChatMessage {
                    role: "user",
                    content: format!("Text to classify:\n{text}\n/no_think"),
                },
            ],
            temperature: 0.0,
            max_tokens: 10_000,
            think: false,
        };

        let resp = match self
            .http
            .post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(error = %e, "llmclassifier: LLM unreachable, skipping");
                return Ok(Vec::new());
            }
        };

        if !resp.status().is_success() {
            tracing::warn!(code = %resp.status(), "llmclassifier: unexpected status");
            return Ok(Vec::new());
        }

        let parsed: ChatResponse = match resp.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "llmclassifier: decode response");
                return Ok(Vec::new());
            }
        };

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Ok(Vec::new());
        };
        if choice.finish_reason.as_deref() == Some("length") {
            tracing::warn!("llmclassifier: response truncated by token limit");
        }

        // Qwen3 via Ollama puts thinking in "reasoning" and the answer in
        // "content". If content is empty the model ran out of tokens before
        // answering; fall back to the reasoning fields and dig the JSON
        // array out of them.
        let msg = choice.message;
        let raw = [msg.content, msg.reasoning, msg.reasoning_content]
            .into_iter()
            .flatten()
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
            .unwrap_or_default();

        let content = strip_think_block(&raw);
        let content = strip_code_fence(&content);
        // Last resort: pull the JSON array out of wherever it is in the text.
        let content = if content.starts_with('[') {
            content
        } else {
            extract_json_array(&content)
        };

        let values: Vec<String> = match serde_json::from_str(&content) {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(content = %content, error = %e, "llmclassifier: could not parse LLM output");
                return Ok(Vec::new());
            }
        };

        let spans = spans_for_values(text, &values);
        if !spans.is_empty() {
            tracing::debug!(count = spans.len(), values = values.len(), "llmclassifier: detected sensitive spans");
        }
        Ok(spans)
    }
}

/// Find every word-delimited occurrence of each returned value in the
/// original text.
fn spans_for_values(text: &str, values: &[String]) -> Vec<Span> {
    let mut spans = Vec::new();
    for val in values {
        let val = val.trim();
        if val.is_empty() || val.starts_with(TOKEN_PREFIX) {
            continue;
        }
        let mut from = 0;
        while let Some(idx) = text[from..].find(val) {
            let start = from + idx;
            let end = start + val.len();
            if is_inside_token(text, start, end) {
                from = end;
                continue;
            }
            spans.push(Span {
                start,
                end,
                label: "LLM".to_string(),
                score: 1.0,
            });
            from = end;
        }
    }
    spans
}

/// Whether span [start, end) sits inside a larger word. For example
/// "sd@yandex.ru" inside "asd@yandex.ru".
fn is_inside_token(text: &str, start: usize, end: usize) -> bool {
    let bytes = text.as_bytes();
    if start > 0 && !is_word_boundary_byte(bytes[start - 1]) {
        return true;
    }
    if end < bytes.len() && !is_word_boundary_byte(bytes[end]) {
        return true;
    }
    false
}

/// Remove Qwen3's <think>...</think> block that appears before the actual
/// answer when thinking mode is active. An unclosed block drops everything
/// from the tag onwards.
fn strip_think_block(s: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";
    let Some(start) = s.find(OPEN) else {
        return s.to_string();
    };
    match s.find(CLOSE) {
        Some(end) => format!("{}{}", &s[..start], &s[end + CLOSE.len()..])
            .trim()
            .to_string(),
        None => s[..start].trim().to_string(),
    }
}

/// Remove ```json ... ``` or ``` ... ``` wrappers.
fn strip_code_fence(s: &str) -> String {
    let mut s = s.trim();
    if s.starts_with("```") {
        if let Some(idx) = s.find('\n') {
            s = &s[idx + 1..];
        }
        if let Some(idx) = s.rfind("```") {
            s = &s[..idx];
        }
        s = s.trim();
    }
    s.to_string()
}

/// Find the first [...] substring in `s`, or `s` unchanged.
fn extract_json_array(s: &str) -> String {
    let Some(start) = s.find('[') else {
        return s.to_string();
    };
    match s.rfind(']') {
        Some(end) if end > start => s[start..=end].to_string(),
        _ => s.to_string(),
    }
}
