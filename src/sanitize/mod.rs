// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

// Request/response content sanitization.
//
// Detects sensitive data in outgoing chat messages using classifier plugins
// (NER sidecar, local LLM), replaces each occurrence with a stable
// placeholder token, and restores the originals when the upstream response
// comes back.
//
//   let sanitizer = Sanitizer::new(classifiers);
//   let (body, tm) = sanitizer.redact_messages(&body).await;
//   // forward body upstream
//   let resp = tm.restore(&resp);

mod llm;
mod ner;
mod stream;

pub use llm::LlmClassifier;
pub use ner::NerClassifier;
pub use stream::restore_stream;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Spans and classifiers
// ---------------------------------------------------------------------------

/// A sensitive substring detected within a text.
///
/// `start` and `end` are byte offsets into the original UTF-8 text, with
/// `start < end` and both falling on code-point boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    /// Free-form tag, e.g. "PER", "ORG", "LLM".
    pub label: String,
    /// Confidence in [0, 1]; 1.0 for rule-based detectors.
    pub score: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("classifier request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("classifier returned malformed payload: {0}")]
    Decode(String),
}

/// Detects sensitive spans in a text. Implementations must be safe for
/// concurrent use; errors are advisory and contribute zero spans.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Vec<Span>, ClassifyError>;
}

// ---------------------------------------------------------------------------
// Token map
// ---------------------------------------------------------------------------

/// Process-wide token id counter. Monotone, never rolls back, so placeholders
/// are globally unique and cross-request collisions are impossible.
static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) const TOKEN_PREFIX: &str = "«TOKEN_";
pub(crate) const TOKEN_SUFFIX: &str = "»";

/// Matches our own «TOKEN_XXXXXX» markers so we never re-redact an
/// already-replaced placeholder.
static TOKEN_PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("«TOKEN_\\d+»").expect("placeholder pattern is valid"));

/// A single redacted value, exposed to the caller via the
/// X-Sanitize-Redactions response header for UI display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Redaction {
    /// e.g. «TOKEN_000001»
    pub token: String,
    /// The actual sensitive value.
    pub original: String,
}

/// Bidirectional original ↔ placeholder mapping for one request lifecycle.
///
/// Created when a request body arrives, consumed by the response path
/// (buffered or streaming), discarded when the response finishes. Never
/// shared across requests.
#[derive(Debug, Default)]
pub struct TokenMap {
    to_token: HashMap<String, String>,
    from_token: HashMap<String, String>,
}

impl TokenMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapping and return the placeholder token. Re-registering the
    /// same original returns the existing placeholder.
    pub fn register(&mut self, original: &str) -> String {
        if let Some(tok) = self.to_token.get(original) {
            return tok.clone();
        }
        let id = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        let tok = format!("{TOKEN_PREFIX}{id:06}{TOKEN_SUFFIX}");
        self.to_token.insert(original.to_string(), tok.clone());
        self.from_token.insert(tok.clone(), original.to_string());
        tok
    }

    /// Replace all placeholder tokens in `text` with their originals.
    /// Placeholders are mutually non-overlapping by construction, so the
    /// replacement order does not matter.
    pub fn restore(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (tok, orig) in &self.from_token {
            out = out.replace(tok.as_str(), orig);
        }
        out
    }

    /// Byte-level restoration, used by the streaming restorer where chunk
    /// boundaries may split UTF-8 code points.
    pub fn restore_bytes(&self, buf: &[u8]) -> Vec<u8> {
        let mut out = buf.to_vec();
        for (tok, orig) in &self.from_token {
            out = replace_all_bytes(&out, tok.as_bytes(), orig.as_bytes());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.to_token.is_empty()
    }

    /// Number of distinct values that were redacted.
    pub fn len(&self) -> usize {
        self.to_token.len()
    }

    /// All recorded replacements, ordered ascending by token.
    pub fn redactions(&self) -> Vec<Redaction> {
        let mut out: Vec<Redaction> = self
            .from_token
            .iter()
            .map(|(tok, orig)| Redaction {
                token: tok.clone(),
                original: orig.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.token.cmp(&b.token));
        out
    }
}

fn replace_all_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Span validation
// ---------------------------------------------------------------------------

/// Bytes that delimit tokens/words. A span whose neighbouring byte is not in
/// this set is a substring of a longer token and must not be redacted.
const WORD_BOUNDARY_BYTES: &[u8] = b" \t\n\r<>(),;[]{}\"'`";

pub(crate) fn is_word_boundary_byte(b: u8) -> bool {
    WORD_BOUNDARY_BYTES.contains(&b)
}

/// Filter out spans with invalid offsets, spans that cover one of our own
/// placeholders, and spans that land in the middle of a larger word
/// (partial classifier matches like `sd@x.com` inside `asd@x.com`).
fn valid_spans(text: &str, spans: Vec<Span>) -> Vec<Span> {
    spans
        .into_iter()
        .filter(|sp| {
            if sp.end > text.len() || sp.start >= sp.end {
                return false;
            }
            if !text.is_char_boundary(sp.start) || !text.is_char_boundary(sp.end) {
                return false;
            }
            if TOKEN_PLACEHOLDER_RE.is_match(&text[sp.start..sp.end]) {
                return false;
            }
            if sp.start > 0 && !is_word_boundary_byte(text.as_bytes()[sp.start - 1]) {
                return false;
            }
            if sp.end < text.len() && !is_word_boundary_byte(text.as_bytes()[sp.end]) {
                return false;
            }
            true
        })
        .collect()
}

/// Remove overlapping spans. Assumes the input is sorted descending by start,
/// so the previously kept span is always to the right.
fn deduplicate_spans(spans: Vec<Span>) -> Vec<Span> {
    let mut out: Vec<Span> = Vec::with_capacity(spans.len());
    for sp in spans {
        match out.last() {
            Some(last) if sp.end > last.start => continue,
            _ => out.push(sp),
        }
    }
    out
}

fn sort_spans_desc(spans: &mut [Span]) {
    spans.sort_by(|a, b| b.start.cmp(&a.start));
}

// ---------------------------------------------------------------------------
// Sanitizer
// ---------------------------------------------------------------------------

/// Maximum time to wait for all classifiers to finish. Classifiers that miss
/// the deadline are skipped; their tasks keep running in the background but
/// their results are discarded. Set high enough to cover a small LLM running
/// on CPU.
const CLASSIFIER_BUDGET: Duration = Duration::from_secs(120);

/// Top-level sanitizer, created once at startup. Owns its classifier slice
/// for the process lifetime.
pub struct Sanitizer {
    classifiers: Vec<Arc<dyn Classifier>>,
    budget: Duration,
}

impl Sanitizer {
    /// Create a Sanitizer with an ordered list of classifiers. The LLM
    /// classifier, when enabled, must be appended last: history messages
    /// skip the final classifier to avoid paying full LLM latency on turns
    /// that were already sanitised.
    pub fn new(classifiers: Vec<Arc<dyn Classifier>>) -> Self {
        Self {
            classifiers,
            budget: CLASSIFIER_BUDGET,
        }
    }

    /// Like [`Sanitizer::new`] with an explicit classifier budget.
    pub fn with_budget(classifiers: Vec<Arc<dyn Classifier>>, budget: Duration) -> Self {
        Self { classifiers, budget }
    }

    /// Run all Classify calls concurrently and merge results. Returns after
    /// all classifiers finish or the budget elapses, whichever is first.
    async fn run_classifiers(&self, text: &str, classifiers: &[Arc<dyn Classifier>]) -> Vec<Span> {
        if classifiers.is_empty() {
            return Vec::new();
        }

        let (tx, mut rx) = mpsc::channel::<Vec<Span>>(classifiers.len());
        for clf in classifiers {
            let clf = clf.clone();
            let text = text.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let spans = match clf.classify(&text).await {
                    Ok(spans) => spans,
                    Err(e) => {
                        tracing::warn!(error = %e, "sanitize: classifier error");
                        Vec::new()
                    }
                };
                let _ = tx.send(spans).await;
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.budget;
        let mut all = Vec::new();
        for _ in 0..classifiers.len() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(spans)) => all.extend(spans),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("sanitize: classifier budget exceeded, using partial results");
                    break;
                }
            }
        }
        all
    }

    /// Run the given classifiers on `original` and apply the detected spans
    /// as placeholder replacements. The walk is descending by start so
    /// earlier replacements do not shift later offsets.
    async fn redact_with(
        &self,
        original: &str,
        classifiers: &[Arc<dyn Classifier>],
        tm: &mut TokenMap,
    ) -> String {
        let spans = self.run_classifiers(original, classifiers).await;
        if spans.is_empty() {
            return original.to_string();
        }

        let mut spans = valid_spans(original, spans);
        sort_spans_desc(&mut spans);
        let spans = deduplicate_spans(spans);

        let mut text = original.to_string();
        for sp in spans {
            let matched = text[sp.start..sp.end].to_string();
            let tok = tm.register(&matched);
            tracing::debug!(label = %sp.label, token = %tok, "sanitize: redacted");
            text.replace_range(sp.start..sp.end, &tok);
        }
        text
    }

    /// Full pipeline: every configured classifier.
    async fn redact_text(&self, original: &str, tm: &mut TokenMap) -> String {
        let classifiers = self.classifiers.clone();
        self.redact_with(original, &classifiers, tm).await
    }

    /// History pipeline: everything except the LLM classifier (always last).
    async fn redact_text_history(&self, original: &str, tm: &mut TokenMap) -> String {
        let classifiers: Vec<Arc<dyn Classifier>> = if self.classifiers.len() > 1 {
            self.classifiers[..self.classifiers.len() - 1].to_vec()
        } else {
            Vec::new()
        };
        self.redact_with(original, &classifiers, tm).await
    }

    /// Parse the OpenAI-format JSON body and redact sensitive data.
    ///
    /// The last message with role `user` runs the full classifier pipeline;
    /// every other message runs the non-LLM classifiers only (history is
    /// assumed already sanitised on a prior turn). Both string `content` and
    /// multi-modal content arrays (parts carrying a `text` field) are
    /// supported. All other fields pass through verbatim.
    pub async fn redact_messages(&self, body: &[u8]) -> (Vec<u8>, TokenMap) {
        let mut tm = TokenMap::new();

        let mut req: serde_json::Map<String, serde_json::Value> =
            match serde_json::from_slice(body) {
                Ok(map) => map,
                Err(_) => {
                    // Not a JSON object: treat the whole body as text.
                    let text = String::from_utf8_lossy(body).into_owned();
                    let redacted = self.redact_text(&text, &mut tm).await;
                    return (redacted.into_bytes(), tm);
                }
            };

        let Some(messages) = req.get_mut("messages").and_then(|m| m.as_array_mut()) else {
            return (body.to_vec(), tm);
        };

        let last_user_idx = messages
            .iter()
            .rposition(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"));

        let mut changed = false;
        let count = messages.len();
        for (i, msg) in messages.iter_mut().enumerate() {
            let full_pipeline = Some(i) == last_user_idx;
            let Some(content) = msg.get_mut("content") else {
                continue;
            };

            match content {
                serde_json::Value::String(text) => {
                    let redacted = if full_pipeline {
                        self.redact_text(text, &mut tm).await
                    } else {
                        self.redact_text_history(text, &mut tm).await
                    };
                    if redacted != *text {
                        *text = redacted;
                        changed = true;
                    }
                }
                serde_json::Value::Array(parts) => {
                    for part in parts.iter_mut() {
                        let Some(serde_json::Value::String(text)) = part.get_mut("text") else {
                            continue;
                        };
                        let redacted = if full_pipeline {
                            self.redact_text(text, &mut tm).await
                        } else {
                            self.redact_text_history(text, &mut tm).await
                        };
                        if redacted != *text {
                            *text = redacted;
                            changed = true;
                        }
                    }
                }
                _ => {}
            }
        }

        if !changed {
            return (body.to_vec(), tm);
        }
        tracing::debug!(messages = count, redacted = tm.len(), "sanitize: body rewritten");

        match serde_json::to_vec(&req) {
            Ok(out) => (out, tm),
            Err(_) => (body.to_vec(), tm),
        }
    }

}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // Mock classifiers
    // -----------------------------------------------------------------------

    /// Flags every occurrence of a fixed needle, like the LLM classifier's
    /// verbatim matching but without the HTTP round-trip.
    struct NeedleClassifier {
        needle: String,
        label: String,
    }

    impl NeedleClassifier {
        fn new(needle: &str, label: &str) -> Arc<dyn Classifier> {
            Arc::new(Self {
                needle: needle.to_string(),
                label: label.to_string(),
            })
        }
    }

    #[async_trait]
    impl Classifier for NeedleClassifier {
        async fn classify(&self, text: &str) -> Result<Vec<Span>, ClassifyError> {
            let mut spans = Vec::new();
            let mut from = 0;
            while let Some(idx) = text[from..].find(&self.needle) {
                let start = from + idx;
                spans.push(Span {
                    start,
                    end: start + self.needle.len(),
                    label: self.label.clone(),
                    score: 1.0,
                });
                from = start + self.needle.len();
            }
            Ok(spans)
        }
    }

    /// Returns a fixed span list regardless of input.
    struct FixedClassifier(Vec<Span>);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _text: &str) -> Result<Vec<Span>, ClassifyError> {
            Ok(self.0.clone())
        }
    }

    /// Never finishes within any reasonable budget.
    struct HangingClassifier;

    #[async_trait]
    impl Classifier for HangingClassifier {
        async fn classify(&self, _text: &str) -> Result<Vec<Span>, ClassifyError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    /// Always errors.
    struct FailingClassifier;

    #[async_trait]
    impl Classifier for FailingClassifier {
        async fn classify(&self, _text: &str) -> Result<Vec<Span>, ClassifyError> {
            Err(ClassifyError::Decode("boom".to_string()))
        }
    }

    fn span(start: usize, end: usize) -> Span {
        Span {
            start,
            end,
            label: "TEST".to_string(),
            score: 1.0,
        }
    }

    // -----------------------------------------------------------------------
    // TokenMap
    // -----------------------------------------------------------------------

    #[test]
    fn register_is_stable_within_one_map() {
        let mut tm = TokenMap::new();
        let a = tm.register("sk-abc123");
        let b = tm.register("sk-abc123");
        assert_eq!(a, b);
        assert_eq!(tm.len(), 1);
    }

    #[test]
    fn distinct_originals_get_distinct_tokens() {
        let mut tm = TokenMap::new();
        let a = tm.register("alpha");
        let b = tm.register("beta");
        assert_ne!(a, b);
        assert_eq!(tm.len(), 2);
    }

    #[test]
    fn tokens_are_globally_unique_across_maps() {
        let mut first = TokenMap::new();
        let mut second = TokenMap::new();
        let a = first.register("same-value");
        let b = second.register("same-value");
        assert_ne!(a, b);
    }

    #[test]
    fn token_has_expected_wire_shape() {
        let mut tm = TokenMap::new();
        let tok = tm.register("value");
        assert!(TOKEN_PLACEHOLDER_RE.is_match(&tok), "unexpected token shape: {tok}");
        assert!(tok.starts_with(TOKEN_PREFIX));
        assert!(tok.ends_with(TOKEN_SUFFIX));
    }

    #[test]
    fn restore_replaces_all_occurrences() {
        let mut tm = TokenMap::new();
        let tok = tm.register("sk-abc123");
        let text = format!("the key {tok} is {tok}");
        assert_eq!(tm.restore(&text), "the key sk-abc123 is sk-abc123");
    }

    #[test]
    fn restore_bytes_matches_restore() {
        let mut tm = TokenMap::new();
        let tok = tm.register("héllo wörld");
        let text = format!("prefix {tok} suffix");
        assert_eq!(tm.restore_bytes(text.as_bytes()), tm.restore(&text).into_bytes());
    }

    #[test]
    fn redactions_are_sorted_by_token() {
        let mut tm = TokenMap::new();
        tm.register("zebra");
        tm.register("apple");
        tm.register("mango");
        let reds = tm.redactions();
        assert_eq!(reds.len(), 3);
        for pair in reds.windows(2) {
            assert!(pair[0].token < pair[1].token);
        }
    }

    #[test]
    fn replace_all_bytes_handles_adjacent_needles() {
        let out = replace_all_bytes(b"ababab", b"ab", b"X");
        assert_eq!(out, b"XXX");
    }

    // -----------------------------------------------------------------------
    // Span validation
    // -----------------------------------------------------------------------

    #[test]
    fn spans_outside_text_are_dropped() {
        let text = "short";
        let spans = valid_spans(text, vec![span(0, 99), span(3, 3), span(4, 2)]);
        assert!(spans.is_empty());
    }

    #[test]
    fn spans_off_char_boundary_are_dropped() {
        // 'é' is two bytes; offset 1 lands inside it.
        let text = "état secret";
        let spans = valid_spans(text, vec![span(1, 6)]);
        assert!(spans.is_empty());
    }

    #[test]
    fn spans_covering_placeholders_are_dropped() {
        let text = "value «TOKEN_000042» trailing";
        let spans = valid_spans(text, vec![span(0, text.len())]);
        assert!(spans.is_empty());
    }

    #[test]
    fn partial_word_matches_are_dropped() {
        // Classifier flagged "sd@x.com" inside "asd@x.com": preceding 'a' is
        // not a word boundary.
        let text = "mail asd@x.com here";
        let start = text.find("sd@x.com").unwrap();
        let spans = valid_spans(text, vec![span(start, start + "sd@x.com".len())]);
        assert!(spans.is_empty());
    }

    #[test]
    fn well_delimited_spans_survive() {
        let text = "key sk-abc123 (secret@example.com)";
        let k = text.find("sk-abc123").unwrap();
        let e = text.find("secret@example.com").unwrap();
        let spans = valid_spans(
            text,
            vec![span(k, k + "sk-abc123".len()), span(e, e + "secret@example.com".len())],
        );
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn overlapping_spans_deduplicated_keeping_rightmost() {
        let mut spans = vec![span(0, 10), span(5, 15), span(20, 25)];
        sort_spans_desc(&mut spans);
        let out = deduplicate_spans(spans);
        // Descending walk keeps (20,25) then (5,15); (0,10) overlaps (5,15).
        assert_eq!(out, vec![span(20, 25), span(5, 15)]);
    }

    #[test]
    fn touching_spans_are_both_kept() {
        let mut spans = vec![span(0, 5), span(5, 10)];
        sort_spans_desc(&mut spans);
        let out = deduplicate_spans(spans);
        assert_eq!(out.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Redaction
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn basic_redact_and_restore_roundtrip() {
        let sanitizer = Sanitizer::new(vec![NeedleClassifier::new("sk-abc123", "LLM")]);
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "my key is sk-abc123"}]
        });

        let (forwarded, tm) = sanitizer.redact_messages(&serde_json::to_vec(&body).unwrap()).await;
        let forwarded: serde_json::Value = serde_json::from_slice(&forwarded).unwrap();
        let content = forwarded["messages"][0]["content"].as_str().unwrap();
        assert!(!content.contains("sk-abc123"));
        assert!(content.starts_with("my key is «TOKEN_"));
        assert_eq!(tm.len(), 1);

        let tok = &tm.redactions()[0].token;
        let upstream_reply = format!("the key {tok} is valid");
        let restored = tm.restore(&upstream_reply);
        assert_eq!(restored, "the key sk-abc123 is valid");
    }

    #[tokio::test]
    async fn identical_values_share_one_placeholder() {
        let sanitizer = Sanitizer::new(vec![NeedleClassifier::new("sk-abc123", "LLM")]);
        let body = json!({
            "messages": [{"role": "user", "content": "sk-abc123 and again sk-abc123"}]
        });

        let (forwarded, tm) = sanitizer.redact_messages(&serde_json::to_vec(&body).unwrap()).await;
        assert_eq!(tm.len(), 1);
        let forwarded: serde_json::Value = serde_json::from_slice(&forwarded).unwrap();
        let content = forwarded["messages"][0]["content"].as_str().unwrap();
        let tok = &tm.redactions()[0].token;
        assert_eq!(content.matches(tok.as_str()).count(), 2);
    }

    #[tokio::test]
    async fn redaction_is_idempotent() {
        let sanitizer = Sanitizer::new(vec![NeedleClassifier::new("sk-abc123", "LLM")]);
        let body = json!({
            "messages": [{"role": "user", "content": "key sk-abc123"}]
        });

        let (first, tm1) = sanitizer.redact_messages(&serde_json::to_vec(&body).unwrap()).await;
        assert_eq!(tm1.len(), 1);
        let (_second, tm2) = sanitizer.redact_messages(&first).await;
        assert!(tm2.is_empty(), "placeholders must never be re-redacted");
    }

    #[tokio::test]
    async fn multibyte_text_redacts_on_rune_boundaries() {
        let sanitizer = Sanitizer::new(vec![NeedleClassifier::new("Иван Иванов", "LLM")]);
        let body = json!({
            "messages": [{"role": "user", "content": "контакт: Иван Иванов (менеджер)"}]
        });

        let (forwarded, tm) = sanitizer.redact_messages(&serde_json::to_vec(&body).unwrap()).await;
        assert_eq!(tm.len(), 1);
        let forwarded: serde_json::Value = serde_json::from_slice(&forwarded).unwrap();
        let content = forwarded["messages"][0]["content"].as_str().unwrap();
        assert!(!content.contains("Иван"));
        assert!(content.contains("контакт:"));
        assert_eq!(tm.restore(content), "контакт: Иван Иванов (менеджер)");
    }

    #[tokio::test]
    async fn history_messages_skip_the_last_classifier() {
        // First classifier flags "alpha", second (the "LLM") flags "beta".
        let sanitizer = Sanitizer::new(vec![
            NeedleClassifier::new("alpha", "NER"),
            NeedleClassifier::new("beta", "LLM"),
        ]);
        let body = json!({
            "messages": [
                {"role": "user", "content": "history alpha beta"},
                {"role": "assistant", "content": "reply alpha beta"},
                {"role": "user", "content": "current alpha beta"}
            ]
        });

        let (forwarded, _tm) = sanitizer.redact_messages(&serde_json::to_vec(&body).unwrap()).await;
        let forwarded: serde_json::Value = serde_json::from_slice(&forwarded).unwrap();

        let history = forwarded["messages"][0]["content"].as_str().unwrap();
        assert!(!history.contains("alpha"));
        assert!(history.contains("beta"), "history must not run the LLM classifier");

        let reply = forwarded["messages"][1]["content"].as_str().unwrap();
        assert!(!reply.contains("alpha"));
        assert!(reply.contains("beta"));

        let current = forwarded["messages"][2]["content"].as_str().unwrap();
        assert!(!current.contains("alpha"));
        assert!(!current.contains("beta"), "last user message runs the full pipeline");
    }

    #[tokio::test]
    async fn multimodal_content_parts_are_redacted() {
        let sanitizer = Sanitizer::new(vec![NeedleClassifier::new("sk-abc123", "LLM")]);
        let body = json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "my key sk-abc123"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
                ]
            }]
        });

        let (forwarded, tm) = sanitizer.redact_messages(&serde_json::to_vec(&body).unwrap()).await;
        assert_eq!(tm.len(), 1);
        let forwarded: serde_json::Value = serde_json::from_slice(&forwarded).unwrap();
        let text = forwarded["messages"][0]["content"][0]["text"].as_str().unwrap();
        assert!(!text.contains("sk-abc123"));
        // Non-text parts pass through verbatim.
        assert_eq!(
            forwarded["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
    }

    #[tokio::test]
    async fn unknown_fields_pass_through_verbatim() {
        let sanitizer = Sanitizer::new(vec![NeedleClassifier::new("secret-value", "LLM")]);
        let body = json!({
            "model": "m",
            "temperature": 0.7,
            "custom_vendor_field": {"nested": [1, 2, 3]},
            "messages": [{"role": "user", "content": "the secret-value here"}]
        });

        let (forwarded, _tm) = sanitizer.redact_messages(&serde_json::to_vec(&body).unwrap()).await;
        let forwarded: serde_json::Value = serde_json::from_slice(&forwarded).unwrap();
        assert_eq!(forwarded["temperature"], 0.7);
        assert_eq!(forwarded["custom_vendor_field"]["nested"][2], 3);
    }

    #[tokio::test]
    async fn body_without_messages_is_untouched() {
        let sanitizer = Sanitizer::new(vec![NeedleClassifier::new("secret", "LLM")]);
        let body = br#"{"prompt": "a secret here"}"#;
        let (forwarded, tm) = sanitizer.redact_messages(body).await;
        assert_eq!(forwarded, body.to_vec());
        assert!(tm.is_empty());
    }

    #[tokio::test]
    async fn failing_classifier_contributes_zero_spans() {
        let sanitizer = Sanitizer::new(vec![
            Arc::new(FailingClassifier) as Arc<dyn Classifier>,
            NeedleClassifier::new("sk-abc123", "LLM"),
        ]);
        let body = json!({
            "messages": [{"role": "user", "content": "key sk-abc123"}]
        });

        let (_forwarded, tm) = sanitizer.redact_messages(&serde_json::to_vec(&body).unwrap()).await;
        assert_eq!(tm.len(), 1, "other classifiers still apply");
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_classifier_is_cut_off_at_the_budget() {
        let fixed = vec![span(4, 13)]; // "sk-abc123" in "key sk-abc123"
        let sanitizer = Sanitizer::with_budget(
            vec![
                Arc::new(FixedClassifier(fixed)) as Arc<dyn Classifier>,
                Arc::new(HangingClassifier) as Arc<dyn Classifier>,
            ],
            Duration::from_secs(120),
        );
        let body = json!({
            "messages": [{"role": "user", "content": "key sk-abc123"}]
        });

        // With the paused clock this returns as soon as the budget elapses
        // virtually; the fast classifier's spans are kept.
        let (forwarded, tm) = sanitizer.redact_messages(&serde_json::to_vec(&body).unwrap()).await;
        assert_eq!(tm.len(), 1);
        let forwarded: serde_json::Value = serde_json::from_slice(&forwarded).unwrap();
        assert!(!forwarded["messages"][0]["content"].as_str().unwrap().contains("sk-abc123"));
    }

    #[tokio::test]
    async fn applied_spans_are_pairwise_disjoint() {
        // Two classifiers produce overlapping spans over the same region.
        let text = "leak sk-abc123xyz done";
        let a = text.find("sk-abc123xyz").unwrap();
        let sanitizer = Sanitizer::new(vec![
            Arc::new(FixedClassifier(vec![span(a, a + 12)])) as Arc<dyn Classifier>,
            Arc::new(FixedClassifier(vec![span(a, a + 12), span(0, 4 + 1 + 12)])) as Arc<dyn Classifier>,
        ]);
        let body = json!({"messages": [{"role": "user", "content": text}]});

        let (forwarded, tm) = sanitizer.redact_messages(&serde_json::to_vec(&body).unwrap()).await;
        let forwarded: serde_json::Value = serde_json::from_slice(&forwarded).unwrap();
        let content = forwarded["messages"][0]["content"].as_str().unwrap();
        // Exactly one replacement applied and it restores cleanly.
        assert_eq!(tm.len(), 1);
        assert_eq!(tm.restore(content), text);
    }
}
