// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

// Classifier backed by the sanitize-ner Python sidecar. If the sidecar is
// unreachable, it logs a warning and returns no spans so the rest of the
// sanitization pipeline can still run.

use super::{Classifier, ClassifyError, Span};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Calls the NER sidecar's POST /classify endpoint.
pub struct NerClassifier {
    url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    spans: Vec<NerSpan>,
}

#[derive(Deserialize)]
struct NerSpan {
    start: usize,
    end: usize,
    label: String,
}

impl NerClassifier {
    /// `base_url` points at the sidecar, e.g. `http://sanitize-ner:8001`.
    pub fn new(base_url: &str) -> Self {
        Self {
            url: format!("{}/classify", base_url.trim_end_matches('/')),
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Classifier for NerClassifier {
    async fn classify(&self, text: &str) -> Result<Vec<Span>, ClassifyError> {
        let resp = match self
            .http
            .post(&self.url)
            .json(&ClassifyRequest { text })
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(error = %e, "sanitize-ner: sidecar unreachable, skipping NER layer");
                return Ok(Vec::new());
            }
        };

        if !resp.status().is_success() {
            tracing::warn!(code = %resp.status(), "sanitize-ner: unexpected status");
            return Ok(Vec::new());
        }

        let result: ClassifyResponse = resp
            .json()
            .await
            .map_err(|e| ClassifyError::Decode(e.to_string()))?;

        Ok(result
            .spans
            .into_iter()
            .map(|s| Span {
                start: s.start,
                end: s.end,
                label: s.label,
                score: 1.0,
            })
            .collect())
    }
}
