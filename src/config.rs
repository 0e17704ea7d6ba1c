// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

// Environment-driven configuration.
//
// Everything is read from environment variables (with an optional .env file
// loaded by main). Wallet credentials come from GONKA_WALLETS (multi) or
// GONKA_PRIVATE_KEY / GONKA_ADDRESS (single, backward compat).

use std::env;

/// Credentials for a single wallet.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletCfg {
    /// Hex secp256k1 private key, with or without 0x prefix.
    pub private_key: String,
    /// Bech32 requester address; may be empty.
    pub address: String,
}

/// All runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub wallets: Vec<WalletCfg>,

    /// Bare source node URL used to discover active participants,
    /// e.g. `http://node2.gonka.ai:8000`.
    pub source_url: String,

    /// Rewrite tool-call requests into plain prompts and parse JSON back.
    pub simulate_tool_calls: bool,

    pub sanitize_enabled: bool,

    pub sanitize_ner: bool,
    pub sanitize_ner_url: String,

    pub sanitize_llm: bool,
    pub sanitize_llm_url: String,
    pub sanitize_llm_model: String,
    pub sanitize_llm_threshold: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("either GONKA_WALLETS or GONKA_PRIVATE_KEY must be set")]
    NoWallets,

    #[error("wallet entry {0} has empty private key")]
    EmptyWalletKey(usize),

    #[error("GONKA_WALLETS is set but contains no valid entries")]
    NoValidWallets,
}

fn env_trimmed(key: &str) -> String {
    env::var(key).unwrap_or_default().trim().to_string()
}

fn env_bool(key: &str) -> bool {
    let raw = env_trimmed(key);
    raw == "1" || raw.eq_ignore_ascii_case("true")
}

/// Load configuration from the process environment.
pub fn load() -> Result<Config, ConfigError> {
    let wallets = load_wallets()?;

    // Prefer GONKA_SOURCE_URL, fall back to GONKA_ENDPOINT (strip the /v1
    // suffix so we are left with a bare node URL).
    let mut source_url = env_trimmed("GONKA_SOURCE_URL");
    if source_url.is_empty() {
        source_url = env_trimmed("GONKA_ENDPOINT");
    }
    if source_url.is_empty() {
        source_url = "http://node2.gonka.ai:8000".to_string();
    }
    let source_url = source_url
        .trim_end_matches('/')
        .trim_end_matches("/v1")
        .to_string();

    let sanitize_ner_url = non_empty_or(env_trimmed("SANITIZE_NER_URL"), "http://sanitize-ner:8001");
    let sanitize_llm_url = non_empty_or(env_trimmed("SANITIZE_LLM_URL"), "http://ollama:11434");
    let sanitize_llm_model = non_empty_or(env_trimmed("SANITIZE_LLM_MODEL"), "qwen2.5:0.5b");
    let sanitize_llm_threshold = env_trimmed("SANITIZE_LLM_THRESHOLD")
        .parse::<f32>()
        .unwrap_or(0.0);

    Ok(Config {
        wallets,
        source_url,
        simulate_tool_calls: env_bool("SIMULATE_TOOL_CALLS"),
        sanitize_enabled: env_bool("SANITIZE"),
        sanitize_ner: env_bool("SANITIZE_NER"),
        sanitize_ner_url,
        sanitize_llm: env_bool("SANITIZE_LLM"),
        sanitize_llm_url,
        sanitize_llm_model,
        sanitize_llm_threshold,
    })
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn load_wallets() -> Result<Vec<WalletCfg>, ConfigError> {
    let multi = env_trimmed("GONKA_WALLETS");
    if !multi.is_empty() {
        return parse_multi_wallets(&multi);
    }

    let pk = env_trimmed("GONKA_PRIVATE_KEY");
    if pk.is_empty() {
        return Err(ConfigError::NoWallets);
    }
    Ok(vec![WalletCfg {
        private_key: pk,
        address: env_trimmed("GONKA_ADDRESS"),
    }])
}

/// Parse `key1:addr1,key2:addr2,key3` into wallet entries. The address part
/// is optional; keys may carry a 0x prefix but never contain colons, so we
/// split on the first colon only.
fn parse_multi_wallets(raw: &str) -> Result<Vec<WalletCfg>, ConfigError> {
    let mut wallets = Vec::new();
    for (i, part) in raw.split(',').enumerate() {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (pk, addr) = match part.find(':') {
            Some(idx) => (part[..idx].trim(), part[idx + 1..].trim()),
            None => (part, ""),
        };
        if pk.is_empty() {
            return Err(ConfigError::EmptyWalletKey(i + 1));
        }
        wallets.push(WalletCfg {
            private_key: pk.to_string(),
            address: addr.to_string(),
        });
    }
    if wallets.is_empty() {
        return Err(ConfigError::NoValidWallets);
    }
    Ok(wallets)
}
