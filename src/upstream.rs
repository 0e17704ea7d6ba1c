// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

// Upstream dispatcher.
//
// Talks to the Gonka network with signed requests: discovers active
// endpoints from the participant list, routes each request to a random
// whitelisted endpoint, and signs with the next wallet from the pool.
// Transport failures retry on a different endpoint (up to 3 attempts);
// HTTP error statuses are returned to the caller verbatim.

use crate::wallet::{Wallet, WalletPool};
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder};
use rand::Rng;
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Read as _;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A Gonka network node with its transfer address. The address doubles as
/// the signing salt and the retry-exclusion key.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    /// e.g. http://node2.gonka.ai:8000/v1
    pub url: String,
    /// bech32 address of this host.
    pub address: String,
}

/// Whitelist of nodes that support the Transfer Agent feature (v0.2.9+).
/// Only these endpoints can be used for proxied inference requests.
const ALLOWED_TRANSFER_AGENTS: &[&str] = &[
    "gonka1y2a9p56kv044327uycmqdexl7zs82fs5ryv5le",
    "gonka1dkl4mah5erqggvhqkpc8j3qs5tyuetgdy552cp",
    "gonka1kx9mca3xm8u8ypzfuhmxey66u0ufxhs7nm6wc5",
    "gonka1ddswmmmn38esxegjf6qw36mt4aqyw6etvysy5x",
    "gonka10fynmy2npvdvew0vj2288gz8ljfvmjs35lat8n",
    "gonka1v8gk5z7gcv72447yfcd2y8g78qk05yc4f3nk4w",
    "gonka1gndhek2h2y5849wf6tmw6gnw9qn4vysgljed0u",
];

const MAX_ATTEMPTS: usize = 3;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const BUFFERED_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("discover: {0}")]
    Discovery(String),

    #[error("discover: no whitelisted transfer-agent endpoints found in active participants")]
    NoWhitelistedEndpoints,

    #[error("no endpoints available")]
    NoEndpoints,

    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("upstream {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode: {0}")]
    Decode(String),

    #[error(transparent)]
    Signer(#[from] crate::signer::SignerError),
}

/// Signed HTTP client for the upstream network.
pub struct Client {
    source_url: String,
    pool: WalletPool,
    endpoints: RwLock<Vec<Endpoint>>,
    /// Buffered calls: bounded total request time.
    http: reqwest::Client,
    /// Streaming calls: no response timeout, connection timeout only.
    stream_http: reqwest::Client,
}

#[derive(Deserialize)]
struct ParticipantsResponse {
    #[serde(default)]
    active_participants: ActiveParticipants,
}

#[derive(Deserialize, Default)]
struct ActiveParticipants {
    #[serde(default)]
    participants: Vec<Participant>,
}

#[derive(Deserialize)]
struct Participant {
    #[serde(default)]
    index: String,
    #[serde(default)]
    inference_url: String,
}

#[derive(Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    models: Vec<serde_json::Value>,
}

/// Per-attempt send failure. Signer errors abort the retry loop; transport
/// errors move on to the next endpoint.
#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error(transparent)]
    Signer(#[from] crate::signer::SignerError),

    #[error("{0}")]
    Transport(#[from] reqwest::Error),
}

impl Client {
    /// `source_url` is a bare node URL (e.g. http://node2.gonka.ai:8000)
    /// used to discover the participant list.
    pub fn new(source_url: &str, pool: WalletPool) -> Self {
        Self {
            source_url: source_url.trim_end_matches('/').to_string(),
            pool,
            endpoints: RwLock::new(Vec::new()),
            http: reqwest::Client::builder()
                .timeout(BUFFERED_TIMEOUT)
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .unwrap_or_default(),
            stream_http: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Fetch the active participant list from the source node and keep the
    /// whitelisted entries. Called once at startup; fails fast if the
    /// filtered list is empty.
    pub async fn discover_endpoints(&self) -> Result<(), UpstreamError> {
        let url = format!("{}/v1/epochs/current/participants", self.source_url);
        tracing::info!(%url, "discovering endpoints");

        let resp = self
            .http
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| UpstreamError::Discovery(e.to_string()))?;

        if resp.status() != StatusCode::OK {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Discovery(format!("status {status}: {body}")));
        }

        let result: ParticipantsResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Discovery(format!("decode: {e}")))?;

        let eps: Vec<Endpoint> = result
            .active_participants
            .participants
            .into_iter()
            .filter(|p| !p.inference_url.is_empty() && !p.index.is_empty())
            .filter(|p| ALLOWED_TRANSFER_AGENTS.contains(&p.index.as_str()))
            .map(|p| Endpoint {
                url: format!("{}/v1", p.inference_url.trim_end_matches('/')),
                address: p.index,
            })
            .collect();

        if eps.is_empty() {
            return Err(UpstreamError::NoWhitelistedEndpoints);
        }

        tracing::info!(
            count = eps.len(),
            whitelisted = ALLOWED_TRANSFER_AGENTS.len(),
            "endpoints discovered"
        );
        *self.endpoints.write().expect("endpoint lock poisoned") = eps;
        Ok(())
    }

    /// Replace the endpoint table directly. Used by tests and by deployments
    /// with a static node list.
    pub fn set_endpoints(&self, eps: Vec<Endpoint>) {
        *self.endpoints.write().expect("endpoint lock poisoned") = eps;
    }

    /// Pick a uniform-random endpoint not in the excluded set. If the
    /// exclusion set covers every endpoint, fall back to any.
    fn pick_endpoint_excluding(&self, exclude: &HashSet<String>) -> Result<Endpoint, UpstreamError> {
        let eps = self.endpoints.read().expect("endpoint lock poisoned");
        if eps.is_empty() {
            return Err(UpstreamError::NoEndpoints);
        }
        let candidates: Vec<&Endpoint> =
            eps.iter().filter(|ep| !exclude.contains(&ep.address)).collect();
        let mut rng = rand::thread_rng();
        if candidates.is_empty() {
            return Ok(eps[rng.gen_range(0..eps.len())].clone());
        }
        Ok(candidates[rng.gen_range(0..candidates.len())].clone())
    }

    /// Fetch the raw model list from upstream.
    pub async fn fetch_models(&self) -> Result<Vec<serde_json::Value>, UpstreamError> {
        let ep = self.pick_endpoint_excluding(&HashSet::new())?;
        let wallet = self.pool.next();
        let resp = self
            .send_signed(&self.http, &ep, &wallet, Method::GET, "/models", None)
            .await
            .map_err(|e| match e {
                SendError::Signer(e) => UpstreamError::Signer(e),
                SendError::Transport(e) => UpstreamError::Transport(e.to_string()),
            })?;

        let status = resp.status();
        if status.as_u16() >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        Ok(result.models)
    }

    /// Send a signed buffered request. Retries up to 3 times on different
    /// endpoints for transport errors only; any HTTP reply (including
    /// 4xx/5xx) is returned as-is.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        payload: &[u8],
    ) -> Result<(StatusCode, Bytes), UpstreamError> {
        let mut tried = HashSet::new();
        let mut last_err = UpstreamError::NoEndpoints;
        for attempt in 0..MAX_ATTEMPTS {
            let ep = match self.pick_endpoint_excluding(&tried) {
                Ok(ep) => ep,
                Err(e) => {
                    if attempt == 0 {
                        last_err = e;
                    }
                    break;
                }
            };
            tried.insert(ep.address.clone());
            let wallet = self.pool.next();

            match self
                .send_signed(&self.http, &ep, &wallet, method.clone(), path, Some(payload))
                .await
            {
                Ok(resp) => {
                    let status = resp.status();
                    let mut headers = resp.headers().clone();
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|e| UpstreamError::Transport(e.to_string()))?;
                    // Decompress so restoration and tool-sim parsing can see
                    // the JSON.
                    let body = maybe_decompress(&mut headers, body)?;
                    return Ok((status, body));
                }
                Err(SendError::Signer(e)) => return Err(e.into()),
                Err(SendError::Transport(e)) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "upstream: request failed, retrying with different endpoint"
                    );
                    last_err = UpstreamError::Transport(e.to_string());
                }
            }
        }
        Err(last_err)
    }

    /// Send a signed request and return the open response for streaming.
    /// Same retry policy as [`Client::request`]; no response timeout.
    pub async fn request_stream(
        &self,
        method: Method,
        path: &str,
        payload: &[u8],
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut tried = HashSet::new();
        let mut last_err = UpstreamError::NoEndpoints;
        for attempt in 0..MAX_ATTEMPTS {
            let ep = match self.pick_endpoint_excluding(&tried) {
                Ok(ep) => ep,
                Err(e) => {
                    if attempt == 0 {
                        last_err = e;
                    }
                    break;
                }
            };
            tried.insert(ep.address.clone());
            let wallet = self.pool.next();

            match self
                .send_signed(&self.stream_http, &ep, &wallet, method.clone(), path, Some(payload))
                .await
            {
                Ok(resp) => return Ok(resp),
                Err(SendError::Signer(e)) => return Err(e.into()),
                Err(SendError::Transport(e)) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "upstream: stream request failed, retrying with different endpoint"
                    );
                    last_err = UpstreamError::Transport(e.to_string());
                }
            }
        }
        Err(last_err)
    }

    /// Execute one signed request against a specific endpoint with the given
    /// wallet. Headers carry the signature, requester address, and the
    /// timestamp that went into the signature input.
    async fn send_signed(
        &self,
        http: &reqwest::Client,
        ep: &Endpoint,
        wallet: &Arc<Wallet>,
        method: Method,
        path: &str,
        payload: Option<&[u8]>,
    ) -> Result<reqwest::Response, SendError> {
        let url = format!("{}{}", ep.url, path);
        let body = payload.unwrap_or_default();
        let (sig, ts) = wallet.signer.sign(body, &ep.address)?;

        tracing::info!(
            method = %method,
            %url,
            endpoint_addr = %ep.address,
            wallet = %wallet.address,
            "upstream request"
        );

        let mut req = http
            .request(method, &url)
            .header(CONTENT_TYPE, "application/json")
            .header("Authorization", sig)
            .header("X-Requester-Address", wallet.address.clone())
            .header("X-Timestamp", ts.to_string());
        if payload.is_some() {
            req = req.body(body.to_vec());
        }
        Ok(req.send().await?)
    }
}

/// Decompress the body when Content-Encoding is gzip or deflate, stripping
/// the now-stale encoding headers.
fn maybe_decompress(headers: &mut HeaderMap, body: Bytes) -> Result<Bytes, UpstreamError> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    let out = match encoding.as_str() {
        "gzip" => {
            let mut decoder = GzDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| UpstreamError::Decode(format!("gzip decompression failed: {e}")))?;
            Bytes::from(out)
        }
        "deflate" => {
            let mut decoder = DeflateDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| UpstreamError::Decode(format!("deflate decompression failed: {e}")))?;
            Bytes::from(out)
        }
        _ => return Ok(body),
    };
    headers.remove(CONTENT_ENCODING);
    headers.remove(reqwest::header::CONTENT_LENGTH);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
