// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

// Deterministic ECDSA-SHA256 signing over secp256k1, matching the official
// gonka-openai Python SDK v0.2.4 signing scheme exactly:
//
//   1. payload_hash = hex(SHA256(payload_bytes))
//   2. signature_input = payload_hash + str(timestamp_ns) + transfer_address
//   3. sign SHA256(signature_input) with deterministic ECDSA (RFC 6979), low-S
//   4. encode r(32 bytes) || s(32 bytes) as base64

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use k256::ecdsa::SigningKey;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Errors that can occur when constructing or using a [`Signer`].
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("invalid hex key: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("key rejected by curve: {0}")]
    InvalidKey(k256::ecdsa::Error),

    #[error("signing failed: {0}")]
    Signing(k256::ecdsa::Error),
}

/// Produces signatures compatible with the Gonka remote verifier.
///
/// The nonce is generated per RFC 6979 (HMAC-SHA-256), so for a fixed key,
/// payload, address, and timestamp the signature is byte-identical.
#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    /// Create a Signer from a hex-encoded secp256k1 private key
    /// (0x prefix optional).
    pub fn new(hex_key: &str) -> Result<Self, SignerError> {
        let hex_key = hex_key.trim_start_matches("0x");
        let raw = hex::decode(hex_key)?;
        if raw.len() != 32 {
            return Err(SignerError::InvalidKeyLength(raw.len()));
        }
        let key = SigningKey::from_slice(&raw).map_err(SignerError::InvalidKey)?;
        Ok(Self { key })
    }

    /// Sign `payload` for the given upstream transfer address.
    ///
    /// Returns (base64 signature, timestamp in nanoseconds since epoch).
    pub fn sign(&self, payload: &[u8], transfer_address: &str) -> Result<(String, i64), SignerError> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let sig = self.sign_at(payload, transfer_address, ts)?;
        Ok((sig, ts))
    }

    /// Sign with an explicit timestamp. Deterministic: same inputs, same output.
    pub fn sign_at(
        &self,
        payload: &[u8],
        transfer_address: &str,
        timestamp_ns: i64,
    ) -> Result<String, SignerError> {
        // Step 1: SHA-256 of the payload, hex-encoded lowercase.
        let payload_hex = hex::encode(Sha256::digest(payload));

        // Step 2: ASCII concatenation, no separators.
        let sig_input = format!("{payload_hex}{timestamp_ns}{transfer_address}");

        // Step 3: RFC 6979 deterministic ECDSA over SHA256(sig_input).
        let digest = Sha256::digest(sig_input.as_bytes());
        let (sig, _recovery_id) = self
            .key
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(SignerError::Signing)?;

        // Low-S normalisation: the remote verifier rejects high-S signatures.
        let sig = sig.normalize_s().unwrap_or(sig);

        // Step 4: r||s, each zero-padded to 32 bytes, base64.
        Ok(B64.encode(sig.to_bytes()))
    }
}
