// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

// Wallet pool: round-robin selection over N signing identities.

use crate::signer::Signer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A signing identity: the secp256k1 signer plus the requester address sent
/// alongside every signature.
#[derive(Debug)]
pub struct Wallet {
    pub signer: Signer,
    pub address: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("wallet pool: at least one wallet is required")]
    Empty,
}

/// Routes requests across wallets with atomic round-robin selection.
///
/// Ordering across concurrent callers is unspecified, but over K requests
/// with N wallets each wallet is used ⌊K/N⌋ or ⌈K/N⌉ times.
#[derive(Debug)]
pub struct WalletPool {
    wallets: Vec<Arc<Wallet>>,
    counter: AtomicU64,
}

impl WalletPool {
    pub fn new(wallets: Vec<Wallet>) -> Result<Self, WalletError> {
        if wallets.is_empty() {
            return Err(WalletError::Empty);
        }
        tracing::info!(wallets = wallets.len(), "wallet pool initialised");
        for (i, w) in wallets.iter().enumerate() {
            tracing::info!(index = i, address = %w.address, "wallet registered");
        }
        Ok(Self {
            wallets: wallets.into_iter().map(Arc::new).collect(),
            counter: AtomicU64::new(0),
        })
    }

    /// Return the next wallet. Safe for concurrent callers.
    pub fn next(&self) -> Arc<Wallet> {
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        self.wallets[(idx % self.wallets.len() as u64) as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}
