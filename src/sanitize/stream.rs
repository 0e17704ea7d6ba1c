// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

// Streaming token restoration.
//
// Wraps an upstream SSE byte stream and replaces placeholder tokens with
// their original values before the bytes reach the client, handling tokens
// that are split across chunk boundaries. Everything is byte-oriented: a
// chunk boundary may fall inside a multi-byte UTF-8 code point (including
// the « and » delimiters themselves) and must not corrupt the output.

use super::{TokenMap, TOKEN_PREFIX, TOKEN_SUFFIX};
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;

/// Upper bound on the tail we hold back between chunks. Strictly greater
/// than the longest placeholder that could still be assembling
/// («TOKEN_ + six digits + » is 16 bytes).
pub const HOLDBACK: usize = 20;

/// Wrap `input` so that all «TOKEN_XXXXXX» markers are replaced with their
/// originals from `tm` before being emitted.
///
/// Invariant: no emitted chunk ever ends inside a potential placeholder, so
/// the concatenation of all emitted bytes equals the buffered restoration of
/// the concatenated input. If `tm` is empty the input passes through with
/// only stream-adaptor overhead.
pub fn restore_stream(
    input: impl Stream<Item = Bytes> + Send + 'static,
    tm: Arc<TokenMap>,
) -> Pin<Box<dyn Stream<Item = Bytes> + Send>> {
    if tm.is_empty() {
        return Box::pin(input);
    }

    let state = (
        Box::pin(input) as Pin<Box<dyn Stream<Item = Bytes> + Send>>,
        Vec::<u8>::new(),
        false,
    );

    let out = stream::unfold(state, move |(mut input, mut carry, mut done)| {
        let tm = tm.clone();
        async move {
            loop {
                if done {
                    return None;
                }
                match input.next().await {
                    Some(chunk) => {
                        carry.extend_from_slice(&chunk);
                        let restored = tm.restore_bytes(&carry);
                        let hold = partial_token_suffix_len(&restored);
                        if restored.len() > hold {
                            let emit = Bytes::from(restored[..restored.len() - hold].to_vec());
                            carry = restored[restored.len() - hold..].to_vec();
                            return Some((emit, (input, carry, done)));
                        }
                        // Everything pending might still be a token prefix;
                        // wait for more bytes.
                        carry = restored;
                    }
                    None => {
                        done = true;
                        if carry.is_empty() {
                            return None;
                        }
                        let tail = Bytes::from(tm.restore_bytes(&carry));
                        carry.clear();
                        return Some((tail, (input, carry, done)));
                    }
                }
            }
        }
    })
    .filter(|b| futures_util::future::ready(!b.is_empty()));

    Box::pin(out)
}

/// Length of the longest suffix of `buf` that could be an unfinished
/// placeholder: a prefix of `«TOKEN_`, or `«TOKEN_` followed by digits and
/// at most the first byte of `»`. Complete (or impossible) candidates return
/// zero so they are emitted rather than held forever.
fn partial_token_suffix_len(buf: &[u8]) -> usize {
    let window = buf.len().min(HOLDBACK - 1);
    let tail_start = buf.len() - window;
    for i in tail_start..buf.len() {
        if is_partial_token(&buf[i..]) {
            return buf.len() - i;
        }
    }
    0
}

fn is_partial_token(suffix: &[u8]) -> bool {
    let prefix = TOKEN_PREFIX.as_bytes();
    if suffix.len() < prefix.len() {
        // Could be the beginning of «TOKEN_ itself.
        return prefix.starts_with(suffix);
    }
    if !suffix.starts_with(prefix) {
        return false;
    }
    let suffix_bytes = TOKEN_SUFFIX.as_bytes(); // 0xC2 0xBB
    let mut rest = &suffix[prefix.len()..];
    // At least one digit must still allow the closer to arrive later.
    while let [b, tail @ ..] = rest {
        if b.is_ascii_digit() {
            rest = tail;
            continue;
        }
        // A lone first byte of » at the very end is still unfinished.
        return rest == [suffix_bytes[0]];
    }
    // «TOKEN_ or «TOKEN_123...: unfinished as long as the closer is missing.
    true
}
