// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod proxy;
pub mod sanitize;
pub mod signer;
pub mod toolsim;
pub mod upstream;
pub mod wallet;
