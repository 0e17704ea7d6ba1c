// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use opengnk::config;
use opengnk::proxy;
use opengnk::sanitize::{Classifier, LlmClassifier, NerClassifier, Sanitizer};
use opengnk::signer::Signer;
use opengnk::upstream;
use opengnk::wallet::{Wallet, WalletPool};

use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "opengnk", about = "OpenAI-compatible gateway for the Gonka network")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 8080, env = "PORT")]
    port: u16,
}

#[tokio::main]
async fn main() {
    // Best-effort: load .env from the current directory before reading config.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    let mut wallets = Vec::new();
    for (i, wc) in cfg.wallets.iter().enumerate() {
        let signer = match Signer::new(&wc.private_key) {
            Ok(signer) => signer,
            Err(e) => {
                tracing::error!(wallet = i + 1, "signer error: {e}");
                std::process::exit(1);
            }
        };
        wallets.push(Wallet {
            signer,
            address: wc.address.clone(),
        });
    }

    let pool = match WalletPool::new(wallets) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("wallet pool error: {e}");
            std::process::exit(1);
        }
    };
    let wallet_count = pool.len();

    let client = Arc::new(upstream::Client::new(&cfg.source_url, pool));
    if let Err(e) = client.discover_endpoints().await {
        tracing::error!("endpoint discovery failed: {e}");
        std::process::exit(1);
    }

    let sanitizer = if cfg.sanitize_enabled {
        let mut classifiers: Vec<Arc<dyn Classifier>> = Vec::new();
        if cfg.sanitize_ner {
            classifiers.push(Arc::new(NerClassifier::new(&cfg.sanitize_ner_url)));
            tracing::info!(url = %cfg.sanitize_ner_url, "sanitize: NER layer enabled");
        }
        // The LLM classifier must stay last: history messages skip it.
        if cfg.sanitize_llm {
            classifiers.push(Arc::new(LlmClassifier::new(
                &cfg.sanitize_llm_url,
                &cfg.sanitize_llm_model,
                cfg.sanitize_llm_threshold,
            )));
            tracing::info!(
                url = %cfg.sanitize_llm_url,
                model = %cfg.sanitize_llm_model,
                "sanitize: LLM layer enabled"
            );
        }
        tracing::info!(classifiers = classifiers.len(), "sanitization enabled");
        Some(Arc::new(Sanitizer::new(classifiers)))
    } else {
        None
    };

    let state = proxy::AppState::new(client, sanitizer, cfg.simulate_tool_calls);
    tokio::spawn(proxy::load_models(state.clone()));

    let app = proxy::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!(
        %addr,
        wallets = wallet_count,
        tool_sim = cfg.simulate_tool_calls,
        sanitize = cfg.sanitize_enabled,
        "starting proxy server"
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}
