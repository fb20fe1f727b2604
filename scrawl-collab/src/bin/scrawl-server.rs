//! Scrawl collaboration server.
//!
//! Serves documents from an in-memory store; persistence-backed
//! deployments embed [`SyncServer`] with their own store instead.
//! Configuration comes from the environment:
//!
//! - `SCRAWL_BIND` — listen address (default `127.0.0.1:9090`)
//! - `SCRAWL_TOKENS` — comma-separated `token=display name` pairs;
//!   unset, a single `dev` token is accepted
//! - `SCRAWL_RETENTION` — history entries kept per document
//! - `SCRAWL_GRACE_SECS` — idle seconds before a document is evicted

use std::sync::Arc;

use log::info;

use scrawl_collab::auth::StaticTokens;
use scrawl_collab::server::{ServerConfig, SyncServer};
use scrawl_collab::storage::MemoryStore;

fn tokens_from_env(raw: &str) -> StaticTokens {
    let mut tokens = StaticTokens::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((token, name)) => tokens = tokens.with_token(token, name),
            None => tokens = tokens.with_token(pair, pair),
        }
    }
    tokens
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("SCRAWL_BIND") {
        config.bind_addr = bind;
    }
    if let Ok(raw) = std::env::var("SCRAWL_RETENTION") {
        match raw.parse() {
            Ok(n) => config.history_retention = n,
            Err(_) => log::warn!("Ignoring non-numeric SCRAWL_RETENTION {:?}", raw),
        }
    }
    if let Ok(raw) = std::env::var("SCRAWL_GRACE_SECS") {
        match raw.parse() {
            Ok(secs) => config.eviction_grace = std::time::Duration::from_secs(secs),
            Err(_) => log::warn!("Ignoring non-numeric SCRAWL_GRACE_SECS {:?}", raw),
        }
    }

    let auth = match std::env::var("SCRAWL_TOKENS") {
        Ok(raw) => tokens_from_env(&raw),
        Err(_) => {
            log::warn!("SCRAWL_TOKENS not set, accepting only the \"dev\" token");
            StaticTokens::new().with_token("dev", "Developer")
        }
    };

    let server = SyncServer::new(config, Arc::new(MemoryStore::new()), Arc::new(auth));

    info!("Starting Scrawl collaboration server...");
    if let Err(e) = server.run().await {
        log::error!("Server failed: {}", e);
        std::process::exit(1);
    }
}
