// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Demo dispatch server: serve a JSON registry of published APIs over the
//! `/execute` surface with in-memory collaborators.
//!
//! Production deployments replace the in-memory store, auth provider and
//! database handle with real backends; the dispatch layer and worker
//! manager are unchanged.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use tableflow::backends::memory::{MemoryApiStore, MemoryDatabase, MemoryMailer, StaticAuthProvider};
use tableflow::backends::{PublishedApi, UserIdentity};
use tableflow::config::Settings;
use tableflow::gateway::{router, AppState};
use tableflow::worker::WorkerManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <published_apis.json>", args[0]);
        eprintln!();
        eprintln!("The file holds an array of published-API records:");
        eprintln!(
            "  [{{\"id\": \"...\", \"endpoint_path\": \"demo/hello\", \"version\": 1,"
        );
        eprintln!(
            "    \"is_active\": true, \"api_name\": \"...\", \"flow_definition\": {{...}}}}]"
        );
        std::process::exit(1);
    }

    let settings = Settings::from_env();
    tracing::info!(bind_addr = %settings.bind_addr, "starting dispatch server");

    // Load the demo registry.
    let raw = std::fs::read_to_string(&args[1])
        .with_context(|| format!("cannot read {}", args[1]))?;
    let apis: Vec<PublishedApi> =
        serde_json::from_str(&raw).with_context(|| format!("cannot parse {}", args[1]))?;
    let store = MemoryApiStore::new();
    for api in apis {
        tracing::info!(endpoint = %api.endpoint_path, api_id = %api.id, "publishing API");
        store.publish(api);
    }

    // Admin token for the worker-stats/reload endpoints, if configured.
    let mut auth = StaticAuthProvider::new();
    if let Ok(token) = env::var("TABLEFLOW_ADMIN_TOKEN") {
        auth = auth.with_token(
            token,
            UserIdentity {
                user_id: "admin".to_string(),
                username: "admin".to_string(),
                workspace_id: None,
                is_admin: true,
            },
        );
    }

    let manager = Arc::new(WorkerManager::new(settings.worker_settings()));
    manager.start();

    let state = AppState {
        settings: Arc::new(settings.clone()),
        manager: manager.clone(),
        store: Arc::new(store),
        auth: Arc::new(auth),
        db: Arc::new(MemoryDatabase::new()),
        mailer: Arc::new(MemoryMailer::new()),
        http: reqwest::Client::new(),
    };

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", settings.bind_addr))?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    manager.shutdown().await;
    Ok(())
}
