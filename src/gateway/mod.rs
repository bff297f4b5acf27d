// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! HTTP dispatch surface.
//!
//! The gateway owns four paths: a health probe, two admin endpoints for
//! worker observability, and the catch-all dispatch route that executes
//! published flows. Everything else about the process (auth provider,
//! metadata store, database) arrives through [`AppState`].

pub mod dispatch;

use std::sync::Arc;

use axum::routing::{any, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::backends::{AuthProvider, DatabaseHandle, Mailer, PublishedApiStore};
use crate::config::Settings;
use crate::worker::WorkerManager;

/// Shared state for the dispatch handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub manager: Arc<WorkerManager>,
    pub store: Arc<dyn PublishedApiStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub db: Arc<dyn DatabaseHandle>,
    pub mailer: Arc<dyn Mailer>,
    pub http: reqwest::Client,
}

/// Build the `/execute` router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/execute/health", get(dispatch::health))
        .route("/execute/worker-stats", get(dispatch::worker_stats))
        .route(
            "/execute/worker/:api_id/reload",
            post(dispatch::reload_worker),
        )
        .route("/execute/*endpoint", any(dispatch::run_published_api))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
