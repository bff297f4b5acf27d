// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Dispatch handlers: map HTTP requests onto published flows.
//!
//! Per request the gateway resolves the published API by path, obtains a
//! cached executor from the worker manager, invokes it with the parsed
//! inputs and user context, and shapes the response per the dispatch
//! contract: `{ success, api_info, execution_timestamp, result }` on
//! success, `{ error, message, execution_id, execution_time }` on failure,
//! with `X-Execution-ID` / `X-Execution-Time` / `X-API-Version` headers.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{FromRequest, Multipart, Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::AppState;
use crate::engine::context::{Services, UserContext};
use crate::engine::{FlowResult, Invocation};
use crate::errors::{FlowError, NodeErrorKind};
use crate::nodes::FlowValue;
use crate::observability::messages::dispatch::{
    DispatchCompleted, DispatchFailed, DispatchStarted,
};
use crate::observability::messages::StructuredLog;
use crate::table::Table;

/// Liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let identity = state.auth.identify(bearer_token(headers)).await;
    match identity {
        Some(identity) if identity.is_admin => Ok(()),
        _ => Err((
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "Forbidden",
                "message": "Admin access required",
            })),
        )
            .into_response()),
    }
}

/// Manager and per-entry statistics. Admin only.
pub async fn worker_stats(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers).await {
        return denied;
    }
    let body = json!({
        "manager_stats": state.manager.manager_stats().await,
        "workers": state.manager.all_info().await,
        "timestamp": Utc::now().to_rfc3339(),
    });
    Json(body).into_response()
}

/// Evict one cached worker so the next dispatch rebuilds it. Admin only.
pub async fn reload_worker(
    State(state): State<AppState>,
    Path(api_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers).await {
        return denied;
    }
    let removed = state.manager.force_remove(&api_id).await;
    let message = if removed {
        format!("Worker {api_id} reloaded successfully")
    } else {
        format!("Worker {api_id} was not active")
    };
    Json(json!({ "message": message })).into_response()
}

/// The dispatch entry: execute the published flow mapped to this path.
pub async fn run_published_api(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    request: axum::extract::Request,
) -> Response {
    let started = Instant::now();
    let execution_id = format!("exec_{}", monotonic_micros());
    let method = request.method().clone();
    let headers = request.headers().clone();
    let uri = request.uri().clone();

    DispatchStarted {
        endpoint: &endpoint,
        execution_id: &execution_id,
        method: method.as_str(),
    }
    .log();

    // Resolve the published API record.
    let Some(api) = state.store.find_by_path(&endpoint).await else {
        return error_response(
            StatusCode::NOT_FOUND,
            "Not found",
            &format!("API endpoint not found: {endpoint}"),
            &execution_id,
            started.elapsed().as_secs_f64(),
        );
    };
    if !api.is_active {
        return error_response(
            StatusCode::FORBIDDEN,
            "Inactive",
            "API is currently inactive",
            &execution_id,
            started.elapsed().as_secs_f64(),
        );
    }

    // Parse request-derived inputs.
    let input_data = match parse_request_inputs(&method, &uri, &headers, request).await {
        Ok(inputs) => inputs,
        Err(reason) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Bad request",
                &reason,
                &execution_id,
                started.elapsed().as_secs_f64(),
            )
        }
    };

    // Build the user context, authenticated when a known token is present.
    let identity = state.auth.identify(bearer_token(&headers)).await;
    let user = UserContext {
        request_id: format!("req_{}", Uuid::new_v4()),
        timestamp: Utc::now(),
        client_ip: client_ip(&headers),
        user_agent: header_text(&headers, header::USER_AGENT),
        identity,
    };

    // Obtain an executor; validation failures at this stage are reported
    // without leaking flow internals to the caller.
    let executor = match state.manager.acquire(&api).await {
        Ok(executor) => executor,
        Err(error) => {
            DispatchFailed {
                endpoint: &endpoint,
                execution_id: &execution_id,
                elapsed: started.elapsed().as_secs_f64(),
                error: &error.to_string(),
            }
            .log();
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Flow validation failed",
                "The published flow definition is invalid",
                &execution_id,
                started.elapsed().as_secs_f64(),
            );
        }
    };

    let invocation = Invocation {
        input_data,
        execution_id: execution_id.clone(),
        user,
        services: Services {
            db: state.db.clone(),
            http: state.http.clone(),
            mailer: state.mailer.clone(),
        },
    };

    let outcome = match state.settings.dispatch_timeout {
        Some(limit) => match tokio::time::timeout(limit, executor.invoke(invocation)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let elapsed = started.elapsed().as_secs_f64();
                DispatchFailed {
                    endpoint: &endpoint,
                    execution_id: &execution_id,
                    elapsed,
                    error: "execution timed out",
                }
                .log();
                return error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Execution timed out",
                    "Flow execution exceeded the dispatch timeout",
                    &execution_id,
                    elapsed,
                );
            }
        },
        None => executor.invoke(invocation).await,
    };
    let elapsed = started.elapsed().as_secs_f64();
    state.manager.record_execution(&api.id, elapsed).await;

    match outcome {
        Ok(result) => {
            let body = json!({
                "success": true,
                "api_info": {
                    "endpoint": api.endpoint_path,
                    "version": api.version,
                    "name": api.api_name,
                },
                "execution_timestamp": Utc::now().to_rfc3339(),
                "result": serialize_result(&result),
            });
            let body_text = body.to_string();
            DispatchCompleted {
                endpoint: &endpoint,
                execution_id: &execution_id,
                elapsed,
                result_bytes: body_text.len(),
            }
            .log();
            (
                StatusCode::OK,
                [
                    ("X-Execution-ID", execution_id),
                    ("X-Execution-Time", format!("{elapsed:.3}")),
                    ("X-API-Version", api.version.to_string()),
                ],
                Json(body),
            )
                .into_response()
        }
        Err(error) => {
            DispatchFailed {
                endpoint: &endpoint,
                execution_id: &execution_id,
                elapsed,
                error: &error.to_string(),
            }
            .log();
            match &error {
                FlowError::Node(node_error)
                    if node_error.kind == NodeErrorKind::PermissionDenied =>
                {
                    error_response(
                        StatusCode::FORBIDDEN,
                        "Permission denied",
                        &node_error.message,
                        &execution_id,
                        elapsed,
                    )
                }
                FlowError::Node(node_error) => error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Flow execution failed",
                    &node_error.to_string(),
                    &execution_id,
                    elapsed,
                ),
                FlowError::Validation(_) => error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Flow validation failed",
                    "The published flow definition is invalid",
                    &execution_id,
                    elapsed,
                ),
            }
        }
    }
}

fn monotonic_micros() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or_default()
}

fn header_text(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parse inputs per the dispatch contract: query parameters, then the
/// decoded body (JSON object merge, JSON non-object under `body`,
/// form/multipart merge), plus a `_metadata` sub-map.
async fn parse_request_inputs(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    request: axum::extract::Request,
) -> Result<Map<String, Value>, String> {
    let mut inputs = Map::new();

    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            inputs.insert(key.into_owned(), Value::String(value.into_owned()));
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| format!("invalid multipart body: {e}"))?;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| format!("invalid multipart body: {e}"))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            let text = field
                .text()
                .await
                .map_err(|e| format!("invalid multipart field: {e}"))?;
            inputs.insert(name, Value::String(text));
        }
    } else {
        let bytes = axum::body::to_bytes(request.into_body(), 2 * 1024 * 1024)
            .await
            .map_err(|e| format!("cannot read request body: {e}"))?;
        if !bytes.is_empty() {
            if content_type.starts_with("application/json") {
                let value: Value =
                    serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON body: {e}"))?;
                match value {
                    Value::Object(map) => inputs.extend(map),
                    other => {
                        inputs.insert("body".to_string(), other);
                    }
                }
            } else if content_type.starts_with("application/x-www-form-urlencoded") {
                for (key, value) in url::form_urlencoded::parse(&bytes) {
                    inputs.insert(key.into_owned(), Value::String(value.into_owned()));
                }
            }
            // Other content types carry no inputs; the metadata below still
            // records the request.
        }
    }

    inputs.insert(
        "_metadata".to_string(),
        json!({
            "method": method.as_str(),
            "client_ip": client_ip(headers),
            "user_agent": header_text(headers, header::USER_AGENT),
            "timestamp": Utc::now().to_rfc3339(),
        }),
    );

    Ok(inputs)
}

/// Serialize a flow result per the dispatch contract.
fn serialize_result(result: &FlowResult) -> Value {
    match result {
        FlowResult::Value(value) => serialize_value(value),
        FlowResult::Many(values) => {
            let mut map = Map::new();
            for (id, value) in values {
                map.insert(id.clone(), serialize_value(value));
            }
            Value::Object(map)
        }
    }
}

fn serialize_value(value: &FlowValue) -> Value {
    match value {
        FlowValue::Table(table) => serialize_table(table),
        FlowValue::Json(Value::Object(map)) => Value::Object(map.clone()),
        FlowValue::Json(Value::Array(items)) => json!({ "data": items }),
        FlowValue::Json(other) => json!({ "result": render_scalar(other) }),
        FlowValue::Bool(b) => json!({ "result": b.to_string() }),
        FlowValue::Null => json!({ "result": "null" }),
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn serialize_table(table: &Table) -> Value {
    json!({
        "data": table
            .to_json_records()
            .into_iter()
            .map(Value::Object)
            .collect::<Vec<_>>(),
        "shape": table.shape(),
        "columns": table.column_names(),
        "dtypes": Value::Object(table.dtypes()),
    })
}

fn error_response(
    status: StatusCode,
    error: &str,
    message: &str,
    execution_id: &str,
    execution_time: f64,
) -> Response {
    (
        status,
        [("X-Execution-ID", execution_id.to_string())],
        Json(json!({
            "error": error,
            "message": message,
            "execution_id": execution_id,
            "execution_time": execution_time,
        })),
    )
        .into_response()
}
