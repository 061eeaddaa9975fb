//! MCP enforcement endpoints (§6): the HTTP surface a deployed authority
//! service exposes in front of a fleet of tool/resource servers.
//!
//! `tool/call` and `resource/read` run the same evaluator `validate()` call
//! the rest of the gateway surface uses; dispatch to the actual tool or
//! resource server is an external collaborator, plugged in via
//! [`ToolDispatcher`] (the pack carries no MCP client crate to wire here).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use caracal_core::{AuthorityEvaluator, ValidationRequest};

use crate::codes::denial_code;
use crate::middleware::extract_mandate_id;

/// Forwards an authorized tool call or resource read to the downstream
/// MCP server. Errors are dispatch failures, not authority denials.
pub trait ToolDispatcher: Send + Sync {
    fn call_tool(&self, tool_name: &str, tool_args: &Value) -> Result<Value, String>;
    fn read_resource(&self, resource_uri: &str) -> Result<Value, String>;
}

/// A dispatcher that always fails; useful as a placeholder until a real
/// one is wired in, and in tests that only exercise the authority path.
pub struct UnconfiguredDispatcher;

impl ToolDispatcher for UnconfiguredDispatcher {
    fn call_tool(&self, _tool_name: &str, _tool_args: &Value) -> Result<Value, String> {
        Err("no tool dispatcher configured".to_string())
    }

    fn read_resource(&self, _resource_uri: &str) -> Result<Value, String> {
        Err("no resource dispatcher configured".to_string())
    }
}

#[derive(Default)]
struct Counters {
    requests_total: AtomicU64,
    tool_calls_total: AtomicU64,
    resource_reads_total: AtomicU64,
    requests_allowed: AtomicU64,
    requests_denied: AtomicU64,
    errors_total: AtomicU64,
}

#[derive(Clone)]
pub struct McpState {
    evaluator: Arc<AuthorityEvaluator>,
    dispatcher: Arc<dyn ToolDispatcher>,
    service_name: String,
    service_version: String,
    /// Downstream MCP server name -> status (`"healthy"` or anything else).
    /// Populated at construction; this module does not probe them itself.
    mcp_servers: Arc<Vec<(String, String)>>,
    counters: Arc<Counters>,
}

impl McpState {
    pub fn new(
        evaluator: Arc<AuthorityEvaluator>,
        dispatcher: Arc<dyn ToolDispatcher>,
        service_name: impl Into<String>,
        service_version: impl Into<String>,
        mcp_servers: Vec<(String, String)>,
    ) -> Self {
        Self {
            evaluator,
            dispatcher,
            service_name: service_name.into(),
            service_version: service_version.into(),
            mcp_servers: Arc::new(mcp_servers),
            counters: Arc::new(Counters::default()),
        }
    }
}

/// Builds the four-route router (§6): `/mcp/tool/call`, `/mcp/resource/read`,
/// `/health`, `/stats`.
pub fn router(state: McpState) -> Router {
    Router::new()
        .route("/mcp/tool/call", post(tool_call))
        .route("/mcp/resource/read", post(resource_read))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ToolCallRequest {
    tool_name: String,
    #[serde(default)]
    tool_args: Value,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResourceReadRequest {
    resource_uri: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
struct McpResponseBody {
    success: bool,
    result: Option<Value>,
    error: Option<ErrorBody>,
    metadata: Value,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    details: Value,
}

impl McpResponseBody {
    fn success(result: Value, metadata: Option<Value>) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            metadata: metadata.unwrap_or(Value::Null),
        }
    }

    fn denied(reason: &str, metadata: Option<Value>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(ErrorBody {
                code: denial_code(reason),
                message: reason.to_string(),
                details: Value::Null,
            }),
            metadata: metadata.unwrap_or(Value::Null),
        }
    }

    fn dispatch_failed(message: String, metadata: Option<Value>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(ErrorBody {
                code: "DISPATCH_FAILED",
                message,
                details: Value::Null,
            }),
            metadata: metadata.unwrap_or(Value::Null),
        }
    }
}

async fn tool_call(State(state): State<McpState>, headers: HeaderMap, Json(req): Json<ToolCallRequest>) -> Response {
    state.counters.requests_total.fetch_add(1, Ordering::Relaxed);
    state.counters.tool_calls_total.fetch_add(1, Ordering::Relaxed);

    let mandate_id = extract_mandate_id(&headers);
    let resource = format!("tool:{}", req.tool_name);
    let decision = state.evaluator.validate(ValidationRequest {
        mandate_id,
        requested_action: "tool_call",
        requested_resource: &resource,
        correlation_id: req.agent_id.clone(),
    });

    if !decision.allowed {
        state.counters.requests_denied.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(reason = %decision.reason, tool_name = %req.tool_name, "tool call denied authority");
        return Json(McpResponseBody::denied(&decision.reason, req.metadata)).into_response();
    }
    state.counters.requests_allowed.fetch_add(1, Ordering::Relaxed);

    match state.dispatcher.call_tool(&req.tool_name, &req.tool_args) {
        Ok(result) => Json(McpResponseBody::success(result, req.metadata)).into_response(),
        Err(message) => {
            state.counters.errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %message, tool_name = %req.tool_name, "tool dispatch failed");
            Json(McpResponseBody::dispatch_failed(message, req.metadata)).into_response()
        }
    }
}

async fn resource_read(State(state): State<McpState>, headers: HeaderMap, Json(req): Json<ResourceReadRequest>) -> Response {
    state.counters.requests_total.fetch_add(1, Ordering::Relaxed);
    state.counters.resource_reads_total.fetch_add(1, Ordering::Relaxed);

    let mandate_id = extract_mandate_id(&headers);
    let decision = state.evaluator.validate(ValidationRequest {
        mandate_id,
        requested_action: "resource_read",
        requested_resource: &req.resource_uri,
        correlation_id: req.agent_id.clone(),
    });

    if !decision.allowed {
        state.counters.requests_denied.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(reason = %decision.reason, resource_uri = %req.resource_uri, "resource read denied authority");
        return Json(McpResponseBody::denied(&decision.reason, req.metadata)).into_response();
    }
    state.counters.requests_allowed.fetch_add(1, Ordering::Relaxed);

    match state.dispatcher.read_resource(&req.resource_uri) {
        Ok(result) => Json(McpResponseBody::success(result, req.metadata)).into_response(),
        Err(message) => {
            state.counters.errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %message, resource_uri = %req.resource_uri, "resource dispatch failed");
            Json(McpResponseBody::dispatch_failed(message, req.metadata)).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    version: String,
    mcp_servers: HashMap<String, String>,
}

async fn health(State(state): State<McpState>) -> Response {
    let degraded = state.mcp_servers.iter().any(|(_, status)| status != "healthy");
    let body = HealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        service: state.service_name.clone(),
        version: state.service_version.clone(),
        mcp_servers: state.mcp_servers.iter().cloned().collect(),
    };
    let status_code = if degraded { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (status_code, Json(body)).into_response()
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    requests_total: u64,
    tool_calls_total: u64,
    resource_reads_total: u64,
    requests_allowed: u64,
    requests_denied: u64,
    errors_total: u64,
    mcp_servers: HashMap<String, String>,
}

async fn stats(State(state): State<McpState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        requests_total: state.counters.requests_total.load(Ordering::Relaxed),
        tool_calls_total: state.counters.tool_calls_total.load(Ordering::Relaxed),
        resource_reads_total: state.counters.resource_reads_total.load(Ordering::Relaxed),
        requests_allowed: state.counters.requests_allowed.load(Ordering::Relaxed),
        requests_denied: state.counters.requests_denied.load(Ordering::Relaxed),
        errors_total: state.counters.errors_total.load(Ordering::Relaxed),
        mcp_servers: state.mcp_servers.iter().cloned().collect(),
    })
}
