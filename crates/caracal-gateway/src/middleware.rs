//! HTTP middleware enforcement (§4.4), built on `axum::middleware::from_fn_with_state`.
//!
//! Intercepts every request except an exempt-path list, extracts a mandate
//! id from `X-Execution-Mandate` or `Authorization: Bearer <id>`, derives
//! `(action, resource)` from the request body or the method + path, and
//! gates the downstream call on the evaluator's decision.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use caracal_core::{AuthorityEvaluator, ValidationRequest};

use crate::codes::denial_code;

/// Paths that bypass authority enforcement entirely (§4.4 step 1).
const DEFAULT_EXEMPT_PATHS: &[&str] = &["/health", "/metrics"];

/// Caps the buffered request body read while deriving `(action, resource)`
/// from it; oversized bodies fall back to the method+path derivation.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    pub exempt_paths: Vec<String>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            exempt_paths: DEFAULT_EXEMPT_PATHS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Shared state the middleware closes over via `axum::middleware::from_fn_with_state`.
#[derive(Clone)]
pub struct AuthorityState {
    pub evaluator: Arc<AuthorityEvaluator>,
    pub config: Arc<MiddlewareConfig>,
}

impl AuthorityState {
    pub fn new(evaluator: Arc<AuthorityEvaluator>, config: MiddlewareConfig) -> Self {
        Self {
            evaluator,
            config: Arc::new(config),
        }
    }
}

#[derive(Serialize)]
struct DenialBody {
    allowed: bool,
    error: DenialError,
}

#[derive(Serialize)]
struct DenialError {
    code: &'static str,
    message: String,
    details: Value,
}

/// The middleware function: register with
/// `middleware::from_fn_with_state(state, enforce)`.
pub async fn enforce(State(state): State<AuthorityState>, req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if state.config.exempt_paths.iter().any(|exempt| exempt == &path) {
        return next.run(req).await;
    }

    let mandate_id = extract_mandate_id(req.headers());
    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return deny_response(
                StatusCode::BAD_REQUEST,
                "MANDATE_VALIDATION_FAILED",
                "request body unreadable".to_string(),
            )
        }
    };

    let (action, resource) = derive_action_resource(&parts, &bytes);
    let correlation_id = parts
        .headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let decision = state.evaluator.validate(ValidationRequest {
        mandate_id,
        requested_action: &action,
        requested_resource: &resource,
        correlation_id,
    });

    if !decision.allowed {
        tracing::warn!(reason = %decision.reason, action = %action, resource = %resource, "http request denied authority");
        return deny_response(StatusCode::FORBIDDEN, denial_code(&decision.reason), decision.reason);
    }

    tracing::debug!(mandate_id = ?decision.mandate_id, action = %action, resource = %resource, "http request authorized");
    let req = Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}

fn deny_response(status: StatusCode, code: &'static str, message: String) -> Response {
    let body = DenialBody {
        allowed: false,
        error: DenialError {
            code,
            message,
            details: Value::Null,
        },
    };
    (status, Json(body)).into_response()
}

/// `X-Execution-Mandate: <uuid>`, else `Authorization: Bearer <uuid>`.
/// Shared with the `mcp` module, which transports mandates the same way.
pub(crate) fn extract_mandate_id(headers: &HeaderMap) -> Option<Uuid> {
    if let Some(raw) = headers.get("x-execution-mandate").and_then(|v| v.to_str().ok()) {
        if let Ok(id) = Uuid::parse_str(raw.trim()) {
            return Some(id);
        }
    }
    if let Some(raw) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = raw.strip_prefix("Bearer ") {
            if let Ok(id) = Uuid::parse_str(token.trim()) {
                return Some(id);
            }
        }
    }
    None
}

/// Body fields `action`/`resource` take precedence; otherwise method+path.
fn derive_action_resource(parts: &Parts, body: &[u8]) -> (String, String) {
    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
        let action = map.get("action").and_then(Value::as_str).map(String::from);
        let resource = map.get("resource").and_then(Value::as_str).map(String::from);
        if let (Some(action), Some(resource)) = (action, resource) {
            return (action, resource);
        }
    }

    let method = &parts.method;
    let action = if *method == Method::GET {
        "read"
    } else if *method == Method::POST {
        "create"
    } else if *method == Method::PUT || *method == Method::PATCH {
        "update"
    } else if *method == Method::DELETE {
        "delete"
    } else {
        "execute"
    };
    (action.to_string(), parts.uri.path().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Router;
    use caracal_core::{EvaluatorConfig, IssueParams, MandateManager, Principal, PrincipalType, Store};
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePrivateKey;
    use tower::ServiceExt;

    fn signing_principal(name: &str) -> Principal {
        let signing_key = SigningKey::random(&mut rand_core::OsRng);
        let private_pem = signing_key.to_pkcs8_pem(Default::default()).unwrap().to_string();
        let public_pem = p256::ecdsa::VerifyingKey::from(&signing_key)
            .to_public_key_pem(Default::default())
            .unwrap();
        Principal {
            principal_id: Uuid::new_v4(),
            name: name.to_string(),
            principal_type: PrincipalType::Agent,
            owner: "org".to_string(),
            public_key_pem: public_pem,
            private_key_pem: Some(private_pem),
        }
    }

    fn subject_only(name: &str) -> Principal {
        Principal {
            principal_id: Uuid::new_v4(),
            name: name.to_string(),
            principal_type: PrincipalType::Agent,
            owner: "org".to_string(),
            public_key_pem: "unused".to_string(),
            private_key_pem: None,
        }
    }

    fn app(evaluator: AuthorityEvaluator) -> Router {
        let state = AuthorityState::new(Arc::new(evaluator), MiddlewareConfig::default());
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/database/users", get(|| async { "users" }))
            .route("/database/users", post(|| async { "created" }))
            .route_layer(axum::middleware::from_fn_with_state(state, enforce))
    }

    #[tokio::test]
    async fn exempt_path_bypasses_enforcement() {
        let store = Store::memory().unwrap();
        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let response = app(evaluator)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_mandate_is_rejected_with_stable_code() {
        let store = Store::memory().unwrap();
        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let response = app(evaluator)
            .oneshot(Request::builder().uri("/database/users").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["allowed"], false);
        assert_eq!(body["error"]["code"], "MANDATE_NOT_PROVIDED");
    }

    #[tokio::test]
    async fn valid_mandate_header_forwards_the_request() {
        let store = Store::memory().unwrap();
        let issuer = signing_principal("issuer");
        let subject = subject_only("agent");
        store.insert_principal(&issuer).unwrap();
        store.insert_principal(&subject).unwrap();

        let manager = MandateManager::new(store.clone());
        let mandate = manager
            .issue(IssueParams {
                issuer_id: issuer.principal_id,
                subject_id: subject.principal_id,
                resource_scope: vec!["/database/users".to_string()],
                action_scope: vec!["read".to_string()],
                validity_seconds: 3600,
                intent_hash: None,
                correlation_id: None,
            })
            .unwrap();

        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let response = app(evaluator)
            .oneshot(
                Request::builder()
                    .uri("/database/users")
                    .header("x-execution-mandate", mandate.mandate_id.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn action_resource_prefer_body_fields_over_method_path() {
        let parts = Request::builder()
            .method("POST")
            .uri("/database/users")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let body = serde_json::to_vec(&serde_json::json!({"action": "delete", "resource": "database:users:42"})).unwrap();
        let (action, resource) = derive_action_resource(&parts, &body);
        assert_eq!(action, "delete");
        assert_eq!(resource, "database:users:42");
    }

    #[test]
    fn action_resource_falls_back_to_method_and_path() {
        let parts = Request::builder().method("DELETE").uri("/database/users/42").body(()).unwrap().into_parts().0;
        let (action, resource) = derive_action_resource(&parts, b"not json");
        assert_eq!(action, "delete");
        assert_eq!(resource, "/database/users/42");
    }
}
