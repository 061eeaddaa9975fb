//! External-API adapter template (§4.4).
//!
//! Each concrete adapter fixes `action = "api_call"` and
//! `resource = "api:<vendor>:<model>"` and forwards to the target vendor SDK
//! on allow. The pack carries no vendor SDK crate, so the forwarding call is
//! a generic closure rather than a wired client; a concrete adapter plugs
//! its SDK call in as `f`.

use uuid::Uuid;

use caracal_core::{AuthorityEvaluator, ValidationRequest};

use crate::wrapper::AuthorityDenied;

/// Authorizes `api:<vendor>:<model>` for `mandate_id` and, on allow, runs
/// `f`. On denial, returns [`AuthorityDenied`] without running `f`.
pub fn call_vendor_api<T>(
    evaluator: &AuthorityEvaluator,
    mandate_id: Option<Uuid>,
    vendor: &str,
    model: &str,
    f: impl FnOnce() -> T,
) -> Result<T, AuthorityDenied> {
    let resource = format!("api:{vendor}:{model}");
    let decision = evaluator.validate(ValidationRequest {
        mandate_id,
        requested_action: "api_call",
        requested_resource: &resource,
        correlation_id: None,
    });

    if !decision.allowed {
        tracing::warn!(reason = %decision.reason, vendor, model, "external api call denied authority");
        return Err(AuthorityDenied { decision });
    }

    tracing::debug!(mandate_id = ?decision.mandate_id, vendor, model, "external api call authorized");
    Ok(f())
}
