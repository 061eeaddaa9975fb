//! Stable machine codes for the gateway surface (§4.4).
//!
//! `Decision::reason` crosses the core/gateway boundary as a plain message
//! string (`"expired"`, `"mandate_revoked: rotated"`, ...), not the
//! `DenialReason` enum itself. This maps it back to the same codes
//! `DenialReason::code()` produces on the core side, so JSON error bodies
//! carry a code a caller can match on without parsing the message.

/// Translates an evaluator denial reason string into its stable code.
/// Unrecognized reasons (there should be none) fall back to the generic
/// validation-failure code rather than panicking.
pub fn denial_code(reason: &str) -> &'static str {
    if reason.starts_with("mandate_revoked") {
        return "MANDATE_REVOKED";
    }
    match reason {
        "no_mandate_provided" => "MANDATE_NOT_PROVIDED",
        "mandate_not_found" => "MANDATE_NOT_FOUND",
        "not_yet_valid" => "MANDATE_NOT_YET_VALID",
        "expired" => "MANDATE_EXPIRED",
        "signature_verification_failed" => "MANDATE_INVALID_SIGNATURE",
        "action_not_in_scope" => "ACTION_NOT_IN_SCOPE",
        "resource_not_in_scope" => "RESOURCE_NOT_IN_SCOPE",
        "delegation_chain_invalid" => "DELEGATION_CHAIN_INVALID",
        _ => "MANDATE_VALIDATION_FAILED",
    }
}
