//! Shared HTTP utilities for the URL shortener workspace.
//!
//! Framework-agnostic helpers: the JSON error envelope, RFC 3339 time
//! conversion, and request-metadata parsing used by the api-server.

use chrono::{DateTime, SecondsFormat, Utc};
use std::net::SocketAddr;
use std::time::SystemTime;

// ============================================================================
// JSON Response Helpers
// ============================================================================

/// Create a structured error JSON with a default message based on the code.
///
/// Returns: `{"error": {"code": "<code>", "message": "<default message>"}}`
pub fn json_err(code: &str) -> serde_json::Value {
    let message = match code {
        "not_found" => "Resource not found",
        "bad_request" => "Bad request",
        "invalid_url" => "Invalid URL",
        "invalid_token" => "Invalid short URL format",
        "unauthorized" => "Unauthorized",
        "forbidden" => "Admin access required",
        "conflict" => "Resource already exists",
        "unavailable" => "Service temporarily unavailable",
        "error" | "internal" => "Internal server error",
        _ => code, // Fallback to code as message for unknown codes
    };
    json_error_with_message(code, message)
}

/// Create a structured error JSON with a custom message.
///
/// Returns: `{"error": {"code": "<code>", "message": "<message>"}}`
pub fn json_error_with_message(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({"error": {"code": code, "message": message}})
}

/// `{"message": "<message>"}`, the body of acknowledgement-only responses.
pub fn json_message(message: &str) -> serde_json::Value {
    serde_json::json!({ "message": message })
}

// ============================================================================
// Request Metadata
// ============================================================================

/// Extract the API key from an `Authorization` header value. Accepts a bare
/// key or `Bearer <key>`.
pub fn api_key_from_authorization(value: &str) -> Option<&str> {
    let v = value.trim();
    let key = match v.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => v[7..].trim(),
        _ => v,
    };
    (!key.is_empty()).then_some(key)
}

/// Client address: first hop of `X-Forwarded-For` if present, else the peer.
pub fn client_ip(forwarded_for: Option<&str>, peer: Option<SocketAddr>) -> Option<String> {
    forwarded_for
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|p| p.ip().to_string()))
}

// ============================================================================
// Time Utilities
// ============================================================================

/// Convert SystemTime to RFC3339 string (seconds precision, UTC).
pub fn system_time_to_rfc3339(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn optional_rfc3339(t: Option<SystemTime>) -> Option<String> {
    t.map(system_time_to_rfc3339)
}

/// Parse an RFC3339 string to SystemTime.
///
/// Returns an error if the string is not a valid RFC3339 timestamp.
pub fn parse_rfc3339(s: &str) -> Result<SystemTime, chrono::ParseError> {
    let dt = DateTime::parse_from_rfc3339(s)?;
    Ok(dt.with_timezone(&Utc).into())
}
