//! Credential failure detection for transport-level errors
//!
//! Exec-based credential plugins fail before any HTTP request is sent, so
//! the client sees a plain transport error rather than a 401. The only
//! signal left is the error text; this module recovers it.

/// Substrings (lowercase) that mark an error as a credential failure rather
/// than an unrelated network fault.
const CREDENTIAL_ERROR_PATTERNS: &[&str] = &[
    "getting credentials",
    "exec: executable",
    "failed with exit code",
    "token has expired",
    "token is expired",
    "sso session",
    "refresh token",
    "authentication required",
    "unauthorized",
    "access denied",
    "permission denied",
];

/// Classify an error description as a credential failure.
///
/// Case-insensitive substring match against `CREDENTIAL_ERROR_PATTERNS`.
/// Anything that doesn't match is treated as an ordinary network error and
/// must be passed through untouched.
pub fn is_credential_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    CREDENTIAL_ERROR_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}
