//! Classified authentication error

use crate::state::AuthState;

/// Returned instead of a response when the guard believes authentication is broken.
///
/// Produced for requests refused while not `Valid`, for 401 responses, and for
/// transport errors classified as credential failures. `state` is the state at
/// the moment the error was produced; the manager may have moved on since.
///
/// Callers test for the kind, not the payload: use [`is_auth_invalid`] or
/// [`AuthInvalidError::find`] on any error, including a boxed transport error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("authentication {state}: {reason}")]
pub struct AuthInvalidError {
    pub reason: String,
    pub state: AuthState,
}

impl AuthInvalidError {
    pub fn new(reason: impl Into<String>, state: AuthState) -> Self {
        Self {
            reason: reason.into(),
            state,
        }
    }

    /// First `AuthInvalidError` in `err`'s `source()` chain, if any.
    pub fn find<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a AuthInvalidError> {
        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(found) = e.downcast_ref::<AuthInvalidError>() {
                return Some(found);
            }
            current = e.source();
        }
        None
    }
}

/// Whether `err` is, or wraps, an `AuthInvalidError` (regardless of reason or state).
pub fn is_auth_invalid(err: &(dyn std::error::Error + 'static)) -> bool {
    AuthInvalidError::find(err).is_some()
}
