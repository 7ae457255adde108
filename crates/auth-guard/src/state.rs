//! Authentication state values

use std::fmt;

/// Authentication state of the guarded client.
///
/// Transitions:
/// - Valid → Recovering (failure reported, automatic recovery enabled)
/// - Valid → Invalid (failure reported, automatic recovery disabled)
/// - Recovering → Valid (recovery test passed, or success reported)
/// - Recovering → Invalid (recovery attempts exhausted)
/// - Invalid → Recovering (explicit retry)
/// - Invalid → Valid (success reported)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AuthState {
    Valid = 0,
    Invalid = 1,
    Recovering = 2,
}

impl AuthState {
    /// State label for health/logging.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthState::Valid => "valid",
            AuthState::Invalid => "invalid",
            AuthState::Recovering => "recovering",
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AuthState::Valid),
            1 => Some(AuthState::Invalid),
            2 => Some(AuthState::Recovering),
            _ => None,
        }
    }

    /// Label for a raw discriminant; anything outside the enum renders as "unknown".
    pub fn label_for(value: u8) -> &'static str {
        Self::from_u8(value).map_or("unknown", Self::as_str)
    }

    /// Whether requests must be refused without touching the network.
    pub fn blocks_requests(self) -> bool {
        matches!(self, AuthState::Invalid | AuthState::Recovering)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State and failure reason as observed together under the manager lock.
///
/// `reason` is empty exactly when `state` is `Valid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: AuthState,
    pub reason: String,
}

impl Snapshot {
    pub(crate) fn valid() -> Self {
        Self {
            state: AuthState::Valid,
            reason: String::new(),
        }
    }
}
