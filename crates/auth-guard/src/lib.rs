//! Centralized authentication-state guard for outbound API clients
//!
//! Tracks whether upstream calls are currently authenticated, recovers
//! automatically with bounded backoff when they stop being so, and blocks
//! traffic through a guarded transport while authentication is known broken.
//!
//! State lifecycle:
//! 1. Manager starts `Valid`; the guarded transport forwards every request
//! 2. A 401 or a credential-shaped transport error → `Recovering`, background
//!    recovery sequence starts (or straight to `Invalid` when recovery is disabled)
//! 3. While `Recovering`/`Invalid`, requests fail fast with `AuthInvalidError`
//!    and never reach the network
//! 4. Recovery test succeeds → `Valid`; attempts exhausted → `Invalid`
//! 5. `Invalid` → `Recovering` again only on an explicit `trigger_retry()`
//! 6. `shutdown()` cancels recovery and waits for the background task to exit

pub mod classify;
pub mod error;
pub mod guard;
pub mod manager;
pub mod recovery;
pub mod state;

pub use classify::is_credential_error;
pub use error::{AuthInvalidError, is_auth_invalid};
pub use guard::GuardedTransport;
pub use manager::{
    Manager, ManagerConfig, RecoveryTest, StateCallback, UNSPECIFIED_FAILURE_REASON,
};
pub use recovery::{DEFAULT_BACKOFF, RECOVERY_EXHAUSTED_REASON, backoff_delay};
pub use state::{AuthState, Snapshot};
