//! Transport decorator that consults and reports to the manager
//!
//! Every request first checks the manager: while `Invalid` or `Recovering`
//! it is refused with `AuthInvalidError` and the base transport is never
//! called, so concurrent callers don't pile onto a connection already known
//! to be broken. Outcomes of forwarded requests feed back into the manager:
//! 401 and credential-shaped transport errors report failure, 2xx/3xx report
//! success, everything else passes through untouched.

use std::sync::Arc;

use tracing::{debug, warn};
use transport::{ReqwestTransport, ResponseFuture, Transport};

use crate::classify::is_credential_error;
use crate::error::AuthInvalidError;
use crate::manager::Manager;
use crate::state::AuthState;

/// Failure reason recorded for a 401 response.
pub const UNAUTHORIZED_REASON: &str = "401 Unauthorized";

/// Drop-in replacement for a base transport that enforces the auth state.
pub struct GuardedTransport {
    manager: Manager,
    base: Arc<dyn Transport>,
}

impl GuardedTransport {
    /// Wrap `base`, or a default `ReqwestTransport` when none is given.
    pub fn new(manager: Manager, base: Option<Arc<dyn Transport>>) -> Self {
        let base = base.unwrap_or_else(|| Arc::new(ReqwestTransport::default()));
        Self { manager, base }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }
}

impl Manager {
    /// Guard `base` with this manager's state.
    pub fn wrap_transport(&self, base: Option<Arc<dyn Transport>>) -> GuardedTransport {
        GuardedTransport::new(self.clone(), base)
    }
}

impl Transport for GuardedTransport {
    fn execute(&self, request: reqwest::Request) -> ResponseFuture<'_> {
        Box::pin(async move {
            let (state, reason) = self.manager.state();
            if state.blocks_requests() {
                debug!(%state, url = %request.url(), "request blocked, authentication not valid");
                metrics::counter!("auth_guard_blocked_requests_total", "state" => state.as_str())
                    .increment(1);
                return Err(AuthInvalidError::new(reason, state).into());
            }

            let response = match self.base.execute(request).await {
                Ok(response) => response,
                Err(err) => {
                    let text = transport::error_chain(err.as_ref());
                    if !is_credential_error(&text) {
                        return Err(err);
                    }
                    warn!(error = %text, "transport error classified as credential failure");
                    self.manager.report_failure(text.clone());
                    return Err(AuthInvalidError::new(text, AuthState::Invalid).into());
                }
            };

            let status = response.status().as_u16();
            if status == 401 {
                warn!(url = %response.url(), "upstream returned 401");
                self.manager.report_failure(UNAUTHORIZED_REASON);
                drop(response);
                return Err(AuthInvalidError::new(UNAUTHORIZED_REASON, AuthState::Invalid).into());
            }
            if (200..400).contains(&status) {
                self.manager.report_success();
            }
            Ok(response)
        })
    }
}
