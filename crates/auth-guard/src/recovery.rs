//! Background recovery sequence
//!
//! Spawned by the manager when a failure is accepted or a retry is
//! triggered. Runs the recovery test up to `max_attempts` times with the
//! configured backoff, stopping at the first success. Individual test
//! failures are logged and swallowed; only the terminal transition is
//! observable.
//!
//! The backoff sleep and the test call both race against the sequence's
//! cancellation token, so `report_success`, a newer sequence, or manager
//! shutdown stop the task promptly rather than at the next iteration.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::Shared;
use crate::state::AuthState;

/// Backoff used when recovery is enabled and no schedule is configured.
pub const DEFAULT_BACKOFF: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(15),
];

/// Failure reason stored once every attempt has failed.
pub const RECOVERY_EXHAUSTED_REASON: &str =
    "Recovery failed after maximum attempts. Please re-authenticate.";

/// Delay before the given zero-based attempt.
///
/// Indices past the end of the schedule reuse its last entry; an empty
/// schedule means no delay.
pub fn backoff_delay(schedule: &[Duration], attempt: u32) -> Duration {
    let Some(last) = schedule.last() else {
        return Duration::ZERO;
    };
    schedule
        .get(attempt as usize)
        .copied()
        .unwrap_or(*last)
}

/// Run one recovery sequence to completion or cancellation.
pub(crate) async fn run(shared: Arc<Shared>, generation: u64, cancel: CancellationToken) {
    let max_attempts = shared.max_attempts;

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            debug!(generation, attempt, "recovery cancelled");
            return;
        }

        let delay = backoff_delay(&shared.backoff, attempt);
        if !delay.is_zero() {
            debug!(generation, attempt, delay_ms = delay.as_millis() as u64, "recovery backoff");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(generation, attempt, "recovery cancelled during backoff");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return;
        }

        let outcome = match shared.recovery_test() {
            None => Ok(()),
            Some(test) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(generation, attempt, "recovery cancelled during test");
                        return;
                    }
                    outcome = test() => outcome,
                }
            }
        };

        match outcome {
            Ok(()) => {
                metrics::counter!("auth_guard_recovery_attempts_total", "outcome" => "success")
                    .increment(1);
                info!(generation, attempt = attempt + 1, "recovery test passed");
                shared.finish_recovery(generation, &cancel, AuthState::Valid, String::new());
                return;
            }
            Err(e) => {
                metrics::counter!("auth_guard_recovery_attempts_total", "outcome" => "failure")
                    .increment(1);
                warn!(
                    generation,
                    attempt = attempt + 1,
                    max_attempts,
                    error = %e,
                    "recovery test failed"
                );
            }
        }
    }

    warn!(generation, max_attempts, "recovery attempts exhausted");
    shared.finish_recovery(
        generation,
        &cancel,
        AuthState::Invalid,
        RECOVERY_EXHAUSTED_REASON.to_string(),
    );
}
