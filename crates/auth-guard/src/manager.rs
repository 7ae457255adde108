//! Authentication state manager
//!
//! Owns the current state, the failure reason, and the background recovery
//! sequence. All reads and writes go through one mutex, held only for field
//! updates and the synchronous state-change callback, never across I/O.
//!
//! `Manager` is a cheap handle (`Arc` inside). Construct one per guarded
//! client and hand clones to the transport guard and to whatever renders
//! status; there is no process-wide instance.
//!
//! The `on_state_change` callback runs while the lock is held, so every
//! transition is observed in order and together with its reason. The
//! callback must not call back into the manager: `state()`, `report_*` and
//! `trigger_retry()` would deadlock. Consumers that need to react by calling
//! the manager should use [`Manager::subscribe`] instead. A panicking
//! callback is caught and logged; the transition still stands.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use transport::BoxError;

use crate::recovery::{self, DEFAULT_BACKOFF};
use crate::state::{AuthState, Snapshot};

/// Called with the new state and reason after every accepted transition.
pub type StateCallback = Arc<dyn Fn(AuthState, &str) + Send + Sync>;

/// Future returned by a recovery test.
pub type RecoveryFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// Probe invoked by the recovery sequence; `Ok` means authentication works again.
pub type RecoveryTest = Arc<dyn Fn() -> RecoveryFuture + Send + Sync>;

/// Stored when a failure is reported without a reason; only `Valid` has an
/// empty reason.
pub const UNSPECIFIED_FAILURE_REASON: &str = "authentication failed";

/// Manager construction parameters.
///
/// `max_attempts == 0` disables automatic recovery: failures go straight to
/// `Invalid`. `backoff == None` selects [`DEFAULT_BACKOFF`]; `Some(vec![])`
/// means no delay between attempts.
#[derive(Clone, Default)]
pub struct ManagerConfig {
    pub max_attempts: u32,
    pub backoff: Option<Vec<Duration>>,
    pub on_state_change: Option<StateCallback>,
    pub recovery_test: Option<RecoveryTest>,
}

impl ManagerConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn backoff(mut self, schedule: Vec<Duration>) -> Self {
        self.backoff = Some(schedule);
        self
    }

    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(AuthState, &str) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }

    pub fn recovery_test<F, Fut>(mut self, test: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.recovery_test = Some(boxed_test(test));
        self
    }
}

impl fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("on_state_change", &self.on_state_change.is_some())
            .field("recovery_test", &self.recovery_test.is_some())
            .finish()
    }
}

fn boxed_test<F, Fut>(test: F) -> RecoveryTest
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move || -> RecoveryFuture { Box::pin(test()) })
}

/// Lock-protected mutable fields.
struct Inner {
    state: AuthState,
    reason: String,
    /// Bumped each time a recovery sequence starts; a sequence may only apply
    /// its terminal transition while its generation is still current.
    generation: u64,
    /// Cancellation handle of the live recovery sequence, if any.
    active: Option<CancellationToken>,
    recovery_test: Option<RecoveryTest>,
}

pub(crate) struct Shared {
    inner: Mutex<Inner>,
    pub(crate) max_attempts: u32,
    pub(crate) backoff: Vec<Duration>,
    on_state_change: Option<StateCallback>,
    snapshots: watch::Sender<Snapshot>,
    lifetime: CancellationToken,
    tasks: TaskTracker,
}

/// Handle to the shared authentication state.
#[derive(Clone)]
pub struct Manager {
    shared: Arc<Shared>,
}

impl Manager {
    /// Create a manager in the `Valid` state.
    pub fn new(config: ManagerConfig) -> Self {
        let backoff = match config.backoff {
            Some(schedule) => schedule,
            None if config.max_attempts > 0 => DEFAULT_BACKOFF.to_vec(),
            None => Vec::new(),
        };
        let (snapshots, _) = watch::channel(Snapshot::valid());

        info!(
            max_attempts = config.max_attempts,
            backoff_steps = backoff.len(),
            "auth manager initialized"
        );

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: AuthState::Valid,
                    reason: String::new(),
                    generation: 0,
                    active: None,
                    recovery_test: config.recovery_test,
                }),
                max_attempts: config.max_attempts,
                backoff,
                on_state_change: config.on_state_change,
                snapshots,
                lifetime: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Current state and failure reason, read together.
    pub fn state(&self) -> (AuthState, String) {
        let inner = self.shared.lock();
        (inner.state, inner.reason.clone())
    }

    pub fn snapshot(&self) -> Snapshot {
        let (state, reason) = self.state();
        Snapshot { state, reason }
    }

    pub fn is_valid(&self) -> bool {
        self.shared.lock().state == AuthState::Valid
    }

    /// Receiver that observes every transition after it is applied.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Record an authentication failure.
    ///
    /// Only accepted while `Valid`; repeated reports while `Invalid` or
    /// `Recovering` are ignored so concurrent callers cannot restart recovery
    /// or re-fire the callback. Must be called within a Tokio runtime when
    /// automatic recovery is enabled.
    pub fn report_failure(&self, reason: impl Into<String>) {
        let mut reason = reason.into();
        if reason.is_empty() {
            reason = UNSPECIFIED_FAILURE_REASON.to_string();
        }
        let mut inner = self.shared.lock();
        if inner.state != AuthState::Valid {
            debug!(state = %inner.state, %reason, "failure report ignored, not valid");
            return;
        }

        if self.shared.max_attempts > 0 {
            self.shared.transition(&mut inner, AuthState::Recovering, reason);
            self.shared.start_recovery(&mut inner);
        } else {
            self.shared.transition(&mut inner, AuthState::Invalid, reason);
        }
    }

    /// Record a successful authenticated call.
    ///
    /// Cancels any in-flight recovery and returns to `Valid`. No callback
    /// fires when already `Valid`.
    pub fn report_success(&self) {
        let mut inner = self.shared.lock();
        if let Some(token) = inner.active.take() {
            debug!("success reported, cancelling recovery");
            token.cancel();
        }
        if inner.state == AuthState::Valid {
            return;
        }
        self.shared.transition(&mut inner, AuthState::Valid, String::new());
    }

    /// Restart recovery from `Invalid` using the stored failure reason.
    ///
    /// Ignored from `Valid` or `Recovering`, and when automatic recovery is disabled.
    pub fn trigger_retry(&self) {
        let mut inner = self.shared.lock();
        if inner.state != AuthState::Invalid {
            debug!(state = %inner.state, "retry ignored, not invalid");
            return;
        }
        if self.shared.max_attempts == 0 {
            debug!("retry ignored, automatic recovery disabled");
            return;
        }

        let reason = inner.reason.clone();
        info!(%reason, "manual retry requested");
        self.shared.transition(&mut inner, AuthState::Recovering, reason);
        self.shared.start_recovery(&mut inner);
    }

    /// Replace the recovery test used by future attempts.
    ///
    /// For probes that depend on a resource built after the manager, such as
    /// a client that itself wraps the guarded transport.
    pub fn set_recovery_test<F, Fut>(&self, test: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.shared.lock().recovery_test = Some(boxed_test(test));
        debug!("recovery test replaced");
    }

    /// Cancel recovery and wait for every background task to exit.
    ///
    /// Returns promptly even mid-backoff: both the delay and the recovery
    /// test race against cancellation. No recovery sequence starts afterwards.
    pub async fn shutdown(&self) {
        if let Some(token) = self.shared.lock().active.take() {
            token.cancel();
        }
        self.shared.lifetime.cancel();
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        info!("auth manager shut down");
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (state, reason) = self.state();
        f.debug_struct("Manager")
            .field("state", &state)
            .field("reason", &reason)
            .field("max_attempts", &self.shared.max_attempts)
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves Inner consistent between statements.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a transition. Caller holds the lock.
    fn transition(&self, inner: &mut Inner, to: AuthState, reason: String) {
        let from = inner.state;
        inner.state = to;
        inner.reason = reason;

        info!(%from, %to, reason = %inner.reason, "auth state changed");
        metrics::counter!("auth_guard_transitions_total", "to" => to.as_str()).increment(1);

        self.snapshots.send_replace(Snapshot {
            state: to,
            reason: inner.reason.clone(),
        });
        if let Some(callback) = &self.on_state_change {
            let reason = inner.reason.as_str();
            if panic::catch_unwind(AssertUnwindSafe(|| callback(to, reason))).is_err() {
                error!(%from, %to, "state change callback panicked");
            }
        }
    }

    /// Cancel the previous sequence and spawn a new one. Caller holds the lock.
    fn start_recovery(self: &Arc<Self>, inner: &mut Inner) {
        if let Some(previous) = inner.active.take() {
            previous.cancel();
        }
        if self.lifetime.is_cancelled() {
            warn!("manager shut down, recovery not started");
            return;
        }

        inner.generation += 1;
        let generation = inner.generation;
        let cancel = self.lifetime.child_token();
        inner.active = Some(cancel.clone());

        debug!(generation, max_attempts = self.max_attempts, "starting recovery sequence");
        self.tasks
            .spawn(recovery::run(Arc::clone(self), generation, cancel));
    }

    pub(crate) fn recovery_test(&self) -> Option<RecoveryTest> {
        self.lock().recovery_test.clone()
    }

    /// Terminal transition of a recovery sequence.
    ///
    /// Applied only if the sequence is still the live one and the manager is
    /// still `Recovering`; a newer sequence or an explicit success wins.
    pub(crate) fn finish_recovery(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        to: AuthState,
        reason: String,
    ) {
        let mut inner = self.lock();
        if cancel.is_cancelled()
            || inner.generation != generation
            || inner.state != AuthState::Recovering
        {
            debug!(
                generation,
                current = inner.generation,
                state = %inner.state,
                "stale recovery result discarded"
            );
            return;
        }
        inner.active = None;
        self.transition(&mut inner, to, reason);
    }
}
