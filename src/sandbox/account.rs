//! Per-run resource accounting.
//!
//! The account tracks evaluated steps, compute time and idle time for one
//! run and records the first cancellation. It is shared between the run
//! thread (progress hook, host calls) and the dispatcher (deadline), so all
//! state sits behind one mutex. Cancellation is also broadcast on a watch
//! channel so pending host calls can stop waiting.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

use super::error::{CancelReason, ScriptError};

/// Steps between two progress interceptions.
pub const INTERCEPT_STEPS: u64 = 10;

/// Limits for one run, usually chosen by the guild's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionBudget {
    pub max_execution_steps: u64,
    pub max_execution_duration: Duration,
    pub max_total_duration: Duration,
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self {
            max_execution_steps: 100_000,
            max_execution_duration: Duration::from_millis(500),
            max_total_duration: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct AccountState {
    total_steps: u64,
    start_time: Instant,
    idle_start: Option<Instant>,
    idle_accumulated: Duration,
    cancelled: Option<CancelReason>,
}

impl AccountState {
    fn idle_duration(&self, now: Instant) -> Duration {
        let ongoing = self
            .idle_start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();
        self.idle_accumulated + ongoing
    }

    fn execution_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start_time)
            .saturating_sub(self.idle_duration(now))
    }

    fn cancel(&mut self, reason: CancelReason) -> bool {
        if self.cancelled.is_some() {
            return false;
        }
        self.cancelled = Some(reason);
        true
    }
}

/// Point-in-time copy of an account's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub total_steps: u64,
    pub execution_duration: Duration,
    pub idle_duration: Duration,
    pub total_duration: Duration,
    pub cancelled: Option<CancelReason>,
}

/// Step, duration and cancellation bookkeeping for one run.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct ExecutionAccount {
    budget: ExecutionBudget,
    state: Arc<Mutex<AccountState>>,
    signal: Arc<watch::Sender<Option<CancelReason>>>,
}

impl ExecutionAccount {
    pub fn new(budget: ExecutionBudget) -> Self {
        Self {
            budget,
            state: Arc::new(Mutex::new(AccountState {
                total_steps: 0,
                start_time: Instant::now(),
                idle_start: None,
                idle_accumulated: Duration::ZERO,
                cancelled: None,
            })),
            signal: Arc::new(watch::Sender::new(None)),
        }
    }

    pub fn budget(&self) -> ExecutionBudget {
        self.budget
    }

    fn lock(&self) -> MutexGuard<'_, AccountState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Restarts the clocks. Called when the run starts so compilation and
    /// setup are not billed.
    pub fn begin(&self) {
        let mut state = self.lock();
        state.start_time = Instant::now();
        state.idle_start = None;
        state.idle_accumulated = Duration::ZERO;
    }

    /// Records `steps` evaluated operations and applies the limits.
    ///
    /// The duration limit is checked before the step limit. Returns the
    /// cancellation reason if the run is (now or already) cancelled.
    pub fn on_step(&self, steps: u64) -> Option<CancelReason> {
        let mut state = self.lock();
        state.total_steps = state.total_steps.saturating_add(steps);
        if let Some(reason) = state.cancelled {
            return Some(reason);
        }

        let execution = state.execution_duration(Instant::now());
        let reason = if execution >= self.budget.max_execution_duration {
            Some(CancelReason::DurationLimit)
        } else if state.total_steps >= self.budget.max_execution_steps {
            Some(CancelReason::StepLimit)
        } else {
            None
        };

        if let Some(reason) = reason {
            state.cancel(reason);
            self.signal.send_replace(Some(reason));
            debug!(
                steps = state.total_steps,
                execution_ms = execution.as_millis() as u64,
                "Run cancelled: {reason}"
            );
        }
        reason
    }

    /// Counts steps without applying limits.
    pub fn add_steps(&self, steps: u64) {
        let mut state = self.lock();
        state.total_steps = state.total_steps.saturating_add(steps);
    }

    /// Starts an idle interval. Ignored if one is already open.
    pub fn mark_idle(&self) {
        let mut state = self.lock();
        if state.idle_start.is_none() {
            state.idle_start = Some(Instant::now());
        }
    }

    /// Closes the open idle interval, if any.
    pub fn mark_active(&self) {
        let mut state = self.lock();
        if let Some(start) = state.idle_start.take() {
            state.idle_accumulated += Instant::now().saturating_duration_since(start);
        }
    }

    /// Marks the account idle until the returned guard is dropped.
    ///
    /// Only the outermost guard closes the interval.
    pub fn idle(&self) -> IdleGuard<'_> {
        let owner = {
            let mut state = self.lock();
            if state.idle_start.is_none() {
                state.idle_start = Some(Instant::now());
                true
            } else {
                false
            }
        };
        IdleGuard {
            account: self,
            owner,
        }
    }

    /// Records a cancellation. The first reason wins; returns whether this
    /// call was the one that cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let cancelled = self.lock().cancel(reason);
        if cancelled {
            self.signal.send_replace(Some(reason));
            debug!("Run cancelled: {reason}");
        }
        cancelled
    }

    /// Resolves with the cancellation reason once the run is cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.signal.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled.is_some()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.lock().cancelled
    }

    /// Fails with [`ScriptError::Cancelled`] once the run is cancelled.
    pub fn ensure_active(&self) -> Result<(), ScriptError> {
        match self.cancel_reason() {
            Some(reason) => Err(ScriptError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    pub fn total_steps(&self) -> u64 {
        self.lock().total_steps
    }

    /// Wall-clock time since start minus idle time.
    pub fn execution_duration(&self) -> Duration {
        self.lock().execution_duration(Instant::now())
    }

    pub fn idle_duration(&self) -> Duration {
        self.lock().idle_duration(Instant::now())
    }

    pub fn total_duration(&self) -> Duration {
        self.lock().start_time.elapsed()
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        let state = self.lock();
        let now = Instant::now();
        AccountSnapshot {
            total_steps: state.total_steps,
            execution_duration: state.execution_duration(now),
            idle_duration: state.idle_duration(now),
            total_duration: now.saturating_duration_since(state.start_time),
            cancelled: state.cancelled,
        }
    }
}

/// Closes an idle interval on drop. See [`ExecutionAccount::idle`].
#[must_use = "the account is active again as soon as the guard is dropped"]
pub struct IdleGuard<'a> {
    account: &'a ExecutionAccount,
    owner: bool,
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        if self.owner {
            self.account.mark_active();
        }
    }
}
