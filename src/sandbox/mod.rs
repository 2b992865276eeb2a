//! Execution sandbox for guild scripts.
//!
//! A run is metered by an [`ExecutionAccount`]: every operation the
//! interpreter evaluates is a step, and time spent waiting on host calls
//! is idle time that does not count against the compute budget. The
//! [`ScriptRuntime`] compiles scripts against a grammar without unbounded
//! loops, dynamic evaluation or module imports.

pub mod account;
pub mod error;
pub mod runtime;

pub use account::{AccountSnapshot, ExecutionAccount, ExecutionBudget, IdleGuard, INTERCEPT_STEPS};
pub use error::{CancelReason, RunOutcome, ScriptError};
pub use runtime::{
    CompiledScript, RunReport, RuntimeLimits, Script, ScriptInstance, ScriptRuntime, ScriptState,
};
