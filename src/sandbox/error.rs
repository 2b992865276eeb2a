use std::fmt;

use rhai::EvalAltResult;
use thiserror::Error;

use crate::kv::KvError;
use crate::values::ValueError;

/// Why a run was stopped by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The step budget was used up.
    StepLimit,
    /// Compute time (wall clock minus idle) reached its ceiling.
    DurationLimit,
    /// The hard wall-clock deadline expired.
    TotalDurationLimit,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::StepLimit => "execution step limit exceeded",
            Self::DurationLimit => "execution duration limit exceeded",
            Self::TotalDurationLimit => "total duration limit exceeded",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to compile script {script_id}: {message}")]
    Compile { script_id: String, message: String },

    #[error("module loading is not allowed (script {script_id} imports a module)")]
    ModuleLoadingDisallowed { script_id: String },

    #[error("missing permission: {permission}")]
    PermissionDenied { permission: String },

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("run cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("host call failed: {0}")]
    Host(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ScriptError {
    pub fn permission(permission: impl Into<String>) -> Self {
        Self::PermissionDenied {
            permission: permission.into(),
        }
    }

    /// Wraps the error as an uncatchable interpreter error. `try`/`catch`
    /// in scripts cannot intercept it; [`ScriptError::from_rhai`] recovers it.
    pub fn into_rhai(self) -> Box<EvalAltResult> {
        Box::new(EvalAltResult::ErrorSystem(self.to_string(), Box::new(self)))
    }

    /// Recovers the typed error from an interpreter error.
    pub fn from_rhai(err: EvalAltResult) -> Self {
        match err {
            EvalAltResult::ErrorSystem(message, inner) => match inner.downcast::<ScriptError>() {
                Ok(err) => *err,
                Err(_) => Self::Host(message),
            },
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
            | EvalAltResult::ErrorInModule(_, inner, _) => Self::from_rhai(*inner),
            other => Self::Script(other.to_string()),
        }
    }
}

/// Collaborator failures arrive as `anyhow` errors.
impl From<anyhow::Error> for ScriptError {
    fn from(err: anyhow::Error) -> Self {
        Self::Host(format!("{err:#}"))
    }
}

/// Terminal result of one run.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Cancelled(CancelReason),
    CompileError(String),
    ModuleLoadingDisallowed,
    RuntimeError(ScriptError),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Maps a run error onto its terminal outcome.
    pub fn from_error(err: ScriptError) -> Self {
        match err {
            ScriptError::Cancelled(reason) => Self::Cancelled(reason),
            ScriptError::Compile { message, .. } => Self::CompileError(message),
            ScriptError::ModuleLoadingDisallowed { .. } => Self::ModuleLoadingDisallowed,
            other => Self::RuntimeError(other),
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Cancelled(reason) => write!(f, "cancelled ({reason})"),
            Self::CompileError(message) => write!(f, "compile error: {message}"),
            Self::ModuleLoadingDisallowed => f.write_str("module loading disallowed"),
            Self::RuntimeError(err) => write!(f, "runtime error: {err}"),
        }
    }
}
