//! Compiles scripts and drives single runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rhai::{Dynamic, Engine, EvalAltResult, Module, ModuleResolver, Position, Scope, Shared, AST};
use tracing::{debug, info, warn};

use super::account::{ExecutionAccount, INTERCEPT_STEPS};
use super::error::{RunOutcome, ScriptError};
use crate::capabilities::{CapabilitySurface, NAMESPACES};

/// A script as stored by the host. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub id: String,
    pub body: String,
}

impl Script {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }
}

/// Interpreter limits that do not depend on the guild's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLimits {
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_function_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_call_levels: 32,
            max_expr_depth: 64,
            max_function_expr_depth: 32,
            max_string_size: 64 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

/// Lifecycle of a script instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    Created,
    Compiling,
    CompileError,
    Ready,
    Running,
    Completed,
    Cancelled,
    RuntimeError,
}

/// Terminal result of a run plus its resource usage.
#[derive(Debug)]
pub struct RunReport {
    pub script_id: String,
    pub outcome: RunOutcome,
    pub steps: u64,
    pub execution_duration: Duration,
    pub idle_duration: Duration,
    pub total_duration: Duration,
}

/// Builds an engine with the restricted grammar and the interpreter limits.
fn restricted_engine(limits: &RuntimeLimits) -> Engine {
    let mut engine = Engine::new();

    // Only bounded iteration is allowed
    for symbol in ["while", "loop", "do", "eval"] {
        engine.disable_symbol(symbol);
    }

    engine
        .set_strict_variables(true)
        .set_max_call_levels(limits.max_call_levels)
        .set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth)
        .set_max_string_size(limits.max_string_size)
        .set_max_array_size(limits.max_array_size)
        .set_max_map_size(limits.max_map_size)
        .set_module_resolver(DenyModules);

    engine
}

/// The restricted grammar with `import` rejected by the parser.
fn script_engine(limits: &RuntimeLimits) -> Engine {
    let mut engine = restricted_engine(limits);
    engine.disable_symbol("import");
    engine
}

/// Module resolver that refuses every import. Imports never parse, so this
/// only backs up the parser.
struct DenyModules;

impl ModuleResolver for DenyModules {
    fn resolve(
        &self,
        _engine: &Engine,
        source: Option<&str>,
        _path: &str,
        _pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        Err(ScriptError::ModuleLoadingDisallowed {
            script_id: source.unwrap_or_default().to_string(),
        }
        .into_rhai())
    }
}

/// Compiles scripts against the restricted grammar.
pub struct ScriptRuntime {
    limits: RuntimeLimits,
    engine: Engine,
    /// Same grammar with `import` accepted; tells import rejections apart
    /// from other syntax errors.
    import_engine: Engine,
}

impl ScriptRuntime {
    pub fn new(limits: RuntimeLimits) -> Self {
        Self {
            limits,
            engine: script_engine(&limits),
            import_engine: restricted_engine(&limits),
        }
    }

    pub fn limits(&self) -> RuntimeLimits {
        self.limits
    }

    /// Parses `script`. Only the capability namespaces and names the
    /// script declares itself resolve. A script that imports a module is
    /// rejected here with [`ScriptError::ModuleLoadingDisallowed`].
    pub fn compile(&self, script: &Script) -> Result<CompiledScript, ScriptError> {
        let mut scope = Scope::new();
        for name in NAMESPACES {
            scope.push_dynamic(name, Dynamic::UNIT);
        }

        let mut ast = match self.engine.compile_with_scope(&scope, &script.body) {
            Ok(ast) => ast,
            Err(_) if self.import_engine.compile_with_scope(&scope, &script.body).is_ok() => {
                warn!(script_id = %script.id, "Script imports a module");
                return Err(ScriptError::ModuleLoadingDisallowed {
                    script_id: script.id.clone(),
                });
            }
            Err(e) => {
                return Err(ScriptError::Compile {
                    script_id: script.id.clone(),
                    message: e.to_string(),
                });
            }
        };
        ast.set_source(script.id.as_str());

        debug!(script_id = %script.id, "Script compiled");
        Ok(CompiledScript {
            id: script.id.clone(),
            ast: Arc::new(ast),
            limits: self.limits,
        })
    }
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::new(RuntimeLimits::default())
    }
}

/// A compiled script. Cheap to clone and shareable across runs.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    id: String,
    ast: Arc<AST>,
    limits: RuntimeLimits,
}

impl CompiledScript {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Binds the script to the account of one run.
    pub fn instance(&self, account: ExecutionAccount) -> ScriptInstance {
        ScriptInstance {
            script: self.clone(),
            account,
            state: ScriptState::Ready,
        }
    }
}

/// Step counter fed by the progress hook.
#[derive(Default)]
struct StepMeter {
    /// Operations evaluated so far.
    seen: AtomicU64,
    /// Operations already handed to the account.
    reported: AtomicU64,
}

impl StepMeter {
    /// Steps not yet reported; marks them reported.
    fn take_unreported(&self) -> u64 {
        let seen = self.seen.load(Ordering::Relaxed);
        let reported = self.reported.swap(seen, Ordering::Relaxed);
        seen.saturating_sub(reported)
    }
}

/// One execution of a compiled script.
pub struct ScriptInstance {
    script: CompiledScript,
    account: ExecutionAccount,
    state: ScriptState,
}

impl ScriptInstance {
    pub fn state(&self) -> ScriptState {
        self.state
    }

    pub fn account(&self) -> &ExecutionAccount {
        &self.account
    }

    /// Executes the script's top level once on the calling thread.
    ///
    /// Blocks until the script finishes, fails or is cancelled. Host calls
    /// made through `surface` block this thread too.
    ///
    /// # Panics
    ///
    /// Host calls drive their futures with [`tokio::runtime::Handle::block_on`],
    /// which panics when called from an async worker thread. Call this from
    /// a blocking thread, e.g. inside [`tokio::task::spawn_blocking`] as the
    /// dispatcher does.
    pub fn run(&mut self, surface: &CapabilitySurface) -> RunReport {
        if self.state != ScriptState::Ready {
            warn!(script_id = %self.script.id, state = ?self.state, "Instance already ran");
            return self.report(RunOutcome::RuntimeError(ScriptError::InvalidArgument(
                "script instance can only run once".to_string(),
            )));
        }

        let mut engine = script_engine(&self.script.limits);
        let meter = Arc::new(StepMeter::default());
        self.install_hooks(&mut engine, meter.clone());

        let mut scope = Scope::new();
        surface.install(&mut engine, &mut scope);

        self.state = ScriptState::Running;
        self.account.begin();
        let result = engine.run_ast_with_scope(&mut scope, &self.script.ast);
        self.account.add_steps(meter.take_unreported());

        let outcome = match result {
            Ok(()) => RunOutcome::Completed,
            Err(err) => match self.account.cancel_reason() {
                Some(reason) => RunOutcome::Cancelled(reason),
                None => RunOutcome::from_error(ScriptError::from_rhai(*err)),
            },
        };
        self.state = match outcome {
            RunOutcome::Completed => ScriptState::Completed,
            RunOutcome::Cancelled(_) => ScriptState::Cancelled,
            _ => ScriptState::RuntimeError,
        };

        let report = self.report(outcome);
        info!(
            script_id = %report.script_id,
            steps = report.steps,
            execution_ms = report.execution_duration.as_millis() as u64,
            idle_ms = report.idle_duration.as_millis() as u64,
            "Script {}",
            report.outcome
        );
        report
    }

    fn install_hooks(&self, engine: &mut Engine, meter: Arc<StepMeter>) {
        let account = self.account.clone();
        engine.on_progress(move |ops| {
            meter.seen.store(ops, Ordering::Relaxed);
            if ops % INTERCEPT_STEPS != 0 {
                return None;
            }
            account
                .on_step(meter.take_unreported())
                .map(|reason| Dynamic::from(reason.to_string()))
        });

        let script_id = self.script.id.clone();
        engine.on_print(move |text| {
            debug!(script_id = %script_id, "print: {text}");
        });

        let script_id = self.script.id.clone();
        engine.on_debug(move |text, _source, pos| {
            debug!(script_id = %script_id, "debug at {pos}: {text}");
        });
    }

    fn report(&self, outcome: RunOutcome) -> RunReport {
        let snapshot = self.account.snapshot();
        RunReport {
            script_id: self.script.id.clone(),
            outcome,
            steps: snapshot.total_steps,
            execution_duration: snapshot.execution_duration,
            idle_duration: snapshot.idle_duration,
            total_duration: snapshot.total_duration,
        }
    }
}
