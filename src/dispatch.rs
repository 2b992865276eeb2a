use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::runtime::Handle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::capabilities::{CapabilitySurface, HostLink, HostServices, ResponseTracker};
use crate::config::Config;
use crate::discord::{
    DerivedPermissions, Interaction, InteractionResponse, ResponseData, ResponseKind,
};
use crate::kv::KvLimits;
use crate::sandbox::{
    CancelReason, CompiledScript, ExecutionAccount, ExecutionBudget, RunOutcome, RunReport,
};

/// How long a cancelled run may take to notice before it is abandoned.
const CANCEL_GRACE: Duration = Duration::from_millis(50);

/// Runs compiled scripts for incoming interactions.
///
/// Every run gets a fresh account, response tracker and capability
/// surface. Runs never share interpreter state.
pub struct Dispatcher {
    services: HostServices,
    budget: ExecutionBudget,
    kv_limits: KvLimits,
    error_message: String,
}

impl Dispatcher {
    pub fn new(services: HostServices, config: &Config) -> Self {
        Self {
            services,
            budget: config.sandbox.budget(),
            kv_limits: config.kv.limits(),
            error_message: config.responses.error_message.clone(),
        }
    }

    /// Default budget for runs whose plan does not override it.
    pub fn budget(&self) -> ExecutionBudget {
        self.budget
    }

    pub async fn dispatch(
        &self,
        script: &CompiledScript,
        interaction: Interaction,
        permissions: DerivedPermissions,
    ) -> Result<RunReport> {
        self.dispatch_with_budget(script, interaction, permissions, self.budget)
            .await
    }

    /// Runs `script` once for `interaction` under `budget`.
    ///
    /// The run executes on a blocking thread. When the total deadline
    /// expires the account is cancelled, which stops the run at its next
    /// step and abandons a pending host call. A run that still has not
    /// stopped after a short grace period is left behind and reported as
    /// cancelled. The error reply is bounded by the same deadline.
    pub async fn dispatch_with_budget(
        &self,
        script: &CompiledScript,
        interaction: Interaction,
        permissions: DerivedPermissions,
        budget: ExecutionBudget,
    ) -> Result<RunReport> {
        let span = info_span!(
            "run",
            run_id = %Uuid::new_v4(),
            script_id = %script.id(),
            guild_id = %interaction.guild_id,
            interaction_id = %interaction.id,
        );
        self.run(script, Arc::new(interaction), permissions, budget)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        script: &CompiledScript,
        interaction: Arc<Interaction>,
        permissions: DerivedPermissions,
        budget: ExecutionBudget,
    ) -> Result<RunReport> {
        let account = ExecutionAccount::new(budget);
        let tracker = Arc::new(ResponseTracker::new());
        let surface = CapabilitySurface::standard(
            &self.services,
            interaction.clone(),
            permissions,
            self.kv_limits,
            HostLink::new(account.clone(), Handle::current()),
            tracker.clone(),
        );
        let mut instance = script.instance(account.clone());

        info!("Dispatching {:?} interaction", interaction.kind);
        let span = tracing::Span::current();
        let mut handle = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            instance.run(&surface)
        });

        let report = match tokio::time::timeout(budget.max_total_duration, &mut handle).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!(
                    "Run exceeded {}ms, cancelling",
                    budget.max_total_duration.as_millis()
                );
                account.cancel(CancelReason::TotalDurationLimit);
                match tokio::time::timeout(CANCEL_GRACE, &mut handle).await {
                    Ok(joined) => joined?,
                    Err(_) => {
                        error!("Run did not stop after cancellation, abandoning it");
                        abandoned_report(script.id(), &account)
                    }
                }
            }
        };

        if report.outcome.is_success() {
            info!(
                steps = report.steps,
                execution_ms = report.execution_duration.as_millis() as u64,
                idle_ms = report.idle_duration.as_millis() as u64,
                "Run completed"
            );
        } else {
            warn!(steps = report.steps, "Run failed: {}", report.outcome);
            let notify = self.notify_failure(&interaction, &tracker);
            if tokio::time::timeout(budget.max_total_duration, notify)
                .await
                .is_err()
            {
                error!("Timed out sending error message");
            }
        }

        Ok(report)
    }

    /// Tells the user the run failed. Sent once and never retried.
    async fn notify_failure(&self, interaction: &Interaction, tracker: &ResponseTracker) {
        let data = ResponseData {
            content: Some(self.error_message.clone()),
            embeds: Vec::new(),
            ephemeral: true,
        };
        let rest = &self.services.rest;

        let result = if tracker.has_responded() {
            rest.create_followup_message(&interaction.application_id, &interaction.token, &data)
                .await
                .map(|_| ())
        } else {
            let response = InteractionResponse {
                kind: ResponseKind::ChannelMessageWithSource,
                data: Some(data),
            };
            rest.create_interaction_response(&interaction.id, &interaction.token, &response)
                .await
                .map(|_| ())
        };

        if let Err(e) = result {
            error!("Failed to send error message: {e:#}");
        }
    }
}

/// Report for a run whose thread did not stop in time.
fn abandoned_report(script_id: &str, account: &ExecutionAccount) -> RunReport {
    let snapshot = account.snapshot();
    RunReport {
        script_id: script_id.to_string(),
        outcome: RunOutcome::Cancelled(
            snapshot
                .cancelled
                .unwrap_or(CancelReason::TotalDurationLimit),
        ),
        steps: snapshot.total_steps,
        execution_duration: snapshot.execution_duration,
        idle_duration: snapshot.idle_duration,
        total_duration: snapshot.total_duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::{
        CacheSnapshot, InMemoryCache, InteractionKind, Member, RecordingRest, RestCall, User,
    };
    use crate::kv::{KvStore, MemoryKvStore};
    use crate::sandbox::{Script, ScriptRuntime};

    fn interaction(kind: InteractionKind) -> Interaction {
        Interaction {
            id: "10".to_string(),
            application_id: "20".to_string(),
            token: "tok".to_string(),
            kind,
            guild_id: "1".to_string(),
            channel_id: "2".to_string(),
            member: Member {
                user: User {
                    id: "5".to_string(),
                    username: "alice".to_string(),
                    ..User::default()
                },
                ..Member::default()
            },
            message: None,
            command: None,
            custom_id: None,
        }
    }

    fn dispatcher(rest: Arc<RecordingRest>, kv: Arc<MemoryKvStore>) -> Dispatcher {
        let services = HostServices {
            cache: Arc::new(InMemoryCache::new(CacheSnapshot::default())),
            rest,
            kv,
            saved_messages: None,
        };
        let mut config = Config::default();
        config.responses.error_message = "Script failed".to_string();
        Dispatcher::new(services, &config)
    }

    fn compile(body: &str) -> CompiledScript {
        ScriptRuntime::default()
            .compile(&Script::new("s1", body))
            .unwrap()
    }

    fn content(call: &RestCall) -> Option<String> {
        match call {
            RestCall::InteractionResponse { response, .. } => {
                response.data.as_ref().and_then(|d| d.content.clone())
            }
            RestCall::Followup { data, .. } => data.content.clone(),
            _ => None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_completed_run_sends_no_error() {
        let rest = Arc::new(RecordingRest::new());
        let dispatcher = dispatcher(rest.clone(), Arc::new(MemoryKvStore::new()));

        let report = dispatcher
            .dispatch(
                &compile(r#"ctx.respond("pong");"#),
                interaction(InteractionKind::Command),
                DerivedPermissions::default(),
            )
            .await
            .unwrap();

        assert!(matches!(report.outcome, RunOutcome::Completed));
        assert_eq!(rest.call_count(), 1);
        assert_eq!(content(&rest.calls()[0]).as_deref(), Some("pong"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_before_response_sends_initial_error() {
        let rest = Arc::new(RecordingRest::new());
        let dispatcher = dispatcher(rest.clone(), Arc::new(MemoryKvStore::new()));

        let report = dispatcher
            .dispatch(
                &compile(r#"throw "nope";"#),
                interaction(InteractionKind::Component),
                DerivedPermissions::default(),
            )
            .await
            .unwrap();

        assert!(matches!(report.outcome, RunOutcome::RuntimeError(_)));
        let calls = rest.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            RestCall::InteractionResponse { response, .. } => {
                let data = response.data.as_ref().unwrap();
                assert_eq!(data.content.as_deref(), Some("Script failed"));
                assert!(data.ephemeral);
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_after_response_sends_followup() {
        let rest = Arc::new(RecordingRest::new());
        let dispatcher = dispatcher(rest.clone(), Arc::new(MemoryKvStore::new()));

        let budget = ExecutionBudget {
            max_execution_steps: 300,
            ..dispatcher.budget()
        };
        let report = dispatcher
            .dispatch_with_budget(
                &compile(r#"ctx.respond("working"); let n = 0; for i in 0..1000000 { n += 1; }"#),
                interaction(InteractionKind::Command),
                DerivedPermissions::default(),
                budget,
            )
            .await
            .unwrap();

        assert!(matches!(report.outcome, RunOutcome::Cancelled(CancelReason::StepLimit)));
        let calls = rest.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(content(&calls[0]).as_deref(), Some("working"));
        assert!(matches!(calls[1], RestCall::Followup { .. }));
        assert_eq!(content(&calls[1]).as_deref(), Some("Script failed"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_total_deadline_cancels_slow_run() {
        let rest = Arc::new(RecordingRest::new().with_delay(Duration::from_millis(80)));
        let dispatcher = dispatcher(rest.clone(), Arc::new(MemoryKvStore::new()));

        let budget = ExecutionBudget {
            max_execution_steps: 1_000_000,
            max_execution_duration: Duration::from_secs(5),
            max_total_duration: Duration::from_millis(200),
        };
        let report = dispatcher
            .dispatch_with_budget(
                &compile(r#"for i in 0..100 { ctx.respond("tick"); }"#),
                interaction(InteractionKind::Command),
                DerivedPermissions::default(),
                budget,
            )
            .await
            .unwrap();

        assert!(matches!(
            report.outcome,
            RunOutcome::Cancelled(CancelReason::TotalDurationLimit)
        ));
        // A few ticks plus the error followup
        let ticks = rest
            .calls()
            .iter()
            .filter(|c| content(c).as_deref() == Some("tick"))
            .count();
        assert!(ticks < 100);
        assert_eq!(
            content(rest.calls().last().unwrap()).as_deref(),
            Some("Script failed")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_total_deadline_is_a_hard_ceiling() {
        let rest = Arc::new(RecordingRest::new().with_delay(Duration::from_secs(2)));
        let dispatcher = dispatcher(rest.clone(), Arc::new(MemoryKvStore::new()));

        let budget = ExecutionBudget {
            max_execution_steps: 1_000_000,
            max_execution_duration: Duration::from_secs(5),
            max_total_duration: Duration::from_millis(200),
        };
        let started = std::time::Instant::now();
        let report = dispatcher
            .dispatch_with_budget(
                &compile(r#"ctx.respond("slow"); ctx.respond("never");"#),
                interaction(InteractionKind::Command),
                DerivedPermissions::default(),
                budget,
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            report.outcome,
            RunOutcome::Cancelled(CancelReason::TotalDurationLimit)
        ));
        // The pending reply and the error reply were both cut off
        assert_eq!(rest.call_count(), 0);
    }

    #[test]
    fn test_abandoned_report_keeps_first_reason() {
        let account = ExecutionAccount::new(ExecutionBudget::default());
        account.add_steps(42);
        account.cancel(CancelReason::StepLimit);

        let report = abandoned_report("s1", &account);
        assert!(matches!(report.outcome, RunOutcome::Cancelled(CancelReason::StepLimit)));
        assert_eq!(report.steps, 42);
        assert_eq!(report.script_id, "s1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runs_share_only_kv() {
        let rest = Arc::new(RecordingRest::new());
        let kv = Arc::new(MemoryKvStore::new());
        let dispatcher = dispatcher(rest.clone(), kv.clone());
        let script = compile(r#"let n = kv.increase("clicks"); ctx.respond(`${n}`);"#);

        for _ in 0..3 {
            let report = dispatcher
                .dispatch(
                    &script,
                    interaction(InteractionKind::Component),
                    DerivedPermissions::default(),
                )
                .await
                .unwrap();
            assert!(matches!(report.outcome, RunOutcome::Completed));
        }

        let entry = kv.get("1", "clicks").await.unwrap().unwrap();
        assert_eq!(crate::values::from_json_str(&entry.value).unwrap().as_int().unwrap(), 3);
        // Each run starts without a response, so each reply is an initial one
        assert!(rest
            .calls()
            .iter()
            .all(|c| matches!(c, RestCall::InteractionResponse { .. })));
    }
}
