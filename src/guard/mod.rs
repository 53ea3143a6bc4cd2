//! The Decision Pipeline: orchestrates the eight lifecycle hooks over the
//! Policy Store, Budget Tracker and Routing Evaluator, and emits metrics as
//! a side effect.
//!
//! A sequential pipeline dispatches each stage's fallible step through a
//! uniform failure-mode switch (`FailOpen` continues with a warning,
//! `FailClosed` rejects), applied consistently across all eight hooks via
//! [`Guard::internal_invariant`].

use std::sync::Arc;

use tracing::warn;

use crate::budget::BudgetTracker;
use crate::config::GuardConfig;
use crate::metrics::{BaseAttributes, MetricsEmitter, PrometheusMetricsEmitter};
use crate::policy::{PolicySource, PolicyStore, SoftThresholdAction};
use crate::pricing::PricingTable;
use crate::routing::RoutingEvaluator;
use crate::store::PersistentBudgetStore;
use crate::types::{
    ActionOverrides, AdmissionDecision, DecisionAction, DecisionCore, FailureMode, IterationDecision, ModelDecision,
    ModelUsage, RoutingSignals, RunContext, RunStatus, ToolDecision, ToolUsage,
};

/// Owns every other component and is the only type a host application
/// constructs directly. Lifecycle is explicit: `new` → repeated hook calls
/// from the orchestration runtime → drop (no process-wide state, no
/// background threads that outlive the instance beyond the bounded
/// in-flight `tokio::spawn` tasks the Budget Tracker schedules for
/// persistence and late-arrival eviction).
pub struct Guard {
    policy: PolicyStore,
    budget: BudgetTracker,
    metrics: Arc<dyn MetricsEmitter>,
    failure_mode: FailureMode,
    include_run_id_in_metrics: bool,
}

impl Guard {
    pub fn new(
        config: &GuardConfig,
        policy_source: Box<dyn PolicySource>,
        store: Option<Arc<dyn PersistentBudgetStore>>,
    ) -> Result<Self, crate::policy::PolicyError> {
        let metrics: Arc<dyn MetricsEmitter> = Arc::new(PrometheusMetricsEmitter::new());
        Self::with_metrics(config, policy_source, store, metrics)
    }

    pub fn with_metrics(
        config: &GuardConfig,
        policy_source: Box<dyn PolicySource>,
        store: Option<Arc<dyn PersistentBudgetStore>>,
        metrics: Arc<dyn MetricsEmitter>,
    ) -> Result<Self, crate::policy::PolicyError> {
        let refresh_interval = std::time::Duration::from_secs(config.policy_refresh_interval_secs);
        let policy = PolicyStore::new(policy_source, refresh_interval)?;
        let budget = BudgetTracker::new(
            store,
            config.store_key_prefix.clone(),
            config.cas_max_attempts,
            chrono::Duration::seconds(config.late_arrival_grace_secs),
            metrics.clone(),
        );
        Ok(Self {
            policy,
            budget,
            metrics,
            failure_mode: config.failure_mode,
            include_run_id_in_metrics: config.include_run_id_in_metrics,
        })
    }

    /// Construct directly from an already-loaded snapshot and tracker — the
    /// shape embedding callers that build policy programmatically (and
    /// tests) use instead of `new`.
    pub fn from_parts(policy: PolicyStore, budget: BudgetTracker, metrics: Arc<dyn MetricsEmitter>, failure_mode: FailureMode) -> Self {
        Self { policy, budget, metrics, failure_mode, include_run_id_in_metrics: false }
    }

    pub fn pricing(&self) -> PricingTable {
        self.policy.snapshot().pricing.clone()
    }

    fn base_attributes(&self, ctx: &RunContext) -> BaseAttributes {
        BaseAttributes::from_context(ctx, self.include_run_id_in_metrics)
    }

    /// An internal invariant check that fails yields an allowing decision
    /// with a warning under `fail_open`, or the `reject` decision under
    /// `fail_closed`.
    fn internal_invariant<T>(&self, problem: &str, allow: T, reject: T) -> T {
        warn!(%problem, failure_mode = ?self.failure_mode, "internal invariant violated mid-decision");
        match self.failure_mode {
            FailureMode::FailOpen => allow,
            FailureMode::FailClosed => reject,
        }
    }

    fn validate_ids(ctx: &RunContext) -> Result<(), &'static str> {
        if ctx.tenant_id.is_empty() || ctx.strand_id.is_empty() || ctx.workflow_id.is_empty() || ctx.run_id.is_empty() {
            return Err("RunContext identifiers must not be empty");
        }
        Ok(())
    }

    /// `on_run_start`: admit or reject a new run. Delegates the precedence
    /// already implemented by the Budget Tracker's `open_run` (hard-limit
    /// reject, soft-threshold `HALT_NEW_RUNS` reject, `max_runs_per_period`,
    /// `max_concurrent_runs`) and only adds the failure-mode wrapper around
    /// the identifier-validity invariant.
    pub fn on_run_start(&self, ctx: RunContext) -> AdmissionDecision {
        if let Err(problem) = Self::validate_ids(&ctx) {
            return self.internal_invariant(
                problem,
                AdmissionDecision { core: DecisionCore::allow(DecisionAction::Admit).with_warning(problem) },
                AdmissionDecision { core: DecisionCore::deny(DecisionAction::Reject, problem) },
            );
        }
        let snapshot = self.policy.snapshot();
        self.budget.open_run(ctx, &snapshot)
    }

    /// `on_run_end`: idempotent; unknown `run_id` is a no-op warning per the
    /// `ContextUnknown` propagation policy (never an error to the caller).
    pub fn on_run_end(&self, run_id: &str, status: RunStatus) {
        let snapshot = self.policy.snapshot();
        self.budget.on_run_end(run_id, status, &snapshot);
    }

    pub fn on_iteration_start(&self, run_id: &str, idx: u32) -> IterationDecision {
        let snapshot = self.policy.snapshot();
        self.budget.check_iteration(run_id, idx, &snapshot)
    }

    /// `on_iteration_end`: advances the run's iteration counter and every
    /// applicable budget's `total_iterations`, separately from the
    /// admission check in `on_iteration_start` so a rejected iteration is
    /// never double-counted. Always admits — a halt for this iteration
    /// would already have been returned by `on_iteration_start`.
    pub fn on_iteration_end(&self, run_id: &str, idx: u32) -> IterationDecision {
        let snapshot = self.policy.snapshot();
        self.budget.record_iteration(run_id, idx, &snapshot);
        IterationDecision { core: DecisionCore::allow(DecisionAction::Admit) }
    }

    /// `before_model_call`: composes the Budget Tracker's headroom check
    /// with the Routing Evaluator's adaptive model selection, per the
    /// precedence ladder:
    /// 1. hard limit / per-run constraint exceeded → halt,
    /// 2. soft-threshold `DOWNGRADE_MODEL` → routing decides the effective model,
    /// 3. soft-threshold `LIMIT_CAPABILITIES` → cap `max_tokens_remaining`,
    /// 4. `LOG_ONLY` → allow with warning,
    /// 5. otherwise plain admit.
    pub fn before_model_call(&self, run_id: &str, model: &str, stage: &str, est_tokens: u64) -> ModelDecision {
        let snapshot = self.policy.snapshot();
        let Some(ctx) = self.budget.run_ctx_for_metrics(run_id) else {
            return ModelDecision {
                core: DecisionCore::allow(DecisionAction::Admit).with_warning(format!("unknown run_id '{run_id}'")),
                effective_model: model.to_string(),
                max_tokens: None,
                was_downgraded: false,
            };
        };

        let check = self.budget.check_model(run_id, est_tokens, &snapshot);
        if !check.allowed {
            let reason = check.reason.unwrap_or_else(|| "budget check failed".to_string());
            self.metrics.record_halt(&self.base_attributes(&ctx), &reason);
            return ModelDecision::unchanged(DecisionCore::deny(DecisionAction::Halt, reason), model, None);
        }

        // `DOWNGRADE_MODEL` is the only soft action that feeds the routing
        // evaluator's `soft_threshold_exceeded` signal — `LIMIT_CAPABILITIES`
        // and `LOG_ONLY` are applied directly below without ever invoking
        // routing, per the precedence ladder (step 2 is routing-specific).
        let downgrade_requested = check.soft_actions.contains(&SoftThresholdAction::DowngradeModel);
        let signals = RoutingSignals {
            soft_threshold_exceeded: check.soft_threshold_exceeded && downgrade_requested,
            remaining_budget: check.remaining_budget,
            iteration_count: self.budget.iteration_count(run_id),
            avg_latency_ms: self.budget.avg_latency_ms(run_id),
        };

        let routing_policy = snapshot.resolve_routing(&ctx.tenant_id, &ctx.strand_id, &ctx.workflow_id);
        let evaluation = routing_policy.map(|policy| RoutingEvaluator::evaluate(policy, stage, &signals));

        if let Some(eval) = &evaluation {
            if eval.was_downgraded {
                self.metrics.record_downgrade(
                    &self.base_attributes(&ctx),
                    model,
                    &eval.effective_model,
                    eval.reason.as_deref().unwrap_or("downgraded"),
                );
                let mut core = DecisionCore::allow(DecisionAction::Downgrade);
                core.reason = eval.reason.clone();
                core.remaining_budget = check.remaining_budget;
                core.remaining_tokens = check.remaining_tokens;
                return ModelDecision {
                    core,
                    effective_model: eval.effective_model.clone(),
                    max_tokens: eval.max_tokens,
                    was_downgraded: true,
                };
            }
        }

        let effective_model = evaluation.as_ref().map(|e| e.effective_model.clone()).unwrap_or_else(|| model.to_string());
        let max_tokens = evaluation.as_ref().and_then(|e| e.max_tokens);

        if check.soft_actions.contains(&SoftThresholdAction::LimitCapabilities) {
            let mut core = DecisionCore::allow(DecisionAction::Limit);
            core.reason = Some("soft threshold crossed: capabilities limited".to_string());
            core.remaining_budget = check.remaining_budget;
            core.remaining_tokens = check.remaining_tokens;
            core.action_overrides = ActionOverrides { max_tokens_remaining: check.remaining_tokens };
            return ModelDecision { core, effective_model, max_tokens, was_downgraded: false };
        }

        if check.soft_actions.contains(&SoftThresholdAction::LogOnly) {
            let mut core = DecisionCore::allow(DecisionAction::LogOnly)
                .with_warning("soft threshold crossed for an applicable budget".to_string());
            core.remaining_budget = check.remaining_budget;
            core.remaining_tokens = check.remaining_tokens;
            return ModelDecision { core, effective_model, max_tokens, was_downgraded: false };
        }

        let mut core = DecisionCore::allow(DecisionAction::Admit);
        core.remaining_budget = check.remaining_budget;
        core.remaining_tokens = check.remaining_tokens;
        ModelDecision { core, effective_model, max_tokens, was_downgraded: false }
    }

    /// `after_model_call`: prices the usage, records it against the run and
    /// every applicable budget, and checks whether recording just crossed a
    /// hard limit (caught here rather than only on the next hook so a run
    /// already mid-flight halts at the earliest opportunity).
    pub fn after_model_call(&self, run_id: &str, model: &str, usage: &ModelUsage, latency_ms: Option<f64>) -> ModelDecision {
        let snapshot = self.policy.snapshot();
        let Some(ctx) = self.budget.run_ctx_for_metrics(run_id) else {
            return ModelDecision {
                core: DecisionCore::allow(DecisionAction::Admit).with_warning(format!("unknown run_id '{run_id}'")),
                effective_model: model.to_string(),
                max_tokens: None,
                was_downgraded: false,
            };
        };

        let cost = snapshot.pricing.calculate_model_cost(model, usage);
        self.budget.record_model(run_id, model, usage, cost, &snapshot);
        if let Some(latency) = latency_ms {
            self.budget.record_latency(run_id, latency);
        }

        if let Some(reason) = self.post_update_hard_limit_breach(run_id, &snapshot) {
            self.metrics.record_halt(&self.base_attributes(&ctx), &reason);
            return ModelDecision::unchanged(DecisionCore::deny(DecisionAction::Halt, reason), model, None);
        }

        ModelDecision::unchanged(DecisionCore::allow(DecisionAction::Admit), model, None)
    }

    pub fn before_tool_call(&self, run_id: &str, _tool: &str) -> ToolDecision {
        let snapshot = self.policy.snapshot();
        self.budget.check_tool(run_id, &snapshot)
    }

    pub fn after_tool_call(&self, run_id: &str, tool: &str, usage: &ToolUsage) -> ToolDecision {
        let snapshot = self.policy.snapshot();
        let ctx = match self.budget.run_ctx_for_metrics(run_id) {
            Some(ctx) => ctx,
            None => return ToolDecision { core: DecisionCore::allow(DecisionAction::Admit).with_warning(format!("unknown run_id '{run_id}'")) },
        };

        let cost = snapshot.pricing.calculate_tool_cost(tool, usage);
        self.budget.record_tool(run_id, tool, usage, cost, &snapshot);

        if let Some(reason) = self.post_update_hard_limit_breach(run_id, &snapshot) {
            self.metrics.record_halt(&self.base_attributes(&ctx), &reason);
            return ToolDecision { core: DecisionCore::deny(DecisionAction::Halt, reason) };
        }

        ToolDecision { core: DecisionCore::allow(DecisionAction::Admit) }
    }

    /// `check_model`/`check_tool` already return the hard-limit halt for
    /// the *next* call; this re-checks immediately after recording so a
    /// budget exhausted by the call just made halts without waiting for
    /// the following hook.
    fn post_update_hard_limit_breach(&self, run_id: &str, snapshot: &crate::policy::PolicySnapshot) -> Option<String> {
        let check = self.budget.check_model(run_id, 0, snapshot);
        if !check.allowed {
            return check.reason;
        }
        None
    }
}
