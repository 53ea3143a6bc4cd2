//! The budget accounting engine: period-windowed counters for cost, runs,
//! tokens, iterations and tool calls, threshold-crossing detection, and
//! concurrent-run tracking.
//!
//! Each budget is tracked independently, keyed by `(budget_id, scope_key)`,
//! with its own mutex-guarded accumulator and period window so updates to
//! one budget never block another.

pub mod run_state;
pub mod state;
pub mod window;

pub use run_state::RunState;
pub use state::BudgetState;
pub use window::Period;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use tracing::warn;

use crate::metrics::{BaseAttributes, MetricsEmitter, RunEvent};
use crate::policy::{BudgetSpec, HardLimitAction, PolicySnapshot, SoftThresholdAction};
use crate::store::{build_scope_key, cas_update, persistent_key, PersistentBudgetStore};
use crate::types::{
    ActionOverrides, AdmissionDecision, DecisionAction, DecisionCore, IterationDecision, ModelUsage, RunContext,
    RunStatus, ToolDecision, ToolUsage,
};

/// Remaining-headroom facts the Routing Evaluator needs, derived from
/// budget state just ahead of a model-call hook.
#[derive(Debug, Clone, Default)]
pub struct ModelCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub soft_threshold_exceeded: bool,
    pub remaining_budget: Option<f64>,
    /// Distinct soft-threshold actions configured on budgets whose
    /// utilization has crossed at least one threshold this period; the
    /// guard uses this to decide between `LIMIT_CAPABILITIES`,
    /// `DOWNGRADE_MODEL` and `LOG_ONLY` per the guard's decision precedence.
    pub soft_actions: Vec<SoftThresholdAction>,
    /// Remaining per-run token headroom against the tightest applicable
    /// `max_tokens` constraint, if any is configured.
    pub remaining_tokens: Option<u64>,
}

pub struct BudgetTracker {
    runs: DashMap<String, Arc<Mutex<RunState>>>,
    budgets: DashMap<(String, String), Arc<Mutex<BudgetState>>>,
    store: Option<Arc<dyn PersistentBudgetStore>>,
    store_key_prefix: String,
    cas_max_attempts: u32,
    late_arrival_grace: chrono::Duration,
    store_degraded: Arc<AtomicBool>,
    metrics: Arc<dyn MetricsEmitter>,
}

impl BudgetTracker {
    pub fn new(
        store: Option<Arc<dyn PersistentBudgetStore>>,
        store_key_prefix: impl Into<String>,
        cas_max_attempts: u32,
        late_arrival_grace: chrono::Duration,
        metrics: Arc<dyn MetricsEmitter>,
    ) -> Self {
        Self {
            runs: DashMap::new(),
            budgets: DashMap::new(),
            store,
            store_key_prefix: store_key_prefix.into(),
            cas_max_attempts,
            late_arrival_grace,
            store_degraded: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    pub fn store_degraded_flag(&self) -> Arc<AtomicBool> {
        self.store_degraded.clone()
    }

    fn budget_state(&self, spec: &BudgetSpec, scope_key: &str) -> Arc<Mutex<BudgetState>> {
        self.budgets
            .entry((spec.id.clone(), scope_key.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(BudgetState::new(spec.period, Utc::now()))))
            .clone()
    }

    /// Applicable budgets for this context, sorted ascending by
    /// `(budget_id, scope_key)` — the lock-acquisition order the
    /// concurrency model requires to prevent deadlock across multi-budget
    /// updates.
    fn sorted_applicable(&self, ctx: &RunContext, snapshot: &PolicySnapshot) -> Vec<(BudgetSpec, String)> {
        let mut entries: Vec<(BudgetSpec, String)> = snapshot
            .resolve_budgets(&ctx.tenant_id, &ctx.strand_id, &ctx.workflow_id)
            .into_iter()
            .filter(|spec| spec.enabled)
            .map(|spec| {
                let key = build_scope_key(spec.scope, &ctx.tenant_id, &ctx.strand_id, &ctx.workflow_id, &spec.id);
                (spec.clone(), key)
            })
            .collect();
        entries.sort_by(|(a_spec, a_key), (b_spec, b_key)| (&a_spec.id, a_key).cmp(&(&b_spec.id, b_key)));
        entries
    }

    fn base_attributes(&self, ctx: &RunContext) -> BaseAttributes {
        BaseAttributes::from_context(ctx, false)
    }

    fn schedule_persist(&self, spec: BudgetSpec, scope_key: String, snapshot_after: BudgetState) {
        let Some(store) = self.store.clone() else { return };
        let max_attempts = self.cas_max_attempts;
        let degraded = self.store_degraded.clone();
        let key = persistent_key(&self.store_key_prefix, &scope_key);
        let expires_at = snapshot_after.period_end;
        tokio::spawn(async move {
            let data = snapshot_after.to_persisted(&spec.id, &scope_key);
            let result = cas_update(store.as_ref(), &key, max_attempts, expires_at, move |_prior| data.clone()).await;
            match result {
                Ok(_) => degraded.store(false, Ordering::Relaxed),
                Err(error) => {
                    degraded.store(true, Ordering::Relaxed);
                    warn!(%error, budget_id = %spec.id, %scope_key, "falling back to in-memory-only budget accounting");
                }
            }
        });
    }

    /// `open_run`: admit or reject a new run. Rejects if any applicable
    /// budget is hard-limited and exhausted with `REJECT_NEW_RUNS`, has a
    /// soft threshold crossed with `HALT_NEW_RUNS`, has exceeded
    /// `max_runs_per_period`, or is at `max_concurrent_runs`.
    pub fn open_run(&self, ctx: RunContext, snapshot: &PolicySnapshot) -> AdmissionDecision {
        self.evict_expired_runs();
        let now = Utc::now();
        let applicable = self.sorted_applicable(&ctx, snapshot);

        // Acquired in ascending `(budget_id, scope_key)` order (per
        // `sorted_applicable`) to prevent deadlock when a single update
        // touches several budgets. The backing `Arc`s are held in their own
        // vec so the guards borrowing from them stay valid for this scope
        // without resorting to unsafe lifetime extension.
        let arcs: Vec<(BudgetSpec, String, Arc<Mutex<BudgetState>>)> = applicable
            .iter()
            .map(|(spec, key)| (spec.clone(), key.clone(), self.budget_state(spec, key)))
            .collect();
        let mut guards: Vec<(&BudgetSpec, &String, std::sync::MutexGuard<'_, BudgetState>)> = arcs
            .iter()
            .map(|(spec, key, arc)| (spec, key, arc.lock().unwrap()))
            .collect();
        for (spec, _, guard) in guards.iter_mut() {
            guard.maybe_roll_period(spec.period, now);
        }

        for (spec, _, guard) in &guards {
            let utilization = guard.utilization(spec.max_cost);
            if spec.hard_limit && utilization >= 1.0 && spec.on_hard_limit_exceeded == HardLimitAction::RejectNewRuns {
                let reason = format!("hard limit exceeded for budget '{}'", spec.id);
                self.metrics.record_rejection(&self.base_attributes(&ctx), &reason);
                return AdmissionDecision { core: DecisionCore::deny(DecisionAction::Reject, reason) };
            }
            if spec.on_soft_threshold_exceeded == SoftThresholdAction::HaltNewRuns {
                if spec.soft_thresholds.iter().any(|t| *t <= utilization) {
                    let reason = format!("soft threshold crossed for budget '{}'", spec.id);
                    self.metrics.record_rejection(&self.base_attributes(&ctx), &reason);
                    return AdmissionDecision { core: DecisionCore::deny(DecisionAction::Reject, reason) };
                }
            }
            if let Some(max_runs) = spec.max_runs_per_period {
                if guard.total_runs >= max_runs {
                    let reason = format!("max_runs_per_period exceeded for budget '{}'", spec.id);
                    self.metrics.record_rejection(&self.base_attributes(&ctx), &reason);
                    return AdmissionDecision { core: DecisionCore::deny(DecisionAction::Reject, reason) };
                }
            }
            if let Some(max_concurrent) = spec.max_concurrent_runs {
                if guard.concurrent_runs.len() as u64 >= max_concurrent {
                    let reason = format!("concurrent run limit reached for budget '{}'", spec.id);
                    self.metrics.record_rejection(&self.base_attributes(&ctx), &reason);
                    return AdmissionDecision { core: DecisionCore::deny(DecisionAction::Reject, reason) };
                }
            }
        }

        for (spec, _, guard) in guards.iter_mut() {
            guard.concurrent_runs.insert(ctx.run_id.clone(), now);
            guard.total_runs += 1;
            guard.evict_oldest_if_over(spec.max_concurrent_runs);
        }
        drop(guards);

        self.runs.insert(ctx.run_id.clone(), Arc::new(Mutex::new(RunState::new(ctx.clone()))));
        self.metrics.record_run_event(&self.base_attributes(&ctx), RunEvent::Start, None);

        AdmissionDecision { core: DecisionCore::allow(DecisionAction::Admit) }
    }

    fn run_ctx(&self, run_id: &str) -> Option<RunContext> {
        self.runs.get(run_id).map(|r| r.lock().unwrap().ctx.clone())
    }

    /// Public lookup of a run's attribution context, used by the guard to
    /// attach `tenant_id`/`strand_id`/`workflow_id` to metrics emitted for
    /// hooks that don't otherwise carry the full `RunContext`. Returns
    /// `None` for an unknown or already-evicted `run_id`.
    pub fn run_ctx_for_metrics(&self, run_id: &str) -> Option<RunContext> {
        self.run_ctx(run_id)
    }

    pub fn check_iteration(&self, run_id: &str, idx: u32, snapshot: &PolicySnapshot) -> IterationDecision {
        let Some(ctx) = self.run_ctx(run_id) else {
            return IterationDecision {
                core: DecisionCore::allow(DecisionAction::Admit).with_warning(format!("unknown run_id '{run_id}'")),
            };
        };
        {
            let run_arc = self.runs.get(run_id).unwrap().clone();
            let run = run_arc.lock().unwrap();
            if run.status != RunStatus::Running {
                return IterationDecision {
                    core: DecisionCore::allow(DecisionAction::Admit)
                        .with_warning(format!("run_id '{run_id}' is no longer running")),
                };
            }
        }

        let applicable = self.sorted_applicable(&ctx, snapshot);

        for (spec, key) in &applicable {
            let state = self.budget_state(spec, key);
            let guard = state.lock().unwrap();
            if spec.hard_limit && guard.utilization(spec.max_cost) >= 1.0 && spec.on_hard_limit_exceeded == HardLimitAction::HaltRun {
                let reason = format!("hard limit exceeded for budget '{}'", spec.id);
                self.metrics.record_halt(&self.base_attributes(&ctx), &reason);
                return IterationDecision { core: DecisionCore::deny(DecisionAction::Halt, reason) };
            }
        }

        for (spec, _) in &applicable {
            if let Some(max_iterations) = spec.constraints.max_iterations {
                if idx >= max_iterations {
                    let reason = format!("max_iterations constraint exceeded for budget '{}'", spec.id);
                    self.metrics.record_halt(&self.base_attributes(&ctx), &reason);
                    return IterationDecision { core: DecisionCore::deny(DecisionAction::Halt, reason) };
                }
            }
        }

        let remaining_iterations = applicable
            .iter()
            .filter_map(|(spec, _)| spec.constraints.max_iterations.map(|m| m.saturating_sub(idx)))
            .min();

        self.metrics.record_iteration(&self.base_attributes(&ctx), idx);
        let mut core = DecisionCore::allow(DecisionAction::Admit);
        core.remaining_iterations = remaining_iterations;
        IterationDecision { core }
    }

    pub fn check_model(&self, run_id: &str, est_tokens: u64, snapshot: &PolicySnapshot) -> ModelCheck {
        let Some(ctx) = self.run_ctx(run_id) else {
            return ModelCheck { allowed: true, ..Default::default() };
        };
        let applicable = self.sorted_applicable(&ctx, snapshot);

        let mut soft_threshold_exceeded = false;
        let mut remaining_budget: Option<f64> = None;
        let mut soft_actions: Vec<SoftThresholdAction> = Vec::new();

        for (spec, key) in &applicable {
            let state = self.budget_state(spec, key);
            let guard = state.lock().unwrap();
            let utilization = guard.utilization(spec.max_cost);

            if spec.hard_limit && utilization >= 1.0 && spec.on_hard_limit_exceeded == HardLimitAction::HaltRun {
                return ModelCheck {
                    allowed: false,
                    reason: Some(format!("hard limit exceeded for budget '{}'", spec.id)),
                    soft_threshold_exceeded: true,
                    remaining_budget: Some(0.0),
                    soft_actions,
                    remaining_tokens: None,
                };
            }
            if spec.soft_thresholds.iter().any(|t| *t <= utilization) {
                soft_threshold_exceeded = true;
                if !soft_actions.contains(&spec.on_soft_threshold_exceeded) {
                    soft_actions.push(spec.on_soft_threshold_exceeded);
                }
            }
            if spec.max_cost > 0.0 {
                let headroom = spec.max_cost - guard.total_cost;
                remaining_budget = Some(remaining_budget.map_or(headroom, |r: f64| r.min(headroom)));
            }
        }

        let remaining_tokens = self.remaining_token_headroom(run_id, &applicable);

        if let Some(max_tokens) = self.max_token_constraint(&applicable) {
            let run_arc = self.runs.get(run_id);
            if let Some(run_arc) = run_arc {
                let run = run_arc.lock().unwrap();
                if run.input_tokens + run.output_tokens + est_tokens > max_tokens {
                    return ModelCheck {
                        allowed: false,
                        reason: Some("max_tokens constraint would be exceeded".to_string()),
                        soft_threshold_exceeded,
                        remaining_budget,
                        soft_actions,
                        remaining_tokens,
                    };
                }
            }
        }

        if let Some(max_run_cost) = self.max_cost_constraint(&applicable) {
            if let Some(run_arc) = self.runs.get(run_id) {
                let run = run_arc.lock().unwrap();
                if run.total_cost >= max_run_cost {
                    return ModelCheck {
                        allowed: false,
                        reason: Some("per-run max_cost constraint exceeded".to_string()),
                        soft_threshold_exceeded,
                        remaining_budget,
                        soft_actions,
                        remaining_tokens,
                    };
                }
            }
        }

        ModelCheck { allowed: true, reason: None, soft_threshold_exceeded, remaining_budget, soft_actions, remaining_tokens }
    }

    fn remaining_token_headroom(&self, run_id: &str, applicable: &[(BudgetSpec, String)]) -> Option<u64> {
        let max_tokens = self.max_token_constraint(applicable)?;
        let run_arc = self.runs.get(run_id)?;
        let run = run_arc.lock().unwrap();
        Some(max_tokens.saturating_sub(run.input_tokens + run.output_tokens))
    }

    fn max_token_constraint(&self, applicable: &[(BudgetSpec, String)]) -> Option<u64> {
        applicable.iter().filter_map(|(spec, _)| spec.constraints.max_tokens).min()
    }

    fn max_cost_constraint(&self, applicable: &[(BudgetSpec, String)]) -> Option<f64> {
        applicable.iter().filter_map(|(spec, _)| spec.constraints.max_cost).fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.min(v))))
    }

    pub fn check_tool(&self, run_id: &str, snapshot: &PolicySnapshot) -> ToolDecision {
        let Some(ctx) = self.run_ctx(run_id) else {
            return ToolDecision { core: DecisionCore::allow(DecisionAction::Admit) };
        };
        let applicable = self.sorted_applicable(&ctx, snapshot);

        for (spec, key) in &applicable {
            let state = self.budget_state(spec, key);
            let guard = state.lock().unwrap();
            if spec.hard_limit && guard.utilization(spec.max_cost) >= 1.0 && spec.on_hard_limit_exceeded == HardLimitAction::HaltRun {
                let reason = format!("hard limit exceeded for budget '{}'", spec.id);
                self.metrics.record_halt(&self.base_attributes(&ctx), &reason);
                return ToolDecision { core: DecisionCore::deny(DecisionAction::Halt, reason) };
            }
        }

        let run_arc = self.runs.get(run_id).map(|r| r.clone());
        if let Some(run_arc) = &run_arc {
            let run = run_arc.lock().unwrap();
            for (spec, _) in &applicable {
                if let Some(max_tool_calls) = spec.constraints.max_tool_calls {
                    if run.tool_calls >= max_tool_calls {
                        let reason = format!("max_tool_calls constraint exceeded for budget '{}'", spec.id);
                        self.metrics.record_halt(&self.base_attributes(&ctx), &reason);
                        return ToolDecision { core: DecisionCore::deny(DecisionAction::Halt, reason) };
                    }
                }
            }
        }

        ToolDecision { core: DecisionCore::allow(DecisionAction::Admit) }
    }

    /// Records model usage: computes cost via the pricing table, updates
    /// `RunState`, updates every applicable `BudgetState`, and detects
    /// threshold crossings.
    pub fn record_model(
        &self,
        run_id: &str,
        model: &str,
        usage: &ModelUsage,
        cost: f64,
        snapshot: &PolicySnapshot,
    ) -> Vec<(String, f64)> {
        let Some(ctx) = self.run_ctx(run_id) else {
            warn!(%run_id, "record_model called for unknown run_id");
            return Vec::new();
        };

        if let Some(run_arc) = self.runs.get(run_id) {
            let mut run = run_arc.lock().unwrap();
            if run.status == RunStatus::Running {
                run.total_cost += cost;
                run.input_tokens += usage.prompt_tokens;
                run.output_tokens += usage.completion_tokens;
                *run.model_costs.entry(model.to_string()).or_insert(0.0) += cost;
            }
        }

        self.metrics.record_cost(&self.base_attributes(&ctx), cost, Some(model), None);
        self.metrics
            .record_tokens(&self.base_attributes(&ctx), model, usage.prompt_tokens, usage.completion_tokens);

        let mut crossings = Vec::new();
        let now = Utc::now();
        for (spec, key) in self.sorted_applicable(&ctx, snapshot) {
            let state = self.budget_state(&spec, &key);
            let snapshot_for_persist;
            {
                let mut guard = state.lock().unwrap();
                guard.maybe_roll_period(spec.period, now);
                guard.total_cost += cost;
                guard.total_input_tokens += usage.prompt_tokens;
                guard.total_output_tokens += usage.completion_tokens;
                *guard.model_costs.entry(model.to_string()).or_insert(0.0) += cost;

                for t in guard.detect_new_crossings(&spec.soft_thresholds, spec.max_cost) {
                    crossings.push((spec.id.clone(), t));
                }
                snapshot_for_persist = guard.clone();
            }
            self.schedule_persist(spec, key, snapshot_for_persist);
        }

        crossings
    }

    pub fn record_tool(&self, run_id: &str, tool: &str, usage: &ToolUsage, cost: f64, snapshot: &PolicySnapshot) -> Vec<(String, f64)> {
        let Some(ctx) = self.run_ctx(run_id) else {
            warn!(%run_id, "record_tool called for unknown run_id");
            return Vec::new();
        };

        if let Some(run_arc) = self.runs.get(run_id) {
            let mut run = run_arc.lock().unwrap();
            if run.status == RunStatus::Running {
                run.total_cost += cost;
                run.tool_calls += 1;
                *run.tool_costs.entry(tool.to_string()).or_insert(0.0) += cost;
            }
        }
        let _ = usage;

        self.metrics.record_cost(&self.base_attributes(&ctx), cost, None, Some(tool));
        self.metrics.record_tool_call(&self.base_attributes(&ctx), tool);

        let mut crossings = Vec::new();
        let now = Utc::now();
        for (spec, key) in self.sorted_applicable(&ctx, snapshot) {
            let state = self.budget_state(&spec, &key);
            let snapshot_for_persist;
            {
                let mut guard = state.lock().unwrap();
                guard.maybe_roll_period(spec.period, now);
                guard.total_cost += cost;
                guard.total_tool_calls += 1;
                *guard.tool_costs.entry(tool.to_string()).or_insert(0.0) += cost;

                for t in guard.detect_new_crossings(&spec.soft_thresholds, spec.max_cost) {
                    crossings.push((spec.id.clone(), t));
                }
                snapshot_for_persist = guard.clone();
            }
            self.schedule_persist(spec, key, snapshot_for_persist);
        }

        crossings
    }

    /// Current iteration index for a run, used by the Routing Evaluator's
    /// `iteration_count_above` trigger. Unknown or ended runs read as 0.
    pub fn iteration_count(&self, run_id: &str) -> u32 {
        self.runs.get(run_id).map(|r| r.lock().unwrap().iteration).unwrap_or(0)
    }

    pub fn avg_latency_ms(&self, run_id: &str) -> Option<f64> {
        self.runs.get(run_id).and_then(|r| r.lock().unwrap().avg_latency_ms())
    }

    /// Records a model-call latency sample against the run, for the
    /// `latency_above_ms` downgrade trigger. Reporting latency is optional
    /// per call; runs with no samples never fire that trigger.
    pub fn record_latency(&self, run_id: &str, latency_ms: f64) {
        if let Some(run_arc) = self.runs.get(run_id) {
            let mut run = run_arc.lock().unwrap();
            if run.status == RunStatus::Running {
                run.latency_total_ms += latency_ms;
                run.latency_samples += 1;
            }
        }
    }

    /// Marks iteration `idx` complete: advances `RunState.iteration` and
    /// increments every applicable budget's `total_iterations` counter by
    /// one. Called from `on_iteration_end`, separately from the admission
    /// check in `check_iteration` so a rejected iteration is never counted.
    pub fn record_iteration(&self, run_id: &str, idx: u32, snapshot: &PolicySnapshot) {
        let Some(ctx) = self.run_ctx(run_id) else { return };

        if let Some(run_arc) = self.runs.get(run_id) {
            let mut run = run_arc.lock().unwrap();
            if run.status == RunStatus::Running {
                run.iteration = run.iteration.max(idx);
            }
        }

        let now = Utc::now();
        for (spec, key) in self.sorted_applicable(&ctx, snapshot) {
            let state = self.budget_state(&spec, &key);
            let snapshot_for_persist;
            {
                let mut guard = state.lock().unwrap();
                guard.maybe_roll_period(spec.period, now);
                guard.total_iterations += 1;
                snapshot_for_persist = guard.clone();
            }
            self.schedule_persist(spec, key, snapshot_for_persist);
        }
    }

    /// `on_run_end`: idempotent — calling it twice on an already-ended run
    /// is a no-op. Removes `run_id` from every applicable budget's
    /// concurrent set.
    pub fn on_run_end(&self, run_id: &str, status: RunStatus, snapshot: &PolicySnapshot) {
        let Some(ctx) = self.run_ctx(run_id) else { return };

        let already_ended = {
            let run_arc = self.runs.get(run_id).unwrap().clone();
            let mut run = run_arc.lock().unwrap();
            if run.status != RunStatus::Running {
                true
            } else {
                run.status = status;
                run.ended_at = Some(Utc::now());
                false
            }
        };
        if already_ended {
            return;
        }

        for (spec, key) in self.sorted_applicable(&ctx, snapshot) {
            let state = self.budget_state(&spec, &key);
            let mut guard = state.lock().unwrap();
            guard.concurrent_runs.remove(&ctx.run_id);
        }

        self.metrics
            .record_run_event(&self.base_attributes(&ctx), RunEvent::End, Some(run_status_label(status)));

        self.evict_expired_runs();
    }

    /// Sweeps ended runs whose late-arrival grace window has elapsed.
    /// Called opportunistically from hooks that touch `self.runs` rather
    /// than scheduled as a background task, so a `Guard` is fully usable
    /// from synchronous callers with no Tokio runtime present.
    fn evict_expired_runs(&self) {
        let grace = self.late_arrival_grace;
        let now = Utc::now();
        self.runs.retain(|_, state| match state.lock().unwrap().ended_at {
            Some(ended_at) => now - ended_at < grace,
            None => true,
        });
    }
}

fn run_status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Halted => "halted",
        RunStatus::Rejected => "rejected",
    }
}

// `ActionOverrides` is re-exported for guard-level composition of LIMIT_CAPABILITIES decisions.
pub use crate::types::ActionOverrides as BudgetActionOverrides;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RecordingMetricsEmitter;
    use crate::policy::{MatchPattern, PolicySnapshot, RunConstraints};
    use crate::pricing::PricingTable;
    use crate::types::Scope;

    fn ctx(tenant: &str, run_id: &str) -> RunContext {
        RunContext {
            tenant_id: tenant.to_string(),
            strand_id: "s1".to_string(),
            workflow_id: "w1".to_string(),
            run_id: run_id.to_string(),
            started_at: Utc::now(),
            metadata: Default::default(),
        }
    }

    fn snapshot_with(budgets: Vec<BudgetSpec>) -> PolicySnapshot {
        PolicySnapshot { budgets, routing: Vec::new(), pricing: PricingTable::new(), loaded_at: Utc::now() }
    }

    fn base_budget(id: &str, scope: Scope, max_cost: f64) -> BudgetSpec {
        BudgetSpec {
            id: id.to_string(),
            scope,
            tenant_pattern: MatchPattern::Any,
            strand_pattern: MatchPattern::Any,
            workflow_pattern: MatchPattern::Any,
            period: Period::Daily,
            max_cost,
            soft_thresholds: Vec::new(),
            hard_limit: true,
            on_soft_threshold_exceeded: SoftThresholdAction::LogOnly,
            on_hard_limit_exceeded: HardLimitAction::RejectNewRuns,
            max_runs_per_period: None,
            max_concurrent_runs: None,
            constraints: RunConstraints::default(),
            enabled: true,
        }
    }

    fn tracker() -> BudgetTracker {
        BudgetTracker::new(None, "strand_cost_guard", 8, chrono::Duration::seconds(0), Arc::new(RecordingMetricsEmitter::new()))
    }

    #[test]
    fn hard_limit_rejects_new_runs_once_exhausted() {
        let tracker = tracker();
        let spec = base_budget("daily-cap", Scope::Global, 100.0);
        let snapshot = snapshot_with(vec![spec.clone()]);

        let decision = tracker.open_run(ctx("acme", "run-1"), &snapshot);
        assert!(decision.core.allowed);
        tracker.on_run_end("run-1", RunStatus::Completed, &snapshot);

        tracker.record_model(
            "ghost",
            "gpt-4o",
            &ModelUsage { prompt_tokens: 0, completion_tokens: 0, cached_tokens: 0, reasoning_tokens: 0 },
            100.01,
            &snapshot,
        );
        // direct state mutation path above is exercised through the tracker's public API only
        // via a real run; emulate scenario 1 by writing straight into budget state instead.
        let key = build_scope_key(Scope::Global, "acme", "s1", "w1", "daily-cap");
        let state = tracker.budget_state(&spec, &key);
        state.lock().unwrap().total_cost = 100.01;

        let decision = tracker.open_run(ctx("acme", "run-2"), &snapshot);
        assert!(!decision.core.allowed);
        assert_eq!(decision.core.action, DecisionAction::Reject);
        assert!(decision.core.reason.unwrap().contains("hard limit"));
    }

    #[test]
    fn concurrent_run_cap_admits_exactly_the_configured_count() {
        let tracker = tracker();
        let mut spec = base_budget("cap2", Scope::Global, 0.0);
        spec.hard_limit = false;
        spec.max_concurrent_runs = Some(2);
        let snapshot = snapshot_with(vec![spec]);

        let d1 = tracker.open_run(ctx("acme", "run-1"), &snapshot);
        let d2 = tracker.open_run(ctx("acme", "run-2"), &snapshot);
        let d3 = tracker.open_run(ctx("acme", "run-3"), &snapshot);

        assert!(d1.core.allowed);
        assert!(d2.core.allowed);
        assert!(!d3.core.allowed);
        assert!(d3.core.reason.unwrap().contains("concurrent"));
    }

    #[test]
    fn on_run_end_is_idempotent() {
        let tracker = tracker();
        let mut spec = base_budget("b1", Scope::Global, 0.0);
        spec.hard_limit = false;
        let snapshot = snapshot_with(vec![spec.clone()]);

        tracker.open_run(ctx("acme", "run-1"), &snapshot);
        let key = build_scope_key(Scope::Global, "acme", "s1", "w1", "b1");
        let state = tracker.budget_state(&spec, &key);
        assert!(state.lock().unwrap().concurrent_runs.contains_key("run-1"));

        tracker.on_run_end("run-1", RunStatus::Completed, &snapshot);
        assert!(!state.lock().unwrap().concurrent_runs.contains_key("run-1"));

        // second call: no panic, no-op
        tracker.on_run_end("run-1", RunStatus::Completed, &snapshot);
    }

    #[test]
    fn ended_run_stays_queryable_until_grace_elapses_then_is_evicted_lazily() {
        let tracker =
            BudgetTracker::new(None, "strand_cost_guard", 8, chrono::Duration::seconds(60), Arc::new(RecordingMetricsEmitter::new()));
        let spec = base_budget("b1", Scope::Global, 0.0);
        let snapshot = snapshot_with(vec![spec]);

        tracker.open_run(ctx("acme", "run-1"), &snapshot);
        tracker.on_run_end("run-1", RunStatus::Completed, &snapshot);
        assert!(tracker.run_ctx_for_metrics("run-1").is_some());

        // Backdate as if the grace window has already elapsed, then trigger
        // the lazy sweep the same way a subsequent hook call would.
        tracker.runs.get("run-1").unwrap().lock().unwrap().ended_at = Some(Utc::now() - chrono::Duration::seconds(120));
        tracker.evict_expired_runs();
        assert!(tracker.run_ctx_for_metrics("run-1").is_none());
    }

    #[test]
    fn multiple_applicable_budgets_reject_independently_per_tenant() {
        let tracker = tracker();
        let global = base_budget("global", Scope::Global, 10_000.0);
        let mut tenant_acme = base_budget("tenant-acme", Scope::Tenant, 100.0);
        tenant_acme.tenant_pattern = MatchPattern::Exact("acme".to_string());
        let snapshot = snapshot_with(vec![global, tenant_acme.clone()]);

        let key = build_scope_key(Scope::Tenant, "acme", "s1", "w1", "tenant-acme");
        let state = tracker.budget_state(&tenant_acme, &key);
        state.lock().unwrap().total_cost = 101.0;

        let acme_decision = tracker.open_run(ctx("acme", "run-1"), &snapshot);
        assert!(!acme_decision.core.allowed);

        let other_decision = tracker.open_run(ctx("other-tenant", "run-2"), &snapshot);
        assert!(other_decision.core.allowed);
    }

    #[test]
    fn record_iteration_advances_run_and_budget_counters() {
        let tracker = tracker();
        let mut spec = base_budget("b1", Scope::Global, 0.0);
        spec.hard_limit = false;
        let snapshot = snapshot_with(vec![spec.clone()]);

        tracker.open_run(ctx("acme", "run-1"), &snapshot);
        tracker.record_iteration("run-1", 0, &snapshot);
        tracker.record_iteration("run-1", 1, &snapshot);

        assert_eq!(tracker.iteration_count("run-1"), 1);
        let key = build_scope_key(Scope::Global, "acme", "s1", "w1", "b1");
        let state = tracker.budget_state(&spec, &key);
        assert_eq!(state.lock().unwrap().total_iterations, 2);
    }

    #[test]
    fn check_model_rejects_once_per_run_max_cost_constraint_reached() {
        let tracker = tracker();
        let mut spec = base_budget("b1", Scope::Global, 0.0);
        spec.hard_limit = false;
        spec.constraints.max_cost = Some(50.0);
        let snapshot = snapshot_with(vec![spec]);

        tracker.open_run(ctx("acme", "run-1"), &snapshot);
        let check = tracker.check_model("run-1", 10, &snapshot);
        assert!(check.allowed);

        tracker.record_model(
            "run-1",
            "gpt-4o",
            &ModelUsage { prompt_tokens: 0, completion_tokens: 0, cached_tokens: 0, reasoning_tokens: 0 },
            50.0,
            &snapshot,
        );
        let check = tracker.check_model("run-1", 10, &snapshot);
        assert!(!check.allowed);
        assert!(check.reason.unwrap().contains("max_cost"));
    }

    #[test]
    fn latency_samples_average_across_recorded_calls() {
        let tracker = tracker();
        let snapshot = snapshot_with(vec![]);
        tracker.open_run(ctx("acme", "run-1"), &snapshot);

        assert_eq!(tracker.avg_latency_ms("run-1"), None);
        tracker.record_latency("run-1", 100.0);
        tracker.record_latency("run-1", 200.0);
        assert_eq!(tracker.avg_latency_ms("run-1"), Some(150.0));
    }
}
