//! End-to-end scenarios exercising the full Decision Pipeline through the
//! public `Guard` API: a single-tenant hard reject, a soft-threshold
//! downgrade, a concurrent-run cap, independently-rejecting overlapping
//! budgets, and prefix-matched model pricing.

use std::sync::Arc;

use chrono::Utc;
use strand_cost_guard::budget::{BudgetTracker, Period};
use strand_cost_guard::metrics::RecordingMetricsEmitter;
use strand_cost_guard::policy::{
    BudgetSpec, DowngradeTrigger, HardLimitAction, MatchPattern, PolicySnapshot, PolicyStore, RoutingPolicy,
    RunConstraints, SoftThresholdAction, StageConfig,
};
use strand_cost_guard::pricing::{ModelPricing, ModelPricingEntry, PricingTable};
use strand_cost_guard::types::{DecisionAction, FailureMode, ModelUsage, RunContext, RunStatus, Scope, ToolUsage};
use strand_cost_guard::Guard;

fn ctx(tenant: &str, run_id: &str) -> RunContext {
    RunContext {
        tenant_id: tenant.to_string(),
        strand_id: "default".to_string(),
        workflow_id: "default".to_string(),
        run_id: run_id.to_string(),
        started_at: Utc::now(),
        metadata: Default::default(),
    }
}

fn guard_for(snapshot: PolicySnapshot) -> Guard {
    let metrics = Arc::new(RecordingMetricsEmitter::new());
    let budget = BudgetTracker::new(None, "strand_cost_guard", 8, chrono::Duration::seconds(0), metrics.clone());
    let policy = PolicyStore::from_snapshot(snapshot);
    Guard::from_parts(policy, budget, metrics, FailureMode::FailOpen)
}

fn daily_budget(id: &str, scope: Scope, max_cost: f64) -> BudgetSpec {
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

/// A pricing table with one flat-rate model, `input_per_1k` chosen so that
/// `prompt_tokens / 1000 * input_per_1k` lands on a caller-picked cost.
fn flat_rate_table(rate_per_1k: f64) -> PricingTable {
    PricingTable {
        currency: "usd".to_string(),
        models: vec![ModelPricingEntry {
            pattern: "gpt-4o".to_string(),
            pricing: ModelPricing { input_per_1k: rate_per_1k, output_per_1k: 0.0, cached_input_per_1k: None, reasoning_per_1k: None },
        }],
        tools: Vec::new(),
        fallback_input_per_1k: 0.0,
        fallback_output_per_1k: 0.0,
    }
}

fn usage(prompt_tokens: u64) -> ModelUsage {
    ModelUsage { prompt_tokens, completion_tokens: 0, cached_tokens: 0, reasoning_tokens: 0 }
}

/// Scenario 1: a single-tenant hard budget rejects new runs once a prior
/// run's recorded usage pushes total cost past the ceiling.
#[test]
fn single_tenant_hard_reject() {
    let spec = daily_budget("daily-cap", Scope::Global, 100.0);
    let snapshot = PolicySnapshot { budgets: vec![spec], routing: Vec::new(), pricing: flat_rate_table(100.01), loaded_at: Utc::now() };
    let guard = guard_for(snapshot);

    let admitted = guard.on_run_start(ctx("acme", "run-1"));
    assert!(admitted.core.allowed);

    // 1000 prompt tokens at 100.01/1k = 100.01, just over the 100.0 ceiling.
    let after = guard.after_model_call("run-1", "gpt-4o", &usage(1000), None);
    assert!(!after.core.allowed);
    assert_eq!(after.core.action, DecisionAction::Halt);

    let rejected = guard.on_run_start(ctx("acme", "run-2"));
    assert!(!rejected.core.allowed);
    assert!(rejected.core.reason.unwrap().contains("hard limit"));
}

/// Scenario 2: a soft threshold crossed with `DOWNGRADE_MODEL` feeds the
/// routing evaluator, which returns the stage's fallback model.
#[test]
fn soft_threshold_downgrade_to_fallback_model() {
    let mut spec = daily_budget("spend", Scope::Global, 1000.0);
    spec.hard_limit = false;
    spec.soft_thresholds = vec![0.7];
    spec.on_soft_threshold_exceeded = SoftThresholdAction::DowngradeModel;

    let routing = RoutingPolicy {
        id: "default".to_string(),
        scope: Scope::Global,
        tenant_pattern: MatchPattern::Any,
        strand_pattern: MatchPattern::Any,
        workflow_pattern: MatchPattern::Any,
        default_model: "gpt-4o".to_string(),
        default_fallback_model: Some("gpt-4o-mini".to_string()),
        stages: vec![StageConfig {
            stage: "synthesis".to_string(),
            default_model: "gpt-4o".to_string(),
            fallback_model: Some("gpt-4o-mini".to_string()),
            max_tokens: None,
            temperature: None,
            trigger: DowngradeTrigger { soft_threshold_exceeded: true, ..Default::default() },
        }],
    };

    // 1000 prompt tokens at 700.0/1k = 700.0, exactly the 0.7 threshold of 1000.
    let snapshot = PolicySnapshot { budgets: vec![spec], routing: vec![routing], pricing: flat_rate_table(700.0), loaded_at: Utc::now() };
    let guard = guard_for(snapshot);

    guard.on_run_start(ctx("acme", "run-1"));
    guard.after_model_call("run-1", "gpt-4o", &usage(1000), None);

    let decision = guard.before_model_call("run-1", "gpt-4o", "synthesis", 128);
    assert!(decision.was_downgraded);
    assert_eq!(decision.effective_model, "gpt-4o-mini");
    assert_eq!(decision.core.action, DecisionAction::Downgrade);
}

/// Scenario 4: exactly two concurrent runs are admitted against a
/// `max_concurrent_runs: 2` budget; the third is rejected.
#[test]
fn concurrent_run_cap_admits_exactly_two_of_three() {
    let mut spec = daily_budget("cap2", Scope::Global, 0.0);
    spec.hard_limit = false;
    spec.max_concurrent_runs = Some(2);
    let snapshot = PolicySnapshot { budgets: vec![spec], routing: Vec::new(), pricing: PricingTable::new(), loaded_at: Utc::now() };
    let guard = guard_for(snapshot);

    let d1 = guard.on_run_start(ctx("acme", "run-1"));
    let d2 = guard.on_run_start(ctx("acme", "run-2"));
    let d3 = guard.on_run_start(ctx("acme", "run-3"));

    assert!(d1.core.allowed);
    assert!(d2.core.allowed);
    assert!(!d3.core.allowed);
    assert!(d3.core.reason.unwrap().contains("concurrent"));
}

/// Scenario 5: a tenant-scoped budget rejects while the same global policy
/// still admits a different tenant with no recorded usage.
#[test]
fn multiple_applicable_budgets_scope_independently() {
    let global = daily_budget("global", Scope::Global, 10_000.0);
    let mut tenant_acme = daily_budget("tenant-acme", Scope::Tenant, 100.0);
    tenant_acme.tenant_pattern = MatchPattern::Exact("acme".to_string());

    let snapshot = PolicySnapshot { budgets: vec![global, tenant_acme], routing: Vec::new(), pricing: flat_rate_table(101.0), loaded_at: Utc::now() };
    let guard = guard_for(snapshot);

    guard.on_run_start(ctx("acme", "run-1"));
    guard.after_model_call("run-1", "gpt-4o", &usage(1000), None);

    let acme_again = guard.on_run_start(ctx("acme", "run-2"));
    assert!(!acme_again.core.allowed);

    let other = guard.on_run_start(ctx("other-tenant", "run-3"));
    assert!(other.core.allowed);
}

/// Scenario 6: model-name prefix resolution picks `gpt-4o`'s rates for a
/// dated variant, and falls back to the table's default rates for an
/// unrecognized model.
#[test]
fn model_name_prefix_pricing_resolution() {
    let table = PricingTable {
        currency: "usd".to_string(),
        models: vec![ModelPricingEntry {
            pattern: "gpt-4o".to_string(),
            pricing: ModelPricing { input_per_1k: 0.005, output_per_1k: 0.015, cached_input_per_1k: None, reasoning_per_1k: None },
        }],
        tools: Vec::new(),
        fallback_input_per_1k: 0.001,
        fallback_output_per_1k: 0.002,
    };

    assert_eq!(table.calculate_model_cost("gpt-4o-2024-08-06", &usage(1000)), 0.005);
    assert_eq!(table.calculate_model_cost("unknown-model", &usage(1000)), 0.001);
}

/// End-to-end hook sequence sanity check: a full run lifecycle through
/// every hook returns admitting decisions when no budget is configured.
#[test]
fn full_lifecycle_with_no_configured_budgets_always_admits() {
    let snapshot = PolicySnapshot::default();
    let guard = guard_for(snapshot);

    assert!(guard.on_run_start(ctx("acme", "run-1")).core.allowed);
    assert!(guard.on_iteration_start("run-1", 0).core.allowed);
    assert!(guard.on_iteration_end("run-1", 0).core.allowed);

    let model_decision = guard.before_model_call("run-1", "gpt-4o", "planning", 50);
    assert!(model_decision.core.allowed);
    assert!(guard.after_model_call("run-1", "gpt-4o", &usage(50), Some(120.0)).core.allowed);

    assert!(guard.before_tool_call("run-1", "web_search").core.allowed);
    let tool_usage = ToolUsage { input_bytes: 64, output_bytes: 256 };
    assert!(guard.after_tool_call("run-1", "web_search", &tool_usage).core.allowed);

    guard.on_run_end("run-1", RunStatus::Completed);
    // Idempotent: calling twice is a no-op, not a panic.
    guard.on_run_end("run-1", RunStatus::Completed);
}
