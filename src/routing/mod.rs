//! The adaptive routing evaluator: picks an effective model for a stage
//! given current budget pressure.
//!
//! A compiled policy matcher with ordered clause evaluation and explicit
//! pass-through defaults for zero config. This evaluator is a pure function
//! of `(&RoutingPolicy, stage, &RoutingSignals) -> RoutingEvaluation` — a
//! stateless evaluation step with no pipeline state to carry between calls.

use crate::policy::RoutingPolicy;
use crate::types::RoutingSignals;

/// Named clause that fired a downgrade, surfaced in `Decision.reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerClause {
    SoftThresholdExceeded,
    RemainingBudgetBelow,
    IterationCountAbove,
    LatencyAboveMs,
}

impl TriggerClause {
    fn describe(self) -> &'static str {
        match self {
            TriggerClause::SoftThresholdExceeded => "soft threshold exceeded",
            TriggerClause::RemainingBudgetBelow => "remaining budget below configured floor",
            TriggerClause::IterationCountAbove => "iteration count above configured ceiling",
            TriggerClause::LatencyAboveMs => "average latency above configured ceiling",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingEvaluation {
    pub effective_model: String,
    pub was_downgraded: bool,
    pub max_tokens: Option<u32>,
    pub reason: Option<String>,
}

/// Stateless routing evaluation; no instance data to hold, so this is a
/// zero-sized marker type exposing associated functions rather than an
/// object callers construct.
pub struct RoutingEvaluator;

impl RoutingEvaluator {
    /// 1. No matching stage -> the policy's bare default, no downgrade.
    /// 2. Evaluate the stage's trigger clauses in the fixed order this module
    ///    §4.4 specifies: soft threshold, then remaining budget, then
    ///    iteration count, then latency. The first configured clause that
    ///    fires wins, provided a `fallback_model` is configured.
    /// 3. Otherwise the stage's own default, carrying its `max_tokens`.
    pub fn evaluate(policy: &RoutingPolicy, stage: &str, signals: &RoutingSignals) -> RoutingEvaluation {
        let Some(stage_config) = policy.stage(stage) else {
            return RoutingEvaluation {
                effective_model: policy.default_model.clone(),
                was_downgraded: false,
                max_tokens: None,
                reason: None,
            };
        };

        let trigger = &stage_config.trigger;
        let fired = [
            (TriggerClause::SoftThresholdExceeded, trigger.soft_threshold_exceeded && signals.soft_threshold_exceeded),
            (
                TriggerClause::RemainingBudgetBelow,
                trigger
                    .remaining_budget_below
                    .zip(signals.remaining_budget)
                    .is_some_and(|(floor, remaining)| remaining < floor),
            ),
            (
                TriggerClause::IterationCountAbove,
                trigger.iteration_count_above.is_some_and(|ceiling| signals.iteration_count > ceiling),
            ),
            (
                TriggerClause::LatencyAboveMs,
                trigger
                    .latency_above_ms
                    .zip(signals.avg_latency_ms)
                    .is_some_and(|(ceiling, latency)| latency > ceiling),
            ),
        ]
        .into_iter()
        .find(|(_, fires)| *fires)
        .map(|(clause, _)| clause);

        if let (Some(clause), Some(fallback_model)) = (fired, stage_config.fallback_model.clone()) {
            return RoutingEvaluation {
                effective_model: fallback_model,
                was_downgraded: true,
                max_tokens: stage_config.max_tokens,
                reason: Some(format!("downgraded: {}", clause.describe())),
            };
        }

        RoutingEvaluation {
            effective_model: stage_config.default_model.clone(),
            was_downgraded: false,
            max_tokens: stage_config.max_tokens,
            reason: None,
        }
    }
}
