//! Core data types shared across the pricing, policy, budget, routing and
//! guard modules: the run-attribution hierarchy, usage records, and the
//! decision shapes every lifecycle hook returns.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four nested identifiers forming the cost-attribution hierarchy:
/// organization (tenant) -> agent type (strand) -> task flow (workflow) ->
/// single execution (run). All four are opaque strings; the guard never
/// interprets their contents beyond pattern matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub tenant_id: String,
    pub strand_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// The hierarchy level at which a budget or routing policy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Tenant,
    Strand,
    Workflow,
}

impl Scope {
    /// Base component of the priority score (spec: global=0, tenant=10, strand=20, workflow=30).
    pub fn weight(self) -> u32 {
        match self {
            Scope::Global => 0,
            Scope::Tenant => 10,
            Scope::Strand => 20,
            Scope::Workflow => 30,
        }
    }
}

/// Lifetime status of a run, tracked by the Budget Tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Halted,
    Rejected,
}

/// How the guard behaves when an internal error occurs mid-decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Any internal exception yields an allowing decision with a warning.
    #[default]
    FailOpen,
    /// Any internal exception yields a rejecting decision.
    FailClosed,
}

/// Usage reported after a model call completes.
#[derive(Debug, Clone, Default)]
pub struct ModelUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
    pub reasoning_tokens: u64,
}

/// Usage reported after a tool call completes.
#[derive(Debug, Clone, Default)]
pub struct ToolUsage {
    pub input_bytes: u64,
    pub output_bytes: u64,
}

/// Signal bundle the Routing Evaluator consumes; derived by the guard from
/// current budget state before a model-call hook.
#[derive(Debug, Clone, Default)]
pub struct RoutingSignals {
    pub soft_threshold_exceeded: bool,
    pub remaining_budget: Option<f64>,
    pub iteration_count: u32,
    pub avg_latency_ms: Option<f64>,
}

/// The action tag carried by every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Admit,
    Reject,
    Downgrade,
    Halt,
    Limit,
    LogOnly,
}

/// Per-decision capability overrides applied by a `LIMIT_CAPABILITIES` soft action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens_remaining: Option<u64>,
}

/// Fields shared by all four decision variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionCore {
    pub allowed: bool,
    pub action: DecisionAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_tool_calls: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_tokens: Option<u64>,
    #[serde(default)]
    pub action_overrides: ActionOverrides,
}

impl DecisionCore {
    pub fn allow(action: DecisionAction) -> Self {
        Self {
            allowed: true,
            action,
            reason: None,
            warnings: Vec::new(),
            remaining_budget: None,
            remaining_iterations: None,
            remaining_tool_calls: None,
            remaining_tokens: None,
            action_overrides: ActionOverrides::default(),
        }
    }

    pub fn deny(action: DecisionAction, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            action,
            reason: Some(reason.into()),
            warnings: Vec::new(),
            remaining_budget: None,
            remaining_iterations: None,
            remaining_tool_calls: None,
            remaining_tokens: None,
            action_overrides: ActionOverrides::default(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionDecision {
    #[serde(flatten)]
    pub core: DecisionCore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationDecision {
    #[serde(flatten)]
    pub core: DecisionCore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecision {
    #[serde(flatten)]
    pub core: DecisionCore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDecision {
    #[serde(flatten)]
    pub core: DecisionCore,
    pub effective_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub was_downgraded: bool,
}

impl ModelDecision {
    pub fn unchanged(core: DecisionCore, model: impl Into<String>, max_tokens: Option<u32>) -> Self {
        Self {
            core,
            effective_model: model.into(),
            max_tokens,
            was_downgraded: false,
        }
    }
}
