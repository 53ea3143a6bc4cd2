//! Policy matching and merging: the declarative `BudgetSpec` and
//! `RoutingPolicy` records plus the wildcard match/priority-score rules
//! that pick which ones apply to a given run context.
//!
//! The snapshot/refresh machinery lives in [`store`]; the directory and
//! environment-variable loaders live in [`loader`].

pub mod error;
pub mod loader;
pub mod store;

pub use error::PolicyError;
pub use store::{PolicySnapshot, PolicySource, PolicyStore};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::Scope;

/// A single match clause: `"*"` (anything), a literal (exact), or a
/// literal with a trailing `*` (prefix). There is no general glob syntax —
/// the three-case grammar is deliberately narrower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchPattern {
    Any,
    Exact(String),
    Prefix(String),
}

impl MatchPattern {
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            MatchPattern::Any
        } else if let Some(prefix) = raw.strip_suffix('*') {
            MatchPattern::Prefix(prefix.to_string())
        } else {
            MatchPattern::Exact(raw.to_string())
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            MatchPattern::Any => true,
            MatchPattern::Exact(expected) => expected == value,
            MatchPattern::Prefix(prefix) => value.starts_with(prefix.as_str()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, MatchPattern::Any)
    }
}

impl Default for MatchPattern {
    fn default() -> Self {
        MatchPattern::Any
    }
}

impl Serialize for MatchPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = match self {
            MatchPattern::Any => "*".to_string(),
            MatchPattern::Exact(value) => value.clone(),
            MatchPattern::Prefix(prefix) => format!("{prefix}*"),
        };
        serializer.serialize_str(&raw)
    }
}

impl<'de> Deserialize<'de> for MatchPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MatchPattern::parse(&raw))
    }
}

/// Action taken the first time a soft threshold is crossed within a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftThresholdAction {
    LogOnly,
    LimitCapabilities,
    DowngradeModel,
    HaltNewRuns,
}

/// Action taken once utilization reaches 1.0 on a hard-limited budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardLimitAction {
    RejectNewRuns,
    HaltRun,
}

/// Per-run ceilings enforced regardless of accumulated cost.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConstraints {
    pub max_iterations: Option<u32>,
    pub max_tool_calls: Option<u32>,
    pub max_tokens: Option<u64>,
    pub max_cost: Option<f64>,
}

fn scope_score(scope: Scope, tenant: &MatchPattern, strand: &MatchPattern, workflow: &MatchPattern) -> u32 {
    let mut score = scope.weight();
    if !tenant.is_wildcard() {
        score += 1;
    }
    if !strand.is_wildcard() {
        score += 2;
    }
    if !workflow.is_wildcard() {
        score += 4;
    }
    score
}

/// A declarative budget, loaded from config and replaced atomically on
/// refresh. See `budget::BudgetState` for the mutable counters paired with
/// one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSpec {
    pub id: String,
    pub scope: Scope,
    #[serde(rename = "tenant", default)]
    pub tenant_pattern: MatchPattern,
    #[serde(rename = "strand", default)]
    pub strand_pattern: MatchPattern,
    #[serde(rename = "workflow", default)]
    pub workflow_pattern: MatchPattern,
    pub period: crate::budget::window::Period,
    pub max_cost: f64,
    #[serde(default)]
    pub soft_thresholds: Vec<f64>,
    #[serde(default)]
    pub hard_limit: bool,
    #[serde(default = "default_soft_action")]
    pub on_soft_threshold_exceeded: SoftThresholdAction,
    #[serde(default = "default_hard_action")]
    pub on_hard_limit_exceeded: HardLimitAction,
    #[serde(default)]
    pub max_runs_per_period: Option<u64>,
    #[serde(default)]
    pub max_concurrent_runs: Option<u64>,
    #[serde(default)]
    pub constraints: RunConstraints,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_soft_action() -> SoftThresholdAction {
    SoftThresholdAction::LogOnly
}

fn default_hard_action() -> HardLimitAction {
    HardLimitAction::RejectNewRuns
}

fn default_true() -> bool {
    true
}

impl BudgetSpec {
    pub fn matches(&self, tenant: &str, strand: &str, workflow: &str) -> bool {
        self.tenant_pattern.matches(tenant)
            && self.strand_pattern.matches(strand)
            && self.workflow_pattern.matches(workflow)
    }

    pub fn priority_score(&self) -> u32 {
        scope_score(
            self.scope,
            &self.tenant_pattern,
            &self.strand_pattern,
            &self.workflow_pattern,
        )
    }
}

/// `DowngradeTrigger` clauses are evaluated in a fixed order: soft
/// threshold, then remaining budget, then iteration count, then latency.
/// The first configured clause that fires wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DowngradeTrigger {
    pub soft_threshold_exceeded: bool,
    pub remaining_budget_below: Option<f64>,
    pub iteration_count_above: Option<u32>,
    pub latency_above_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage: String,
    pub default_model: String,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub trigger: DowngradeTrigger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub id: String,
    pub scope: Scope,
    #[serde(rename = "tenant", default)]
    pub tenant_pattern: MatchPattern,
    #[serde(rename = "strand", default)]
    pub strand_pattern: MatchPattern,
    #[serde(rename = "workflow", default)]
    pub workflow_pattern: MatchPattern,
    pub default_model: String,
    #[serde(default)]
    pub default_fallback_model: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl RoutingPolicy {
    pub fn matches(&self, tenant: &str, strand: &str, workflow: &str) -> bool {
        self.tenant_pattern.matches(tenant)
            && self.strand_pattern.matches(strand)
            && self.workflow_pattern.matches(workflow)
    }

    pub fn priority_score(&self) -> u32 {
        scope_score(
            self.scope,
            &self.tenant_pattern,
            &self.strand_pattern,
            &self.workflow_pattern,
        )
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.stage == name)
    }
}
