//! Concrete `PolicySource` implementations: a directory-of-TOML-documents
//! loader and an environment-variable loader. File loading is file-based
//! (`ConfigError::NotFound`/`Parse`); the environment loader does
//! best-effort parsing with invalid values silently ignored, extended here
//! from a single TOML file to a directory of documents.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use super::error::PolicyError;
use super::store::{PolicySnapshot, PolicySource};
use super::{BudgetSpec, MatchPattern, RoutingPolicy, RunConstraints, SoftThresholdAction};
use crate::budget::Period;
use crate::pricing::PricingTable;
use crate::types::Scope;

/// Reads `budgets.toml`, `routing.toml` and `pricing.toml` from a
/// directory. A missing document yields an empty collection (or the
/// default pricing table); a present-but-unparseable document is an
/// error. Unknown keys at load are tolerated by serde's default field
/// behavior — they are warnings, not hard failures, at the call site that
/// chooses to log them.
pub struct DirectoryPolicySource {
    dir: PathBuf,
}

impl DirectoryPolicySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_document(&self, name: &str) -> Result<Option<String>, PolicyError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&path)
            .map(Some)
            .map_err(|source| PolicyError::Io { path, source })
    }
}

#[derive(serde::Deserialize, Default)]
struct BudgetsDocument {
    #[serde(default)]
    budgets: Vec<BudgetSpec>,
}

#[derive(serde::Deserialize, Default)]
struct RoutingDocument {
    #[serde(default)]
    routing: Vec<RoutingPolicy>,
}

impl PolicySource for DirectoryPolicySource {
    fn load(&self) -> Result<PolicySnapshot, PolicyError> {
        let budgets = match self.read_document("budgets.toml")? {
            Some(raw) => {
                toml::from_str::<BudgetsDocument>(&raw)
                    .map_err(|e| PolicyError::Parse { document: "budgets.toml".to_string(), message: e.to_string() })?
                    .budgets
            }
            None => Vec::new(),
        };
        let routing = match self.read_document("routing.toml")? {
            Some(raw) => {
                toml::from_str::<RoutingDocument>(&raw)
                    .map_err(|e| PolicyError::Parse { document: "routing.toml".to_string(), message: e.to_string() })?
                    .routing
            }
            None => Vec::new(),
        };
        let pricing = match self.read_document("pricing.toml")? {
            Some(raw) => toml::from_str::<PricingTable>(&raw)
                .map_err(|e| PolicyError::Parse { document: "pricing.toml".to_string(), message: e.to_string() })?,
            None => PricingTable::new(),
        };

        Ok(PolicySnapshot { budgets, routing, pricing, loaded_at: Utc::now() })
    }
}

/// Synthesizes one global wildcard `BudgetSpec` and one wildcard
/// `RoutingPolicy` from `{PREFIX}MAX_COST`, `{PREFIX}PERIOD`,
/// `{PREFIX}DEFAULT_MODEL`, `{PREFIX}FALLBACK_MODEL`. Invalid or absent
/// values are silently skipped rather than failing the load — an env
/// source is meant to work with zero configuration present.
pub struct EnvPolicySource {
    prefix: String,
}

impl EnvPolicySource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    fn var(&self, suffix: &str) -> Option<String> {
        std::env::var(format!("{}{}", self.prefix, suffix)).ok()
    }
}

impl PolicySource for EnvPolicySource {
    fn load(&self) -> Result<PolicySnapshot, PolicyError> {
        let max_cost = self.var("MAX_COST").and_then(|v| v.parse::<f64>().ok());
        let period = self.var("PERIOD").and_then(|v| parse_period(&v));
        let default_model = self.var("DEFAULT_MODEL");
        let fallback_model = self.var("FALLBACK_MODEL");

        let mut budgets = Vec::new();
        if let Some(max_cost) = max_cost {
            budgets.push(BudgetSpec {
                id: "env-global".to_string(),
                scope: Scope::Global,
                tenant_pattern: MatchPattern::Any,
                strand_pattern: MatchPattern::Any,
                workflow_pattern: MatchPattern::Any,
                period: period.unwrap_or(Period::Monthly),
                max_cost,
                soft_thresholds: Vec::new(),
                hard_limit: true,
                on_soft_threshold_exceeded: SoftThresholdAction::LogOnly,
                on_hard_limit_exceeded: super::HardLimitAction::RejectNewRuns,
                max_runs_per_period: None,
                max_concurrent_runs: None,
                constraints: RunConstraints::default(),
                enabled: true,
            });
        }

        let mut routing = Vec::new();
        if let Some(default_model) = default_model {
            routing.push(RoutingPolicy {
                id: "env-global".to_string(),
                scope: Scope::Global,
                tenant_pattern: MatchPattern::Any,
                strand_pattern: MatchPattern::Any,
                workflow_pattern: MatchPattern::Any,
                default_model,
                default_fallback_model: fallback_model,
                stages: Vec::new(),
            });
        }

        Ok(PolicySnapshot { budgets, routing, pricing: PricingTable::new(), loaded_at: Utc::now() })
    }
}

fn parse_period(raw: &str) -> Option<Period> {
    match raw.to_lowercase().as_str() {
        "hourly" => Some(Period::Hourly),
        "daily" => Some(Period::Daily),
        "weekly" => Some(Period::Weekly),
        "monthly" => Some(Period::Monthly),
        other => {
            warn!(value = %other, "unrecognized period in environment source, ignoring");
            None
        }
    }
}

/// Merges snapshots from multiple sources by concatenating budgets and
/// routing policies (directory-loaded policies first, so env-synthesized
/// wildcards sort last and lose routing ties per load order) and keeping
/// the last non-default pricing table seen.
pub struct CompositePolicySource {
    sources: Vec<Box<dyn PolicySource>>,
}

impl CompositePolicySource {
    pub fn new(sources: Vec<Box<dyn PolicySource>>) -> Self {
        Self { sources }
    }

    pub fn directory_and_env(dir: impl AsRef<Path>, env_prefix: impl Into<String>) -> Self {
        Self::new(vec![
            Box::new(DirectoryPolicySource::new(dir.as_ref().to_path_buf())),
            Box::new(EnvPolicySource::new(env_prefix)),
        ])
    }
}

impl PolicySource for CompositePolicySource {
    fn load(&self) -> Result<PolicySnapshot, PolicyError> {
        let mut merged = PolicySnapshot { loaded_at: Utc::now(), ..Default::default() };
        for source in &self.sources {
            let snapshot = source.load()?;
            merged.budgets.extend(snapshot.budgets);
            merged.routing.extend(snapshot.routing);
            if !snapshot.pricing.models.is_empty() || !snapshot.pricing.tools.is_empty() {
                merged.pricing = snapshot.pricing;
            }
        }
        Ok(merged)
    }
}
