//! The persistent budget store contract: an external KV-shaped backend the
//! Budget Tracker consults for optimistic, cross-process-consistent
//! counters. The concrete wire protocol (Redis/Valkey or otherwise) is out
//! of scope; only the `async_trait` boundary and the CAS retry loop that
//! drives it live here, following the "external systems are always behind
//! an `async_trait` interface" shape used throughout this crate.

pub mod error;
pub mod recovery;

pub use error::StoreError;
pub use recovery::RecoveryTask;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::Scope;

/// The exact field set the external interface layout names for a budget's
/// persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStateData {
    pub budget_id: String,
    pub scope_key: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_cost: f64,
    pub total_runs: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_iterations: u64,
    pub total_tool_calls: u64,
    #[serde(default)]
    pub model_costs: HashMap<String, f64>,
    #[serde(default)]
    pub tool_costs: HashMap<String, f64>,
    #[serde(default)]
    pub concurrent_run_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VersionedBudgetState {
    pub data: BudgetStateData,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Ok,
    Retry,
}

/// `{scope}:{tenant}:{strand}:{workflow}:{budget_id}` with levels below the
/// spec's scope omitted.
pub fn build_scope_key(scope: Scope, tenant: &str, strand: &str, workflow: &str, budget_id: &str) -> String {
    match scope {
        Scope::Global => format!("global:{budget_id}"),
        Scope::Tenant => format!("tenant:{tenant}:{budget_id}"),
        Scope::Strand => format!("strand:{tenant}:{strand}:{budget_id}"),
        Scope::Workflow => format!("workflow:{tenant}:{strand}:{workflow}:{budget_id}"),
    }
}

/// `{prefix}:budget:{scope_key}` — the key a concrete KV adapter would use.
pub fn persistent_key(prefix: &str, scope_key: &str) -> String {
    format!("{prefix}:budget:{scope_key}")
}

#[async_trait]
pub trait PersistentBudgetStore: Send + Sync {
    async fn get(&self, scope_key: &str) -> Result<Option<VersionedBudgetState>, StoreError>;

    async fn compare_and_set(
        &self,
        scope_key: &str,
        expected_version: Option<u64>,
        data: BudgetStateData,
    ) -> Result<CasOutcome, StoreError>;

    async fn set_with_ttl(
        &self,
        scope_key: &str,
        data: BudgetStateData,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Optimistic-concurrency update loop: read, apply, CAS, retry on conflict.
/// Bounded at `max_attempts` (default 8); exhaustion is the caller's cue to
/// fall back to in-memory-only accounting for this update. Once the CAS
/// succeeds, stamps the key with `expires_at` via `set_with_ttl` so stale
/// budget data self-purges after its period ends.
pub async fn cas_update<F>(
    store: &dyn PersistentBudgetStore,
    scope_key: &str,
    max_attempts: u32,
    expires_at: DateTime<Utc>,
    mut apply: F,
) -> Result<BudgetStateData, StoreError>
where
    F: FnMut(Option<BudgetStateData>) -> BudgetStateData,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = store.get(scope_key).await?;
        let (expected_version, base) = match current {
            Some(versioned) => (Some(versioned.version), Some(versioned.data)),
            None => (None, None),
        };
        let updated = apply(base);
        match store.compare_and_set(scope_key, expected_version, updated.clone()).await? {
            CasOutcome::Ok => {
                store.set_with_ttl(scope_key, updated.clone(), expires_at).await?;
                return Ok(updated);
            }
            CasOutcome::Retry => {
                if attempt >= max_attempts {
                    return Err(StoreError::CasExhausted { attempts: attempt });
                }
            }
        }
    }
}

/// Default, dependency-free backend: an in-process map behind a version
/// counter. Ships as the no-external-KV default; also doubles as the test
/// double for exercising the CAS retry loop deterministically.
#[derive(Debug, Default)]
pub struct InMemoryBudgetStore {
    entries: DashMap<String, VersionedBudgetState>,
}

impl InMemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentBudgetStore for InMemoryBudgetStore {
    async fn get(&self, scope_key: &str) -> Result<Option<VersionedBudgetState>, StoreError> {
        Ok(self.entries.get(scope_key).map(|entry| entry.clone()))
    }

    async fn compare_and_set(
        &self,
        scope_key: &str,
        expected_version: Option<u64>,
        data: BudgetStateData,
    ) -> Result<CasOutcome, StoreError> {
        match self.entries.get(scope_key).map(|e| e.version) {
            current if current == expected_version => {
                let next_version = expected_version.unwrap_or(0) + 1;
                self.entries.insert(
                    scope_key.to_string(),
                    VersionedBudgetState {
                        data,
                        version: next_version,
                    },
                );
                Ok(CasOutcome::Ok)
            }
            _ => Ok(CasOutcome::Retry),
        }
    }

    async fn set_with_ttl(
        &self,
        scope_key: &str,
        data: BudgetStateData,
        _expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let next_version = self.entries.get(scope_key).map(|e| e.version + 1).unwrap_or(0);
        self.entries
            .insert(scope_key.to_string(), VersionedBudgetState { data, version: next_version });
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}

/// Always reports unavailable. Exercises the degrade-to-in-memory path in
/// tests without standing up a real backend.
#[derive(Debug, Default)]
pub struct NullBudgetStore;

#[async_trait]
impl PersistentBudgetStore for NullBudgetStore {
    async fn get(&self, _scope_key: &str) -> Result<Option<VersionedBudgetState>, StoreError> {
        Err(StoreError::Unavailable("null store".to_string()))
    }

    async fn compare_and_set(
        &self,
        _scope_key: &str,
        _expected_version: Option<u64>,
        _data: BudgetStateData,
    ) -> Result<CasOutcome, StoreError> {
        Err(StoreError::Unavailable("null store".to_string()))
    }

    async fn set_with_ttl(
        &self,
        _scope_key: &str,
        _data: BudgetStateData,
        _expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("null store".to_string()))
    }

    async fn list_keys(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("null store".to_string()))
    }
}

pub type SharedStore = Arc<dyn PersistentBudgetStore>;
