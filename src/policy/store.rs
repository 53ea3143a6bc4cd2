//! Policy snapshot cache with lazy, best-effort refresh.
//!
//! Snapshots are held behind `arc_swap::ArcSwap` rather than a
//! `Mutex<Arc<_>>`: readers on the hot decision path take no lock at all
//! (an atomic pointer load), and a writer swaps the pointer atomically on
//! reload — the "copy-on-write, lock-free reads" shape a policy store that
//! refreshes in the background while hooks keep firing needs.

use std::sync::Mutex;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tracing::warn;

use super::{BudgetSpec, PolicyError, RoutingPolicy};
use crate::pricing::PricingTable;

#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub budgets: Vec<BudgetSpec>,
    pub routing: Vec<RoutingPolicy>,
    pub pricing: PricingTable,
    pub loaded_at: DateTime<Utc>,
}

impl PolicySnapshot {
    /// All enabled budgets whose three match patterns simultaneously match
    /// the context. Every match applies concurrently — unlike routing,
    /// there is no single winner.
    pub fn resolve_budgets(&self, tenant: &str, strand: &str, workflow: &str) -> Vec<BudgetSpec> {
        self.budgets
            .iter()
            .filter(|spec| spec.enabled && spec.matches(tenant, strand, workflow))
            .cloned()
            .collect()
    }

    /// The single highest-scoring matching routing policy; ties broken by
    /// load order.
    pub fn resolve_routing(&self, tenant: &str, strand: &str, workflow: &str) -> Option<&RoutingPolicy> {
        self.routing
            .iter()
            .filter(|policy| policy.matches(tenant, strand, workflow))
            .enumerate()
            .max_by_key(|(idx, policy)| (policy.priority_score(), std::cmp::Reverse(*idx)))
            .map(|(_, policy)| policy)
    }
}

/// Pluggable load source for the three policy documents. Concrete
/// implementations (directory-of-TOML, environment variables) live in
/// `policy::loader`.
pub trait PolicySource: Send + Sync {
    fn load(&self) -> Result<PolicySnapshot, PolicyError>;
}

/// Caches the most recently loaded snapshot and reloads lazily before a
/// lookup if `now - last_load >= refresh_interval`. Reload is best-effort:
/// on failure the previous snapshot is retained and a warning is emitted.
pub struct PolicyStore {
    source: Box<dyn PolicySource>,
    snapshot: ArcSwap<PolicySnapshot>,
    last_load: Mutex<DateTime<Utc>>,
    refresh_interval: Duration,
}

impl PolicyStore {
    pub fn new(source: Box<dyn PolicySource>, refresh_interval: Duration) -> Result<Self, PolicyError> {
        let initial = source.load()?;
        let now = initial.loaded_at;
        Ok(Self {
            source,
            snapshot: ArcSwap::from_pointee(initial),
            last_load: Mutex::new(now),
            refresh_interval,
        })
    }

    fn maybe_refresh(&self) {
        let now = Utc::now();
        {
            let mut last_load = self.last_load.lock().unwrap();
            let elapsed = now.signed_duration_since(*last_load);
            if elapsed.to_std().unwrap_or(Duration::ZERO) < self.refresh_interval {
                return;
            }
            *last_load = now;
        }
        match self.source.load() {
            Ok(fresh) => self.snapshot.store(std::sync::Arc::new(fresh)),
            Err(error) => warn!(%error, "policy refresh failed, retaining previous snapshot"),
        }
    }

    /// Atomic, lock-free snapshot read from readers' perspective (the
    /// refresh check only takes a lock when a reload is actually due).
    pub fn snapshot(&self) -> arc_swap::Guard<std::sync::Arc<PolicySnapshot>> {
        self.maybe_refresh();
        self.snapshot.load()
    }

    /// Construct a store from an already-loaded snapshot, bypassing the
    /// source entirely. Useful for tests and for embedding callers that
    /// build policy programmatically.
    pub fn from_snapshot(snapshot: PolicySnapshot) -> Self {
        struct NoRefresh;
        impl PolicySource for NoRefresh {
            fn load(&self) -> Result<PolicySnapshot, PolicyError> {
                Err(PolicyError::Parse {
                    document: "none".to_string(),
                    message: "static snapshot has no backing source".to_string(),
                })
            }
        }
        let now = snapshot.loaded_at;
        Self {
            source: Box::new(NoRefresh),
            snapshot: ArcSwap::from_pointee(snapshot),
            last_load: Mutex::new(now),
            refresh_interval: Duration::MAX,
        }
    }
}
