//! `BudgetState`: the mutable accumulator paired with a `BudgetSpec` and a
//! period window. One entry per `(budget_id, scope_key)`, protected by its
//! own mutex.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::window::{window_for, Period};
use crate::store::BudgetStateData;

#[derive(Debug, Clone)]
pub struct BudgetState {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_cost: f64,
    pub total_runs: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_iterations: u64,
    pub total_tool_calls: u64,
    pub model_costs: HashMap<String, f64>,
    pub tool_costs: HashMap<String, f64>,
    /// `run_id -> admitted_at`, preserved across period resets since runs
    /// can span periods.
    pub concurrent_runs: HashMap<String, DateTime<Utc>>,
    pub thresholds_crossed: Vec<f64>,
}

impl BudgetState {
    pub fn new(period: Period, now: DateTime<Utc>) -> Self {
        let (period_start, period_end) = window_for(period, now);
        Self {
            period_start,
            period_end,
            total_cost: 0.0,
            total_runs: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_iterations: 0,
            total_tool_calls: 0,
            model_costs: HashMap::new(),
            tool_costs: HashMap::new(),
            concurrent_runs: HashMap::new(),
            thresholds_crossed: Vec::new(),
        }
    }

    /// When wall-clock time crosses `period_end`, atomically reset to
    /// zeros with a new window before any further mutation.
    /// `concurrent_run_ids` is preserved; everything else is zeroed.
    pub fn maybe_roll_period(&mut self, period: Period, now: DateTime<Utc>) {
        if now < self.period_end {
            return;
        }
        let (period_start, period_end) = window_for(period, now);
        let concurrent_runs = std::mem::take(&mut self.concurrent_runs);
        *self = Self::new(period, now);
        self.period_start = period_start;
        self.period_end = period_end;
        self.concurrent_runs = concurrent_runs;
    }

    pub fn utilization(&self, max_cost: f64) -> f64 {
        if max_cost <= 0.0 {
            return 0.0;
        }
        self.total_cost / max_cost
    }

    /// Exactly at `utilization == threshold`, the threshold IS crossed.
    /// Detection is monotone: a threshold already in `thresholds_crossed`
    /// is never re-reported within the same period. Returns newly crossed
    /// thresholds in ascending order.
    pub fn detect_new_crossings(&mut self, soft_thresholds: &[f64], max_cost: f64) -> Vec<f64> {
        if max_cost <= 0.0 {
            return Vec::new();
        }
        let utilization = self.utilization(max_cost);
        let mut sorted: Vec<f64> = soft_thresholds.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let mut newly_crossed = Vec::new();
        for t in sorted {
            if t <= utilization && !self.thresholds_crossed.contains(&t) {
                self.thresholds_crossed.push(t);
                newly_crossed.push(t);
            }
        }
        newly_crossed
    }

    /// Bounded eviction: when the
    /// concurrent set exceeds `max_concurrent_runs * 2`, evict the oldest
    /// (by admission timestamp) entries until back at the cap.
    pub fn evict_oldest_if_over(&mut self, max_concurrent_runs: Option<u64>) {
        let Some(max_concurrent) = max_concurrent_runs else { return };
        let cap = (max_concurrent * 2) as usize;
        while self.concurrent_runs.len() > cap {
            let Some(oldest_id) = self
                .concurrent_runs
                .iter()
                .min_by_key(|(_, started_at)| **started_at)
                .map(|(run_id, _)| run_id.clone())
            else {
                break;
            };
            self.concurrent_runs.remove(&oldest_id);
        }
    }

    pub fn to_persisted(&self, budget_id: &str, scope_key: &str) -> BudgetStateData {
        BudgetStateData {
            budget_id: budget_id.to_string(),
            scope_key: scope_key.to_string(),
            period_start: self.period_start,
            period_end: self.period_end,
            total_cost: self.total_cost,
            total_runs: self.total_runs,
            total_input_tokens: self.total_input_tokens,
            total_output_tokens: self.total_output_tokens,
            total_iterations: self.total_iterations,
            total_tool_calls: self.total_tool_calls,
            model_costs: self.model_costs.clone(),
            tool_costs: self.tool_costs.clone(),
            concurrent_run_ids: self.concurrent_runs.keys().cloned().collect(),
        }
    }
}
