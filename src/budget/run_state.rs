//! `RunState`: the mutable, per-run accumulator the Budget Tracker owns.
//!
//! One entry per `run_id`, protected by its own mutex so concurrent hooks on different runs never
//! contend with each other.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::{RunContext, RunStatus};

#[derive(Debug, Clone)]
pub struct RunState {
    pub ctx: RunContext,
    pub status: RunStatus,
    pub iteration: u32,
    pub total_cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: u32,
    pub model_costs: HashMap<String, f64>,
    pub tool_costs: HashMap<String, f64>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Sum of reported model-call latencies, paired with `latency_samples`,
    /// to derive `RoutingSignals::avg_latency_ms` for the latency downgrade
    /// trigger. Latency reporting is optional per call.
    pub latency_total_ms: f64,
    pub latency_samples: u64,
}

impl RunState {
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            status: RunStatus::Running,
            iteration: 0,
            total_cost: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            tool_calls: 0,
            model_costs: HashMap::new(),
            tool_costs: HashMap::new(),
            ended_at: None,
            latency_total_ms: 0.0,
            latency_samples: 0,
        }
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.latency_samples == 0 {
            None
        } else {
            Some(self.latency_total_ms / self.latency_samples as f64)
        }
    }

    /// Invariant: once `status != Running`, no further accounting is
    /// accepted for this run_id. Callers check this before mutating.
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }
}
