//! Metrics emission, injected rather than relying on the `metrics` crate's
//! global recorder: a library embedded in someone else's runtime can't
//! assume it owns the one global Prometheus registry for the whole process.
//! Callers must be able to substitute their own sink, and tests must be
//! able to assert on emitted events without standing up Prometheus.
//!
//! Stable metric names and units below mirror the external interface the
//! host integration already depends on; renaming any of them is a breaking
//! change for existing deployments.

pub mod names {
    pub const COST_TOTAL: &str = "genai.cost.total";
    pub const COST_MODEL: &str = "genai.cost.model";
    pub const COST_TOOL: &str = "genai.cost.tool";
    pub const TOKENS_INPUT: &str = "genai.tokens.input";
    pub const TOKENS_OUTPUT: &str = "genai.tokens.output";
    pub const AGENT_RUNS: &str = "genai.agent.runs";
    pub const AGENT_ITERATIONS: &str = "genai.agent.iterations";
    pub const AGENT_TOOL_CALLS: &str = "genai.agent.tool_calls";
    pub const DOWNGRADE_EVENTS: &str = "genai.cost.downgrade_events";
    pub const REJECTION_EVENTS: &str = "genai.cost.rejection_events";
    pub const HALT_EVENTS: &str = "genai.cost.halt_events";
}

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::RunContext;

/// Attributes common to every emitted metric. `run_id` is included only
/// when high-cardinality attribution is explicitly enabled. `metadata`
/// carries the run's metadata bag, flattened into `strands.metadata.*`
/// attributes at emission time.
#[derive(Debug, Clone)]
pub struct BaseAttributes {
    pub tenant_id: String,
    pub strand_id: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl BaseAttributes {
    pub fn from_context(ctx: &RunContext, include_run_id: bool) -> Self {
        Self {
            tenant_id: ctx.tenant_id.clone(),
            strand_id: ctx.strand_id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            run_id: include_run_id.then(|| ctx.run_id.clone()),
            metadata: ctx.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Start,
    End,
}

/// A monotonic-counter-only emitter. Implementations must never let a
/// failure to record propagate to the calling hook; swallow and log.
pub trait MetricsEmitter: Send + Sync {
    fn record_cost(&self, base: &BaseAttributes, amount: f64, model: Option<&str>, tool: Option<&str>);
    fn record_tokens(&self, base: &BaseAttributes, model: &str, input: u64, output: u64);
    fn record_run_event(&self, base: &BaseAttributes, event: RunEvent, status: Option<&str>);
    fn record_iteration(&self, base: &BaseAttributes, iteration_idx: u32);
    fn record_tool_call(&self, base: &BaseAttributes, tool: &str);
    fn record_downgrade(&self, base: &BaseAttributes, original_model: &str, fallback_model: &str, reason: &str);
    fn record_rejection(&self, base: &BaseAttributes, reason: &str);
    fn record_halt(&self, base: &BaseAttributes, reason: &str);
}

/// Installs a process-global Prometheus recorder and returns the handle a
/// host uses to render `/metrics` text. `PrometheusMetricsEmitter` only
/// calls the `metrics` facade macros; it never installs a recorder itself,
/// since a sidecar library embedded in someone else's process must not
/// assume it owns the one global registry. Call this once at startup if the
/// host doesn't already manage its own recorder.
pub fn install_prometheus_recorder(
) -> Result<metrics_exporter_prometheus::PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Default implementation backed by the `metrics` facade + a Prometheus
/// exporter.
pub struct PrometheusMetricsEmitter;

impl PrometheusMetricsEmitter {
    pub fn new() -> Self {
        Self
    }

    fn labels(base: &BaseAttributes) -> Vec<(String, String)> {
        let mut labels = vec![
            ("strands.tenant_id".to_string(), base.tenant_id.clone()),
            ("strands.strand_id".to_string(), base.strand_id.clone()),
            ("strands.workflow_id".to_string(), base.workflow_id.clone()),
        ];
        if let Some(run_id) = &base.run_id {
            labels.push(("strands.run_id".to_string(), run_id.clone()));
        }
        for (key, value) in &base.metadata {
            labels.push((format!("strands.metadata.{key}"), value.clone()));
        }
        labels
    }
}

impl Default for PrometheusMetricsEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsEmitter for PrometheusMetricsEmitter {
    fn record_cost(&self, base: &BaseAttributes, amount: f64, model: Option<&str>, tool: Option<&str>) {
        // Cost is fractional currency; `Counter::increment` only takes `u64`
        // and would truncate every sub-unit call to zero, so these are
        // gauges accumulated with `increment(f64)` instead.
        let amount = amount.max(0.0);
        let mut labels = Self::labels(base);
        metrics::gauge!(names::COST_TOTAL, &labels).increment(amount);
        if let Some(model) = model {
            labels.push(("genai.model.name".to_string(), model.to_string()));
            metrics::gauge!(names::COST_MODEL, &labels).increment(amount);
        }
        if let Some(tool) = tool {
            let mut tool_labels = Self::labels(base);
            tool_labels.push(("strands.tool.name".to_string(), tool.to_string()));
            metrics::gauge!(names::COST_TOOL, &tool_labels).increment(amount);
        }
    }

    fn record_tokens(&self, base: &BaseAttributes, model: &str, input: u64, output: u64) {
        let mut labels = Self::labels(base);
        labels.push(("genai.model.name".to_string(), model.to_string()));
        metrics::counter!(names::TOKENS_INPUT, &labels).increment(input);
        metrics::counter!(names::TOKENS_OUTPUT, &labels).increment(output);
    }

    fn record_run_event(&self, base: &BaseAttributes, event: RunEvent, status: Option<&str>) {
        let mut labels = Self::labels(base);
        labels.push(("strands.event".to_string(), if event == RunEvent::Start { "start" } else { "end" }.to_string()));
        if let Some(status) = status {
            labels.push(("strands.status".to_string(), status.to_string()));
        }
        metrics::counter!(names::AGENT_RUNS, &labels).increment(1);
    }

    fn record_iteration(&self, base: &BaseAttributes, iteration_idx: u32) {
        let mut labels = Self::labels(base);
        labels.push(("strands.iteration_idx".to_string(), iteration_idx.to_string()));
        metrics::counter!(names::AGENT_ITERATIONS, &labels).increment(1);
    }

    fn record_tool_call(&self, base: &BaseAttributes, tool: &str) {
        let mut labels = Self::labels(base);
        labels.push(("strands.tool.name".to_string(), tool.to_string()));
        metrics::counter!(names::AGENT_TOOL_CALLS, &labels).increment(1);
    }

    fn record_downgrade(&self, base: &BaseAttributes, original_model: &str, fallback_model: &str, reason: &str) {
        let mut labels = Self::labels(base);
        labels.push(("genai.model.original".to_string(), original_model.to_string()));
        labels.push(("genai.model.fallback".to_string(), fallback_model.to_string()));
        labels.push(("strands.reason".to_string(), reason.to_string()));
        metrics::counter!(names::DOWNGRADE_EVENTS, &labels).increment(1);
    }

    fn record_rejection(&self, base: &BaseAttributes, reason: &str) {
        let mut labels = Self::labels(base);
        labels.push(("strands.reason".to_string(), reason.to_string()));
        metrics::counter!(names::REJECTION_EVENTS, &labels).increment(1);
    }

    fn record_halt(&self, base: &BaseAttributes, reason: &str) {
        let mut labels = Self::labels(base);
        labels.push(("strands.reason".to_string(), reason.to_string()));
        metrics::counter!(names::HALT_EVENTS, &labels).increment(1);
    }
}

/// In-memory recording fake: tests assert on exactly what was emitted
/// instead of scraping a real Prometheus registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    Cost { amount: f64, model: Option<String>, tool: Option<String> },
    Tokens { model: String, input: u64, output: u64 },
    RunEvent { event: RunEvent, status: Option<String> },
    Iteration { idx: u32 },
    ToolCall { tool: String },
    Downgrade { original: String, fallback: String, reason: String },
    Rejection { reason: String },
    Halt { reason: String },
}

#[derive(Default)]
pub struct RecordingMetricsEmitter {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingMetricsEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl MetricsEmitter for RecordingMetricsEmitter {
    fn record_cost(&self, _base: &BaseAttributes, amount: f64, model: Option<&str>, tool: Option<&str>) {
        self.events.lock().unwrap().push(RecordedEvent::Cost {
            amount,
            model: model.map(str::to_string),
            tool: tool.map(str::to_string),
        });
    }

    fn record_tokens(&self, _base: &BaseAttributes, model: &str, input: u64, output: u64) {
        self.events.lock().unwrap().push(RecordedEvent::Tokens {
            model: model.to_string(),
            input,
            output,
        });
    }

    fn record_run_event(&self, _base: &BaseAttributes, event: RunEvent, status: Option<&str>) {
        self.events
            .lock()
            .unwrap()
            .push(RecordedEvent::RunEvent { event, status: status.map(str::to_string) });
    }

    fn record_iteration(&self, _base: &BaseAttributes, iteration_idx: u32) {
        self.events.lock().unwrap().push(RecordedEvent::Iteration { idx: iteration_idx });
    }

    fn record_tool_call(&self, _base: &BaseAttributes, tool: &str) {
        self.events.lock().unwrap().push(RecordedEvent::ToolCall { tool: tool.to_string() });
    }

    fn record_downgrade(&self, _base: &BaseAttributes, original_model: &str, fallback_model: &str, reason: &str) {
        self.events.lock().unwrap().push(RecordedEvent::Downgrade {
            original: original_model.to_string(),
            fallback: fallback_model.to_string(),
            reason: reason.to_string(),
        });
    }

    fn record_rejection(&self, _base: &BaseAttributes, reason: &str) {
        self.events
            .lock()
            .unwrap()
            .push(RecordedEvent::Rejection { reason: reason.to_string() });
    }

    fn record_halt(&self, _base: &BaseAttributes, reason: &str) {
        self.events.lock().unwrap().push(RecordedEvent::Halt { reason: reason.to_string() });
    }
}
