//! strand-cost-guard - cost-governance sidecar library for multi-agent
//! orchestration runtimes.
//!
//! Embeds at the eight lifecycle points of an agent run (run start/end,
//! iteration start/end, model call start/end, tool call start/end) and
//! returns a structured [`Decision`](types::DecisionCore) the host runtime
//! is required to honor: admit, reject, downgrade, halt, or limit.
//!
//! [`guard::Guard`] is the single entry point a host constructs; it owns
//! the policy store, budget tracker and routing evaluator described in
//! `budget`, `policy` and `routing` below.

pub mod budget;
pub mod config;
pub mod error;
pub mod guard;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod pricing;
pub mod routing;
pub mod store;
pub mod types;

pub use error::{GuardError, GuardResult};
pub use guard::Guard;
pub use types::{
    AdmissionDecision, DecisionAction, FailureMode, IterationDecision, ModelDecision, ModelUsage, RoutingSignals,
    RunContext, RunStatus, ToolDecision, ToolUsage,
};
