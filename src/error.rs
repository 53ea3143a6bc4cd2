//! Crate-wide error type.
//!
//! Per the propagation policy, `BudgetExceeded` and `ConstraintViolated`
//! never escape a lifecycle hook as `Err` — the guard folds them into
//! `Decision.allowed = false` instead. The variants still exist here
//! because the policy store, budget tracker and persistent store adapter
//! need a uniform type to report internally before the guard turns a
//! failure into a decision.

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),

    #[error("unknown run_id: {0}")]
    ContextUnknown(String),

    #[error("persistent store unavailable: {0}")]
    BackendUnavailable(#[from] StoreError),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("constraint violated: {0}")]
    ConstraintViolated(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

pub type GuardResult<T> = Result<T, GuardError>;
