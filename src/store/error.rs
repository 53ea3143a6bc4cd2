//! Persistent store errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    #[error("compare-and-set exhausted after {attempts} attempts")]
    CasExhausted { attempts: u32 },

    #[error("store operation timed out")]
    Timeout,
}
