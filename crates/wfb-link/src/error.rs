//! Error taxonomy for the core engine (spec.md §7): hardware failures from
//! the radio tuner, and logic assertions that are always absorbed by the
//! caller, never propagated as process-fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("iw invocation failed: {0}")]
    HardwareFailure(String),
    #[error("invariant violation: {0}")]
    LogicAssertion(String),
    #[error("incoherent configuration: {0}")]
    Configuration(String),
}
