//! Centralized error type for the control runtime.
//!
//! Mirrors the runtime's error-kind table: every error the core
//! surfaces is one variant here, carrying enough context to log and to
//! decide whether the originating operation may be retried. Using
//! `thiserror`, lower-level error types convert in with `#[from]` so `?`
//! composes across config, I/O, Modbus, and datastore boundaries.

use thiserror::Error;
use uuid::Uuid;

/// Convenience alias for results using the runtime's error type.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    /// `to-processing` rejected because the machine was not idle/offline or
    /// already had a bound process (§4.B race guard).
    #[error("machine is busy: {0}")]
    MachineBusy(String),

    /// A step's sibling config table had no row and no usable inline
    /// fallback (fatal for valve/loop; purge instead substitutes a default).
    #[error("step configuration missing: {0}")]
    StepConfigMissing(String),

    /// A `set_parameter` value fell outside `[min_value, max_value]` (I6).
    #[error("parameter {parameter_id} value {value} out of range [{min}, {max}]")]
    ParameterOutOfRange {
        parameter_id: Uuid,
        value: f64,
        min: f64,
        max: f64,
    },

    /// The PLC rejected or failed to complete a write.
    #[error("plc write failed: {0}")]
    PlcWriteFailed(String),

    /// The PLC rejected or failed to complete a read.
    #[error("plc read failed: {0}")]
    PlcReadFailed(String),

    /// No live connection to the PLC. Fatal for recipe runs; the
    /// continuous logger instead skips the tick and keeps trying.
    #[error("plc disconnected")]
    PlcDisconnected,

    /// A datastore call failed in a way judged transient (connection reset,
    /// timeout). Retried with backoff only at process-startup boundaries;
    /// if encountered mid-step, the step fails.
    #[error("datastore error: {0}")]
    DatastoreTransient(String),

    /// Command payload failed validation in Command Intake.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Recipe/step compilation found a recipe tree the executor cannot run
    /// (e.g. a loop step with no children).
    #[error("recipe compile error: {0}")]
    RecipeCompile(String),

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("modbus protocol error: {0}")]
    Modbus(#[from] tokio_modbus::Exception),

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl CoreError {
    /// Whether the originating operation is safe to retry with backoff.
    /// Per §7, only datastore errors are retried, and only at startup/process
    /// boundaries — never mid-step.
    pub fn can_retry(&self) -> bool {
        matches!(self, CoreError::DatastoreTransient(_) | CoreError::Sqlx(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datastore_errors_are_retryable() {
        assert!(CoreError::DatastoreTransient("timeout".into()).can_retry());
    }

    #[test]
    fn step_errors_are_not_retryable() {
        assert!(!CoreError::MachineBusy("busy".into()).can_retry());
        assert!(!CoreError::PlcWriteFailed("nack".into()).can_retry());
        assert!(!CoreError::ValidationError("bad".into()).can_retry());
    }

    #[test]
    fn parameter_out_of_range_message() {
        let err = CoreError::ParameterOutOfRange {
            parameter_id: Uuid::nil(),
            value: 9999.0,
            min: 0.0,
            max: 1000.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("9999"));
        assert!(msg.contains("1000"));
    }
}
