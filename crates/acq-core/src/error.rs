//! Error types for the acquisition stack.
//!
//! All fallible operations in the engine and the drivers return
//! [`AcqResult`]. The variants map one-to-one onto how the engine reacts:
//!
//! - **`Validation`**: the request is inconsistent. Raised synchronously by
//!   `acquire()` before any hardware is touched; no side effects.
//! - **`TransientHardware`** / **`Timeout`**: driver busy or a read/write ran
//!   out of time. The engine retries the current tile a bounded number of
//!   times, then escalates to `Hardware`.
//! - **`WaveformTooLarge`**: the emitter rejected the waveform size; the
//!   engine retries with a smaller tile.
//! - **`Hardware`**: unrecoverable; the acquisition fails and the engine
//!   state switches to `HwError`. A later acquisition may still succeed.
//! - **`Cancelled`**: the acquisition was cancelled cooperatively.
//! - **`Leech`**: a periodic in-scan task failed. The main scan survives
//!   unless the leech is marked required.
//! - **`External`**: a collaborator misbehaved (wrong array shape, missing
//!   metadata). Attached to the future as a secondary error; coherent
//!   partial data is still returned.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the acquisition error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

#[derive(Error, Debug, Clone)]
pub enum AcqError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient hardware error: {0}")]
    TransientHardware(String),

    #[error("timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    #[error("waveform of {size} samples exceeds device buffer of {limit}")]
    WaveformTooLarge { size: usize, limit: usize },

    #[error("hardware error: {0}")]
    Hardware(String),

    #[error("acquisition cancelled")]
    Cancelled,

    #[error("leech '{name}' failed: {reason}")]
    Leech { name: String, reason: String },

    #[error("external collaborator error: {0}")]
    External(String),
}

impl AcqError {
    /// Whether the engine may retry the current tile after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AcqError::TransientHardware(_)
                | AcqError::Timeout(..)
                | AcqError::WaveformTooLarge { .. }
        )
    }

    /// Shorthand for a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        AcqError::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AcqError::TransientHardware("busy".into()).is_transient());
        assert!(AcqError::Timeout(Duration::from_millis(100), "read".into()).is_transient());
        assert!(AcqError::WaveformTooLarge { size: 10, limit: 5 }.is_transient());
        assert!(!AcqError::Hardware("dead".into()).is_transient());
        assert!(!AcqError::Cancelled.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = AcqError::Leech {
            name: "drift".into(),
            reason: "anchor lost".into(),
        };
        assert_eq!(err.to_string(), "leech 'drift' failed: anchor lost");
    }
}
