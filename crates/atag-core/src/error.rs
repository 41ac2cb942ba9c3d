//! Error types for binding and driving a detection module.

use thiserror::Error;

use crate::exports::Operation;
use crate::probe::ProbeLog;

/// Errors raised while binding to or calling into a detection module.
#[derive(Error, Debug)]
pub enum Error {
    /// A mandatory export is missing from the module.
    #[error("required operation '{operation}' could not be bound (tried: {})", .tried.join(", "))]
    Resolution {
        operation: Operation,
        tried: &'static [&'static str],
    },

    /// No configure/detect signature pair passed the acceptance test.
    #[error("no calling convention was accepted by the module ({} attempts)\n{log}", .log.len())]
    ProbeExhausted { log: ProbeLog },

    /// The module allocator returned an unusable address.
    #[error("module allocation of {len} bytes failed: {reason}")]
    Allocation { len: usize, reason: String },

    /// A call into the module trapped.
    #[error("call to '{export}' failed: {message}")]
    Call {
        export: &'static str,
        message: String,
    },

    /// A write fell outside the scratch region or linear memory.
    #[error("memory access out of bounds: {0}")]
    Memory(String),

    /// The frame handed to the detector does not match its dimensions.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is scoped to a single frame.
    ///
    /// A detector that returned a frame-scoped error stays usable for the
    /// next frame.
    pub fn is_frame_scoped(&self) -> bool {
        matches!(
            self,
            Error::Call { .. } | Error::Allocation { .. } | Error::Memory(_) | Error::InvalidFrame(_)
        )
    }
}

/// Result type alias using the binding error.
pub type Result<T> = std::result::Result<T, Error>;
