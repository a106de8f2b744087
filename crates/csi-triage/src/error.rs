//! Error types for the triage engine.

use thiserror::Error;

use crate::types::DetectionMethod;

/// Errors surfaced by the cluster reader, detectors, and coordinator.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Upstream Kubernetes API failure; the reason carries the API message
    /// verbatim.
    #[error("failed to {operation}: {reason}")]
    Api { operation: String, reason: String },

    /// A detector failed; wraps the underlying reader error.
    #[error("{method} detection failed: {source}")]
    Detection {
        method: DetectionMethod,
        #[source]
        source: Box<ScanError>,
    },

    /// The pass was cancelled before completing.
    #[error("detection cancelled - narrow the scope with --driver or fewer --method selections and retry")]
    Cancelled,

    #[error("unknown detection method: {name}")]
    UnknownMethod { name: String },

    #[error("unknown severity level: {name}")]
    UnknownSeverity { name: String },

    #[error("unknown output format: {name}")]
    UnknownOutputFormat { name: String },

    /// Remediation job failure (creation or completion tracking).
    #[error("cleanup job error: {reason}")]
    CleanupJob { reason: String },
}

impl ScanError {
    /// Wrap a reader error with the detector that hit it.
    #[must_use]
    pub fn detection(method: DetectionMethod, source: ScanError) -> Self {
        ScanError::Detection {
            method,
            source: Box::new(source),
        }
    }

    /// True when this error (or anything it wraps) is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            ScanError::Cancelled => true,
            ScanError::Detection { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Result type alias for triage operations.
pub type ScanResult<T> = Result<T, ScanError>;
