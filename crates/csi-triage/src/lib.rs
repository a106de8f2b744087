//! Diagnosis engine for stuck and inconsistent CSI volume state.
//!
//! Four independent detectors reason over different slices of cluster state
//! (the `VolumeAttachment` graph, pod/PVC intersections, the event stream,
//! and Prometheus metrics); a coordinator fans them out, merges their
//! findings into one taxonomy, and computes a severity-weighted summary.
//!
//! The engine is read-only: all cluster access goes through the
//! [`client::ClusterReader`] capability, and the only mutating component
//! ([`cleanup`]) sits outside the engine behind an explicit operator action.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

pub mod cleanup;
pub mod client;
pub mod detect;
pub mod error;
pub mod output;
pub mod types;

pub use client::{ClusterReader, KubeClusterReader};
pub use detect::{Coordinator, DetailedAnalysis, IssueDetector};
pub use error::{ScanError, ScanResult};
pub use types::{
    DetectionMethod, DetectionOptions, DetectionResult, DetectionSummary, Finding, IssueType,
    Severity,
};
