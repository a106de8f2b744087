//! Core types shared by every detection method.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ScanError;

/// One of the detection approaches the coordinator can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DetectionMethod {
    #[serde(rename = "volume-attachments")]
    VolumeAttachments,
    #[serde(rename = "cross-node-pvc")]
    CrossNodePvc,
    #[serde(rename = "events")]
    Events,
    #[serde(rename = "metrics")]
    Metrics,
}

impl DetectionMethod {
    /// Every method, in coordinator declaration order.
    pub const ALL: [DetectionMethod; 4] = [
        DetectionMethod::VolumeAttachments,
        DetectionMethod::CrossNodePvc,
        DetectionMethod::Events,
        DetectionMethod::Metrics,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionMethod::VolumeAttachments => "volume-attachments",
            DetectionMethod::CrossNodePvc => "cross-node-pvc",
            DetectionMethod::Events => "events",
            DetectionMethod::Metrics => "metrics",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionMethod {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "volume-attachments" => Ok(DetectionMethod::VolumeAttachments),
            "cross-node-pvc" => Ok(DetectionMethod::CrossNodePvc),
            "events" => Ok(DetectionMethod::Events),
            "metrics" => Ok(DetectionMethod::Metrics),
            other => Err(ScanError::UnknownMethod {
                name: other.to_string(),
            }),
        }
    }
}

/// Category of a diagnosed mount/attach problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IssueType {
    #[serde(rename = "volume-attachment-conflict")]
    VolumeAttachmentConflict,
    #[serde(rename = "stuck-volume-attachment")]
    StuckVolumeAttachment,
    #[serde(rename = "stuck-volume-detachment")]
    StuckVolumeDetachment,
    #[serde(rename = "multiple-attachments")]
    MultipleAttachments,
    #[serde(rename = "multi-attach-error")]
    MultiAttachError,
    #[serde(rename = "failed-attach-volume")]
    FailedAttachVolume,
    #[serde(rename = "stuck-mount-reference")]
    StuckMountReference,
    #[serde(rename = "csi-operation-failure")]
    CsiOperationFailure,
}

impl IssueType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::VolumeAttachmentConflict => "volume-attachment-conflict",
            IssueType::StuckVolumeAttachment => "stuck-volume-attachment",
            IssueType::StuckVolumeDetachment => "stuck-volume-detachment",
            IssueType::MultipleAttachments => "multiple-attachments",
            IssueType::MultiAttachError => "multi-attach-error",
            IssueType::FailedAttachVolume => "failed-attach-volume",
            IssueType::StuckMountReference => "stuck-mount-reference",
            IssueType::CsiOperationFailure => "csi-operation-failure",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Impact level of a finding, ordered `low < medium < high < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "low")]
    Low,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "high")]
    High,
    #[serde(rename = "critical")]
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(ScanError::UnknownSeverity {
                name: other.to_string(),
            }),
        }
    }
}

/// One atomic diagnosed problem produced by a detector.
///
/// Optional string fields use the empty string for "not known"; serialization
/// drops them. `metadata` is a sorted map so output is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pvc: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub driver: String,
    pub description: String,
    pub detected_by: DetectionMethod,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Finding {
    pub fn new(
        issue_type: IssueType,
        severity: Severity,
        detected_by: DetectionMethod,
        description: impl Into<String>,
    ) -> Self {
        Self {
            issue_type,
            severity,
            node: String::new(),
            volume: String::new(),
            pvc: String::new(),
            namespace: String::new(),
            driver: String::new(),
            description: description.into(),
            detected_by,
            detected_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    #[must_use]
    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volume = volume.into();
        self
    }

    #[must_use]
    pub fn with_pvc(mut self, pvc: impl Into<String>) -> Self {
        self.pvc = pvc.into();
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Flattened view of one `VolumeAttachment` record.
///
/// The volume handle is the bound PV name or the inline CSI handle and is
/// never empty; `"unknown"` marks an indeterminate source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAttachmentView {
    pub name: String,
    pub node: String,
    pub volume_handle: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub driver: String,
    pub attached: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub attach_error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detach_error: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Per-node PVC reference counts, keyed by `"<namespace>/<name>"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePvcUsage {
    pub node: String,
    pub pvc_counts: BTreeMap<String, usize>,
    pub total: usize,
}

/// A relevant Kubernetes event, condensed for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInfo {
    #[serde(rename = "type")]
    pub event_type: String,
    pub reason: String,
    pub message: String,
    pub object: String,
    pub namespace: String,
    pub time: DateTime<Utc>,
}

/// A named Prometheus query from the metrics catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricQuery {
    pub name: String,
    pub query: String,
    pub description: String,
}

/// Configuration for one diagnostic pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionOptions {
    pub methods: Vec<DetectionMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_driver: Option<String>,
    /// Rendering hint for the caller; the engine never interprets it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_format: String,
    #[serde(default)]
    pub recommend_cleanup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            methods: vec![
                DetectionMethod::VolumeAttachments,
                DetectionMethod::CrossNodePvc,
                DetectionMethod::Events,
            ],
            target_driver: None,
            output_format: String::new(),
            recommend_cleanup: false,
            min_severity: None,
        }
    }
}

/// Everything one diagnostic pass produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub summary: DetectionSummary,
    pub issues: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// High-level statistics over the filtered findings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionSummary {
    pub total_issues: usize,
    pub issues_by_severity: BTreeMap<Severity, usize>,
    pub issues_by_type: BTreeMap<IssueType, usize>,
    pub affected_nodes: Vec<String>,
    pub affected_drivers: Vec<String>,
    pub methods_used: Vec<DetectionMethod>,
}
