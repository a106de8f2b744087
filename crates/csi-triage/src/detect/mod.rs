//! Multi-method detection engine.
//!
//! The coordinator owns one detector per configured method, fans the
//! `detect` calls out in parallel, and shapes the merged findings into a
//! [`DetectionResult`]. Detectors never talk to each other and share only
//! the read-only cluster reader.

pub mod cross_node_pvc;
pub mod events;
pub mod metrics;
pub mod mining;
pub mod volume_attachments;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::future;
use serde::Serialize;
use tracing::{debug, info};

use crate::client::ClusterReader;
use crate::error::{ScanError, ScanResult};
use crate::types::{
    DetectionMethod, DetectionOptions, DetectionResult, DetectionSummary, EventInfo, Finding,
    IssueType, MetricQuery, NodePvcUsage, Severity,
};

pub use cross_node_pvc::CrossNodePvcDetector;
pub use events::EventsDetector;
pub use metrics::MetricsDetector;
pub use volume_attachments::VolumeAttachmentDetector;

/// Common capability every detection method implements.
#[async_trait]
pub trait IssueDetector: Send + Sync {
    /// Which method this detector implements.
    fn method(&self) -> DetectionMethod;

    /// Run one pass over the cluster state and return findings.
    async fn detect(&self) -> ScanResult<Vec<Finding>>;
}

/// Auxiliary statistics for troubleshooting, produced best-effort.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedAnalysis {
    pub volume_attachment_count: usize,
    pub attached_volume_count: usize,
    pub volume_attachment_errors: usize,
    pub node_pvc_usage: Vec<NodePvcUsage>,
    pub recent_events: Vec<EventInfo>,
    pub metric_queries: Vec<MetricQuery>,
    pub recommended_alerts: Vec<String>,
}

/// Composes the configured detectors into a single diagnostic pass.
pub struct Coordinator {
    reader: Arc<dyn ClusterReader>,
    options: DetectionOptions,
    volume_attachments: Option<VolumeAttachmentDetector>,
    cross_node_pvc: Option<CrossNodePvcDetector>,
    events: Option<EventsDetector>,
    metrics: Option<MetricsDetector>,
}

impl Coordinator {
    /// Build the detectors selected by `options.methods`. Duplicate method
    /// entries are ignored; detectors always run in declaration order
    /// (volume-attachments, cross-node-pvc, events, metrics) regardless of
    /// the order methods were requested in.
    pub fn new(reader: Arc<dyn ClusterReader>, options: DetectionOptions) -> Self {
        let target = options.target_driver.clone();
        let wants = |method: DetectionMethod| options.methods.contains(&method);

        Self {
            volume_attachments: wants(DetectionMethod::VolumeAttachments)
                .then(|| VolumeAttachmentDetector::new(reader.clone(), target.clone())),
            cross_node_pvc: wants(DetectionMethod::CrossNodePvc)
                .then(|| CrossNodePvcDetector::new(reader.clone(), target.clone())),
            events: wants(DetectionMethod::Events).then(|| {
                EventsDetector::new(reader.clone(), target.clone(), Duration::hours(1))
            }),
            metrics: wants(DetectionMethod::Metrics)
                .then(|| MetricsDetector::new(None, target.clone())),
            reader,
            options,
        }
    }

    fn detectors(&self) -> Vec<&dyn IssueDetector> {
        let mut detectors: Vec<&dyn IssueDetector> = Vec::new();
        if let Some(d) = &self.volume_attachments {
            detectors.push(d);
        }
        if let Some(d) = &self.cross_node_pvc {
            detectors.push(d);
        }
        if let Some(d) = &self.events {
            detectors.push(d);
        }
        if let Some(d) = &self.metrics {
            detectors.push(d);
        }
        detectors
    }

    /// Run every configured detector and merge the findings.
    ///
    /// Detectors run concurrently; the first failure aborts the pass.
    /// Findings keep detector declaration order so the same cluster snapshot
    /// always produces the same result.
    pub async fn detect_all(&self) -> ScanResult<DetectionResult> {
        let detectors = self.detectors();
        let methods_used: Vec<DetectionMethod> = detectors.iter().map(|d| d.method()).collect();

        let tasks = detectors.into_iter().map(|detector| async move {
            detector
                .detect()
                .await
                .map_err(|err| ScanError::detection(detector.method(), err))
        });
        let per_detector = future::try_join_all(tasks).await?;

        let all_findings: Vec<Finding> = per_detector.into_iter().flatten().collect();
        debug!(count = all_findings.len(), "detectors returned findings");

        let issues = match self.options.min_severity {
            Some(min) => all_findings
                .into_iter()
                .filter(|f| f.severity >= min)
                .collect(),
            None => all_findings,
        };

        let summary = build_summary(&issues, methods_used);

        let recommendations = if self.options.recommend_cleanup {
            build_recommendations(&issues)
        } else {
            Vec::new()
        };

        info!(issues = issues.len(), "detection pass complete");

        Ok(DetectionResult {
            summary,
            issues,
            recommendations,
            generated_at: Utc::now(),
        })
    }

    /// [`Coordinator::detect_all`] under a wall-clock deadline. Deadline
    /// expiry drops the in-flight reads and reports cancellation.
    pub async fn detect_all_within(
        &self,
        deadline: std::time::Duration,
    ) -> ScanResult<DetectionResult> {
        match tokio::time::timeout(deadline, self.detect_all()).await {
            Ok(result) => result,
            Err(_) => Err(ScanError::Cancelled),
        }
    }

    /// Gather auxiliary statistics for troubleshooting.
    ///
    /// Each source is best-effort: a failing source leaves its fields at
    /// their zero value. Only cancellation aborts the whole call.
    pub async fn detailed_analysis(&self) -> ScanResult<DetailedAnalysis> {
        let mut analysis = DetailedAnalysis::default();

        if self.volume_attachments.is_some() {
            match self.reader.list_volume_attachments().await {
                Ok(attachments) => {
                    analysis.volume_attachment_count = attachments.len();
                    for va in &attachments {
                        let Some(status) = va.status.as_ref() else {
                            continue;
                        };
                        if status.attached {
                            analysis.attached_volume_count += 1;
                        }
                        if status.attach_error.is_some() || status.detach_error.is_some() {
                            analysis.volume_attachment_errors += 1;
                        }
                    }
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => debug!(error = %err, "skipping volume attachment statistics"),
            }
        }

        if let Some(detector) = &self.cross_node_pvc {
            match detector.node_pvc_usage().await {
                Ok(usage) => analysis.node_pvc_usage = usage,
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => debug!(error = %err, "skipping node pvc usage"),
            }
        }

        if let Some(detector) = &self.events {
            match detector.recent_events(50).await {
                Ok(events) => analysis.recent_events = events,
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => debug!(error = %err, "skipping recent events"),
            }
        }

        if let Some(detector) = &self.metrics {
            analysis.metric_queries = detector.metric_queries();
            analysis.recommended_alerts = detector.recommended_alerts();
        }

        Ok(analysis)
    }
}

/// Summarise the filtered findings.
fn build_summary(issues: &[Finding], methods_used: Vec<DetectionMethod>) -> DetectionSummary {
    let mut issues_by_severity: BTreeMap<Severity, usize> = BTreeMap::new();
    let mut issues_by_type: BTreeMap<IssueType, usize> = BTreeMap::new();
    let mut nodes: BTreeSet<String> = BTreeSet::new();
    let mut drivers: BTreeSet<String> = BTreeSet::new();

    for finding in issues {
        *issues_by_severity.entry(finding.severity).or_default() += 1;
        *issues_by_type.entry(finding.issue_type).or_default() += 1;
        if !finding.node.is_empty() {
            nodes.insert(finding.node.clone());
        }
        if !finding.driver.is_empty() {
            drivers.insert(finding.driver.clone());
        }
    }

    DetectionSummary {
        total_issues: issues.len(),
        issues_by_severity,
        issues_by_type,
        affected_nodes: nodes.into_iter().collect(),
        affected_drivers: drivers.into_iter().collect(),
        methods_used,
    }
}

/// Ordered remediation hint list; empty when there is nothing to remediate.
fn build_recommendations(issues: &[Finding]) -> Vec<String> {
    if issues.is_empty() {
        return Vec::new();
    }

    let mut has_attachment_conflicts = false;
    let mut has_multiple_attachments = false;
    let mut has_stuck_mount_refs = false;
    let mut has_csi_failures = false;
    let mut nodes: BTreeSet<&str> = BTreeSet::new();
    let mut drivers: BTreeSet<&str> = BTreeSet::new();

    for finding in issues {
        match finding.issue_type {
            IssueType::VolumeAttachmentConflict => has_attachment_conflicts = true,
            IssueType::MultipleAttachments => has_multiple_attachments = true,
            IssueType::StuckMountReference => has_stuck_mount_refs = true,
            IssueType::CsiOperationFailure => has_csi_failures = true,
            _ => {}
        }
        if !finding.node.is_empty() {
            nodes.insert(&finding.node);
        }
        if !finding.driver.is_empty() {
            drivers.insert(&finding.driver);
        }
    }

    let mut recommendations = vec!["## Immediate Actions".to_string()];

    if has_attachment_conflicts || has_multiple_attachments {
        recommendations.extend([
            "1. **Check VolumeAttachment objects**: kubectl get volumeattachments -o wide"
                .to_string(),
            "2. **Identify conflicting attachments**: Look for volumes attached to multiple nodes"
                .to_string(),
            "3. **Force detach if safe**: Delete stuck VolumeAttachment objects for volumes not in use"
                .to_string(),
        ]);
    }

    if has_stuck_mount_refs {
        recommendations.extend([
            "4. **Check mount references on affected nodes**:".to_string(),
            "   - Run: mount | grep csi".to_string(),
            "   - Look for multiple mount points to same volume".to_string(),
            "   - Safely unmount unused references: umount <path>".to_string(),
        ]);
    }

    if has_csi_failures {
        recommendations.extend([
            "5. **Review CSI driver logs**:".to_string(),
            "   - Check kubelet logs: journalctl -u kubelet".to_string(),
            "   - Check CSI driver pods: kubectl logs -n kube-system <csi-pod>".to_string(),
        ]);
    }

    if !nodes.is_empty() {
        recommendations.push("\n## Affected Nodes".to_string());
        let node_list: Vec<&str> = nodes.iter().copied().collect();
        recommendations.push(format!("Priority nodes for cleanup: {node_list:?}"));
        if nodes.len() > 10 {
            recommendations.push(
                "**High Impact**: More than 10 nodes affected - consider automated cleanup"
                    .to_string(),
            );
        }
    }

    if !drivers.is_empty() {
        recommendations.push("\n## Driver-Specific Actions".to_string());
        for driver in &drivers {
            match *driver {
                "cinder.csi.openstack.org" => recommendations.extend([
                    format!("**{driver}**:"),
                    "- Consider upgrading cinder CSI driver to latest version".to_string(),
                    "- Check OpenStack Cinder service health".to_string(),
                    "- Review volume attachment limits in OpenStack".to_string(),
                ]),
                "rook-ceph.rbd.csi.ceph.com" | "rook-ceph.cephfs.csi.ceph.com" => {
                    recommendations.extend([
                        format!("**{driver}**:"),
                        "- Check Ceph cluster health: kubectl -n rook-ceph exec -it deploy/rook-ceph-tools -- ceph status"
                            .to_string(),
                        "- Review Rook operator logs".to_string(),
                        "- Verify network connectivity to Ceph cluster".to_string(),
                    ]);
                }
                _ => recommendations.extend([
                    format!("**{driver}**:"),
                    "- Check CSI driver pods are healthy".to_string(),
                    "- Review driver-specific documentation for troubleshooting".to_string(),
                ]),
            }
        }
    }

    recommendations.extend([
        "\n## Long-term Solutions".to_string(),
        "1. **Monitoring**: Set up Prometheus alerts for CSI operation failures".to_string(),
        "2. **Automation**: Deploy automated cleanup scripts for recurring issues".to_string(),
        "3. **Upgrades**: Keep CSI drivers updated to latest stable versions".to_string(),
        "4. **Documentation**: Document cleanup procedures for operations team".to_string(),
    ]);

    recommendations.extend([
        "\n## Safety Warnings".to_string(),
        "- **Always verify pods are not using volumes before force detaching**".to_string(),
        "- **Test cleanup procedures in non-production first**".to_string(),
        "- **Backup important data before making changes**".to_string(),
        "- **Coordinate with application teams before cleanup**".to_string(),
    ]);

    recommendations
}
