//! Detection over the `VolumeAttachment` graph.
//!
//! Reasoning model: group attachment records by volume handle, then look for
//! records carrying attach/detach errors, records stuck in an unattached
//! state, and handles attached on more than one node at once.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use tracing::debug;

use crate::client::ClusterReader;
use crate::detect::IssueDetector;
use crate::error::ScanResult;
use crate::types::{
    DetectionMethod, Finding, IssueType, Severity, VolumeAttachmentView,
};

/// An attachment is considered stuck after this long without attaching.
const STUCK_THRESHOLD_MINUTES: i64 = 30;

pub struct VolumeAttachmentDetector {
    reader: Arc<dyn ClusterReader>,
    target_driver: Option<String>,
}

impl VolumeAttachmentDetector {
    pub fn new(reader: Arc<dyn ClusterReader>, target_driver: Option<String>) -> Self {
        Self {
            reader,
            target_driver,
        }
    }

    /// Flatten one attachment record into a [`VolumeAttachmentView`].
    fn view_of(&self, va: &VolumeAttachment) -> VolumeAttachmentView {
        let source = &va.spec.source;
        let inline_csi = source
            .inline_volume_spec
            .as_ref()
            .and_then(|spec| spec.csi.as_ref());

        let volume_handle = source
            .persistent_volume_name
            .clone()
            .or_else(|| inline_csi.map(|csi| csi.volume_handle.clone()))
            .unwrap_or_else(|| "unknown".to_string());

        let driver = inline_csi
            .map(|csi| csi.driver.clone())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| {
                if va.spec.attacher.is_empty() {
                    self.target_driver.clone().unwrap_or_default()
                } else {
                    va.spec.attacher.clone()
                }
            });

        let status = va.status.as_ref();

        VolumeAttachmentView {
            name: va.metadata.name.clone().unwrap_or_default(),
            node: va.spec.node_name.clone(),
            volume_handle,
            driver,
            attached: status.is_some_and(|s| s.attached),
            attach_error: status
                .and_then(|s| s.attach_error.as_ref())
                .and_then(|e| e.message.clone())
                .unwrap_or_default(),
            detach_error: status
                .and_then(|s| s.detach_error.as_ref())
                .and_then(|e| e.message.clone())
                .unwrap_or_default(),
            created_at: va
                .metadata
                .creation_timestamp
                .as_ref()
                .map_or_else(Utc::now, |t| t.0),
            deleted_at: va.metadata.deletion_timestamp.as_ref().map(|t| t.0),
        }
    }

    /// Severity of an attach/detach error scales with how many records for
    /// the same handle are currently attached.
    fn error_severity(attached_count: usize) -> Severity {
        match attached_count {
            n if n >= 5 => Severity::Critical,
            n if n >= 3 => Severity::High,
            2 => Severity::Medium,
            _ => Severity::Low,
        }
    }

    fn multi_attach_severity(attached_count: usize) -> Severity {
        match attached_count {
            n if n >= 5 => Severity::Critical,
            n if n >= 3 => Severity::High,
            _ => Severity::Medium,
        }
    }

    fn stuck_severity(stuck_for: Duration) -> Severity {
        if stuck_for > Duration::hours(4) {
            Severity::Critical
        } else if stuck_for > Duration::hours(2) {
            Severity::High
        } else if stuck_for > Duration::hours(1) {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    fn error_description(view: &VolumeAttachmentView) -> String {
        let mut errors = Vec::new();
        if !view.attach_error.is_empty() {
            errors.push(format!("Attach Error: {}", view.attach_error));
        }
        if !view.detach_error.is_empty() {
            errors.push(format!("Detach Error: {}", view.detach_error));
        }
        if errors.is_empty() {
            return "VolumeAttachment in inconsistent state".to_string();
        }
        format!(
            "VolumeAttachment {} on node {} has errors: {}",
            view.name,
            view.node,
            errors.join("; ")
        )
    }
}

#[async_trait]
impl IssueDetector for VolumeAttachmentDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::VolumeAttachments
    }

    async fn detect(&self) -> ScanResult<Vec<Finding>> {
        let attachments = self.reader.list_volume_attachments().await?;
        debug!(count = attachments.len(), "inspecting volume attachments");

        // Build the complete per-handle index before emitting anything so
        // severities count whole groups.
        let mut views = Vec::with_capacity(attachments.len());
        for va in &attachments {
            if let Some(target) = self.target_driver.as_deref() {
                if va.spec.attacher != target {
                    continue;
                }
            }
            views.push(self.view_of(va));
        }

        let mut by_handle: BTreeMap<String, Vec<&VolumeAttachmentView>> = BTreeMap::new();
        for view in &views {
            by_handle.entry(view.volume_handle.clone()).or_default().push(view);
        }

        let attached_count = |handle: &str| -> usize {
            by_handle
                .get(handle)
                .map_or(0, |group| group.iter().filter(|v| v.attached).count())
        };

        let now = Utc::now();
        let mut findings = Vec::new();

        for view in &views {
            let has_attach_error = !view.attach_error.is_empty();
            let has_detach_error = !view.detach_error.is_empty();

            if has_attach_error || has_detach_error {
                let issue_type = if has_detach_error {
                    IssueType::StuckVolumeDetachment
                } else {
                    IssueType::FailedAttachVolume
                };

                findings.push(
                    Finding::new(
                        issue_type,
                        Self::error_severity(attached_count(&view.volume_handle)),
                        DetectionMethod::VolumeAttachments,
                        Self::error_description(view),
                    )
                    .with_node(&view.node)
                    .with_volume(&view.volume_handle)
                    .with_driver(&view.driver)
                    .with_metadata("volumeattachment_name", &view.name)
                    .with_metadata("attach_error", &view.attach_error)
                    .with_metadata("detach_error", &view.detach_error),
                );
            }

            if !view.attached && !has_attach_error {
                let stuck_for = now - view.created_at;
                if stuck_for > Duration::minutes(STUCK_THRESHOLD_MINUTES) {
                    let minutes = stuck_for.num_minutes();
                    findings.push(
                        Finding::new(
                            IssueType::StuckVolumeAttachment,
                            Self::stuck_severity(stuck_for),
                            DetectionMethod::VolumeAttachments,
                            format!("Volume stuck in attaching state for {minutes}m"),
                        )
                        .with_node(&view.node)
                        .with_volume(&view.volume_handle)
                        .with_driver(&view.driver)
                        .with_metadata("volume_attachment_name", &view.name)
                        .with_metadata("stuck_duration", format!("{minutes}m"))
                        .with_metadata("created_at", view.created_at.to_rfc3339())
                        .with_metadata(
                            "age_hours",
                            format!("{:.1}", stuck_for.num_minutes() as f64 / 60.0),
                        ),
                    );
                }
            }
        }

        // Same handle attached on several nodes at once.
        for (handle, group) in &by_handle {
            let attached: Vec<&&VolumeAttachmentView> =
                group.iter().filter(|v| v.attached).collect();
            if group.len() < 2 || attached.len() < 2 {
                continue;
            }

            let nodes: Vec<String> = attached.iter().map(|v| v.node.clone()).collect();
            findings.push(
                Finding::new(
                    IssueType::MultipleAttachments,
                    Self::multi_attach_severity(attached.len()),
                    DetectionMethod::VolumeAttachments,
                    format!("Volume attached to multiple nodes: [{}]", nodes.join(", ")),
                )
                .with_volume(handle)
                .with_driver(&group[0].driver)
                .with_metadata("attached_count", attached.len().to_string())
                .with_metadata("attached_nodes", nodes.join(","))
                .with_metadata("total_attachments", group.len().to_string()),
            );
        }

        Ok(findings)
    }
}
