//! Detection over the cluster event stream.
//!
//! Classifies recent warning events into the shared finding taxonomy and
//! mines their free-form messages for volume, driver, node, and PVC facts.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Event;
use tracing::debug;

use crate::client::ClusterReader;
use crate::detect::mining;
use crate::detect::IssueDetector;
use crate::error::ScanResult;
use crate::types::{DetectionMethod, EventInfo, Finding, IssueType, Severity};

/// Messages and reasons that matter even without any driver token.
const IMPORTANT_MARKERS: [&str; 4] = [
    "Multi-Attach error",
    "GetDeviceMountRefs",
    "FailedAttachVolume",
    "FailedMount",
];

/// Event reasons that are CSI-adjacent without naming a driver.
const CSI_VOLUME_REASONS: [&str; 6] = [
    "VolumeBindingFailed",
    "ProvisioningFailed",
    "VolumeFailedMount",
    "VolumeFailedUnmount",
    "VolumeResizeFailed",
    "VolumeResizing",
];

/// Driver-shaped substrings that mark a message as CSI-related.
const CSI_DRIVER_SHAPES: [&str; 6] = [
    ".csi.",
    "csi.openstack.org",
    "csi.ceph.com",
    "csi.aws.com",
    "csi.azure.com",
    "csi.storage.gke.io",
];

/// Projected/system volume chatter that is never CSI-related.
const EXCLUDED_TOKENS: [&str; 5] = [
    "kube-api-access-",
    "default-token-",
    "configmap",
    "secret",
    "serviceaccount",
];

pub struct EventsDetector {
    reader: Arc<dyn ClusterReader>,
    target_driver: Option<String>,
    lookback: Duration,
}

impl EventsDetector {
    /// A zero lookback falls back to one hour.
    pub fn new(
        reader: Arc<dyn ClusterReader>,
        target_driver: Option<String>,
        lookback: Duration,
    ) -> Self {
        let lookback = if lookback.is_zero() {
            Duration::hours(1)
        } else {
            lookback
        };
        Self {
            reader,
            target_driver,
            lookback,
        }
    }

    /// Whether the event concerns the configured target driver.
    ///
    /// Messages naming a *different* known driver (or any `.csi.`-shaped
    /// identifier that is not the target) are rejected; important volume
    /// failures without any driver token are rescued.
    fn matches_target_driver(&self, event: &Event, target: &str) -> bool {
        let message = event.message.as_deref().unwrap_or_default();
        let reason = event.reason.as_deref().unwrap_or_default();

        if message.contains(target) {
            return true;
        }

        for known in mining::KNOWN_DRIVERS {
            if known != target && message.contains(known) {
                return false;
            }
        }

        // Any other driver-shaped token that is not the target.
        if message.contains(".csi.") {
            return false;
        }

        for marker in IMPORTANT_MARKERS {
            if message.contains(marker) || reason == marker {
                return true;
            }
        }

        reason.contains("CSI") || message.contains("CSI")
    }

    /// Whether a warning event with no specific reason is still CSI-related.
    fn is_csi_related(event: &Event) -> bool {
        let message = event.message.as_deref().unwrap_or_default();
        let reason = event.reason.as_deref().unwrap_or_default();

        for token in EXCLUDED_TOKENS {
            if message.contains(token) {
                return false;
            }
        }

        if message.contains("CSI") || reason.contains("CSI") {
            return true;
        }

        for shape in CSI_DRIVER_SHAPES {
            if message.contains(shape) {
                return true;
            }
        }

        if CSI_VOLUME_REASONS.contains(&reason) {
            return true;
        }

        (message.contains("StorageClass") || message.contains("storageclass"))
            && (message.contains("PersistentVolume") || message.contains("volume"))
    }

    fn severity_of(event: &Event) -> Severity {
        let message = event.message.as_deref().unwrap_or_default();

        if message.contains("Multi-Attach error") || message.contains("GetDeviceMountRefs") {
            return Severity::High;
        }

        match event.count.unwrap_or(0) {
            n if n >= 10 => Severity::Critical,
            n if n >= 7 => Severity::High,
            n if n >= 3 => Severity::Medium,
            _ => Severity::Low,
        }
    }

    /// Node name for display: involved Node wins, then the reporting
    /// kubelet's host for pod events, then message mining.
    fn node_for_display(event: &Event) -> String {
        let kind = event.involved_object.kind.as_deref().unwrap_or_default();
        let source_host = event
            .source
            .as_ref()
            .and_then(|s| s.host.as_deref())
            .unwrap_or_default();

        if kind == "Node" {
            return event.involved_object.name.clone().unwrap_or_default();
        }

        if kind == "Pod" {
            if !source_host.is_empty() {
                return source_host.to_string();
            }
            return mining::extract_node(event.message.as_deref().unwrap_or_default());
        }

        source_host.to_string()
    }

    /// PVC reference for display: involved PVC wins (namespace-qualified when
    /// it differs from the event namespace), pod events fall back to mining.
    fn pvc_for_display(event: &Event) -> String {
        let kind = event.involved_object.kind.as_deref().unwrap_or_default();

        if kind == "PersistentVolumeClaim" {
            let name = event.involved_object.name.clone().unwrap_or_default();
            let involved_ns = event.involved_object.namespace.as_deref().unwrap_or_default();
            let event_ns = event.metadata.namespace.as_deref().unwrap_or_default();
            if !involved_ns.is_empty() && involved_ns != event_ns {
                return format!("{involved_ns}/{name}");
            }
            return name;
        }

        if kind == "Pod" {
            return mining::extract_pvc(event.message.as_deref().unwrap_or_default());
        }

        String::new()
    }

    fn metadata_of(event: &Event, effective: DateTime<Utc>) -> BTreeMap<String, String> {
        let message = event.message.as_deref().unwrap_or_default();
        let involved = &event.involved_object;
        let kind = involved.kind.as_deref().unwrap_or_default();
        let name = involved.name.as_deref().unwrap_or_default();
        let involved_ns = involved.namespace.as_deref().unwrap_or_default();
        let event_ns = event.metadata.namespace.as_deref().unwrap_or_default();

        let mut metadata = BTreeMap::new();
        metadata.insert("full_event_message".to_string(), message.to_string());
        metadata.insert(
            "event_reason".to_string(),
            event.reason.clone().unwrap_or_default(),
        );
        metadata.insert(
            "event_type".to_string(),
            event.type_.clone().unwrap_or_default(),
        );
        metadata.insert("event_time".to_string(), effective.to_rfc3339());
        metadata.insert("count".to_string(), event.count.unwrap_or(0).to_string());
        metadata.insert("involved_object_kind".to_string(), kind.to_string());
        metadata.insert("involved_object_name".to_string(), name.to_string());
        metadata.insert(
            "involved_object_namespace".to_string(),
            involved_ns.to_string(),
        );
        metadata.insert(
            "involved_object_uid".to_string(),
            involved.uid.clone().unwrap_or_default(),
        );
        metadata.insert("involved_object".to_string(), format!("{kind}/{name}"));
        metadata.insert("event_namespace".to_string(), event_ns.to_string());
        metadata.insert(
            "source_component".to_string(),
            event
                .source
                .as_ref()
                .and_then(|s| s.component.clone())
                .unwrap_or_default(),
        );
        metadata.insert(
            "source_host".to_string(),
            event
                .source
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or_default(),
        );

        if let Some(version) = involved.resource_version.as_ref().filter(|v| !v.is_empty()) {
            metadata.insert("involved_object_resource_version".to_string(), version.clone());
        }
        if let Some(api_version) = involved.api_version.as_ref().filter(|v| !v.is_empty()) {
            metadata.insert("involved_object_api_version".to_string(), api_version.clone());
        }
        if let Some(field_path) = involved.field_path.as_ref().filter(|v| !v.is_empty()) {
            metadata.insert("involved_object_field_path".to_string(), field_path.clone());
        }

        metadata
    }

    /// Classify one recent event, or `None` when it is not a finding.
    fn classify(&self, event: &Event, effective: DateTime<Utc>) -> Option<Finding> {
        let message = event.message.as_deref().unwrap_or_default();
        let reason = event.reason.as_deref().unwrap_or_default();
        let event_type = event.type_.as_deref().unwrap_or_default();

        let issue_type;
        let description;
        if message.contains("Multi-Attach error") {
            issue_type = IssueType::MultiAttachError;
            description = format!("Multi-Attach error detected: {message}");
        } else if reason == "FailedAttachVolume" && event_type == "Warning" {
            issue_type = IssueType::FailedAttachVolume;
            description = format!("Failed to attach volume: {message}");
        } else if reason == "FailedMount" && event_type == "Warning" {
            if message.contains("GetDeviceMountRefs") {
                issue_type = IssueType::StuckMountReference;
                description = format!("Mount reference cleanup failure: {message}");
            } else {
                issue_type = IssueType::CsiOperationFailure;
                description = format!("Failed to mount volume: {message}");
            }
        } else if event_type == "Warning" && Self::is_csi_related(event) {
            issue_type = IssueType::CsiOperationFailure;
            description = format!("CSI operation issue: {message}");
        } else {
            return None;
        }

        let mut metadata = Self::metadata_of(event, effective);

        let volume = mining::extract_volume(message);
        if volume != mining::UNKNOWN {
            metadata.insert("extracted_volume_handle".to_string(), volume.clone());
        }
        let driver = mining::extract_driver(message, self.target_driver.as_deref());
        if driver != mining::UNKNOWN {
            metadata.insert("extracted_csi_driver".to_string(), driver.clone());
        }

        let mut finding = Finding::new(
            issue_type,
            Self::severity_of(event),
            DetectionMethod::Events,
            description,
        )
        .with_node(Self::node_for_display(event))
        .with_volume(volume)
        .with_pvc(Self::pvc_for_display(event))
        .with_namespace(event.metadata.namespace.clone().unwrap_or_default())
        .with_driver(driver);
        finding.metadata = metadata;
        Some(finding)
    }

    /// Recent events relevant to volume health, for detailed analysis.
    pub async fn recent_events(&self, max_results: usize) -> ScanResult<Vec<EventInfo>> {
        let events = self.reader.list_events().await?;
        let cutoff = Utc::now() - self.lookback;

        let mut relevant = Vec::new();
        for event in &events {
            let Some(effective) = effective_time(event) else {
                continue;
            };
            if effective < cutoff {
                continue;
            }

            let driver_relevant = match self.target_driver.as_deref() {
                Some(target) => self.matches_target_driver(event, target),
                None => false,
            };
            if driver_relevant || is_volume_related(event) {
                let kind = event.involved_object.kind.as_deref().unwrap_or_default();
                let name = event.involved_object.name.as_deref().unwrap_or_default();
                relevant.push(EventInfo {
                    event_type: event.type_.clone().unwrap_or_default(),
                    reason: event.reason.clone().unwrap_or_default(),
                    message: event.message.clone().unwrap_or_default(),
                    object: format!("{kind}/{name}"),
                    namespace: event.metadata.namespace.clone().unwrap_or_default(),
                    time: effective,
                });

                if relevant.len() >= max_results {
                    break;
                }
            }
        }

        Ok(relevant)
    }
}

#[async_trait]
impl IssueDetector for EventsDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Events
    }

    async fn detect(&self) -> ScanResult<Vec<Finding>> {
        let events = self.reader.list_events().await?;
        debug!(count = events.len(), lookback = %self.lookback, "classifying events");

        let cutoff = Utc::now() - self.lookback;
        let mut findings = Vec::new();

        for event in &events {
            let last = event.last_timestamp.as_ref().map(|t| t.0);
            let event_time = event.event_time.as_ref().map(|t| t.0);
            let Some(effective) = last.or(event_time) else {
                continue;
            };
            if last.is_none_or(|t| t < cutoff) && event_time.is_none_or(|t| t < cutoff) {
                continue;
            }

            if let Some(target) = self.target_driver.as_deref() {
                if !self.matches_target_driver(event, target) {
                    continue;
                }
            }

            if let Some(finding) = self.classify(event, effective) {
                findings.push(finding);
            }
        }

        Ok(findings)
    }
}

fn effective_time(event: &Event) -> Option<DateTime<Utc>> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
}

/// Broad volume-affinity check used only for the analysis event feed.
fn is_volume_related(event: &Event) -> bool {
    let message = event.message.as_deref().unwrap_or_default();
    let reason = event.reason.as_deref().unwrap_or_default();

    ["Volume", "Mount", "Attach", "PVC", "PV", "CSI"]
        .iter()
        .any(|keyword| {
            let lower = keyword.to_ascii_lowercase();
            reason.contains(keyword)
                || message.contains(keyword)
                || reason.contains(&lower)
                || message.contains(&lower)
        })
}
