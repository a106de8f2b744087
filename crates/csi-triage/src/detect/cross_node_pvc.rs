//! Detection over PVC references held by scheduled pods.
//!
//! Reasoning model: intersect pod volume claims with node assignments. A PVC
//! referenced from more than one node is a likely `ReadWriteOnce` violation;
//! a pile of references on one node is a likely mount leak.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::client::ClusterReader;
use crate::detect::IssueDetector;
use crate::error::ScanResult;
use crate::types::{DetectionMethod, Finding, IssueType, NodePvcUsage, Severity};

/// References on a single node beyond this count suggest a mount leak.
const HIGH_USAGE_THRESHOLD: usize = 10;

pub struct CrossNodePvcDetector {
    reader: Arc<dyn ClusterReader>,
    target_driver: Option<String>,
}

impl CrossNodePvcDetector {
    pub fn new(reader: Arc<dyn ClusterReader>, target_driver: Option<String>) -> Self {
        Self {
            reader,
            target_driver,
        }
    }

    /// Resolve the CSI driver behind a PVC: bound PV first, storage-class
    /// provisioner second. Best-effort; an empty result means unknown.
    async fn resolve_driver(&self, namespace: &str, name: &str) -> String {
        let pvc = match self.reader.get_pvc(namespace, name).await {
            Ok(pvc) => pvc,
            Err(err) => {
                debug!(%namespace, %name, error = %err, "pvc lookup failed, driver unknown");
                return String::new();
            }
        };

        let spec = pvc.spec.unwrap_or_default();

        if let Some(volume_name) = spec.volume_name.filter(|v| !v.is_empty()) {
            match self.reader.get_pv(&volume_name).await {
                Ok(pv) => {
                    if let Some(csi) = pv.spec.and_then(|s| s.csi) {
                        return csi.driver;
                    }
                }
                Err(err) => {
                    debug!(%volume_name, error = %err, "pv lookup failed, driver unknown");
                    return String::new();
                }
            }
        }

        if let Some(class) = spec.storage_class_name.filter(|c| !c.is_empty()) {
            match self.reader.get_storage_class(&class).await {
                Ok(sc) => return sc.provisioner,
                Err(err) => {
                    debug!(%class, error = %err, "storageclass lookup failed, driver unknown");
                }
            }
        }

        String::new()
    }

    /// Collect `pvcKey -> node -> reference count` over scheduled pods.
    async fn collect_usage(&self) -> ScanResult<BTreeMap<String, BTreeMap<String, usize>>> {
        let pods = self.reader.list_pods().await?;
        debug!(count = pods.len(), "scanning pod volume claims");

        let mut usage: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        for pod in &pods {
            let Some(spec) = pod.spec.as_ref() else {
                continue;
            };
            let Some(node) = spec.node_name.as_deref().filter(|n| !n.is_empty()) else {
                continue; // unscheduled
            };
            let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();

            for volume in spec.volumes.iter().flatten() {
                if let Some(claim) = volume.persistent_volume_claim.as_ref() {
                    let key = format!("{namespace}/{}", claim.claim_name);
                    *usage.entry(key).or_default().entry(node.to_string()).or_default() += 1;
                }
            }
        }

        Ok(usage)
    }

    fn cross_node_severity(node_count: usize, total: usize) -> Severity {
        if node_count >= 5 || total >= 20 {
            Severity::Critical
        } else if node_count >= 3 || total >= 15 {
            Severity::High
        } else if node_count == 2 || total >= 10 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    fn high_usage_severity(total: usize) -> Severity {
        if total >= 20 {
            Severity::Critical
        } else if total >= 15 {
            Severity::High
        } else if total >= 10 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Per-node PVC usage statistics for detailed analysis.
    pub async fn node_pvc_usage(&self) -> ScanResult<Vec<NodePvcUsage>> {
        let pods = self.reader.list_pods().await?;

        let mut per_node: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        for pod in &pods {
            let Some(spec) = pod.spec.as_ref() else {
                continue;
            };
            let Some(node) = spec.node_name.as_deref().filter(|n| !n.is_empty()) else {
                continue;
            };
            let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();

            for volume in spec.volumes.iter().flatten() {
                if let Some(claim) = volume.persistent_volume_claim.as_ref() {
                    let key = format!("{namespace}/{}", claim.claim_name);
                    *per_node.entry(node.to_string()).or_default().entry(key).or_default() += 1;
                }
            }
        }

        Ok(per_node
            .into_iter()
            .map(|(node, pvc_counts)| {
                let total = pvc_counts.values().sum();
                NodePvcUsage {
                    node,
                    pvc_counts,
                    total,
                }
            })
            .collect())
    }
}

#[async_trait]
impl IssueDetector for CrossNodePvcDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::CrossNodePvc
    }

    async fn detect(&self) -> ScanResult<Vec<Finding>> {
        let usage = self.collect_usage().await?;

        let mut findings = Vec::new();
        for (pvc_key, node_usage) in &usage {
            let (namespace, name) = pvc_key.split_once('/').unwrap_or(("", pvc_key.as_str()));
            let driver = self.resolve_driver(namespace, name).await;

            if let Some(target) = self.target_driver.as_deref() {
                if !driver.contains(target) {
                    continue;
                }
            }

            let node_count = node_usage.len();
            let total: usize = node_usage.values().sum();

            if node_count > 1 {
                let node_list: Vec<String> = node_usage
                    .iter()
                    .map(|(node, count)| format!("{node}({count})"))
                    .collect();

                findings.push(
                    Finding::new(
                        IssueType::MultipleAttachments,
                        Self::cross_node_severity(node_count, total),
                        DetectionMethod::CrossNodePvc,
                        format!(
                            "PVC used on {node_count} nodes: [{}] (total {total} pod references)",
                            node_list.join(", ")
                        ),
                    )
                    .with_pvc(pvc_key)
                    .with_namespace(namespace)
                    .with_driver(&driver)
                    .with_metadata("node_count", node_count.to_string())
                    .with_metadata("total_usage", total.to_string())
                    .with_metadata("nodes", node_list.join(",")),
                );
            } else if total > HIGH_USAGE_THRESHOLD {
                // Exactly one node when node_count == 1.
                let node = node_usage.keys().next().cloned().unwrap_or_default();

                findings.push(
                    Finding::new(
                        IssueType::StuckMountReference,
                        Self::high_usage_severity(total),
                        DetectionMethod::CrossNodePvc,
                        format!("High PVC usage on single node: {total} references to {pvc_key}"),
                    )
                    .with_node(&node)
                    .with_pvc(pvc_key)
                    .with_namespace(namespace)
                    .with_driver(&driver)
                    .with_metadata("usage_count", total.to_string())
                    .with_metadata("node", node.clone()),
                );
            }
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{self, FakeClusterReader, FakeFailure};

    fn detector(reader: FakeClusterReader, target: Option<&str>) -> CrossNodePvcDetector {
        CrossNodePvcDetector::new(Arc::new(reader), target.map(String::from))
    }

    #[tokio::test]
    async fn empty_cluster_yields_no_findings() {
        let findings = detector(FakeClusterReader::default(), None)
            .detect()
            .await
            .unwrap();
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn pvc_on_two_nodes_is_flagged() {
        let mut reader = FakeClusterReader::default();
        reader.pods = vec![
            fake::pod("default", "web-0", Some("node-1"), &["cross-node-pvc"]),
            fake::pod("default", "web-1", Some("node-2"), &["cross-node-pvc"]),
        ];
        reader.add_pvc(fake::pvc("default", "cross-node-pvc", Some("pv-x"), None));
        reader.add_pv(fake::csi_pv("pv-x", "test.csi.driver", "handle-x"));

        let findings = detector(reader, Some("test.csi.driver"))
            .detect()
            .await
            .unwrap();

        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.issue_type, IssueType::MultipleAttachments);
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.pvc, "default/cross-node-pvc");
        assert_eq!(finding.namespace, "default");
        assert_eq!(finding.driver, "test.csi.driver");
        assert!(finding.description.contains("node-1(1)"));
        assert!(finding.description.contains("node-2(1)"));
    }

    #[tokio::test]
    async fn unscheduled_pods_are_ignored() {
        let mut reader = FakeClusterReader::default();
        reader.pods = vec![
            fake::pod("default", "web-0", Some("node-1"), &["data"]),
            fake::pod("default", "web-1", None, &["data"]),
        ];

        let findings = detector(reader, None).detect().await.unwrap();
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn heavy_single_node_usage_is_a_mount_leak() {
        let mut reader = FakeClusterReader::default();
        reader.pods = (0..15)
            .map(|i| {
                fake::pod(
                    "default",
                    &format!("worker-{i}"),
                    Some("node-1"),
                    &["high-usage-pvc"],
                )
            })
            .collect();

        let findings = detector(reader, None).detect().await.unwrap();
        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.issue_type, IssueType::StuckMountReference);
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.node, "node-1");
        assert!(finding.description.contains("15 references"));
    }

    #[tokio::test]
    async fn twenty_references_on_one_node_is_critical() {
        let mut reader = FakeClusterReader::default();
        reader.pods = (0..20)
            .map(|i| fake::pod("default", &format!("w-{i}"), Some("node-1"), &["leak"]))
            .collect();

        let findings = detector(reader, None).detect().await.unwrap();
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn five_nodes_is_critical() {
        let mut reader = FakeClusterReader::default();
        reader.pods = (0..5)
            .map(|i| {
                fake::pod(
                    "default",
                    &format!("w-{i}"),
                    Some(&format!("node-{i}")),
                    &["spread"],
                )
            })
            .collect();

        let findings = detector(reader, None).detect().await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn pvc_lookup_failure_still_yields_finding_without_driver() {
        let mut reader = FakeClusterReader::default();
        reader.pods = vec![
            fake::pod("default", "web-0", Some("node-1"), &["orphan"]),
            fake::pod("default", "web-1", Some("node-2"), &["orphan"]),
        ];
        // No PVC registered; enrichment lookup fails.

        let findings = detector(reader, None).detect().await.unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].driver.is_empty());
    }

    #[tokio::test]
    async fn undetermined_driver_is_skipped_when_target_set() {
        let mut reader = FakeClusterReader::default();
        reader.pods = vec![
            fake::pod("default", "web-0", Some("node-1"), &["orphan"]),
            fake::pod("default", "web-1", Some("node-2"), &["orphan"]),
        ];

        let findings = detector(reader, Some("test.csi.driver"))
            .detect()
            .await
            .unwrap();
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn driver_resolves_through_storage_class() {
        let mut reader = FakeClusterReader::default();
        reader.pods = vec![
            fake::pod("apps", "db-0", Some("node-1"), &["db-data"]),
            fake::pod("apps", "db-1", Some("node-2"), &["db-data"]),
        ];
        reader.add_pvc(fake::pvc("apps", "db-data", None, Some("fast-ssd")));
        reader.add_storage_class(fake::storage_class("fast-ssd", "test.csi.driver"));

        let findings = detector(reader, Some("test.csi.driver"))
            .detect()
            .await
            .unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].driver, "test.csi.driver");
    }

    #[tokio::test]
    async fn target_driver_matches_as_substring() {
        let mut reader = FakeClusterReader::default();
        reader.pods = vec![
            fake::pod("apps", "db-0", Some("node-1"), &["db-data"]),
            fake::pod("apps", "db-1", Some("node-2"), &["db-data"]),
        ];
        reader.add_pvc(fake::pvc("apps", "db-data", Some("pv-db"), None));
        reader.add_pv(fake::csi_pv("pv-db", "rook-ceph.rbd.csi.ceph.com", "h1"));

        let matched = detector(reader, Some("csi.ceph.com")).detect().await.unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[tokio::test]
    async fn pod_list_failure_propagates() {
        let reader = FakeClusterReader {
            fail_on: Some(FakeFailure::ListPods),
            ..FakeClusterReader::default()
        };
        assert!(detector(reader, None).detect().await.is_err());
    }

    #[tokio::test]
    async fn node_usage_totals_match_counts() {
        let mut reader = FakeClusterReader::default();
        reader.pods = vec![
            fake::pod("default", "a", Some("node-1"), &["p1", "p2"]),
            fake::pod("default", "b", Some("node-1"), &["p1"]),
            fake::pod("default", "c", Some("node-2"), &["p3"]),
        ];

        let usage = detector(reader, None).node_pvc_usage().await.unwrap();
        assert_eq!(usage.len(), 2);
        let node1 = usage.iter().find(|u| u.node == "node-1").unwrap();
        assert_eq!(node1.total, 3);
        assert_eq!(node1.pvc_counts["default/p1"], 2);
    }
}
