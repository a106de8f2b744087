//! In-memory `ClusterReader` used by the detector tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{
    Event, EventSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, Pod,
    PodSpec, Volume,
};
use k8s_openapi::api::storage::v1::{
    StorageClass, VolumeAttachment, VolumeAttachmentSource, VolumeAttachmentSpec,
    VolumeAttachmentStatus, VolumeError,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};

use crate::client::ClusterReader;
use crate::error::{ScanError, ScanResult};

/// Which fake operation should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    ListVolumeAttachments,
    ListPods,
    GetPvc,
    GetPv,
    GetStorageClass,
    ListEvents,
}

/// Canned cluster state served to the detectors.
#[derive(Default)]
pub struct FakeClusterReader {
    pub attachments: Vec<VolumeAttachment>,
    pub pods: Vec<Pod>,
    pub pvcs: HashMap<(String, String), PersistentVolumeClaim>,
    pub pvs: HashMap<String, PersistentVolume>,
    pub storage_classes: HashMap<String, StorageClass>,
    pub events: Vec<Event>,
    /// Force one operation to fail with an API error.
    pub fail_on: Option<FakeFailure>,
    /// Every operation reports cancellation.
    pub cancelled: bool,
}

impl FakeClusterReader {
    pub fn with_attachments(attachments: Vec<VolumeAttachment>) -> Self {
        Self {
            attachments,
            ..Self::default()
        }
    }

    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub fn add_pvc(&mut self, pvc: PersistentVolumeClaim) {
        let namespace = pvc.metadata.namespace.clone().unwrap_or_default();
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.pvcs.insert((namespace, name), pvc);
    }

    pub fn add_pv(&mut self, pv: PersistentVolume) {
        let name = pv.metadata.name.clone().unwrap_or_default();
        self.pvs.insert(name, pv);
    }

    pub fn add_storage_class(&mut self, sc: StorageClass) {
        let name = sc.metadata.name.clone().unwrap_or_default();
        self.storage_classes.insert(name, sc);
    }

    fn check(&self, op: FakeFailure, name: &str) -> ScanResult<()> {
        if self.cancelled {
            return Err(ScanError::Cancelled);
        }
        if self.fail_on == Some(op) {
            return Err(ScanError::Api {
                operation: name.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterReader for FakeClusterReader {
    async fn list_volume_attachments(&self) -> ScanResult<Vec<VolumeAttachment>> {
        self.check(FakeFailure::ListVolumeAttachments, "list volumeattachments")?;
        Ok(self.attachments.clone())
    }

    async fn list_pods(&self) -> ScanResult<Vec<Pod>> {
        self.check(FakeFailure::ListPods, "list pods")?;
        Ok(self.pods.clone())
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> ScanResult<PersistentVolumeClaim> {
        self.check(FakeFailure::GetPvc, "get pvc")?;
        self.pvcs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ScanError::Api {
                operation: format!("get pvc {namespace}/{name}"),
                reason: "not found".to_string(),
            })
    }

    async fn get_pv(&self, name: &str) -> ScanResult<PersistentVolume> {
        self.check(FakeFailure::GetPv, "get pv")?;
        self.pvs.get(name).cloned().ok_or_else(|| ScanError::Api {
            operation: format!("get pv {name}"),
            reason: "not found".to_string(),
        })
    }

    async fn get_storage_class(&self, name: &str) -> ScanResult<StorageClass> {
        self.check(FakeFailure::GetStorageClass, "get storageclass")?;
        self.storage_classes
            .get(name)
            .cloned()
            .ok_or_else(|| ScanError::Api {
                operation: format!("get storageclass {name}"),
                reason: "not found".to_string(),
            })
    }

    async fn list_events(&self) -> ScanResult<Vec<Event>> {
        self.check(FakeFailure::ListEvents, "list events")?;
        Ok(self.events.clone())
    }
}

/// A `VolumeAttachment` bound to a PV, created `age` ago.
pub fn attachment(
    name: &str,
    attacher: &str,
    node: &str,
    pv_name: &str,
    attached: bool,
    age: Duration,
) -> VolumeAttachment {
    VolumeAttachment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            creation_timestamp: Some(Time(Utc::now() - age)),
            ..ObjectMeta::default()
        },
        spec: VolumeAttachmentSpec {
            attacher: attacher.to_string(),
            node_name: node.to_string(),
            source: VolumeAttachmentSource {
                persistent_volume_name: Some(pv_name.to_string()),
                inline_volume_spec: None,
            },
        },
        status: Some(VolumeAttachmentStatus {
            attached,
            ..VolumeAttachmentStatus::default()
        }),
    }
}

/// Set the attach error message on an attachment.
pub fn with_attach_error(mut va: VolumeAttachment, message: &str) -> VolumeAttachment {
    let status = va.status.get_or_insert_with(VolumeAttachmentStatus::default);
    status.attach_error = Some(VolumeError {
        message: Some(message.to_string()),
        ..VolumeError::default()
    });
    va
}

/// Set the detach error message on an attachment.
pub fn with_detach_error(mut va: VolumeAttachment, message: &str) -> VolumeAttachment {
    let status = va.status.get_or_insert_with(VolumeAttachmentStatus::default);
    status.detach_error = Some(VolumeError {
        message: Some(message.to_string()),
        ..VolumeError::default()
    });
    va
}

/// A scheduled pod referencing the given PVC claim names.
pub fn pod(namespace: &str, name: &str, node: Option<&str>, claims: &[&str]) -> Pod {
    let volumes: Vec<Volume> = claims
        .iter()
        .enumerate()
        .map(|(i, claim)| Volume {
            name: format!("data-{i}"),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: (*claim).to_string(),
                read_only: None,
            }),
            ..Volume::default()
        })
        .collect();

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(String::from),
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..PodSpec::default()
        }),
        status: None,
    }
}

/// A PVC, optionally bound to a PV and/or referencing a storage class.
pub fn pvc(
    namespace: &str,
    name: &str,
    volume_name: Option<&str>,
    storage_class: Option<&str>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: volume_name.map(String::from),
            storage_class_name: storage_class.map(String::from),
            ..PersistentVolumeClaimSpec::default()
        }),
        status: None,
    }
}

/// A CSI-backed PV.
pub fn csi_pv(name: &str, driver: &str, handle: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeSpec {
            csi: Some(k8s_openapi::api::core::v1::CSIPersistentVolumeSource {
                driver: driver.to_string(),
                volume_handle: handle.to_string(),
                ..k8s_openapi::api::core::v1::CSIPersistentVolumeSource::default()
            }),
            ..PersistentVolumeSpec::default()
        }),
        status: None,
    }
}

/// A storage class with the given provisioner.
pub fn storage_class(name: &str, provisioner: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        provisioner: provisioner.to_string(),
        ..StorageClass::default()
    }
}

/// Builder for test events.
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub fn new(event_type: &str, reason: &str, message: &str) -> Self {
        Self {
            event: Event {
                metadata: ObjectMeta {
                    name: Some("test-event".to_string()),
                    namespace: Some("default".to_string()),
                    ..ObjectMeta::default()
                },
                involved_object: ObjectReference::default(),
                type_: Some(event_type.to_string()),
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
                last_timestamp: Some(Time(Utc::now())),
                count: Some(1),
                ..Event::default()
            },
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.event.metadata.namespace = Some(namespace.to_string());
        self
    }

    pub fn count(mut self, count: i32) -> Self {
        self.event.count = Some(count);
        self
    }

    pub fn last_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.event.last_timestamp = Some(Time(at));
        self
    }

    pub fn no_last_timestamp(mut self) -> Self {
        self.event.last_timestamp = None;
        self
    }

    pub fn event_time(mut self, at: DateTime<Utc>) -> Self {
        self.event.event_time = Some(MicroTime(at));
        self
    }

    pub fn involved(mut self, kind: &str, name: &str, namespace: &str) -> Self {
        self.event.involved_object = ObjectReference {
            kind: Some(kind.to_string()),
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectReference::default()
        };
        self
    }

    pub fn source_host(mut self, host: &str) -> Self {
        let source = self.event.source.get_or_insert_with(EventSource::default);
        source.host = Some(host.to_string());
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}
