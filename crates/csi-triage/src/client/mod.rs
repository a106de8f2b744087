//! Read-only cluster access for the detectors.
//!
//! `ClusterReader` is the seam between the diagnosis engine and the cluster:
//! detectors only ever read through it, which keeps them unit-testable
//! against an in-memory fake and guarantees the engine never mutates state.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::{StorageClass, VolumeAttachment};
use kube::api::ListParams;
use kube::{Api, Client};

use crate::error::{ScanError, ScanResult};

#[cfg(test)]
pub mod fake;

/// Narrow read capability over the cluster objects the detectors consume.
///
/// Implementations must be safe for concurrent use; the coordinator shares
/// one reader across all detector tasks.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// List every `VolumeAttachment` in the cluster.
    async fn list_volume_attachments(&self) -> ScanResult<Vec<VolumeAttachment>>;

    /// List pods across all namespaces.
    async fn list_pods(&self) -> ScanResult<Vec<Pod>>;

    /// Fetch one PVC by namespace and name.
    async fn get_pvc(&self, namespace: &str, name: &str) -> ScanResult<PersistentVolumeClaim>;

    /// Fetch one PV by name.
    async fn get_pv(&self, name: &str) -> ScanResult<PersistentVolume>;

    /// Fetch one `StorageClass` by name.
    async fn get_storage_class(&self, name: &str) -> ScanResult<StorageClass>;

    /// List events across all namespaces.
    async fn list_events(&self) -> ScanResult<Vec<Event>>;
}

/// Production reader backed by a `kube::Client`.
#[derive(Clone)]
pub struct KubeClusterReader {
    client: Client,
}

impl KubeClusterReader {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_error(operation: &str, err: &kube::Error) -> ScanError {
        ScanError::Api {
            operation: operation.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn list_volume_attachments(&self) -> ScanResult<Vec<VolumeAttachment>> {
        let api: Api<VolumeAttachment> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|err| Self::api_error("list volumeattachments", &err))?;
        Ok(list.items)
    }

    async fn list_pods(&self) -> ScanResult<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|err| Self::api_error("list pods", &err))?;
        Ok(list.items)
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> ScanResult<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|err| Self::api_error(&format!("get pvc {namespace}/{name}"), &err))
    }

    async fn get_pv(&self, name: &str) -> ScanResult<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|err| Self::api_error(&format!("get pv {name}"), &err))
    }

    async fn get_storage_class(&self, name: &str) -> ScanResult<StorageClass> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|err| Self::api_error(&format!("get storageclass {name}"), &err))
    }

    async fn list_events(&self) -> ScanResult<Vec<Event>> {
        let api: Api<Event> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|err| Self::api_error("list events", &err))?;
        Ok(list.items)
    }
}
