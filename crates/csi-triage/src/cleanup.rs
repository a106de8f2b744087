//! Privileged per-node cleanup jobs.
//!
//! This is the only component that mutates cluster state. The diagnosis
//! engine never calls it; the CLI wires detected nodes into it when the
//! operator explicitly asks for remediation jobs.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, PodSpec, PodTemplateSpec, SecurityContext,
    ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::{debug, info};

use crate::error::{ScanError, ScanResult};

/// Shell script run on each target node. Scans the kubelet directory for CSI
/// mount points whose pod directory is gone and unmounts them.
const CLEANUP_SCRIPT: &str = r#"set -eu
KUBELET_DIR=/host/var/lib/kubelet
echo "scanning ${KUBELET_DIR} for orphaned CSI mounts on $(hostname)"
found=0
for mount in $(grep "${KUBELET_DIR}.*csi" /proc/mounts | awk '{print $2}'); do
  pod_dir=$(echo "${mount}" | sed -n 's|\(.*/pods/[^/]*\)/.*|\1|p')
  if [ -n "${pod_dir}" ] && [ ! -d "${pod_dir}/containers" ]; then
    found=$((found + 1))
    if [ "${DRY_RUN}" = "true" ]; then
      echo "would unmount ${mount}"
    else
      echo "unmounting ${mount}"
      umount "${mount}" || echo "failed to unmount ${mount}"
    fi
  fi
done
echo "finished: ${found} orphaned mount(s)"
"#;

/// Configuration for one per-node cleanup job.
#[derive(Debug, Clone)]
pub struct CleanupJobConfig {
    pub node_name: String,
    pub dry_run: bool,
    pub image: String,
    pub namespace: String,
    pub service_account: String,
}

impl Default for CleanupJobConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            dry_run: true,
            image: "busybox:1.36".to_string(),
            namespace: "kube-system".to_string(),
            service_account: "csi-triage-cleanup".to_string(),
        }
    }
}

/// Creates and tracks cleanup jobs.
pub struct CleanupJobManager {
    client: Client,
    namespace: String,
}

impl CleanupJobManager {
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Create a cleanup job for one node; returns the job name.
    pub async fn create_cleanup_job(&self, config: &CleanupJobConfig) -> ScanResult<String> {
        self.ensure_service_account(&config.service_account).await?;

        let job = build_cleanup_job(config);
        let name = job
            .metadata
            .name
            .clone()
            .ok_or_else(|| ScanError::CleanupJob {
                reason: "job has no name".to_string(),
            })?;

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        jobs.create(&PostParams::default(), &job)
            .await
            .map_err(|err| ScanError::CleanupJob {
                reason: format!("failed to create job {name}: {err}"),
            })?;

        info!(%name, node = %config.node_name, dry_run = config.dry_run, "created cleanup job");
        Ok(name)
    }

    /// Poll until every named job has completed. Fails on the first job that
    /// reports a failed pod; the caller bounds the wait with its own
    /// deadline.
    pub async fn wait_for_jobs(&self, job_names: &[String]) -> ScanResult<()> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            ticker.tick().await;

            let mut all_complete = true;
            for name in job_names {
                let job = jobs.get(name).await.map_err(|err| ScanError::CleanupJob {
                    reason: format!("failed to check job {name}: {err}"),
                })?;

                let status = job.status.unwrap_or_default();
                if status.failed.unwrap_or(0) > 0 {
                    return Err(ScanError::CleanupJob {
                        reason: format!("job {name} failed"),
                    });
                }
                if status.succeeded.unwrap_or(0) == 0 {
                    all_complete = false;
                }
            }

            if all_complete {
                info!(jobs = job_names.len(), "all cleanup jobs completed");
                return Ok(());
            }
            debug!("cleanup jobs still running");
        }
    }

    async fn ensure_service_account(&self, name: &str) -> ScanResult<()> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);

        match accounts.get(name).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                let account = ServiceAccount {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..ObjectMeta::default()
                    },
                    ..ServiceAccount::default()
                };
                accounts
                    .create(&PostParams::default(), &account)
                    .await
                    .map_err(|err| ScanError::CleanupJob {
                        reason: format!("failed to create service account {name}: {err}"),
                    })?;
                Ok(())
            }
            Err(err) => Err(ScanError::CleanupJob {
                reason: format!("failed to check service account {name}: {err}"),
            }),
        }
    }
}

/// Build the typed job object for one node.
#[must_use]
pub fn build_cleanup_job(config: &CleanupJobConfig) -> Job {
    let job_name = format!("csi-triage-cleanup-{}", config.node_name);

    let labels = BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "csi-triage".to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            "cleanup".to_string(),
        ),
        ("csi-triage/node".to_string(), config.node_name.clone()),
    ]);

    let container = Container {
        name: "cleanup".to_string(),
        image: Some(config.image.clone()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![CLEANUP_SCRIPT.to_string()]),
        env: Some(vec![EnvVar {
            name: "DRY_RUN".to_string(),
            value: Some(config.dry_run.to_string()),
            value_from: None,
        }]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..SecurityContext::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: "kubelet-dir".to_string(),
            mount_path: "/host/var/lib/kubelet".to_string(),
            ..VolumeMount::default()
        }]),
        ..Container::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job_name),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(3600),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    node_name: Some(config.node_name.clone()),
                    host_pid: Some(true),
                    service_account_name: Some(config.service_account.clone()),
                    volumes: Some(vec![Volume {
                        name: "kubelet-dir".to_string(),
                        host_path: Some(HostPathVolumeSource {
                            path: "/var/lib/kubelet".to_string(),
                            type_: Some("Directory".to_string()),
                        }),
                        ..Volume::default()
                    }]),
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        status: None,
    }
}
