//! Cluster API access
//!
//! The operator needs four things from the cluster: the node list, a way to
//! (un)cordon a node, the workloads placed on a node, and pod eviction.
//! [`ClusterApi`] is that seam; [`KubeCluster`] implements it on kube-rs.
//!
//! Every mutating call takes a `dry_run` flag. When set, the API server
//! validates the request but does not persist it.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Annotation carried by static-pod mirrors
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// A workload instance placed on a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Workload {
    /// Namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl Workload {
    /// Create a workload reference
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Operations the operator performs against the cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Names of all nodes
    async fn list_nodes(&self) -> Result<Vec<String>>;

    /// Set whether new workloads may be placed on `node`
    async fn set_schedulable(&self, node: &str, schedulable: bool, dry_run: bool) -> Result<()>;

    /// Workloads currently placed on `node`
    async fn list_workloads(&self, node: &str) -> Result<Vec<Workload>>;

    /// Ask the cluster to gracefully terminate `workload`
    async fn evict(&self, workload: &Workload, dry_run: bool) -> Result<()>;
}

/// [`ClusterApi`] over the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the kubeconfig at `path`, or the inferred configuration
    /// (in-cluster service account, `KUBECONFIG`, `~/.kube/config`) when absent
    pub async fn connect(kubeconfig_path: Option<&Path>) -> Result<Self> {
        let config = match kubeconfig_path {
            Some(path) => {
                info!(path = %path.display(), "Loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    OperatorError::config(format!(
                        "cannot read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| OperatorError::config(format!("invalid kubeconfig: {}", e)))?
            }
            None => Config::infer()
                .await
                .map_err(|e| OperatorError::config(format!("cannot infer cluster config: {}", e)))?,
        };

        Ok(Self::new(Client::try_from(config)?))
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

/// Whether a pod has to leave the node before it counts as drained.
///
/// DaemonSet pods and static-pod mirrors are recreated on the node no matter
/// what, so they are skipped the same way `kubectl drain --ignore-daemonsets` does.
fn is_drainable(pod: &Pod) -> bool {
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
        return false;
    }
    !pod
        .owner_references()
        .iter()
        .any(|owner| owner.kind == "DaemonSet")
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_nodes(&self) -> Result<Vec<String>> {
        let nodes = self.nodes().list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(|node| node.name_any()).collect())
    }

    async fn set_schedulable(&self, node: &str, schedulable: bool, dry_run: bool) -> Result<()> {
        let params = PatchParams {
            dry_run,
            ..PatchParams::default()
        };
        let patch = Patch::Merge(json!({ "spec": { "unschedulable": !schedulable } }));

        self.nodes().patch(node, &params, &patch).await?;
        debug!(node = %node, schedulable, dry_run, "Patched node schedulability");
        Ok(())
    }

    async fn list_workloads(&self, node: &str) -> Result<Vec<Workload>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node));
        let pods = pods.list(&params).await?;

        Ok(pods
            .items
            .iter()
            .filter(|pod| is_drainable(pod))
            .map(|pod| Workload::new(pod.namespace().unwrap_or_default(), pod.name_any()))
            .collect())
    }

    async fn evict(&self, workload: &Workload, dry_run: bool) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &workload.namespace);
        let params = EvictParams {
            post_options: PostParams {
                dry_run,
                field_manager: None,
            },
            ..EvictParams::default()
        };

        pods.evict(&workload.name, &params).await?;
        debug!(workload = %workload, dry_run, "Eviction requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::collections::BTreeMap;

    fn pod(owner_kind: Option<&str>, mirror: bool) -> Pod {
        let owner_references = owner_kind.map(|kind| {
            vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: kind.to_string(),
                name: "owner".to_string(),
                uid: "0000".to_string(),
                ..OwnerReference::default()
            }]
        });
        let annotations = mirror.then(|| {
            BTreeMap::from([(MIRROR_POD_ANNOTATION.to_string(), "abc".to_string())])
        });

        Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("default".to_string()),
                owner_references,
                annotations,
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    #[test]
    fn test_replicaset_pods_are_drainable() {
        assert!(is_drainable(&pod(Some("ReplicaSet"), false)));
        assert!(is_drainable(&pod(None, false)));
    }

    #[test]
    fn test_daemonset_and_mirror_pods_are_skipped() {
        assert!(!is_drainable(&pod(Some("DaemonSet"), false)));
        assert!(!is_drainable(&pod(None, true)));
    }

    #[test]
    fn test_workload_display() {
        assert_eq!(Workload::new("kube-system", "dns-1").to_string(), "kube-system/dns-1");
    }
}
