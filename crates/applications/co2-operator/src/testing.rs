//! In-memory cluster used by the unit tests

use crate::cluster::{ClusterApi, Workload};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// A call made against the fake cluster
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    ListNodes,
    SetSchedulable {
        node: String,
        schedulable: bool,
        dry_run: bool,
    },
    ListWorkloads(String),
    Evict {
        workload: Workload,
        dry_run: bool,
    },
}

#[derive(Default)]
struct State {
    nodes: Vec<String>,
    workloads: HashMap<String, Vec<Workload>>,
    schedulable: HashMap<String, bool>,
    failing_node_lists: usize,
    failing_patches: HashSet<String>,
    failing_lists: HashSet<String>,
    failing_evictions: HashSet<String>,
    stuck: HashSet<String>,
    lingering: HashMap<String, usize>,
    terminating: HashMap<String, usize>,
    calls: Vec<Call>,
}

/// Cluster whose pods leave as soon as they are evicted, unless told otherwise
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub(crate) fn new(nodes: &[&str]) -> Self {
        let cluster = Self::default();
        cluster.lock().nodes = nodes.iter().map(|n| n.to_string()).collect();
        cluster
    }

    pub(crate) fn with_workload(self, node: &str, namespace: &str, name: &str) -> Self {
        self.lock()
            .workloads
            .entry(node.to_string())
            .or_default()
            .push(Workload::new(namespace, name));
        self
    }

    /// The next `times` node listings fail
    pub(crate) fn with_failing_node_lists(self, times: usize) -> Self {
        self.lock().failing_node_lists = times;
        self
    }

    /// Listing workloads on this node fails
    pub(crate) fn with_failing_list(self, node: &str) -> Self {
        self.lock().failing_lists.insert(node.to_string());
        self
    }

    /// Patching this node fails
    pub(crate) fn with_failing_patch(self, node: &str) -> Self {
        self.lock().failing_patches.insert(node.to_string());
        self
    }

    /// Evicting this pod fails (and it stays)
    pub(crate) fn with_failing_eviction(self, pod: &str) -> Self {
        self.lock().failing_evictions.insert(pod.to_string());
        self
    }

    /// This pod ignores evictions until released
    pub(crate) fn with_stuck(self, pod: &str) -> Self {
        self.lock().stuck.insert(pod.to_string());
        self
    }

    /// After eviction this pod stays visible for `polls` more listings
    pub(crate) fn with_lingering(self, pod: &str, polls: usize) -> Self {
        self.lock().lingering.insert(pod.to_string(), polls);
        self
    }

    pub(crate) fn release(&self, pod: &str) {
        self.lock().stuck.remove(pod);
    }

    pub(crate) fn remove_node(&self, node: &str) {
        self.lock().nodes.retain(|n| n != node);
    }

    /// Committed schedulability of `node`, if it was ever patched for real
    pub(crate) fn schedulable(&self, node: &str) -> Option<bool> {
        self.lock().schedulable.get(node).copied()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Every eviction attempt, as `namespace/name`
    pub(crate) fn evicted(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Evict { workload, .. } => Some(workload.to_string()),
                _ => None,
            })
            .collect()
    }

    /// Mutating calls made without dry run
    pub(crate) fn committing_mutations(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| {
                matches!(
                    call,
                    Call::SetSchedulable { dry_run: false, .. } | Call::Evict { dry_run: false, .. }
                )
            })
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.calls.push(Call::ListNodes);
        if state.failing_node_lists > 0 {
            state.failing_node_lists -= 1;
            return Err(OperatorError::cluster("apiserver unavailable"));
        }
        Ok(state.nodes.clone())
    }

    async fn set_schedulable(&self, node: &str, schedulable: bool, dry_run: bool) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::SetSchedulable {
            node: node.to_string(),
            schedulable,
            dry_run,
        });
        if state.failing_patches.contains(node) {
            return Err(OperatorError::cluster(format!("patch of {node} rejected")));
        }
        if !dry_run {
            state.schedulable.insert(node.to_string(), schedulable);
        }
        Ok(())
    }

    async fn list_workloads(&self, node: &str) -> Result<Vec<Workload>> {
        let mut state = self.lock();
        state.calls.push(Call::ListWorkloads(node.to_string()));
        if state.failing_lists.contains(node) {
            return Err(OperatorError::cluster(format!("pod list on {node} failed")));
        }

        let State {
            workloads,
            terminating,
            ..
        } = &mut *state;
        if let Some(pods) = workloads.get_mut(node) {
            pods.retain(|pod| match terminating.get_mut(&pod.name) {
                Some(0) => {
                    terminating.remove(&pod.name);
                    false
                }
                Some(remaining) => {
                    *remaining -= 1;
                    true
                }
                None => true,
            });
        }

        Ok(state.workloads.get(node).cloned().unwrap_or_default())
    }

    async fn evict(&self, workload: &Workload, dry_run: bool) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::Evict {
            workload: workload.clone(),
            dry_run,
        });
        if state.failing_evictions.contains(&workload.name) {
            return Err(OperatorError::cluster(format!(
                "eviction of {workload} blocked by disruption budget"
            )));
        }
        if dry_run || state.stuck.contains(&workload.name) {
            return Ok(());
        }

        if let Some(polls) = state.lingering.get(&workload.name).copied() {
            state.terminating.insert(workload.name.clone(), polls);
        } else {
            for pods in state.workloads.values_mut() {
                pods.retain(|pod| pod != workload);
            }
        }
        Ok(())
    }
}
