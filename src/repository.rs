// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Lookup of clusters and their member nodes.
//!
//! Membership is only ever recorded in runtime labels, so every lookup ends up as a label query.
//! Call sites go through `ClusterRepository` so that the runtime-backed implementation can be
//! replaced by a cached index without touching them.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use {async_trait::async_trait, log::debug};

use crate::{
    cluster::Cluster,
    context::Context,
    error::{Error, Result, ResultExt},
    labels, loadbalancer,
    node::Node,
    runtime::Runtime,
};

#[async_trait]
pub trait ClusterRepository: Send + Sync {
    /// All nodes carrying every label in `labels`.
    async fn list_by_label(&self, labels: &HashMap<String, String>) -> Result<Vec<Node>>;

    /// The cluster named `name`, rebuilt from its nodes. Fails with `ClusterNotFound` if no
    /// node carries its name.
    async fn get_by_name(&self, name: &str) -> Result<Cluster>;

    /// Every cluster that has at least one node, ordered by name.
    async fn list(&self) -> Result<Vec<Cluster>> {
        let nodes = self.list_by_label(&labels::default_labels()).await?;

        let mut by_cluster: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        for node in nodes {
            let Some(name) = node.cluster_name().map(str::to_string) else {
                continue;
            };
            by_cluster.entry(name).or_default().push(node);
        }

        by_cluster
            .into_iter()
            .map(|(name, nodes)| Cluster::from_nodes(&name, nodes))
            .collect()
    }
}

/// A `ClusterRepository` that asks the runtime every time.
#[derive(Debug, Clone)]
pub struct RuntimeRepository {
    runtime: Arc<dyn Runtime>,
}

impl RuntimeRepository {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        RuntimeRepository { runtime }
    }
}

#[async_trait]
impl ClusterRepository for RuntimeRepository {
    async fn list_by_label(&self, labels: &HashMap<String, String>) -> Result<Vec<Node>> {
        self.runtime
            .get_nodes_by_label(labels)
            .await
            .with_context(|| "failed to list nodes".to_string())
    }

    async fn get_by_name(&self, name: &str) -> Result<Cluster> {
        let nodes = self.list_by_label(&labels::cluster_filter(name)).await?;
        let mut cluster = Cluster::from_nodes(name, nodes)?;

        if let Some(lb) = cluster.loadbalancer.as_mut() {
            match loadbalancer::read_config(self.runtime.as_ref(), &lb.node).await {
                Ok(config) => lb.config = config,
                Err(e) => debug!(
                    "Could not read config of loadbalancer {}, assuming defaults: {e}",
                    lb.node.name
                ),
            }
        }

        Ok(cluster)
    }
}

impl Context {
    pub fn repository(&self) -> RuntimeRepository {
        RuntimeRepository::new(self.runtime_handle())
    }
}

/// Look up the cluster `node` belongs to, according to its labels.
pub async fn cluster_of(ctx: &Context, node: &Node) -> Result<Cluster> {
    let name = node.cluster_name().ok_or_else(|| {
        Error::InvalidConfig(format!("node '{}' does not belong to a cluster", node.name))
    })?;
    ctx.repository().get_by_name(name).await
}
