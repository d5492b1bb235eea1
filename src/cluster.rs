// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::net::IpAddr;

use {cidr::IpCidr, rand::Rng};

use crate::{
    error::{Error, Result},
    labels,
    loadbalancer::Loadbalancer,
    node::{KubeApi, Node, Role},
};

/// Longest cluster name accepted. Node names append role and index, and must stay valid
/// hostnames.
pub const MAX_CLUSTER_NAME_LENGTH: usize = 32;

/// IP address management state of a network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ipam {
    pub prefix: Option<IpCidr>,
    /// Whether addresses are handed out by this tool (static node IPs) instead of the runtime.
    pub managed: bool,
    pub ips_used: Vec<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterNetwork {
    pub name: String,
    pub id: String,
    /// The network is not owned by this tool and must never be deleted by it.
    pub external: bool,
    pub ipam: Ipam,
}

impl ClusterNetwork {
    pub fn new(name: &str) -> Self {
        ClusterNetwork {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_host(&self) -> bool {
        self.name == "host"
    }
}

/// Cluster is the in-memory view of a set of nodes sharing the same `k3d.cluster` label.
///
/// Nothing here is authoritative: the cluster exists exactly as long as containers labeled
/// with its name exist, and `Cluster::from_nodes` rebuilds this view from them.
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    pub name: String,
    pub network: ClusterNetwork,
    pub token: String,
    pub nodes: Vec<Node>,
    /// Name of the server that bootstraps etcd, when there is more than one server.
    pub init_node: Option<String>,
    pub loadbalancer: Option<Loadbalancer>,
    pub image_volume: Option<String>,
    pub kube_api: KubeApi,
}

impl Cluster {
    pub fn new(name: &str) -> Self {
        Cluster {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Rebuild a cluster from the labels of its member nodes.
    pub fn from_nodes(name: &str, nodes: Vec<Node>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::ClusterNotFound(name.to_string()));
        }

        let mut cluster = Cluster::new(name);

        for node in nodes.iter() {
            if cluster.token.is_empty() {
                if let Some(token) = node.label(labels::CLUSTER_TOKEN) {
                    cluster.token = token.to_string();
                }
            }
            if cluster.network.name.is_empty() {
                if let Some(network) = node.label(labels::NETWORK) {
                    cluster.network.name = network.to_string();
                    cluster.network.id = node.label(labels::NETWORK_ID).unwrap_or("").to_string();
                    cluster.network.external =
                        node.label(labels::NETWORK_EXTERNAL) == Some("true");
                    cluster.network.ipam.prefix = node
                        .label(labels::NETWORK_IP_RANGE)
                        .and_then(|range| range.parse().ok());
                }
            }
            if cluster.image_volume.is_none() {
                cluster.image_volume = node.label(labels::IMAGE_VOLUME).map(str::to_string);
            }

            if node.role == Role::Server {
                if node.label(labels::SERVER_IS_INIT) == Some("true") {
                    cluster.init_node = Some(node.name.clone());
                }
                if cluster.kube_api.host.is_empty() {
                    if let Some(host) = node.label(labels::SERVER_API_HOST) {
                        cluster.kube_api = KubeApi {
                            host: host.to_string(),
                            host_ip: node
                                .label(labels::SERVER_API_HOST_IP)
                                .unwrap_or("")
                                .to_string(),
                            host_port: node
                                .label(labels::SERVER_API_PORT)
                                .and_then(|p| p.parse().ok())
                                .unwrap_or(0),
                        };
                    }
                }
            }

            if node.role == Role::LoadBalancer && cluster.loadbalancer.is_none() {
                cluster.loadbalancer = Some(Loadbalancer::new(node.clone()));
            }
        }

        // Static node IPs are only ever assigned from a managed prefix.
        cluster.network.ipam.managed = nodes
            .iter()
            .any(|n| n.label(labels::NODE_STATIC_IP).is_some());
        cluster.network.ipam.ips_used = nodes.iter().filter_map(|n| n.ip).collect();

        cluster.nodes = nodes;
        cluster.sort_nodes();
        Ok(cluster)
    }

    /// Keep a stable, human-friendly ordering: servers, agents, then everything else.
    fn sort_nodes(&mut self) {
        self.nodes.sort_by(|a, b| {
            let rank = |role: Role| match role {
                Role::Server => 0,
                Role::Agent => 1,
                Role::LoadBalancer => 2,
                Role::Registry => 3,
                Role::NoRole => 4,
            };
            rank(a.role)
                .cmp(&rank(b.role))
                .then_with(|| a.name.cmp(&b.name))
        });
    }

    pub fn nodes_by_role(&self, role: Role) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.role == role)
    }

    pub fn servers(&self) -> impl Iterator<Item = &Node> {
        self.nodes_by_role(Role::Server)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Node> {
        self.nodes_by_role(Role::Agent)
    }

    pub fn server_count(&self) -> usize {
        self.servers().count()
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn image_volume_name(&self) -> String {
        format!("{}-{}-images", crate::OBJECT_NAME_PREFIX, self.name)
    }

    pub fn tools_node_name(&self) -> String {
        format!("{}-{}-tools", crate::OBJECT_NAME_PREFIX, self.name)
    }

    pub fn loadbalancer_name(&self) -> String {
        format!("{}-{}-serverlb", crate::OBJECT_NAME_PREFIX, self.name)
    }

    pub fn print_summary(&self) {
        println!(
            "{}: {} server(s), {} agent(s), loadbalancer: {}, network: {}",
            self.name,
            self.server_count(),
            self.agents().count(),
            if self.loadbalancer.is_some() { "yes" } else { "no" },
            self.network.name,
        );
        for node in self.nodes.iter() {
            println!(
                "  {:<32} {:<13} {}",
                node.name,
                node.role.as_str(),
                if node.state.running {
                    "running"
                } else {
                    node.state.status.as_str()
                }
            );
        }
    }
}

/// Check that `name` can be used as a cluster name: a valid hostname label of limited length.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_CLUSTER_NAME_LENGTH {
        return Err(Error::InvalidConfig(format!(
            "cluster name '{name}' must be between 1 and {MAX_CLUSTER_NAME_LENGTH} characters"
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::InvalidConfig(format!(
            "cluster name '{name}' must not start or end with '-'"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::InvalidConfig(format!(
            "cluster name '{name}' may only contain letters, digits and '-'"
        )));
    }
    Ok(())
}

/// A random alphanumeric string, used for cluster tokens and temporary names.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn generate_token() -> String {
    random_string(20)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled(name: &str, role: Role, cluster: &str) -> Node {
        let mut node = Node::new(name, role);
        node.runtime_labels = labels::cluster_filter(cluster);
        node.runtime_labels
            .insert(labels::ROLE.to_string(), role.to_string());
        node.runtime_labels
            .insert(labels::CLUSTER_TOKEN.to_string(), "secret".to_string());
        node.runtime_labels
            .insert(labels::NETWORK.to_string(), "k3d-dev".to_string());
        node
    }

    #[test]
    fn names() {
        assert!(validate_name("dev").is_ok());
        assert!(validate_name("my-cluster-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-dev").is_err());
        assert!(validate_name("dev_1").is_err());
        assert!(validate_name(&"a".repeat(33)).is_err());
        assert_eq!(generate_token().len(), 20);
    }

    #[test]
    fn rebuild_from_labels() {
        let mut server = labeled("k3d-dev-server-0", Role::Server, "dev");
        server
            .runtime_labels
            .insert(labels::SERVER_API_HOST.to_string(), "0.0.0.0".to_string());
        server
            .runtime_labels
            .insert(labels::SERVER_API_PORT.to_string(), "6550".to_string());
        let nodes = vec![
            labeled("k3d-dev-serverlb", Role::LoadBalancer, "dev"),
            labeled("k3d-dev-agent-0", Role::Agent, "dev"),
            server,
        ];

        let cluster = Cluster::from_nodes("dev", nodes).unwrap();
        assert_eq!(cluster.token, "secret");
        assert_eq!(cluster.network.name, "k3d-dev");
        assert_eq!(cluster.kube_api.host_port, 6550);
        assert_eq!(cluster.nodes[0].name, "k3d-dev-server-0");
        assert_eq!(
            cluster.loadbalancer.as_ref().unwrap().node.name,
            "k3d-dev-serverlb"
        );

        assert!(matches!(
            Cluster::from_nodes("dev", vec![]),
            Err(Error::ClusterNotFound(_))
        ));
    }
}
