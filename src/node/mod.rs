// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::HashMap, fmt, net::IpAddr, str::FromStr};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

use crate::{error::Error, labels};

pub mod hooks;
pub mod lifecycle;
pub mod memory;
pub mod readiness;

pub use hooks::{Action, HookStage, NodeHook};
pub use lifecycle::{NodeCreateOpts, NodeDeleteOpts, NodeEditChanges, NodeStartOpts};

/// The part a node plays in a cluster. Stored in the `k3d.role` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "server")]
    Server,
    #[serde(rename = "agent")]
    Agent,
    #[serde(rename = "loadbalancer")]
    LoadBalancer,
    #[serde(rename = "registry")]
    Registry,
    #[default]
    #[serde(rename = "noRole")]
    NoRole,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Agent => "agent",
            Role::LoadBalancer => "loadbalancer",
            Role::Registry => "registry",
            Role::NoRole => "noRole",
        }
    }

    /// The k3s subcommand a node of this role runs when none was given.
    pub fn default_cmd(&self) -> Vec<String> {
        match self {
            Role::Server => vec!["server".to_string()],
            Role::Agent => vec!["agent".to_string()],
            _ => Vec::new(),
        }
    }

    /// Servers and agents are the nodes that actually run k3s.
    pub fn is_k3s(&self) -> bool {
        matches!(self, Role::Server | Role::Agent)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "server" => Role::Server,
            "agent" => Role::Agent,
            "loadbalancer" => Role::LoadBalancer,
            "registry" => Role::Registry,
            "noRole" | "" => Role::NoRole,
            other => return Err(Error::InvalidConfig(format!("unknown node role '{other}'"))),
        })
    }
}

/// Why a node is being started. Selects which log line counts as "ready".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Intent {
    ClusterCreate,
    ClusterStart,
    NodeCreate,
    NodeStart,
    #[default]
    Any,
}

/// The log line a node of `role` prints once it finished initializing for `intent`.
pub fn ready_log_message(role: Role, intent: Intent) -> Option<&'static str> {
    match (role, intent) {
        (Role::Server, Intent::ClusterCreate | Intent::NodeCreate) => {
            Some("Containerd is now running")
        }
        (Role::Server, _) => Some("Running kube-apiserver"),
        (Role::Agent, _) => Some("Successfully registered node"),
        (Role::LoadBalancer, _) => Some("start worker processes"),
        (Role::Registry, _) => Some("listening on"),
        (Role::NoRole, _) => None,
    }
}

/// A published port: `[hostIP:][hostPort:]containerPort[/protocol]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: String,
}

impl PortBinding {
    pub fn new(host_port: Option<u16>, container_port: u16) -> Self {
        PortBinding {
            host_ip: String::new(),
            host_port,
            container_port,
            protocol: "tcp".to_string(),
        }
    }

    /// Key used in the load balancer config, e.g. "80.tcp".
    pub fn key(&self) -> String {
        format!("{}.{}", self.container_port, self.protocol)
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.host_ip.is_empty() {
            write!(f, "{}:", self.host_ip)?;
        }
        if let Some(port) = self.host_port {
            write!(f, "{port}:")?;
        }
        write!(f, "{}/{}", self.container_port, self.protocol)
    }
}

impl FromStr for PortBinding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidConfig(format!("invalid port mapping '{s}'"));
        let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid());

        let (rest, protocol) = match s.rsplit_once('/') {
            Some((rest, proto @ ("tcp" | "udp"))) => (rest, proto.to_string()),
            Some(_) => return Err(invalid()),
            None => (s, "tcp".to_string()),
        };

        let parts: Vec<&str> = rest.rsplitn(3, ':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [container] => (String::new(), None, parse_port(container)?),
            [container, host] => (String::new(), Some(parse_port(host)?), parse_port(container)?),
            [container, host, ip] => (
                ip.to_string(),
                Some(parse_port(host)?),
                parse_port(container)?,
            ),
            _ => return Err(invalid()),
        };

        Ok(PortBinding {
            host_ip,
            host_port,
            container_port,
            protocol,
        })
    }
}

/// The mutable part of a node, as last observed from the runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeState {
    pub running: bool,
    pub status: String,
    pub started: Option<DateTime<Utc>>,
}

/// Where the Kubernetes API of a cluster is reachable from the outside.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KubeApi {
    pub host: String,
    pub host_ip: String,
    pub host_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerOpts {
    /// This server bootstraps the embedded etcd of a multi-server cluster.
    pub is_init: bool,
    pub kube_api: Option<KubeApi>,
}

/// A single cluster member, backed by one container.
///
/// A `Node` is a plain value. The container is the source of truth, so a copy should be
/// refreshed with `Runtime::get_node` before it is used to make a decision.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub name: String,
    pub role: Role,
    pub image: String,
    pub cmd: Vec<String>,
    pub args: Vec<String>,
    /// Environment in `KEY=value` form.
    pub env: Vec<String>,
    /// Mounts in `source:destination[:mode]` form.
    pub volumes: Vec<String>,
    pub ports: Vec<PortBinding>,
    pub networks: Vec<String>,
    pub ip: Option<IpAddr>,
    pub restart: bool,
    pub memory: Option<String>,
    pub runtime_labels: HashMap<String, String>,
    pub hooks: Vec<NodeHook>,
    pub server_opts: ServerOpts,
    pub state: NodeState,
}

impl Node {
    pub fn new(name: &str, role: Role) -> Self {
        Node {
            name: name.to_string(),
            role,
            ..Default::default()
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.runtime_labels.get(key).map(String::as_str)
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.label(labels::CLUSTER_NAME)
    }

    /// Get the value of environment variable `key`, if set.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Set `key=value`, replacing any existing assignment of `key`.
    pub fn set_env(&mut self, key: &str, value: &str) {
        self.remove_env(key);
        self.env.push(format!("{key}={value}"));
    }

    pub fn remove_env(&mut self, key: &str) {
        let prefix = format!("{key}=");
        self.env.retain(|entry| !entry.starts_with(&prefix));
    }

    pub fn is_host_network(&self) -> bool {
        self.networks.iter().any(|n| n == "host")
    }

    pub fn hooks_for(&self, stage: HookStage) -> impl Iterator<Item = &NodeHook> {
        self.hooks.iter().filter(move |hook| hook.stage == stage)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Name for the `index`th node of `role` in `cluster`, e.g. `k3d-dev-server-0`.
pub fn node_name(cluster: &str, role: Role, index: usize) -> String {
    format!(
        "{}-{}-{}-{}",
        crate::OBJECT_NAME_PREFIX,
        cluster,
        role.as_str(),
        index
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_bindings() {
        let p: PortBinding = "8080:80".parse().unwrap();
        assert_eq!(p.host_port, Some(8080));
        assert_eq!(p.container_port, 80);
        assert_eq!(p.key(), "80.tcp");

        let p: PortBinding = "127.0.0.1:5353:53/udp".parse().unwrap();
        assert_eq!(p.host_ip, "127.0.0.1");
        assert_eq!(p.key(), "53.udp");
        assert_eq!(p.to_string(), "127.0.0.1:5353:53/udp");

        let p: PortBinding = "6443".parse().unwrap();
        assert_eq!(p.host_port, None);

        assert!("80/sctp".parse::<PortBinding>().is_err());
        assert!("a:b".parse::<PortBinding>().is_err());
    }

    #[test]
    fn env_helpers() {
        let mut node = Node::new("n", Role::Agent);
        node.set_env("K3S_URL", "https://a:6443");
        node.set_env("K3S_URL", "https://b:6443");
        assert_eq!(node.env.len(), 1);
        assert_eq!(node.env_var("K3S_URL"), Some("https://b:6443"));
        node.remove_env("K3S_URL");
        assert_eq!(node.env_var("K3S_URL"), None);
    }

    #[test]
    fn role_round_trip() {
        for role in [
            Role::Server,
            Role::Agent,
            Role::LoadBalancer,
            Role::Registry,
            Role::NoRole,
        ] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert_eq!(node_name("dev", Role::Agent, 2), "k3d-dev-agent-2");
    }
}
