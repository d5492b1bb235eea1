// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{net::TcpListener, str::FromStr, time::Duration};

use {
    cidr::IpCidr,
    log::debug,
    serde::{Deserialize, Serialize},
};

use crate::{
    cluster::{Cluster, ClusterNetwork},
    error::{Error, Result},
    loadbalancer::LoadbalancerCreateOpts,
    node::{node_name, KubeApi, Node, PortBinding, Role},
    orchestrator::{ClusterCreateOpts, RegistryOpts},
    registry::Registry,
};

/// Host port the API is published on when no free port could be found.
const FALLBACK_API_PORT: u16 = 6550;

/// ClusterConfig, along with its children, is the model for a cluster in the configuration file.
/// The file is deserialized into a ClusterConfig, which is then turned into the in-memory
/// `Cluster` plus the options for creating it.
///
/// The file format is intentionally decoupled from the in-memory model, so that the latter can
/// change without breaking existing configuration files.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default = "default_servers")]
    pub servers: usize,
    #[serde(default)]
    pub agents: usize,
    pub image: Option<String>,
    pub token: Option<String>,
    /// Name of the network to create or join. Defaults to `k3d-<name>`.
    pub network: Option<String>,
    /// Subnet for a newly created network. Nodes get static IPs from it.
    pub subnet: Option<String>,
    #[serde(default)]
    pub kube_api: KubeApiConfig,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub volumes: Vec<FilteredValue>,
    #[serde(default)]
    pub env: Vec<FilteredValue>,
    #[serde(default)]
    pub args: Vec<FilteredValue>,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub registries: RegistriesConfig,
    #[serde(default)]
    pub options: OptionsConfig,
}

fn default_servers() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct KubeApiConfig {
    /// Hostname added to the API server certificate.
    pub host: Option<String>,
    pub host_ip: Option<String>,
    /// Host port the API is published on. A free port is picked if unset.
    pub host_port: Option<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PortConfig {
    /// `[hostIP:][hostPort:]containerPort[/protocol]`
    pub port: String,
    /// Where to publish the port. Defaults to the load balancer.
    #[serde(default)]
    pub node_filters: Vec<String>,
}

/// A value (volume mount, `KEY=value` variable, k3s argument) applied to the nodes selected by
/// `node_filters`, or to every server and agent when there are none.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FilteredValue {
    pub value: String,
    #[serde(default)]
    pub node_filters: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    pub servers: Option<String>,
    pub agents: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RegistriesConfig {
    pub create: Option<CreateRegistryConfig>,
    #[serde(default, rename = "use")]
    pub use_registries: Vec<String>,
    /// A complete `registries.yaml`, merged with the generated mirrors.
    pub config: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CreateRegistryConfig {
    pub name: Option<String>,
    pub image: Option<String>,
    pub host_port: Option<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct OptionsConfig {
    #[serde(default = "default_true")]
    pub wait: bool,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub disable_loadbalancer: bool,
    #[serde(default)]
    pub disable_image_volume: bool,
    pub lb_image: Option<String>,
    #[serde(default)]
    pub lb_overrides: Vec<String>,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        OptionsConfig {
            wait: true,
            timeout_secs: None,
            disable_loadbalancer: false,
            disable_image_volume: false,
            lb_image: None,
            lb_overrides: Vec::new(),
        }
    }
}

/// Selects nodes of a cluster: `loadbalancer`, `all`, `server:*`, `agent:0`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFilter {
    All,
    Loadbalancer,
    Role { role: Role, index: Option<usize> },
}

impl NodeFilter {
    pub fn matches(&self, role: Role, index: usize) -> bool {
        match self {
            NodeFilter::All => role.is_k3s(),
            NodeFilter::Loadbalancer => role == Role::LoadBalancer,
            NodeFilter::Role { role: r, index: i } => *r == role && i.map_or(true, |i| i == index),
        }
    }
}

impl FromStr for NodeFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("invalid node filter '{s}'"));

        match s {
            "all" => return Ok(NodeFilter::All),
            "loadbalancer" => return Ok(NodeFilter::Loadbalancer),
            _ => {}
        }

        let (role, index) = s.split_once(':').unwrap_or((s, "*"));
        let role = match role {
            "server" | "servers" => Role::Server,
            "agent" | "agents" => Role::Agent,
            _ => return Err(invalid()),
        };
        let index = match index {
            "*" => None,
            i => Some(i.parse().map_err(|_| invalid())?),
        };

        Ok(NodeFilter::Role { role, index })
    }
}

fn parse_filters(filters: &[String]) -> Result<Vec<NodeFilter>> {
    filters.iter().map(|f| f.parse()).collect()
}

/// Read the configuration file at `path`, or at the default location if no path is given.
pub fn load(path: Option<String>) -> Result<ClusterConfig> {
    let path = path.unwrap_or_else(crate::default_config_path);
    debug!("Reading cluster config from {path}");
    let contents = std::fs::read_to_string(&path)?;
    ClusterConfig::from_toml(&contents)
}

/// A free TCP port on the host, as handed out by the OS.
fn free_port() -> u16 {
    match TcpListener::bind("127.0.0.1:0").and_then(|l| l.local_addr()) {
        Ok(addr) => addr.port(),
        Err(e) => {
            debug!("Could not find a free port, using {FALLBACK_API_PORT}: {e}");
            FALLBACK_API_PORT
        }
    }
}

impl ClusterConfig {
    /// A single-server cluster named `name`, with everything else at its default.
    pub fn new(name: &str) -> Self {
        ClusterConfig {
            name: name.to_string(),
            servers: default_servers(),
            agents: 0,
            image: None,
            token: None,
            network: None,
            subnet: None,
            kube_api: KubeApiConfig::default(),
            ports: Vec::new(),
            volumes: Vec::new(),
            env: Vec::new(),
            args: Vec::new(),
            memory: MemoryConfig::default(),
            registries: RegistriesConfig::default(),
            options: OptionsConfig::default(),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Build the cluster described by this configuration, along with the options to create it.
    pub fn into_cluster(self) -> Result<(Cluster, ClusterCreateOpts)> {
        crate::cluster::validate_name(&self.name)?;
        if self.servers == 0 {
            return Err(Error::InvalidConfig(
                "a cluster needs at least one server".to_string(),
            ));
        }

        let mut cluster = Cluster::new(&self.name);
        if let Some(token) = self.token {
            cluster.token = token;
        }

        cluster.network = ClusterNetwork::new(&self.network.unwrap_or_default());
        if let Some(subnet) = self.subnet {
            let prefix: IpCidr = subnet
                .parse()
                .map_err(|e| Error::InvalidConfig(format!("invalid subnet '{subnet}': {e}")))?;
            cluster.network.ipam.prefix = Some(prefix);
        }

        cluster.kube_api = KubeApi {
            host: self.kube_api.host.unwrap_or_default(),
            host_ip: self.kube_api.host_ip.unwrap_or_else(|| "0.0.0.0".to_string()),
            host_port: self.kube_api.host_port.unwrap_or_else(free_port),
        };

        let image = self.image.unwrap_or_else(crate::default_image);
        let roles = std::iter::repeat(Role::Server)
            .take(self.servers)
            .enumerate()
            .chain(std::iter::repeat(Role::Agent).take(self.agents).enumerate());
        for (index, role) in roles {
            let mut node = Node::new(&node_name(&self.name, role, index), role);
            node.image = image.clone();
            node.restart = true;
            node.memory = match role {
                Role::Server => self.memory.servers.clone(),
                _ => self.memory.agents.clone(),
            };
            cluster.nodes.push(node);
        }

        let mut lb_ports = Vec::new();
        for port in self.ports.iter() {
            let binding: PortBinding = port.port.parse()?;
            let filters = parse_filters(&port.node_filters)?;

            if filters.is_empty() || filters.contains(&NodeFilter::Loadbalancer) {
                if self.options.disable_loadbalancer {
                    return Err(Error::InvalidConfig(format!(
                        "port '{}' targets the loadbalancer, which is disabled",
                        port.port
                    )));
                }
                lb_ports.push(binding.clone());
            }
            apply_filtered(&mut cluster.nodes, &filters, false, |node| {
                if !node.ports.contains(&binding) {
                    node.ports.push(binding.clone());
                }
            });
        }

        for volume in self.volumes.iter() {
            let filters = parse_filters(&volume.node_filters)?;
            apply_filtered(&mut cluster.nodes, &filters, true, |node| {
                node.volumes.push(volume.value.clone())
            });
        }

        for env in self.env.iter() {
            let (key, value) = env.value.split_once('=').ok_or_else(|| {
                Error::InvalidConfig(format!("environment '{}' is not of the form KEY=value", env.value))
            })?;
            let filters = parse_filters(&env.node_filters)?;
            apply_filtered(&mut cluster.nodes, &filters, true, |node| node.set_env(key, value));
        }

        for arg in self.args.iter() {
            let filters = parse_filters(&arg.node_filters)?;
            apply_filtered(&mut cluster.nodes, &filters, true, |node| {
                node.args.push(arg.value.clone())
            });
        }

        let create = self.registries.create.map(|reg| {
            let name = reg
                .name
                .unwrap_or_else(|| format!("{}-{}-registry", crate::OBJECT_NAME_PREFIX, self.name));
            let mut registry = Registry::new(&name, reg.host_port.unwrap_or_else(free_port));
            if let Some(image) = reg.image {
                registry.image = image;
            }
            registry
        });

        let opts = ClusterCreateOpts {
            wait_for_server: self.options.wait,
            timeout: self.options.timeout_secs.map(Duration::from_secs),
            disable_image_volume: self.options.disable_image_volume,
            disable_loadbalancer: self.options.disable_loadbalancer,
            loadbalancer: LoadbalancerCreateOpts {
                image: self.options.lb_image,
                ports: lb_ports,
                config_overrides: self.options.lb_overrides,
            },
            registries: RegistryOpts {
                create,
                use_registries: self.registries.use_registries,
                config: self.registries.config,
            },
            hooks: Vec::new(),
        };

        Ok((cluster, opts))
    }
}

/// Run `f` on every server and agent matched by `filters`. With no filters, `unfiltered` decides
/// whether every server and agent is selected or none is. The load balancer is not built yet at
/// this point, so `loadbalancer` filters match nothing here.
fn apply_filtered<F: FnMut(&mut Node)>(nodes: &mut [Node], filters: &[NodeFilter], unfiltered: bool, mut f: F) {
    let mut counters = [0usize; 2];
    for node in nodes.iter_mut() {
        let counter = match node.role {
            Role::Server => &mut counters[0],
            Role::Agent => &mut counters[1],
            _ => continue,
        };
        let index = *counter;
        *counter += 1;

        let selected = match filters.is_empty() {
            true => unfiltered,
            false => filters.iter().any(|filter| filter.matches(node.role, index)),
        };
        if selected {
            f(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
name = "dev"
servers = 3
agents = 2
subnet = "172.28.0.0/16"

[kube_api]
host = "dev.example.com"
host_port = 6550

[[ports]]
port = "8080:80"

[[ports]]
port = "30000:30000"
node_filters = ["agent:0"]

[[volumes]]
value = "/srv/data:/data"
node_filters = ["server:*"]

[[env]]
value = "FOO=bar"
node_filters = ["all"]

[memory]
agents = "1g"

[options]
timeout_secs = 120
lb_overrides = ["settings.workerConnections=4096"]
"#;

    #[test]
    fn parse_config() {
        let (cluster, opts) = ClusterConfig::from_toml(CONFIG)
            .unwrap()
            .into_cluster()
            .unwrap();

        assert_eq!(cluster.server_count(), 3);
        assert_eq!(cluster.agents().count(), 2);
        assert_eq!(cluster.nodes[0].name, "k3d-dev-server-0");
        assert_eq!(cluster.nodes[4].name, "k3d-dev-agent-1");
        assert_eq!(cluster.kube_api.host_port, 6550);
        assert_eq!(cluster.kube_api.host_ip, "0.0.0.0");
        assert_eq!(
            cluster.network.ipam.prefix,
            Some("172.28.0.0/16".parse().unwrap())
        );

        assert_eq!(opts.loadbalancer.ports, vec!["8080:80".parse().unwrap()]);
        assert_eq!(opts.timeout, Some(Duration::from_secs(120)));
        assert!(opts.wait_for_server);

        let agent0 = cluster.get_node("k3d-dev-agent-0").unwrap();
        assert_eq!(agent0.ports, vec!["30000:30000".parse().unwrap()]);
        assert_eq!(agent0.memory.as_deref(), Some("1g"));
        assert_eq!(agent0.env_var("FOO"), Some("bar"));
        assert!(agent0.volumes.is_empty());
        assert!(cluster.get_node("k3d-dev-agent-1").unwrap().ports.is_empty());

        let server2 = cluster.get_node("k3d-dev-server-2").unwrap();
        assert_eq!(server2.volumes, vec!["/srv/data:/data"]);
        assert_eq!(server2.memory, None);
    }

    #[test]
    fn node_filters() {
        assert_eq!("all".parse::<NodeFilter>().unwrap(), NodeFilter::All);
        assert_eq!(
            "server:1".parse::<NodeFilter>().unwrap(),
            NodeFilter::Role {
                role: Role::Server,
                index: Some(1)
            }
        );
        assert!("agent".parse::<NodeFilter>().unwrap().matches(Role::Agent, 5));
        assert!(!"agent:0".parse::<NodeFilter>().unwrap().matches(Role::Agent, 1));
        assert!("registry:0".parse::<NodeFilter>().is_err());
        assert!("server:x".parse::<NodeFilter>().is_err());
    }

    #[test]
    fn invalid_configs() {
        assert!(ClusterConfig::from_toml("name = \"dev\"\nunknown = 1\n").is_err());

        let no_servers = ClusterConfig::from_toml("name = \"dev\"\nservers = 0\n").unwrap();
        assert!(no_servers.into_cluster().is_err());

        let lb_port = ClusterConfig::from_toml(
            "name = \"dev\"\n[[ports]]\nport = \"80:80\"\n[options]\ndisable_loadbalancer = true\n",
        )
        .unwrap();
        assert!(lb_port.into_cluster().is_err());
    }
}
