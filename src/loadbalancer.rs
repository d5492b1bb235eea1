// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The cluster load balancer: an nginx proxy (driven by confd) in front of the server nodes.
//!
//! Its configuration is a small YAML document mapping `"<port>.<proto>"` to the names of the
//! nodes traffic for that port is forwarded to. The proxy watches the file and reloads itself,
//! logging `start worker processes` when the new configuration is in effect, or
//! `host not found in upstream` when one of the named nodes cannot be resolved.

use std::collections::{BTreeMap, BTreeSet};

use {
    chrono::Utc,
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    serde_yaml::{Mapping, Value},
};

use crate::{
    cluster::Cluster,
    context::Context,
    error::{Error, Result, ResultExt},
    node::{readiness, Action, Node, NodeHook, PortBinding, Role},
    repository::ClusterRepository,
    runtime::Runtime,
};

pub const LB_CONFIG_PATH: &str = "/etc/confd/values.yaml";
pub const DEFAULT_WORKER_CONNECTIONS: u32 = 1024;

const READY_MARKER: &str = "start worker processes";
const HOST_NOT_FOUND_MARKER: &str = "host not found in upstream";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadbalancerSettings {
    pub worker_connections: u32,
    /// Proxy timeout in seconds; nginx's default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_proxy_timeout: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadbalancerConfig {
    #[serde(default)]
    pub ports: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub settings: LoadbalancerSettings,
}

impl LoadbalancerConfig {
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(content: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(content)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Loadbalancer {
    pub node: Node,
    pub config: LoadbalancerConfig,
}

#[derive(Debug, Clone, Default)]
pub struct LoadbalancerCreateOpts {
    pub image: Option<String>,
    /// Ports exposed on the load balancer in addition to the API port.
    pub ports: Vec<PortBinding>,
    /// `key=value` settings overriding the generated configuration, with dotted keys
    /// (`settings.workerConnections=2048`, `ports.80.tcp=k3d-dev-agent-0,k3d-dev-agent-1`).
    pub config_overrides: Vec<String>,
}

impl Loadbalancer {
    pub fn new(node: Node) -> Self {
        Loadbalancer {
            node,
            config: LoadbalancerConfig::default(),
        }
    }

    /// Forward `port` to `targets`, in addition to the nodes it is already forwarded to.
    pub fn add_port_configs(&mut self, port: &PortBinding, targets: &[Node]) -> Result<()> {
        let names = self.target_names(targets)?;
        let entry = self.config.ports.entry(port.key()).or_default();
        for name in names {
            if !entry.contains(&name) {
                entry.push(name);
            }
        }
        Ok(())
    }

    /// Stop forwarding `port` to `targets`. The port is dropped once no target is left.
    pub fn remove_port_configs(&mut self, port: &PortBinding, targets: &[Node]) -> Result<()> {
        let names = self.target_names(targets)?;
        let key = port.key();
        if let Some(entry) = self.config.ports.get_mut(&key) {
            entry.retain(|existing| !names.contains(existing));
            if entry.is_empty() {
                self.config.ports.remove(&key);
            }
        }
        Ok(())
    }

    fn target_names(&self, targets: &[Node]) -> Result<Vec<String>> {
        targets
            .iter()
            .map(|target| {
                if target.role == Role::LoadBalancer || target.name == self.node.name {
                    Err(Error::InvalidConfig(format!(
                        "cannot forward loadbalancer ports to the loadbalancer '{}' itself",
                        target.name
                    )))
                } else {
                    Ok(target.name.clone())
                }
            })
            .collect()
    }
}

/// Keys of the ports exposed on `lb` besides the API port.
fn exposed_port_keys(lb: &Node) -> BTreeSet<String> {
    let api_key = PortBinding::new(None, crate::DEFAULT_API_PORT).key();
    lb.ports
        .iter()
        .map(PortBinding::key)
        .filter(|key| *key != api_key)
        .collect()
}

/// The configuration the load balancer of `cluster` should have: the API port and every port
/// exposed on the load balancer, each forwarded to all server nodes.
pub fn generate_config(cluster: &Cluster) -> LoadbalancerConfig {
    config_for(cluster, cluster.loadbalancer.as_ref().map(|lb| &lb.node))
}

fn config_for(cluster: &Cluster, lb: Option<&Node>) -> LoadbalancerConfig {
    let servers: Vec<String> = cluster.servers().map(|n| n.name.clone()).collect();

    let mut ports = BTreeMap::new();
    ports.insert(
        PortBinding::new(None, crate::DEFAULT_API_PORT).key(),
        servers.clone(),
    );

    let exposed = lb.map(exposed_port_keys).unwrap_or_default();
    for key in exposed.iter() {
        ports.insert(key.clone(), servers.clone());
    }

    LoadbalancerConfig {
        ports,
        settings: LoadbalancerSettings {
            worker_connections: DEFAULT_WORKER_CONNECTIONS
                + (exposed.len() * servers.len()) as u32,
            default_proxy_timeout: None,
        },
    }
}

/// Apply `key=value` overrides on top of `config`. Overrides win over generated values.
pub fn apply_overrides(config: &LoadbalancerConfig, overrides: &[String]) -> Result<LoadbalancerConfig> {
    let mut merged = serde_yaml::to_value(config)?;

    for over in overrides {
        let (key, value) = over.split_once('=').ok_or_else(|| {
            Error::InvalidConfig(format!("loadbalancer override '{over}' is not of the form key=value"))
        })?;

        let fragment = match key.strip_prefix("ports.") {
            // Port keys contain a dot themselves, so they are not split any further.
            Some(port) => {
                let targets = value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(|name| Value::String(name.to_string()))
                    .collect();
                nest(&["ports", port], Value::Sequence(targets))
            }
            None => {
                let scalar = serde_yaml::from_str(value)
                    .unwrap_or_else(|_| Value::String(value.to_string()));
                nest(&key.split('.').collect::<Vec<_>>(), scalar)
            }
        };

        merge(&mut merged, fragment);
    }

    serde_yaml::from_value(merged).map_err(|e| {
        Error::InvalidConfig(format!("loadbalancer overrides produce an invalid config: {e}"))
    })
}

fn nest(path: &[&str], leaf: Value) -> Value {
    path.iter().rev().fold(leaf, |inner, segment| {
        let mut mapping = Mapping::new();
        mapping.insert(Value::String(segment.to_string()), inner);
        Value::Mapping(mapping)
    })
}

fn merge(base: &mut Value, over: Value) {
    match (base, over) {
        (Value::Mapping(base), Value::Mapping(over)) => {
            for (key, value) in over {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, over) => *base = over,
    }
}

/// Build the load balancer node of `cluster` and stage its initial configuration as a PreStart
/// hook. The node is added to `cluster.nodes`.
pub fn prepare(cluster: &mut Cluster, opts: &LoadbalancerCreateOpts) -> Result<()> {
    let mut node = Node::new(&cluster.loadbalancer_name(), Role::LoadBalancer);
    node.image = opts.image.clone().unwrap_or_else(crate::default_proxy_image);
    node.restart = true;
    if !cluster.network.name.is_empty() {
        node.networks = vec![cluster.network.name.clone()];
    }

    node.ports.push(PortBinding {
        host_ip: cluster.kube_api.host_ip.clone(),
        host_port: Some(cluster.kube_api.host_port),
        container_port: crate::DEFAULT_API_PORT,
        protocol: "tcp".to_string(),
    });
    for port in opts.ports.iter() {
        if !node.ports.contains(port) {
            node.ports.push(port.clone());
        }
    }

    let mut lb = Loadbalancer::new(node);
    lb.config = apply_overrides(&config_for(cluster, Some(&lb.node)), &opts.config_overrides)?;
    let content = lb.config.to_yaml()?;

    lb.node.hooks.push(NodeHook::pre_start(Action::WriteFile {
        path: LB_CONFIG_PATH.to_string(),
        content: content.into_bytes(),
        mode: 0o744,
        description: "Write Loadbalancer Configuration".to_string(),
    }));

    cluster.nodes.push(lb.node.clone());
    cluster.loadbalancer = Some(lb);
    Ok(())
}

/// Read the configuration currently deployed to the load balancer `node`.
pub async fn read_config(runtime: &dyn Runtime, node: &Node) -> Result<LoadbalancerConfig> {
    let content = runtime
        .read_from_node(node, LB_CONFIG_PATH)
        .await
        .with_context(|| format!("failed to read loadbalancer config from '{}'", node.name))?;
    LoadbalancerConfig::from_yaml(&content)
}

fn log_diff(current: &LoadbalancerConfig, new: &LoadbalancerConfig) {
    if current == new {
        debug!("Loadbalancer config unchanged");
        return;
    }

    let keys: BTreeSet<&String> = current.ports.keys().chain(new.ports.keys()).collect();
    for key in keys {
        let (before, after) = (current.ports.get(key), new.ports.get(key));
        if before != after {
            debug!("Loadbalancer port {key}: {before:?} -> {after:?}");
        }
    }
    if current.settings != new.settings {
        debug!(
            "Loadbalancer settings: {:?} -> {:?}",
            current.settings, new.settings
        );
    }
}

/// Regenerate the load balancer configuration from the current members of `cluster`, push it
/// and verify that the load balancer accepted it.
///
/// Returns `LbConfigHostNotFound` when the load balancer reports that one of the configured
/// nodes does not resolve, and `LbConfigFailedTest` when it reports nothing at all.
pub async fn update(ctx: &Context, cluster: &Cluster) -> Result<()> {
    let cluster = ctx
        .repository()
        .get_by_name(&cluster.name)
        .await
        .with_context(|| format!("failed to refresh cluster '{}'", cluster.name))?;

    let Some(lb) = cluster.loadbalancer.as_ref() else {
        return Err(Error::InvalidConfig(format!(
            "cluster '{}' has no loadbalancer",
            cluster.name
        )));
    };

    let current = match read_config(ctx.runtime(), &lb.node).await {
        Ok(current) => current,
        Err(e) => {
            debug!("Could not read current loadbalancer config: {e}");
            LoadbalancerConfig::default()
        }
    };

    let mut new = generate_config(&cluster);
    new.settings.default_proxy_timeout = current.settings.default_proxy_timeout;
    log_diff(&current, &new);

    let content = new.to_yaml()?;
    let written_at = Utc::now();
    ctx.runtime()
        .write_to_node(&lb.node, content.as_bytes(), LB_CONFIG_PATH, 0o744)
        .await
        .with_context(|| format!("failed to write loadbalancer config to '{}'", lb.node.name))?;

    let verify = ctx.timeouts.lb_verify;
    match readiness::wait_for_log_message_with_timeout(ctx, &lb.node, READY_MARKER, written_at, verify)
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_deadline_exceeded() => {
            return match readiness::wait_for_log_message_with_timeout(
                ctx,
                &lb.node,
                HOST_NOT_FOUND_MARKER,
                written_at,
                verify,
            )
            .await
            {
                Ok(()) => {
                    warn!("Failed to configure loadbalancer because one of the nodes seems to be down! Run `k3ctl node list` to see which one it could be.");
                    Err(Error::LbConfigHostNotFound)
                }
                Err(e) if e.is_cancelled() => Err(e),
                Err(e) => {
                    warn!("Failed to check if the loadbalancer was configured correctly or if it broke. Please check it manually or try again: {e}");
                    Err(Error::LbConfigFailedTest)
                }
            };
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("failed to check if loadbalancer '{}' was configured correctly", lb.node.name)
            })
        }
    }

    info!("Successfully configured loadbalancer {}!", lb.node.name);
    ctx.sleep(ctx.timeouts.lb_debounce).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(servers: usize, exposed: &[&str]) -> Cluster {
        let mut cluster = Cluster::new("dev");
        cluster.kube_api.host_port = 6550;
        for i in 0..servers {
            cluster.nodes.push(Node::new(
                &crate::node::node_name("dev", Role::Server, i),
                Role::Server,
            ));
        }
        cluster.nodes.push(Node::new("k3d-dev-agent-0", Role::Agent));

        let opts = LoadbalancerCreateOpts {
            ports: exposed.iter().map(|p| p.parse().unwrap()).collect(),
            ..Default::default()
        };
        prepare(&mut cluster, &opts).unwrap();
        cluster
    }

    #[test]
    fn api_port_only() {
        let cluster = cluster(1, &[]);
        let config = generate_config(&cluster);
        assert_eq!(config.ports.len(), 1);
        assert_eq!(config.ports["6443.tcp"], vec!["k3d-dev-server-0"]);
        assert_eq!(config.settings.worker_connections, DEFAULT_WORKER_CONNECTIONS);
    }

    #[test]
    fn worker_connections() {
        for (servers, exposed) in [(0, 0), (1, 2), (3, 1), (3, 3)] {
            let ports: Vec<String> = (0..exposed).map(|i| format!("{}:{}", 8080 + i, 80 + i)).collect();
            let ports: Vec<&str> = ports.iter().map(String::as_str).collect();
            let config = generate_config(&cluster(servers, &ports));
            assert_eq!(
                config.settings.worker_connections,
                DEFAULT_WORKER_CONNECTIONS + (servers * exposed) as u32
            );
            assert_eq!(config.ports.len(), 1 + exposed);
        }
    }

    #[test]
    fn generation_is_stable() {
        let cluster = cluster(3, &["8080:80", "8443:443"]);
        let first = generate_config(&cluster).to_yaml().unwrap();
        let second = generate_config(&cluster).to_yaml().unwrap();
        assert_eq!(first, second);
        assert!(first.contains("workerConnections: 1030"));
        assert_eq!(
            LoadbalancerConfig::from_yaml(first.as_bytes()).unwrap(),
            generate_config(&cluster)
        );
    }

    #[test]
    fn prepare_stages_config() {
        let cluster = cluster(1, &["8080:80"]);
        let lb = cluster.loadbalancer.as_ref().unwrap();
        assert_eq!(lb.node.name, "k3d-dev-serverlb");
        assert_eq!(lb.node.ports.len(), 2);
        assert_eq!(lb.node.ports[0].host_port, Some(6550));
        assert!(cluster.nodes.iter().any(|n| n.role == Role::LoadBalancer));

        let Action::WriteFile { path, content, .. } = &lb.node.hooks[0].action else {
            panic!("expected a WriteFile hook");
        };
        assert_eq!(path, LB_CONFIG_PATH);
        assert_eq!(
            LoadbalancerConfig::from_yaml(content).unwrap(),
            lb.config
        );
    }

    #[test]
    fn overrides_win() {
        let base = generate_config(&cluster(2, &["8080:80"]));
        let merged = apply_overrides(
            &base,
            &[
                "settings.workerConnections=4096".to_string(),
                "settings.defaultProxyTimeout=900".to_string(),
                "ports.80.tcp=k3d-dev-agent-0, k3d-dev-agent-1".to_string(),
            ],
        )
        .unwrap();

        assert_eq!(merged.settings.worker_connections, 4096);
        assert_eq!(merged.settings.default_proxy_timeout, Some(900));
        assert_eq!(merged.ports["80.tcp"], vec!["k3d-dev-agent-0", "k3d-dev-agent-1"]);
        assert_eq!(merged.ports["6443.tcp"], base.ports["6443.tcp"]);

        assert!(apply_overrides(&base, &["settings.workerConnections".to_string()]).is_err());
        assert!(apply_overrides(&base, &["settings.workerConnections=many".to_string()]).is_err());
    }

    #[test]
    fn port_configs() {
        let mut cluster = cluster(1, &[]);
        let agents: Vec<Node> = vec![
            Node::new("k3d-dev-agent-0", Role::Agent),
            Node::new("k3d-dev-agent-1", Role::Agent),
        ];
        let port: PortBinding = "8080:80".parse().unwrap();
        let lb = cluster.loadbalancer.as_mut().unwrap();

        lb.add_port_configs(&port, &agents).unwrap();
        lb.add_port_configs(&port, &agents[..1]).unwrap();
        assert_eq!(lb.config.ports["80.tcp"], vec!["k3d-dev-agent-0", "k3d-dev-agent-1"]);

        let itself = lb.node.clone();
        assert!(lb.add_port_configs(&port, &[itself]).is_err());

        lb.remove_port_configs(&port, &agents[..1]).unwrap();
        assert_eq!(lb.config.ports["80.tcp"], vec!["k3d-dev-agent-1"]);
        lb.remove_port_configs(&port, &agents).unwrap();
        assert!(!lb.config.ports.contains_key("80.tcp"));
    }
}
