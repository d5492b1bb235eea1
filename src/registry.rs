// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Local image registries: registry nodes, the k3s `registries.yaml` pointing the nodes at
//! them, and the `LocalRegistryHosting` ConfigMap advertising them to cluster tooling.

use std::collections::BTreeMap;

use {
    log::{debug, info},
    serde::{Deserialize, Serialize},
    serde_yaml::Value,
};

use crate::{
    cluster::Cluster,
    context::Context,
    error::{Error, Result, ResultExt},
    labels,
    node::{lifecycle, Action, Node, NodeCreateOpts, NodeHook, NodeStartOpts, PortBinding, Role},
};

pub const DEFAULT_REGISTRY_PORT: u16 = 5000;
pub const REGISTRIES_CONFIG_PATH: &str = "/etc/rancher/k3s/registries.yaml";
pub const LOCAL_REGISTRY_HOSTING_PATH: &str = "/tmp/localRegistryHostingCM.yaml";

#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    /// Container name, also the hostname nodes use to reach it.
    pub name: String,
    pub image: String,
    /// Name the registry is reachable under from the host.
    pub host: String,
    pub host_ip: String,
    pub host_port: u16,
    pub internal_port: u16,
}

impl Registry {
    pub fn new(name: &str, host_port: u16) -> Self {
        Registry {
            name: name.to_string(),
            image: crate::default_registry_image(),
            host: name.to_string(),
            host_ip: "0.0.0.0".to_string(),
            host_port,
            internal_port: DEFAULT_REGISTRY_PORT,
        }
    }

    /// Rebuild the description of an existing registry node from its labels.
    pub fn from_node(node: &Node) -> Result<Self> {
        if node.role != Role::Registry {
            return Err(Error::InvalidConfig(format!(
                "node '{}' is not a registry",
                node.name
            )));
        }

        let port = |key: &str, default: u16| {
            node.label(key)
                .and_then(|p| p.parse().ok())
                .unwrap_or(default)
        };

        Ok(Registry {
            name: node.name.clone(),
            image: node.image.clone(),
            host: node.label(labels::REGISTRY_HOST).unwrap_or(&node.name).to_string(),
            host_ip: node
                .label(labels::REGISTRY_HOST_IP)
                .unwrap_or("0.0.0.0")
                .to_string(),
            host_port: port(labels::REGISTRY_PORT_EXTERNAL, DEFAULT_REGISTRY_PORT),
            internal_port: port(labels::REGISTRY_PORT_INTERNAL, DEFAULT_REGISTRY_PORT),
        })
    }

    fn to_node(&self, network: &str) -> Node {
        let mut node = Node::new(&self.name, Role::Registry);
        node.image = self.image.clone();
        node.restart = true;
        node.networks = vec![network.to_string()];
        node.ports = vec![PortBinding {
            host_ip: self.host_ip.clone(),
            host_port: Some(self.host_port),
            container_port: self.internal_port,
            protocol: "tcp".to_string(),
        }];
        node.set_env(
            "REGISTRY_HTTP_ADDR",
            &format!("0.0.0.0:{}", self.internal_port),
        );

        node.runtime_labels = labels::default_labels();
        for (key, value) in [
            (labels::REGISTRY_HOST, self.host.clone()),
            (labels::REGISTRY_HOST_IP, self.host_ip.clone()),
            (labels::REGISTRY_PORT_EXTERNAL, self.host_port.to_string()),
            (labels::REGISTRY_PORT_INTERNAL, self.internal_port.to_string()),
        ] {
            node.runtime_labels.insert(key.to_string(), value);
        }
        node
    }
}

/// Create and start a registry node for `cluster`. The registry carries the cluster's label, so
/// it goes away with the cluster.
pub async fn create(ctx: &Context, registry: &Registry, cluster: &Cluster) -> Result<Node> {
    let mut node = registry.to_node(&cluster.network.name);
    node.runtime_labels
        .insert(labels::CLUSTER_NAME.to_string(), cluster.name.clone());

    info!("Creating registry {}", registry.name);
    lifecycle::create(ctx, &mut node, &NodeCreateOpts::default())
        .await
        .with_context(|| format!("failed to create registry '{}'", registry.name))?;
    lifecycle::start(
        ctx,
        &mut node,
        &NodeStartOpts {
            wait: true,
            ..Default::default()
        },
    )
    .await
    .with_context(|| format!("failed to start registry '{}'", registry.name))?;

    Ok(node)
}

/// Look up an existing registry and make sure it is attached to `network`.
pub async fn resolve(ctx: &Context, name: &str, network: &str) -> Result<Registry> {
    let node = ctx
        .runtime()
        .get_node(name)
        .await
        .with_context(|| format!("failed to find registry '{name}'"))?;
    let registry = Registry::from_node(&node)?;

    if !node.networks.iter().any(|n| n == network) {
        debug!("Connecting registry {name} to network {network}");
        ctx.runtime()
            .connect_node_to_network(&node, network)
            .await
            .with_context(|| format!("failed to connect registry '{name}' to network '{network}'"))?;
    }

    Ok(registry)
}

#[derive(Debug, Serialize, Deserialize)]
struct Mirror {
    endpoint: Vec<String>,
}

/// The `registries.yaml` telling containerd in every node to pull through `registries`.
///
/// Entries in `custom` (a complete `registries.yaml`) take precedence over generated mirrors.
pub fn registries_config(registries: &[Registry], custom: Option<&str>) -> Result<String> {
    let mut config = match custom {
        Some(custom) => serde_yaml::from_str::<Value>(custom)?,
        None => Value::Mapping(Default::default()),
    };
    let Value::Mapping(root) = &mut config else {
        return Err(Error::InvalidConfig(
            "registries config must be a YAML mapping".to_string(),
        ));
    };

    let mirrors = root
        .entry(Value::String("mirrors".to_string()))
        .or_insert(Value::Mapping(Default::default()));
    let Value::Mapping(mirrors) = mirrors else {
        return Err(Error::InvalidConfig(
            "'mirrors' in registries config must be a mapping".to_string(),
        ));
    };

    for registry in registries {
        let key = Value::String(format!("{}:{}", registry.host, registry.host_port));
        if mirrors.contains_key(&key) {
            continue;
        }
        let mirror = Mirror {
            endpoint: vec![format!("http://{}:{}", registry.name, registry.internal_port)],
        };
        mirrors.insert(key, serde_yaml::to_value(mirror)?);
    }

    Ok(serde_yaml::to_string(&config)?)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalRegistryHostingV1 {
    host: String,
    host_from_container_runtime: String,
    host_from_cluster_network: String,
    help: String,
}

#[derive(Debug, Serialize)]
struct ConfigMapMetadata {
    name: String,
    namespace: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigMap {
    api_version: String,
    kind: String,
    metadata: ConfigMapMetadata,
    data: BTreeMap<String, String>,
}

/// The `LocalRegistryHosting` ConfigMap advertising the first of `registries`.
pub fn local_registry_hosting_manifest(registries: &[Registry]) -> Result<Option<String>> {
    let Some(registry) = registries.first() else {
        return Ok(None);
    };

    let hosting = LocalRegistryHostingV1 {
        host: format!("{}:{}", registry.host, registry.host_port),
        host_from_container_runtime: format!("{}:{}", registry.name, registry.internal_port),
        host_from_cluster_network: format!("{}:{}", registry.name, registry.internal_port),
        help: "https://k3d.io/usage/registries/#using-a-local-registry".to_string(),
    };

    let config_map = ConfigMap {
        api_version: "v1".to_string(),
        kind: "ConfigMap".to_string(),
        metadata: ConfigMapMetadata {
            name: "local-registry-hosting".to_string(),
            namespace: "kube-public".to_string(),
        },
        data: BTreeMap::from([(
            "localRegistryHosting.v1".to_string(),
            serde_yaml::to_string(&hosting)?,
        )]),
    };

    Ok(Some(serde_yaml::to_string(&config_map)?))
}

/// PreStart hooks for the k3s nodes of a cluster using `registries`: the `registries.yaml` for
/// every node, and, for servers only, the staged `LocalRegistryHosting` manifest.
pub fn hooks(registries: &[Registry], custom: Option<&str>) -> Result<(Vec<NodeHook>, Vec<NodeHook>)> {
    if registries.is_empty() && custom.is_none() {
        return Ok((Vec::new(), Vec::new()));
    }

    let all = vec![NodeHook::pre_start(Action::WriteFile {
        path: REGISTRIES_CONFIG_PATH.to_string(),
        content: registries_config(registries, custom)?.into_bytes(),
        mode: 0o644,
        description: "Write Registry Configuration".to_string(),
    })];

    let servers = local_registry_hosting_manifest(registries)?
        .map(|manifest| {
            NodeHook::pre_start(Action::WriteFile {
                path: LOCAL_REGISTRY_HOSTING_PATH.to_string(),
                content: manifest.into_bytes(),
                mode: 0o644,
                description: "Write LocalRegistryHosting Configmap".to_string(),
            })
        })
        .into_iter()
        .collect();

    Ok((all, servers))
}

/// Apply the staged `LocalRegistryHosting` manifest through the first server that accepts it.
pub async fn apply_hosting_config_map(ctx: &Context, cluster: &Cluster) -> Result<()> {
    let command: Vec<String> = ["kubectl", "apply", "-f", LOCAL_REGISTRY_HOSTING_PATH]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let mut last_error = None;
    for server in cluster.servers() {
        match ctx.runtime().exec_in_node(server, &command, None).await {
            Ok(_) => {
                debug!("Created LocalRegistryHosting ConfigMap through node {}", server.name);
                return Ok(());
            }
            Err(e) => {
                debug!("Failed to create LocalRegistryHosting ConfigMap through node {}: {e}", server.name);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(e).with_context(|| "failed to create LocalRegistryHosting ConfigMap".to_string()),
        None => Err(Error::InvalidConfig(format!(
            "cluster '{}' has no server to create the LocalRegistryHosting ConfigMap through",
            cluster.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors() {
        let registry = Registry::new("k3d-registry", 5050);
        let config = registries_config(&[registry.clone()], None).unwrap();
        let parsed: Value = serde_yaml::from_str(&config).unwrap();
        assert_eq!(
            parsed["mirrors"]["k3d-registry:5050"]["endpoint"][0],
            Value::String("http://k3d-registry:5000".to_string())
        );

        let custom = "mirrors:\n  k3d-registry:5050:\n    endpoint:\n      - http://elsewhere:5000\nconfigs: {}\n";
        let config = registries_config(&[registry], Some(custom)).unwrap();
        let parsed: Value = serde_yaml::from_str(&config).unwrap();
        assert_eq!(
            parsed["mirrors"]["k3d-registry:5050"]["endpoint"][0],
            Value::String("http://elsewhere:5000".to_string())
        );
        assert!(parsed.get("configs").is_some());
    }

    #[test]
    fn labels_round_trip() {
        let registry = Registry::new("k3d-registry", 5050);
        let node = registry.to_node("k3d-dev");
        assert_eq!(Registry::from_node(&node).unwrap(), registry);
        assert!(Registry::from_node(&Node::new("x", Role::Agent)).is_err());
    }

    #[test]
    fn hosting_manifest() {
        assert!(local_registry_hosting_manifest(&[]).unwrap().is_none());
        let manifest = local_registry_hosting_manifest(&[Registry::new("k3d-registry", 5050)])
            .unwrap()
            .unwrap();
        assert!(manifest.contains("name: local-registry-hosting"));
        assert!(manifest.contains("hostFromContainerRuntime: k3d-registry:5000"));
    }
}
