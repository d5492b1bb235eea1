// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Whole-cluster operations: create, start, stop, delete, get and list.

use std::{net::IpAddr, time::Duration};

use {
    futures::future::join_all,
    log::{debug, info, warn},
};

use crate::{
    cluster::{generate_token, validate_name, Cluster},
    context::{fan_out, Context},
    error::{Error, Result, ResultExt},
    ipam, labels,
    loadbalancer::{self, LoadbalancerCreateOpts},
    node::{
        lifecycle::{self, host_alias_hook},
        Intent, Node, NodeCreateOpts, NodeDeleteOpts, NodeHook, NodeStartOpts, PortBinding, Role,
    },
    registry::{self, Registry},
    repository::ClusterRepository,
    runtime::RuntimeInfo,
    tools::{self, IMAGE_VOLUME_MOUNT},
};

/// Facts about the environment a cluster runs in, gathered once per cluster operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentInfo {
    /// The host as seen from the cluster network.
    pub host_gateway: Option<IpAddr>,
    pub runtime_info: RuntimeInfo,
}

pub async fn gather_environment_info(ctx: &Context, cluster: &Cluster) -> Result<EnvironmentInfo> {
    let runtime_info = ctx
        .runtime()
        .info()
        .await
        .with_context(|| "failed to get runtime info".to_string())?;

    let host_gateway = match ctx.runtime().get_host_ip(&cluster.network.name).await {
        Ok(ip) => Some(ip),
        Err(e) => {
            warn!("Could not determine the host IP in network {}: {e}", cluster.network.name);
            None
        }
    };

    debug!("Environment of cluster {}: runtime {runtime_info}, host gateway {host_gateway:?}", cluster.name);
    Ok(EnvironmentInfo {
        host_gateway,
        runtime_info,
    })
}

#[derive(Debug, Clone, Default)]
pub struct RegistryOpts {
    /// A registry to create along with the cluster.
    pub create: Option<Registry>,
    /// Names of existing registry nodes the cluster should use.
    pub use_registries: Vec<String>,
    /// A `registries.yaml` to merge the generated mirrors into.
    pub config: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClusterCreateOpts {
    pub wait_for_server: bool,
    /// Limit for the whole create, from network preparation to the last node being ready.
    pub timeout: Option<Duration>,
    pub disable_image_volume: bool,
    pub disable_loadbalancer: bool,
    pub loadbalancer: LoadbalancerCreateOpts,
    pub registries: RegistryOpts,
    /// Hooks run on every node when it is started.
    pub hooks: Vec<NodeHook>,
}

impl Default for ClusterCreateOpts {
    fn default() -> Self {
        ClusterCreateOpts {
            wait_for_server: true,
            timeout: None,
            disable_image_volume: false,
            disable_loadbalancer: false,
            loadbalancer: LoadbalancerCreateOpts::default(),
            registries: RegistryOpts::default(),
            hooks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterStartOpts {
    pub wait: bool,
    pub timeout: Option<Duration>,
    pub intent: Intent,
    pub hooks: Vec<NodeHook>,
    pub env_info: Option<EnvironmentInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterDeleteOpts {
    /// Leave registry nodes that were created with the cluster in place.
    pub keep_registries: bool,
}

/// Create and start `cluster`.
///
/// A failed run is not rolled back: the caller is expected to `cluster_delete` the cluster
/// when this returns an error.
pub async fn run(ctx: &Context, cluster: &mut Cluster, opts: &ClusterCreateOpts) -> Result<()> {
    ctx.run_with_timeout(opts.timeout, async {
        let registries = prepare(ctx, cluster, opts).await?;

        let create_opts = NodeCreateOpts::default();
        let create_opts = &create_opts;
        let nodes = std::mem::take(&mut cluster.nodes);
        let snapshot = cluster.clone();

        let (created, _) = futures::try_join!(
            fan_out(ctx, nodes, |member, mut node: Node| {
                let create_opts = create_opts.clone();
                async move {
                    lifecycle::create(&member, &mut node, &create_opts).await?;
                    Ok::<_, Error>(node)
                }
            }),
            async {
                tools::ensure(ctx, &snapshot)
                    .await
                    .with_context(|| format!("failed to start tools node of cluster '{}'", snapshot.name))
            },
        )?;
        cluster.nodes = created;
        if let Some(lb) = cluster.loadbalancer.as_mut() {
            if let Some(node) = cluster.nodes.iter().find(|n| n.role == Role::LoadBalancer) {
                lb.node = node.clone();
            }
        }

        let env_info = gather_environment_info(ctx, cluster).await?;

        start_nodes(
            ctx,
            cluster,
            &ClusterStartOpts {
                wait: opts.wait_for_server,
                timeout: None,
                intent: Intent::ClusterCreate,
                hooks: opts.hooks.clone(),
                env_info: Some(env_info),
            },
        )
        .await?;

        if !registries.is_empty() {
            if let Err(e) = registry::apply_hosting_config_map(ctx, cluster).await {
                warn!("Failed to create LocalRegistryHosting ConfigMap: {e}");
            }
        }

        Ok(())
    })
    .await
}

/// Everything that has to happen before the node containers are created. Returns the
/// registries the cluster uses.
async fn prepare(ctx: &Context, cluster: &mut Cluster, opts: &ClusterCreateOpts) -> Result<Vec<Registry>> {
    validate_name(&cluster.name)?;
    match ctx.repository().get_by_name(&cluster.name).await {
        Ok(_) => {
            return Err(Error::InvalidConfig(format!(
                "a cluster named '{}' already exists",
                cluster.name
            )))
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    if cluster.token.is_empty() {
        cluster.token = generate_token();
    }

    prepare_network(ctx, cluster).await?;

    if !opts.disable_loadbalancer && cluster.loadbalancer.is_none() && !cluster.network.is_host() {
        loadbalancer::prepare(cluster, &opts.loadbalancer)?;
    }

    let server_names: Vec<String> = cluster.servers().map(|n| n.name.clone()).collect();
    if server_names.len() > 1 {
        cluster.init_node = Some(server_names[0].clone());
    }
    let join_target = cluster.init_node.clone().or_else(|| server_names.first().cloned());
    let cluster_url = join_target
        .as_ref()
        .map(|name| format!("https://{name}:{}", crate::DEFAULT_API_PORT));

    if cluster.loadbalancer.is_none() {
        // Without a load balancer the first server exposes the API itself.
        let api = PortBinding {
            host_ip: cluster.kube_api.host_ip.clone(),
            host_port: Some(cluster.kube_api.host_port),
            container_port: crate::DEFAULT_API_PORT,
            protocol: "tcp".to_string(),
        };
        if let Some(first) = cluster.nodes.iter_mut().find(|n| n.role == Role::Server) {
            if !cluster.network.is_host() && !first.ports.contains(&api) {
                first.ports.push(api);
            }
        }
    }

    if !opts.disable_image_volume {
        let volume = cluster.image_volume_name();
        ctx.runtime()
            .create_volume(&volume, &labels::cluster_filter(&cluster.name))
            .await
            .with_context(|| format!("failed to create image volume '{volume}'"))?;
        cluster.image_volume = Some(volume);
    }

    let mut global_labels = labels::cluster_filter(&cluster.name);
    for (key, value) in [
        (labels::CLUSTER_TOKEN, Some(cluster.token.clone())),
        (labels::NETWORK, Some(cluster.network.name.clone())),
        (labels::NETWORK_ID, Some(cluster.network.id.clone())),
        (labels::NETWORK_EXTERNAL, Some(cluster.network.external.to_string())),
        (labels::NETWORK_IP_RANGE, cluster.network.ipam.prefix.map(|p| p.to_string())),
        (labels::IMAGE_VOLUME, cluster.image_volume.clone()),
        (labels::CLUSTER_URL, cluster_url.clone()),
    ] {
        if let Some(value) = value {
            global_labels.insert(key.to_string(), value);
        }
    }

    for node in cluster.nodes.iter_mut() {
        for (key, value) in global_labels.iter() {
            node.runtime_labels.insert(key.clone(), value.clone());
        }
        if node.networks.is_empty() {
            node.networks = vec![cluster.network.name.clone()];
        }

        if let Some(volume) = &cluster.image_volume {
            let mount = format!("{volume}:{IMAGE_VOLUME_MOUNT}");
            if !node.volumes.contains(&mount) {
                node.volumes.push(mount);
            }
        }

        if node.role.is_k3s() {
            node.set_env("K3S_TOKEN", &cluster.token);
        }

        match node.role {
            Role::Server => {
                node.server_opts.kube_api = Some(cluster.kube_api.clone());
                if cluster.init_node.as_deref() == Some(node.name.as_str()) {
                    node.server_opts.is_init = true;
                } else if cluster.init_node.is_some() {
                    if let Some(url) = &cluster_url {
                        node.set_env("K3S_URL", url);
                    }
                }
            }
            Role::Agent => {
                if let Some(url) = &cluster_url {
                    node.set_env("K3S_URL", url);
                }
            }
            _ => {}
        }
    }

    if cluster.network.ipam.managed {
        for i in 0..cluster.nodes.len() {
            if cluster.nodes[i].ip.is_some() {
                continue;
            }
            let ip = ipam::get_ip(ctx, &cluster.network).await?;
            cluster.network.ipam.ips_used.push(ip);
            cluster.nodes[i].ip = Some(ip);
        }
    }

    let mut registries = Vec::new();
    if let Some(create) = &opts.registries.create {
        registry::create(ctx, create, cluster).await?;
        registries.push(create.clone());
    }
    for name in opts.registries.use_registries.iter() {
        registries.push(registry::resolve(ctx, name, &cluster.network.name).await?);
    }

    let (all_hooks, server_hooks) = registry::hooks(&registries, opts.registries.config.as_deref())?;
    for node in cluster.nodes.iter_mut().filter(|n| n.role.is_k3s()) {
        node.hooks.extend(all_hooks.iter().cloned());
        if node.role == Role::Server {
            node.hooks.extend(server_hooks.iter().cloned());
        }
    }

    Ok(registries)
}

async fn prepare_network(ctx: &Context, cluster: &mut Cluster) -> Result<()> {
    if cluster.network.name.is_empty() {
        cluster.network.name = format!("{}-{}", crate::OBJECT_NAME_PREFIX, cluster.name);
    }

    if cluster.network.is_host() {
        if cluster.server_count() > 1 {
            return Err(Error::InvalidConfig(
                "only one server node is supported in host network mode".to_string(),
            ));
        }
        for node in cluster.nodes.iter_mut() {
            node.networks = vec!["host".to_string()];
        }
        cluster.network.external = true;
        return Ok(());
    }

    let requested_prefix = cluster.network.ipam.prefix;
    match ctx.runtime().get_network(&cluster.network.name).await {
        Ok(_) if requested_prefix.is_some() => {
            return Err(Error::InvalidConfig(format!(
                "cannot specify a subnet for the existing network '{}'",
                cluster.network.name
            )))
        }
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to get network '{}'", cluster.network.name))
        }
    }

    let (network, existed) = ctx
        .runtime()
        .create_network_if_not_present(&cluster.network, &labels::default_labels())
        .await
        .with_context(|| format!("failed to create network '{}'", cluster.network.name))?;

    cluster.network = network;
    cluster.network.ipam.managed = requested_prefix.is_some() && !existed;
    if existed {
        info!("Re-using existing network '{}' ({})", cluster.network.name, cluster.network.id);
        // Never delete a network that was not created for this cluster.
        cluster.network.external = true;
    } else {
        info!("Created network '{}'", cluster.network.name);
    }

    Ok(())
}

/// Start the nodes of `cluster`: the init server first, then the remaining servers, then agents,
/// then helpers (load balancer, registries).
pub async fn start_nodes(ctx: &Context, cluster: &Cluster, opts: &ClusterStartOpts) -> Result<()> {
    let env_info = match &opts.env_info {
        Some(env) => env.clone(),
        None => gather_environment_info(ctx, cluster).await?,
    };

    let mut k3s_hooks = opts.hooks.clone();
    if !cluster.network.is_host() {
        if let Some(ip) = env_info.host_gateway {
            k3s_hooks.push(host_alias_hook(ip));
        }
    }

    let start_opts = |node: &Node, wait: bool| NodeStartOpts {
        wait,
        timeout: opts.timeout,
        hooks: if node.role.is_k3s() {
            k3s_hooks.clone()
        } else {
            opts.hooks.clone()
        },
        intent: opts.intent,
    };
    let start_opts = &start_opts;

    let init = cluster.init_node.as_deref();
    if let Some(mut node) = init.and_then(|name| cluster.get_node(name)).cloned() {
        info!("Starting init server {}", node.name);
        let node_opts = start_opts(&node, true);
        lifecycle::start(ctx, &mut node, &node_opts).await?;
    }

    let servers: Vec<Node> = cluster
        .servers()
        .filter(|n| Some(n.name.as_str()) != init)
        .cloned()
        .collect();
    let agents: Vec<Node> = cluster.agents().cloned().collect();
    let helpers: Vec<Node> = cluster
        .nodes
        .iter()
        .filter(|n| matches!(n.role, Role::LoadBalancer | Role::Registry))
        .cloned()
        .collect();

    for (group, nodes) in [("servers", servers), ("agents", agents), ("helpers", helpers)] {
        if nodes.is_empty() {
            continue;
        }
        info!("Starting {group} of cluster {}", cluster.name);
        fan_out(ctx, nodes, |member, mut node: Node| {
            let wait = if node.role.is_k3s() {
                opts.wait
            } else {
                node.role == Role::LoadBalancer
            };
            let node_opts = start_opts(&node, wait);
            async move { lifecycle::start(&member, &mut node, &node_opts).await }
        })
        .await?;
    }

    if opts.intent == Intent::ClusterStart && cluster.loadbalancer.is_some() {
        match loadbalancer::update(ctx, cluster).await {
            Err(e) if e.is_lb_host_not_found() => {
                warn!("Loadbalancer of cluster {} references a node that is down", cluster.name)
            }
            res => res.with_context(|| format!("failed to update loadbalancer of cluster '{}'", cluster.name))?,
        }
    }

    info!("Started cluster {}", cluster.name);
    Ok(())
}

pub async fn cluster_get(ctx: &Context, name: &str) -> Result<Cluster> {
    ctx.repository().get_by_name(name).await
}

pub async fn cluster_list(ctx: &Context) -> Result<Vec<Cluster>> {
    ctx.repository().list().await
}

pub async fn cluster_start(ctx: &Context, name: &str, opts: &ClusterStartOpts) -> Result<()> {
    let cluster = cluster_get(ctx, name).await?;
    let opts = ClusterStartOpts {
        intent: Intent::ClusterStart,
        ..opts.clone()
    };
    ctx.run_with_timeout(opts.timeout, start_nodes(ctx, &cluster, &opts))
        .await
}

pub async fn cluster_stop(ctx: &Context, name: &str) -> Result<()> {
    let cluster = cluster_get(ctx, name).await?;
    info!("Stopping cluster {name}");

    let stops = cluster
        .nodes
        .iter()
        .filter(|n| n.state.running)
        .map(|node| async move {
            let mut node = node.clone();
            let res = lifecycle::stop(ctx, &mut node).await;
            (node.name, res)
        });

    let mut first_error = None;
    for (node, res) in join_all(stops).await {
        if let Err(e) = res {
            warn!("Failed to stop node {node}: {e}");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e).with_context(|| format!("failed to stop cluster '{name}'")),
        None => Ok(()),
    }
}

/// Delete every node of the cluster, then its network (unless external) and image volume.
pub async fn cluster_delete(ctx: &Context, name: &str, opts: &ClusterDeleteOpts) -> Result<()> {
    let cluster = cluster_get(ctx, name).await?;
    info!("Deleting cluster {name}");

    let delete_opts = NodeDeleteOpts {
        skip_lb_update: true,
    };
    for node in cluster.nodes.iter() {
        if node.role == Role::Registry && opts.keep_registries {
            info!("Keeping registry {}", node.name);
            continue;
        }
        lifecycle::delete(ctx, node, &delete_opts).await?;
    }

    if cluster.network.name.is_empty() || cluster.network.is_host() {
        debug!("Cluster {name} has no network of its own");
    } else if cluster.network.external {
        info!("Skipping deletion of network '{}' because it's managed externally", cluster.network.name);
    } else {
        info!("Deleting network '{}'", cluster.network.name);
        if let Err(e) = ctx.runtime().delete_network(&cluster.network.name).await {
            warn!("Failed to delete network '{}': Try to delete it manually: {e}", cluster.network.name);
        }
    }

    if let Some(volume) = &cluster.image_volume {
        info!("Deleting image volume '{volume}'");
        if let Err(e) = ctx.runtime().delete_volume(volume).await {
            warn!("Failed to delete image volume '{volume}': Try to delete it manually: {e}");
        }
    }

    Ok(())
}

/// Add `node` to the cluster `cluster_name`. Convenience wrapper around
/// `lifecycle::add_to_cluster` for callers that only know the cluster's name.
pub async fn node_add(ctx: &Context, cluster_name: &str, node: &mut Node, opts: &NodeCreateOpts) -> Result<()> {
    let cluster = cluster_get(ctx, cluster_name).await?;
    lifecycle::add_to_cluster(ctx, node, &cluster, opts).await
}

/// Every node managed by this tool, across all clusters.
pub async fn node_list(ctx: &Context) -> Result<Vec<Node>> {
    let mut nodes = ctx
        .repository()
        .list_by_label(&labels::default_labels())
        .await?;
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(nodes)
}

pub async fn node_get(ctx: &Context, name: &str) -> Result<Node> {
    match ctx.runtime().get_node(name).await {
        Ok(node) => Ok(node),
        Err(e) if e.is_not_found() => Err(Error::NodeNotFound(name.to_string())),
        Err(e) => Err(e).with_context(|| format!("failed to get node '{name}'")),
    }
}
