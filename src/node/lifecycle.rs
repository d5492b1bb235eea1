// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Creating, starting, stopping, replacing and deleting single nodes.

use std::time::Duration;

use {
    chrono::{SubsecRound, Utc},
    log::{debug, error, info, warn},
};

use crate::{
    cluster::{random_string, Cluster},
    context::Context,
    error::{Error, Result, ResultExt},
    ipam, labels,
    loadbalancer::{self, LB_CONFIG_PATH},
    node::{
        hooks::{self, RewriteFn},
        memory, readiness, ready_log_message, Action, HookStage, Intent, Node, NodeHook,
        NodeState, PortBinding, Role,
    },
    orchestrator::EnvironmentInfo,
    repository::{self, ClusterRepository},
};

/// Hostname under which nodes reach the host machine.
pub const HOST_RECORD: &str = "host.k3d.internal";

const CLUSTER_INIT_FLAG: &str = "--cluster-init";
const KUBECONFIG_OUTPUT_ENV: &str = "K3S_KUBECONFIG_OUTPUT";
const DEFAULT_KUBECONFIG_OUTPUT: &str = "/output/kubeconfig.yaml";
const CLUSTER_URL_ENV: &str = "K3S_URL";

#[derive(Debug, Clone, Default)]
pub struct NodeCreateOpts {
    /// Wait for the node to be ready after it was started (only for `add_to_cluster`).
    pub wait: bool,
    pub timeout: Option<Duration>,
    /// Hooks run in addition to the node's own when it is started.
    pub hooks: Vec<NodeHook>,
    /// Facts about the runtime environment, if they were already gathered.
    pub env_info: Option<EnvironmentInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeStartOpts {
    pub wait: bool,
    pub timeout: Option<Duration>,
    pub hooks: Vec<NodeHook>,
    pub intent: Intent,
}

#[derive(Debug, Clone, Default)]
pub struct NodeDeleteOpts {
    /// Do not reconfigure the cluster load balancer after the node is gone.
    pub skip_lb_update: bool,
}

/// What `edit` may change on an existing node.
#[derive(Debug, Clone, Default)]
pub struct NodeEditChanges {
    /// Ports to expose in addition to the existing ones. Only supported for load balancers.
    pub ports: Vec<PortBinding>,
}

fn patch_role(node: &mut Node) {
    if node.cmd.is_empty() {
        node.cmd = node.role.default_cmd();
    }

    node.runtime_labels
        .insert(labels::ROLE.to_string(), node.role.to_string());
    node.runtime_labels
        .insert(labels::VERSION.to_string(), crate::VERSION.to_string());
    for (key, value) in labels::default_labels() {
        node.runtime_labels.entry(key).or_insert(value);
    }

    if node.role != Role::Server {
        return;
    }

    if node.server_opts.is_init {
        node.runtime_labels
            .insert(labels::SERVER_IS_INIT.to_string(), "true".to_string());
        if !node.args.iter().any(|a| a == CLUSTER_INIT_FLAG) {
            node.args.push(CLUSTER_INIT_FLAG.to_string());
        }
    }

    if let Some(api) = node.server_opts.kube_api.clone() {
        node.runtime_labels
            .insert(labels::SERVER_API_HOST.to_string(), api.host.clone());
        node.runtime_labels
            .insert(labels::SERVER_API_HOST_IP.to_string(), api.host_ip.clone());
        node.runtime_labels.insert(
            labels::SERVER_API_PORT.to_string(),
            api.host_port.to_string(),
        );

        if !api.host.is_empty() {
            let already = node
                .args
                .windows(2)
                .any(|pair| pair[0] == "--tls-san" && pair[1] == api.host);
            if !already {
                node.args.push("--tls-san".to_string());
                node.args.push(api.host);
            }
        }
    }
}

/// Create the container of `node` without starting it.
///
/// Role defaults and labels are filled in on `node`, so the caller ends up with the definition
/// that was actually handed to the runtime.
pub async fn create(ctx: &Context, node: &mut Node, opts: &NodeCreateOpts) -> Result<()> {
    debug!("Creating node {} ({})", node.name, node.role);

    patch_role(node);

    if node.role.is_k3s() && node.env_var(KUBECONFIG_OUTPUT_ENV).is_none() {
        node.set_env(KUBECONFIG_OUTPUT_ENV, DEFAULT_KUBECONFIG_OUTPUT);
    }

    if let Some(mem) = node.memory.clone() {
        let bytes = memory::parse_size(&mem)?;
        let info = match &opts.env_info {
            Some(env) => env.runtime_info.clone(),
            None => ctx
                .runtime()
                .info()
                .await
                .with_context(|| "failed to get runtime info".to_string())?,
        };

        if !info.native_memory_limits {
            debug!(
                "Runtime {} cannot show memory limits to containers, faking them for node {}",
                info.name, node.name
            );
            let volumes = memory::prepare_fake_files(ctx, &node.name, bytes)
                .await
                .with_context(|| format!("failed to prepare fake memory files for node '{}'", node.name))?;
            for volume in volumes {
                if !node.volumes.contains(&volume) {
                    node.volumes.push(volume);
                }
            }
        }
        node.runtime_labels
            .insert(labels::NODE_MEMORY.to_string(), mem);
    }

    if let Some(ip) = node.ip {
        node.runtime_labels
            .insert(labels::NODE_STATIC_IP.to_string(), ip.to_string());
    }

    ctx.runtime()
        .create_node(node)
        .await
        .with_context(|| format!("failed to create node '{}'", node.name))
}

/// Start `node`, run its hooks and, when asked to, wait until it is ready.
pub async fn start(ctx: &Context, node: &mut Node, opts: &NodeStartOpts) -> Result<()> {
    let runtime = ctx.runtime();

    let (running, _) = runtime
        .node_status(node)
        .await
        .with_context(|| format!("failed to get status of node '{}'", node.name))?;
    if running {
        info!("Node {} is already running", node.name);
        node.state.running = true;
        return Ok(());
    }

    let hooks: Vec<NodeHook> = node.hooks.iter().chain(opts.hooks.iter()).cloned().collect();

    hooks::run_stage(ctx, node, &hooks, HookStage::PreStart).await?;

    let requested = Utc::now();
    info!("Starting node {}", node.name);
    runtime
        .start_node(node)
        .await
        .with_context(|| format!("failed to start node '{}'", node.name))?;

    // Log timestamps have second precision on some runtimes.
    let started = match runtime.get_node(&node.name).await {
        Ok(current) => current.state.started.unwrap_or(requested),
        Err(e) => {
            debug!("Could not get start time of node {}: {e}", node.name);
            requested
        }
    }
    .trunc_subsecs(0);
    debug!("Node {} start time: {started}", node.name);

    node.state = NodeState {
        running: true,
        status: "running".to_string(),
        started: Some(started),
    };

    if opts.wait {
        match ready_log_message(node.role, opts.intent) {
            Some(message) => {
                debug!("Waiting for node {} to get ready ('{message}')", node.name);
                ctx.run_with_timeout(
                    opts.timeout,
                    readiness::wait_for_log_message(ctx, node, message, started),
                )
                .await
                .with_context(|| format!("node '{}' failed to get ready", node.name))?;
            }
            None => warn!(
                "Set to wait for node {} to get ready, but there's no target log message defined",
                node.name
            ),
        }
    }

    hooks::run_stage(ctx, node, &hooks, HookStage::PostStart).await
}

pub async fn stop(ctx: &Context, node: &mut Node) -> Result<()> {
    info!("Stopping node {}", node.name);
    ctx.runtime()
        .stop_node(node)
        .await
        .with_context(|| format!("failed to stop node '{}'", node.name))?;
    node.state.running = false;
    node.state.status = "exited".to_string();
    Ok(())
}

/// Delete `node`. Deletion is best effort: failures are logged, and a node that is already
/// gone is not an error.
pub async fn delete(ctx: &Context, node: &Node, opts: &NodeDeleteOpts) -> Result<()> {
    let node = match ctx.runtime().get_node(&node.name).await {
        Ok(current) => current,
        Err(e) => {
            debug!("Could not refresh node {} before deleting it: {e}", node.name);
            node.clone()
        }
    };

    info!("Deleting node {}", node.name);
    if let Err(e) = ctx.runtime().delete_node(&node).await {
        error!("Failed to delete node '{}': Try to delete it manually: {e}", node.name);
    }

    if let Err(e) = memory::cleanup(ctx, &node.name).await {
        error!("Failed to clean up fake files of node '{}': {e}", node.name);
    }

    if opts.skip_lb_update || !node.role.is_k3s() {
        return Ok(());
    }

    let cluster = match repository::cluster_of(ctx, &node).await {
        Ok(cluster) => cluster,
        Err(e) if e.is_not_found() => {
            debug!("Cluster of node {} is gone, no loadbalancer to update", node.name);
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to find cluster of node '{}'", node.name))
        }
    };

    if cluster.loadbalancer.is_none() {
        return Ok(());
    }

    match loadbalancer::update(ctx, &cluster).await {
        Err(e) if e.is_lb_host_not_found() => {
            warn!("Loadbalancer of cluster {} still references a node that is down", cluster.name);
            Ok(())
        }
        Err(e) if e.is_lb_failed_test() => {
            warn!("Loadbalancer of cluster {} did not confirm its new configuration: {e}", cluster.name);
            Ok(())
        }
        res => res.with_context(|| format!("failed to update loadbalancer of cluster '{}'", cluster.name)),
    }
}

/// Swap `old` for `new` without a moment where both exist under the same name.
///
/// 1. `old` is renamed out of the way.
/// 2. `new` is created. On failure, `old` gets its name back.
/// 3. `old` is stopped.
/// 4. `new` is started. On failure, `new` is deleted, and `old` is renamed back and restarted.
/// 5. `old` is deleted.
pub async fn replace(ctx: &Context, old: &Node, new: &mut Node) -> Result<()> {
    let runtime = ctx.runtime();

    let mut old = runtime
        .get_node(&old.name)
        .await
        .with_context(|| format!("failed to get node '{}'", old.name))?;
    let original_name = old.name.clone();
    let temp_name = format!("{original_name}-{}", random_string(5).to_lowercase());

    info!("Renaming existing node {original_name} to {temp_name}");
    runtime
        .rename_node(&old, &temp_name)
        .await
        .with_context(|| format!("failed to rename node '{original_name}' to '{temp_name}'"))?;
    old.name = temp_name.clone();

    let restore_name = |old: &Node| {
        let original_name = original_name.clone();
        let old = old.clone();
        async move {
            info!("Renaming {} back to {original_name}", old.name);
            ctx.runtime()
                .rename_node(&old, &original_name)
                .await
                .with_context(|| format!("failed to rename node '{}' back to '{original_name}'", old.name))
        }
    };

    info!("Creating new node {}", new.name);
    if let Err(e) = create(ctx, new, &NodeCreateOpts::default()).await {
        if let Err(rollback) = restore_name(&old).await {
            error!("Failed to roll back the replacement of node {original_name}: {rollback}");
        }
        return Err(e).with_context(|| format!("failed to create replacement for node '{original_name}'"));
    }

    if let Err(e) = stop(ctx, &mut old).await {
        if let Err(rollback) = runtime.delete_node(new).await {
            error!("Failed to delete new node {} during rollback: {rollback}", new.name);
        }
        if let Err(rollback) = restore_name(&old).await {
            error!("Failed to roll back the replacement of node {original_name}: {rollback}");
        }
        return Err(e);
    }

    let start_opts = NodeStartOpts {
        wait: true,
        ..Default::default()
    };
    if let Err(e) = start(ctx, new, &start_opts).await {
        error!("Failed to start new node {}, rolling back: {e}", new.name);
        if let Err(rollback) = runtime.delete_node(new).await {
            error!("Failed to delete new node {} during rollback: {rollback}", new.name);
        }
        match restore_name(&old).await {
            Ok(()) => {
                old.name = original_name.clone();
                old.state = NodeState::default();
                if let Err(rollback) = start(ctx, &mut old, &NodeStartOpts::default()).await {
                    error!("Failed to restart old node {original_name} during rollback: {rollback}");
                }
            }
            Err(rollback) => {
                error!("Failed to roll back the replacement of node {original_name}: {rollback}")
            }
        }
        return Err(e).with_context(|| format!("failed to start replacement for node '{original_name}'"));
    }

    delete(
        ctx,
        &old,
        &NodeDeleteOpts {
            skip_lb_update: true,
        },
    )
    .await
}

/// Apply `changes` to `node` by replacing it with an edited copy.
pub async fn edit(ctx: &Context, node: &Node, changes: &NodeEditChanges) -> Result<()> {
    let existing = ctx
        .runtime()
        .get_node(&node.name)
        .await
        .with_context(|| format!("failed to get node '{}'", node.name))?;

    if existing.role != Role::LoadBalancer {
        return Err(Error::InvalidConfig(format!(
            "node '{}' is a {}; currently only the loadbalancer can be edited",
            existing.name, existing.role
        )));
    }

    let mut result = existing.clone();
    result.state = NodeState::default();
    result.hooks = Vec::new();

    if changes.ports.is_empty() {
        return Ok(());
    }

    let mut cluster = repository::cluster_of(ctx, &existing).await?;
    let targets: Vec<Node> = cluster.servers().cloned().collect();
    let Some(lb) = cluster.loadbalancer.as_mut() else {
        return Err(Error::InvalidConfig(format!(
            "cluster '{}' has no loadbalancer",
            cluster.name
        )));
    };

    for port in changes.ports.iter() {
        if !result.ports.contains(port) {
            result.ports.push(port.clone());
        }
        lb.add_port_configs(port, &targets)?;
    }

    result.hooks.push(NodeHook::pre_start(Action::WriteFile {
        path: LB_CONFIG_PATH.to_string(),
        content: lb.config.to_yaml()?.into_bytes(),
        mode: 0o744,
        description: "Write Loadbalancer Configuration".to_string(),
    }));

    replace(ctx, &existing, &mut result).await
}

/// Strip what must not be copied from a node used as template for `role`.
fn sanitize_template(mut template: Node, role: Role) -> Node {
    if template.role != role {
        template.memory = None;
        template.runtime_labels.remove(labels::NODE_MEMORY);
    }

    template
        .volumes
        .retain(|v| !memory::DO_NOT_COPY_VOLUME_SUFFIXES.iter().any(|s| v.ends_with(s)));

    template.ports.clear();
    template.cmd.retain(|c| c != CLUSTER_INIT_FLAG);
    template.args.retain(|a| a != CLUSTER_INIT_FLAG);
    template.runtime_labels.remove(labels::SERVER_IS_INIT);
    template.server_opts.is_init = false;

    template.ip = None;
    template.runtime_labels.remove(labels::NODE_STATIC_IP);

    template.hooks = Vec::new();
    template.state = NodeState::default();
    template
}

/// Lay the fields set on `overlay` over `template`.
fn merge_nodes(template: Node, overlay: Node) -> Node {
    let Node {
        name,
        role,
        image,
        cmd,
        args,
        env,
        volumes,
        ports,
        networks,
        ip,
        restart,
        memory,
        runtime_labels,
        hooks,
        server_opts,
        state: _,
    } = overlay;

    let mut merged = template;
    merged.name = name;
    merged.role = role;
    if !image.is_empty() {
        merged.image = image;
    }
    if !cmd.is_empty() {
        merged.cmd = cmd;
    }
    for arg in args {
        merged.args.push(arg);
    }
    for entry in env {
        match entry.split_once('=') {
            Some((key, value)) => merged.set_env(key, value),
            None => merged.env.push(entry),
        }
    }
    for volume in volumes {
        if !merged.volumes.contains(&volume) {
            merged.volumes.push(volume);
        }
    }
    if !ports.is_empty() {
        merged.ports = ports;
    }
    if !networks.is_empty() {
        merged.networks = networks;
    }
    if ip.is_some() {
        merged.ip = ip;
    }
    merged.restart |= restart;
    if memory.is_some() {
        merged.memory = memory;
    }
    merged.runtime_labels.extend(runtime_labels);
    merged.hooks.extend(hooks);
    if server_opts.is_init {
        merged.server_opts.is_init = true;
    }
    if server_opts.kube_api.is_some() {
        merged.server_opts.kube_api = server_opts.kube_api;
    }
    merged.state = NodeState::default();
    merged
}

fn url_host(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split([':', '/']).next().filter(|h| !h.is_empty())
}

/// The URL `node` should use to join `cluster`: its current one if that still points at a live
/// node, else the load balancer, else any live server.
fn join_url(node: &Node, cluster: &Cluster) -> Result<String> {
    let is_live = |name: &str| {
        cluster
            .nodes
            .iter()
            .any(|n| n.name == name && n.state.running && n.name != node.name)
    };

    if let Some(current) = node.env_var(CLUSTER_URL_ENV) {
        if url_host(current).is_some_and(is_live) {
            return Ok(current.to_string());
        }
        debug!("Join URL {current} of node {} is stale", node.name);
    }

    let target = cluster
        .loadbalancer
        .as_ref()
        .map(|lb| lb.node.name.clone())
        .or_else(|| {
            cluster
                .servers()
                .find(|s| s.state.running && s.name != node.name)
                .map(|s| s.name.clone())
        })
        .ok_or_else(|| {
            Error::InvalidConfig(format!(
                "cluster '{}' has no running server for node '{}' to join",
                cluster.name, node.name
            ))
        })?;

    Ok(format!("https://{target}:{}", crate::DEFAULT_API_PORT))
}

/// Create and start `node` as a new member of `cluster`, copying the configuration of a
/// similar member.
pub async fn add_to_cluster(ctx: &Context, node: &mut Node, cluster: &Cluster, opts: &NodeCreateOpts) -> Result<()> {
    let mut cluster = ctx
        .repository()
        .get_by_name(&cluster.name)
        .await
        .with_context(|| format!("failed to get cluster '{}'", cluster.name))?;

    let template = match cluster.nodes_by_role(node.role).next() {
        Some(sibling) => sibling.clone(),
        None => {
            debug!(
                "No node with role {} in cluster {}, using any other node as template",
                node.role, cluster.name
            );
            node.cmd = node.role.default_cmd();
            cluster
                .nodes
                .iter()
                .find(|n| n.role != Role::LoadBalancer && n.role != Role::NoRole)
                .cloned()
                .ok_or_else(|| {
                    Error::InvalidConfig(format!("cluster '{}' has no node to copy from", cluster.name))
                })?
        }
    };

    let template = ctx
        .runtime()
        .get_node(&template.name)
        .await
        .with_context(|| format!("failed to get template node '{}'", template.name))?;
    debug!("Using node {} as template for {}", template.name, node.name);

    let role = node.role;
    let template_role = template.role;
    let mut overlay = std::mem::take(node);
    overlay.networks = vec![cluster.network.name.clone()];
    let mut merged = merge_nodes(sanitize_template(template, role), overlay);
    if template_role != role {
        merged.cmd = role.default_cmd();
    }
    merged
        .runtime_labels
        .insert(labels::CLUSTER_NAME.to_string(), cluster.name.clone());
    *node = merged;

    if role.is_k3s() {
        let url = join_url(node, &cluster)?;
        node.set_env(CLUSTER_URL_ENV, &url);
        node.runtime_labels
            .insert(labels::CLUSTER_URL.to_string(), url);
    }

    if cluster.network.ipam.managed && node.ip.is_none() {
        let ip = ipam::get_ip(ctx, &cluster.network).await?;
        cluster.network.ipam.ips_used.push(ip);
        node.ip = Some(ip);
    }

    let mut hooks = opts.hooks.clone();
    if !node.is_host_network() && !cluster.network.is_host() {
        let host_ip = match &opts.env_info {
            Some(env) => env.host_gateway,
            None => ctx.runtime().get_host_ip(&cluster.network.name).await.ok(),
        };
        match host_ip {
            Some(ip) => hooks.push(host_alias_hook(ip)),
            None => warn!("Could not determine host IP, not adding {HOST_RECORD} to node {}", node.name),
        }
    }

    let start_opts = NodeStartOpts {
        wait: opts.wait,
        timeout: opts.timeout,
        hooks,
        intent: Intent::NodeCreate,
    };
    ctx.run_with_timeout(opts.timeout, async {
        create(ctx, node, opts).await?;
        start(ctx, node, &start_opts).await
    })
    .await?;

    if role == Role::Server && cluster.loadbalancer.is_some() {
        match loadbalancer::update(ctx, &cluster).await {
            Err(e) if e.is_lb_host_not_found() => {
                warn!("Loadbalancer of cluster {} references a node that is down", cluster.name)
            }
            Err(e) if e.is_lb_failed_test() => warn!(
                "Loadbalancer of cluster {} did not confirm its new configuration: {e}",
                cluster.name
            ),
            res => res.with_context(|| {
                format!("failed to update loadbalancer of cluster '{}'", cluster.name)
            })?,
        }
    }

    Ok(())
}

/// A PostStart hook making the host reachable as `host.k3d.internal`.
pub fn host_alias_hook(host_ip: std::net::IpAddr) -> NodeHook {
    NodeHook::post_start(Action::RewriteFile {
        path: "/etc/hosts".to_string(),
        rewrite: RewriteFn::append_line(format!("{host_ip} {HOST_RECORD}")),
        mode: 0o644,
        overwrite_in_place: true,
        description: format!("Inject /etc/hosts record for {HOST_RECORD}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{KubeApi, ServerOpts};

    #[test]
    fn server_patches() {
        let mut node = Node::new("k3d-dev-server-0", Role::Server);
        node.server_opts = ServerOpts {
            is_init: true,
            kube_api: Some(KubeApi {
                host: "dev.example.com".to_string(),
                host_ip: "0.0.0.0".to_string(),
                host_port: 6550,
            }),
        };

        patch_role(&mut node);
        patch_role(&mut node);

        assert_eq!(node.cmd, vec!["server"]);
        assert_eq!(
            node.args,
            vec!["--cluster-init", "--tls-san", "dev.example.com"]
        );
        assert_eq!(node.label(labels::SERVER_API_PORT), Some("6550"));
        assert_eq!(node.label(labels::ROLE), Some("server"));
        assert_eq!(node.label(labels::APP), Some("k3d"));
    }

    #[test]
    fn template_is_sanitized() {
        let mut template = Node::new("k3d-dev-server-0", Role::Server);
        template.cmd = vec!["server".to_string()];
        template.args = vec!["--cluster-init".to_string(), "--disable=traefik".to_string()];
        template.memory = Some("1g".to_string());
        template.volumes = vec![
            "/home/me/.config/k3ctl/.k3d-dev-server-0/meminfo:/proc/meminfo:ro".to_string(),
            "k3d-dev-images:/k3d/images".to_string(),
        ];
        template.ports = vec!["6443".parse().unwrap()];
        template.ip = Some("172.28.0.2".parse().unwrap());
        template.set_env("K3S_TOKEN", "secret");

        let mut overlay = Node::new("k3d-dev-agent-3", Role::Agent);
        overlay.env = vec!["FOO=bar".to_string()];
        overlay.cmd = Role::Agent.default_cmd();

        let merged = merge_nodes(sanitize_template(template, Role::Agent), overlay);
        assert_eq!(merged.name, "k3d-dev-agent-3");
        assert_eq!(merged.cmd, vec!["agent"]);
        assert_eq!(merged.args, vec!["--disable=traefik"]);
        assert_eq!(merged.memory, None);
        assert_eq!(merged.volumes, vec!["k3d-dev-images:/k3d/images"]);
        assert!(merged.ports.is_empty());
        assert_eq!(merged.ip, None);
        assert_eq!(merged.env_var("K3S_TOKEN"), Some("secret"));
        assert_eq!(merged.env_var("FOO"), Some("bar"));
    }

    #[test]
    fn join_urls() {
        let mut cluster = Cluster::new("dev");
        let mut server = Node::new("k3d-dev-server-0", Role::Server);
        server.state.running = true;
        cluster.nodes.push(server);

        let mut node = Node::new("k3d-dev-agent-1", Role::Agent);
        assert_eq!(
            join_url(&node, &cluster).unwrap(),
            "https://k3d-dev-server-0:6443"
        );

        node.set_env(CLUSTER_URL_ENV, "https://k3d-dev-server-0:6443");
        assert_eq!(
            join_url(&node, &cluster).unwrap(),
            "https://k3d-dev-server-0:6443"
        );

        node.set_env(CLUSTER_URL_ENV, "https://k3d-dev-server-9:6443");
        cluster.loadbalancer = Some(crate::loadbalancer::Loadbalancer::new(Node::new(
            "k3d-dev-serverlb",
            Role::LoadBalancer,
        )));
        assert_eq!(
            join_url(&node, &cluster).unwrap(),
            "https://k3d-dev-serverlb:6443"
        );

        assert_eq!(url_host("https://k3d-dev-serverlb:6443"), Some("k3d-dev-serverlb"));
        assert_eq!(url_host("k3d-dev-server-0"), Some("k3d-dev-server-0"));
    }
}
