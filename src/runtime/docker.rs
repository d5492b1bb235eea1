// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! A `Runtime` driving the `docker` command line client.

use std::{
    collections::HashMap,
    net::IpAddr,
    path::{Path, PathBuf},
    process::Stdio,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Datelike, SecondsFormat, Utc},
    log::{debug, trace},
    serde::Deserialize,
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
        process::Command,
        sync::mpsc,
    },
};

use crate::{
    cluster::{ClusterNetwork, Ipam},
    labels,
    node::{KubeApi, Node, NodeState, PortBinding, Role, ServerOpts},
    runtime::{log_reader_from_channel, ImageStream, LogReader, Runtime, RuntimeError, RuntimeInfo},
};

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

impl DockerCli {
    pub fn new() -> Self {
        DockerCli {
            binary: crate::default_docker_binary(),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        trace!("Running {} {}", self.binary, args.join(" "));
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Run `docker <args>` to completion and return its stdout. A failure that mentions a missing
    /// object is reported as `NotFound` for the `object` (kind, name) the command acted on.
    async fn run(
        &self,
        args: Vec<String>,
        stdin: Option<Vec<u8>>,
        object: (&'static str, &str),
    ) -> Result<Vec<u8>, RuntimeError> {
        let mut command = self.command(&args);
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let lowered = stderr.to_lowercase();
        if lowered.contains("no such") || lowered.contains("not found") {
            return Err(RuntimeError::NotFound {
                kind: object.0,
                name: object.1.to_string(),
            });
        }
        if lowered.contains("already in use") || lowered.contains("already exists") {
            return Err(RuntimeError::AlreadyExists {
                kind: object.0,
                name: object.1.to_string(),
            });
        }
        Err(RuntimeError::Command {
            command: format!("{} {}", self.binary, args.join(" ")),
            stderr,
        })
    }

    async fn inspect(&self, names: &[String]) -> Result<Vec<ContainerInspect>, RuntimeError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = strings(["inspect", "--type", "container"]);
        args.extend(names.iter().cloned());
        let output = self.run(args, None, ("node", &names.join(", "))).await?;
        serde_json::from_slice(&output).map_err(|e| RuntimeError::Parse(e.to_string()))
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkInspect, RuntimeError> {
        let output = self
            .run(strings(["network", "inspect", name]), None, ("network", name))
            .await?;
        let networks: Vec<NetworkInspect> =
            serde_json::from_slice(&output).map_err(|e| RuntimeError::Parse(e.to_string()))?;
        networks
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "network",
                name: name.to_string(),
            })
    }

    fn create_args(node: &Node) -> Vec<String> {
        let mut args = strings(["create", "--name", node.name.as_str(), "--hostname", node.name.as_str()]);

        let mut labels: Vec<_> = node.runtime_labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for env in node.env.iter() {
            args.push("--env".to_string());
            args.push(env.clone());
        }
        for volume in node.volumes.iter() {
            args.push("--volume".to_string());
            args.push(volume.clone());
        }
        for port in node.ports.iter() {
            args.push("--publish".to_string());
            args.push(port.to_string());
        }
        if let Some(network) = node.networks.first() {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(ip) = node.ip {
            args.push("--ip".to_string());
            args.push(ip.to_string());
        }
        if node.restart {
            args.push("--restart".to_string());
            args.push("unless-stopped".to_string());
        }
        if let Some(memory) = &node.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        if node.role.is_k3s() {
            args.push("--privileged".to_string());
            for tmpfs in ["/run", "/var/run"] {
                args.push("--tmpfs".to_string());
                args.push(tmpfs.to_string());
            }
        }

        args.push(node.image.clone());
        args.extend(node.cmd.iter().cloned());
        args.extend(node.args.iter().cloned());
        args
    }

    /// A scratch directory on the host for moving files in and out of containers.
    async fn scratch_dir(&self) -> Result<PathBuf, RuntimeError> {
        let dir = std::env::temp_dir().join(format!(
            "k3ctl-{}",
            crate::cluster::random_string(10).to_lowercase()
        ));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

fn remove_scratch(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        debug!("Could not remove scratch directory {}: {e}", dir.display());
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    name: String,
    state: InspectState,
    config: InspectConfig,
    host_config: InspectHostConfig,
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
    status: String,
    started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    cmd: Option<Vec<String>>,
    env: Option<Vec<String>>,
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    binds: Option<Vec<String>>,
    port_bindings: Option<HashMap<String, Option<Vec<InspectHostPort>>>>,
    restart_policy: Option<InspectRestartPolicy>,
}

#[derive(Debug, Deserialize)]
struct InspectHostPort {
    #[serde(rename = "HostIp", default)]
    host_ip: String,
    #[serde(rename = "HostPort", default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRestartPolicy {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    networks: Option<HashMap<String, InspectEndpoint>>,
}

#[derive(Debug, Deserialize)]
struct InspectEndpoint {
    #[serde(rename = "IPAMConfig")]
    ipam_config: Option<InspectIpamConfig>,
}

#[derive(Debug, Deserialize)]
struct InspectIpamConfig {
    #[serde(rename = "IPv4Address", default)]
    ipv4_address: String,
}

impl ContainerInspect {
    fn into_node(self) -> Node {
        let container_labels = self.config.labels.unwrap_or_default();
        let label = |key: &str| container_labels.get(key).cloned();

        let role = label(labels::ROLE)
            .and_then(|r| r.parse().ok())
            .unwrap_or(Role::NoRole);

        let mut command = self.config.cmd.unwrap_or_default().into_iter();
        let cmd: Vec<String> = command.next().into_iter().collect();
        let args: Vec<String> = command.collect();

        let mut ports = Vec::new();
        for (key, bindings) in self.host_config.port_bindings.unwrap_or_default() {
            let (port, protocol) = key.split_once('/').unwrap_or((&key, "tcp"));
            let Ok(container_port) = port.parse() else {
                continue;
            };
            for binding in bindings.unwrap_or_default() {
                ports.push(PortBinding {
                    host_ip: binding.host_ip,
                    host_port: binding.host_port.parse().ok(),
                    container_port,
                    protocol: protocol.to_string(),
                });
            }
        }
        ports.sort();

        let networks = self.network_settings.networks.unwrap_or_default();
        let ip = networks
            .values()
            .filter_map(|endpoint| endpoint.ipam_config.as_ref())
            .find_map(|ipam| ipam.ipv4_address.parse::<IpAddr>().ok());
        let mut networks: Vec<String> = networks.into_keys().collect();
        networks.sort();
        if let Some(primary) = label(labels::NETWORK) {
            if let Some(pos) = networks.iter().position(|n| *n == primary) {
                let primary = networks.remove(pos);
                networks.insert(0, primary);
            }
        }

        let server_opts = match role {
            Role::Server => ServerOpts {
                is_init: label(labels::SERVER_IS_INIT).as_deref() == Some("true"),
                kube_api: label(labels::SERVER_API_HOST).map(|host| KubeApi {
                    host,
                    host_ip: label(labels::SERVER_API_HOST_IP).unwrap_or_default(),
                    host_port: label(labels::SERVER_API_PORT)
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(0),
                }),
            },
            _ => ServerOpts::default(),
        };

        // Docker reports the zero time for containers that never ran.
        let started = self
            .state
            .started_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
            .filter(|t| t.year() > 1);

        Node {
            name: self.name.trim_start_matches('/').to_string(),
            role,
            image: self.config.image,
            cmd,
            args,
            env: self.config.env.unwrap_or_default(),
            volumes: self.host_config.binds.unwrap_or_default(),
            ports,
            networks,
            ip,
            restart: self
                .host_config
                .restart_policy
                .is_some_and(|p| !p.name.is_empty() && p.name != "no"),
            memory: label(labels::NODE_MEMORY),
            runtime_labels: container_labels,
            hooks: Vec::new(),
            server_opts,
            state: NodeState {
                running: self.state.running,
                status: self.state.status,
                started,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInspect {
    name: String,
    id: String,
    #[serde(rename = "IPAM")]
    ipam: Option<NetworkIpam>,
    containers: Option<HashMap<String, NetworkContainer>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkIpam {
    config: Option<Vec<NetworkIpamConfig>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkIpamConfig {
    #[serde(default)]
    subnet: String,
    #[serde(default)]
    gateway: String,
}

#[derive(Debug, Deserialize)]
struct NetworkContainer {
    #[serde(rename = "IPv4Address", default)]
    ipv4_address: String,
}

impl NetworkInspect {
    fn gateway(&self) -> Option<IpAddr> {
        self.ipam
            .as_ref()?
            .config
            .as_ref()?
            .iter()
            .find_map(|c| c.gateway.parse().ok())
    }

    fn into_network(self) -> ClusterNetwork {
        let gateway = self.gateway();
        let prefix = self
            .ipam
            .and_then(|ipam| ipam.config)
            .unwrap_or_default()
            .into_iter()
            .find_map(|c| c.subnet.parse().ok());

        let ips_used = gateway
            .into_iter()
            .chain(
                self.containers
                    .unwrap_or_default()
                    .into_values()
                    .filter_map(|c| c.ipv4_address.split('/').next()?.parse().ok()),
            )
            .collect();

        ClusterNetwork {
            name: self.name,
            id: self.id,
            external: false,
            ipam: Ipam {
                prefix,
                managed: false,
                ips_used,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DockerInfo {
    server_version: String,
    #[serde(rename = "OSType")]
    os_type: String,
    cgroup_version: String,
    cgroup_driver: String,
}

/// Send every line of `reader` to `tx` until either side is done.
fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

#[async_trait]
impl Runtime for DockerCli {
    fn name(&self) -> &str {
        "docker"
    }

    fn socket_path(&self) -> String {
        match std::env::var("DOCKER_HOST") {
            Ok(host) if host.starts_with("unix://") => host.trim_start_matches("unix://").to_string(),
            _ => "/var/run/docker.sock".to_string(),
        }
    }

    async fn info(&self) -> Result<RuntimeInfo, RuntimeError> {
        let output = self
            .run(strings(["info", "--format", "{{json .}}"]), None, ("runtime", "docker"))
            .await?;
        let info: DockerInfo =
            serde_json::from_slice(&output).map_err(|e| RuntimeError::Parse(e.to_string()))?;
        Ok(RuntimeInfo {
            name: "docker".to_string(),
            version: info.server_version,
            os_type: info.os_type,
            cgroup_version: info.cgroup_version,
            cgroup_driver: info.cgroup_driver,
            native_memory_limits: false,
        })
    }

    async fn create_node(&self, node: &Node) -> Result<(), RuntimeError> {
        self.run(Self::create_args(node), None, ("node", &node.name))
            .await?;
        for network in node.networks.iter().skip(1) {
            self.connect_node_to_network(node, network).await?;
        }
        debug!("Created container {}", node.name);
        Ok(())
    }

    async fn start_node(&self, node: &Node) -> Result<(), RuntimeError> {
        self.run(strings(["start", node.name.as_str()]), None, ("node", &node.name))
            .await
            .map(|_| ())
    }

    async fn stop_node(&self, node: &Node) -> Result<(), RuntimeError> {
        self.run(strings(["stop", node.name.as_str()]), None, ("node", &node.name))
            .await
            .map(|_| ())
    }

    async fn rename_node(&self, node: &Node, new_name: &str) -> Result<(), RuntimeError> {
        self.run(
            strings(["rename", node.name.as_str(), new_name]),
            None,
            ("node", &node.name),
        )
        .await
        .map(|_| ())
    }

    async fn delete_node(&self, node: &Node) -> Result<(), RuntimeError> {
        self.run(
            strings(["rm", "--force", "--volumes", node.name.as_str()]),
            None,
            ("node", &node.name),
        )
        .await
        .map(|_| ())
    }

    async fn get_node(&self, name: &str) -> Result<Node, RuntimeError> {
        self.inspect(&[name.to_string()])
            .await?
            .into_iter()
            .next()
            .map(ContainerInspect::into_node)
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "node",
                name: name.to_string(),
            })
    }

    async fn get_nodes_by_label(
        &self,
        filter: &HashMap<String, String>,
    ) -> Result<Vec<Node>, RuntimeError> {
        let mut args = strings(["ps", "--all", "--format", "{{.Names}}"]);
        for (key, value) in filter {
            args.push("--filter".to_string());
            args.push(format!("label={key}={value}"));
        }
        let output = self.run(args, None, ("node", "*")).await?;
        let names: Vec<String> = String::from_utf8_lossy(&output)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        Ok(self
            .inspect(&names)
            .await?
            .into_iter()
            .map(ContainerInspect::into_node)
            .collect())
    }

    async fn node_status(&self, node: &Node) -> Result<(bool, String), RuntimeError> {
        let current = self.get_node(&node.name).await?;
        Ok((current.state.running, current.state.status))
    }

    async fn exec_in_node(
        &self,
        node: &Node,
        cmd: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<String, RuntimeError> {
        let mut args = vec!["exec".to_string()];
        if stdin.is_some() {
            args.push("--interactive".to_string());
        }
        args.push(node.name.clone());
        args.extend(cmd.iter().cloned());

        let mut command = self.command(&args);
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = command.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            return Ok(combined);
        }
        if combined.to_lowercase().contains("no such container") {
            return Err(RuntimeError::NotFound {
                kind: "node",
                name: node.name.clone(),
            });
        }
        Err(RuntimeError::Exec {
            node: node.name.clone(),
            command: cmd.join(" "),
            exit_code: output.status.code().unwrap_or(-1),
            output: combined.trim().to_string(),
        })
    }

    async fn read_from_node(&self, node: &Node, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let dir = self.scratch_dir().await?;
        let target = dir.join("content");
        let res = self
            .run(
                vec![
                    "cp".to_string(),
                    format!("{}:{path}", node.name),
                    target.display().to_string(),
                ],
                None,
                ("file", path),
            )
            .await;
        let content = match res {
            Ok(_) => tokio::fs::read(&target).await.map_err(RuntimeError::from),
            Err(e) => Err(e),
        };
        remove_scratch(&dir);
        content
    }

    async fn write_to_node(
        &self,
        node: &Node,
        content: &[u8],
        path: &str,
        mode: u32,
    ) -> Result<(), RuntimeError> {
        use std::os::unix::fs::PermissionsExt;

        // The file is staged in a directory tree mirroring its destination, so that missing
        // parent directories get created in the container as well.
        let dir = self.scratch_dir().await?;
        let staged = dir.join(path.trim_start_matches('/'));

        let res = async {
            if let Some(parent) = staged.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&staged, content).await?;
            tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(mode)).await?;

            self.run(
                vec![
                    "cp".to_string(),
                    format!("{}/.", dir.display()),
                    format!("{}:/", node.name),
                ],
                None,
                ("node", &node.name),
            )
            .await
            .map(|_| ())
        }
        .await;

        remove_scratch(&dir);
        res
    }

    async fn get_node_logs(
        &self,
        node: &Node,
        since: DateTime<Utc>,
    ) -> Result<LogReader, RuntimeError> {
        let args = vec![
            "logs".to_string(),
            "--follow".to_string(),
            "--since".to_string(),
            since.to_rfc3339_opts(SecondsFormat::Nanos, true),
            node.name.clone(),
        ];
        let mut child = self.command(&args).stdin(Stdio::null()).spawn()?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }

        // Stop following once the reader is dropped.
        let name = node.name.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    if let Err(e) = child.kill().await {
                        debug!("Could not stop following logs of {name}: {e}");
                    }
                }
                _ = child.wait() => {}
            }
        });

        Ok(log_reader_from_channel(rx))
    }

    async fn create_network_if_not_present(
        &self,
        network: &ClusterNetwork,
        labels: &HashMap<String, String>,
    ) -> Result<(ClusterNetwork, bool), RuntimeError> {
        match self.inspect_network(&network.name).await {
            Ok(existing) => return Ok((existing.into_network(), true)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut args = strings(["network", "create"]);
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some(prefix) = network.ipam.prefix {
            args.push("--subnet".to_string());
            args.push(prefix.to_string());
        }
        args.push(network.name.clone());
        self.run(args, None, ("network", &network.name)).await?;

        let created = self.inspect_network(&network.name).await?;
        Ok((created.into_network(), false))
    }

    async fn get_network(&self, name: &str) -> Result<ClusterNetwork, RuntimeError> {
        Ok(self.inspect_network(name).await?.into_network())
    }

    async fn delete_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(strings(["network", "rm", name]), None, ("network", name))
            .await
            .map(|_| ())
    }

    async fn connect_node_to_network(&self, node: &Node, network: &str) -> Result<(), RuntimeError> {
        self.run(
            strings(["network", "connect", network, node.name.as_str()]),
            None,
            ("network", network),
        )
        .await
        .map(|_| ())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut args = strings(["volume", "create"]);
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(name.to_string());
        self.run(args, None, ("volume", name)).await.map(|_| ())
    }

    async fn get_volume(&self, name: &str) -> Result<String, RuntimeError> {
        let output = self
            .run(
                strings(["volume", "inspect", "--format", "{{.Name}}", name]),
                None,
                ("volume", name),
            )
            .await?;
        Ok(String::from_utf8_lossy(&output).trim().to_string())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(strings(["volume", "rm", name]), None, ("volume", name))
            .await
            .map(|_| ())
    }

    async fn export_images(&self, images: &[String]) -> Result<ImageStream, RuntimeError> {
        let mut args = vec!["save".to_string()];
        args.extend(images.iter().cloned());

        let mut command = self.command(&args);
        command.stdin(Stdio::null()).kill_on_drop(false);
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Other("no stdout from docker save".to_string()))?;

        tokio::spawn(async move {
            match child.wait_with_output().await {
                Ok(output) if !output.status.success() => debug!(
                    "docker save failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Ok(_) => {}
                Err(e) => debug!("docker save failed: {e}"),
            }
        });

        Ok(Box::pin(stdout))
    }

    async fn get_host_ip(&self, network: &str) -> Result<IpAddr, RuntimeError> {
        self.inspect_network(network)
            .await?
            .gateway()
            .ok_or_else(|| RuntimeError::Other(format!("network '{network}' has no gateway")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT: &str = r#"[{
        "Name": "/k3d-dev-server-0",
        "State": {"Running": true, "Status": "running", "StartedAt": "2025-03-01T10:00:00.123456789Z"},
        "Config": {
            "Image": "docker.io/rancher/k3s:v1.31.5-k3s1",
            "Cmd": ["server", "--tls-san", "0.0.0.0"],
            "Env": ["K3S_TOKEN=secret"],
            "Labels": {
                "app": "k3d",
                "k3d.role": "server",
                "k3d.cluster": "dev",
                "k3d.cluster.network": "k3d-dev",
                "k3d.server.api.host": "0.0.0.0",
                "k3d.server.api.port": "6550"
            }
        },
        "HostConfig": {
            "Binds": ["k3d-dev-images:/k3d/images"],
            "PortBindings": {"6443/tcp": [{"HostIp": "0.0.0.0", "HostPort": "6550"}]},
            "RestartPolicy": {"Name": "unless-stopped"}
        },
        "NetworkSettings": {"Networks": {
            "bridge": {"IPAMConfig": null},
            "k3d-dev": {"IPAMConfig": {"IPv4Address": "172.28.0.2"}}
        }}
    }]"#;

    #[test]
    fn node_from_inspect() {
        let inspect: Vec<ContainerInspect> = serde_json::from_str(INSPECT).unwrap();
        let node = inspect.into_iter().next().unwrap().into_node();

        assert_eq!(node.name, "k3d-dev-server-0");
        assert_eq!(node.role, Role::Server);
        assert_eq!(node.cmd, vec!["server"]);
        assert_eq!(node.args, vec!["--tls-san", "0.0.0.0"]);
        assert_eq!(node.networks, vec!["k3d-dev", "bridge"]);
        assert_eq!(node.ip, Some("172.28.0.2".parse().unwrap()));
        assert_eq!(node.ports, vec!["0.0.0.0:6550:6443/tcp".parse().unwrap()]);
        assert!(node.restart);
        assert_eq!(node.server_opts.kube_api.unwrap().host_port, 6550);
        assert_eq!(
            node.state.started.unwrap().to_rfc3339_opts(SecondsFormat::Secs, true),
            "2025-03-01T10:00:00Z"
        );
    }

    #[test]
    fn never_started() {
        let json = INSPECT.replace("2025-03-01T10:00:00.123456789Z", "0001-01-01T00:00:00Z");
        let inspect: Vec<ContainerInspect> = serde_json::from_str(&json).unwrap();
        assert_eq!(inspect.into_iter().next().unwrap().into_node().state.started, None);
    }

    #[test]
    fn create_arguments() {
        let mut node = Node::new("k3d-dev-agent-0", Role::Agent);
        node.image = "rancher/k3s".to_string();
        node.cmd = vec!["agent".to_string()];
        node.networks = vec!["k3d-dev".to_string()];
        node.ports = vec!["8080:80".parse().unwrap()];
        node.restart = true;

        let args = DockerCli::create_args(&node);
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name k3d-dev-agent-0 --hostname k3d-dev-agent-0"));
        assert!(joined.contains("--publish 8080:80/tcp"));
        assert!(joined.contains("--network k3d-dev"));
        assert!(joined.contains("--restart unless-stopped"));
        assert!(joined.contains("--privileged"));
        assert!(joined.ends_with("rancher/k3s agent"));
    }

    #[test]
    fn network_from_inspect() {
        let json = r#"[{
            "Name": "k3d-dev",
            "Id": "abc123",
            "IPAM": {"Config": [{"Subnet": "172.28.0.0/16", "Gateway": "172.28.0.1"}]},
            "Containers": {"x": {"IPv4Address": "172.28.0.2/16"}}
        }]"#;
        let inspect: Vec<NetworkInspect> = serde_json::from_str(json).unwrap();
        let inspect = inspect.into_iter().next().unwrap();
        assert_eq!(inspect.gateway(), Some("172.28.0.1".parse().unwrap()));

        let network = inspect.into_network();
        assert_eq!(network.id, "abc123");
        assert_eq!(network.ipam.prefix, Some("172.28.0.0/16".parse().unwrap()));
        assert_eq!(
            network.ipam.ips_used,
            vec![
                "172.28.0.1".parse::<IpAddr>().unwrap(),
                "172.28.0.2".parse().unwrap()
            ]
        );
    }
}
