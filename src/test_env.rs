// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    io,
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    cidr::IpCidr,
    tokio::sync::mpsc,
};

use crate::{
    cluster::{ClusterNetwork, Ipam},
    context::{Context, Timeouts},
    labels,
    loadbalancer::{LoadbalancerConfig, LB_CONFIG_PATH},
    node::{ready_log_message, Intent, Node, NodeState, Role},
    runtime::{log_reader_from_channel, ImageStream, LogReader, Runtime, RuntimeError, RuntimeInfo},
};

/// Given a relative `path` in the test directory, prepend the
/// full path to the test directory.
fn test_path(path: &str) -> String {
    std::env::var("CARGO_MANIFEST_DIR").unwrap() + "/tests/" + path
}

trait IgnoreEexist {
    fn ignore_eexist(self) -> Self;
}

impl IgnoreEexist for io::Result<()> {
    fn ignore_eexist(self) -> Self {
        match self {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A TestEnvironment holds everything a test needs to drive the orchestration core against a
/// `FakeRuntime`: the runtime itself, and a "private" working directory that is used as the
/// state directory for generated node files.
pub struct TestEnvironment {
    pub runtime: Arc<FakeRuntime>,
    private_dir_path: String,
}

impl TestEnvironment {
    /// Set up an environment for a test named `test_id`.
    ///
    /// The test's private directory is emptied first, so that files from a previous run don't
    /// impact this one.
    pub fn new(test_id: &str) -> Self {
        let private_dir_path = test_path(&format!("test_output/{test_id}"));
        match std::fs::remove_dir_all(&private_dir_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => panic!("Could not clean up test directory: {e}"),
        };

        std::fs::create_dir(test_path("test_output"))
            .ignore_eexist()
            .unwrap();
        std::fs::create_dir(&private_dir_path).unwrap();

        Self {
            runtime: Arc::new(FakeRuntime::new()),
            private_dir_path,
        }
    }

    /// A context on this environment's runtime, with timeouts short enough for tests.
    pub fn context(&self) -> Context {
        let mut ctx = Context::new(self.runtime.clone())
            .with_timeouts(fast_timeouts())
            .with_state_dir(self.private_dir_path.clone().into());
        ctx.backoff_limit = 3;
        ctx
    }
}

pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        lb_verify: Duration::from_millis(300),
        lb_debounce: Duration::from_millis(10),
        log_backoff: Duration::from_millis(10),
        restart_warn: Duration::from_millis(200),
        status_poll: Duration::from_millis(20),
        hook_retry: Duration::from_millis(10),
    }
}

#[derive(Debug, Default)]
struct FakeContainer {
    node: Node,
    files: HashMap<String, Vec<u8>>,
    logs: Vec<(DateTime<Utc>, String)>,
    followers: Vec<mpsc::UnboundedSender<String>>,
    execs: Vec<Vec<String>>,
}

impl FakeContainer {
    fn emit(&mut self, line: &str) {
        self.logs.push((Utc::now(), line.to_string()));
        self.followers.retain(|tx| tx.send(line.to_string()).is_ok());
    }

    fn set_state(&mut self, running: bool, status: &str) {
        self.node.state.running = running;
        self.node.state.status = status.to_string();
    }
}

#[derive(Debug)]
struct FakeNetwork {
    network: ClusterNetwork,
    gateway: IpAddr,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeMap<String, FakeNetwork>,
    volumes: BTreeMap<String, HashMap<String, String>>,
    /// (operation, object name) pairs that fail.
    failures: HashSet<(String, String)>,
    /// Log sessions handed out, one per `get_node_logs` call, before falling back to the
    /// container's real log.
    scripts: HashMap<String, VecDeque<Vec<String>>>,
    log_opens: HashMap<String, usize>,
    quiet: HashSet<String>,
    journal: Vec<String>,
    next_network: u8,
}

/// An in-memory container runtime.
///
/// Containers print the ready line of their role when started, and a load balancer reports on
/// every configuration written to it the way the real proxy does: "host not found in upstream"
/// if a referenced backend is missing or stopped, "start worker processes" otherwise.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

fn not_found(kind: &'static str, name: &str) -> RuntimeError {
    RuntimeError::NotFound {
        kind,
        name: name.to_string(),
    }
}

fn hosts_file(name: &str) -> Vec<u8> {
    format!("127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost\n172.17.0.2\t{name}\n").into_bytes()
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Record `op` on `name` and fail it if the test asked for that.
    fn check(state: &mut FakeState, op: &str, name: &str) -> Result<(), RuntimeError> {
        state.journal.push(format!("{op} {name}"));
        if state.failures.contains(&(op.to_string(), name.to_string())) {
            return Err(RuntimeError::Other(format!("injected failure: {op} {name}")));
        }
        Ok(())
    }

    /// Make every future `op` ("create", "start", "stop", "rename", "delete", "exec", "write",
    /// "logs") on `name` fail.
    pub fn fail_on(&self, op: &str, name: &str) {
        self.lock()
            .failures
            .insert((op.to_string(), name.to_string()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Hand out these log sessions, one per log stream opened on `name`. Each session ends
    /// after its last line.
    pub fn script_logs(&self, name: &str, sessions: Vec<Vec<&str>>) {
        self.lock().scripts.insert(
            name.to_string(),
            sessions
                .into_iter()
                .map(|lines| lines.into_iter().map(str::to_string).collect())
                .collect(),
        );
    }

    /// How many log streams were opened on `name`.
    pub fn log_opens(&self, name: &str) -> usize {
        self.lock().log_opens.get(name).copied().unwrap_or(0)
    }

    /// Keep `name` from printing its ready line when started, and from reporting on the
    /// configuration written to it.
    pub fn suppress_ready(&self, name: &str) {
        self.lock().quiet.insert(name.to_string());
    }

    pub fn emit(&self, name: &str, line: &str) {
        if let Some(container) = self.lock().containers.get_mut(name) {
            container.emit(line);
        }
    }

    pub fn set_status(&self, name: &str, running: bool, status: &str) {
        if let Some(container) = self.lock().containers.get_mut(name) {
            container.set_state(running, status);
        }
    }

    /// Every runtime call made so far, as "op name".
    pub fn calls(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn execs(&self, name: &str) -> Vec<Vec<String>> {
        self.lock()
            .containers
            .get(name)
            .map(|c| c.execs.clone())
            .unwrap_or_default()
    }

    pub fn file(&self, name: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .containers
            .get(name)
            .and_then(|c| c.files.get(path).cloned())
    }

    pub fn container_names(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn container(&self, name: &str) -> Option<Node> {
        self.lock().containers.get(name).map(|c| c.node.clone())
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains_key(name)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.lock().volumes.contains_key(name)
    }

    fn network_view(state: &FakeState, name: &str) -> Option<ClusterNetwork> {
        let net = state.networks.get(name)?;
        let mut network = net.network.clone();
        network.ipam.ips_used = std::iter::once(net.gateway)
            .chain(
                state
                    .containers
                    .values()
                    .filter(|c| c.node.networks.iter().any(|n| n == name))
                    .filter_map(|c| c.node.ip),
            )
            .collect();
        Some(network)
    }

    /// What the proxy would log after loading `content`.
    fn lb_verdict(state: &FakeState, content: &[u8]) -> &'static str {
        let Ok(config) = LoadbalancerConfig::from_yaml(content) else {
            return "[emerg] invalid configuration";
        };
        let healthy = config.ports.values().all(|backends| {
            !backends.is_empty()
                && backends.iter().all(|backend| {
                    state
                        .containers
                        .get(backend)
                        .is_some_and(|c| c.node.state.running)
                })
        });
        match healthy {
            true => "[notice] start worker processes",
            false => "[emerg] host not found in upstream \"k3d-backend:6443\"",
        }
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    fn socket_path(&self) -> String {
        "/var/run/docker.sock".to_string()
    }

    async fn info(&self) -> Result<RuntimeInfo, RuntimeError> {
        Ok(RuntimeInfo {
            name: "fake".to_string(),
            version: "0.0.0".to_string(),
            os_type: "linux".to_string(),
            cgroup_version: "2".to_string(),
            cgroup_driver: "systemd".to_string(),
            native_memory_limits: false,
        })
    }

    async fn create_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "create", &node.name)?;
        if state.containers.contains_key(&node.name) {
            return Err(RuntimeError::AlreadyExists {
                kind: "node",
                name: node.name.clone(),
            });
        }
        for network in node.networks.iter().filter(|n| *n != "host") {
            if !state.networks.contains_key(network) {
                return Err(not_found("network", network));
            }
        }

        let mut stored = node.clone();
        stored.hooks = Vec::new();
        stored.state = NodeState {
            running: false,
            status: "created".to_string(),
            started: None,
        };
        let files = HashMap::from([("/etc/hosts".to_string(), hosts_file(&node.name))]);
        state.containers.insert(
            node.name.clone(),
            FakeContainer {
                node: stored,
                files,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn start_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "start", &node.name)?;
        let quiet = state.quiet.contains(&node.name);
        let container = state
            .containers
            .get_mut(&node.name)
            .ok_or_else(|| not_found("node", &node.name))?;

        container.followers.clear();
        container.set_state(true, "running");
        container.node.state.started = Some(Utc::now());

        if !quiet {
            let role = container.node.role;
            let mut lines = Vec::new();
            for intent in [Intent::ClusterCreate, Intent::ClusterStart] {
                if let Some(line) = ready_log_message(role, intent) {
                    if !lines.contains(&line) {
                        lines.push(line);
                    }
                }
            }
            for line in lines {
                container.emit(line);
            }
        }
        Ok(())
    }

    async fn stop_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "stop", &node.name)?;
        let container = state
            .containers
            .get_mut(&node.name)
            .ok_or_else(|| not_found("node", &node.name))?;
        container.followers.clear();
        container.set_state(false, "exited");
        Ok(())
    }

    async fn rename_node(&self, node: &Node, new_name: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "rename", &node.name)?;
        if state.containers.contains_key(new_name) {
            return Err(RuntimeError::AlreadyExists {
                kind: "node",
                name: new_name.to_string(),
            });
        }
        let mut container = state
            .containers
            .remove(&node.name)
            .ok_or_else(|| not_found("node", &node.name))?;
        container.node.name = new_name.to_string();
        state.containers.insert(new_name.to_string(), container);
        Ok(())
    }

    async fn delete_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "delete", &node.name)?;
        state
            .containers
            .remove(&node.name)
            .map(|_| ())
            .ok_or_else(|| not_found("node", &node.name))
    }

    async fn get_node(&self, name: &str) -> Result<Node, RuntimeError> {
        self.lock()
            .containers
            .get(name)
            .map(|c| c.node.clone())
            .ok_or_else(|| not_found("node", name))
    }

    async fn get_nodes_by_label(
        &self,
        filter: &HashMap<String, String>,
    ) -> Result<Vec<Node>, RuntimeError> {
        Ok(self
            .lock()
            .containers
            .values()
            .filter(|c| labels::matches(&c.node.runtime_labels, filter))
            .map(|c| c.node.clone())
            .collect())
    }

    async fn node_status(&self, node: &Node) -> Result<(bool, String), RuntimeError> {
        self.lock()
            .containers
            .get(&node.name)
            .map(|c| (c.node.state.running, c.node.state.status.clone()))
            .ok_or_else(|| not_found("node", &node.name))
    }

    async fn exec_in_node(
        &self,
        node: &Node,
        cmd: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<String, RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "exec", &node.name)?;
        let container = state
            .containers
            .get_mut(&node.name)
            .ok_or_else(|| not_found("node", &node.name))?;
        container.execs.push(cmd.to_vec());

        if !container.node.state.running {
            return Err(RuntimeError::Exec {
                node: node.name.clone(),
                command: cmd.join(" "),
                exit_code: 1,
                output: "container is not running".to_string(),
            });
        }

        match cmd {
            [sh, c, script] if sh == "sh" && c == "-c" => {
                if let Some(path) = script.strip_prefix("cat > ") {
                    container
                        .files
                        .insert(path.to_string(), stdin.unwrap_or_default());
                }
            }
            [rm, f, path] if rm == "rm" && f == "-f" => {
                container.files.remove(path);
            }
            _ => {}
        }
        Ok(String::new())
    }

    async fn read_from_node(&self, node: &Node, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let state = self.lock();
        let container = state
            .containers
            .get(&node.name)
            .ok_or_else(|| not_found("node", &node.name))?;
        container
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found("file", path))
    }

    async fn write_to_node(
        &self,
        node: &Node,
        content: &[u8],
        path: &str,
        _mode: u32,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "write", &node.name)?;

        let verdict = Self::lb_verdict(&state, content);
        let quiet = state.quiet.contains(&node.name);
        let container = state
            .containers
            .get_mut(&node.name)
            .ok_or_else(|| not_found("node", &node.name))?;
        container.files.insert(path.to_string(), content.to_vec());

        // The proxy only reacts to config changes while it runs.
        if container.node.role == Role::LoadBalancer
            && path == LB_CONFIG_PATH
            && container.node.state.running
            && !quiet
        {
            container.emit(verdict);
        }
        Ok(())
    }

    async fn get_node_logs(
        &self,
        node: &Node,
        since: DateTime<Utc>,
    ) -> Result<LogReader, RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "logs", &node.name)?;
        *state.log_opens.entry(node.name.clone()).or_default() += 1;

        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(session) = state
            .scripts
            .get_mut(&node.name)
            .and_then(|sessions| sessions.pop_front())
        {
            for line in session {
                let _ = tx.send(line);
            }
            return Ok(log_reader_from_channel(rx));
        }

        let container = state
            .containers
            .get_mut(&node.name)
            .ok_or_else(|| not_found("node", &node.name))?;
        for (_, line) in container.logs.iter().filter(|(at, _)| *at >= since) {
            let _ = tx.send(line.clone());
        }
        if container.node.state.running {
            container.followers.push(tx);
        }
        Ok(log_reader_from_channel(rx))
    }

    async fn create_network_if_not_present(
        &self,
        network: &ClusterNetwork,
        _labels: &HashMap<String, String>,
    ) -> Result<(ClusterNetwork, bool), RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "create-network", &network.name)?;
        if let Some(existing) = Self::network_view(&state, &network.name) {
            return Ok((existing, true));
        }

        state.next_network += 1;
        let index = state.next_network;
        let prefix = match network.ipam.prefix {
            Some(prefix) => prefix,
            None => format!("172.{}.0.0/16", 17 + index)
                .parse::<IpCidr>()
                .map_err(|e| RuntimeError::Parse(e.to_string()))?,
        };
        let gateway = crate::ipam::first_free(&prefix, &[])
            .ok_or_else(|| RuntimeError::Other(format!("subnet {prefix} is too small")))?;

        let created = ClusterNetwork {
            name: network.name.clone(),
            id: format!("fake-network-{index}"),
            external: false,
            ipam: Ipam {
                prefix: Some(prefix),
                managed: false,
                ips_used: Vec::new(),
            },
        };
        state.networks.insert(
            network.name.clone(),
            FakeNetwork {
                network: created,
                gateway,
            },
        );

        let view = Self::network_view(&state, &network.name)
            .ok_or_else(|| not_found("network", &network.name))?;
        Ok((view, false))
    }

    async fn get_network(&self, name: &str) -> Result<ClusterNetwork, RuntimeError> {
        Self::network_view(&self.lock(), name).ok_or_else(|| not_found("network", name))
    }

    async fn delete_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "delete-network", name)?;
        if !state.networks.contains_key(name) {
            return Err(not_found("network", name));
        }
        let attached = state
            .containers
            .values()
            .any(|c| c.node.networks.iter().any(|n| n == name));
        if attached {
            return Err(RuntimeError::Other(format!(
                "network {name} has active endpoints"
            )));
        }
        state.networks.remove(name);
        Ok(())
    }

    async fn connect_node_to_network(&self, node: &Node, network: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        if !state.networks.contains_key(network) {
            return Err(not_found("network", network));
        }
        let container = state
            .containers
            .get_mut(&node.name)
            .ok_or_else(|| not_found("node", &node.name))?;
        if !container.node.networks.iter().any(|n| n == network) {
            container.node.networks.push(network.to_string());
        }
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "create-volume", name)?;
        state
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| labels.clone());
        Ok(())
    }

    async fn get_volume(&self, name: &str) -> Result<String, RuntimeError> {
        match self.lock().volumes.contains_key(name) {
            true => Ok(name.to_string()),
            false => Err(not_found("volume", name)),
        }
    }

    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        Self::check(&mut state, "delete-volume", name)?;
        state
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("volume", name))
    }

    async fn export_images(&self, images: &[String]) -> Result<ImageStream, RuntimeError> {
        let tarball = format!("fake-image-tarball:{}", images.join(",")).into_bytes();
        Ok(Box::pin(io::Cursor::new(tarball)))
    }

    async fn get_host_ip(&self, network: &str) -> Result<IpAddr, RuntimeError> {
        self.lock()
            .networks
            .get(network)
            .map(|n| n.gateway)
            .ok_or_else(|| not_found("network", network))
    }
}
