// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The capabilities the orchestration core needs from a container runtime.

use std::{collections::HashMap, fmt, net::IpAddr, pin::Pin};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    futures::TryStreamExt,
    thiserror::Error,
    tokio::{
        io::{AsyncBufRead, AsyncRead},
        sync::mpsc,
    },
    tokio_util::compat::FuturesAsyncReadCompatExt,
};

use crate::{cluster::ClusterNetwork, node::Node};

pub mod docker;

/// A following log stream. It ends when the container stops or restarts.
pub type LogReader = Pin<Box<dyn AsyncBufRead + Send>>;

/// A tarball of exported images.
pub type ImageStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("command `{command}` in node '{node}' exited with {exit_code}: {output}")]
    Exec {
        node: String,
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("could not parse runtime output: {0}")]
    Parse(String),

    #[error("I/O error talking to the runtime: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }
}

/// Facts about the runtime that influence how nodes are created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
    pub os_type: String,
    pub cgroup_version: String,
    pub cgroup_driver: String,
    /// Whether a container's memory cap is visible from inside it (in /proc/meminfo). When it is
    /// not, the kubelet would see the host's memory, so a fake meminfo gets mounted instead.
    pub native_memory_limits: bool,
}

impl fmt::Display for RuntimeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}, cgroup v{} / {})",
            self.name, self.version, self.os_type, self.cgroup_version, self.cgroup_driver
        )
    }
}

/// A Docker-compatible container runtime.
///
/// Every call is cancellable by dropping its future. A missing container, network, volume or
/// file is always reported as `RuntimeError::NotFound`.
#[async_trait]
pub trait Runtime: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Path of the runtime's API socket on the host, mounted into the tools node.
    fn socket_path(&self) -> String;

    async fn info(&self) -> Result<RuntimeInfo, RuntimeError>;

    /// Create (but do not start) the container for `node`.
    async fn create_node(&self, node: &Node) -> Result<(), RuntimeError>;
    async fn start_node(&self, node: &Node) -> Result<(), RuntimeError>;
    async fn stop_node(&self, node: &Node) -> Result<(), RuntimeError>;
    async fn rename_node(&self, node: &Node, new_name: &str) -> Result<(), RuntimeError>;
    async fn delete_node(&self, node: &Node) -> Result<(), RuntimeError>;

    /// Fetch the current definition and state of the named node.
    async fn get_node(&self, name: &str) -> Result<Node, RuntimeError>;

    /// All nodes carrying every label in `labels`.
    async fn get_nodes_by_label(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<Node>, RuntimeError>;

    /// Returns (running, status string).
    async fn node_status(&self, node: &Node) -> Result<(bool, String), RuntimeError>;

    /// Run `cmd` inside the node, optionally feeding `stdin`, and return its combined output.
    async fn exec_in_node(
        &self,
        node: &Node,
        cmd: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<String, RuntimeError>;

    async fn read_from_node(&self, node: &Node, path: &str) -> Result<Vec<u8>, RuntimeError>;

    async fn write_to_node(
        &self,
        node: &Node,
        content: &[u8],
        path: &str,
        mode: u32,
    ) -> Result<(), RuntimeError>;

    /// Follow the node's logs starting at `since`.
    async fn get_node_logs(
        &self,
        node: &Node,
        since: DateTime<Utc>,
    ) -> Result<LogReader, RuntimeError>;

    /// Returns the network as it exists in the runtime, and whether it already existed.
    async fn create_network_if_not_present(
        &self,
        network: &ClusterNetwork,
        labels: &HashMap<String, String>,
    ) -> Result<(ClusterNetwork, bool), RuntimeError>;
    async fn get_network(&self, name: &str) -> Result<ClusterNetwork, RuntimeError>;
    async fn delete_network(&self, name: &str) -> Result<(), RuntimeError>;
    async fn connect_node_to_network(&self, node: &Node, network: &str)
        -> Result<(), RuntimeError>;

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError>;
    async fn get_volume(&self, name: &str) -> Result<String, RuntimeError>;
    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError>;

    async fn export_images(&self, images: &[String]) -> Result<ImageStream, RuntimeError>;

    /// The address under which the host is reachable from containers in `network`.
    async fn get_host_ip(&self, network: &str) -> Result<IpAddr, RuntimeError>;
}

/// Turn a channel of log lines into a `LogReader`. The stream ends once every sender is gone.
pub fn log_reader_from_channel(rx: mpsc::UnboundedReceiver<String>) -> LogReader {
    let lines = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, std::io::Error>(format!("{line}\n").into_bytes()), rx))
    });
    let reader = Box::pin(lines).into_async_read().compat();
    Box::pin(tokio::io::BufReader::new(reader))
}
