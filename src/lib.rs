// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod ipam;
pub mod labels;
pub mod loadbalancer;
pub mod node;
pub mod orchestrator;
pub mod registry;
pub mod repository;
pub mod runtime;
pub mod test_env;
pub mod tools;

pub use cluster::Cluster;
pub use context::Context;
pub use error::{Error, Result};

/// Prefix shared by every object (container, network, volume) this tool creates.
pub const OBJECT_NAME_PREFIX: &str = "k3d";

/// The port the k3s API server listens on inside the server containers.
pub const DEFAULT_API_PORT: u16 = 6443;

/// Version stamped onto created nodes.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Gets the k3s image used for server and agent nodes.
pub fn default_image() -> String {
    match std::env::var("K3CTL_IMAGE") {
        Ok(image) => image,
        Err(_) => "docker.io/rancher/k3s:v1.31.5-k3s1".to_string(),
    }
}

pub fn default_proxy_image() -> String {
    match std::env::var("K3CTL_PROXY_IMAGE") {
        Ok(image) => image,
        Err(_) => "ghcr.io/k3d-io/k3d-proxy:5.8.3".to_string(),
    }
}

pub fn default_tools_image() -> String {
    match std::env::var("K3CTL_TOOLS_IMAGE") {
        Ok(image) => image,
        Err(_) => "ghcr.io/k3d-io/k3d-tools:5.8.3".to_string(),
    }
}

pub fn default_registry_image() -> String {
    match std::env::var("K3CTL_REGISTRY_IMAGE") {
        Ok(image) => image,
        Err(_) => "docker.io/library/registry:2".to_string(),
    }
}

pub fn default_config_path() -> String {
    match std::env::var("K3CTL_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "k3ctl.toml".to_string(),
    }
}

/// Directory holding per-node generated files (fake meminfo and the like).
pub fn default_state_dir() -> std::path::PathBuf {
    match std::env::var("K3CTL_STATE_DIR") {
        Ok(dir) => dir.into(),
        Err(_) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::Path::new(&home).join(".config").join("k3ctl")
        }
    }
}

pub fn default_docker_binary() -> String {
    match std::env::var("K3CTL_DOCKER") {
        Ok(bin) => bin,
        Err(_) => "docker".to_string(),
    }
}

/// How many times a readiness wait re-opens a log stream after the node crashed.
pub fn default_backoff_limit() -> u32 {
    match std::env::var("K3CTL_NODE_WAIT_BACKOFF_LIMIT") {
        Ok(limit) => limit.parse::<u32>().unwrap_or_else(|_| {
            log::warn!("K3CTL_NODE_WAIT_BACKOFF_LIMIT is not a number: '{limit}', using 10");
            10
        }),
        Err(_) => 10,
    }
}
