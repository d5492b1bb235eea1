// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Runtime labels are the only persisted link between a container and the cluster it belongs
//! to. Anything that needs to know "which nodes make up cluster X" must query by these labels.

use std::collections::HashMap;

pub const APP: &str = "app";
pub const APP_VALUE: &str = "k3d";

pub const ROLE: &str = "k3d.role";
pub const CLUSTER_NAME: &str = "k3d.cluster";
pub const CLUSTER_TOKEN: &str = "k3d.cluster.token";
pub const CLUSTER_URL: &str = "k3d.cluster.url";
pub const NETWORK: &str = "k3d.cluster.network";
pub const NETWORK_ID: &str = "k3d.cluster.network.id";
pub const NETWORK_EXTERNAL: &str = "k3d.cluster.network.external";
pub const NETWORK_IP_RANGE: &str = "k3d.cluster.network.iprange";
pub const IMAGE_VOLUME: &str = "k3d.cluster.imageVolume";

pub const SERVER_API_HOST: &str = "k3d.server.api.host";
pub const SERVER_API_HOST_IP: &str = "k3d.server.api.hostIP";
pub const SERVER_API_PORT: &str = "k3d.server.api.port";
pub const SERVER_IS_INIT: &str = "k3d.server.init";

pub const REGISTRY_HOST: &str = "k3d.registry.host";
pub const REGISTRY_HOST_IP: &str = "k3d.registry.hostIP";
pub const REGISTRY_PORT_INTERNAL: &str = "k3d.registry.port.internal";
pub const REGISTRY_PORT_EXTERNAL: &str = "k3d.registry.port.external";

pub const NODE_STATIC_IP: &str = "k3d.node.staticIP";
pub const NODE_MEMORY: &str = "k3d.node.memory";
pub const VERSION: &str = "k3d.version";

/// The labels every managed object carries.
pub fn default_labels() -> HashMap<String, String> {
    HashMap::from([(APP.to_string(), APP_VALUE.to_string())])
}

/// Label filter selecting every node of the named cluster.
pub fn cluster_filter(cluster_name: &str) -> HashMap<String, String> {
    let mut labels = default_labels();
    labels.insert(CLUSTER_NAME.to_string(), cluster_name.to_string());
    labels
}

/// Returns true if every entry of `filter` is present with the same value in `labels`.
pub fn matches(labels: &HashMap<String, String>, filter: &HashMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(key, value)| labels.get(key).is_some_and(|v| v == value))
}
