// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The tools node: a helper container per cluster that has the image volume and the runtime
//! socket mounted, used for maintenance work like importing images.

use {
    chrono::Utc,
    futures::future::join_all,
    log::{debug, error, info, warn},
    tokio::io::AsyncReadExt,
};

use crate::{
    cluster::Cluster,
    context::Context,
    error::{Error, Result, ResultExt},
    labels,
    node::{lifecycle, Node, NodeCreateOpts, NodeDeleteOpts, NodeStartOpts, Role},
    repository::ClusterRepository,
};

/// Where the image volume is mounted in every node of a cluster.
pub const IMAGE_VOLUME_MOUNT: &str = "/k3d/images";

/// Get the tools node of `cluster`, creating or starting it as needed.
///
/// Only one caller at a time gets past the context's tools lock, so that concurrent callers
/// don't each create a tools node (and pull its image).
pub async fn ensure(ctx: &Context, cluster: &Cluster) -> Result<Node> {
    let _guard = ctx.tools_lock.lock().await;
    let name = cluster.tools_node_name();

    match ctx.runtime().get_node(&name).await {
        Ok(mut node) => {
            if !node.state.running {
                debug!("Starting existing tools node {name}");
                lifecycle::start(ctx, &mut node, &NodeStartOpts::default()).await?;
            }
            return Ok(node);
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e).with_context(|| format!("failed to get tools node '{name}'")),
    }

    let (network, image_volume) = if cluster.network.name.is_empty() {
        debug!("Gathering cluster details for the tools node of {}", cluster.name);
        details_from_members(ctx, &cluster.name).await?
    } else {
        (cluster.network.name.clone(), cluster.image_volume.clone())
    };

    let mut node = Node::new(&name, Role::NoRole);
    node.image = crate::default_tools_image();
    node.args = vec!["noop".to_string()];
    node.networks = vec![network];
    node.runtime_labels = labels::cluster_filter(&cluster.name);
    let socket = ctx.runtime().socket_path();
    node.volumes.push(format!("{socket}:{socket}"));
    if let Some(volume) = image_volume {
        node.volumes.push(format!("{volume}:{IMAGE_VOLUME_MOUNT}"));
    }

    info!("Starting tools node {name}");
    lifecycle::create(ctx, &mut node, &NodeCreateOpts::default())
        .await
        .with_context(|| format!("failed to create tools node for cluster '{}'", cluster.name))?;
    lifecycle::start(ctx, &mut node, &NodeStartOpts::default())
        .await
        .with_context(|| format!("failed to start tools node for cluster '{}'", cluster.name))?;

    Ok(node)
}

/// Network and image volume of `cluster_name`, taken from the labels of a live member.
async fn details_from_members(ctx: &Context, cluster_name: &str) -> Result<(String, Option<String>)> {
    let nodes = ctx
        .repository()
        .list_by_label(&labels::cluster_filter(cluster_name))
        .await?;

    let member = nodes
        .iter()
        .filter(|n| n.role.is_k3s())
        .find(|n| n.state.running)
        .or_else(|| nodes.iter().find(|n| n.role.is_k3s()))
        .ok_or_else(|| Error::ClusterNotFound(cluster_name.to_string()))?;

    let network = member
        .label(labels::NETWORK)
        .map(str::to_string)
        .or_else(|| member.networks.first().cloned())
        .ok_or_else(|| {
            Error::InvalidConfig(format!("node '{}' has no network", member.name))
        })?;

    Ok((network, member.label(labels::IMAGE_VOLUME).map(str::to_string)))
}

#[derive(Debug, Clone, Default)]
pub struct ImageImportOpts {
    /// Leave the tools node running afterwards.
    pub keep_tools: bool,
}

/// Import `images` from the runtime's image store into every server and agent of the cluster.
///
/// The images are exported once. With an image volume the tarball is staged there through the
/// tools node and every node imports it from its mount; without one it is streamed into each
/// node. A node that fails to import is logged and skipped.
pub async fn import_images(ctx: &Context, cluster_name: &str, images: &[String], opts: &ImageImportOpts) -> Result<()> {
    if images.is_empty() {
        return Err(Error::InvalidConfig("no images to import".to_string()));
    }

    let cluster = ctx.repository().get_by_name(cluster_name).await?;
    let tools = ensure(ctx, &cluster).await?;

    info!("Exporting {} image(s) from the runtime", images.len());
    let mut stream = ctx
        .runtime()
        .export_images(images)
        .await
        .with_context(|| "failed to export images".to_string())?;
    let mut tarball = Vec::new();
    stream.read_to_end(&mut tarball).await?;

    let staged = match cluster.image_volume.as_ref() {
        Some(_) => {
            let path = format!(
                "{IMAGE_VOLUME_MOUNT}/{}-{}.tar",
                cluster.image_volume_name(),
                Utc::now().timestamp()
            );
            ctx.runtime()
                .write_to_node(&tools, &tarball, &path, 0o644)
                .await
                .with_context(|| format!("failed to stage images in tools node '{}'", tools.name))?;
            Some(path)
        }
        None => None,
    };

    let targets: Vec<&Node> = cluster
        .nodes
        .iter()
        .filter(|n| n.role.is_k3s() && n.state.running)
        .collect();
    if targets.is_empty() {
        warn!("Cluster {cluster_name} has no running servers or agents to import images into");
    }

    let imports = targets.iter().map(|node| {
        let (command, stdin) = match &staged {
            Some(path) => (
                vec!["ctr".to_string(), "image".to_string(), "import".to_string(), path.clone()],
                None,
            ),
            None => (
                vec!["ctr".to_string(), "image".to_string(), "import".to_string(), "-".to_string()],
                Some(tarball.clone()),
            ),
        };
        async move {
            info!("Importing images into node {}", node.name);
            (node, ctx.runtime().exec_in_node(node, &command, stdin).await)
        }
    });

    let mut failed = 0;
    for (node, res) in join_all(imports).await {
        if let Err(e) = res {
            error!("Failed to import images into node {}: {e}", node.name);
            failed += 1;
        }
    }

    if let Some(path) = staged {
        let rm = vec!["rm".to_string(), "-f".to_string(), path.clone()];
        if let Err(e) = ctx.runtime().exec_in_node(&tools, &rm, None).await {
            warn!("Failed to remove image tarball {path}: {e}");
        }
    }

    if !opts.keep_tools {
        lifecycle::delete(ctx, &tools, &NodeDeleteOpts::default()).await?;
    }

    info!(
        "Imported images into {} of {} node(s) of cluster {cluster_name}",
        targets.len() - failed,
        targets.len()
    );
    Ok(())
}
