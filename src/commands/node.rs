// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use clap::{Args, Subcommand};

use crate::{
    commands::{handled_error, Handle, HandledResult},
    context::Context,
    node::{
        lifecycle, Intent, Node, NodeCreateOpts, NodeDeleteOpts, NodeEditChanges, NodeStartOpts,
        PortBinding, Role,
    },
    orchestrator,
};

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    #[command(subcommand)]
    command: NodeCommands,
}

#[derive(Subcommand, Debug, Clone)]
enum NodeCommands {
    /// Add a new node to an existing cluster
    Create(CreateArgs),
    /// Start existing nodes
    Start {
        names: Vec<String>,
        #[arg(long)]
        wait: bool,
    },
    /// Stop existing nodes
    Stop { names: Vec<String> },
    /// Delete nodes
    Delete { names: Vec<String> },
    /// Change the configuration of a node (only ports of the load balancer for now)
    Edit {
        name: String,
        /// Port mapping to add, `[hostIP:][hostPort:]containerPort[/protocol]`
        #[arg(long = "port-add")]
        ports: Vec<String>,
    },
    /// List nodes
    List,
}

#[derive(Args, Debug, Clone)]
struct CreateArgs {
    name: String,

    #[arg(short, long, default_value = "k3s-default")]
    cluster: String,

    /// server or agent
    #[arg(long, default_value = "agent")]
    role: String,

    #[arg(short, long)]
    image: Option<String>,

    /// Memory limit, e.g. 1g
    #[arg(long)]
    memory: Option<String>,

    /// Wait for the node to be ready
    #[arg(long)]
    wait: bool,

    #[arg(long)]
    timeout: Option<u64>,
}

/// Node names carry the object prefix, so `agent-5` and `k3d-agent-5` mean the same node.
fn node_name(name: &str) -> String {
    let prefix = format!("{}-", crate::OBJECT_NAME_PREFIX);
    match name.starts_with(&prefix) {
        true => name.to_string(),
        false => format!("{prefix}{name}"),
    }
}

async fn get(ctx: &Context, name: &str) -> HandledResult<Node> {
    orchestrator::node_get(ctx, &node_name(name))
        .await
        .handle_err(|e| eprintln!("Could not get node '{name}': {e}"))
}

pub async fn node(ctx: &Context, args: &NodeArgs) -> HandledResult<()> {
    match &args.command {
        NodeCommands::Create(args) => create(ctx, args).await,
        NodeCommands::Start { names, wait } => {
            for name in names {
                let mut node = get(ctx, name).await?;
                let opts = NodeStartOpts {
                    wait: *wait,
                    intent: Intent::NodeStart,
                    ..Default::default()
                };
                lifecycle::start(ctx, &mut node, &opts)
                    .await
                    .handle_err(|e| eprintln!("Failed to start node '{name}': {e}"))?;
            }
            Ok(())
        }
        NodeCommands::Stop { names } => {
            for name in names {
                let mut node = get(ctx, name).await?;
                lifecycle::stop(ctx, &mut node)
                    .await
                    .handle_err(|e| eprintln!("Failed to stop node '{name}': {e}"))?;
            }
            Ok(())
        }
        NodeCommands::Delete { names } => {
            for name in names {
                let node = get(ctx, name).await?;
                lifecycle::delete(ctx, &node, &NodeDeleteOpts::default())
                    .await
                    .handle_err(|e| eprintln!("Failed to delete node '{name}': {e}"))?;
            }
            Ok(())
        }
        NodeCommands::Edit { name, ports } => {
            let node = get(ctx, name).await?;
            let ports = ports
                .iter()
                .map(|p| p.parse::<PortBinding>())
                .collect::<crate::Result<Vec<_>>>()
                .handle_err(|e| eprintln!("Invalid port mapping: {e}"))?;
            lifecycle::edit(ctx, &node, &NodeEditChanges { ports })
                .await
                .handle_err(|e| eprintln!("Failed to edit node '{name}': {e}"))
        }
        NodeCommands::List => {
            let nodes = orchestrator::node_list(ctx)
                .await
                .handle_err(|e| eprintln!("Failed to list nodes: {e}"))?;
            println!("{:<32} {:<13} {:<16} STATUS", "NAME", "ROLE", "CLUSTER");
            for node in nodes.iter() {
                println!(
                    "{:<32} {:<13} {:<16} {}",
                    node.name,
                    node.role.as_str(),
                    node.cluster_name().unwrap_or("-"),
                    node.state.status
                );
            }
            Ok(())
        }
    }
}

async fn create(ctx: &Context, args: &CreateArgs) -> HandledResult<()> {
    let role: Role = args
        .role
        .parse()
        .handle_err(|e| eprintln!("Invalid role: {e}"))?;
    if !role.is_k3s() {
        eprintln!("Only server and agent nodes can be added to a cluster");
        return handled_error();
    }

    let mut node = Node::new(&node_name(&args.name), role);
    if let Some(image) = &args.image {
        node.image = image.clone();
    }
    node.memory = args.memory.clone();
    node.restart = true;

    let opts = NodeCreateOpts {
        wait: args.wait,
        timeout: args.timeout.map(Duration::from_secs),
        ..Default::default()
    };
    orchestrator::node_add(ctx, &args.cluster, &mut node, &opts)
        .await
        .handle_err(|e| eprintln!("Failed to add node '{}' to cluster '{}': {e}", node.name, args.cluster))?;

    println!("Added node '{}' to cluster '{}'", node.name, args.cluster);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_names() {
        assert_eq!(node_name("agent-5"), "k3d-agent-5");
        assert_eq!(node_name("k3d-dev-agent-0"), "k3d-dev-agent-0");
    }
}
