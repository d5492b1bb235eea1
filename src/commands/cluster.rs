// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use {
    clap::{Args, Subcommand},
    log::{info, warn},
};

use crate::{
    commands::{Cli, Handle, HandledResult},
    config::{self, ClusterConfig, PortConfig},
    context::Context,
    orchestrator::{self, ClusterDeleteOpts, ClusterStartOpts},
};

const DEFAULT_CLUSTER_NAME: &str = "k3s-default";

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    #[command(subcommand)]
    command: ClusterCommands,
}

#[derive(Subcommand, Debug, Clone)]
enum ClusterCommands {
    /// Create a new cluster
    Create(CreateArgs),
    /// Start existing clusters
    Start(StartArgs),
    /// Stop existing clusters
    Stop {
        names: Vec<String>,
    },
    /// Delete clusters
    Delete {
        names: Vec<String>,
        /// Leave registries created with the cluster in place
        #[arg(long)]
        keep_registries: bool,
    },
    /// List clusters
    List,
}

#[derive(Args, Debug, Clone)]
struct CreateArgs {
    /// Name of the cluster; overrides the name in the config file
    name: Option<String>,

    #[arg(short, long)]
    servers: Option<usize>,

    #[arg(short, long)]
    agents: Option<usize>,

    #[arg(short, long)]
    image: Option<String>,

    /// Port mapping `[hostIP:][hostPort:]containerPort[/protocol][@nodefilter]`
    #[arg(short, long = "port")]
    ports: Vec<String>,

    #[arg(long)]
    subnet: Option<String>,

    /// Create the cluster without a load balancer in front of the servers
    #[arg(long)]
    no_lb: bool,

    /// Keep whatever was created if cluster creation fails
    #[arg(long)]
    no_rollback: bool,

    /// Give up after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Args, Debug, Clone)]
struct StartArgs {
    names: Vec<String>,

    /// Wait for the servers to be ready
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    wait: bool,

    #[arg(long)]
    timeout: Option<u64>,
}

pub async fn cluster(cli: &Cli, ctx: &Context, args: &ClusterArgs) -> HandledResult<()> {
    match &args.command {
        ClusterCommands::Create(args) => create(cli, ctx, args).await,
        ClusterCommands::Start(args) => {
            let opts = ClusterStartOpts {
                wait: args.wait,
                timeout: args.timeout.map(Duration::from_secs),
                ..Default::default()
            };
            for name in names_or_default(&args.names) {
                orchestrator::cluster_start(ctx, &name, &opts)
                    .await
                    .handle_err(|e| eprintln!("Failed to start cluster '{name}': {e}"))?;
                println!("Started cluster '{name}'");
            }
            Ok(())
        }
        ClusterCommands::Stop { names } => {
            for name in names_or_default(names) {
                orchestrator::cluster_stop(ctx, &name)
                    .await
                    .handle_err(|e| eprintln!("Failed to stop cluster '{name}': {e}"))?;
                println!("Stopped cluster '{name}'");
            }
            Ok(())
        }
        ClusterCommands::Delete {
            names,
            keep_registries,
        } => {
            let opts = ClusterDeleteOpts {
                keep_registries: *keep_registries,
            };
            for name in names_or_default(names) {
                match orchestrator::cluster_delete(ctx, &name, &opts).await {
                    Ok(()) => println!("Deleted cluster '{name}'"),
                    Err(e) if e.is_not_found() => println!("No cluster '{name}' found, nothing to delete"),
                    Err(e) => {
                        eprintln!("Failed to delete cluster '{name}': {e}");
                        return super::handled_error();
                    }
                }
            }
            Ok(())
        }
        ClusterCommands::List => {
            let clusters = orchestrator::cluster_list(ctx)
                .await
                .handle_err(|e| eprintln!("Failed to list clusters: {e}"))?;
            for cluster in clusters.iter() {
                cluster.print_summary();
            }
            Ok(())
        }
    }
}

fn names_or_default(names: &[String]) -> Vec<String> {
    match names.is_empty() {
        true => vec![DEFAULT_CLUSTER_NAME.to_string()],
        false => names.to_vec(),
    }
}

/// Split `8080:80@loadbalancer` into the port and its node filter.
fn port_config(spec: &str) -> PortConfig {
    match spec.split_once('@') {
        Some((port, filter)) => PortConfig {
            port: port.to_string(),
            node_filters: vec![filter.to_string()],
        },
        None => PortConfig {
            port: spec.to_string(),
            node_filters: Vec::new(),
        },
    }
}

fn cluster_config(cli: &Cli, args: &CreateArgs) -> crate::Result<ClusterConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load(Some(path.clone()))?,
        None => ClusterConfig::new(DEFAULT_CLUSTER_NAME),
    };

    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if let Some(servers) = args.servers {
        config.servers = servers;
    }
    if let Some(agents) = args.agents {
        config.agents = agents;
    }
    if args.image.is_some() {
        config.image = args.image.clone();
    }
    if args.subnet.is_some() {
        config.subnet = args.subnet.clone();
    }
    config.ports.extend(args.ports.iter().map(|p| port_config(p)));
    if args.no_lb {
        config.options.disable_loadbalancer = true;
    }
    if args.timeout.is_some() {
        config.options.timeout_secs = args.timeout;
    }

    Ok(config)
}

async fn create(cli: &Cli, ctx: &Context, args: &CreateArgs) -> HandledResult<()> {
    let (mut cluster, opts) = cluster_config(cli, args)
        .and_then(ClusterConfig::into_cluster)
        .handle_err(|e| eprintln!("Invalid cluster configuration: {e}"))?;
    let name = cluster.name.clone();

    // Never roll back over a cluster that was there before.
    if orchestrator::cluster_get(ctx, &name).await.is_ok() {
        eprintln!("A cluster named '{name}' already exists");
        return super::handled_error();
    }

    info!("Creating cluster {name}");
    if let Err(e) = orchestrator::run(ctx, &mut cluster, &opts).await {
        eprintln!("Failed to create cluster '{name}': {e}");
        if args.no_rollback {
            warn!("Not rolling back, the partially created cluster is left in place");
            return super::handled_error();
        }

        // The original context may be cancelled already; cleanup gets a fresh one.
        let cleanup = Context::new(ctx.runtime_handle());
        eprintln!("Rolling back: deleting cluster '{name}'");
        match orchestrator::cluster_delete(&cleanup, &name, &ClusterDeleteOpts::default()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => info!("Nothing of cluster {name} to roll back"),
            Err(e) => eprintln!("Failed to roll back cluster '{name}': {e}"),
        }
        return super::handled_error();
    }

    println!(
        "Cluster '{name}' created; the API is available at https://{}:{}",
        if cluster.kube_api.host.is_empty() {
            "0.0.0.0"
        } else {
            cluster.kube_api.host.as_str()
        },
        cluster.kube_api.host_port
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_filters() {
        let port = port_config("8080:80@agent:0");
        assert_eq!(port.port, "8080:80");
        assert_eq!(port.node_filters, vec!["agent:0"]);
        assert!(port_config("8080:80").node_filters.is_empty());
    }
}
