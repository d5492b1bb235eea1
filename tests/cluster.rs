// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::{net::IpAddr, time::Duration};

    use tokio::runtime::Runtime;

    use k3ctl_lib::{
        cluster::ClusterNetwork,
        config::ClusterConfig,
        labels,
        node::{
            lifecycle::{self, HOST_RECORD},
            Node, NodeCreateOpts, NodeState, Role,
        },
        orchestrator::{self, ClusterCreateOpts, ClusterDeleteOpts, ClusterStartOpts},
        registry::REGISTRIES_CONFIG_PATH,
        repository::ClusterRepository,
        runtime::Runtime as _,
        test_env::*,
        Cluster, Error,
    };

    fn from_toml(toml: &str) -> (Cluster, ClusterCreateOpts) {
        ClusterConfig::from_toml(toml)
            .unwrap()
            .into_cluster()
            .unwrap()
    }

    fn hosts_has_record(env: &TestEnvironment, node: &str) -> bool {
        env.runtime
            .file(node, "/etc/hosts")
            .map(|content| String::from_utf8_lossy(&content).contains(HOST_RECORD))
            .unwrap_or(false)
    }

    fn position(calls: &[String], call: &str) -> usize {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("no call '{call}' in {calls:?}"))
    }

    #[test]
    fn lifecycle() {
        let env = TestEnvironment::new("cluster_lifecycle");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();

        let (mut cluster, opts) = from_toml(
            r#"
name = "e2e"
servers = 1
agents = 2

[[env]]
value = "K3S_DEBUG=true"
node_filters = ["agent:*"]
"#,
        );

        rt.block_on(async {
            orchestrator::run(&ctx, &mut cluster, &opts).await.unwrap();

            assert_eq!(
                env.runtime.container_names(),
                vec![
                    "k3d-e2e-agent-0",
                    "k3d-e2e-agent-1",
                    "k3d-e2e-server-0",
                    "k3d-e2e-serverlb",
                    "k3d-e2e-tools",
                ]
            );
            assert!(env.runtime.has_network("k3d-e2e"));
            assert!(env.runtime.has_volume("k3d-e2e-images"));

            let cluster = orchestrator::cluster_get(&ctx, "e2e").await.unwrap();
            assert_eq!(cluster.server_count(), 1);
            assert_eq!(cluster.agents().count(), 2);
            assert!(cluster.loadbalancer.is_some());
            assert_eq!(cluster.network.name, "k3d-e2e");
            assert!(!cluster.network.external);
            assert_eq!(cluster.image_volume.as_deref(), Some("k3d-e2e-images"));
            assert!(cluster.nodes.iter().all(|n| n.state.running));

            let agent = orchestrator::node_get(&ctx, "k3d-e2e-agent-1").await.unwrap();
            assert_eq!(agent.env_var("K3S_URL"), Some("https://k3d-e2e-server-0:6443"));
            assert_eq!(agent.env_var("K3S_TOKEN"), Some(cluster.token.as_str()));
            assert_eq!(agent.env_var("K3S_DEBUG"), Some("true"));
            assert!(agent.volumes.contains(&"k3d-e2e-images:/k3d/images".to_string()));
            let server = orchestrator::node_get(&ctx, "k3d-e2e-server-0").await.unwrap();
            assert_eq!(server.env_var("K3S_URL"), None);
            assert_eq!(server.env_var("K3S_DEBUG"), None);

            // Only k3s nodes learn about the host.
            assert!(hosts_has_record(&env, "k3d-e2e-server-0"));
            assert!(hosts_has_record(&env, "k3d-e2e-agent-0"));
            assert!(!hosts_has_record(&env, "k3d-e2e-serverlb"));

            let listed = orchestrator::cluster_list(&ctx).await.unwrap();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].name, "e2e");

            orchestrator::cluster_stop(&ctx, "e2e").await.unwrap();
            let stopped = orchestrator::cluster_get(&ctx, "e2e").await.unwrap();
            assert!(stopped.nodes.iter().all(|n| !n.state.running));

            let lb_call = "write k3d-e2e-serverlb".to_string();
            let writes = env.runtime.calls().iter().filter(|c| **c == lb_call).count();
            let start_opts = ClusterStartOpts {
                wait: true,
                ..Default::default()
            };
            orchestrator::cluster_start(&ctx, "e2e", &start_opts).await.unwrap();
            let started = orchestrator::cluster_get(&ctx, "e2e").await.unwrap();
            assert!(started
                .nodes
                .iter()
                .filter(|n| n.role != Role::NoRole)
                .all(|n| n.state.running));
            // The load balancer is reconfigured on cluster start.
            assert_eq!(
                env.runtime.calls().iter().filter(|c| **c == lb_call).count(),
                writes + 1
            );

            orchestrator::cluster_delete(&ctx, "e2e", &ClusterDeleteOpts::default())
                .await
                .unwrap();
            assert!(env.runtime.container_names().is_empty());
            assert!(!env.runtime.has_network("k3d-e2e"));
            assert!(!env.runtime.has_volume("k3d-e2e-images"));

            let err = orchestrator::cluster_get(&ctx, "e2e").await.unwrap_err();
            assert!(matches!(err, Error::ClusterNotFound(_)));
        });
    }

    #[test]
    fn multiple_servers() {
        let env = TestEnvironment::new("multiple_servers");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();

        let mut config = ClusterConfig::new("ha");
        config.servers = 3;
        let (mut cluster, opts) = config.into_cluster().unwrap();
        rt.block_on(orchestrator::run(&ctx, &mut cluster, &opts))
            .unwrap();

        let calls = env.runtime.calls();
        let init = position(&calls, "start k3d-ha-server-0");
        assert!(init < position(&calls, "start k3d-ha-server-1"));
        assert!(init < position(&calls, "start k3d-ha-server-2"));
        assert!(position(&calls, "start k3d-ha-server-2") < position(&calls, "start k3d-ha-serverlb"));

        let init = env.runtime.container("k3d-ha-server-0").unwrap();
        assert!(init.args.contains(&"--cluster-init".to_string()));
        assert_eq!(init.label(labels::SERVER_IS_INIT), Some("true"));
        assert_eq!(init.env_var("K3S_URL"), None);

        let joining = env.runtime.container("k3d-ha-server-2").unwrap();
        assert!(!joining.args.contains(&"--cluster-init".to_string()));
        assert_eq!(joining.env_var("K3S_URL"), Some("https://k3d-ha-server-0:6443"));

        let found = rt.block_on(orchestrator::cluster_get(&ctx, "ha")).unwrap();
        assert_eq!(found.init_node.as_deref(), Some("k3d-ha-server-0"));
    }

    #[test]
    fn without_loadbalancer() {
        let env = TestEnvironment::new("without_loadbalancer");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();

        let (mut cluster, opts) = from_toml(
            r#"
name = "nolb"
agents = 1

[kube_api]
host_port = 6555

[options]
disable_loadbalancer = true
"#,
        );
        rt.block_on(orchestrator::run(&ctx, &mut cluster, &opts))
            .unwrap();

        assert!(env.runtime.container("k3d-nolb-serverlb").is_none());
        let server = env.runtime.container("k3d-nolb-server-0").unwrap();
        assert_eq!(server.ports.len(), 1);
        assert_eq!(server.ports[0].host_port, Some(6555));
        assert_eq!(server.ports[0].container_port, 6443);
    }

    #[test]
    fn managed_subnet() {
        let env = TestEnvironment::new("managed_subnet");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();

        let (mut cluster, opts) = from_toml(
            r#"
name = "static"
agents = 1
subnet = "172.40.0.0/24"
"#,
        );

        rt.block_on(async {
            orchestrator::run(&ctx, &mut cluster, &opts).await.unwrap();

            let ip = |name: &str| env.runtime.container(name).and_then(|n| n.ip);
            let addr = |s: &str| s.parse::<IpAddr>().ok();
            assert_eq!(ip("k3d-static-server-0"), addr("172.40.0.2"));
            assert_eq!(ip("k3d-static-agent-0"), addr("172.40.0.3"));
            assert_eq!(ip("k3d-static-serverlb"), addr("172.40.0.4"));
            assert_eq!(ip("k3d-static-tools"), None);

            let server = env.runtime.container("k3d-static-server-0").unwrap();
            assert_eq!(server.label(labels::NODE_STATIC_IP), Some("172.40.0.2"));
            assert_eq!(server.label(labels::NETWORK_IP_RANGE), Some("172.40.0.0/24"));

            let found = orchestrator::cluster_get(&ctx, "static").await.unwrap();
            assert!(found.network.ipam.managed);

            let mut node = Node::new("k3d-static-agent-1", Role::Agent);
            orchestrator::node_add(&ctx, "static", &mut node, &NodeCreateOpts::default())
                .await
                .unwrap();
            assert_eq!(ip("k3d-static-agent-1"), addr("172.40.0.5"));
        });
    }

    #[test]
    fn existing_network() {
        let env = TestEnvironment::new("existing_network");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();

        rt.block_on(async {
            env.runtime
                .create_network_if_not_present(
                    &ClusterNetwork::new("shared"),
                    &labels::default_labels(),
                )
                .await
                .unwrap();

            let mut config = ClusterConfig::new("reuse");
            config.network = Some("shared".to_string());
            config.subnet = Some("172.50.0.0/16".to_string());
            let (mut cluster, opts) = config.clone().into_cluster().unwrap();
            let err = orchestrator::run(&ctx, &mut cluster, &opts).await.unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)));
            assert!(env.runtime.container_names().is_empty());

            config.subnet = None;
            let (mut cluster, opts) = config.into_cluster().unwrap();
            orchestrator::run(&ctx, &mut cluster, &opts).await.unwrap();
            assert!(cluster.network.external);

            let found = orchestrator::cluster_get(&ctx, "reuse").await.unwrap();
            assert!(found.network.external);

            orchestrator::cluster_delete(&ctx, "reuse", &ClusterDeleteOpts::default())
                .await
                .unwrap();
            assert!(env.runtime.has_network("shared"));
        });
    }

    #[test]
    fn host_network() {
        let env = TestEnvironment::new("host_network");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();

        let mut config = ClusterConfig::new("onhost");
        config.network = Some("host".to_string());
        config.servers = 2;
        let (mut cluster, opts) = config.clone().into_cluster().unwrap();
        let err = rt
            .block_on(orchestrator::run(&ctx, &mut cluster, &opts))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        config.servers = 1;
        let (mut cluster, opts) = config.into_cluster().unwrap();
        rt.block_on(orchestrator::run(&ctx, &mut cluster, &opts))
            .unwrap();

        assert!(env.runtime.container("k3d-onhost-serverlb").is_none());
        let server = env.runtime.container("k3d-onhost-server-0").unwrap();
        assert_eq!(server.networks, vec!["host"]);
        assert!(server.ports.is_empty());
        assert!(!hosts_has_record(&env, "k3d-onhost-server-0"));

        rt.block_on(orchestrator::cluster_delete(&ctx, "onhost", &ClusterDeleteOpts::default()))
            .unwrap();
        assert!(env.runtime.container_names().is_empty());
    }

    #[test]
    fn name_taken() {
        let env = TestEnvironment::new("name_taken");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();

        let (mut first, opts) = ClusterConfig::new("taken").into_cluster().unwrap();
        rt.block_on(orchestrator::run(&ctx, &mut first, &opts))
            .unwrap();
        let before = env.runtime.container_names();

        let (mut second, opts) = ClusterConfig::new("taken").into_cluster().unwrap();
        let err = rt
            .block_on(orchestrator::run(&ctx, &mut second, &opts))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(env.runtime.container_names(), before);
    }

    #[test]
    fn failed_create_can_be_cleaned_up() {
        let env = TestEnvironment::new("failed_create_can_be_cleaned_up");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();

        env.runtime.fail_on("start", "k3d-broken-agent-0");
        let mut config = ClusterConfig::new("broken");
        config.agents = 1;
        let (mut cluster, opts) = config.into_cluster().unwrap();

        rt.block_on(async {
            orchestrator::run(&ctx, &mut cluster, &opts).await.unwrap_err();
            // The load balancer is started after the agents, so it never was.
            assert!(!env.runtime.calls().contains(&"start k3d-broken-serverlb".to_string()));

            orchestrator::cluster_delete(&ctx, "broken", &ClusterDeleteOpts::default())
                .await
                .unwrap();
        });
        assert!(env.runtime.container_names().is_empty());
        assert!(!env.runtime.has_network("k3d-broken"));
        assert!(!env.runtime.has_volume("k3d-broken-images"));
    }

    #[test]
    fn create_timeout() {
        let env = TestEnvironment::new("create_timeout");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();

        env.runtime.suppress_ready("k3d-slow-server-0");
        let (mut cluster, mut opts) = ClusterConfig::new("slow").into_cluster().unwrap();
        opts.timeout = Some(Duration::from_millis(300));

        let err = rt
            .block_on(orchestrator::run(&ctx, &mut cluster, &opts))
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
    }

    #[test]
    fn with_registry() {
        let env = TestEnvironment::new("with_registry");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();

        let (mut cluster, opts) = from_toml(
            r#"
name = "reg"

[registries.create]
host_port = 5111
"#,
        );

        rt.block_on(async {
            orchestrator::run(&ctx, &mut cluster, &opts).await.unwrap();

            let registry = env.runtime.container("k3d-reg-registry").unwrap();
            assert_eq!(registry.role, Role::Registry);
            assert!(registry.state.running);
            assert_eq!(registry.cluster_name(), Some("reg"));

            let config = env
                .runtime
                .file("k3d-reg-server-0", REGISTRIES_CONFIG_PATH)
                .unwrap();
            assert!(String::from_utf8(config).unwrap().contains("k3d-reg-registry:5111"));

            let kubectl = env
                .runtime
                .execs("k3d-reg-server-0")
                .into_iter()
                .any(|cmd| cmd.first().map(String::as_str) == Some("kubectl"));
            assert!(kubectl);

            let opts = ClusterDeleteOpts {
                keep_registries: true,
            };
            orchestrator::cluster_delete(&ctx, "reg", &opts).await.unwrap();
            assert_eq!(env.runtime.container_names(), vec!["k3d-reg-registry"]);
        });
    }

    #[test]
    fn membership_follows_labels() {
        let env = TestEnvironment::new("membership_follows_labels");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        let repository = ctx.repository();

        let query = |cluster: &str| {
            let mut filter = labels::cluster_filter(cluster);
            filter.insert(labels::ROLE.to_string(), Role::Agent.to_string());
            let found = rt.block_on(repository.list_by_label(&filter)).unwrap();
            found.into_iter().map(|n| n.name).collect::<Vec<_>>()
        };

        let mut node = Node::new("k3d-alpha-agent-0", Role::Agent);
        node.runtime_labels
            .insert(labels::CLUSTER_NAME.to_string(), "alpha".to_string());
        rt.block_on(lifecycle::create(&ctx, &mut node, &NodeCreateOpts::default()))
            .unwrap();

        assert_eq!(query("alpha"), vec!["k3d-alpha-agent-0"]);
        assert!(query("beta").is_empty());

        // Labels are fixed at creation, so moving a node means replacing its container.
        let mut moved = node.clone();
        moved
            .runtime_labels
            .insert(labels::CLUSTER_NAME.to_string(), "beta".to_string());
        moved.state = NodeState::default();
        rt.block_on(lifecycle::replace(&ctx, &node, &mut moved))
            .unwrap();

        assert!(query("alpha").is_empty());
        assert_eq!(query("beta"), vec!["k3d-alpha-agent-0"]);
    }

    #[test]
    fn stop_reports_runtime_failure() {
        let env = TestEnvironment::new("stop_reports_runtime_failure");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        let (mut cluster, opts) = ClusterConfig::new("stuck").into_cluster().unwrap();
        rt.block_on(orchestrator::run(&ctx, &mut cluster, &opts))
            .unwrap();

        env.runtime.fail_on("stop", "k3d-stuck-server-0");
        let err = rt
            .block_on(orchestrator::cluster_stop(&ctx, "stuck"))
            .unwrap_err();

        assert!(matches!(err.root(), Error::Runtime { .. }), "{err:?}");
        assert!(err.to_string().contains("k3d-stuck-server-0"));
        // The other nodes are stopped regardless.
        assert!(!env.runtime.container("k3d-stuck-serverlb").unwrap().state.running);
    }
}
