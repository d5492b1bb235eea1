// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use tokio::runtime::Runtime;

    use k3ctl_lib::{
        config::ClusterConfig,
        orchestrator,
        test_env::*,
        tools::{self, ImageImportOpts, IMAGE_VOLUME_MOUNT},
        Error,
    };

    fn create_cluster(env: &TestEnvironment, rt: &Runtime, mut config: ClusterConfig) {
        config.agents = 1;
        let (mut cluster, opts) = config.into_cluster().unwrap();
        rt.block_on(orchestrator::run(&env.context(), &mut cluster, &opts))
            .unwrap();
    }

    fn images() -> Vec<String> {
        vec!["alpine:3.20".to_string(), "busybox:latest".to_string()]
    }

    /// The `ctr image import` commands run in `node`.
    fn imports(env: &TestEnvironment, node: &str) -> Vec<Vec<String>> {
        env.runtime
            .execs(node)
            .into_iter()
            .filter(|cmd| cmd.starts_with(&["ctr".to_string(), "image".to_string(), "import".to_string()]))
            .collect()
    }

    #[test]
    fn import_through_image_volume() {
        let env = TestEnvironment::new("import_through_image_volume");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        create_cluster(&env, &rt, ClusterConfig::new("imgvol"));

        rt.block_on(tools::import_images(&ctx, "imgvol", &images(), &ImageImportOpts::default()))
            .unwrap();

        for node in ["k3d-imgvol-server-0", "k3d-imgvol-agent-0"] {
            let found = imports(&env, node);
            assert_eq!(found.len(), 1, "{node}: {found:?}");
            assert!(found[0][3].starts_with(&format!("{IMAGE_VOLUME_MOUNT}/k3d-imgvol-images-")));
        }
        assert!(imports(&env, "k3d-imgvol-serverlb").is_empty());

        // The tools node is not kept around.
        assert!(env.runtime.container("k3d-imgvol-tools").is_none());
        assert!(env
            .runtime
            .calls()
            .contains(&"exec k3d-imgvol-tools".to_string()));
    }

    #[test]
    fn import_streamed() {
        let env = TestEnvironment::new("import_streamed");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        let mut config = ClusterConfig::new("stream");
        config.options.disable_image_volume = true;
        create_cluster(&env, &rt, config);

        let opts = ImageImportOpts { keep_tools: true };
        rt.block_on(tools::import_images(&ctx, "stream", &images(), &opts))
            .unwrap();

        for node in ["k3d-stream-server-0", "k3d-stream-agent-0"] {
            assert_eq!(imports(&env, node), vec![vec!["ctr", "image", "import", "-"]]);
        }
        let tools = env.runtime.container("k3d-stream-tools").unwrap();
        assert!(tools.state.running);
        assert!(!env.runtime.has_volume("k3d-stream-images"));
    }

    #[test]
    fn import_skips_failing_node() {
        let env = TestEnvironment::new("import_skips_failing_node");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        create_cluster(&env, &rt, ClusterConfig::new("partial"));

        env.runtime.fail_on("exec", "k3d-partial-agent-0");
        rt.block_on(tools::import_images(&ctx, "partial", &images(), &ImageImportOpts::default()))
            .unwrap();
        assert_eq!(imports(&env, "k3d-partial-server-0").len(), 1);
    }

    #[test]
    fn import_nothing() {
        let env = TestEnvironment::new("import_nothing");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();

        let err = rt
            .block_on(tools::import_images(&ctx, "any", &[], &ImageImportOpts::default()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = rt
            .block_on(tools::import_images(&ctx, "missing", &images(), &ImageImportOpts::default()))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn tools_node_is_reused() {
        let env = TestEnvironment::new("tools_node_is_reused");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        create_cluster(&env, &rt, ClusterConfig::new("reuse"));

        rt.block_on(async {
            let cluster = orchestrator::cluster_get(&ctx, "reuse").await.unwrap();
            let first = tools::ensure(&ctx, &cluster).await.unwrap();
            let second = tools::ensure(&ctx, &cluster).await.unwrap();
            assert_eq!(first.name, second.name);
        });

        let creates = env
            .runtime
            .calls()
            .iter()
            .filter(|c| *c == "create k3d-reuse-tools")
            .count();
        assert_eq!(creates, 1);
    }
}
