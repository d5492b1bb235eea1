// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use {chrono::Utc, tokio::runtime::Runtime};

    use k3ctl_lib::{
        node::{
            readiness::{wait_for_log_message, wait_for_log_message_with_timeout},
            Node, Role,
        },
        runtime::Runtime as _,
        test_env::*,
        Error,
    };

    const READY: &str = "Running kube-apiserver";

    fn server(env: &TestEnvironment, rt: &Runtime) -> Node {
        let node = Node::new("k3d-dev-server-0", Role::Server);
        rt.block_on(env.runtime.create_node(&node)).unwrap();
        node
    }

    #[test]
    fn recovers_from_crashes() {
        let env = TestEnvironment::new("recovers_from_crashes");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        let node = server(&env, &rt);

        env.runtime.script_logs(
            &node.name,
            vec![
                vec![
                    "time=\"2025-01-01T00:00:00Z\" level=info msg=\"Starting k3s\"",
                    "time=\"2025-01-01T00:00:01Z\" level=fatal msg=\"starting kubernetes: preparing server: bootstrap data already found\"",
                ],
                vec!["level=fatal msg=\"still broken\""],
                vec![
                    "level=info msg=\"Waiting for etcd\"",
                    "level=info msg=\"Running kube-apiserver --advertise-port=6443\"",
                ],
            ],
        );

        rt.block_on(wait_for_log_message(&ctx, &node, READY, Utc::now()))
            .unwrap();
        assert_eq!(env.runtime.log_opens(&node.name), 3);
    }

    #[test]
    fn gives_up_after_backoff_limit() {
        let env = TestEnvironment::new("gives_up_after_backoff_limit");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        let node = server(&env, &rt);

        let crash = vec!["level=fatal msg=\"crash\""];
        env.runtime
            .script_logs(&node.name, vec![crash.clone(), crash.clone(), crash.clone(), crash]);

        let err = rt
            .block_on(wait_for_log_message(&ctx, &node, READY, Utc::now()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ReadinessFailed { running: false, ref status, .. } if status == "created"
        ));
        assert_eq!(env.runtime.log_opens(&node.name), ctx.backoff_limit as usize);
    }

    #[test]
    fn ended_stream_fails_immediately() {
        let env = TestEnvironment::new("ended_stream_fails_immediately");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        let node = server(&env, &rt);

        env.runtime
            .script_logs(&node.name, vec![vec!["level=info msg=\"shutting down\""]]);

        let err = rt
            .block_on(wait_for_log_message(&ctx, &node, READY, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, Error::ReadinessFailed { .. }));
        assert!(err.to_string().contains("shutting down"));
        assert_eq!(env.runtime.log_opens(&node.name), 1);
    }

    #[test]
    fn waits_for_late_message() {
        let env = TestEnvironment::new("waits_for_late_message");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        let node = server(&env, &rt);

        env.runtime.suppress_ready(&node.name);
        rt.block_on(async {
            env.runtime.start_node(&node).await.unwrap();
            let since = Utc::now();

            let (res, _) = tokio::join!(
                wait_for_log_message(&ctx, &node, "running KUBE-APISERVER", since),
                async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    env.runtime.emit(&node.name, "level=info msg=\"Running kube-apiserver\"");
                }
            );
            res.unwrap();
        });
    }

    #[test]
    fn ignores_lines_before_since() {
        let env = TestEnvironment::new("ignores_lines_before_since");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        let node = server(&env, &rt);

        rt.block_on(async {
            // Prints its ready lines right away.
            env.runtime.start_node(&node).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;

            let err = wait_for_log_message_with_timeout(
                &ctx,
                &node,
                READY,
                Utc::now(),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
            assert!(err.is_deadline_exceeded());
        });
    }

    #[test]
    fn cancellation() {
        let env = TestEnvironment::new("readiness_cancellation");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        let node = server(&env, &rt);

        env.runtime.suppress_ready(&node.name);
        rt.block_on(async {
            env.runtime.start_node(&node).await.unwrap();

            let canceller = ctx.clone();
            let (res, _) = tokio::join!(
                wait_for_log_message(&ctx, &node, READY, Utc::now()),
                async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    canceller.cancel();
                }
            );
            assert!(res.unwrap_err().is_cancelled());
        });
    }

    #[test]
    fn survives_restart_loop() {
        let env = TestEnvironment::new("survives_restart_loop");
        let ctx = env.context();
        let rt = Runtime::new().unwrap();
        let node = server(&env, &rt);

        env.runtime.suppress_ready(&node.name);
        rt.block_on(async {
            env.runtime.start_node(&node).await.unwrap();
            let since = Utc::now();

            // Stuck restarting for longer than the warning threshold, then comes up.
            let (res, _) = tokio::join!(
                wait_for_log_message(&ctx, &node, READY, since),
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    env.runtime.set_status(&node.name, false, "restarting");
                    tokio::time::sleep(ctx.timeouts.restart_warn * 2).await;
                    env.runtime.set_status(&node.name, true, "running");
                    env.runtime.emit(&node.name, READY);
                }
            );
            res.unwrap();
        });
    }
}
