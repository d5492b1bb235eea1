// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Readiness detection by tailing a node's logs.
//!
//! k3s has no health endpoint that is reachable before the node is fully configured, so a node
//! counts as ready once it printed a known log line.

use std::convert::Infallible;

use {
    chrono::{DateTime, Utc},
    log::{debug, trace, warn},
    tokio::{io::AsyncBufReadExt, time::Instant},
};

use crate::{
    context::Context,
    error::{Error, Result, ResultExt},
    node::Node,
};

/// A log line containing this was printed by a k3s process that is about to exit.
pub const FATAL_MARKER: &str = "level=fatal";

/// Block until `node` logs a line containing `message` (case-insensitive), looking at logs
/// written at or after `since`.
///
/// If the log stream ends because the node crashed (its last line is fatal), the stream is
/// re-opened, up to `ctx.backoff_limit` attempts in total. Any other end of the stream fails
/// immediately. Cancellation of `ctx` aborts the wait with `Error::Cancelled`.
pub async fn wait_for_log_message(
    ctx: &Context,
    node: &Node,
    message: &str,
    since: DateTime<Utc>,
) -> Result<()> {
    ctx.run(async {
        tokio::select! {
            res = wait_loop(ctx, node, message, since) => res,
            never = watch_restarts(ctx, node) => match never {},
        }
    })
    .await
}

/// Like `wait_for_log_message`, but give up with `Error::DeadlineExceeded` after `timeout`.
pub async fn wait_for_log_message_with_timeout(
    ctx: &Context,
    node: &Node,
    message: &str,
    since: DateTime<Utc>,
    timeout: std::time::Duration,
) -> Result<()> {
    ctx.run_with_timeout(
        Some(timeout),
        wait_for_log_message(ctx, node, message, since),
    )
    .await
}

async fn wait_loop(ctx: &Context, node: &Node, message: &str, since: DateTime<Utc>) -> Result<()> {
    let runtime = ctx.runtime();
    let target = message.to_lowercase();
    let trace_lines = std::env::var("K3CTL_LOG_NODE_WAIT_LOGS")
        .map(|roles| roles.contains(node.role.as_str()))
        .unwrap_or(false);

    let mut attempt: u32 = 1;
    loop {
        let reader = runtime
            .get_node_logs(node, since)
            .await
            .with_context(|| format!("failed to get logs from node '{}'", node.name))?;
        let mut lines = reader.lines();
        let mut previous_line = String::new();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if trace_lines {
                        trace!(">>> [{}] {line}", node.name);
                    }
                    if line.to_lowercase().contains(&target) {
                        debug!("Node {} logged '{message}'", node.name);
                        return Ok(());
                    }
                    if !line.trim().is_empty() {
                        previous_line = line;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Error reading logs of node {}: {e}", node.name);
                    break;
                }
            }
        }

        let crashed = previous_line.contains(FATAL_MARKER);
        if crashed && attempt < ctx.backoff_limit {
            debug!(
                "Node {} crashed while waiting for '{message}' (attempt {attempt}/{}), last line: {previous_line}",
                node.name, ctx.backoff_limit
            );
            attempt += 1;
            ctx.sleep(ctx.timeouts.log_backoff).await?;
            continue;
        }

        let (running, status) = runtime
            .node_status(node)
            .await
            .unwrap_or((false, "unknown".to_string()));

        let reason = if crashed {
            format!("node kept crashing, giving up after {attempt} attempts (last line: '{previous_line}')")
        } else {
            format!("log stream ended (last line: '{previous_line}')")
        };

        return Err(Error::ReadinessFailed {
            node: node.name.clone(),
            message: message.to_string(),
            running,
            status,
            reason,
        });
    }
}

/// Warn once if the node has been stuck restarting for a while. Never returns; it is dropped
/// when the wait it accompanies finishes.
async fn watch_restarts(ctx: &Context, node: &Node) -> Infallible {
    let mut restarting_since: Option<Instant> = None;
    let mut warned = false;

    loop {
        tokio::time::sleep(ctx.timeouts.status_poll).await;

        match ctx.runtime().node_status(node).await {
            Ok((_, status)) if status == "restarting" => {
                let since = *restarting_since.get_or_insert_with(Instant::now);
                if !warned && since.elapsed() > ctx.timeouts.restart_warn {
                    warn!(
                        "Node {} is restarting for more than {}s now. Possibly it will recover soon (e.g. when it's waiting to join). Consider using a creation timeout to avoid waiting forever in a Restart Loop.",
                        node.name,
                        ctx.timeouts.restart_warn.as_secs()
                    );
                    warned = true;
                }
            }
            Ok(_) => restarting_since = None,
            Err(e) => debug!("Could not get status of node {}: {e}", node.name),
        }
    }
}
