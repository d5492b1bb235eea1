// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Lifecycle hooks: small actions run against a node right before or right after it starts.

use std::{fmt, sync::Arc};

use log::{debug, warn};

use crate::{
    context::Context,
    error::{Error, Result, ResultExt},
    node::Node,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    /// Runs after the container was created but before it is started. Failures are logged and
    /// the start proceeds.
    PreStart,
    /// Runs once the node is up (and ready, if waited for). Failures abort the start.
    PostStart,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                HookStage::PreStart => "preStart",
                HookStage::PostStart => "postStart",
            }
        )
    }
}

/// Turns the current content of a file into its new content.
#[derive(Clone)]
pub struct RewriteFn(pub Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>);

impl RewriteFn {
    pub fn new<F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static>(f: F) -> Self {
        RewriteFn(Arc::new(f))
    }

    /// A rewrite that appends `line` (plus a newline) to the file.
    pub fn append_line(line: String) -> Self {
        RewriteFn::new(move |input| {
            let mut output = input.to_vec();
            if !output.is_empty() && !output.ends_with(b"\n") {
                output.push(b'\n');
            }
            output.extend_from_slice(line.as_bytes());
            output.push(b'\n');
            output
        })
    }
}

impl fmt::Debug for RewriteFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RewriteFn")
    }
}

/// The three things a hook can do to a node.
#[derive(Debug, Clone)]
pub enum Action {
    WriteFile {
        path: String,
        content: Vec<u8>,
        mode: u32,
        description: String,
    },
    /// Read a file, transform it, write it back. With `overwrite_in_place`, the file is truncated
    /// and rewritten through a shell instead of replaced, for files like `/etc/hosts` that the
    /// runtime bind-mounts and refuses to replace.
    RewriteFile {
        path: String,
        rewrite: RewriteFn,
        mode: u32,
        overwrite_in_place: bool,
        description: String,
    },
    Exec {
        command: Vec<String>,
        retries: u32,
        description: String,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::WriteFile { .. } => "WriteFileAction",
            Action::RewriteFile { .. } => "RewriteFileAction",
            Action::Exec { .. } => "ExecAction",
        }
    }

    pub fn info(&self) -> String {
        match self {
            Action::WriteFile {
                path,
                mode,
                description,
                ..
            } => format!("[{}] Writing file to '{path}' (mode {mode:o}): {description}", self.name()),
            Action::RewriteFile {
                path,
                mode,
                description,
                ..
            } => format!("[{}] Rewriting file '{path}' (mode {mode:o}): {description}", self.name()),
            Action::Exec {
                command,
                retries,
                description,
            } => format!(
                "[{}] Executing `{}` (retries: {retries}): {description}",
                self.name(),
                command.join(" ")
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeHook {
    pub stage: HookStage,
    pub action: Action,
}

impl NodeHook {
    pub fn pre_start(action: Action) -> Self {
        NodeHook {
            stage: HookStage::PreStart,
            action,
        }
    }

    pub fn post_start(action: Action) -> Self {
        NodeHook {
            stage: HookStage::PostStart,
            action,
        }
    }
}

/// Carry out `action` against `node`.
pub async fn apply(ctx: &Context, action: &Action, node: &Node) -> Result<()> {
    debug!("Node {}: {}", node.name, action.info());
    let runtime = ctx.runtime();

    match action {
        Action::WriteFile {
            path,
            content,
            mode,
            ..
        } => runtime
            .write_to_node(node, content, path, *mode)
            .await
            .with_context(|| format!("failed to write '{path}' in node '{}'", node.name)),

        Action::RewriteFile {
            path,
            rewrite,
            mode,
            overwrite_in_place,
            ..
        } => {
            let current = runtime
                .read_from_node(node, path)
                .await
                .with_context(|| format!("failed to read '{path}' from node '{}'", node.name))?;
            let new_content = (rewrite.0)(&current);

            if *overwrite_in_place {
                let command = vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("cat > {path}"),
                ];
                runtime
                    .exec_in_node(node, &command, Some(new_content))
                    .await
                    .map(|_| ())
                    .with_context(|| {
                        format!("failed to overwrite '{path}' in node '{}'", node.name)
                    })
            } else {
                runtime
                    .write_to_node(node, &new_content, path, *mode)
                    .await
                    .with_context(|| format!("failed to write '{path}' in node '{}'", node.name))
            }
        }

        Action::Exec {
            command, retries, ..
        } => {
            let mut attempt = 0;
            loop {
                match runtime.exec_in_node(node, command, None).await {
                    Ok(output) => {
                        debug!("Node {}: `{}`: {output}", node.name, command.join(" "));
                        return Ok(());
                    }
                    Err(e) if attempt < *retries => {
                        attempt += 1;
                        warn!(
                            "Node {}: `{}` failed (attempt {attempt}/{}): {e}",
                            node.name,
                            command.join(" "),
                            retries + 1
                        );
                        ctx.sleep(ctx.timeouts.hook_retry).await?;
                    }
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("`{}` failed in node '{}'", command.join(" "), node.name)
                        })
                    }
                }
            }
        }
    }
}

/// Run every hook of `stage`, in registration order.
///
/// PreStart failures are logged and skipped. The first PostStart failure is returned.
pub async fn run_stage(ctx: &Context, node: &Node, hooks: &[NodeHook], stage: HookStage) -> Result<()> {
    for hook in hooks.iter().filter(|h| h.stage == stage) {
        if let Err(e) = apply(ctx, &hook.action, node).await {
            match stage {
                HookStage::PreStart => {
                    warn!(
                        "Failed to execute {stage} hook '{}' on node {}: {e}",
                        hook.action.name(),
                        node.name
                    );
                }
                HookStage::PostStart => {
                    return Err(Error::Hook {
                        stage: stage.to_string(),
                        action: hook.action.name().to_string(),
                        node: node.name.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }
    }
    Ok(())
}
