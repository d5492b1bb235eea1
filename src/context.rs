// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use {
    tokio::{sync::Mutex, task::JoinSet},
    tokio_util::sync::CancellationToken,
};

use crate::{
    error::{Error, Result},
    runtime::Runtime,
};

/// Durations used by the orchestration core. Tests shrink these.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// How long to wait for the load balancer to confirm (or reject) a new configuration.
    pub lb_verify: Duration,
    /// Pause after a successful load balancer update, so that a closely following update does
    /// not match the log lines of this one.
    pub lb_debounce: Duration,
    /// Pause before re-opening the log stream of a crashed node.
    pub log_backoff: Duration,
    /// A node stuck in "restarting" for longer than this gets a warning.
    pub restart_warn: Duration,
    pub status_poll: Duration,
    /// Pause between attempts of a retried exec hook.
    pub hook_retry: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            lb_verify: Duration::from_secs(5),
            lb_debounce: Duration::from_secs(1),
            log_backoff: Duration::from_secs(1),
            restart_warn: Duration::from_secs(10),
            status_poll: Duration::from_secs(1),
            hook_retry: Duration::from_secs(1),
        }
    }
}

/// An object passed to every operation, holding the state those operations share: the runtime
/// handle, the lock serializing tools-node creation, and the cancellation token of the
/// current command.
#[derive(Debug, Clone)]
pub struct Context {
    runtime: Arc<dyn Runtime>,
    /// Only one tools node may be in the works at a time, so that concurrent callers don't each
    /// pull the (large) tools image.
    pub tools_lock: Arc<Mutex<()>>,
    pub timeouts: Timeouts,
    /// Number of log stream attempts a readiness wait makes before giving up on a crashing node.
    pub backoff_limit: u32,
    /// Where generated per-node files (fake meminfo) are kept on the host.
    pub state_dir: PathBuf,
    cancel: CancellationToken,
}

impl Context {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Context {
            runtime,
            tools_lock: Arc::new(Mutex::new(())),
            timeouts: Timeouts::default(),
            backoff_limit: crate::default_backoff_limit(),
            state_dir: crate::default_state_dir(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = dir;
        self
    }

    pub fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    pub fn runtime_handle(&self) -> Arc<dyn Runtime> {
        Arc::clone(&self.runtime)
    }

    /// Cancel every operation running under this context (and its children).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A context that is cancelled with this one, but can also be cancelled on its own. Used
    /// to abort the siblings of a failed member of a fan-out group.
    pub fn child(&self) -> Self {
        let mut child = self.clone();
        child.cancel = self.cancel.child_token();
        child
    }

    /// Run `fut` until it completes or this context is cancelled.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        }
    }

    /// Like `run`, but also fail with `DeadlineExceeded` once `timeout` elapsed.
    pub async fn run_with_timeout<T, F>(&self, timeout: Option<Duration>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.run(fut)).await {
                Ok(res) => res,
                Err(_) => Err(Error::DeadlineExceeded),
            },
            None => self.run(fut).await,
        }
    }

    /// Sleep for `duration`, unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

/// Run `f` on every item as its own task and collect the results in item order.
///
/// The first member to fail cancels the remaining ones, and only its error is returned. The
/// errors of cancelled siblings would only ever be `Cancelled`, so they are not collected.
pub async fn fan_out<T, R, F, Fut>(ctx: &Context, items: Vec<T>, f: F) -> Result<Vec<R>>
where
    F: Fn(Context, T) -> Fut,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Send + 'static,
{
    let group = ctx.child();
    let mut members = JoinSet::new();
    let mut results: Vec<Option<R>> = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        results.push(None);
        let member = group.clone();
        let fut = f(member.clone(), item);
        members.spawn(async move { (index, member.run(fut).await) });
    }

    while let Some(joined) = members.join_next().await {
        match joined {
            Ok((index, Ok(res))) => results[index] = Some(res),
            Ok((_, Err(e))) => {
                group.cancel();
                members.abort_all();
                return Err(e);
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => return Err(Error::Cancelled),
        }
    }

    Ok(results.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::FakeRuntime;

    #[test]
    fn first_error_cancels_siblings() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = Context::new(Arc::new(FakeRuntime::new()));

            let res = fan_out(&ctx, vec![1u64, 2, 3], |member, i| async move {
                if i == 2 {
                    return Err(Error::InvalidConfig("two".to_string()));
                }
                member.sleep(Duration::from_secs(60)).await?;
                Ok(i)
            })
            .await;

            assert!(matches!(res, Err(Error::InvalidConfig(_))));
            assert!(!ctx.is_cancelled());

            let res = fan_out(&ctx, vec![3u64, 1, 2], |_, i| async move { Ok::<_, Error>(i * 10) }).await;
            assert_eq!(res.unwrap(), vec![30, 10, 20]);
        });
    }
}
