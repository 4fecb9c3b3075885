//! Component F: the dispatcher -- the public `run_sync` entry point.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::context;
use crate::error::BrokenWorker;
use crate::handle::WorkerHandle;
use crate::registry::RemoteTask;

/// Run `args` through one worker process, returning its result.
///
/// `cancellable` controls what happens if the calling future is dropped
/// (cancelled by whatever is racing it -- a `tokio::select!`, a
/// `tokio::time::timeout`, an aborted task) while the worker is busy:
///
/// - `false` (the default): the call is shielded. It keeps running on its
///   own detached task until the worker replies; only then does dropping
///   the caller's future take effect. The worker is never killed by this
///   kind of cancellation.
/// - `true`: dropping the caller's future kills the worker immediately via
///   a synchronous `kill(2)`, and the result this call would have returned
///   is discarded.
///
/// `limiter` overrides the active context's concurrency limiter for this
/// call only; `None` uses [`context::current_default_worker_limiter`].
pub async fn run_sync<T: RemoteTask>(
    args: T::Args,
    cancellable: bool,
    limiter: Option<Arc<Semaphore>>,
) -> Result<T::Output, BrokenWorker>
where
    T::Args: Clone,
{
    let limiter = limiter.unwrap_or_else(context::current_default_worker_limiter);
    let _permit = limiter
        .acquire_owned()
        .await
        .expect("worker limiter semaphore is never closed");

    let ctx = context::current();
    ctx.cache.prune();

    loop {
        // Checkpoint: a cancellation pending before we've touched any
        // worker is observed here and costs nothing.
        tokio::task::yield_now().await;

        let popped = ctx.cache.pop();
        let from_cache = popped.is_some();
        let mut handle = match popped {
            Some(handle) => handle,
            None => {
                WorkerHandle::spawn(ctx.idle_timeout, ctx.retire, ctx.worker_kind)?
            }
        };
        handle.wake().await?;

        let outcome = if cancellable {
            run_cancellable::<T>(&mut handle, args.clone()).await
        } else {
            let (returned_handle, result) = run_shielded::<T>(handle, args.clone()).await;
            handle = returned_handle;
            result
        };

        match outcome {
            Ok(value) => {
                ctx.cache.push(handle);
                return Ok(value);
            }
            Err(BrokenWorker::UserPanic { message }) => {
                // The worker itself is still good -- only the user's task
                // failed -- so it goes back to the cache like any other
                // successful call.
                ctx.cache.push(handle);
                return Err(BrokenWorker::UserPanic { message });
            }
            Err(BrokenWorker::FramingEof) if from_cache => {
                // The handle we popped was stale -- its worker had already
                // exited (idle timeout or external death) since it went
                // into the cache. Never retried for a freshly constructed
                // handle: that would risk running the job twice against
                // two different workers.
                log::debug!("run_sync: stale cached handle, retrying with a fresh worker");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// `cancellable=true` path: run in the caller's own future, armed with a
/// guard that issues a synchronous kill if this future is dropped before
/// the worker replies.
async fn run_cancellable<T: RemoteTask>(
    handle: &mut WorkerHandle,
    args: T::Args,
) -> Result<T::Output, BrokenWorker> {
    let mut guard = KillOnDrop::armed(handle.pid());
    let result = handle.run_sync::<T>(args).await;
    guard.disarm();
    result
}

/// `cancellable=false` path: detach onto its own task so the caller's
/// cancellation can't interrupt it mid-flight; the caller only observes
/// cancellation once this task has already produced a result.
async fn run_shielded<T: RemoteTask>(
    mut handle: WorkerHandle,
    args: T::Args,
) -> (WorkerHandle, Result<T::Output, BrokenWorker>) {
    let join = tokio::spawn(async move {
        let result = handle.run_sync::<T>(args).await;
        (handle, result)
    });
    match join.await {
        Ok(pair) => pair,
        Err(join_err) => {
            // The detached task itself panicked (distinct from the user
            // task panicking, which `run_sync` already reports as
            // `UserPanic` without unwinding this far). There's no handle to
            // hand back in this case.
            unreachable!("detached run_sync task panicked: {join_err}")
        }
    }
}

struct KillOnDrop {
    pid: Option<u32>,
    armed: bool,
}

impl KillOnDrop {
    fn armed(pid: Option<u32>) -> Self {
        KillOnDrop { pid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pid) = self.pid {
            log::warn!("run_sync cancelled, killing worker pid={pid}");
            // Safety: kill(2) on a pid we believe is ours is always safe to
            // call, even if the process has already exited (ESRCH is
            // ignored).
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
    }
}
