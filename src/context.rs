//! Component E: worker context -- scope-bound configuration bound to a
//! task-local variable, plus the process-global default context used when
//! no scope is active.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::cache::WorkerCache;
use crate::error::{BrokenWorker, ScopeError};
use crate::registry::RetireStrategy;

/// Process-wide default idle timeout if `PARALLEL_EXEC_IDLE_TIMEOUT` isn't
/// set, matching the source's 600 second default.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Spawn strategy for a new worker process.
///
/// Only [`WorkerType::Spawn`] is implemented. `ForkServer` is reserved in
/// the public enum so a future version can add it without breaking
/// callers; selecting it today is a [`ScopeError::UnknownWorkerKind`].
/// Plain `fork()` (copy-on-write, no re-exec) isn't exposed at all -- it's
/// unsound once a multi-threaded `tokio` runtime is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerType {
    Spawn,
    ForkServer,
}

impl Default for WorkerType {
    fn default() -> Self {
        WorkerType::Spawn
    }
}

/// Parameters for a [`cache_scope`] call.
#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    pub idle_timeout: Duration,
    pub retire: RetireStrategy,
    pub worker_kind: WorkerType,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            idle_timeout: default_idle_timeout(),
            retire: RetireStrategy::never(),
            worker_kind: WorkerType::Spawn,
        }
    }
}

fn default_idle_timeout() -> Duration {
    std::env::var("PARALLEL_EXEC_IDLE_TIMEOUT")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_IDLE_TIMEOUT)
}

fn validate(options: &ContextOptions) -> Result<(), ScopeError> {
    // `Duration` can't represent a negative value, so this can't actually
    // fail today; kept for symmetry with a caller that builds one from a
    // signed/float seconds value upstream and to document the invariant.
    if options.idle_timeout < Duration::ZERO {
        return Err(ScopeError::InvalidIdleTimeout);
    }
    match options.worker_kind {
        WorkerType::Spawn => {}
        WorkerType::ForkServer => return Err(ScopeError::UnknownWorkerKind(options.worker_kind)),
    }
    if !options.retire.is_registered() {
        return Err(ScopeError::UnknownRetireStrategy(options.retire.name));
    }
    Ok(())
}

/// Bound configuration plus the cache it owns. One of these is live at any
/// point: either the innermost entered [`cache_scope`], or the process
/// default.
pub struct Context {
    pub idle_timeout: Duration,
    pub retire: RetireStrategy,
    pub worker_kind: WorkerType,
    pub cache: Arc<WorkerCache>,
}

impl Context {
    fn from_options(options: ContextOptions) -> Self {
        Context {
            idle_timeout: options.idle_timeout,
            retire: options.retire,
            worker_kind: options.worker_kind,
            cache: Arc::new(WorkerCache::new()),
        }
    }
}

tokio::task_local! {
    static CONTEXT: Arc<Context>;
}

static DEFAULT_OPTIONS: Lazy<RwLock<ContextOptions>> =
    Lazy::new(|| RwLock::new(ContextOptions::default()));

/// The default context's cache is a single instance for the life of the
/// process, shared across every call that doesn't run inside a
/// `cache_scope` -- unlike the options, its identity never changes, only
/// its contents.
static DEFAULT_CACHE: Lazy<Arc<WorkerCache>> = Lazy::new(|| Arc::new(WorkerCache::new()));

static DEFAULT_LIMITER: Lazy<Arc<Semaphore>> = Lazy::new(|| {
    let n = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    Arc::new(Semaphore::new(n))
});

/// The context currently in effect: the innermost active [`cache_scope`],
/// or the process default. Each call builds a fresh snapshot so that
/// `set_default_*` changes are visible immediately, while the default
/// cache's identity stays fixed across the whole process.
pub fn current() -> Arc<Context> {
    CONTEXT.try_with(|ctx| ctx.clone()).unwrap_or_else(|_| {
        let options = *DEFAULT_OPTIONS.read().unwrap();
        Arc::new(Context {
            idle_timeout: options.idle_timeout,
            retire: options.retire,
            worker_kind: options.worker_kind,
            cache: DEFAULT_CACHE.clone(),
        })
    })
}

/// The process-wide default concurrency limiter, sized to the detected CPU
/// count (falling back to 1).
pub fn current_default_worker_limiter() -> Arc<Semaphore> {
    DEFAULT_LIMITER.clone()
}

pub fn set_default_idle_timeout(idle_timeout: Duration) {
    DEFAULT_OPTIONS.write().unwrap().idle_timeout = idle_timeout;
}

pub fn set_default_retire(retire: RetireStrategy) {
    DEFAULT_OPTIONS.write().unwrap().retire = retire;
}

pub fn set_default_worker_kind(worker_kind: WorkerType) {
    DEFAULT_OPTIONS.write().unwrap().worker_kind = worker_kind;
}

/// Failure opening or closing a [`cache_scope`]: either the options were
/// invalid (nothing touched any worker yet), or teardown failed after the
/// body already ran.
#[derive(Debug, thiserror::Error)]
pub enum CacheScopeError {
    #[error(transparent)]
    Invalid(#[from] ScopeError),
    #[error(transparent)]
    Broken(#[from] BrokenWorker),
}

/// Run `body` with a fresh [`Context`] (and its own empty cache) bound for
/// its duration.
///
/// On exit -- whether `body` returned normally or its future was dropped by
/// a panic unwind -- the scope's cache is cleared, terminating every
/// worker it created. If `clear()` fails after `body` already produced a
/// value, that value is lost and [`CacheScopeError::Broken`] is returned
/// instead; this matches the source's `finally`-overrides-return semantics
/// and is a known, documented fidelity tradeoff (see `SPEC_FULL.md` §11).
pub async fn cache_scope<F, Fut, T>(
    options: ContextOptions,
    body: F,
) -> Result<T, CacheScopeError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    validate(&options)?;
    let ctx = Arc::new(Context::from_options(options));
    let ctx_for_clear = ctx.clone();

    let result = CONTEXT.scope(ctx, body()).await;

    ctx_for_clear.cache.clear().await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_kind_is_spawn() {
        assert_eq!(ContextOptions::default().worker_kind, WorkerType::Spawn);
    }

    #[test]
    fn never_retire_strategy_is_registered() {
        assert!(RetireStrategy::never().is_registered());
    }
}
