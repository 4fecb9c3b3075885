//! Run synchronous functions in a pool of reusable worker processes.
//!
//! A host task calls [`run_sync`] with a registered [`RemoteTask`] and its
//! arguments; the call is handed to an idle worker process (spawned fresh,
//! or reused from a cache), and the result comes back asynchronously. Any
//! cancellation of the caller either kills the worker outright
//! (`cancellable = true`) or is deferred until the worker replies
//! (`cancellable = false`, the default) -- there is no in-process graceful
//! interruption of a running task, only OS-level termination.
//!
//! ```no_run
//! use parallel_exec::{remote_task, run_sync, RemoteTask};
//!
//! struct Square;
//!
//! impl RemoteTask for Square {
//!     const NAME: &'static str = "examples::square";
//!     type Args = i64;
//!     type Output = i64;
//!
//!     fn call(n: i64) -> i64 {
//!         n * n
//!     }
//! }
//!
//! remote_task!(Square);
//!
//! fn main() {
//!     // Must run before anything else: turns this process into a worker
//!     // and never returns, if it was re-exec'd as one.
//!     parallel_exec::run_worker_if_invoked();
//!
//!     let rt = tokio::runtime::Runtime::new().unwrap();
//!     rt.block_on(async {
//!         let result = run_sync::<Square>(7, false, None).await.unwrap();
//!         assert_eq!(result, 49);
//!     });
//! }
//! ```
//!
//! See `SPEC_FULL.md` in the crate root for the full design; `DESIGN.md` for
//! where each piece is grounded.

mod cache;
mod channel;
mod codec;
pub mod context;
mod dispatch;
pub mod error;
mod handle;
pub mod registry;
mod worker;

pub use cache::{WorkerCache, DEFAULT_SHUTDOWN_GRACE_PERIOD};
pub use context::{
    cache_scope, current_default_worker_limiter, set_default_idle_timeout, set_default_retire,
    set_default_worker_kind, CacheScopeError, Context, ContextOptions, WorkerType,
};
pub use dispatch::run_sync;
pub use error::{BrokenWorker, ScopeError};
pub use handle::WorkerHandle;
pub use registry::{RemoteTask, RetireStrategy};
pub use worker::run_worker_if_invoked;
