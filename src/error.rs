//! Error types for the worker pool.
//!
//! Split the same way the spec splits failure modes: [`BrokenWorker`] covers
//! everything that can go wrong once a worker process exists, [`ScopeError`]
//! covers the synchronous validation that happens before any process is
//! touched.

use thiserror::Error;

/// Something went wrong with a worker process or its IPC channel.
///
/// Every variant except [`BrokenWorker::UserPanic`] means the handle that
/// produced it is dead and must not be returned to the cache.
#[derive(Debug, Error)]
pub enum BrokenWorker {
    /// The channel returned EOF in the middle of a frame, or before a frame
    /// started where one was expected. The worker is gone.
    #[error("worker channel closed unexpectedly (framing EOF)")]
    FramingEof,

    /// A lower-level I/O failure on the duplex socket or during process
    /// spawn.
    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The wire payload didn't decode. Treated as corruption; should not
    /// happen for well-formed peers.
    #[error("worker codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// The user's task panicked inside the worker. The worker caught it,
    /// reported it, and is still usable.
    #[error("task panicked: {message}")]
    UserPanic {
        /// The panic payload, formatted as text, plus location if available.
        message: String,
    },

    /// The registered retire strategy itself panicked inside the worker.
    /// Per the source this is deliberately vague about *which* in-flight
    /// call observes it.
    #[error("retire strategy panicked inside worker")]
    RetireFailed,

    /// The task named in a request isn't registered in this binary's
    /// `RemoteTask` registry. Can only happen if host and worker were built
    /// from different binaries, which this crate otherwise prevents by
    /// re-exec'ing the host's own executable.
    #[error("no remote task registered under name {0:?}")]
    UnknownTask(&'static str),

    /// `clear()` on the cache failed to get one or more cached workers to
    /// exit within the shutdown grace period.
    #[error("{0} worker(s) failed to exit cleanly during cache clear")]
    ClearFailed(usize),
}

/// Invalid arguments to [`crate::context::cache_scope`], raised before any
/// worker work happens.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// `idle_timeout` didn't survive construction as a `Duration` (e.g. a
    /// caller building one from a negative float before conversion).
    #[error("idle_timeout must be non-negative")]
    InvalidIdleTimeout,

    /// `worker_kind` named something this build doesn't implement.
    #[error("worker kind {0:?} is not implemented")]
    UnknownWorkerKind(crate::context::WorkerType),

    /// `retire` named a strategy that was never registered with
    /// [`register_retire!`](crate::register_retire).
    #[error("no retire strategy registered under name {0:?}")]
    UnknownRetireStrategy(&'static str),
}
