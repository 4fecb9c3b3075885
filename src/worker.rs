//! Component B: the worker process itself.
//!
//! A worker is not a distinct binary -- it's the host's own executable,
//! re-exec'd with an environment marker set. [`run_worker_if_invoked`] must
//! be the first thing an embedding `main` calls; if the marker is present it
//! never returns.

use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::channel::{BlockingFramed, PollOutcome};
use crate::registry::{self, CapturedPanic, Outcome};

/// Environment variable the parent sets (to `"1"`) on the child's command
/// line before spawning it. Its presence is what turns an ordinary run of
/// the host binary into a worker.
pub const WORKER_MARKER_ENV: &str = "PARALLEL_EXEC_WORKER";

/// File descriptor number the child's duplex socket is passed on. Chosen to
/// sit above stdio so the worker's own stdout/stderr stay free for normal
/// logging.
pub const WORKER_FD_ENV: &str = "PARALLEL_EXEC_WORKER_FD";

/// Idle timeout, in milliseconds, passed down to the worker since it has no
/// other way to learn the context's configured value.
pub const WORKER_IDLE_TIMEOUT_MS_ENV: &str = "PARALLEL_EXEC_WORKER_IDLE_TIMEOUT_MS";

/// Name of the registered [`crate::registry::RetireStrategy`] the worker
/// should poll between jobs.
pub const WORKER_RETIRE_ENV: &str = "PARALLEL_EXEC_WORKER_RETIRE";

/// If this process was spawned as a worker, run the worker loop and exit;
/// otherwise return immediately so the caller's `main` continues as normal.
///
/// Call this before doing anything else in `main` -- certainly before
/// setting up any GUI, network listener, or other state the worker has no
/// business initializing.
pub fn run_worker_if_invoked() {
    if std::env::var(WORKER_MARKER_ENV).as_deref() != Ok("1") {
        return;
    }
    let fd: i32 = std::env::var(WORKER_FD_ENV)
        .expect("worker spawned without a duplex fd")
        .parse()
        .expect("worker fd env var was not an integer");
    let idle_timeout = Duration::from_millis(
        std::env::var(WORKER_IDLE_TIMEOUT_MS_ENV)
            .expect("worker spawned without an idle timeout")
            .parse()
            .expect("worker idle timeout env var was not an integer"),
    );
    let retire_name = std::env::var(WORKER_RETIRE_ENV).unwrap_or_else(|_| "__never".to_string());

    ignore_interrupt_signal();

    // Safety: `fd` was handed to us by our own parent, via `UnixStream::pair`
    // plus `set_non_blocking(false)` on its side before spawn; it is ours
    // alone from here on and nothing else in this process touches it.
    let stream = unsafe { UnixStream::from_raw_fd(fd) };
    main_loop(stream, idle_timeout, &retire_name);
    std::process::exit(0);
}

fn main_loop(stream: UnixStream, idle_timeout: Duration, retire_name: &str) {
    let retire = registry::lookup_retire(retire_name).unwrap_or_else(|| {
        log::warn!(
            "worker: unknown retire strategy {retire_name:?}, falling back to never-retire"
        );
        registry::lookup_retire("__never").expect("built-in never-retire strategy missing")
    });

    let mut channel = BlockingFramed::new(stream);
    log::info!("worker ready, idle_timeout={idle_timeout:?}");

    loop {
        if retire() {
            log::info!("worker retiring by strategy vote");
            return;
        }

        let message = match channel.poll(idle_timeout) {
            Ok(PollOutcome::Idle) => {
                log::info!("worker idle-timed-out, exiting");
                return;
            }
            Ok(PollOutcome::Message(bytes)) => bytes,
            Err(_) => {
                // Peer is gone; nothing useful to send back. Exit quietly,
                // matching "the barrier break is how host-side kills are
                // mediated" -- the host already knows it killed us.
                log::info!("worker channel closed, exiting");
                return;
            }
        };

        // A zero-length message is the wake/idle handshake ping, not a job
        // -- a real job envelope always carries at least the task name's
        // length prefix and is never empty. Answer with a zero-length pong
        // and go straight back to polling.
        if message.is_empty() {
            if let Err(e) = channel.send(&[]) {
                log::error!("worker: failed to answer handshake: {e}");
                return;
            }
            continue;
        }

        let (task_name, args): (String, Vec<u8>) = match crate::codec::decode(&message) {
            Ok(v) => v,
            Err(e) => {
                log::error!("worker: malformed job envelope: {e}");
                return;
            }
        };

        let outcome = match registry::lookup_task(&task_name) {
            Some(entry) => match entry.invoke(&args) {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("worker: failed to decode args for {task_name:?}: {e}");
                    return;
                }
            },
            None => {
                log::error!("worker: no task registered under {task_name:?}");
                Outcome::Panicked(registry_miss_panic(&task_name))
            }
        };

        let response = match crate::codec::encode(&outcome) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("worker: failed to encode result: {e}");
                return;
            }
        };

        if let Err(e) = channel.send(&response) {
            log::error!("worker: failed to send result: {e}");
            return;
        }

        // `message`, `task_name`, `args`, `outcome`, `response` all drop
        // here, before the next `poll()`, so a large job doesn't keep its
        // buffers alive across iterations.
    }
}

fn registry_miss_panic(task_name: &str) -> CapturedPanic {
    CapturedPanic {
        message: format!("no remote task registered under name {task_name:?}"),
    }
}

#[cfg(unix)]
fn ignore_interrupt_signal() {
    // Safety: SIG_IGN is a valid, always-safe signal disposition; this is
    // the standard "don't let Ctrl-C race the framing protocol" dance.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_interrupt_signal() {}
