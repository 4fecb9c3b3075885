//! Component C: the host-side worker handle.

use std::os::unix::io::AsRawFd;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream as TokioUnixStream;
use tokio::process::{Child, Command};

use crate::channel::AsyncFramed;
use crate::codec;
use crate::context::WorkerType;
use crate::error::BrokenWorker;
use crate::registry::{Outcome, RemoteTask, RetireStrategy};
use crate::worker::{
    WORKER_FD_ENV, WORKER_IDLE_TIMEOUT_MS_ENV, WORKER_MARKER_ENV, WORKER_RETIRE_ENV,
};

/// How long `wake()` waits for the worker's first handshake response before
/// deciding the process is unusable.
const WAKE_TIMEOUT: Duration = Duration::from_secs(30);

enum State {
    /// Spawned but never contacted.
    New { child: Child, channel: AsyncFramed<TokioUnixStream> },
    /// Handshake succeeded at least once; parked awaiting a job.
    Idle { child: Child, channel: AsyncFramed<TokioUnixStream> },
    /// Torn down; any further use is a bug in the caller.
    Dead,
}

/// Owns one worker process's IPC socket and the process handle itself.
///
/// Exposes the four operations the spec gives the handle: [`wake`](Self::wake),
/// [`run_sync`](Self::run_sync), [`kill`](Self::kill), [`wait`](Self::wait).
pub struct WorkerHandle {
    state: State,
    idle_timeout: Duration,
    retire: RetireStrategy,
    worker_kind: WorkerType,
}

impl WorkerHandle {
    /// Spawn a fresh worker process. Does not perform the handshake; call
    /// [`wake`](Self::wake) before the first `run_sync`.
    pub fn spawn(
        idle_timeout: Duration,
        retire: RetireStrategy,
        worker_kind: WorkerType,
    ) -> Result<Self, BrokenWorker> {
        if worker_kind != WorkerType::Spawn {
            // Scope validation should have caught this; defensive only.
            return Err(BrokenWorker::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("worker kind {worker_kind:?} is not implemented"),
            )));
        }

        let (host_end, worker_end) = std::os::unix::net::UnixStream::pair()?;
        host_end.set_nonblocking(true)?;
        let host_end = TokioUnixStream::from_std(host_end)?;

        let exe = std::env::current_exe()?;
        let worker_fd = worker_end.as_raw_fd();
        let mut cmd = Command::new(exe);
        cmd.env(WORKER_MARKER_ENV, "1")
            .env(WORKER_FD_ENV, worker_fd.to_string())
            .env(
                WORKER_IDLE_TIMEOUT_MS_ENV,
                idle_timeout.as_millis().to_string(),
            )
            .env(WORKER_RETIRE_ENV, retire.name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        // Safety: `pre_exec` only clears `FD_CLOEXEC` on the fd we're about
        // to hand to the child; it does nothing async-signal-unsafe.
        unsafe {
            use std::os::unix::process::CommandExt;
            cmd.pre_exec(move || clear_cloexec(worker_fd));
        }

        let child = cmd.spawn()?;
        // The parent's copy of the worker's end is only needed to keep the
        // fd numbered correctly across the fork; once spawned we no longer
        // touch it from the host side.
        drop(worker_end);

        log::info!("spawned worker pid={:?}", child.id());

        Ok(WorkerHandle {
            state: State::New {
                child,
                channel: AsyncFramed::new(host_end),
            },
            idle_timeout,
            retire,
            worker_kind,
        })
    }

    /// Start the process if this is the first call, then perform the
    /// wake/idle handshake (a zero-length ping the worker answers with a
    /// zero-length pong once its main loop is ready to receive work).
    pub async fn wake(&mut self) -> Result<(), BrokenWorker> {
        match std::mem::replace(&mut self.state, State::Dead) {
            State::New { child, mut channel } => {
                let result = tokio::time::timeout(WAKE_TIMEOUT, handshake(&mut channel)).await;
                match result {
                    Ok(Ok(())) => {
                        self.state = State::Idle { child, channel };
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        kill_child(child).await;
                        Err(e)
                    }
                    Err(_) => {
                        kill_child(child).await;
                        Err(BrokenWorker::FramingEof)
                    }
                }
            }
            State::Idle { child, channel } => {
                self.state = State::Idle { child, channel };
                Ok(())
            }
            State::Dead => Err(BrokenWorker::FramingEof),
        }
    }

    /// Send one job and await its result. Preconditions: `wake` has
    /// succeeded. On any failure the worker is killed before the error is
    /// returned.
    pub async fn run_sync<T: RemoteTask>(
        &mut self,
        args: T::Args,
    ) -> Result<T::Output, BrokenWorker> {
        let encoded_args = codec::encode(&args)?;
        let request = codec::encode(&(T::NAME.to_string(), encoded_args))?;

        let channel = match &mut self.state {
            State::Idle { channel, .. } => channel,
            _ => return Err(BrokenWorker::FramingEof),
        };

        let outcome: Result<(), BrokenWorker> = channel.send(&request).await;
        if let Err(e) = outcome {
            self.kill().await;
            return Err(e);
        }

        let response = match channel.recv().await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.kill().await;
                return Err(e);
            }
        };

        match codec::decode::<Outcome>(&response) {
            Ok(Outcome::Ok(bytes)) => match codec::decode::<T::Output>(&bytes) {
                Ok(value) => Ok(value),
                Err(e) => {
                    self.kill().await;
                    Err(e)
                }
            },
            Ok(Outcome::Panicked(panic)) => Err(BrokenWorker::UserPanic {
                message: panic.message,
            }),
            Err(e) => {
                self.kill().await;
                Err(e)
            }
        }
    }

    /// Non-blocking liveness check; reaps the exit status as a side effect.
    pub fn is_alive(&mut self) -> bool {
        let child = match &mut self.state {
            State::New { child, .. } | State::Idle { child, .. } => child,
            State::Dead => return false,
        };
        matches!(child.try_wait(), Ok(None))
    }

    /// Wait for the process to exit and yield its status.
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, BrokenWorker> {
        match std::mem::replace(&mut self.state, State::Dead) {
            State::New { mut child, .. } | State::Idle { mut child, .. } => {
                Ok(child.wait().await?)
            }
            State::Dead => Err(BrokenWorker::FramingEof),
        }
    }

    /// Shut the channel down (releasing any concurrently-waiting peer read)
    /// then kill the process outright.
    pub async fn kill(&mut self) {
        match std::mem::replace(&mut self.state, State::Dead) {
            State::New { child, channel } | State::Idle { child, channel } => {
                let _ = channel.into_inner().shutdown().await;
                kill_child(child).await;
            }
            State::Dead => {}
        }
    }

    /// OS process id, if the process is still known to this handle. Used by
    /// the dispatcher's cancellation guard to issue a raw `kill(2)` without
    /// needing async access to the handle.
    pub fn pid(&self) -> Option<u32> {
        match &self.state {
            State::New { child, .. } | State::Idle { child, .. } => child.id(),
            State::Dead => None,
        }
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub(crate) fn retire(&self) -> RetireStrategy {
        self.retire
    }

    pub(crate) fn worker_kind(&self) -> WorkerType {
        self.worker_kind
    }
}

async fn handshake(channel: &mut AsyncFramed<TokioUnixStream>) -> Result<(), BrokenWorker> {
    channel.send(&[]).await?;
    let pong = channel.recv().await?;
    if !pong.is_empty() {
        return Err(BrokenWorker::FramingEof);
    }
    Ok(())
}

async fn kill_child(mut child: Child) {
    if let Err(e) = child.kill().await {
        log::warn!("failed to kill worker process: {e}");
    }
    let _ = child.wait().await;
}

fn clear_cloexec(fd: i32) -> std::io::Result<()> {
    // Safety: fcntl with F_GETFD/F_SETFD on a valid fd we own is always
    // sound; this is the standard dance for handing a socket to a child
    // across exec without going through the (nightly-only) std API for it.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
